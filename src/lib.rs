//! DirectOutput Proxy
//!
//! Multiplexes the callback-based DirectOutput SDK (Saitek X52 Pro and Flight
//! Instrument Panel displays with soft buttons) into a registry of connected
//! devices with independently managed pages, and republishes button presses
//! to any number of subscribers.
//!
//! This library provides:
//! - A typed adapter boundary over the SDK, plus an in-process simulator
//! - Per-device page/line state kept in sync with the hardware
//! - Button edge detection and event fan-out
//! - An HTTP control surface with a WebSocket event stream

pub mod api;
pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod registry;
