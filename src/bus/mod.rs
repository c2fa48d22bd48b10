//! Button event fan-out
//!
//! Device sessions publish normalized button edges here; every live
//! subscriber sink (usually an open `/events` WebSocket) receives one text
//! message per edge. The sink set has its own lock, independent of any device
//! state, and is never held while delivering.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::device::{DeviceClass, SoftButton};
use crate::hardware::DeviceHandle;

/// A button edge as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ButtonEvent {
    pub device: DeviceHandle,
    pub class: DeviceClass,
    pub button: SoftButton,
    pub pressed: bool,
    /// Page shown when the edge happened.
    pub page: Option<u32>,
}

impl ButtonEvent {
    /// Wire form: `"<button> <1|0> <page>"`, page omitted when none is active.
    pub fn to_message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ButtonEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.button, u8::from(self.pressed))?;
        if let Some(page) = self.page {
            write!(f, " {}", page)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink buffer full")]
    Full,
    #[error("sink closed")]
    Closed,
}

/// Outbound channel for event messages.
pub trait EventSink: Send + Sync {
    fn deliver(&self, message: &str) -> Result<(), SinkError>;
}

/// Sink backed by a bounded tokio channel; the receiving half is drained by
/// the connection task.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, message: &str) -> Result<(), SinkError> {
        self.tx.try_send(message.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

#[derive(Default)]
pub struct EventFanOut {
    sinks: Mutex<HashMap<SinkId, Arc<dyn EventSink>>>,
    next_id: AtomicU64,
}

impl EventFanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sink);
        debug!(sink = %id, "subscriber added");
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SinkId) -> bool {
        let removed = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(sink = %id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every current sink and return how many accepted it.
    ///
    /// A failing sink is logged and skipped; it stays subscribed until its
    /// connection unsubscribes on close.
    pub fn broadcast(&self, event: &ButtonEvent) -> usize {
        let message = event.to_message();
        let sinks: Vec<(SinkId, Arc<dyn EventSink>)> = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let mut delivered = 0;
        for (id, sink) in sinks {
            match sink.deliver(&message) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(sink = %id, "failed to deliver {:?}: {}", message, e),
            }
        }
        delivered
    }
}

/// Shared fan-out wrapped in Arc for thread-safe sharing
pub type SharedFanOut = Arc<EventFanOut>;

pub fn create_fanout() -> SharedFanOut {
    Arc::new(EventFanOut::new())
}
