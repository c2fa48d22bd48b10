//! Typed boundary to the DirectOutput SDK
//!
//! The vendor SDK hands out raw device pointers and reports everything through
//! `void*`-parameter callbacks. Here it is reduced to a narrow capability trait:
//! devices are opaque [`DeviceHandle`]s and callbacks are typed closures. The
//! shim implementing [`DirectOutput`] owns all handle casting.

pub mod sim;

use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

use crate::device::Line;
use crate::error::HardwareError;

pub use sim::SimulatedDirectOutput;

pub type HwResult<T> = std::result::Result<T, HardwareError>;

/// Opaque identity of one connected device, supplied by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for DeviceHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Device type identifier as reported by `GetDeviceType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub u128);

impl Guid {
    /// Saitek X52 Pro flight controller MFD.
    pub const X52_PRO: Guid = Guid(0x29DAD506_F93B_4F20_85FA_1E02C04FAC17);
    /// Saitek Pro Flight Instrument Panel.
    pub const FIP: Guid = Guid(0x3E083CD8_6A37_4A58_80A8_3D6A2C07513E);
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:04X}-{:012X}}}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

/// Device arrival (`true`) or removal (`false`).
pub type DeviceChangeCallback = Arc<dyn Fn(DeviceHandle, bool) + Send + Sync>;

/// Page activation (`true`) or deactivation (`false`) on one device.
pub type PageCallback = Arc<dyn Fn(u32, bool) + Send + Sync>;

/// Bitmask of the soft buttons currently held down on one device.
pub type SoftButtonCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Narrow capability over the vendor SDK.
///
/// Every call blocks until the SDK answers. Implementations must not invoke
/// a registered callback from inside one of these methods; callbacks arrive
/// on adapter-owned threads.
pub trait DirectOutput: Send + Sync {
    /// Devices connected right now.
    fn enumerate(&self) -> HwResult<Vec<DeviceHandle>>;

    fn register_device_callback(&self, callback: DeviceChangeCallback) -> HwResult<()>;

    fn unregister_device_callback(&self) -> HwResult<()>;

    fn device_type(&self, device: DeviceHandle) -> HwResult<Guid>;

    fn register_page_callback(&self, device: DeviceHandle, callback: PageCallback) -> HwResult<()>;

    fn unregister_page_callback(&self, device: DeviceHandle) -> HwResult<()>;

    fn register_soft_button_callback(
        &self,
        device: DeviceHandle,
        callback: SoftButtonCallback,
    ) -> HwResult<()>;

    fn unregister_soft_button_callback(&self, device: DeviceHandle) -> HwResult<()>;

    /// Register a page. `activate` makes it the shown page immediately.
    fn add_page(&self, device: DeviceHandle, page: u32, name: &str, activate: bool)
        -> HwResult<()>;

    fn remove_page(&self, device: DeviceHandle, page: u32) -> HwResult<()>;

    /// Write one line of text on a page.
    fn set_string(&self, device: DeviceHandle, page: u32, line: Line, text: &str) -> HwResult<()>;

    /// Release the SDK. No further calls are valid afterwards.
    fn deinitialize(&self) -> HwResult<()>;
}

pub type SharedHardware = Arc<dyn DirectOutput>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_formats_like_the_sdk_header() {
        assert_eq!(
            Guid::X52_PRO.to_string(),
            "{29DAD506-F93B-4F20-85FA-1E02C04FAC17}"
        );
        assert_eq!(Guid::FIP.to_string(), "{3E083CD8-6A37-4A58-80A8-3D6A2C07513E}");
    }

    #[test]
    fn handle_displays_as_hex() {
        assert_eq!(DeviceHandle::new(0x2a).to_string(), "0x2a");
    }
}
