//! DeviceRegistry - single owner of all live device sessions
//!
//! Sessions are created exactly when the adapter reports a device arrival and
//! dropped exactly when it reports the removal. The registry lock covers
//! structural changes (insert/erase, including session init) only; callers get
//! `Arc<DeviceSession>` clones and operate on them without holding it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

use crate::bus::SharedFanOut;
use crate::device::{DeviceClass, DeviceInfo, DeviceSession, PageData};
use crate::error::{Error, Result};
use crate::hardware::{DeviceChangeCallback, DeviceHandle, SharedHardware};

/// Called with a session right after it was registered, or right before it is
/// dropped.
pub type DeviceHook = Box<dyn Fn(&DeviceSession) + Send + Sync>;

pub struct DeviceRegistry {
    hardware: SharedHardware,
    fanout: SharedFanOut,
    default_pages: BTreeMap<u32, PageData>,
    devices: Mutex<BTreeMap<DeviceHandle, Arc<DeviceSession>>>,
    on_arrived: Option<DeviceHook>,
    on_removed: Option<DeviceHook>,
}

impl DeviceRegistry {
    pub fn new(hardware: SharedHardware, fanout: SharedFanOut) -> Self {
        Self {
            hardware,
            fanout,
            default_pages: BTreeMap::new(),
            devices: Mutex::new(BTreeMap::new()),
            on_arrived: None,
            on_removed: None,
        }
    }

    /// Pages every new session registers during init.
    pub fn with_default_pages(mut self, pages: BTreeMap<u32, PageData>) -> Self {
        self.default_pages = pages;
        self
    }

    /// Hook for pre-provisioning pages on a newly arrived device.
    pub fn with_arrival_hook(
        mut self,
        hook: impl Fn(&DeviceSession) + Send + Sync + 'static,
    ) -> Self {
        self.on_arrived = Some(Box::new(hook));
        self
    }

    pub fn with_removal_hook(
        mut self,
        hook: impl Fn(&DeviceSession) + Send + Sync + 'static,
    ) -> Self {
        self.on_removed = Some(Box::new(hook));
        self
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<DeviceHandle, Arc<DeviceSession>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick up already connected devices and listen for hot-plug events.
    ///
    /// A device that fails to initialize is logged and skipped; enumeration
    /// and callback registration failures are returned.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let handles = self.hardware.enumerate().map_err(|source| {
            error!(operation = "Enumerate", "hardware call failed: {}", source);
            Error::hardware("Enumerate", source)
        })?;
        info!("Enumerated {} device(s)", handles.len());
        for handle in handles {
            let _ = self.on_device_arrived(handle);
        }

        let registry = Arc::downgrade(self);
        let callback: DeviceChangeCallback = Arc::new(move |handle, added| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            info!(device = %handle, "device {}", if added { "added" } else { "removed" });
            if added {
                let _ = registry.on_device_arrived(handle);
            } else {
                registry.on_device_removed(handle);
            }
        });
        self.hardware
            .register_device_callback(callback)
            .map_err(|source| {
                error!(operation = "RegisterDeviceCallback", "hardware call failed: {}", source);
                Error::hardware("RegisterDeviceCallback", source)
            })
    }

    /// Stop listening for hot-plug events and unbind every session's callbacks.
    pub fn stop(&self) -> Result<()> {
        let result = self.hardware.unregister_device_callback().map_err(|source| {
            warn!(operation = "UnregisterDeviceCallback", "hardware call failed: {}", source);
            Error::hardware("UnregisterDeviceCallback", source)
        });
        self.for_each(|session| {
            if let Err(e) = session.detach_callbacks() {
                warn!(device = %session.handle(), "failed to detach callbacks: {}", e);
            }
        });
        result
    }

    /// Create, initialize and register the session for a new device, then
    /// run the arrival hook.
    pub fn on_device_arrived(&self, handle: DeviceHandle) -> Result<Arc<DeviceSession>> {
        let session = {
            let mut devices = self.lock();
            if devices.contains_key(&handle) {
                error!(device = %handle, "duplicate arrival for a registered device");
                return Err(Error::DuplicateDevice(handle));
            }

            let session = DeviceSession::init(
                handle,
                Arc::clone(&self.hardware),
                Arc::clone(&self.fanout),
                &self.default_pages,
            )
            .map_err(|e| {
                error!(device = %handle, "device init failed, not tracking it: {}", e);
                e
            })?;
            let session = Arc::new(session);
            devices.insert(handle, Arc::clone(&session));
            session
        };

        info!(device = %handle, class = %session.class(), "device registered");
        if let Some(hook) = &self.on_arrived {
            hook(&session);
        }
        Ok(session)
    }

    /// Run the removal hook and drop the session. Returns false for unknown
    /// handles.
    pub fn on_device_removed(&self, handle: DeviceHandle) -> bool {
        let Some(session) = self.get(handle) else {
            return false;
        };
        if let Some(hook) = &self.on_removed {
            hook(&session);
        }
        self.lock().remove(&handle);
        info!(device = %handle, "device unregistered");
        true
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<Arc<DeviceSession>> {
        self.lock().get(&handle).cloned()
    }

    /// First device of the given class (lowest handle when there are several).
    pub fn get_by_class(&self, class: DeviceClass) -> Option<Arc<DeviceSession>> {
        self.lock()
            .values()
            .find(|session| session.class() == class)
            .cloned()
    }

    /// Run `f` on the device of `class`, or fail with `DeviceNotFound`.
    pub fn with_class<T>(
        &self,
        class: DeviceClass,
        f: impl FnOnce(&DeviceSession) -> Result<T>,
    ) -> Result<T> {
        let session = self
            .get_by_class(class)
            .ok_or(Error::DeviceNotFound(class))?;
        f(&session)
    }

    /// Visit every live session. The visitor runs on a snapshot, so it may
    /// call back into the registry.
    pub fn for_each(&self, mut visitor: impl FnMut(&DeviceSession)) {
        let sessions: Vec<Arc<DeviceSession>> = self.lock().values().cloned().collect();
        for session in &sessions {
            visitor(session);
        }
    }

    pub fn device_infos(&self) -> Vec<DeviceInfo> {
        let mut infos = Vec::new();
        self.for_each(|session| infos.push(session.info()));
        infos
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub type SharedRegistry = Arc<DeviceRegistry>;
