//! Simulated DirectOutput SDK
//!
//! Keeps virtual devices, their registered pages and rendered lines in
//! memory. Callbacks are queued to a dispatcher thread, the way the vendor
//! SDK delivers them on its own threads. Used as the default backend and by
//! the tests, which can inject failures and inspect what was rendered.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, warn};

use super::{
    DeviceChangeCallback, DeviceHandle, DirectOutput, Guid, HwResult, PageCallback,
    SoftButtonCallback,
};
use crate::device::Line;
use crate::error::HardwareError;

/// Adapter calls that can be made to fail with [`SimulatedDirectOutput::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Enumerate,
    RegisterDeviceCallback,
    DeviceType,
    RegisterPageCallback,
    RegisterSoftButtonCallback,
    AddPage,
    RemovePage,
    SetString,
}

#[derive(Debug, Default)]
struct SimPage {
    lines: [String; 3],
}

struct SimDevice {
    guid: Guid,
    pages: BTreeMap<u32, SimPage>,
    active_page: Option<u32>,
    page_callback: Option<PageCallback>,
    button_callback: Option<SoftButtonCallback>,
    renders: usize,
}

impl SimDevice {
    fn new(guid: Guid) -> Self {
        Self {
            guid,
            pages: BTreeMap::new(),
            active_page: None,
            page_callback: None,
            button_callback: None,
            renders: 0,
        }
    }
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    devices: BTreeMap<DeviceHandle, SimDevice>,
    device_callback: Option<DeviceChangeCallback>,
    failures: HashMap<SimOp, PendingFailure>,
}

/// Raw SDK outcome to report once `skip` more calls went through.
#[derive(Debug, Clone, Copy)]
struct PendingFailure {
    skip: usize,
    code: u32,
}

impl SimState {
    /// Outcome of the next `op` call, resolved from the raw code like the
    /// SDK shim would.
    fn take_failure(&mut self, op: SimOp) -> HwResult<()> {
        let Some(pending) = self.failures.get_mut(&op) else {
            return Ok(());
        };
        if pending.skip > 0 {
            pending.skip -= 1;
            return Ok(());
        }
        let code = pending.code;
        self.failures.remove(&op);
        match HardwareError::from_code(code) {
            Some(err) => {
                debug!(?op, "injected failure {:#010x}: {}", code, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn device(&mut self, handle: DeviceHandle) -> HwResult<&mut SimDevice> {
        self.devices
            .get_mut(&handle)
            .ok_or(HardwareError::InvalidHandle)
    }
}

enum Dispatch {
    Call(Box<dyn FnOnce() + Send>),
    Flush(mpsc::Sender<()>),
}

pub struct SimulatedDirectOutput {
    state: Mutex<SimState>,
    dispatch: mpsc::Sender<Dispatch>,
}

impl Default for SimulatedDirectOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDirectOutput {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Dispatch>();
        thread::Builder::new()
            .name("directoutput-sim".into())
            .spawn(move || {
                for job in rx {
                    match job {
                        Dispatch::Call(callback) => callback(),
                        Dispatch::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|e| warn!("failed to spawn simulator dispatcher: {}", e))
            .ok();

        Self {
            state: Mutex::new(SimState {
                next_handle: 1,
                ..Default::default()
            }),
            dispatch: tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, callback: impl FnOnce() + Send + 'static) {
        if self.dispatch.send(Dispatch::Call(Box::new(callback))).is_err() {
            warn!("simulator dispatcher is gone, dropping callback");
        }
    }

    /// Block until every callback queued so far has run.
    ///
    /// Must not be called from inside a callback.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.dispatch.send(Dispatch::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: SimOp, err: HardwareError) {
        self.fail_next_after(op, 0, err);
    }

    /// Let `skip` calls of `op` succeed, then fail the one after with `err`.
    pub fn fail_next_after(&self, op: SimOp, skip: usize, err: HardwareError) {
        self.lock().failures.insert(
            op,
            PendingFailure {
                skip,
                code: err.code(),
            },
        );
    }

    /// Plug in a device; reported to the device callback if one is registered.
    pub fn attach(&self, guid: Guid) -> DeviceHandle {
        let mut state = self.lock();
        let handle = DeviceHandle::new(state.next_handle);
        state.next_handle += 1;
        state.devices.insert(handle, SimDevice::new(guid));
        if let Some(callback) = state.device_callback.clone() {
            self.post(move || callback(handle, true));
        }
        debug!(device = %handle, %guid, "simulated device attached");
        handle
    }

    /// Unplug a device. Returns false if it was not attached.
    pub fn detach(&self, handle: DeviceHandle) -> bool {
        let mut state = self.lock();
        if state.devices.remove(&handle).is_none() {
            return false;
        }
        if let Some(callback) = state.device_callback.clone() {
            self.post(move || callback(handle, false));
        }
        debug!(device = %handle, "simulated device detached");
        true
    }

    /// Report the given set of held soft buttons.
    pub fn press_buttons(&self, handle: DeviceHandle, buttons: u32) -> HwResult<()> {
        let mut state = self.lock();
        let device = state.device(handle)?;
        if let Some(callback) = device.button_callback.clone() {
            self.post(move || callback(buttons));
        }
        Ok(())
    }

    /// Turn the device to `page`, as a user scrolling through pages would.
    pub fn select_page(&self, handle: DeviceHandle, page: u32) -> HwResult<()> {
        let mut state = self.lock();
        let device = state.device(handle)?;
        if !device.pages.contains_key(&page) {
            return Err(HardwareError::InvalidArgument);
        }
        let previous = device.active_page.replace(page);
        if let Some(callback) = device.page_callback.clone() {
            match previous {
                Some(previous) if previous != page => {
                    self.post(move || {
                        callback(previous, false);
                        callback(page, true);
                    });
                }
                Some(_) => {}
                None => self.post(move || callback(page, true)),
            }
        }
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    /// Pages registered on a device, ascending.
    pub fn registered_pages(&self, handle: DeviceHandle) -> Vec<u32> {
        self.lock()
            .devices
            .get(&handle)
            .map(|d| d.pages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Lines currently rendered on a page (top, middle, bottom).
    pub fn page_lines(&self, handle: DeviceHandle, page: u32) -> Option<[String; 3]> {
        let state = self.lock();
        let device = state.devices.get(&handle)?;
        device.pages.get(&page).map(|p| p.lines.clone())
    }

    pub fn active_page(&self, handle: DeviceHandle) -> Option<u32> {
        self.lock().devices.get(&handle).and_then(|d| d.active_page)
    }

    /// Number of successful `set_string` calls on a device.
    pub fn render_count(&self, handle: DeviceHandle) -> usize {
        self.lock().devices.get(&handle).map_or(0, |d| d.renders)
    }

    pub fn has_page_callback(&self, handle: DeviceHandle) -> bool {
        self.lock()
            .devices
            .get(&handle)
            .is_some_and(|d| d.page_callback.is_some())
    }

    pub fn has_button_callback(&self, handle: DeviceHandle) -> bool {
        self.lock()
            .devices
            .get(&handle)
            .is_some_and(|d| d.button_callback.is_some())
    }

    pub fn has_device_callback(&self) -> bool {
        self.lock().device_callback.is_some()
    }
}

impl DirectOutput for SimulatedDirectOutput {
    fn enumerate(&self) -> HwResult<Vec<DeviceHandle>> {
        let mut state = self.lock();
        state.take_failure(SimOp::Enumerate)?;
        Ok(state.devices.keys().copied().collect())
    }

    fn register_device_callback(&self, callback: DeviceChangeCallback) -> HwResult<()> {
        let mut state = self.lock();
        state.take_failure(SimOp::RegisterDeviceCallback)?;
        state.device_callback = Some(callback);
        Ok(())
    }

    fn unregister_device_callback(&self) -> HwResult<()> {
        self.lock().device_callback = None;
        Ok(())
    }

    fn device_type(&self, device: DeviceHandle) -> HwResult<Guid> {
        let mut state = self.lock();
        state.take_failure(SimOp::DeviceType)?;
        Ok(state.device(device)?.guid)
    }

    fn register_page_callback(&self, device: DeviceHandle, callback: PageCallback) -> HwResult<()> {
        let mut state = self.lock();
        state.take_failure(SimOp::RegisterPageCallback)?;
        state.device(device)?.page_callback = Some(callback);
        Ok(())
    }

    fn unregister_page_callback(&self, device: DeviceHandle) -> HwResult<()> {
        self.lock().device(device)?.page_callback = None;
        Ok(())
    }

    fn register_soft_button_callback(
        &self,
        device: DeviceHandle,
        callback: SoftButtonCallback,
    ) -> HwResult<()> {
        let mut state = self.lock();
        state.take_failure(SimOp::RegisterSoftButtonCallback)?;
        state.device(device)?.button_callback = Some(callback);
        Ok(())
    }

    fn unregister_soft_button_callback(&self, device: DeviceHandle) -> HwResult<()> {
        self.lock().device(device)?.button_callback = None;
        Ok(())
    }

    fn add_page(
        &self,
        device: DeviceHandle,
        page: u32,
        name: &str,
        activate: bool,
    ) -> HwResult<()> {
        let mut state = self.lock();
        state.take_failure(SimOp::AddPage)?;
        let sim_device = state.device(device)?;
        if sim_device.pages.contains_key(&page) {
            return Err(HardwareError::InvalidArgument);
        }
        sim_device.pages.insert(page, SimPage::default());
        if activate {
            sim_device.active_page = Some(page);
        }
        debug!(%device, page, page_name = name, activate, "simulated page added");
        Ok(())
    }

    fn remove_page(&self, device: DeviceHandle, page: u32) -> HwResult<()> {
        let mut state = self.lock();
        state.take_failure(SimOp::RemovePage)?;
        let device = state.device(device)?;
        if device.pages.remove(&page).is_none() {
            return Err(HardwareError::InvalidArgument);
        }
        if device.active_page == Some(page) {
            device.active_page = None;
            if let Some(callback) = device.page_callback.clone() {
                self.post(move || callback(page, false));
            }
        }
        Ok(())
    }

    fn set_string(&self, device: DeviceHandle, page: u32, line: Line, text: &str) -> HwResult<()> {
        let mut state = self.lock();
        state.take_failure(SimOp::SetString)?;
        let device = state.device(device)?;
        if device.active_page != Some(page) {
            return Err(HardwareError::PageNotActive);
        }
        let sim_page = device
            .pages
            .get_mut(&page)
            .ok_or(HardwareError::InvalidArgument)?;
        sim_page.lines[line.index() as usize] = text.to_string();
        device.renders += 1;
        Ok(())
    }

    fn deinitialize(&self) -> HwResult<()> {
        let mut state = self.lock();
        state.device_callback = None;
        for device in state.devices.values_mut() {
            device.page_callback = None;
            device.button_callback = None;
        }
        Ok(())
    }
}
