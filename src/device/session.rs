//! DeviceSession - page and button state for one physical device
//!
//! The in-memory page map is authoritative; the device is a render target kept
//! consistent with it after every successful mutation:
//! - a page exists locally iff the hardware accepted it
//! - new content for the shown page is stored only once all three lines were
//!   pushed; a failed push leaves the previous content in place
//! - hardware page/button callbacks are bound to the session through a weak
//!   reference, so callbacks racing a removal are dropped

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, warn};

use crate::bus::{ButtonEvent, SharedFanOut};
use crate::device::{detect_edges, DeviceClass, DeviceInfo, Line, PageData, PageInfo, SoftButton};
use crate::error::{Error, Result};
use crate::hardware::{DeviceHandle, HwResult, PageCallback, SharedHardware, SoftButtonCallback};

/// Per-device reaction to a button edge. Runs on the adapter's callback
/// thread with no session lock held, so it may drive the session itself.
pub type ButtonHandler = Arc<dyn Fn(&DeviceSession, &ButtonEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct SessionState {
    pages: HashMap<u32, PageData>,
    active_page: Option<u32>,
    /// Last reported button bitmask.
    buttons: u32,
}

/// Everything a hardware callback needs; callbacks hold it weakly.
struct Inner {
    handle: DeviceHandle,
    class: DeviceClass,
    attached_at: DateTime<Utc>,
    hardware: SharedHardware,
    fanout: SharedFanOut,
    state: Mutex<SessionState>,
    button_handlers: Mutex<Vec<ButtonHandler>>,
}

pub struct DeviceSession {
    inner: Arc<Inner>,
}

fn set_string_operation(line: Line) -> &'static str {
    match line {
        Line::Top => "SetString Top",
        Line::Middle => "SetString Middle",
        Line::Bottom => "SetString Bottom",
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map an adapter outcome, logging failures with the operation name.
    fn check<T>(&self, operation: &'static str, result: HwResult<T>) -> Result<T> {
        result.map_err(|source| {
            warn!(
                device = %self.handle,
                operation,
                "hardware call failed: {} ({:#010x})",
                source,
                source.code()
            );
            Error::hardware(operation, source)
        })
    }

    /// Push all three lines of `data` to `page`.
    fn render_data(&self, page: u32, data: &PageData) -> Result<()> {
        for line in Line::ALL {
            self.check(
                set_string_operation(line),
                self.hardware
                    .set_string(self.handle, page, line, data.line(line)),
            )?;
        }
        Ok(())
    }

    /// Push the stored content of `page`. Unknown pages render nothing.
    fn render(&self, state: &SessionState, page: u32) -> Result<()> {
        match state.pages.get(&page) {
            Some(data) => self.render_data(page, data),
            None => Ok(()),
        }
    }

    /// Store new content for a known page, pushing it first if the page is
    /// shown. On a failed push the old content stays and is rendered again.
    fn replace_page(&self, state: &mut SessionState, page: u32, data: PageData) -> Result<()> {
        if state.active_page == Some(page) {
            if let Err(e) = self.render_data(page, &data) {
                if let Err(restore) = self.render(state, page) {
                    error!(device = %self.handle, page, "failed to restore page: {}", restore);
                }
                return Err(e);
            }
        }
        state.pages.insert(page, data);
        Ok(())
    }

    fn handle_page_event(&self, page: u32, activated: bool) {
        debug!(device = %self.handle, page, activated, "page callback");
        let mut state = self.lock();
        if activated {
            state.active_page = Some(page);
            if !state.pages.contains_key(&page) {
                debug!(device = %self.handle, page, "activated page has no local content");
                return;
            }
            if let Err(e) = self.render(&state, page) {
                error!(device = %self.handle, page, "failed to render activated page: {}", e);
            }
        } else if state.active_page == Some(page) {
            state.active_page = None;
        } else {
            debug!(
                device = %self.handle,
                page,
                active = ?state.active_page,
                "ignoring deactivation of inactive page"
            );
        }
    }

    fn handle_buttons(self: &Arc<Self>, buttons: u32) -> Vec<ButtonEvent> {
        let (edges, page) = {
            let mut state = self.lock();
            let edges = detect_edges(state.buttons, buttons, &SoftButton::ALL);
            state.buttons = buttons;
            (edges, state.active_page)
        };

        let events: Vec<ButtonEvent> = edges
            .into_iter()
            .map(|edge| ButtonEvent {
                device: self.handle,
                class: self.class,
                button: edge.button,
                pressed: edge.pressed,
                page,
            })
            .collect();

        for event in &events {
            debug!(device = %self.handle, "button {}", event);
            self.fanout.broadcast(event);
        }

        let handlers: Vec<ButtonHandler> = self
            .button_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !handlers.is_empty() && !events.is_empty() {
            let session = DeviceSession {
                inner: Arc::clone(self),
            };
            for event in &events {
                for handler in &handlers {
                    handler(&session, event);
                }
            }
        }
        events
    }

    fn bind_callbacks(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let on_page: PageCallback = Arc::new(move |page, activated| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_page_event(page, activated);
            }
        });
        self.check(
            "RegisterPageCallback",
            self.hardware.register_page_callback(self.handle, on_page),
        )?;

        let weak: Weak<Inner> = Arc::downgrade(self);
        let on_buttons: SoftButtonCallback = Arc::new(move |buttons| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_buttons(buttons);
            }
        });
        if let Err(e) = self.check(
            "RegisterSoftButtonCallback",
            self.hardware
                .register_soft_button_callback(self.handle, on_buttons),
        ) {
            let _ = self.check(
                "UnregisterPageCallback",
                self.hardware.unregister_page_callback(self.handle),
            );
            return Err(e);
        }
        Ok(())
    }
}

impl DeviceSession {
    /// Bring up a session for a newly arrived device.
    ///
    /// Queries the device class, registers `default_pages` (page 0 as the
    /// active page), renders page 0 and binds the page and button callbacks.
    /// Stops at the first failing hardware call and returns its outcome.
    pub fn init(
        handle: DeviceHandle,
        hardware: SharedHardware,
        fanout: SharedFanOut,
        default_pages: &BTreeMap<u32, PageData>,
    ) -> Result<Self> {
        let guid = hardware.device_type(handle).map_err(|source| {
            warn!(device = %handle, operation = "GetDeviceType", "hardware call failed: {}", source);
            Error::hardware("GetDeviceType", source)
        })?;
        let class = DeviceClass::from_guid(guid);
        info!(device = %handle, %guid, "Detected: {}", class);

        let session = Self {
            inner: Arc::new(Inner {
                handle,
                class,
                attached_at: Utc::now(),
                hardware,
                fanout,
                state: Mutex::new(SessionState::default()),
                button_handlers: Mutex::new(Vec::new()),
            }),
        };

        {
            let inner = &session.inner;
            let mut state = inner.lock();
            for (&index, data) in default_pages {
                inner.check(
                    "AddPage",
                    inner
                        .hardware
                        .add_page(handle, index, &data.name, index == 0),
                )?;
                state.pages.insert(index, data.clone());
            }
            if state.pages.contains_key(&0) {
                state.active_page = Some(0);
                inner.render(&state, 0)?;
            }
        }

        session.inner.bind_callbacks()?;
        Ok(session)
    }

    pub fn handle(&self) -> DeviceHandle {
        self.inner.handle
    }

    pub fn class(&self) -> DeviceClass {
        self.inner.class
    }

    pub fn active_page(&self) -> Option<u32> {
        self.inner.lock().active_page
    }

    pub fn page(&self, index: u32) -> Option<PageData> {
        self.inner.lock().pages.get(&index).cloned()
    }

    /// Known page indices, ascending.
    pub fn page_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.inner.lock().pages.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Register a new page with the device and store it.
    ///
    /// With `activate`, a page whose content cannot be pushed is taken back
    /// off the device and the push failure is returned.
    pub fn add_page(&self, index: u32, data: PageData, activate: bool) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock();
        if state.pages.contains_key(&index) {
            return Err(Error::AlreadyExists(index));
        }

        inner.check(
            "AddPage",
            inner
                .hardware
                .add_page(inner.handle, index, &data.name, activate),
        )?;

        if activate {
            if let Err(e) = inner.render_data(index, &data) {
                // The activating add already took the previous page off screen.
                match inner.check("RemovePage", inner.hardware.remove_page(inner.handle, index)) {
                    Ok(()) => state.active_page = None,
                    Err(_) => {
                        state.pages.insert(index, data);
                        state.active_page = Some(index);
                    }
                }
                return Err(e);
            }
            state.active_page = Some(index);
        }
        state.pages.insert(index, data);
        info!(device = %inner.handle, page = index, activate, "page added");
        Ok(())
    }

    /// Replace the content of an existing page; pushed only if shown.
    ///
    /// The page keeps its name, which the device only receives when the page
    /// is added.
    pub fn set_page(&self, index: u32, mut data: PageData) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock();
        let current = state.pages.get(&index).ok_or(Error::PageNotFound(index))?;
        data.name.clone_from(&current.name);
        inner.replace_page(&mut state, index, data)
    }

    /// Unregister a page from the device and forget it.
    ///
    /// Removing the shown page also clears the active page; the deactivation
    /// callback the device sends afterwards is then a no-op.
    pub fn remove_page(&self, index: u32) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock();
        if !state.pages.contains_key(&index) {
            return Err(Error::PageNotFound(index));
        }

        inner.check("RemovePage", inner.hardware.remove_page(inner.handle, index))?;
        state.pages.remove(&index);
        if state.active_page == Some(index) {
            state.active_page = None;
        }
        info!(device = %inner.handle, page = index, "page removed");
        Ok(())
    }

    /// Change one line of a page. The whole page is pushed if shown.
    pub fn set_line(&self, index: u32, line: Line, content: impl Into<String>) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock();
        let mut data = state
            .pages
            .get(&index)
            .cloned()
            .ok_or(Error::PageNotFound(index))?;
        *data.line_mut(line) = content.into();
        inner.replace_page(&mut state, index, data)
    }

    /// Apply a page activation/deactivation reported by the device.
    pub fn handle_page_event(&self, page: u32, activated: bool) {
        self.inner.handle_page_event(page, activated);
    }

    /// Apply a button bitmask reported by the device, publish the resulting
    /// edges, run the button handlers and return the edges.
    pub fn handle_buttons(&self, buttons: u32) -> Vec<ButtonEvent> {
        self.inner.handle_buttons(buttons)
    }

    /// React to this device's button edges on the device itself, e.g. echo
    /// the pressed button on a line. Handlers run after subscribers were
    /// notified, in registration order.
    pub fn on_button(
        &self,
        handler: impl Fn(&DeviceSession, &ButtonEvent) + Send + Sync + 'static,
    ) {
        self.inner
            .button_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    pub fn info(&self) -> DeviceInfo {
        let state = self.inner.lock();
        let mut pages: Vec<PageInfo> = state
            .pages
            .iter()
            .map(|(&index, data)| PageInfo {
                index,
                data: data.clone(),
            })
            .collect();
        pages.sort_by_key(|p| p.index);

        DeviceInfo {
            handle: self.inner.handle,
            class: self.inner.class,
            attached_at: self.inner.attached_at,
            pages,
            active_page: state.active_page,
        }
    }

    /// Unregister the page and button callbacks. Both are attempted; the
    /// first failure is returned.
    pub fn detach_callbacks(&self) -> Result<()> {
        let inner = &self.inner;
        let page = inner.check(
            "UnregisterPageCallback",
            inner.hardware.unregister_page_callback(inner.handle),
        );
        let buttons = inner.check(
            "UnregisterSoftButtonCallback",
            inner.hardware.unregister_soft_button_callback(inner.handle),
        );
        page.and(buttons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_fanout;
    use crate::error::HardwareError;
    use crate::hardware::sim::{SimOp, SimulatedDirectOutput};
    use crate::hardware::Guid;

    fn defaults() -> BTreeMap<u32, PageData> {
        let mut pages = BTreeMap::new();
        pages.insert(
            0,
            PageData {
                name: "main".into(),
                top: "top1".into(),
                middle: "middle1".into(),
                bottom: "bottom1".into(),
            },
        );
        pages.insert(
            1,
            PageData {
                name: "second".into(),
                top: "top2".into(),
                middle: "middle2".into(),
                bottom: "bottom2".into(),
            },
        );
        pages
    }

    fn setup(pages: &BTreeMap<u32, PageData>) -> (Arc<SimulatedDirectOutput>, DeviceSession) {
        let sim = Arc::new(SimulatedDirectOutput::new());
        let handle = sim.attach(Guid::X52_PRO);
        let session = DeviceSession::init(handle, sim.clone(), create_fanout(), pages).unwrap();
        (sim, session)
    }

    #[test]
    fn init_registers_defaults_and_shows_page_zero() {
        let (sim, session) = setup(&defaults());
        let handle = session.handle();

        assert_eq!(session.class(), DeviceClass::X52Pro);
        assert_eq!(sim.registered_pages(handle), vec![0, 1]);
        assert_eq!(session.active_page(), Some(0));
        assert_eq!(
            sim.page_lines(handle, 0).unwrap(),
            ["top1".to_string(), "middle1".into(), "bottom1".into()]
        );
        assert!(sim.has_page_callback(handle));
        assert!(sim.has_button_callback(handle));
    }

    #[test]
    fn init_stops_at_first_failure() {
        let sim = Arc::new(SimulatedDirectOutput::new());
        let handle = sim.attach(Guid::FIP);
        sim.fail_next(SimOp::AddPage, HardwareError::OutOfMemory);

        let err = DeviceSession::init(handle, sim.clone(), create_fanout(), &defaults())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Hardware {
                operation: "AddPage",
                source: HardwareError::OutOfMemory
            }
        ));
        assert!(sim.registered_pages(handle).is_empty());
        assert!(!sim.has_page_callback(handle));
    }

    #[test]
    fn failed_button_registration_unbinds_page_callback() {
        let sim = Arc::new(SimulatedDirectOutput::new());
        let handle = sim.attach(Guid::X52_PRO);
        sim.fail_next(SimOp::RegisterSoftButtonCallback, HardwareError::InvalidHandle);

        let result = DeviceSession::init(handle, sim.clone(), create_fanout(), &BTreeMap::new());
        assert!(result.is_err());
        assert!(!sim.has_page_callback(handle));
    }

    #[test]
    fn set_page_on_inactive_page_is_stored_not_rendered() {
        let (sim, session) = setup(&defaults());
        let handle = session.handle();
        let renders = sim.render_count(handle);

        let data = PageData {
            top: "new".into(),
            ..Default::default()
        };
        session.set_page(1, data.clone()).unwrap();

        assert_eq!(session.page(1), Some(data));
        assert_eq!(sim.render_count(handle), renders);
    }

    #[test]
    fn set_line_rerenders_whole_active_page() {
        let (sim, session) = setup(&defaults());
        let handle = session.handle();
        let renders = sim.render_count(handle);

        session.set_line(0, Line::Middle, "changed").unwrap();

        assert_eq!(sim.render_count(handle), renders + 3);
        assert_eq!(sim.page_lines(handle, 0).unwrap()[1], "changed");
    }

    #[test]
    fn removing_active_page_clears_it() {
        let (sim, session) = setup(&defaults());
        session.remove_page(0).unwrap();
        sim.flush();

        assert_eq!(session.active_page(), None);
        assert_eq!(session.page_indices(), vec![1]);
        assert_eq!(sim.registered_pages(session.handle()), vec![1]);
    }

    #[test]
    fn failed_remove_keeps_page() {
        let (sim, session) = setup(&defaults());
        sim.fail_next(SimOp::RemovePage, HardwareError::InvalidHandle);

        assert!(session.remove_page(1).is_err());
        assert_eq!(session.page_indices(), vec![0, 1]);
        assert_eq!(sim.registered_pages(session.handle()), vec![0, 1]);
    }

    #[test]
    fn stale_deactivation_is_ignored() {
        let (_sim, session) = setup(&defaults());
        session.handle_page_event(1, false);
        assert_eq!(session.active_page(), Some(0));
        session.handle_page_event(0, false);
        assert_eq!(session.active_page(), None);
    }

    #[test]
    fn button_events_carry_active_page() {
        let (_sim, session) = setup(&defaults());
        let events = session.handle_buttons(0b001);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].page, Some(0));
        assert_eq!(events[0].to_message(), "Select 1 0");
    }

    #[test]
    fn info_snapshot() {
        let (_sim, session) = setup(&defaults());
        let info = session.info();
        assert_eq!(info.class, DeviceClass::X52Pro);
        assert_eq!(info.page_count(), 2);
        assert_eq!(info.active_page, Some(0));
        assert_eq!(info.page(1).unwrap().bottom, "bottom2");
    }

    #[test]
    fn failed_line_push_keeps_old_content() {
        let (sim, session) = setup(&defaults());
        let handle = session.handle();
        sim.fail_next(SimOp::SetString, HardwareError::OutOfMemory);

        let err = session.set_line(0, Line::Top, "new").unwrap_err();
        assert!(matches!(
            err,
            Error::Hardware {
                operation: "SetString Top",
                source: HardwareError::OutOfMemory
            }
        ));
        assert_eq!(session.page(0).unwrap().top, "top1");
        assert_eq!(sim.page_lines(handle, 0).unwrap()[0], "top1");
    }

    #[test]
    fn failed_page_push_restores_device() {
        let (sim, session) = setup(&defaults());
        let handle = session.handle();
        session.set_line(0, Line::Top, "kept").unwrap();

        // Top goes through, Middle fails: the device is put back.
        sim.fail_next_after(SimOp::SetString, 1, HardwareError::InvalidHandle);
        let data = PageData {
            top: "a".into(),
            middle: "b".into(),
            bottom: "c".into(),
            ..Default::default()
        };
        assert!(session.set_page(0, data).is_err());

        assert_eq!(session.page(0).unwrap().top, "kept");
        assert_eq!(
            sim.page_lines(handle, 0).unwrap(),
            ["kept".to_string(), "middle1".into(), "bottom1".into()]
        );
    }

    #[test]
    fn failed_activating_add_is_rolled_back() {
        let (sim, session) = setup(&BTreeMap::new());
        let handle = session.handle();
        sim.fail_next(SimOp::SetString, HardwareError::OutOfMemory);

        let data = PageData {
            top: "A".into(),
            ..Default::default()
        };
        assert!(session.add_page(2, data.clone(), true).is_err());
        assert!(session.page_indices().is_empty());
        assert!(sim.registered_pages(handle).is_empty());
        assert_eq!(session.active_page(), None);

        // A retry is a fresh add.
        session.add_page(2, data, true).unwrap();
        assert_eq!(session.active_page(), Some(2));
        assert_eq!(sim.page_lines(handle, 2).unwrap()[0], "A");
    }

    #[test]
    fn set_page_keeps_registered_name() {
        let (_sim, session) = setup(&defaults());
        let data = PageData {
            name: "renamed".into(),
            top: "x".into(),
            ..Default::default()
        };
        session.set_page(1, data).unwrap();

        let page = session.page(1).unwrap();
        assert_eq!(page.name, "second");
        assert_eq!(page.top, "x");
    }

    #[test]
    fn button_handler_writes_to_device() {
        let (sim, session) = setup(&defaults());
        let handle = session.handle();
        session.on_button(|session, event| {
            if !event.pressed {
                return;
            }
            let _ = session.set_line(0, Line::Top, format!("Button: {}", event.button));
        });

        sim.press_buttons(handle, SoftButton::Up.mask()).unwrap();
        sim.press_buttons(handle, 0).unwrap();
        sim.flush();

        assert_eq!(session.page(0).unwrap().top, "Button: Up");
        assert_eq!(sim.page_lines(handle, 0).unwrap()[0], "Button: Up");
    }
}
