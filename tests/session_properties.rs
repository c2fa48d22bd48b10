#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Session Property Tests
//!
//! Drives device sessions against the simulated SDK and checks that local
//! page state and the device stay consistent through every operation,
//! including hardware failures and callbacks arriving from the SDK thread.
//!
//! Run with: cargo test --test session_properties

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;

use direct_output_proxy::bus::{create_fanout, ChannelSink, EventSink, SinkError};
use direct_output_proxy::device::{DeviceClass, DeviceSession, Line, PageData, SoftButton};
use direct_output_proxy::error::{Error, HardwareError};
use direct_output_proxy::hardware::sim::SimOp;
use direct_output_proxy::hardware::{Guid, SimulatedDirectOutput};
use direct_output_proxy::registry::DeviceRegistry;

fn page(top: &str, middle: &str, bottom: &str) -> PageData {
    PageData {
        name: String::new(),
        top: top.to_string(),
        middle: middle.to_string(),
        bottom: bottom.to_string(),
    }
}

/// Simulator with one X52 Pro and a started registry around it.
fn setup() -> (Arc<SimulatedDirectOutput>, Arc<DeviceRegistry>) {
    let sim = Arc::new(SimulatedDirectOutput::new());
    sim.attach(Guid::X52_PRO);
    let registry = Arc::new(DeviceRegistry::new(sim.clone(), create_fanout()));
    registry.start().unwrap();
    (sim, registry)
}

/// Sink that records every message it accepts.
#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, message: &str) -> Result<(), SinkError> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

struct BrokenSink;

impl EventSink for BrokenSink {
    fn deliver(&self, _message: &str) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }
}

// =============================================================================
// Page set consistency
// =============================================================================

#[test]
fn local_pages_track_hardware_pages() {
    let (sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();
    let handle = session.handle();

    session.add_page(1, page("a", "", ""), false).unwrap();
    session.add_page(4, page("b", "", ""), false).unwrap();
    session.add_page(2, page("c", "", ""), true).unwrap();
    assert_eq!(session.page_indices(), sim.registered_pages(handle));

    session.remove_page(4).unwrap();
    assert_eq!(session.page_indices(), vec![1, 2]);
    assert_eq!(session.page_indices(), sim.registered_pages(handle));

    sim.fail_next(SimOp::AddPage, HardwareError::OutOfMemory);
    assert!(session.add_page(5, PageData::default(), false).is_err());
    sim.fail_next(SimOp::RemovePage, HardwareError::InvalidHandle);
    assert!(session.remove_page(1).is_err());
    assert_eq!(session.page_indices(), sim.registered_pages(handle));
}

#[test]
fn duplicate_add_leaves_page_untouched() {
    let (sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();

    session.add_page(3, page("first", "", ""), true).unwrap();
    let renders = sim.render_count(session.handle());

    let result = session.add_page(3, page("second", "", ""), false);
    assert!(matches!(result, Err(Error::AlreadyExists(3))));
    assert_eq!(session.page(3).unwrap().top, "first");
    assert_eq!(sim.render_count(session.handle()), renders);
}

#[test]
fn unknown_page_fails_without_rendering() {
    let (sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();
    let renders = sim.render_count(session.handle());

    assert!(matches!(
        session.set_line(9, Line::Top, "x"),
        Err(Error::PageNotFound(9))
    ));
    assert!(matches!(
        session.set_page(9, PageData::default()),
        Err(Error::PageNotFound(9))
    ));
    assert!(matches!(session.remove_page(9), Err(Error::PageNotFound(9))));
    assert_eq!(sim.render_count(session.handle()), renders);
}

#[derive(Debug, Clone)]
enum Step {
    Add { page: u32, activate: bool },
    Remove(u32),
    SetLine { page: u32, line: i64, text: String },
}

/// Hardware failure armed before a step. It may stay pending and hit a
/// later step instead.
#[derive(Debug, Clone, Copy)]
enum Fault {
    None,
    AddPage,
    RemovePage,
    /// Fail the SetString call after this many went through.
    SetString(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u32..6, any::<bool>()).prop_map(|(page, activate)| Step::Add { page, activate }),
        (0u32..6).prop_map(Step::Remove),
        (0u32..6, 0i64..3, "[a-z]{0,4}")
            .prop_map(|(page, line, text)| Step::SetLine { page, line, text }),
    ]
}

fn fault() -> impl Strategy<Value = Fault> {
    prop_oneof![
        3 => Just(Fault::None),
        1 => Just(Fault::AddPage),
        1 => Just(Fault::RemovePage),
        1 => (0usize..3).prop_map(Fault::SetString),
    ]
}

proptest! {
    #[test]
    fn page_set_always_matches_hardware(
        steps in prop::collection::vec((step(), fault()), 1..40)
    ) {
        let sim = Arc::new(SimulatedDirectOutput::new());
        let handle = sim.attach(Guid::X52_PRO);
        let session =
            DeviceSession::init(handle, sim.clone(), create_fanout(), &BTreeMap::new()).unwrap();

        for (step, fault) in steps {
            match fault {
                Fault::None => {}
                Fault::AddPage => sim.fail_next(SimOp::AddPage, HardwareError::OutOfMemory),
                Fault::RemovePage => sim.fail_next(SimOp::RemovePage, HardwareError::InvalidHandle),
                Fault::SetString(skip) => {
                    sim.fail_next_after(SimOp::SetString, skip, HardwareError::PageNotActive)
                }
            }

            match step {
                Step::Add { page, activate } => {
                    let data = PageData {
                        top: format!("page {}", page),
                        ..Default::default()
                    };
                    if session.add_page(page, data, activate).is_ok() {
                        prop_assert!(session.page_indices().contains(&page));
                    }
                }
                Step::Remove(page) => {
                    if session.remove_page(page).is_ok() {
                        prop_assert!(!session.page_indices().contains(&page));
                    }
                }
                Step::SetLine { page, line, text } => {
                    let line = Line::try_from(line).unwrap();
                    if session.set_line(page, line, text.clone()).is_ok() {
                        let stored = session.page(page).unwrap();
                        prop_assert_eq!(stored.line(line), text.as_str());
                    }
                }
            }
            // Let late deactivation callbacks land before comparing.
            sim.flush();

            prop_assert_eq!(session.page_indices(), sim.registered_pages(handle));
            prop_assert_eq!(session.active_page(), sim.active_page(handle));
        }
    }
}

#[test]
fn failed_push_leaves_local_and_device_in_step() {
    let (sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();
    let handle = session.handle();
    session.add_page(0, page("old", "", ""), true).unwrap();

    sim.fail_next(SimOp::SetString, HardwareError::OutOfMemory);
    assert!(session.set_line(0, Line::Top, "new").is_err());
    assert_eq!(session.page(0).unwrap().top, "old");
    assert_eq!(sim.page_lines(handle, 0).unwrap()[0], "old");

    sim.fail_next_after(SimOp::SetString, 2, HardwareError::OutOfMemory);
    assert!(session.set_page(0, page("a", "b", "c")).is_err());
    assert_eq!(session.page(0).unwrap(), page("old", "", ""));
    assert_eq!(
        sim.page_lines(handle, 0).unwrap(),
        ["old".to_string(), String::new(), String::new()]
    );
}

#[test]
fn control_calls_race_page_callbacks() {
    let (sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();
    let handle = session.handle();
    for index in 0..4 {
        session.add_page(index, page("", "", ""), index == 0).unwrap();
    }

    let writer = {
        let session = session.clone();
        thread::spawn(move || {
            for round in 0..200u32 {
                // Losing a race against a page switch is an expected failure.
                let _ = session.set_line(round % 4, Line::Middle, format!("round {}", round));
            }
        })
    };
    for round in 0..200u32 {
        sim.select_page(handle, round % 4).unwrap();
    }
    writer.join().unwrap();
    sim.flush();

    let active = session.active_page().unwrap();
    assert_eq!(sim.active_page(handle), Some(active));
    let local = session.page(active).unwrap();
    assert_eq!(
        sim.page_lines(handle, active).unwrap(),
        [local.top, local.middle, local.bottom]
    );
}

// =============================================================================
// Rendering
// =============================================================================

#[test]
fn shown_page_mirrors_local_content() {
    let (sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();
    let handle = session.handle();

    session.add_page(0, page("t", "m", "b"), true).unwrap();
    session.set_line(0, Line::Middle, "changed").unwrap();
    assert_eq!(
        sim.page_lines(handle, 0).unwrap(),
        ["t".to_string(), "changed".to_string(), "b".to_string()]
    );

    // Not shown: stored locally, not pushed.
    session.add_page(1, page("x", "", ""), false).unwrap();
    session.set_line(1, Line::Top, "y").unwrap();
    assert_eq!(sim.page_lines(handle, 1).unwrap()[0], "");
    assert_eq!(session.page(1).unwrap().top, "y");
}

#[test]
fn activation_renders_known_pages_only() {
    let (sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();
    let handle = session.handle();

    session.add_page(0, page("zero", "", ""), true).unwrap();
    session.add_page(1, page("one", "two", "three"), false).unwrap();

    sim.select_page(handle, 1).unwrap();
    sim.flush();
    assert_eq!(session.active_page(), Some(1));
    assert_eq!(
        sim.page_lines(handle, 1).unwrap(),
        ["one".to_string(), "two".to_string(), "three".to_string()]
    );

    let renders = sim.render_count(handle);
    session.handle_page_event(42, true);
    assert_eq!(session.active_page(), Some(42));
    assert_eq!(sim.render_count(handle), renders);
}

#[test]
fn removing_shown_page_clears_active_page() {
    let (sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();

    session.add_page(2, page("a", "", ""), true).unwrap();
    session.remove_page(2).unwrap();
    assert_eq!(session.active_page(), None);

    // The late deactivation callback from the SDK is a no-op.
    sim.flush();
    assert_eq!(session.active_page(), None);
}

// =============================================================================
// Buttons
// =============================================================================

#[test]
fn button_sequence_yields_edges() {
    let (_sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();

    let edges: Vec<Vec<(SoftButton, bool)>> = [0, 0b101, 0b101, 0b001]
        .into_iter()
        .map(|mask| {
            session
                .handle_buttons(mask)
                .into_iter()
                .map(|e| (e.button, e.pressed))
                .collect()
        })
        .collect();

    assert_eq!(
        edges,
        vec![
            vec![],
            vec![(SoftButton::Select, true), (SoftButton::Down, true)],
            vec![],
            vec![(SoftButton::Down, false)],
        ]
    );
}

#[test]
fn button_events_reach_every_healthy_subscriber() {
    let sim = Arc::new(SimulatedDirectOutput::new());
    let handle = sim.attach(Guid::FIP);
    let fanout = create_fanout();
    let registry = Arc::new(DeviceRegistry::new(sim.clone(), fanout.clone()));
    registry.start().unwrap();

    let first = Arc::new(RecordingSink::default());
    let second = Arc::new(RecordingSink::default());
    fanout.subscribe(first.clone());
    fanout.subscribe(Arc::new(BrokenSink));
    fanout.subscribe(second.clone());

    let session = registry.get(handle).unwrap();
    session.add_page(3, PageData::default(), true).unwrap();

    sim.press_buttons(handle, 0b010).unwrap();
    sim.press_buttons(handle, 0).unwrap();
    sim.flush();

    let expected = vec!["Up 1 3".to_string(), "Up 0 3".to_string()];
    assert_eq!(first.messages(), expected);
    assert_eq!(second.messages(), expected);
    assert_eq!(fanout.subscriber_count(), 3);
}

#[test]
fn event_without_active_page_omits_page() {
    let (_sim, registry) = setup();
    let session = registry.get_by_class(DeviceClass::X52Pro).unwrap();
    assert_eq!(session.active_page(), None);

    let events = session.handle_buttons(SoftButton::Select.mask());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].to_message(), "Select 1");
}

#[tokio::test]
async fn channel_sink_feeds_receiver() {
    let fanout = create_fanout();
    let (sink, mut rx) = ChannelSink::new(4);
    fanout.subscribe(Arc::new(sink));

    let sim = Arc::new(SimulatedDirectOutput::new());
    let handle = sim.attach(Guid::X52_PRO);
    let registry = Arc::new(DeviceRegistry::new(sim.clone(), fanout.clone()));
    registry.start().unwrap();

    registry.get(handle).unwrap().handle_buttons(0b100);
    assert_eq!(rx.recv().await.unwrap(), "Down 1");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn default_pages_are_provisioned_on_arrival() {
    let sim = Arc::new(SimulatedDirectOutput::new());
    let mut defaults = BTreeMap::new();
    defaults.insert(0, page("top1", "middle1", "bottom1"));
    defaults.insert(1, page("top2", "middle2", "bottom2"));
    let registry = Arc::new(
        DeviceRegistry::new(sim.clone(), create_fanout()).with_default_pages(defaults),
    );
    registry.start().unwrap();

    let handle = sim.attach(Guid::X52_PRO);
    sim.flush();

    let session = registry.get(handle).unwrap();
    assert_eq!(session.page_indices(), vec![0, 1]);
    assert_eq!(session.active_page(), Some(0));
    assert_eq!(
        sim.page_lines(handle, 0).unwrap(),
        [
            "top1".to_string(),
            "middle1".to_string(),
            "bottom1".to_string()
        ]
    );
}

#[test]
fn callbacks_after_removal_are_dropped() {
    let sim = Arc::new(SimulatedDirectOutput::new());
    let handle = sim.attach(Guid::X52_PRO);
    let fanout = create_fanout();
    let registry = Arc::new(DeviceRegistry::new(sim.clone(), fanout.clone()));
    registry.start().unwrap();

    let probe = Arc::new(RecordingSink::default());
    fanout.subscribe(probe.clone());

    assert!(registry.on_device_removed(handle));
    sim.press_buttons(handle, 0b001).unwrap();
    sim.flush();

    assert!(registry.get(handle).is_none());
    assert!(probe.messages().is_empty());
}

#[test]
fn arrival_hook_attaches_button_reaction() {
    let sim = Arc::new(SimulatedDirectOutput::new());
    let mut defaults = BTreeMap::new();
    defaults.insert(0, page("top1", "middle1", "bottom1"));
    let registry = Arc::new(
        DeviceRegistry::new(sim.clone(), create_fanout())
            .with_default_pages(defaults)
            .with_arrival_hook(|session| {
                session.on_button(|session, event| {
                    if !event.pressed {
                        return;
                    }
                    let _ = session.set_line(0, Line::Top, format!("Button: {}", event.button));
                });
            }),
    );
    registry.start().unwrap();

    let handle = sim.attach(Guid::X52_PRO);
    sim.flush();
    sim.press_buttons(handle, SoftButton::Down.mask()).unwrap();
    sim.press_buttons(handle, 0).unwrap();
    sim.flush();

    let session = registry.get(handle).unwrap();
    assert_eq!(session.page(0).unwrap().top, "Button: Down");
    assert_eq!(
        sim.page_lines(handle, 0).unwrap(),
        [
            "Button: Down".to_string(),
            "middle1".to_string(),
            "bottom1".to_string()
        ]
    );
}
