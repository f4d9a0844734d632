//! Tag listener acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Controller writes reach the PLC and show up in the tag model
//! - PLC-side changes reach subscribers through polling and notifications
//! - A lost connection is reported, retried, and recovered
//! - A program redeploy does not stop polling

use super::common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tagcomm_codec::TagValue;
use tagcomm_common::{CommConfig, ListenerMode, TransportError};
use tagcomm_runtime::{build_listener, TagListener, TagSpec};

#[test]
fn test_controller_write_is_polled_back() {
    let endpoint = Endpoint::new();
    endpoint.plc.define_symbol("MAIN.setpoint", 4);
    let arena = endpoint.access.arena();
    let id = arena.create_tag(TagSpec::new("MAIN", "setpoint", "REAL")).unwrap();
    let listener = endpoint.polling_listener();
    listener.add_tag(id).unwrap();

    let controller = endpoint.controller();
    let written = controller
        .write_and_wait(id, TagValue::F32(21.5), Duration::from_secs(2))
        .unwrap();
    assert_eq!(written, TagValue::F32(21.5));
    assert_eq!(endpoint.plc.bytes("MAIN.setpoint").unwrap(), 21.5f32.to_le_bytes().to_vec());

    // The optimistic update already holds the value: nothing changes on refresh
    let outcome = listener.refresh_all();
    assert_eq!(outcome.changed, 0);
    assert_eq!(arena.tag(id).unwrap().value(), Some(TagValue::F32(21.5)));
}

#[test]
fn test_polled_changes_are_collected_per_cycle() {
    let endpoint = Endpoint::new();
    endpoint.plc.define_symbol("MAIN.a", 2);
    endpoint.plc.define_symbol("MAIN.b", 2);
    let arena = endpoint.access.arena();
    let a = arena.create_tag(TagSpec::new("MAIN", "a", "INT")).unwrap();
    let b = arena.create_tag(TagSpec::new("MAIN", "b", "INT")).unwrap();
    let listener = endpoint.polling_listener();
    listener.add_tag(a).unwrap();
    listener.add_tag(b).unwrap();
    listener.refresh_all();

    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    listener
        .events()
        .collected_tags_changed
        .subscribe(move |e| sink.lock().push(e.tags.clone()));

    endpoint.plc.set_bytes("MAIN.a", &3i16.to_le_bytes()).unwrap();
    endpoint.plc.set_bytes("MAIN.b", &4i16.to_le_bytes()).unwrap();
    listener.refresh_all();
    listener.refresh_all();

    assert_eq!(*batches.lock(), vec![vec![a, b]]);
}

#[test]
fn test_notification_listener_pushes_changes() {
    let endpoint = Endpoint::new();
    endpoint.plc.define_symbol("MAIN.running", 1);
    let mut config = CommConfig::default();
    config.listener.mode = ListenerMode::Notification;
    let listener = build_listener(endpoint.access.clone(), &config).unwrap();
    let id = endpoint
        .access
        .arena()
        .create_tag(TagSpec::new("MAIN", "running", "BOOL"))
        .unwrap();
    listener.add_tag(id).unwrap();

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    listener
        .events()
        .tag_changed
        .subscribe(move |e| sink.lock().push(e.new.clone()));
    listener.start().unwrap();

    endpoint.plc.set_bytes("MAIN.running", &[1]).unwrap();
    endpoint.plc.set_bytes("MAIN.running", &[0]).unwrap();
    listener.stop();
    endpoint.plc.set_bytes("MAIN.running", &[1]).unwrap();

    assert_eq!(
        *changes.lock(),
        vec![
            Some(TagValue::Bool(false)),
            Some(TagValue::Bool(true)),
            Some(TagValue::Bool(false)),
        ]
    );
}

#[test]
fn test_connection_loss_is_recovered() {
    let endpoint = Endpoint::new();
    endpoint.plc.define_symbol("MAIN.level", 4);
    let arena = endpoint.access.arena();
    let id = arena.create_tag(TagSpec::new("MAIN", "level", "DINT")).unwrap();
    let listener = endpoint.polling_listener();
    listener.add_tag(id).unwrap();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    listener
        .events()
        .connection_state_changed
        .subscribe(move |e| sink.lock().push(e.connected));
    listener.start().unwrap();
    assert!(wait_for(|| listener.stats().cycles > 0));

    endpoint.plc.set_connect_error(Some(TransportError::NotConnected));
    endpoint.plc.set_connected(false);
    assert!(wait_for(|| transitions.lock().contains(&false)));
    assert!(wait_for(|| listener.stats().reconnect_attempts >= 2));

    endpoint.plc.set_connect_error(None);
    endpoint.plc.set_bytes("MAIN.level", &9i32.to_le_bytes()).unwrap();
    assert!(wait_for(|| arena.tag(id).unwrap().value() == Some(TagValue::I32(9))));
    assert_eq!(transitions.lock().last(), Some(&true));
    assert!(!listener.has_failed());
    listener.stop();
}

#[test]
fn test_polling_continues_after_redeploy() {
    let endpoint = Endpoint::new();
    endpoint.plc.define_symbol("MAIN.batch", 4);
    let arena = endpoint.access.arena();
    let id = arena.create_tag(TagSpec::new("MAIN", "batch", "UDINT")).unwrap();
    let listener = endpoint.polling_listener();
    listener.add_tag(id).unwrap();
    let (problems, sink) = problem_sink();
    listener.events().communication_problem.subscribe(sink);
    listener.start().unwrap();

    endpoint.plc.redeploy();
    endpoint.plc.set_bytes("MAIN.batch", &77u32.to_le_bytes()).unwrap();
    assert!(wait_for(|| arena.tag(id).unwrap().value() == Some(TagValue::U32(77))));
    assert!(listener.is_running());
    assert!(problems.lock().iter().all(|p| !p.fatal));
    listener.stop();
}
