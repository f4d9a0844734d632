//! Tag model acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Tags with equal (scope, name, port, area) are equal whatever their value
//! - Re-assigning the current value raises no change event
//! - Every real change, including null transitions, raises exactly one event
//! - Adding the same-identity tag twice tracks it once

use super::common::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tagcomm_codec::TagValue;
use tagcomm_common::DEFAULT_ADS_PORT;
use tagcomm_runtime::{TagListener, TagSpec};

#[test]
fn test_identity_ignores_value() {
    let endpoint = Endpoint::new();
    let arena = endpoint.access.arena();
    let a = arena.create_tag(TagSpec::new("MAIN", "speed", "REAL")).unwrap();
    let b = arena.create_tag(TagSpec::new("MAIN", "speed", "REAL")).unwrap();
    arena.tag(a).unwrap().set_value(Some(TagValue::F32(1.5)));
    arena.tag(b).unwrap().set_value(Some(TagValue::F32(-3.0)));

    let (a, b) = (arena.tag(a).unwrap(), arena.tag(b).unwrap());
    assert_eq!(*a, *b);
    let keys: HashSet<_> = [a.identity(), b.identity()].into_iter().collect();
    assert_eq!(keys.len(), 1);

    let other_area = arena
        .create_tag(TagSpec {
            area: "retain".into(),
            ..TagSpec::new("MAIN", "speed", "REAL")
        })
        .unwrap();
    assert_ne!(*a, *arena.tag(other_area).unwrap());
}

#[test]
fn test_change_events_fire_once_per_change() {
    let endpoint = Endpoint::new();
    let arena = endpoint.access.arena();
    let id = arena.create_tag(TagSpec::new("MAIN", "count", "DINT")).unwrap();
    let tag = arena.tag(id).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    tag.on_change(move |e| sink.lock().push((e.old.clone(), e.new.clone())));

    assert!(tag.set_value(Some(TagValue::I32(1))));
    assert!(!tag.set_value(Some(TagValue::I32(1))));
    assert!(tag.set_value(Some(TagValue::I32(2))));
    assert!(tag.set_value(None));
    assert!(!tag.set_value(None));

    assert_eq!(
        *seen.lock(),
        vec![
            (None, Some(TagValue::I32(1))),
            (Some(TagValue::I32(1)), Some(TagValue::I32(2))),
            (Some(TagValue::I32(2)), None),
        ]
    );
}

#[test]
fn test_listener_tracks_identity_once() {
    let endpoint = Endpoint::new();
    endpoint.plc.define_symbol("MAIN.count", 4);
    let arena = endpoint.access.arena();
    let listener = endpoint.polling_listener();

    let first = arena.create_tag(TagSpec::new("MAIN", "count", "DINT")).unwrap();
    let second = arena.create_tag(TagSpec::new("MAIN", "count", "DINT")).unwrap();
    assert_eq!(listener.add_tag(first).unwrap(), first);
    assert_eq!(listener.add_tag(second).unwrap(), first);
    assert_eq!(listener.add_tag(first).unwrap(), first);

    assert_eq!(listener.tags(), vec![first]);
    assert_eq!(arena.tag(second).unwrap().port(), DEFAULT_ADS_PORT);
}
