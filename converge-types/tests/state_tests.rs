use converge_types::{compare_values, Convergence, Paginator, Resource, ResourceState, SortOrder};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::cmp::Ordering;

// ── ResourceState ───────────────────────────────────────────────

#[test]
fn fresh_resource_is_pending() {
    let state = ResourceState {
        config_version: 1,
        ..ResourceState::default()
    };
    assert_eq!(state.convergence(), Convergence::Pending { behind: 1 });
    assert!(state.is_pending());
    assert!(!state.is_converged());
}

#[test]
fn matching_versions_converge() {
    let state = ResourceState {
        config_version: 2,
        ..ResourceState::reported(2, "ACTIVE")
    };
    assert!(state.is_converged());
    assert_eq!(state.state, "ACTIVE");
}

#[test]
fn state_ahead_of_config() {
    let state = ResourceState {
        config_version: 1,
        ..ResourceState::reported(3, "ACTIVE")
    };
    assert_eq!(state.convergence(), Convergence::Ahead { by: 2 });
    assert!(!state.is_pending());
}

#[test]
fn report_builders() {
    let state = ResourceState::reported(4, "ERROR")
        .with_error("timeout")
        .with_monitoring("degraded");
    assert_eq!(state.state_version, 4);
    assert_eq!(state.error, "timeout");
    assert_eq!(state.monitoring, "degraded");
    assert_eq!(state.config_version, 0);
}

#[test]
fn convergence_serializes_tagged() {
    let json = serde_json::to_value(Convergence::Pending { behind: 2 }).unwrap();
    assert_eq!(json, json!({ "status": "pending", "behind": 2 }));
}

// ── Paginator ───────────────────────────────────────────────────

fn ranked(id: &str, rank: Value) -> Resource {
    let mut r = Resource::new("network", id, Default::default());
    r.set("rank", rank);
    r
}

#[test]
fn default_paginator_sorts_by_id() {
    let page = Paginator::default().apply(vec![
        ranked("b", json!(1)),
        ranked("c", json!(1)),
        ranked("a", json!(1)),
    ]);
    let ids: Vec<&str> = page.iter().map(Resource::id).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn paginator_sorts_numbers_numerically() {
    let page = Paginator::new().sorted_by("rank", SortOrder::Desc).apply(vec![
        ranked("a", json!(2)),
        ranked("b", json!(10)),
        ranked("c", json!(1)),
    ]);
    let ids: Vec<&str> = page.iter().map(Resource::id).collect();
    assert_eq!(ids, vec!["b", "a", "c"]);
}

#[test]
fn offset_past_end_is_empty() {
    let page = Paginator::new().with_offset(5).apply(vec![ranked("a", json!(1))]);
    assert!(page.is_empty());
}

#[test]
fn missing_values_sort_first() {
    assert_eq!(compare_values(None, Some(&json!(0))), Ordering::Less);
    assert_eq!(compare_values(Some(&Value::Null), None), Ordering::Equal);
    assert_eq!(compare_values(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
    assert_eq!(compare_values(Some(&json!(5)), Some(&json!("5"))), Ordering::Less);
}

proptest! {
    #[test]
    fn page_never_exceeds_limit(n in 0usize..30, limit in 0u64..10, offset in 0u64..40) {
        let resources: Vec<Resource> =
            (0..n).map(|i| ranked(&format!("r{i:02}"), json!(i))).collect();
        let page = Paginator::new().with_limit(limit).with_offset(offset).apply(resources);
        let expected = n.saturating_sub(offset as usize).min(limit as usize);
        prop_assert_eq!(page.len(), expected);
    }
}
