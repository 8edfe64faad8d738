use converge_types::{ErrorKind, Resource, TypesError};
use pretty_assertions::assert_eq;
use serde_json::{json, Map};

// ── Construction ────────────────────────────────────────────────

#[test]
fn new_mirrors_id_into_properties() {
    let r = Resource::new("network", "n1", Map::new());
    assert_eq!(r.schema_id(), "network");
    assert_eq!(r.id(), "n1");
    assert_eq!(r.get_str("id"), Some("n1"));
    assert_eq!(r.to_value(), json!({ "id": "n1" }));
}

#[test]
fn new_overrides_conflicting_id_property() {
    let mut props = Map::new();
    props.insert("id".into(), json!("other"));
    let r = Resource::new("network", "n1", props);
    assert_eq!(r.get_str("id"), Some("n1"));
}

#[test]
fn from_value_reads_id() {
    let r = Resource::from_value("network", json!({ "id": "n1", "name": "alpha" })).unwrap();
    assert_eq!(r.id(), "n1");
    assert_eq!(r.get_str("name"), Some("alpha"));
    assert_eq!(r.properties().len(), 2);
}

#[test]
fn from_value_rejects_bad_bodies() {
    for body in [
        json!([1, 2]),
        json!({ "name": "no id" }),
        json!({ "id": 5 }),
        json!({ "id": "" }),
    ] {
        let err = Resource::from_value("network", body).unwrap_err();
        assert!(matches!(err, TypesError::InvalidResource(_)));
        assert_eq!(err.kind(), ErrorKind::Argument);
    }
}

// ── Mutation ────────────────────────────────────────────────────

#[test]
fn set_ignores_id() {
    let mut r = Resource::new("network", "n1", Map::new());
    r.set("id", json!("n2"));
    r.set("name", json!("beta"));
    assert_eq!(r.id(), "n1");
    assert_eq!(r.get_str("id"), Some("n1"));
    assert_eq!(r.get_str("name"), Some("beta"));
}

#[test]
fn get_str_on_non_string_is_none() {
    let r = Resource::from_value("network", json!({ "id": "n1", "mtu": 1500 })).unwrap();
    assert_eq!(r.get("mtu"), Some(&json!(1500)));
    assert_eq!(r.get_str("mtu"), None);
    assert_eq!(r.get("missing"), None);
}
