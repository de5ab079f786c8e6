#![allow(clippy::unwrap_used)]
// Integration tests for connection resolution and the property codec,
// exercised only through the public API.

use pretty_assertions::assert_eq;

use devbus_api::wire::{decode_properties, encode_properties, encode_query};
use devbus_api::{ConnectionSpec, DbDatum, Error, Reason};

// ── Helpers ─────────────────────────────────────────────────────────

fn spec(s: &str) -> ConnectionSpec {
    ConnectionSpec::resolve(Some(s)).unwrap()
}

// ── Connection specs ────────────────────────────────────────────────

#[test]
fn test_single_host_resolution() {
    let resolved = spec("hostA:10000");
    assert_eq!(resolved.hosts, vec!["hostA".to_owned()]);
    assert_eq!(resolved.ports, vec!["10000".to_owned()]);
    assert!(!resolved.is_multi_host);
    assert!(!resolved.is_file_backed);
}

#[test]
fn test_multi_host_resolution_preserves_order() {
    let resolved = spec("hostA:10000,hostB:10001");
    let pairs: Vec<String> = resolved.endpoints().map(|e| e.to_string()).collect();
    assert_eq!(pairs, vec!["hostA:10000", "hostB:10001"]);
    assert!(resolved.is_multi_host);
}

#[test]
fn test_missing_colon_fails_with_config_reason() {
    let err = ConnectionSpec::resolve(Some("hostA")).unwrap_err();
    assert!(matches!(err, Error::InvalidSpec { .. }));
    assert_eq!(err.reason(), Reason::TangoHostNotSet);
}

#[test]
fn test_file_spec_has_no_endpoints() {
    let resolved = ConnectionSpec::file("/tmp/devbus.res");
    assert!(resolved.is_file_backed);
    assert_eq!(resolved.endpoints().count(), 0);
}

// ── Property codec ──────────────────────────────────────────────────

#[test]
fn test_query_layout() {
    assert_eq!(
        encode_query("sys/tg/1", &["speed", "mode"]),
        vec!["sys/tg/1", "speed", "mode"]
    );
}

#[test]
fn test_put_block_decodes_back_with_empty_entries() {
    let data = vec![
        DbDatum::with_values("a", ["1"]),
        DbDatum::new("b"),
        DbDatum::with_values("c", ["x", "y", "z"]),
    ];
    let wire = encode_properties("sys/tg/1", &data);
    let block = decode_properties("DbPutDeviceProperty", &wire).unwrap();
    assert_eq!(block.object, "sys/tg/1");
    assert_eq!(block.data, data);
}

#[test]
fn test_non_numeric_count_is_rejected() {
    let wire: Vec<String> = ["dev", "one"].iter().map(|s| (*s).to_owned()).collect();
    let err = decode_properties("DbGetDeviceProperty", &wire).unwrap_err();
    assert_eq!(err.reason(), Reason::IncoherentDbData);
}
