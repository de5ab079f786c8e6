#![allow(clippy::unwrap_used)]
// Integration tests for the database client: batched property calls over a
// scripted transport, the server cache fast path, and the file database.

use std::fs;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use devbus_api::testing::ScriptedTransport;
use devbus_api::wire::encode_properties;
use devbus_api::{AttributeProperties, ConnectionSpec, DbDatum, Error, Payload, Reason};
use devbus_core::{PropertyStore, ServerCache, StoreOptions};

// ── Helpers ─────────────────────────────────────────────────────────

fn transport() -> Arc<ScriptedTransport> {
    let transport = Arc::new(ScriptedTransport::new());
    transport.on("CommandQuery", |_, _| {
        Err(Error::remote(Reason::CommandNotFound, "no such command", "test"))
    });
    transport
}

fn remote(transport: &Arc<ScriptedTransport>) -> PropertyStore {
    let spec: ConnectionSpec = "db:10000".parse().unwrap();
    let options = StoreOptions {
        access_control: false,
        ..StoreOptions::default()
    };
    PropertyStore::connect(spec, transport.clone(), options).unwrap()
}

fn file_store(contents: &str) -> (tempfile::TempDir, PropertyStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.res");
    fs::write(&path, contents).unwrap();
    let store = PropertyStore::open_file(&path).unwrap();
    (dir, store)
}

// ── Remote batches ──────────────────────────────────────────────────

#[test]
fn test_empty_property_keeps_the_batch_aligned() {
    let transport = transport();
    transport.reply(
        "DbGetDeviceProperty",
        Payload::Strings(encode_properties(
            "sys/tg/1",
            &[
                DbDatum::with_values("first", ["1"]),
                DbDatum::new("blank"),
                DbDatum::with_values("last", ["a", "b"]),
            ],
        )),
    );

    let data = remote(&transport)
        .get_device_property("sys/tg/1", &["first", "blank", "last"])
        .unwrap();

    assert_eq!(
        data,
        vec![
            DbDatum::with_values("first", ["1"]),
            DbDatum::new("blank"),
            DbDatum::with_values("last", ["a", "b"]),
        ]
    );
    assert!(data[1].values.is_empty());
}

#[test]
fn test_put_sends_the_encoded_block() {
    let transport = transport();
    transport.reply("DbPutDeviceProperty", Payload::Void);
    let data = [DbDatum::with_values("speed", ["3"])];

    remote(&transport).put_device_property("sys/tg/1", &data).unwrap();

    let calls = transport.calls_to("DbPutDeviceProperty");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload, Payload::Strings(encode_properties("sys/tg/1", &data)));
}

#[test]
fn test_cache_answers_without_a_database_call() {
    let transport = transport();
    transport.reply(
        "DbGetDeviceProperty",
        Payload::Strings(encode_properties("sys/tg/1", &[DbDatum::with_values("speed", ["10"])])),
    );
    let db = remote(&transport);

    let live = db.get_device_property("sys/tg/1", &["speed"]).unwrap();
    db.set_server_cache(Arc::new(
        ServerCache::builder()
            .device("sys/tg/1", [DbDatum::with_values("speed", ["10"])])
            .build(),
    ));
    transport.clear_calls();
    let cached = db.get_device_property("sys/tg/1", &["speed"]).unwrap();

    assert_eq!(live, cached);
    assert_eq!(transport.count("DbGetDeviceProperty"), 0);
}

#[test]
fn test_cache_miss_falls_back_to_the_database() {
    let transport = transport();
    transport.reply(
        "DbGetDeviceProperty",
        Payload::Strings(encode_properties("sys/tg/9", &[DbDatum::with_values("speed", ["7"])])),
    );
    let db = remote(&transport);
    db.set_server_cache(Arc::new(ServerCache::builder().build()));

    let data = db.get_device_property("sys/tg/9", &["speed"]).unwrap();

    assert_eq!(data[0].first(), Some("7"));
    assert_eq!(transport.count("DbGetDeviceProperty"), 1);
}

#[test]
fn test_cleared_cache_is_not_consulted() {
    let transport = transport();
    transport.reply(
        "DbGetDeviceProperty",
        Payload::Strings(encode_properties("sys/tg/1", &[DbDatum::with_values("speed", ["11"])])),
    );
    let db = remote(&transport);
    db.set_server_cache(Arc::new(
        ServerCache::builder()
            .device("sys/tg/1", [DbDatum::with_values("speed", ["10"])])
            .build(),
    ));
    db.clear_server_cache();

    let data = db.get_device_property("sys/tg/1", &["speed"]).unwrap();
    assert_eq!(data[0].first(), Some("11"));
}

#[test]
fn test_remote_failure_keeps_its_reason() {
    let transport = transport();
    transport.fail("DbGetClassProperty", Reason::SqlError, "table is gone");

    let err = remote(&transport).get_class_property("TangoTest", &["doc"]).unwrap_err();

    assert_eq!(err.reason(), Reason::SqlError);
    assert_eq!(err.frames()[0].description, "table is gone");
}

// ── File database ───────────────────────────────────────────────────

#[test]
fn test_file_store_reads_device_and_class_properties() {
    let (_dir, db) = file_store(
        "# lab\n\
         Lab/1/DEVICE/Motor: lab/motor/1\n\
         lab/motor/1->speed: 1, 2, \\\n    3\n\
         CLASS/Motor->doc: \"free text, with commas\"\n",
    );

    let speed = db.get_device_property("lab/motor/1", &["speed", "missing"]).unwrap();
    assert_eq!(speed[0].values, vec!["1", "2", "3"]);
    assert!(speed[1].is_empty());

    let doc = db.get_class_property("Motor", &["doc"]).unwrap();
    assert_eq!(doc[0].first(), Some("free text, with commas"));
    assert_eq!(db.get_class_for_device("lab/motor/1").unwrap(), "Motor");
}

#[test]
fn test_file_store_writes_through_to_disk() {
    let (dir, db) = file_store("");
    db.put_device_property("lab/motor/1", &[DbDatum::with_values("speed", ["5"])])
        .unwrap();
    db.put_device_attribute_property(
        "lab/motor/1",
        &[AttributeProperties::new(
            "position",
            vec![DbDatum::with_values("min_alarm", ["-5"])],
        )],
    )
    .unwrap();

    let reopened = PropertyStore::open_file(dir.path().join("devices.res")).unwrap();
    let speed = reopened.get_device_property("lab/motor/1", &["speed"]).unwrap();
    assert_eq!(speed[0].first(), Some("5"));
    let attrs = reopened
        .get_device_attribute_property("lab/motor/1", &["position"])
        .unwrap();
    assert_eq!(attrs[0].properties[0].first(), Some("-5"));
}

#[test]
fn test_file_store_delete_removes_properties() {
    let (_dir, db) = file_store("lab/motor/1->speed: 5\nlab/motor/1->mode: fast\n");

    db.delete_device_property("lab/motor/1", &["speed"]).unwrap();

    let data = db.get_device_property("lab/motor/1", &["speed", "mode"]).unwrap();
    assert!(data[0].is_empty());
    assert_eq!(data[1].first(), Some("fast"));
}

#[test]
fn test_file_store_has_no_cache_and_no_aliases() {
    let (_dir, db) = file_store("");
    assert!(db.is_file_backed());
    assert!(!db.fill_server_cache("Lab/1", "localhost"));
    assert!(db.server_cache().is_none());

    let err = db.get_device_alias("lab/motor/1").unwrap_err();
    assert_eq!(err.reason(), Reason::NotSupported);
}
