// ── Server cache ──
//
// Read-only snapshot of every property a device server needs at startup,
// fetched with one bulk call. A miss is not an answer: callers fall back
// to the live database on `CacheError::NotFound`.
//
// Bulk reply layout:
//
//   [n_sections, section*]
//   device / class section:                    kind, object, n_props, datum*
//   device_attribute / class_attribute section: kind, object, n_attr,
//                                               (attr, n_props, datum*)*
//
// where `datum` is the `(name, value_count, values*)` block of the property
// codec, placeholder included.

use std::collections::HashMap;

use indexmap::IndexMap;
use strum::{Display, EnumString};
use thiserror::Error;

use devbus_api::wire::WireReader;
use devbus_api::{AttributeProperties, DbDatum, Reason};

use crate::error::CoreError;

use super::PropertyStore;

const OP_BULK: &str = "DbGetDataForServerCache";

// ── Lookup outcome ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CacheKind {
    Device,
    Class,
}

impl CacheKind {
    pub fn reason(self) -> Reason {
        match self {
            Self::Device => Reason::DeviceNotFoundInCache,
            Self::Class => Reason::ClassNotFoundInCache,
        }
    }
}

/// The object is absent from the snapshot. Says nothing about whether the
/// database knows it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} {object} not found in server cache")]
pub struct CacheMiss {
    pub kind: CacheKind,
    pub object: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    NotFound(#[from] CacheMiss),
    #[error(transparent)]
    Other(#[from] CoreError),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl From<CacheMiss> for CoreError {
    fn from(miss: CacheMiss) -> Self {
        CoreError::NotFound {
            reason: miss.kind.reason(),
            message: miss.to_string(),
        }
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Properties of one object, keyed by lower-cased property name.
#[derive(Debug, Clone, Default)]
struct ObjectProps(IndexMap<String, DbDatum>);

impl ObjectProps {
    fn insert(&mut self, datum: DbDatum) {
        self.0.insert(datum.name.to_lowercase(), datum);
    }

    /// Unknown names answer with an empty value list, like the database.
    fn lookup(&self, name: &str) -> DbDatum {
        self.0.get(&name.to_lowercase()).map_or_else(
            || DbDatum::new(name),
            |found| DbDatum::with_values(name, found.values.iter().cloned()),
        )
    }

    fn all(&self) -> Vec<DbDatum> {
        self.0.values().cloned().collect()
    }
}

type AttrTable = IndexMap<String, (String, ObjectProps)>;

#[derive(Debug, Clone, Default)]
pub struct ServerCache {
    devices: HashMap<String, ObjectProps>,
    classes: HashMap<String, ObjectProps>,
    device_attrs: HashMap<String, AttrTable>,
    class_attrs: HashMap<String, AttrTable>,
}

impl ServerCache {
    pub fn builder() -> ServerCacheBuilder {
        ServerCacheBuilder::default()
    }

    /// Bulk-fetch the snapshot for `server` running on `host`.
    pub fn fetch(store: &PropertyStore, server: &str, host: &str) -> Result<Self, CoreError> {
        let reply = store.bulk_call(OP_BULK, &[server, host])?;
        Self::from_wire(&reply)
    }

    // ── Lookups ─────────────────────────────────────────────────────

    pub fn device_property<S: AsRef<str>>(&self, device: &str, names: &[S]) -> CacheResult<Vec<DbDatum>> {
        let props = lookup_object(&self.devices, CacheKind::Device, device)?;
        Ok(names.iter().map(|n| props.lookup(n.as_ref())).collect())
    }

    pub fn class_property<S: AsRef<str>>(&self, class: &str, names: &[S]) -> CacheResult<Vec<DbDatum>> {
        let props = lookup_object(&self.classes, CacheKind::Class, class)?;
        Ok(names.iter().map(|n| props.lookup(n.as_ref())).collect())
    }

    pub fn device_attribute_property<S: AsRef<str>>(
        &self,
        device: &str,
        attributes: &[S],
    ) -> CacheResult<Vec<AttributeProperties>> {
        lookup_attrs(&self.device_attrs, &self.devices, CacheKind::Device, device, attributes)
    }

    pub fn class_attribute_property<S: AsRef<str>>(
        &self,
        class: &str,
        attributes: &[S],
    ) -> CacheResult<Vec<AttributeProperties>> {
        lookup_attrs(&self.class_attrs, &self.classes, CacheKind::Class, class, attributes)
    }

    pub fn contains_device(&self, device: &str) -> bool {
        let key = device.to_lowercase();
        self.devices.contains_key(&key) || self.device_attrs.contains_key(&key)
    }

    // ── Wire form ───────────────────────────────────────────────────

    pub fn from_wire(reply: &[String]) -> Result<Self, CoreError> {
        let mut reader = WireReader::new(OP_BULK, reply);
        let sections = reader.next_count()?;
        let mut builder = ServerCacheBuilder::default();

        for _ in 0..sections {
            let raw_kind = reader.next_str()?;
            let object = reader.next_str()?.to_owned();
            let count = reader.next_count()?;
            match raw_kind {
                "device" | "class" => {
                    let mut data = Vec::with_capacity(count.min(reply.len()));
                    for _ in 0..count {
                        data.push(reader.next_datum()?);
                    }
                    builder = if raw_kind == "device" {
                        builder.device(&object, data)
                    } else {
                        builder.class(&object, data)
                    };
                }
                "device_attribute" | "class_attribute" => {
                    let mut attrs = Vec::with_capacity(count.min(reply.len()));
                    for _ in 0..count {
                        let attribute = reader.next_str()?.to_owned();
                        let n_props = reader.next_count()?;
                        let mut properties = Vec::with_capacity(n_props.min(reply.len()));
                        for _ in 0..n_props {
                            properties.push(reader.next_datum()?);
                        }
                        attrs.push(AttributeProperties::new(attribute, properties));
                    }
                    builder = if raw_kind == "device_attribute" {
                        builder.device_attribute(&object, attrs)
                    } else {
                        builder.class_attribute(&object, attrs)
                    };
                }
                other => {
                    return Err(CoreError::incoherent(format!(
                        "{OP_BULK}: unknown section kind '{other}'"
                    )));
                }
            }
        }

        if !reader.is_exhausted() {
            return Err(CoreError::incoherent(format!(
                "{OP_BULK}: {} trailing entries after {sections} sections",
                reader.remaining()
            )));
        }
        Ok(builder.build())
    }

    pub fn to_wire(&self) -> Vec<String> {
        let mut sections: Vec<Vec<String>> = Vec::new();
        for (kind, table) in [("device", &self.devices), ("class", &self.classes)] {
            let mut keys: Vec<_> = table.keys().collect();
            keys.sort();
            for key in keys {
                let data = table[key].all();
                let mut out = vec![kind.to_owned(), key.clone(), data.len().to_string()];
                for datum in &data {
                    push_datum(&mut out, datum);
                }
                sections.push(out);
            }
        }
        for (kind, table) in [
            ("device_attribute", &self.device_attrs),
            ("class_attribute", &self.class_attrs),
        ] {
            let mut keys: Vec<_> = table.keys().collect();
            keys.sort();
            for key in keys {
                let attrs = &table[key];
                let mut out = vec![kind.to_owned(), key.clone(), attrs.len().to_string()];
                for (name, props) in attrs.values() {
                    let data = props.all();
                    out.push(name.clone());
                    out.push(data.len().to_string());
                    for datum in &data {
                        push_datum(&mut out, datum);
                    }
                }
                sections.push(out);
            }
        }

        let mut wire = vec![sections.len().to_string()];
        wire.extend(sections.into_iter().flatten());
        wire
    }
}

fn push_datum(out: &mut Vec<String>, datum: &DbDatum) {
    // One-entry block; reuse the codec so the placeholder rule stays in one place.
    let block = devbus_api::wire::encode_properties("", std::slice::from_ref(datum));
    out.extend(block.into_iter().skip(2));
}

fn lookup_object<'a>(
    table: &'a HashMap<String, ObjectProps>,
    kind: CacheKind,
    object: &str,
) -> CacheResult<&'a ObjectProps> {
    if object.is_empty() {
        return Err(CacheError::Other(CoreError::Internal(format!(
            "server cache lookup with an empty {kind} name"
        ))));
    }
    table.get(&object.to_lowercase()).ok_or_else(|| {
        CacheError::NotFound(CacheMiss {
            kind,
            object: object.to_owned(),
        })
    })
}

fn lookup_attrs<S: AsRef<str>>(
    attrs: &HashMap<String, AttrTable>,
    objects: &HashMap<String, ObjectProps>,
    kind: CacheKind,
    object: &str,
    wanted: &[S],
) -> CacheResult<Vec<AttributeProperties>> {
    if object.is_empty() {
        return Err(CacheError::Other(CoreError::Internal(format!(
            "server cache lookup with an empty {kind} name"
        ))));
    }
    let key = object.to_lowercase();
    let table = match attrs.get(&key) {
        Some(table) => Some(table),
        None if objects.contains_key(&key) => None,
        None => {
            return Err(CacheError::NotFound(CacheMiss {
                kind,
                object: object.to_owned(),
            }));
        }
    };

    Ok(wanted
        .iter()
        .map(|attr| {
            let attr = attr.as_ref();
            let properties = table
                .and_then(|t| t.get(&attr.to_lowercase()))
                .map(|(_, props)| props.all())
                .unwrap_or_default();
            AttributeProperties::new(attr, properties)
        })
        .collect())
}

// ── Builder ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ServerCacheBuilder {
    cache: ServerCache,
}

impl ServerCacheBuilder {
    #[must_use]
    pub fn device(mut self, device: &str, data: impl IntoIterator<Item = DbDatum>) -> Self {
        let entry = self.cache.devices.entry(device.to_lowercase()).or_default();
        data.into_iter().for_each(|d| entry.insert(d));
        self
    }

    #[must_use]
    pub fn class(mut self, class: &str, data: impl IntoIterator<Item = DbDatum>) -> Self {
        let entry = self.cache.classes.entry(class.to_lowercase()).or_default();
        data.into_iter().for_each(|d| entry.insert(d));
        self
    }

    #[must_use]
    pub fn device_attribute(
        mut self,
        device: &str,
        attrs: impl IntoIterator<Item = AttributeProperties>,
    ) -> Self {
        let table = self.cache.device_attrs.entry(device.to_lowercase()).or_default();
        merge_attrs(table, attrs);
        self
    }

    #[must_use]
    pub fn class_attribute(
        mut self,
        class: &str,
        attrs: impl IntoIterator<Item = AttributeProperties>,
    ) -> Self {
        let table = self.cache.class_attrs.entry(class.to_lowercase()).or_default();
        merge_attrs(table, attrs);
        self
    }

    pub fn build(self) -> ServerCache {
        self.cache
    }
}

fn merge_attrs(table: &mut AttrTable, attrs: impl IntoIterator<Item = AttributeProperties>) {
    for attr in attrs {
        let (_, props) = table
            .entry(attr.attribute.to_lowercase())
            .or_insert_with(|| (attr.attribute.clone(), ObjectProps::default()));
        attr.properties.into_iter().for_each(|d| props.insert(d));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> ServerCache {
        ServerCache::builder()
            .device(
                "sys/tg/1",
                [DbDatum::with_values("speed", ["10"]), DbDatum::new("empty")],
            )
            .class("TangoTest", [DbDatum::with_values("doc", ["a", "b"])])
            .device_attribute(
                "sys/tg/1",
                [AttributeProperties::new(
                    "temp",
                    vec![DbDatum::with_values("unit", ["C"])],
                )],
            )
            .build()
    }

    #[test]
    fn absent_device_is_a_typed_miss() {
        let err = sample().device_property("sys/tg/2", &["speed"]).unwrap_err();
        match err {
            CacheError::NotFound(miss) => {
                assert_eq!(miss.kind, CacheKind::Device);
                assert_eq!(miss.kind.reason(), Reason::DeviceNotFoundInCache);
            }
            CacheError::Other(other) => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn absent_class_reports_class_miss() {
        let err = sample().class_property("Other", &["doc"]).unwrap_err();
        assert!(matches!(err, CacheError::NotFound(CacheMiss { kind: CacheKind::Class, .. })));
    }

    #[test]
    fn empty_object_name_is_not_a_miss() {
        let err = sample().device_property("", &["speed"]).unwrap_err();
        assert!(matches!(err, CacheError::Other(_)));
    }

    #[test]
    fn unknown_property_of_known_device_is_empty() {
        let got = sample()
            .device_property("SYS/TG/1", &["speed", "nothing", "empty"])
            .unwrap();
        assert_eq!(
            got,
            vec![
                DbDatum::with_values("speed", ["10"]),
                DbDatum::new("nothing"),
                DbDatum::new("empty"),
            ]
        );
    }

    #[test]
    fn attribute_lookup_for_known_device() {
        let got = sample()
            .device_attribute_property("sys/tg/1", &["temp", "other"])
            .unwrap();
        assert_eq!(got[0].properties, vec![DbDatum::with_values("unit", ["C"])]);
        assert!(got[1].properties.is_empty());
    }

    #[test]
    fn wire_form_parses_back() {
        let cache = sample();
        let parsed = ServerCache::from_wire(&cache.to_wire()).unwrap();
        assert_eq!(
            parsed.device_property("sys/tg/1", &["speed", "empty"]).unwrap(),
            cache.device_property("sys/tg/1", &["speed", "empty"]).unwrap()
        );
        assert_eq!(
            parsed.class_property("tangotest", &["doc"]).unwrap(),
            vec![DbDatum::with_values("doc", ["a", "b"])]
        );
    }

    #[test]
    fn malformed_bulk_reply_is_incoherent() {
        let reply: Vec<String> = ["1", "widget", "x", "0"].iter().map(|s| (*s).to_owned()).collect();
        let err = ServerCache::from_wire(&reply).unwrap_err();
        assert_eq!(err.reason(), Reason::IncoherentDbData);

        let truncated: Vec<String> = ["2", "device", "a/b/c", "0"].iter().map(|s| (*s).to_owned()).collect();
        assert!(ServerCache::from_wire(&truncated).is_err());
    }
}
