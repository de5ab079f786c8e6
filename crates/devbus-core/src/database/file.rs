// ── File database ──
//
// A plain-text resource file standing in for the database server:
//
//   # comment
//   MyServer/inst/DEVICE/MyClass: sys/tg/1, sys/tg/2
//   CLASS/MyClass->doc: "free text, with commas"
//   CLASS/MyClass/temp->unit: C
//   sys/tg/1->speed: 1, 2, \
//                    3
//   sys/tg/1/temp->min_alarm: -5
//
// Property operations arrive as the same (operation, payload) pairs the
// remote database answers. Every mutation rewrites the file.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use devbus_api::wire::{
    AttrWireFormat, decode_attribute_properties, decode_properties, encode_attribute_properties,
    encode_properties,
};
use devbus_api::{AttributeProperties, DbDatum, Payload, Reason};

use crate::error::CoreError;

const CLASS_PREFIX: &str = "CLASS/";

// ── Tables ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, PartialEq)]
struct Object {
    name: String,
    props: IndexMap<String, DbDatum>,
}

impl Object {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            props: IndexMap::new(),
        }
    }

    fn set(&mut self, datum: DbDatum) {
        self.props.insert(datum.name.to_lowercase(), datum);
    }

    fn get(&self, name: &str) -> DbDatum {
        self.props.get(&name.to_lowercase()).map_or_else(
            || DbDatum::new(name),
            |d| DbDatum::with_values(name, d.values.iter().cloned()),
        )
    }

    fn remove(&mut self, name: &str) {
        self.props.shift_remove(&name.to_lowercase());
    }
}

/// A device or class: own properties plus per-attribute properties.
#[derive(Debug, Default, Clone, PartialEq)]
struct Owner {
    object: Object,
    attrs: BTreeMap<String, Object>,
}

impl Owner {
    fn attr_mut(&mut self, attr: &str) -> &mut Object {
        self.attrs
            .entry(attr.to_lowercase())
            .or_insert_with(|| Object::named(attr))
    }

    fn is_empty(&self) -> bool {
        self.object.props.is_empty() && self.attrs.values().all(|a| a.props.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ServerDecl {
    name: String,
    classes: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone, Copy)]
enum Scope {
    Device,
    Class,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Tables {
    servers: BTreeMap<String, ServerDecl>,
    classes: BTreeMap<String, Owner>,
    devices: BTreeMap<String, Owner>,
}

impl Tables {
    fn scope(&self, scope: Scope) -> &BTreeMap<String, Owner> {
        match scope {
            Scope::Device => &self.devices,
            Scope::Class => &self.classes,
        }
    }

    fn owner_mut(&mut self, scope: Scope, name: &str) -> &mut Owner {
        let table = match scope {
            Scope::Device => &mut self.devices,
            Scope::Class => &mut self.classes,
        };
        table.entry(name.to_lowercase()).or_insert_with(|| Owner {
            object: Object::named(name),
            attrs: BTreeMap::new(),
        })
    }

    fn prune(&mut self) {
        self.devices.retain(|_, o| !o.is_empty());
        self.classes.retain(|_, o| !o.is_empty());
        for owner in self.devices.values_mut().chain(self.classes.values_mut()) {
            owner.attrs.retain(|_, a| !a.props.is_empty());
        }
    }
}

// ── FileStore ───────────────────────────────────────────────────────

pub struct FileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
    dirty: Mutex<bool>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl FileStore {
    /// Load `path`. A missing file is an empty database; it is created on
    /// the first write.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let tables = match fs::read_to_string(path) {
            Ok(text) => parse(path, &text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => {
                return Err(CoreError::config(
                    Reason::DatabaseFileError,
                    format!("cannot read {}: {e}", path.display()),
                ));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            tables: Mutex::new(tables),
            dirty: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file from the in-memory tables.
    pub fn flush(&self) -> Result<(), CoreError> {
        let text = render(&self.tables.lock());
        fs::write(&self.path, text).map_err(|e| {
            CoreError::config(
                Reason::DatabaseFileError,
                format!("cannot write {}: {e}", self.path.display()),
            )
        })?;
        *self.dirty.lock() = false;
        debug!(path = %self.path.display(), "file database written");
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut Tables)) -> Result<Payload, CoreError> {
        {
            let mut tables = self.tables.lock();
            f(&mut tables);
            tables.prune();
        }
        *self.dirty.lock() = true;
        self.flush()?;
        Ok(Payload::Void)
    }

    // ── Request dispatch ────────────────────────────────────────────

    pub(crate) fn execute(&self, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        match operation {
            "DbGetDeviceProperty" => self.get_props(Scope::Device, operation, payload),
            "DbGetClassProperty" => self.get_props(Scope::Class, operation, payload),
            "DbPutDeviceProperty" => self.put_props(Scope::Device, operation, payload),
            "DbPutClassProperty" => self.put_props(Scope::Class, operation, payload),
            "DbDeleteDeviceProperty" => self.delete_props(Scope::Device, operation, payload),
            "DbDeleteClassProperty" => self.delete_props(Scope::Class, operation, payload),

            "DbGetDeviceAttributeProperty2" => self.get_attr_props(Scope::Device, operation, payload),
            "DbGetClassAttributeProperty2" => self.get_attr_props(Scope::Class, operation, payload),
            "DbPutDeviceAttributeProperty2" => self.put_attr_props(Scope::Device, operation, payload),
            "DbPutClassAttributeProperty2" => self.put_attr_props(Scope::Class, operation, payload),
            "DbDeleteDeviceAttributeProperty" => self.delete_attr_props(Scope::Device, operation, payload),
            "DbDeleteClassAttributeProperty" => self.delete_attr_props(Scope::Class, operation, payload),
            "DbDeleteAllDeviceAttributeProperty" => self.delete_all_attr_props(operation, payload),

            "DbGetDeviceClassList" => self.device_class_list(operation, payload),
            "DbGetClassforDevice" => self.class_for_device(operation, payload),
            "DbGetServices" => Ok(Payload::Strings(Vec::new())),

            other => Err(CoreError::Unsupported {
                message: format!("{other} is not available with a file database"),
            }),
        }
    }

    fn get_props(&self, scope: Scope, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let request = payload.into_strings(operation)?;
        let (object, names) = split_request(operation, &request)?;
        let tables = self.tables.lock();
        let owner = tables.scope(scope).get(&object.to_lowercase());
        let data: Vec<DbDatum> = names
            .iter()
            .map(|n| owner.map_or_else(|| DbDatum::new(n.as_str()), |o| o.object.get(n)))
            .collect();
        Ok(Payload::Strings(encode_properties(object, &data)))
    }

    fn put_props(&self, scope: Scope, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let block = decode_properties(operation, &payload.into_strings(operation)?)?;
        self.mutate(|tables| {
            let owner = tables.owner_mut(scope, &block.object);
            block.data.into_iter().for_each(|d| owner.object.set(d));
        })
    }

    fn delete_props(&self, scope: Scope, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let request = payload.into_strings(operation)?;
        let (object, names) = split_request(operation, &request)?;
        self.mutate(|tables| {
            let owner = tables.owner_mut(scope, object);
            names.iter().for_each(|n| owner.object.remove(n));
        })
    }

    fn get_attr_props(&self, scope: Scope, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let request = payload.into_strings(operation)?;
        let (object, attrs) = split_request(operation, &request)?;
        let tables = self.tables.lock();
        let owner = tables.scope(scope).get(&object.to_lowercase());
        let found: Vec<AttributeProperties> = attrs
            .iter()
            .map(|attr| {
                let props = owner
                    .and_then(|o| o.attrs.get(&attr.to_lowercase()))
                    .map(|a| a.props.values().cloned().collect())
                    .unwrap_or_default();
                AttributeProperties::new(attr.as_str(), props)
            })
            .collect();
        Ok(Payload::Strings(encode_attribute_properties(
            object,
            &found,
            AttrWireFormat::MultiValue,
        )))
    }

    fn put_attr_props(&self, scope: Scope, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let request = payload.into_strings(operation)?;
        let block = decode_attribute_properties(operation, &request, AttrWireFormat::MultiValue)?;
        self.mutate(|tables| {
            let owner = tables.owner_mut(scope, &block.object);
            for attr in block.attributes {
                let target = owner.attr_mut(&attr.attribute);
                attr.properties.into_iter().for_each(|d| target.set(d));
            }
        })
    }

    /// `[object, attr, prop...]`
    fn delete_attr_props(&self, scope: Scope, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let request = payload.into_strings(operation)?;
        let (object, rest) = split_request(operation, &request)?;
        let Some((attr, names)) = rest.split_first() else {
            return Err(CoreError::incoherent(format!("{operation}: missing attribute name")));
        };
        self.mutate(|tables| {
            let target = tables.owner_mut(scope, object).attr_mut(attr);
            names.iter().for_each(|n| target.remove(n));
        })
    }

    /// `[device, attr...]`
    fn delete_all_attr_props(&self, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let request = payload.into_strings(operation)?;
        let (object, attrs) = split_request(operation, &request)?;
        self.mutate(|tables| {
            let owner = tables.owner_mut(Scope::Device, object);
            attrs.iter().for_each(|a| {
                owner.attrs.remove(&a.to_lowercase());
            });
        })
    }

    fn device_class_list(&self, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let server = payload.into_str(operation)?;
        let tables = self.tables.lock();
        let mut flat = Vec::new();
        if let Some(decl) = tables.servers.get(&server.to_lowercase()) {
            for (class, devices) in &decl.classes {
                for device in devices {
                    flat.push(device.clone());
                    flat.push(class.clone());
                }
            }
        }
        Ok(Payload::Strings(flat))
    }

    fn class_for_device(&self, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        let device = payload.into_str(operation)?;
        let tables = self.tables.lock();
        tables
            .servers
            .values()
            .flat_map(|decl| decl.classes.iter())
            .find(|(_, devices)| devices.iter().any(|d| d.eq_ignore_ascii_case(&device)))
            .map(|(class, _)| Payload::Str(class.clone()))
            .ok_or_else(|| {
                CoreError::not_found(
                    Reason::DeviceNotDefined,
                    format!("Device {device} is not declared in the file database"),
                )
            })
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if *self.dirty.lock() {
            if let Err(e) = self.flush() {
                warn!(error = %e, "file database not saved");
            }
        }
    }
}

fn split_request<'a>(operation: &str, request: &'a [String]) -> Result<(&'a str, &'a [String]), CoreError> {
    request
        .split_first()
        .map(|(object, rest)| (object.as_str(), rest))
        .ok_or_else(|| CoreError::incoherent(format!("{operation}: empty request")))
}

// ── Parsing ─────────────────────────────────────────────────────────

fn parse(path: &Path, text: &str) -> Result<Tables, CoreError> {
    let mut tables = Tables::default();
    for (line_no, line) in logical_lines(text) {
        parse_line(&mut tables, &line).map_err(|msg| {
            CoreError::config(
                Reason::DatabaseFileError,
                format!("{}:{line_no}: {msg}", path.display()),
            )
        })?;
    }
    Ok(tables)
}

/// Joins `\`-continued lines and drops blanks and comments. Yields the
/// number of the first physical line of each logical line.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if pending.is_none() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }
        let (continues, content) = match trimmed.strip_suffix('\\') {
            Some(head) => (true, head),
            None => (false, trimmed),
        };
        let entry = pending.get_or_insert_with(|| (idx + 1, String::new()));
        entry.1.push_str(content);
        if !continues {
            out.extend(pending.take());
        }
    }
    out.extend(pending);
    out
}

fn parse_line(tables: &mut Tables, line: &str) -> Result<(), String> {
    let Some((key, rest)) = line.split_once(':') else {
        return Err("expected `name: values`".into());
    };
    let key = key.trim();
    let values = parse_values(rest)?;

    if let Some((object, prop)) = key.split_once("->") {
        let (object, prop) = (object.trim(), prop.trim());
        if prop.is_empty() {
            return Err("empty property name".into());
        }
        let datum = DbDatum::with_values(prop, values);

        let class_part = object
            .get(..CLASS_PREFIX.len())
            .filter(|head| head.eq_ignore_ascii_case(CLASS_PREFIX))
            .map(|_| &object[CLASS_PREFIX.len()..]);
        if let Some(class_part) = class_part {
            match class_part.split_once('/') {
                Some((class, attr)) => tables.owner_mut(Scope::Class, class).attr_mut(attr).set(datum),
                None => tables.owner_mut(Scope::Class, class_part).object.set(datum),
            }
            return Ok(());
        }

        match object.matches('/').count() {
            2 => tables.owner_mut(Scope::Device, object).object.set(datum),
            3 => {
                let Some((device, attr)) = object.rsplit_once('/') else {
                    return Err(format!("bad attribute name '{object}'"));
                };
                tables.owner_mut(Scope::Device, device).attr_mut(attr).set(datum);
            }
            _ => return Err(format!("'{object}' is neither a device nor a device attribute")),
        }
        return Ok(());
    }

    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [exec, instance, marker, class] if marker.eq_ignore_ascii_case("DEVICE") => {
            let server = format!("{exec}/{instance}");
            let decl = tables
                .servers
                .entry(server.to_lowercase())
                .or_insert_with(|| ServerDecl {
                    name: server.clone(),
                    classes: Vec::new(),
                });
            decl.classes.push(((*class).to_owned(), values));
            Ok(())
        }
        _ => Err(format!("unrecognised entry '{key}'")),
    }
}

/// Comma-separated values; double quotes protect commas, `\` escapes
/// inside quotes.
fn parse_values(raw: &str) -> Result<Vec<String>, String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                was_quoted = true;
            }
            '\\' if quoted => current.extend(chars.next()),
            ',' if !quoted => {
                push_value(&mut values, &current, was_quoted);
                current.clear();
                was_quoted = false;
            }
            c if quoted => current.push(c),
            c if c.is_whitespace() && (current.is_empty() || was_quoted) => {}
            c => current.push(c),
        }
    }
    if quoted {
        return Err("unterminated quote".into());
    }
    push_value(&mut values, &current, was_quoted);
    Ok(values)
}

fn push_value(values: &mut Vec<String>, current: &str, was_quoted: bool) {
    if was_quoted {
        values.push(current.to_owned());
    } else {
        let trimmed = current.trim_end();
        if !trimmed.is_empty() {
            values.push(trimmed.to_owned());
        }
    }
}

// ── Rendering ───────────────────────────────────────────────────────

fn render(tables: &Tables) -> String {
    let mut out = String::from("# devbus file database\n");

    for decl in tables.servers.values() {
        for (class, devices) in &decl.classes {
            let _ = writeln!(out, "{}/DEVICE/{class}: {}", decl.name, join_values(devices));
        }
    }
    for owner in tables.classes.values() {
        let class = &owner.object.name;
        for datum in owner.object.props.values() {
            let _ = writeln!(out, "{CLASS_PREFIX}{class}->{}: {}", datum.name, join_values(&datum.values));
        }
        for attr in owner.attrs.values() {
            for datum in attr.props.values() {
                let _ = writeln!(
                    out,
                    "{CLASS_PREFIX}{class}/{}->{}: {}",
                    attr.name,
                    datum.name,
                    join_values(&datum.values)
                );
            }
        }
    }
    for owner in tables.devices.values() {
        let device = owner.object.name.to_lowercase();
        for datum in owner.object.props.values() {
            let _ = writeln!(out, "{device}->{}: {}", datum.name, join_values(&datum.values));
        }
        for attr in owner.attrs.values() {
            for datum in attr.props.values() {
                let _ = writeln!(
                    out,
                    "{device}/{}->{}: {}",
                    attr.name,
                    datum.name,
                    join_values(&datum.values)
                );
            }
        }
    }
    out
}

fn join_values(values: &[String]) -> String {
    values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(", ")
}

fn quote(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.contains([',', '"', '\\', '#'])
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    if !needs_quotes {
        return value.to_owned();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"
# servers
TangoTest/test/DEVICE/TangoTest: sys/tg/1, \
                                 sys/tg/2
CLASS/TangoTest->doc: "free text, with commas"
CLASS/TangoTest/ampli->unit: V
sys/tg/1->speed: 1, 2, \
                 3
sys/tg/1->mode: auto
sys/tg/1/ampli->min_alarm: -5
"#;

    fn tables() -> Tables {
        parse(Path::new("sample.res"), SAMPLE).unwrap()
    }

    #[test]
    fn parses_every_entry_kind() {
        let t = tables();
        assert_eq!(
            t.devices["sys/tg/1"].object.get("speed").values,
            vec!["1", "2", "3"]
        );
        assert_eq!(
            t.classes["tangotest"].object.get("doc").values,
            vec!["free text, with commas"]
        );
        assert_eq!(t.classes["tangotest"].attrs["ampli"].get("unit").values, vec!["V"]);
        assert_eq!(t.devices["sys/tg/1"].attrs["ampli"].get("min_alarm").values, vec!["-5"]);
        assert_eq!(
            t.servers["tangotest/test"].classes,
            vec![("TangoTest".to_owned(), vec!["sys/tg/1".to_owned(), "sys/tg/2".to_owned()])]
        );
    }

    #[test]
    fn rendered_file_parses_to_same_tables() {
        let t = tables();
        let again = parse(Path::new("again.res"), &render(&t)).unwrap();
        assert_eq!(again, t);
    }

    #[test]
    fn syntax_errors_name_the_line() {
        let err = parse(Path::new("bad.res"), "\n\nsys/tg/1 speed 3\n").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("bad.res:3"));
    }

    #[test]
    fn quoted_values_keep_special_characters() {
        assert_eq!(
            parse_values(r#" "a, b", "say \"hi\"", "" , c "#).unwrap(),
            vec!["a, b", "say \"hi\"", "", "c"]
        );
        assert_eq!(quote("a, b"), r#""a, b""#);
        assert!(parse_values(r#""open"#).is_err());
    }

    #[test]
    fn writes_go_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.res");
        let store = FileStore::open(&path).unwrap();
        store
            .execute(
                "DbPutDeviceProperty",
                Payload::Strings(encode_properties("a/b/c", &[DbDatum::with_values("p", ["x, y"])])),
            )
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains(r#"a/b/c->p: "x, y""#));

        let reopened = FileStore::open(&path).unwrap();
        let reply = reopened
            .execute("DbGetDeviceProperty", Payload::strings(["a/b/c", "p"]))
            .unwrap();
        assert_eq!(reply, Payload::strings(["a/b/c", "1", "p", "1", "x, y"]));
    }

    #[test]
    fn unknown_operations_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("db.res")).unwrap();
        let err = store.execute("DbGetDeviceAlias", Payload::Str("x".into())).unwrap_err();
        assert_eq!(err.reason(), Reason::NotSupported);
    }
}
