//! Database client.
//!
//! [`PropertyStore`] resolves names and performs property CRUD against the
//! remote database device, or against a local resource file when the
//! connection spec is file-backed. Reads consult an attached
//! [`ServerCache`] first and fall back to the live call on a typed miss;
//! writes always go to the backend.
//!
//! The remote protocol generation is probed once at connect time and
//! decides which attribute-property operation names and layouts are used.

mod access;
mod cache;
mod file;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use devbus_api::wire::{
    AttrWireFormat, decode_attribute_properties, decode_properties, encode_attribute_properties,
    encode_properties, encode_query,
};
use devbus_api::{
    AttributeProperties, ConnectionSpec, DEFAULT_TIMEOUT, DbDatum, Location, Payload, Reason,
    TimeoutGuard, Transport,
};

use crate::error::CoreError;

pub use access::{AccessDecision, PolicyService, TransportPolicyService};
pub use cache::{CacheError, CacheKind, CacheMiss, CacheResult, ServerCache, ServerCacheBuilder};
pub use file::FileStore;

use access::AccessState;

/// Name of the database device itself.
pub const DB_DEVICE_NAME: &str = "sys/database/2";

/// Protocol generations the probe can detect.
pub const SERVER_VERSION_BASE: u32 = 210;
pub const SERVER_VERSION_ATTR_V2: u32 = 230;
pub const SERVER_VERSION_CURRENT: u32 = 400;

// ── Operation names ─────────────────────────────────────────────────

const OP_COMMAND_QUERY: &str = "CommandQuery";

const OP_GET_DEVICE_PROPERTY: &str = "DbGetDeviceProperty";
const OP_PUT_DEVICE_PROPERTY: &str = "DbPutDeviceProperty";
const OP_DELETE_DEVICE_PROPERTY: &str = "DbDeleteDeviceProperty";
const OP_GET_CLASS_PROPERTY: &str = "DbGetClassProperty";
const OP_PUT_CLASS_PROPERTY: &str = "DbPutClassProperty";
const OP_DELETE_CLASS_PROPERTY: &str = "DbDeleteClassProperty";
const OP_GET_PROPERTY: &str = "DbGetProperty";
const OP_PUT_PROPERTY: &str = "DbPutProperty";
const OP_DELETE_PROPERTY: &str = "DbDeleteProperty";

const OP_GET_DEVICE_ATTR_PROPERTY: &str = "DbGetDeviceAttributeProperty";
const OP_GET_DEVICE_ATTR_PROPERTY2: &str = "DbGetDeviceAttributeProperty2";
const OP_PUT_DEVICE_ATTR_PROPERTY: &str = "DbPutDeviceAttributeProperty";
const OP_PUT_DEVICE_ATTR_PROPERTY2: &str = "DbPutDeviceAttributeProperty2";
const OP_DELETE_DEVICE_ATTR_PROPERTY: &str = "DbDeleteDeviceAttributeProperty";
const OP_DELETE_ALL_DEVICE_ATTR_PROPERTY: &str = "DbDeleteAllDeviceAttributeProperty";
const OP_GET_CLASS_ATTR_PROPERTY: &str = "DbGetClassAttributeProperty";
const OP_GET_CLASS_ATTR_PROPERTY2: &str = "DbGetClassAttributeProperty2";
const OP_PUT_CLASS_ATTR_PROPERTY: &str = "DbPutClassAttributeProperty";
const OP_PUT_CLASS_ATTR_PROPERTY2: &str = "DbPutClassAttributeProperty2";
const OP_DELETE_CLASS_ATTR_PROPERTY: &str = "DbDeleteClassAttributeProperty";

const OP_GET_DEVICE_PIPE_PROPERTY: &str = "DbGetDevicePipeProperty";
const OP_PUT_DEVICE_PIPE_PROPERTY: &str = "DbPutDevicePipeProperty";
const OP_DELETE_DEVICE_PIPE_PROPERTY: &str = "DbDeleteDevicePipeProperty";
const OP_GET_CLASS_PIPE_PROPERTY: &str = "DbGetClassPipeProperty";
const OP_PUT_CLASS_PIPE_PROPERTY: &str = "DbPutClassPipeProperty";
const OP_DELETE_CLASS_PIPE_PROPERTY: &str = "DbDeleteClassPipeProperty";

const OP_GET_DEVICE_ALIAS: &str = "DbGetDeviceAlias";
const OP_GET_ALIAS_DEVICE: &str = "DbGetAliasDevice";
const OP_GET_ATTRIBUTE_ALIAS: &str = "DbGetAttributeAlias";
const OP_PUT_DEVICE_ALIAS: &str = "DbPutDeviceAlias";
const OP_DELETE_DEVICE_ALIAS: &str = "DbDeleteDeviceAlias";

const OP_GET_CLASS_FOR_DEVICE: &str = "DbGetClassforDevice";
const OP_GET_SERVICES: &str = "DbGetServices";
const OP_GET_DEVICE_EXPORTED: &str = "DbGetDeviceExportedList";
const OP_GET_DEVICE_CLASS_LIST: &str = "DbGetDeviceClassList";

/// Probes from newest to oldest generation. The first operation the server
/// knows decides the version.
const VERSION_PROBES: [(&str, u32); 2] = [
    (OP_DELETE_ALL_DEVICE_ATTR_PROPERTY, SERVER_VERSION_CURRENT),
    (OP_GET_DEVICE_ATTR_PROPERTY2, SERVER_VERSION_ATTR_V2),
];

// ── Options ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Enforce the access-control service on database writes.
    pub access_control: bool,
    /// Timeout applied while probing the server version.
    pub request_timeout: Duration,
    /// Timeout applied while talking to the access-control service.
    pub access_check_timeout: Duration,
    /// Host name reported to the access-control service.
    pub client_host: String,
    /// Overrides the access-control service device found in the database.
    pub access_device: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            access_control: true,
            request_timeout: DEFAULT_TIMEOUT,
            access_check_timeout: DEFAULT_TIMEOUT,
            client_host: "localhost".into(),
            access_device: None,
        }
    }
}

enum Backend {
    Remote {
        transport: Arc<dyn Transport>,
        location: Location,
    },
    File(Arc<FileStore>),
}

// ── PropertyStore ───────────────────────────────────────────────────

pub struct PropertyStore {
    spec: ConnectionSpec,
    backend: Backend,
    server_version: u32,
    options: StoreOptions,
    access: RwLock<AccessState>,
    device_class_cache: DashMap<String, String>,
    server_cache: RwLock<Option<Arc<ServerCache>>>,
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("location", &self.location())
            .field("server_version", &self.server_version)
            .field("file_backed", &self.is_file_backed())
            .finish_non_exhaustive()
    }
}

impl PropertyStore {
    /// Connect to the database named by `spec`. A file-backed spec opens
    /// the resource file instead and never touches `transport`.
    pub fn connect(
        spec: ConnectionSpec,
        transport: Arc<dyn Transport>,
        options: StoreOptions,
    ) -> Result<Self, CoreError> {
        if spec.is_file_backed {
            let path = spec.file_path.clone().ok_or_else(|| {
                CoreError::config(Reason::DatabaseFileError, "file-backed spec without a path")
            })?;
            return Self::open_file_with(path, options);
        }

        let location = spec.db_location();
        let server_version = probe_server_version(transport.as_ref(), &location, options.request_timeout);
        info!(location = %location, server_version, "connected to database");

        Ok(Self {
            spec,
            backend: Backend::Remote {
                transport,
                location,
            },
            server_version,
            options,
            access: RwLock::new(AccessState::default()),
            device_class_cache: DashMap::new(),
            server_cache: RwLock::new(None),
        })
    }

    /// Use a local resource file as the database.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Self::open_file_with(path, StoreOptions::default())
    }

    fn open_file_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, CoreError> {
        let file = FileStore::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "using file database");
        Ok(Self {
            spec: ConnectionSpec::file(path),
            backend: Backend::File(Arc::new(file)),
            server_version: SERVER_VERSION_CURRENT,
            options,
            access: RwLock::new(AccessState::default()),
            device_class_cache: DashMap::new(),
            server_cache: RwLock::new(None),
        })
    }

    // ── Identity ────────────────────────────────────────────────────

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub fn server_version(&self) -> u32 {
        self.server_version
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.backend, Backend::File(_))
    }

    pub fn file_store(&self) -> Option<&Arc<FileStore>> {
        match &self.backend {
            Backend::File(file) => Some(file),
            Backend::Remote { .. } => None,
        }
    }

    /// Address of the database device: a single `tango://host:port/...`
    /// location, a multi-endpoint location list, or the resource file path.
    pub fn location(&self) -> String {
        match &self.backend {
            Backend::Remote { location, .. } => location.to_string(),
            Backend::File(file) => file.path().display().to_string(),
        }
    }

    pub fn dev_name(&self) -> &'static str {
        DB_DEVICE_NAME
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub(crate) fn transport(&self) -> Option<&Arc<dyn Transport>> {
        match &self.backend {
            Backend::Remote { transport, .. } => Some(transport),
            Backend::File(_) => None,
        }
    }

    // ── Server cache ────────────────────────────────────────────────

    pub fn set_server_cache(&self, cache: Arc<ServerCache>) {
        *self.server_cache.write() = Some(cache);
    }

    pub fn clear_server_cache(&self) {
        *self.server_cache.write() = None;
    }

    /// The attached snapshot. Never consulted in file mode.
    pub fn server_cache(&self) -> Option<Arc<ServerCache>> {
        if self.is_file_backed() {
            return None;
        }
        self.server_cache.read().clone()
    }

    /// Fetch and attach the snapshot for `server`. A failed fetch is logged
    /// and leaves the store in uncached mode.
    pub fn fill_server_cache(&self, server: &str, host: &str) -> bool {
        if self.is_file_backed() {
            return false;
        }
        match ServerCache::fetch(self, server, host) {
            Ok(cache) => {
                debug!(server, host, "server cache filled");
                self.set_server_cache(Arc::new(cache));
                true
            }
            Err(e) => {
                warn!(server, host, error = %e, "server cache unavailable, using the database directly");
                false
            }
        }
    }

    // ── Backend plumbing ────────────────────────────────────────────

    fn call(&self, operation: &str, payload: Payload) -> Result<Payload, CoreError> {
        match &self.backend {
            Backend::Remote {
                transport,
                location,
            } => Ok(transport.invoke(location, operation, payload)?),
            Backend::File(file) => file.execute(operation, payload),
        }
    }

    fn call_strings(&self, operation: &str, request: Vec<String>) -> Result<Vec<String>, CoreError> {
        Ok(self
            .call(operation, Payload::Strings(request))?
            .into_strings(operation)?)
    }

    pub(crate) fn bulk_call(&self, operation: &str, args: &[&str]) -> Result<Vec<String>, CoreError> {
        self.call_strings(operation, args.iter().map(|a| (*a).to_owned()).collect())
    }

    fn call_str(&self, operation: &str, arg: &str) -> Result<String, CoreError> {
        Ok(self
            .call(operation, Payload::Str(arg.to_owned()))?
            .into_str(operation)?)
    }

    fn get_block<S: AsRef<str>>(
        &self,
        operation: &str,
        object: &str,
        names: &[S],
    ) -> Result<Vec<DbDatum>, CoreError> {
        let reply = self.call_strings(operation, encode_query(object, names))?;
        Ok(decode_properties(operation, &reply)?.data)
    }

    fn put_block(&self, operation: &str, object: &str, data: &[DbDatum]) -> Result<(), CoreError> {
        self.ensure_writable(operation)?;
        self.call(operation, Payload::Strings(encode_properties(object, data)))?;
        Ok(())
    }

    fn delete_block<S: AsRef<str>>(&self, operation: &str, object: &str, names: &[S]) -> Result<(), CoreError> {
        self.ensure_writable(operation)?;
        self.call(operation, Payload::Strings(encode_query(object, names)))?;
        Ok(())
    }

    fn get_nested<S: AsRef<str>>(
        &self,
        operation: &str,
        object: &str,
        names: &[S],
        format: AttrWireFormat,
    ) -> Result<Vec<AttributeProperties>, CoreError> {
        let reply = self.call_strings(operation, encode_query(object, names))?;
        Ok(decode_attribute_properties(operation, &reply, format)?.attributes)
    }

    fn put_nested(
        &self,
        operation: &str,
        object: &str,
        items: &[AttributeProperties],
        format: AttrWireFormat,
    ) -> Result<(), CoreError> {
        self.ensure_writable(operation)?;
        let request = encode_attribute_properties(object, items, format);
        self.call(operation, Payload::Strings(request))?;
        Ok(())
    }

    /// One `[object, item, prop...]` call per attribute or pipe.
    fn delete_nested(&self, operation: &str, object: &str, items: &[AttributeProperties]) -> Result<(), CoreError> {
        self.ensure_writable(operation)?;
        for item in items {
            let mut request = vec![object.to_owned(), item.attribute.clone()];
            request.extend(item.properties.iter().map(|p| p.name.clone()));
            self.call(operation, Payload::Strings(request))?;
        }
        Ok(())
    }

    /// Operation name and layout for attribute properties on this server.
    fn attr_variant(&self, v1: &'static str, v2: &'static str) -> (&'static str, AttrWireFormat) {
        if self.server_version >= SERVER_VERSION_ATTR_V2 {
            (v2, AttrWireFormat::MultiValue)
        } else {
            (v1, AttrWireFormat::SingleValue)
        }
    }

    // ── Device properties ───────────────────────────────────────────

    pub fn get_device_property<S: AsRef<str>>(&self, device: &str, names: &[S]) -> Result<Vec<DbDatum>, CoreError> {
        if let Some(cache) = self.server_cache() {
            match cache.device_property(device, names) {
                Ok(data) => return Ok(data),
                Err(CacheError::NotFound(miss)) => debug!(device, %miss, "cache miss, asking the database"),
                Err(CacheError::Other(e)) => return Err(e),
            }
        }
        self.get_block(OP_GET_DEVICE_PROPERTY, device, names)
    }

    pub fn put_device_property(&self, device: &str, data: &[DbDatum]) -> Result<(), CoreError> {
        self.put_block(OP_PUT_DEVICE_PROPERTY, device, data)
    }

    pub fn delete_device_property<S: AsRef<str>>(&self, device: &str, names: &[S]) -> Result<(), CoreError> {
        self.delete_block(OP_DELETE_DEVICE_PROPERTY, device, names)
    }

    // ── Class properties ────────────────────────────────────────────

    pub fn get_class_property<S: AsRef<str>>(&self, class: &str, names: &[S]) -> Result<Vec<DbDatum>, CoreError> {
        if let Some(cache) = self.server_cache() {
            match cache.class_property(class, names) {
                Ok(data) => return Ok(data),
                Err(CacheError::NotFound(miss)) => debug!(class, %miss, "cache miss, asking the database"),
                Err(CacheError::Other(e)) => return Err(e),
            }
        }
        self.get_block(OP_GET_CLASS_PROPERTY, class, names)
    }

    pub fn put_class_property(&self, class: &str, data: &[DbDatum]) -> Result<(), CoreError> {
        self.put_block(OP_PUT_CLASS_PROPERTY, class, data)
    }

    pub fn delete_class_property<S: AsRef<str>>(&self, class: &str, names: &[S]) -> Result<(), CoreError> {
        self.delete_block(OP_DELETE_CLASS_PROPERTY, class, names)
    }

    // ── Free-object properties ──────────────────────────────────────

    pub fn get_property<S: AsRef<str>>(&self, object: &str, names: &[S]) -> Result<Vec<DbDatum>, CoreError> {
        self.get_block(OP_GET_PROPERTY, object, names)
    }

    pub fn put_property(&self, object: &str, data: &[DbDatum]) -> Result<(), CoreError> {
        self.put_block(OP_PUT_PROPERTY, object, data)
    }

    pub fn delete_property<S: AsRef<str>>(&self, object: &str, names: &[S]) -> Result<(), CoreError> {
        self.delete_block(OP_DELETE_PROPERTY, object, names)
    }

    // ── Device attribute properties ─────────────────────────────────

    pub fn get_device_attribute_property<S: AsRef<str>>(
        &self,
        device: &str,
        attributes: &[S],
    ) -> Result<Vec<AttributeProperties>, CoreError> {
        if let Some(cache) = self.server_cache() {
            match cache.device_attribute_property(device, attributes) {
                Ok(data) => return Ok(data),
                Err(CacheError::NotFound(miss)) => debug!(device, %miss, "cache miss, asking the database"),
                Err(CacheError::Other(e)) => return Err(e),
            }
        }
        let (op, format) = self.attr_variant(OP_GET_DEVICE_ATTR_PROPERTY, OP_GET_DEVICE_ATTR_PROPERTY2);
        self.get_nested(op, device, attributes, format)
    }

    pub fn put_device_attribute_property(
        &self,
        device: &str,
        attributes: &[AttributeProperties],
    ) -> Result<(), CoreError> {
        let (op, format) = self.attr_variant(OP_PUT_DEVICE_ATTR_PROPERTY, OP_PUT_DEVICE_ATTR_PROPERTY2);
        self.put_nested(op, device, attributes, format)
    }

    /// Delete the named properties of each attribute.
    pub fn delete_device_attribute_property(
        &self,
        device: &str,
        attributes: &[AttributeProperties],
    ) -> Result<(), CoreError> {
        self.delete_nested(OP_DELETE_DEVICE_ATTR_PROPERTY, device, attributes)
    }

    /// Delete every property of the given attributes in one call.
    pub fn delete_all_device_attribute_property<S: AsRef<str>>(
        &self,
        device: &str,
        attributes: &[S],
    ) -> Result<(), CoreError> {
        if self.server_version < SERVER_VERSION_CURRENT {
            return Err(CoreError::Unsupported {
                message: format!(
                    "{OP_DELETE_ALL_DEVICE_ATTR_PROPERTY} needs database server version {SERVER_VERSION_CURRENT}, found {}",
                    self.server_version
                ),
            });
        }
        self.delete_block(OP_DELETE_ALL_DEVICE_ATTR_PROPERTY, device, attributes)
    }

    // ── Class attribute properties ──────────────────────────────────

    pub fn get_class_attribute_property<S: AsRef<str>>(
        &self,
        class: &str,
        attributes: &[S],
    ) -> Result<Vec<AttributeProperties>, CoreError> {
        if let Some(cache) = self.server_cache() {
            match cache.class_attribute_property(class, attributes) {
                Ok(data) => return Ok(data),
                Err(CacheError::NotFound(miss)) => debug!(class, %miss, "cache miss, asking the database"),
                Err(CacheError::Other(e)) => return Err(e),
            }
        }
        let (op, format) = self.attr_variant(OP_GET_CLASS_ATTR_PROPERTY, OP_GET_CLASS_ATTR_PROPERTY2);
        self.get_nested(op, class, attributes, format)
    }

    pub fn put_class_attribute_property(
        &self,
        class: &str,
        attributes: &[AttributeProperties],
    ) -> Result<(), CoreError> {
        let (op, format) = self.attr_variant(OP_PUT_CLASS_ATTR_PROPERTY, OP_PUT_CLASS_ATTR_PROPERTY2);
        self.put_nested(op, class, attributes, format)
    }

    pub fn delete_class_attribute_property(
        &self,
        class: &str,
        attributes: &[AttributeProperties],
    ) -> Result<(), CoreError> {
        self.delete_nested(OP_DELETE_CLASS_ATTR_PROPERTY, class, attributes)
    }

    // ── Pipe properties ─────────────────────────────────────────────

    pub fn get_device_pipe_property<S: AsRef<str>>(
        &self,
        device: &str,
        pipes: &[S],
    ) -> Result<Vec<AttributeProperties>, CoreError> {
        self.get_nested(OP_GET_DEVICE_PIPE_PROPERTY, device, pipes, AttrWireFormat::MultiValue)
    }

    pub fn put_device_pipe_property(&self, device: &str, pipes: &[AttributeProperties]) -> Result<(), CoreError> {
        self.put_nested(OP_PUT_DEVICE_PIPE_PROPERTY, device, pipes, AttrWireFormat::MultiValue)
    }

    pub fn delete_device_pipe_property(&self, device: &str, pipes: &[AttributeProperties]) -> Result<(), CoreError> {
        self.delete_nested(OP_DELETE_DEVICE_PIPE_PROPERTY, device, pipes)
    }

    pub fn get_class_pipe_property<S: AsRef<str>>(
        &self,
        class: &str,
        pipes: &[S],
    ) -> Result<Vec<AttributeProperties>, CoreError> {
        self.get_nested(OP_GET_CLASS_PIPE_PROPERTY, class, pipes, AttrWireFormat::MultiValue)
    }

    pub fn put_class_pipe_property(&self, class: &str, pipes: &[AttributeProperties]) -> Result<(), CoreError> {
        self.put_nested(OP_PUT_CLASS_PIPE_PROPERTY, class, pipes, AttrWireFormat::MultiValue)
    }

    pub fn delete_class_pipe_property(&self, class: &str, pipes: &[AttributeProperties]) -> Result<(), CoreError> {
        self.delete_nested(OP_DELETE_CLASS_PIPE_PROPERTY, class, pipes)
    }

    // ── Aliases ─────────────────────────────────────────────────────
    //
    // A missing alias is reported as incoherent data, which is what
    // existing clients match on.

    pub fn get_device_alias(&self, device: &str) -> Result<String, CoreError> {
        self.alias_lookup(OP_GET_DEVICE_ALIAS, device, "No alias found for device")
    }

    pub fn get_alias_device(&self, alias: &str) -> Result<String, CoreError> {
        self.alias_lookup(OP_GET_ALIAS_DEVICE, alias, "No device found for alias")
    }

    pub fn get_attribute_alias(&self, alias: &str) -> Result<String, CoreError> {
        self.alias_lookup(OP_GET_ATTRIBUTE_ALIAS, alias, "No attribute found for alias")
    }

    fn alias_lookup(&self, operation: &str, key: &str, missing: &str) -> Result<String, CoreError> {
        match self.call_str(operation, key) {
            Ok(found) if found.trim().is_empty() => Err(CoreError::incoherent(format!("{missing} {key}"))),
            Ok(found) => Ok(found),
            Err(e) if e.has_reason(&Reason::AliasNotDefined) || e.has_reason(&Reason::DeviceNotDefined) => {
                Err(CoreError::incoherent(format!("{missing} {key}")))
            }
            Err(e) => Err(e),
        }
    }

    pub fn put_device_alias(&self, device: &str, alias: &str) -> Result<(), CoreError> {
        self.ensure_writable(OP_PUT_DEVICE_ALIAS)?;
        self.call(
            OP_PUT_DEVICE_ALIAS,
            Payload::strings([device, alias]),
        )?;
        Ok(())
    }

    pub fn delete_device_alias(&self, alias: &str) -> Result<(), CoreError> {
        self.ensure_writable(OP_DELETE_DEVICE_ALIAS)?;
        self.call(OP_DELETE_DEVICE_ALIAS, Payload::Str(alias.to_owned()))?;
        Ok(())
    }

    // ── Name resolution ─────────────────────────────────────────────

    /// Class of `device`. Answers are memoised for the life of the store.
    pub fn get_class_for_device(&self, device: &str) -> Result<String, CoreError> {
        let key = device.to_lowercase();
        if let Some(class) = self.device_class_cache.get(&key) {
            return Ok(class.clone());
        }
        let class = self.call_str(OP_GET_CLASS_FOR_DEVICE, device)?;
        self.device_class_cache.insert(key, class.clone());
        Ok(class)
    }

    /// Devices registered for `service` (`*` matches every instance).
    pub fn get_services(&self, service: &str, instance: &str) -> Result<Vec<String>, CoreError> {
        self.bulk_call(OP_GET_SERVICES, &[service, instance])
    }

    pub fn get_device_exported(&self, pattern: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .call(OP_GET_DEVICE_EXPORTED, Payload::Str(pattern.to_owned()))?
            .into_strings(OP_GET_DEVICE_EXPORTED)?)
    }

    /// `(device, class)` pairs declared for a server instance.
    pub fn get_device_class_list(&self, server: &str) -> Result<Vec<(String, String)>, CoreError> {
        let flat = self
            .call(OP_GET_DEVICE_CLASS_LIST, Payload::Str(server.to_owned()))?
            .into_strings(OP_GET_DEVICE_CLASS_LIST)?;
        if flat.len() % 2 != 0 {
            return Err(CoreError::incoherent(format!(
                "{OP_GET_DEVICE_CLASS_LIST}: odd reply length {}",
                flat.len()
            )));
        }
        Ok(flat
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect())
    }
}

// ── Capability probe ────────────────────────────────────────────────

/// Ask the server, newest first, whether it knows each probe operation.
/// `CommandQuery` only describes a command, it never runs it.
fn probe_server_version(transport: &dyn Transport, location: &Location, timeout: Duration) -> u32 {
    let _guard = TimeoutGuard::new(transport, timeout);
    for (operation, version) in VERSION_PROBES {
        match transport.invoke(location, OP_COMMAND_QUERY, Payload::Str(operation.to_owned())) {
            Ok(_) => return version,
            Err(e) if e.is_command_not_found() => {}
            Err(e) => {
                warn!(probe = operation, error = %e, "version probe failed, assuming oldest protocol");
                return SERVER_VERSION_BASE;
            }
        }
    }
    SERVER_VERSION_BASE
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use devbus_api::testing::ScriptedTransport;
    use devbus_api::Error;
    use pretty_assertions::assert_eq;

    use super::*;

    fn scripted(version: u32) -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on(OP_COMMAND_QUERY, move |_, payload| {
            let known = match payload {
                Payload::Str(ref op) if op == OP_DELETE_ALL_DEVICE_ATTR_PROPERTY => version >= 400,
                Payload::Str(ref op) if op == OP_GET_DEVICE_ATTR_PROPERTY2 => version >= 230,
                _ => false,
            };
            if known {
                Ok(Payload::Void)
            } else {
                Err(Error::remote(Reason::CommandNotFound, "no such command", "test"))
            }
        });
        transport.reply(OP_GET_SERVICES, Payload::Strings(Vec::new()));
        transport
    }

    fn store(transport: &Arc<ScriptedTransport>) -> PropertyStore {
        let spec: ConnectionSpec = "db:10000".parse().unwrap();
        PropertyStore::connect(spec, transport.clone(), StoreOptions::default()).unwrap()
    }

    #[test]
    fn probe_detects_each_generation() {
        for version in [400, 230, 210] {
            let transport = scripted(version);
            assert_eq!(store(&transport).server_version(), version);
        }
    }

    #[test]
    fn probe_runs_under_its_own_timeout() {
        let transport = scripted(400);
        let spec: ConnectionSpec = "db:10000".parse().unwrap();
        let options = StoreOptions {
            request_timeout: Duration::from_millis(50),
            ..StoreOptions::default()
        };
        PropertyStore::connect(spec, transport.clone(), options).unwrap();
        assert_eq!(transport.calls()[0].timeout, Duration::from_millis(50));
        assert_eq!(transport.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn attribute_operation_follows_server_version() {
        for (version, expected) in [(400, OP_GET_DEVICE_ATTR_PROPERTY2), (210, OP_GET_DEVICE_ATTR_PROPERTY)] {
            let transport = scripted(version);
            transport.reply(expected, Payload::strings(["dev", "0"]));
            let db = store(&transport);
            let attrs = db.get_device_attribute_property("dev", &["temp"]).unwrap();
            assert!(attrs.is_empty());
            assert_eq!(transport.count(expected), 1);
        }
    }

    #[test]
    fn delete_all_attribute_properties_requires_current_server() {
        let transport = scripted(230);
        let err = store(&transport)
            .delete_all_device_attribute_property("dev", &["temp"])
            .unwrap_err();
        assert_eq!(err.reason(), Reason::NotSupported);
    }

    #[test]
    fn class_lookup_is_memoised() {
        let transport = scripted(400);
        transport.reply(OP_GET_CLASS_FOR_DEVICE, Payload::Str("TangoTest".into()));
        let db = store(&transport);
        assert_eq!(db.get_class_for_device("sys/tg/1").unwrap(), "TangoTest");
        assert_eq!(db.get_class_for_device("SYS/TG/1").unwrap(), "TangoTest");
        assert_eq!(transport.count(OP_GET_CLASS_FOR_DEVICE), 1);
    }

    #[test]
    fn missing_alias_is_incoherent_data() {
        let transport = scripted(400);
        transport.fail(OP_GET_DEVICE_ALIAS, Reason::AliasNotDefined, "not defined");
        transport.reply(OP_GET_ATTRIBUTE_ALIAS, Payload::Str(String::new()));
        let db = store(&transport);
        assert_eq!(db.get_device_alias("a/b/c").unwrap_err().reason(), Reason::IncoherentDbData);
        assert_eq!(db.get_attribute_alias("temp").unwrap_err().reason(), Reason::IncoherentDbData);
    }

    #[test]
    fn other_remote_errors_pass_through() {
        let transport = scripted(400);
        transport.fail(OP_GET_DEVICE_PROPERTY, Reason::SqlError, "table locked");
        let err = store(&transport).get_device_property("a/b/c", &["p"]).unwrap_err();
        assert_eq!(err.reason(), Reason::SqlError);
    }

    #[test]
    fn multi_host_location_lists_every_endpoint() {
        let transport = scripted(400);
        let spec: ConnectionSpec = "db1:10000,db2:10001".parse().unwrap();
        let db = PropertyStore::connect(spec, transport.clone(), StoreOptions::default()).unwrap();
        assert_eq!(db.location(), "corbaloc:iiop:db1:10000,iiop:db2:10001/database");
        assert_eq!(transport.calls()[0].target, db.location());
    }

    #[test]
    fn device_class_list_pairs() {
        let transport = scripted(400);
        transport.reply(
            OP_GET_DEVICE_CLASS_LIST,
            Payload::strings(["dserver/s/1", "DServer", "sys/tg/1", "TangoTest"]),
        );
        let pairs = store(&transport).get_device_class_list("s/1").unwrap();
        assert_eq!(pairs[1], ("sys/tg/1".to_owned(), "TangoTest".to_owned()));
    }
}
