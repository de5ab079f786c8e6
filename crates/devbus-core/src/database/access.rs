// ── Access control ──
//
// READ/WRITE decisions come from a policy service registered in the
// database under a well-known service name. The decision for the database
// device itself is resolved once and cached behind a reader/writer lock;
// other lookups go straight to the service.
//
// Degraded modes: no service registered grants WRITE, a registered but
// unreachable service grants READ and remembers why.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use strum::Display;
use tracing::{debug, warn};

use devbus_api::{ErrorFrame, Location, Payload, Reason, TimeoutGuard, Transport};

use crate::error::CoreError;

use super::{DB_DEVICE_NAME, PropertyStore};

/// Service name under which the policy device is registered.
pub const ACCESS_SERVICE: &str = "AccessControl";

/// Class name used when asking about database commands.
const DB_CLASS_NAME: &str = "Database";

const OP_GET_ACCESS: &str = "GetAccess";
const OP_GET_ALLOWED_COMMANDS: &str = "GetAllowedCommands";

const UNREACHABLE_SERVICE: &str =
    "Controlled access service defined in Db but unreachable --> Read access given to all devices...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum AccessDecision {
    #[default]
    Unchecked,
    Read,
    Write,
}

// ── Policy service seam ─────────────────────────────────────────────

pub trait PolicyService: Send + Sync {
    fn get_access(&self, device: &str, host: &str) -> Result<AccessDecision, CoreError>;

    fn allowed_commands(&self, class: &str) -> Result<Vec<String>, CoreError>;

    fn is_command_allowed(&self, class: &str, command: &str) -> Result<bool, CoreError> {
        Ok(self
            .allowed_commands(class)?
            .iter()
            .any(|c| c.eq_ignore_ascii_case(command)))
    }
}

/// Policy service reached through the request/reply transport. Allowed
/// command lists are cached per class.
pub struct TransportPolicyService {
    transport: Arc<dyn Transport>,
    location: Location,
    timeout: Duration,
    allowed: DashMap<String, Vec<String>>,
}

impl TransportPolicyService {
    pub fn new(transport: Arc<dyn Transport>, location: Location, timeout: Duration) -> Self {
        Self {
            transport,
            location,
            timeout,
            allowed: DashMap::new(),
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }
}

impl PolicyService for TransportPolicyService {
    fn get_access(&self, device: &str, host: &str) -> Result<AccessDecision, CoreError> {
        let _guard = TimeoutGuard::new(self.transport.as_ref(), self.timeout);
        let reply = self
            .transport
            .invoke(&self.location, OP_GET_ACCESS, Payload::strings([device, host]))?
            .into_str(OP_GET_ACCESS)?;
        match reply.to_ascii_lowercase().as_str() {
            "write" => Ok(AccessDecision::Write),
            "read" => Ok(AccessDecision::Read),
            other => Err(CoreError::incoherent(format!(
                "{OP_GET_ACCESS}: unexpected access right '{other}'"
            ))),
        }
    }

    fn allowed_commands(&self, class: &str) -> Result<Vec<String>, CoreError> {
        let key = class.to_lowercase();
        if let Some(cached) = self.allowed.get(&key) {
            return Ok(cached.clone());
        }
        let _guard = TimeoutGuard::new(self.transport.as_ref(), self.timeout);
        let commands = self
            .transport
            .invoke(&self.location, OP_GET_ALLOWED_COMMANDS, Payload::Str(class.to_owned()))?
            .into_strings(OP_GET_ALLOWED_COMMANDS)?;
        self.allowed.insert(key, commands.clone());
        Ok(commands)
    }
}

// ── Cached state ────────────────────────────────────────────────────

#[derive(Default)]
pub(super) struct AccessState {
    checked: bool,
    decision: AccessDecision,
    policy: Option<Arc<dyn PolicyService>>,
    service_defined: bool,
    failures: Vec<ErrorFrame>,
}

impl PropertyStore {
    /// Access right of this client on the database device, resolved once.
    pub fn check_access_and_get(&self) -> AccessDecision {
        {
            let state = self.access.read();
            if state.checked {
                return state.decision;
            }
        }

        let mut state = self.access.write();
        if !state.checked {
            state.decision = self.resolve_access(&mut state, DB_DEVICE_NAME);
            state.checked = true;
            debug!(decision = %state.decision, "database access resolved");
        }
        state.decision
    }

    /// Access right of this client on `device`. Never cached.
    pub fn check_access_control(&self, device: &str) -> AccessDecision {
        let mut state = self.access.write();
        self.resolve_access(&mut state, device)
    }

    /// Whether `command` may run on `device` for a client with READ access.
    pub fn is_command_allowed(&self, device: &str, command: &str) -> bool {
        let mut state = self.access.write();
        let Some(policy) = state.policy.clone() else {
            return self.resolve_access(&mut state, device) != AccessDecision::Read;
        };

        if device.eq_ignore_ascii_case(DB_DEVICE_NAME) {
            if state.decision != AccessDecision::Read {
                return true;
            }
            return policy
                .is_command_allowed(DB_CLASS_NAME, command)
                .unwrap_or_else(|e| {
                    warn!(command, error = %e, "allowed-command check failed");
                    false
                });
        }
        drop(state);

        let class = match self.get_class_for_device(device) {
            Ok(class) => class,
            Err(e) => {
                warn!(device, error = %e, "cannot resolve class for access check");
                return false;
            }
        };
        policy.is_command_allowed(&class, command).unwrap_or_else(|e| {
            warn!(device, command, error = %e, "allowed-command check failed");
            false
        })
    }

    /// Commands a client without WRITE access may still run on `class`.
    pub fn allowed_commands(&self, class: &str) -> Vec<String> {
        let policy = self.access.read().policy.clone();
        match policy {
            Some(policy) => policy.allowed_commands(class).unwrap_or_else(|e| {
                warn!(class, error = %e, "cannot fetch allowed commands");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }

    /// Why access fell back to READ, if it did.
    pub fn access_service_reason(&self) -> Vec<ErrorFrame> {
        self.access.read().failures.clone()
    }

    pub fn access_service_defined(&self) -> bool {
        self.access.read().service_defined
    }

    /// Install a policy service directly instead of looking it up.
    pub fn set_policy_service(&self, policy: Arc<dyn PolicyService>) {
        let mut state = self.access.write();
        state.policy = Some(policy);
        state.service_defined = true;
        state.checked = false;
        state.failures.clear();
    }

    /// Forget the cached decision and the service handle.
    pub fn reset_access(&self) {
        *self.access.write() = AccessState::default();
    }

    pub(super) fn ensure_writable(&self, command: &str) -> Result<(), CoreError> {
        if !self.options.access_control || self.is_file_backed() {
            return Ok(());
        }
        if self.check_access_and_get() == AccessDecision::Read
            && !self.is_command_allowed(DB_DEVICE_NAME, command)
        {
            return Err(CoreError::AccessDenied {
                message: format!("Command {command} on device {DB_DEVICE_NAME} is not authorized"),
            });
        }
        Ok(())
    }

    // ── Resolution ──────────────────────────────────────────────────

    fn resolve_access(&self, state: &mut AccessState, device: &str) -> AccessDecision {
        if state.policy.is_none() {
            match self.build_policy(state) {
                Ok(Some(policy)) => state.policy = Some(policy),
                Ok(None) => return AccessDecision::Write,
                Err(frames) => {
                    warn!(error = ?frames.first(), "access control lookup failed, granting read access");
                    state.failures = frames;
                    return AccessDecision::Read;
                }
            }
        }
        let Some(policy) = state.policy.clone() else {
            return AccessDecision::Read;
        };

        match policy.get_access(device, &self.options.client_host) {
            Ok(decision) => {
                state.failures.clear();
                decision
            }
            Err(e) => {
                let mut frames = e.frames();
                if e.has_reason(&Reason::DeviceNotExported) || e.has_reason(&Reason::DeviceNotDefined) {
                    frames.push(ErrorFrame::new(
                        Reason::CantConnectToDevice,
                        UNREACHABLE_SERVICE,
                        "PropertyStore::check_access_control",
                    ));
                    state.policy = None;
                }
                warn!(device, error = %e, "access control service unreachable, granting read access");
                state.failures = frames;
                AccessDecision::Read
            }
        }
    }

    /// `Ok(None)` when no service is registered.
    fn build_policy(&self, state: &mut AccessState) -> Result<Option<Arc<dyn PolicyService>>, Vec<ErrorFrame>> {
        let Some(transport) = self.transport() else {
            state.service_defined = false;
            return Ok(None);
        };

        let service = match &self.options.access_device {
            Some(name) => name.clone(),
            None => {
                let services = self
                    .get_services(ACCESS_SERVICE, "*")
                    .map_err(|e| e.frames())?;
                match services.into_iter().next() {
                    Some(first) => first,
                    None => {
                        debug!("no access control service registered");
                        state.service_defined = false;
                        return Ok(None);
                    }
                }
            }
        };
        state.service_defined = true;

        let name = self.qualify_service_name(&service.to_lowercase());
        let location = self
            .spec
            .device_location(&name)
            .map_err(|e| CoreError::from(e).frames())?;
        debug!(service = %location, "access control service found");
        Ok(Some(Arc::new(TransportPolicyService::new(
            transport.clone(),
            location,
            self.options.access_check_timeout,
        ))))
    }

    /// `domain/family/member` names are qualified with the database host.
    fn qualify_service_name(&self, name: &str) -> String {
        match self.spec.primary_host_port() {
            Some(host_port) if name.matches('/').count() == 2 => format!("tango://{host_port}/{name}"),
            _ => name.to_owned(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use devbus_api::testing::ScriptedTransport;
    use devbus_api::{ConnectionSpec, DbDatum, Error};

    use super::*;
    use crate::database::StoreOptions;

    fn transport() -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply("CommandQuery", Payload::Void);
        transport
    }

    fn store(transport: &Arc<ScriptedTransport>) -> PropertyStore {
        let spec: ConnectionSpec = "db:10000".parse().unwrap();
        PropertyStore::connect(spec, transport.clone(), StoreOptions::default()).unwrap()
    }

    #[test]
    fn no_registered_service_grants_write() {
        let transport = transport();
        transport.reply("DbGetServices", Payload::Strings(Vec::new()));
        let db = store(&transport);
        assert_eq!(db.check_access_and_get(), AccessDecision::Write);
        assert!(!db.access_service_defined());
        assert!(db.is_command_allowed("a/b/c", "On"));
    }

    #[test]
    fn service_answer_is_used_and_qualified() {
        let transport = transport();
        transport.reply("DbGetServices", Payload::strings(["sys/access_control/1"]));
        transport.reply("GetAccess", Payload::Str("read".into()));
        let db = store(&transport);
        assert_eq!(db.check_access_and_get(), AccessDecision::Read);
        let call = &transport.calls_to("GetAccess")[0];
        assert_eq!(call.target, "tango://db:10000/sys/access_control/1");
        assert_eq!(call.payload, Payload::strings([DB_DEVICE_NAME, "localhost"]));
    }

    #[test]
    fn unreachable_service_grants_read_and_remembers_why() {
        let transport = transport();
        transport.reply("DbGetServices", Payload::strings(["sys/access_control/1"]));
        transport.fail("GetAccess", Reason::DeviceNotExported, "not exported");
        let db = store(&transport);
        assert_eq!(db.check_access_and_get(), AccessDecision::Read);
        let reasons = db.access_service_reason();
        assert!(reasons.iter().any(|f| f.description.starts_with("Controlled access service")));
        assert!(db.access_service_defined());
    }

    #[test]
    fn concurrent_checks_resolve_once() {
        let transport = transport();
        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = lookups.clone();
        transport.on("DbGetServices", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok(Payload::Strings(Vec::new()))
        });
        let db = Arc::new(store(&transport));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                thread::spawn(move || db.check_access_and_get())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), AccessDecision::Write);
        }
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_only_client_cannot_write_unless_allowed() {
        let transport = transport();
        transport.reply("DbGetServices", Payload::strings(["sys/access_control/1"]));
        transport.reply("GetAccess", Payload::Str("read".into()));
        transport.reply("GetAllowedCommands", Payload::strings(["DbPutDeviceProperty"]));
        transport.reply("DbPutDeviceProperty", Payload::Void);
        let db = store(&transport);

        db.put_device_property("a/b/c", &[DbDatum::with_values("p", ["1"])])
            .unwrap();
        let err = db.delete_device_property("a/b/c", &["p"]).unwrap_err();
        assert_eq!(err.reason(), Reason::ReadOnlyMode);
        assert_eq!(transport.count("DbDeleteDeviceProperty"), 0);
        assert_eq!(transport.count("GetAllowedCommands"), 1);
    }

    #[test]
    fn ordinary_devices_are_checked_by_class() {
        struct Policy;
        impl PolicyService for Policy {
            fn get_access(&self, _: &str, _: &str) -> Result<AccessDecision, CoreError> {
                Ok(AccessDecision::Read)
            }
            fn allowed_commands(&self, class: &str) -> Result<Vec<String>, CoreError> {
                Ok(if class == "TangoTest" { vec!["Status".into()] } else { Vec::new() })
            }
        }

        let transport = transport();
        transport.reply("DbGetClassforDevice", Payload::Str("TangoTest".into()));
        let db = store(&transport);
        db.set_policy_service(Arc::new(Policy));
        assert!(db.is_command_allowed("sys/tg/1", "status"));
        assert!(!db.is_command_allowed("sys/tg/1", "On"));
    }

    #[test]
    fn failed_service_lookup_grants_read() {
        let transport = transport();
        transport.on("DbGetServices", |_, _| {
            Err(Error::Unreachable {
                target: "db".into(),
                message: "connection refused".into(),
            })
        });
        let db = store(&transport);
        assert_eq!(db.check_access_and_get(), AccessDecision::Read);
        assert_eq!(db.access_service_reason()[0].reason, Reason::CommunicationFailed);
    }
}
