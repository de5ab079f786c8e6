// ── Core error types ──
//
// Every failure the kernel reports carries a machine-matchable `Reason`
// plus a human description. Variants follow the error taxonomy: config,
// not-found, incoherent data, access, locking, attribute/command, timeouts,
// and remote failures passed through unchanged. The `From<devbus_api::Error>`
// impl translates transport-layer errors.

use devbus_api::{ErrorFrame, Reason, RemoteError};
use thiserror::Error;

/// Per-attribute failure collected during a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub name: String,
    pub reason: Reason,
    pub description: String,
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Configuration errors ─────────────────────────────────────────
    /// Bad connection spec, malformed property list, unreadable file.
    #[error("Configuration error: {message}")]
    Config { reason: Reason, message: String },

    // ── Data errors ──────────────────────────────────────────────────
    /// Something the caller named does not exist. Expected outcome.
    #[error("{message}")]
    NotFound { reason: Reason, message: String },

    /// A well-formed request got a structurally unexpected reply.
    #[error("Incoherent data: {message}")]
    IncoherentData { message: String },

    #[error("Database access failed: {message}")]
    DatabaseAccess { message: String },

    // ── Access errors ────────────────────────────────────────────────
    #[error("Access denied: {message}")]
    AccessDenied { message: String },

    // ── Locking errors ───────────────────────────────────────────────
    #[error("{message}")]
    DeviceLocked { message: String },

    #[error("{message}")]
    DeviceNotLocked { message: String },

    /// An administrator forcibly released a lock the caller held.
    #[error("{message}")]
    DeviceUnlocked { message: String },

    // ── Attribute / command errors ───────────────────────────────────
    #[error("{message}")]
    AttrNotAllowed { message: String },

    #[error("{message}")]
    AttrNotWritable { message: String },

    #[error("{message}")]
    AttrValueNotSet { message: String },

    /// Written value rejected (wrong type, outside limits).
    #[error("{message}")]
    InvalidValue { reason: Reason, message: String },

    #[error("{message}")]
    CommandNotAllowed { message: String },

    /// Partial failure of a batch write. Items already written stay written.
    #[error("Write failed for {} attribute(s): {}", failures.len(), summarize(failures))]
    WriteFailed { failures: Vec<ItemFailure> },

    // ── Polling / thread hand-off errors ─────────────────────────────
    #[error("{message}")]
    CommandTimedOut { message: String },

    #[error("{message}")]
    Polling { reason: Reason, message: String },

    // ── Transport errors ─────────────────────────────────────────────
    #[error("Remote failure: {0}")]
    Remote(RemoteError),

    #[error("Transport failure: {message}")]
    Transport { reason: Reason, message: String },

    #[error("Operation not supported: {message}")]
    Unsupported { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarize(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.name, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl CoreError {
    // ── Constructors for the common cases ───────────────────────────

    pub fn config(reason: Reason, message: impl Into<String>) -> Self {
        Self::Config {
            reason,
            message: message.into(),
        }
    }

    pub fn not_found(reason: Reason, message: impl Into<String>) -> Self {
        Self::NotFound {
            reason,
            message: message.into(),
        }
    }

    pub fn attr_not_found(message: impl Into<String>) -> Self {
        Self::not_found(Reason::AttrNotFound, message)
    }

    pub fn command_not_found(message: impl Into<String>) -> Self {
        Self::not_found(Reason::CommandNotFound, message)
    }

    pub fn incoherent(message: impl Into<String>) -> Self {
        Self::IncoherentData {
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::CommandTimedOut {
            message: message.into(),
        }
    }

    // ── Classification ──────────────────────────────────────────────

    /// The machine-matchable reason code.
    pub fn reason(&self) -> Reason {
        match self {
            Self::Config { reason, .. }
            | Self::NotFound { reason, .. }
            | Self::InvalidValue { reason, .. }
            | Self::Polling { reason, .. }
            | Self::Transport { reason, .. } => reason.clone(),
            Self::IncoherentData { .. } => Reason::IncoherentDbData,
            Self::DatabaseAccess { .. } => Reason::DatabaseAccess,
            Self::AccessDenied { .. } => Reason::ReadOnlyMode,
            Self::DeviceLocked { .. } => Reason::DeviceLocked,
            Self::DeviceNotLocked { .. } => Reason::DeviceNotLocked,
            Self::DeviceUnlocked { .. } => Reason::DeviceUnlocked,
            Self::AttrNotAllowed { .. } => Reason::AttrNotAllowed,
            Self::AttrNotWritable { .. } => Reason::AttrNotWritable,
            Self::AttrValueNotSet { .. } => Reason::AttrValueNotSet,
            Self::CommandNotAllowed { .. } => Reason::CommandNotAllowed,
            Self::WriteFailed { failures } => failures
                .first()
                .map_or(Reason::InternalError, |f| f.reason.clone()),
            Self::CommandTimedOut { .. } => Reason::CommandTimedOut,
            Self::Remote(remote) => remote
                .top()
                .map_or(Reason::InternalError, |f| f.reason.clone()),
            Self::Unsupported { .. } => Reason::NotSupported,
            Self::Internal(_) => Reason::InternalError,
        }
    }

    pub fn has_reason(&self, reason: &Reason) -> bool {
        &self.reason() == reason
    }

    /// Returns `true` for the expected "does not exist" outcomes.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Remote(remote) => remote.top().is_some_and(|f| {
                matches!(
                    f.reason,
                    Reason::DeviceNotDefined | Reason::AliasNotDefined | Reason::CommandNotFound
                )
            }),
            _ => false,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimedOut { .. })
            || matches!(self, Self::Transport { reason: Reason::DeviceTimedOut, .. })
    }

    /// The error as a wire-style frame stack.
    pub fn frames(&self) -> Vec<ErrorFrame> {
        match self {
            Self::Remote(remote) => remote.frames.clone(),
            other => vec![ErrorFrame::new(other.reason(), other.to_string(), "devbus-core")],
        }
    }

    /// Collapse into a single per-item failure record.
    pub fn to_item_failure(&self, name: &str) -> ItemFailure {
        ItemFailure {
            name: name.to_owned(),
            reason: self.reason(),
            description: self.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<devbus_api::Error> for CoreError {
    fn from(err: devbus_api::Error) -> Self {
        match err {
            devbus_api::Error::Remote(remote) => CoreError::Remote(remote),
            devbus_api::Error::InvalidSpec { spec, reason } => CoreError::Config {
                reason: Reason::TangoHostNotSet,
                message: if spec.is_empty() {
                    reason
                } else {
                    format!("'{spec}': {reason}")
                },
            },
            err @ (devbus_api::Error::Timeout { .. } | devbus_api::Error::Unreachable { .. }) => {
                CoreError::Transport {
                    reason: err.reason(),
                    message: err.to_string(),
                }
            }
            devbus_api::Error::Decode { operation, message } => CoreError::IncoherentData {
                message: format!("{operation}: {message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_pass_through_unchanged() {
        let api = devbus_api::Error::remote(Reason::DeviceNotDefined, "no such device", "db");
        let core = CoreError::from(api);
        assert_eq!(core.reason(), Reason::DeviceNotDefined);
        assert!(core.is_not_found());
        assert_eq!(core.frames()[0].description, "no such device");
    }

    #[test]
    fn spec_errors_become_config_errors() {
        let api = devbus_api::Error::InvalidSpec {
            spec: "hostA".into(),
            reason: "missing port".into(),
        };
        let core = CoreError::from(api);
        assert!(core.is_config());
        assert_eq!(core.reason(), Reason::TangoHostNotSet);
    }

    #[test]
    fn batch_write_reason_is_first_failure() {
        let err = CoreError::WriteFailed {
            failures: vec![
                CoreError::AttrNotAllowed { message: "nope".into() }.to_item_failure("a"),
                CoreError::Internal("boom".into()).to_item_failure("b"),
            ],
        };
        assert_eq!(err.reason(), Reason::AttrNotAllowed);
        assert!(err.to_string().contains("a (API_AttrNotAllowed)"));
    }
}
