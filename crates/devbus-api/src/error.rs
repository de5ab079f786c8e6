use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::reason::Reason;

/// One entry of a remote error stack.
///
/// Servers report failures as an ordered stack: the first frame is the
/// outermost (most recent) failure, later frames are the causes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorFrame {
    pub reason: Reason,
    pub description: String,
    pub origin: String,
}

impl ErrorFrame {
    pub fn new(reason: Reason, description: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
            origin: origin.into(),
        }
    }
}

/// A failure reported by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteError {
    pub frames: Vec<ErrorFrame>,
}

impl RemoteError {
    pub fn top(&self) -> Option<&ErrorFrame> {
        self.frames.first()
    }

    /// Returns `true` if any frame in the stack carries `reason`.
    pub fn contains(&self, reason: &Reason) -> bool {
        self.frames.iter().any(|f| &f.reason == reason)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.top() {
            Some(frame) => write!(f, "{} ({})", frame.description, frame.reason),
            None => f.write_str("remote failure with empty error stack"),
        }
    }
}

/// Top-level error type for the `devbus-api` crate.
///
/// Covers every failure mode of the request/reply layer: remote failures,
/// connection-spec syntax, timeouts, unreachable peers, and malformed
/// replies. `devbus-core` maps these into its own taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Remote ──────────────────────────────────────────────────────
    /// The peer executed the request and reported a failure.
    #[error("{0}")]
    Remote(RemoteError),

    // ── Configuration ───────────────────────────────────────────────
    /// The connection specification could not be parsed.
    #[error("Invalid connection spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    // ── Transport ───────────────────────────────────────────────────
    /// No reply within the configured timeout.
    #[error("Request {operation} to {target} timed out after {timeout_ms}ms")]
    Timeout {
        target: String,
        operation: String,
        timeout_ms: u64,
    },

    /// None of the endpoints of the location answered.
    #[error("Cannot reach {target}: {message}")]
    Unreachable { target: String, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// The reply did not have the shape the operation expects.
    #[error("Malformed reply to {operation}: {message}")]
    Decode { operation: String, message: String },
}

impl Error {
    /// Build a single-frame remote error.
    pub fn remote(reason: Reason, description: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::Remote(RemoteError {
            frames: vec![ErrorFrame::new(reason, description, origin)],
        })
    }

    pub(crate) fn decode(operation: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            operation: operation.to_owned(),
            message: message.into(),
        }
    }

    /// The reason code of the outermost failure.
    pub fn reason(&self) -> Reason {
        match self {
            Self::Remote(remote) => remote
                .top()
                .map_or(Reason::InternalError, |frame| frame.reason.clone()),
            Self::InvalidSpec { .. } => Reason::TangoHostNotSet,
            Self::Timeout { .. } => Reason::DeviceTimedOut,
            Self::Unreachable { .. } => Reason::CommunicationFailed,
            Self::Decode { .. } => Reason::IncoherentDbData,
        }
    }

    /// Returns `true` if the outermost reason code equals `reason`.
    pub fn has_reason(&self, reason: &Reason) -> bool {
        &self.reason() == reason
    }

    /// Returns `true` if any frame of a remote error carries `reason`.
    pub fn mentions(&self, reason: &Reason) -> bool {
        match self {
            Self::Remote(remote) => remote.contains(reason),
            other => &other.reason() == reason,
        }
    }

    /// Returns `true` if the peer could not be reached or did not answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unreachable { .. })
    }

    /// Returns `true` if the peer rejected an unknown operation name.
    pub fn is_command_not_found(&self) -> bool {
        self.has_reason(&Reason::CommandNotFound)
    }

    /// The error stack as frames, synthesising one for local failures.
    pub fn frames(&self) -> Vec<ErrorFrame> {
        match self {
            Self::Remote(remote) => remote.frames.clone(),
            other => vec![ErrorFrame::new(other.reason(), other.to_string(), "devbus-api")],
        }
    }
}
