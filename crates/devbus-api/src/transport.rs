// ── Request/reply transport ──
//
// The only capability the kernel needs from the network: a synchronous
// `invoke(location, operation, payload)` with a per-client timeout. Real
// transports live outside this workspace; tests use `testing::ScriptedTransport`.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::connection::Location;
use crate::error::Error;

/// Timeout applied when a transport is created without an explicit one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Typed request/reply body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    Void,
    Bool(bool),
    Long(i32),
    Str(String),
    Strings(Vec<String>),
    LongStrings { longs: Vec<i32>, strings: Vec<String> },
}

impl Payload {
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Strings(items.into_iter().map(Into::into).collect())
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool(_) => "bool",
            Self::Long(_) => "long",
            Self::Str(_) => "string",
            Self::Strings(_) => "string array",
            Self::LongStrings { .. } => "long/string array",
        }
    }

    fn mismatch(&self, operation: &str, wanted: &str) -> Error {
        Error::decode(operation, format!("expected {wanted}, got {}", self.kind()))
    }

    pub fn into_strings(self, operation: &str) -> Result<Vec<String>, Error> {
        match self {
            Self::Strings(v) => Ok(v),
            other => Err(other.mismatch(operation, "string array")),
        }
    }

    pub fn into_str(self, operation: &str) -> Result<String, Error> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(other.mismatch(operation, "string")),
        }
    }

    pub fn into_long(self, operation: &str) -> Result<i32, Error> {
        match self {
            Self::Long(v) => Ok(v),
            other => Err(other.mismatch(operation, "long")),
        }
    }

    pub fn into_bool(self, operation: &str) -> Result<bool, Error> {
        match self {
            Self::Bool(v) => Ok(v),
            other => Err(other.mismatch(operation, "bool")),
        }
    }

    pub fn into_long_strings(self, operation: &str) -> Result<(Vec<i32>, Vec<String>), Error> {
        match self {
            Self::LongStrings { longs, strings } => Ok((longs, strings)),
            other => Err(other.mismatch(operation, "long/string array")),
        }
    }
}

/// Synchronous request/reply channel to remote objects.
///
/// Implementations try the endpoints of a [`Location`] in order and report
/// the first success. No retries happen above this trait.
pub trait Transport: Send + Sync {
    fn invoke(&self, target: &Location, operation: &str, payload: Payload)
    -> Result<Payload, Error>;

    /// Current per-call timeout.
    fn timeout(&self) -> Duration;

    fn set_timeout(&self, timeout: Duration);
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("timeout", &self.timeout())
            .finish_non_exhaustive()
    }
}

// ── Scoped timeout override ─────────────────────────────────────────

/// Temporarily overrides a transport's timeout. The previous value is put
/// back when the guard drops, whichever way the scope is left.
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct TimeoutGuard<'a> {
    transport: &'a dyn Transport,
    previous: Duration,
}

impl<'a> TimeoutGuard<'a> {
    pub fn new(transport: &'a dyn Transport, timeout: Duration) -> Self {
        let previous = transport.timeout();
        transport.set_timeout(timeout);
        Self {
            transport,
            previous,
        }
    }

    pub fn previous(&self) -> Duration {
        self.previous
    }
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        self.transport.set_timeout(self.previous);
    }
}
