use std::fmt;

use serde::{Deserialize, Serialize};

/// Who is talking to a device: the peer host plus the client process.
///
/// Two identities are the same client when host and pid match; the program
/// name is informational.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub host: String,
    pub pid: u32,
    pub program: Option<String>,
}

impl ClientIdentity {
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Self {
            host: host.into(),
            pid,
            program: None,
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Identity of the current process.
    pub fn current(host: impl Into<String>) -> Self {
        Self::new(host, std::process::id())
    }
}

impl PartialEq for ClientIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.program {
            Some(program) => write!(
                f,
                "{program} client with PID {} from host {}",
                self.pid, self.host
            ),
            None => write!(f, "client with PID {} from host {}", self.pid, self.host),
        }
    }
}
