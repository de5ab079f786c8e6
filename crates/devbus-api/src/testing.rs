//! In-process transport for tests.
//!
//! `ScriptedTransport` answers each operation with a registered handler and
//! records every call, so tests can assert on exactly what went over the
//! wire. Unregistered operations fail with `API_CommandNotFound`, which is
//! what a real server answers for an unknown command.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::Location;
use crate::error::Error;
use crate::reason::Reason;
use crate::transport::{DEFAULT_TIMEOUT, Payload, Transport};

type Handler = Arc<dyn Fn(&Location, Payload) -> Result<Payload, Error> + Send + Sync>;

/// One recorded request.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub target: String,
    pub operation: String,
    pub payload: Payload,
    pub timeout: Duration,
}

#[derive(Default)]
pub struct ScriptedTransport {
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<Call>>,
    timeout: Mutex<Option<Duration>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `operation`.
    pub fn on<F>(&self, operation: &str, handler: F) -> &Self
    where
        F: Fn(&Location, Payload) -> Result<Payload, Error> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(operation.to_owned(), Arc::new(handler));
        self
    }

    /// Answer `operation` with a fixed reply.
    pub fn reply(&self, operation: &str, payload: Payload) -> &Self {
        self.on(operation, move |_, _| Ok(payload.clone()))
    }

    /// Answer `operation` with a remote failure.
    pub fn fail(&self, operation: &str, reason: Reason, description: &str) -> &Self {
        let description = description.to_owned();
        self.on(operation, move |_, _| {
            Err(Error::remote(reason.clone(), description.clone(), "ScriptedTransport"))
        })
    }

    pub fn forget(&self, operation: &str) {
        self.handlers.lock().remove(operation);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

impl Transport for ScriptedTransport {
    fn invoke(&self, target: &Location, operation: &str, payload: Payload) -> Result<Payload, Error> {
        self.calls.lock().push(Call {
            target: target.to_string(),
            operation: operation.to_owned(),
            payload: payload.clone(),
            timeout: self.timeout(),
        });

        let handler = self.handlers.lock().get(operation).cloned();
        match handler {
            Some(handler) => handler(target, payload),
            None => Err(Error::remote(
                Reason::CommandNotFound,
                format!("Command {operation} not found"),
                "ScriptedTransport::invoke",
            )),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout.lock().unwrap_or(DEFAULT_TIMEOUT)
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = Some(timeout);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unknown_operations_fail_with_command_not_found() {
        let transport = ScriptedTransport::new();
        let loc = Location::new(Vec::new(), "database");
        let err = transport.invoke(&loc, "DbInfo", Payload::Void).unwrap_err();
        assert!(err.is_command_not_found());
        assert_eq!(transport.count("DbInfo"), 1);
    }

    #[test]
    fn registered_replies_are_returned() {
        let transport = ScriptedTransport::new();
        transport.reply("DbInfo", Payload::strings(["ok"]));
        let loc = Location::new(Vec::new(), "database");
        let reply = transport.invoke(&loc, "DbInfo", Payload::Void).unwrap();
        assert_eq!(reply, Payload::strings(["ok"]));
    }
}
