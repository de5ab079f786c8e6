use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use devbus_api::Reason;
use serde::Serialize;

use crate::error::CoreError;
use crate::model::ClientIdentity;

/// One recorded request.
#[derive(Debug, Clone, Serialize)]
pub struct BlackBoxEntry {
    pub when: DateTime<Utc>,
    pub operation: String,
    pub client: Option<ClientIdentity>,
}

impl fmt::Display for BlackBoxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : Operation {}", self.when.format("%d/%m/%Y %H:%M:%S%.3f"), self.operation)?;
        match &self.client {
            Some(client) => write!(f, " requested from {client}"),
            None => f.write_str(" requested from the device server itself"),
        }
    }
}

/// Bounded history of the requests a device received.
#[derive(Debug)]
pub struct BlackBox {
    depth: usize,
    entries: VecDeque<BlackBoxEntry>,
}

impl BlackBox {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn resize(&mut self, depth: usize) {
        self.depth = depth.max(1);
        while self.entries.len() > self.depth {
            self.entries.pop_front();
        }
    }

    pub fn record(&mut self, operation: impl Into<String>, client: Option<&ClientIdentity>) {
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(BlackBoxEntry {
            when: Utc::now(),
            operation: operation.into(),
            client: client.cloned(),
        });
    }

    /// Up to `n` entries, most recent first.
    pub fn read(&self, device: &str, n: usize) -> Result<Vec<BlackBoxEntry>, CoreError> {
        if self.entries.is_empty() {
            return Err(CoreError::not_found(
                Reason::BlackBoxEmpty,
                format!("Nothing recorded in the black box of device {device}"),
            ));
        }
        Ok(self.entries.iter().rev().take(n).cloned().collect())
    }
}
