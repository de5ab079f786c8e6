use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use devbus_api::ErrorFrame;
use serde::Serialize;

use crate::device::AttributeValue;
use crate::model::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PollOutcome {
    Attribute(AttributeValue),
    Command(Value),
    Failed(Vec<ErrorFrame>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollRecord {
    pub when: DateTime<Utc>,
    pub outcome: PollOutcome,
}

/// Fixed-depth history of one polled object.
#[derive(Debug, Clone)]
pub struct PollRing {
    depth: usize,
    records: VecDeque<PollRecord>,
}

impl PollRing {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            records: VecDeque::with_capacity(depth),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, outcome: PollOutcome) {
        if self.records.len() == self.depth {
            self.records.pop_front();
        }
        self.records.push_back(PollRecord {
            when: Utc::now(),
            outcome,
        });
    }

    pub fn last(&self) -> Option<&PollRecord> {
        self.records.back()
    }

    /// Up to `n` records, most recent first.
    pub fn history(&self, n: usize) -> Vec<PollRecord> {
        self.records.iter().rev().take(n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest() {
        let mut ring = PollRing::new(2);
        for i in 0..3 {
            ring.push(PollOutcome::Command(Value::Long(i)));
        }
        assert_eq!(ring.len(), 2);
        let values: Vec<_> = ring
            .history(5)
            .into_iter()
            .map(|r| r.outcome)
            .collect();
        assert_eq!(
            values,
            vec![
                PollOutcome::Command(Value::Long(2)),
                PollOutcome::Command(Value::Long(1))
            ]
        );
    }

    #[test]
    fn zero_depth_still_keeps_one() {
        let mut ring = PollRing::new(0);
        ring.push(PollOutcome::Command(Value::Void));
        assert_eq!(ring.depth(), 1);
        assert!(ring.last().is_some());
    }
}
