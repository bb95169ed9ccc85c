//! Ring buffer of recent gossip attempts, for diagnostics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use crate::clock::TimeSource;
use crate::types::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionDirection {
    Initiated,
    Accepted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    /// None when a session died before the peer identified itself.
    pub peer: Option<NodeId>,
    pub direction: SessionDirection,
    pub outcome: SessionOutcome,
    pub at: OffsetDateTime,
}

pub struct SessionHistory {
    capacity: usize,
    records: Mutex<VecDeque<SessionRecord>>,
    time: Arc<dyn TimeSource>,
}

impl SessionHistory {
    pub fn new(capacity: usize, time: Arc<dyn TimeSource>) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            time,
        }
    }

    pub fn record(
        &self,
        peer: Option<NodeId>,
        direction: SessionDirection,
        outcome: SessionOutcome,
    ) {
        let at = self.time.now();
        let mut records = self.records.lock().expect("history lock poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(SessionRecord {
            peer,
            direction,
            outcome,
            at,
        });
    }

    /// Snapshot, oldest first.
    pub fn records(&self) -> Vec<SessionRecord> {
        self.records
            .lock()
            .expect("history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
