//! Observable per-group delivery status.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::state::WorkerState;
use crate::types::{SequenceId, SequenceRange};

/// How many recent failures a group keeps.
pub const MAX_RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryError {
    pub at: DateTime<Utc>,
    pub range: SequenceRange,
    pub attempt: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatus {
    pub state: WorkerState,
    /// Last id delivered or skipped by this worker.
    pub last_completed: Option<SequenceId>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub in_flight: Vec<SequenceId>,
    /// Newest last.
    pub errors: VecDeque<DeliveryError>,
}

impl Default for GroupStatus {
    fn default() -> Self {
        GroupStatus {
            state: WorkerState::Idle,
            last_completed: None,
            last_completed_at: None,
            in_flight: Vec::new(),
            errors: VecDeque::new(),
        }
    }
}

impl GroupStatus {
    pub fn record_completed(&mut self, id: SequenceId, at: DateTime<Utc>) {
        self.last_completed = Some(id);
        self.last_completed_at = Some(at);
    }

    pub fn record_error(&mut self, error: DeliveryError) {
        if self.errors.len() == MAX_RECENT_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
    }
}

/// Shared between a worker (writer) and the HTTP layer (reader).
pub type StatusHandle = Arc<Mutex<GroupStatus>>;
