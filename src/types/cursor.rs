//! Per-group delivery progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::SequenceId;

/// An inclusive range of sequence ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub first: SequenceId,
    pub last: SequenceId,
}

impl SequenceRange {
    pub fn new(first: SequenceId, last: SequenceId) -> Self {
        debug_assert!(first <= last);
        SequenceRange { first, last }
    }
}

/// How far a subscription group has consumed its channel.
///
/// Exactly one worker writes a given cursor. `last_delivered` only moves
/// forward, and only over a contiguous prefix of accepted (or skipped) items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    #[serde(rename = "lastDeliveredSequenceId")]
    pub last_delivered: SequenceId,

    /// Dispatched but not yet acknowledged; `None` when idle.
    #[serde(rename = "inFlightRange")]
    pub in_flight: Option<SequenceRange>,

    pub failure_count: u32,

    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Cursor {
    /// A cursor positioned just after `id`.
    pub fn starting_after(id: SequenceId) -> Self {
        Cursor {
            last_delivered: id,
            ..Cursor::default()
        }
    }

    /// Moves the delivered watermark forward. Returns whether it moved.
    pub fn advance_to(&mut self, id: SequenceId) -> bool {
        if id > self.last_delivered {
            self.last_delivered = id;
            true
        } else {
            false
        }
    }

    /// Clears retry bookkeeping after a successful delivery.
    pub fn reset_failures(&mut self) {
        self.failure_count = 0;
        self.next_attempt_at = None;
    }
}
