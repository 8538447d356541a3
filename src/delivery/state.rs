//! Named states of a delivery worker and the transitions between them.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Caught up; waiting for a new item, a refresh, or the poll interval.
    Idle,
    /// Reading the next window from the channel.
    Fetching,
    /// Non-transactional windows are in flight.
    Dispatching,
    /// A transactional window is in flight and the cursor is held.
    AwaitingAck,
    /// A window failed; waiting out the backoff.
    Retrying,
    /// Advancing past items older than the group's `ttlMinutes`.
    Skipping,
    /// The group was deleted. Terminal.
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "IDLE",
            WorkerState::Fetching => "FETCHING",
            WorkerState::Dispatching => "DISPATCHING",
            WorkerState::AwaitingAck => "AWAITING_ACK",
            WorkerState::Retrying => "RETRYING",
            WorkerState::Skipping => "SKIPPING",
            WorkerState::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Any live state may stop. Staying in the same state is always allowed.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;

        if *self == next {
            return !self.is_terminal();
        }
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,

            (Idle, Fetching) => true,

            (Fetching, Dispatching | Idle) => true,

            // Pipelining fetches the next window while earlier ones are in flight.
            (Dispatching, Fetching | AwaitingAck | Idle | Retrying) => true,

            (AwaitingAck, Fetching | Dispatching | Idle | Retrying) => true,

            (Retrying, Dispatching | Skipping) => true,

            (Skipping, Dispatching | Fetching | Idle) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
