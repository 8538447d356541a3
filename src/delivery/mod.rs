//! Delivery engine: one independent worker per subscription group.
//!
//! # Architecture
//!
//! ```text
//!   ChannelLog ── tail watch ──►  worker A ──► callback A
//!        │                        worker B ──► callback B
//!        └──────────────────────► worker C ──► callback C
//!                                    ▲
//!   RefreshCoordinator ── wake ──────┘
//! ```
//!
//! Workers never share state with each other. Each owns its group's cursor,
//! its retry timer and its in-flight windows, so a slow or failing callback
//! only ever delays its own group.

pub mod callback;
pub mod refresh;
pub mod retry;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod window;
pub mod worker;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{GroupName, SequenceId, SequenceRange};

pub use callback::{Callback, DeliveryFailure, DeliveryPayload, HttpCallback, PayloadKind};
pub use refresh::RefreshCoordinator;
pub use retry::{RetryPlan, RetryScheduler};
pub use state::WorkerState;
pub use status::{DeliveryError, GroupStatus, StatusHandle};
pub use supervisor::Supervisor;
pub use worker::{DeliveryWorker, WorkerContext, WorkerSettings};

/// Observable outcome of delivery work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// The callback accepted a window.
    Delivered {
        group: GroupName,
        sequence_ids: Vec<SequenceId>,
    },
    /// A window failed and will be re-dispatched unchanged after `delay`.
    Retrying {
        group: GroupName,
        range: SequenceRange,
        attempt: u32,
        delay: Duration,
        error: DeliveryFailure,
    },
    /// An item outlived the group's `ttlMinutes` without being delivered.
    Skipped {
        group: GroupName,
        sequence_id: SequenceId,
    },
    Stopped {
        group: GroupName,
    },
}

impl DeliveryEvent {
    pub fn group(&self) -> &GroupName {
        match self {
            DeliveryEvent::Delivered { group, .. }
            | DeliveryEvent::Retrying { group, .. }
            | DeliveryEvent::Skipped { group, .. }
            | DeliveryEvent::Stopped { group } => group,
        }
    }
}

/// Source of wall-clock time for undeliverable-age checks.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    System,
    /// Wall time anchored at creation and advanced by the tokio clock,
    /// so it follows `tokio::time::pause`/`advance`.
    Tokio {
        origin: DateTime<Utc>,
        start: tokio::time::Instant,
    },
}

impl Clock {
    pub fn tokio() -> Self {
        Clock::Tokio {
            origin: Utc::now(),
            start: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Tokio { origin, start } => {
                *origin
                    + chrono::Duration::from_std(start.elapsed())
                        .unwrap_or(chrono::Duration::zero())
            }
        }
    }
}
