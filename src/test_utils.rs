//! Shared test utilities: a scriptable callback and arbitrary generators.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use proptest::prelude::*;
use tokio::sync::{Notify, Semaphore};

use crate::delivery::{Callback, DeliveryFailure, DeliveryPayload};
use crate::types::ChannelName;

pub fn arb_channel_name() -> impl Strategy<Value = ChannelName> {
    "[a-z][a-z0-9_]{0,20}".prop_map(|s| ChannelName::new(s).unwrap())
}

pub fn arb_tag() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9:._]{0,15}"
}

/// One recorded invocation of [`ScriptedCallback::deliver`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub payload: DeliveryPayload,
}

/// A callback whose answers are scripted by the test.
///
/// Calls are answered from the outcome queue in order; once it is empty,
/// every call is accepted (or rejected, after [`ScriptedCallback::always_fail`]).
/// A call whose first sequence id is [`held`](ScriptedCallback::hold) blocks
/// until [`release`](ScriptedCallback::release)d.
#[derive(Default)]
pub struct ScriptedCallback {
    calls: Mutex<Vec<RecordedCall>>,
    accepted: Mutex<Vec<Vec<u64>>>,
    outcomes: Mutex<VecDeque<Result<(), DeliveryFailure>>>,
    gates: Mutex<HashMap<u64, Arc<Semaphore>>>,
    fail_all: AtomicBool,
    called: Notify,
}

impl ScriptedCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls answer with HTTP 500.
    pub fn fail_next(self, n: usize) -> Self {
        self.outcomes
            .lock()
            .extend(std::iter::repeat_n(Err(DeliveryFailure::Status(500)), n));
        self
    }

    pub fn always_fail(self) -> Self {
        self.fail_all.store(true, Ordering::Release);
        self
    }

    /// Blocks calls whose window starts at `seq` until released.
    pub fn hold(&self, seq: u64) {
        self.gates
            .lock()
            .insert(seq, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, seq: u64) {
        if let Some(gate) = self.gates.lock().get(&seq) {
            gate.add_permits(1024);
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sequence ids of every accepted call, in acceptance order.
    pub fn accepted(&self) -> Vec<Vec<u64>> {
        self.accepted.lock().clone()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.called.notified();
            if self.call_count() >= n {
                return;
            }
            notified.await;
        }
    }
}

impl Callback for ScriptedCallback {
    async fn deliver(&self, url: &str, payload: &DeliveryPayload) -> Result<(), DeliveryFailure> {
        let first = payload.sequence_ids.first().copied().unwrap_or_default();
        self.calls.lock().push(RecordedCall {
            url: url.to_string(),
            payload: payload.clone(),
        });
        self.called.notify_waiters();

        let outcome = match self.outcomes.lock().pop_front() {
            Some(outcome) => outcome,
            None if self.fail_all.load(Ordering::Acquire) => Err(DeliveryFailure::Status(500)),
            None => Ok(()),
        };

        let gate = self.gates.lock().get(&first).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }

        if outcome.is_ok() {
            self.accepted.lock().push(payload.sequence_ids.clone());
        }
        outcome
    }
}
