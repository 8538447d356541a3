//! The per-group delivery worker.
//!
//! A worker reads windows of items after its cursor, hands each to the
//! group's callback on a spawned task, and folds acknowledgments back into
//! the cursor. Non-transactional groups keep up to `parallelCalls` windows in
//! flight; transactional and `BATCH_SEQUENTIAL` groups keep one.
//!
//! # Event loop
//!
//! ```text
//!   loop {
//!       fill()            // dispatch new windows while under capacity
//!       settle_state()
//!       select! {
//!           cancelled / group deleted  => stop
//!           config changed             => adopt new config
//!           task finished              => accept or schedule retry
//!           retry timer                => skip expired, re-dispatch
//!           tail moved / refresh / poll
//!       }
//!   }
//! ```
//!
//! A failed window is re-dispatched unchanged. While a retry is pending no
//! new windows are fetched, so a group never runs ahead of its failures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::callback::{Callback, DeliveryFailure, DeliveryPayload};
use super::retry::RetryScheduler;
use super::state::WorkerState;
use super::status::{DeliveryError, StatusHandle};
use super::window::InFlightWindows;
use super::{Clock, DeliveryEvent};
use crate::channel::ChannelLog;
use crate::links::Links;
use crate::registry::{CursorHandle, WorkerBinding};
use crate::types::{GroupName, Item, SequenceId, SequenceRange, SubscriptionGroup};

/// How often an idle worker re-reads its channel without being woken.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Most items per window in the batch modes.
pub const DEFAULT_BATCH_WINDOW: usize = 50;

/// Retry deadline used when the backoff overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub batch_window: usize,
    pub retry: RetryScheduler,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_window: DEFAULT_BATCH_WINDOW,
            retry: RetryScheduler::default(),
        }
    }
}

/// Everything a worker shares with the rest of the hub.
pub struct WorkerContext<C> {
    pub channels: Arc<ChannelLog>,
    pub callback: Arc<C>,
    pub links: Links,
    pub settings: WorkerSettings,
    pub events: broadcast::Sender<DeliveryEvent>,
    pub clock: Clock,
}

impl<C> Clone for WorkerContext<C> {
    fn clone(&self) -> Self {
        WorkerContext {
            channels: Arc::clone(&self.channels),
            callback: Arc::clone(&self.callback),
            links: self.links.clone(),
            settings: self.settings,
            events: self.events.clone(),
            clock: self.clock,
        }
    }
}

/// Items dispatched together.
#[derive(Debug)]
struct Window {
    range: SequenceRange,
    items: Vec<Arc<Item>>,
}

type Joined = Result<(task::Id, Result<(), DeliveryFailure>), JoinError>;

enum Wake {
    Cancelled,
    Deleted,
    ConfigChanged,
    Joined(Joined),
    RetryDue,
    TailMoved,
    TailClosed,
    Refresh,
    RefreshClosed,
    Poll,
}

pub struct DeliveryWorker<C> {
    name: GroupName,
    ctx: WorkerContext<C>,
    config: watch::Receiver<SubscriptionGroup>,
    group: SubscriptionGroup,
    cursor: CursorHandle,
    status: StatusHandle,
    refresh: Option<watch::Receiver<u64>>,
    tail: Option<watch::Receiver<SequenceId>>,
    cancel: CancellationToken,
    state: WorkerState,

    windows: InFlightWindows,
    /// Keyed by the window's current first id.
    batches: BTreeMap<SequenceId, Window>,
    tasks: JoinSet<Result<(), DeliveryFailure>>,
    task_windows: HashMap<task::Id, SequenceId>,
    /// Windows waiting for the retry timer.
    failed: BTreeSet<SequenceId>,
    retry_at: Option<Instant>,
}

impl<C: Callback> DeliveryWorker<C> {
    pub fn new(
        ctx: WorkerContext<C>,
        binding: WorkerBinding,
        status: StatusHandle,
        refresh: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> Self {
        let WorkerBinding { mut config, cursor } = binding;
        let group = config.borrow_and_update().clone();
        let delivered = cursor.get().last_delivered;
        let tail = ctx.channels.subscribe_tail(&group.channel).ok();

        DeliveryWorker {
            name: group.name.clone(),
            ctx,
            config,
            group,
            cursor,
            status,
            refresh: Some(refresh),
            tail,
            cancel,
            state: WorkerState::Idle,
            windows: InFlightWindows::new(delivered),
            batches: BTreeMap::new(),
            tasks: JoinSet::new(),
            task_windows: HashMap::new(),
            failed: BTreeSet::new(),
            retry_at: None,
        }
    }

    /// Runs until the group is deleted or the worker is cancelled.
    #[instrument(skip(self), fields(group = %self.name))]
    pub async fn run(mut self) {
        info!(
            channel = %self.group.channel,
            after = %self.windows.delivered(),
            "delivery worker started"
        );

        loop {
            self.fill();
            self.settle_state();

            match self.next_wake().await {
                Wake::Cancelled => {
                    self.stop("cancelled");
                    return;
                }
                Wake::Deleted => {
                    self.stop("group deleted");
                    return;
                }
                Wake::ConfigChanged => self.on_config_changed(),
                Wake::Joined(joined) => self.on_joined(joined),
                Wake::RetryDue => self.on_retry_due(),
                Wake::TailMoved => {}
                Wake::TailClosed => {
                    debug!("channel closed; waiting for it to reappear");
                    self.tail = None;
                }
                Wake::Refresh | Wake::Poll => self.resubscribe_tail(),
                Wake::RefreshClosed => self.refresh = None,
            }
        }
    }

    async fn next_wake(&mut self) -> Wake {
        let retry_at = self.retry_at;
        let poll_interval = self.ctx.settings.poll_interval;

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Wake::Cancelled,

            changed = self.config.changed() => match changed {
                Ok(()) => Wake::ConfigChanged,
                Err(_) => Wake::Deleted,
            },

            Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                Wake::Joined(joined)
            }

            _ = async {
                match retry_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => Wake::RetryDue,

            open = changed_opt(&mut self.tail) => {
                if open { Wake::TailMoved } else { Wake::TailClosed }
            }

            open = changed_opt(&mut self.refresh) => {
                if open { Wake::Refresh } else { Wake::RefreshClosed }
            }

            _ = sleep(poll_interval) => Wake::Poll,
        }
    }

    /// Dispatches new windows until the group's capacity is reached or the
    /// channel has nothing more.
    fn fill(&mut self) {
        if self.retry_at.is_some() {
            return;
        }
        let capacity = self.group.window_capacity();
        let per_window = self.group.items_per_window(self.ctx.settings.batch_window);

        while self.windows.len() < capacity {
            self.enter(WorkerState::Fetching);
            let after = self.windows.highest();
            let items = match self.ctx.channels.read_from(
                &self.group.channel,
                after,
                per_window,
                self.ctx.clock.now(),
            ) {
                Ok(items) => items,
                Err(e) => {
                    trace!(error = %e, "channel unavailable");
                    break;
                }
            };
            let (Some(first), Some(last)) = (items.first(), items.last()) else {
                break;
            };
            let range = SequenceRange::new(first.sequence_id, last.sequence_id);
            self.windows.open(range.first, range.last);
            self.dispatch(Window { range, items });
        }
    }

    fn dispatch(&mut self, window: Window) {
        self.enter(WorkerState::Dispatching);

        let payload = DeliveryPayload::new(&self.group, &window.items, &self.ctx.links);
        let callback = Arc::clone(&self.ctx.callback);
        let url = self.group.callback_url.clone();
        let ack_wait = self.group.transactional.then(|| self.group.max_wait());

        let handle = self.tasks.spawn(async move {
            let delivery = callback.deliver(&url, &payload);
            match ack_wait {
                Some(wait) => timeout(wait, delivery)
                    .await
                    .unwrap_or(Err(DeliveryFailure::AckTimeout(wait))),
                None => delivery.await,
            }
        });

        debug!(
            first = %window.range.first,
            last = %window.range.last,
            items = window.items.len(),
            "window dispatched"
        );
        self.task_windows.insert(handle.id(), window.range.first);
        self.batches.insert(window.range.first, window);
        self.publish_progress();
    }

    fn on_joined(&mut self, joined: Joined) {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => (
                e.id(),
                Err(DeliveryFailure::Network(format!("delivery task failed: {e}"))),
            ),
        };
        let Some(first) = self.task_windows.remove(&id) else {
            return;
        };
        match outcome {
            Ok(()) => self.on_accepted(first),
            Err(failure) => self.on_failed(first, failure),
        }
    }

    fn on_accepted(&mut self, first: SequenceId) {
        let Some(window) = self.batches.remove(&first) else {
            return;
        };
        let now = self.ctx.clock.now();
        let watermark = self.windows.complete(first);
        let clear_failures = self.failed.is_empty();

        self.cursor.update(|cursor| {
            if let Some(id) = watermark {
                cursor.advance_to(id);
            }
            if clear_failures {
                cursor.reset_failures();
            }
        });
        if let Some(id) = watermark {
            self.status.lock().record_completed(id, now);
        }
        self.publish_progress();

        info!(
            first = %window.range.first,
            last = %window.range.last,
            delivered = %self.windows.delivered(),
            "window delivered"
        );
        self.emit(DeliveryEvent::Delivered {
            group: self.name.clone(),
            sequence_ids: window.items.iter().map(|item| item.sequence_id).collect(),
        });
    }

    fn on_failed(&mut self, first: SequenceId, failure: DeliveryFailure) {
        let Some(range) = self.batches.get(&first).map(|window| window.range) else {
            return;
        };
        self.failed.insert(first);

        let now = self.ctx.clock.now();
        let max_wait = self.group.max_wait();
        let retry = self.ctx.settings.retry;
        let plan = self
            .cursor
            .update(|cursor| retry.record_failure(cursor, max_wait, now));
        let now_instant = Instant::now();
        self.retry_at = Some(
            now_instant
                .checked_add(plan.delay)
                .unwrap_or(now_instant + FAR_FUTURE),
        );

        warn!(
            first = %range.first,
            last = %range.last,
            attempt = plan.attempt,
            delay = ?plan.delay,
            error = %failure,
            "delivery failed; retrying"
        );
        self.status.lock().record_error(DeliveryError {
            at: now,
            range,
            attempt: plan.attempt,
            message: failure.to_string(),
        });
        self.emit(DeliveryEvent::Retrying {
            group: self.name.clone(),
            range,
            attempt: plan.attempt,
            delay: plan.delay,
            error: failure,
        });
    }

    fn on_retry_due(&mut self) {
        self.retry_at = None;
        self.cursor.update(|cursor| cursor.next_attempt_at = None);

        let now = self.ctx.clock.now();
        let mut redispatched = false;
        for first in std::mem::take(&mut self.failed) {
            let Some(window) = self.batches.remove(&first) else {
                continue;
            };
            if let Some(window) = self.skip_expired(window, now) {
                self.dispatch(window);
                redispatched = true;
            }
        }

        if !redispatched {
            self.cursor.update(|cursor| cursor.reset_failures());
        }
    }

    /// Drops the leading items of a failed window that have outlived the
    /// group's `ttlMinutes`. Returns what is left to re-dispatch.
    fn skip_expired(&mut self, window: Window, now: DateTime<Utc>) -> Option<Window> {
        let Some(ttl) = self.group.undeliverable_ttl() else {
            return Some(window);
        };
        let expired = window
            .items
            .iter()
            .take_while(|item| item.age(now) >= ttl)
            .count();
        if expired == 0 {
            return Some(window);
        }

        self.enter(WorkerState::Skipping);
        let Window { range, mut items } = window;
        let rest = items.split_off(expired);
        let watermark = match rest.first() {
            Some(next) => self.windows.split_front(range.first, next.sequence_id),
            None => self.windows.complete(range.first),
        };
        self.cursor.update(|cursor| {
            if let Some(id) = watermark {
                cursor.advance_to(id);
            }
        });

        for item in &items {
            warn!(
                seq = %item.sequence_id,
                age_secs = item.age(now).num_seconds(),
                "item undeliverable; skipping"
            );
            self.emit(DeliveryEvent::Skipped {
                group: self.name.clone(),
                sequence_id: item.sequence_id,
            });
        }
        if let Some(id) = watermark {
            self.status.lock().record_completed(id, now);
        }

        let next = rest.first()?.sequence_id;
        Some(Window {
            range: SequenceRange::new(next, range.last),
            items: rest,
        })
    }

    fn on_config_changed(&mut self) {
        let group = self.config.borrow_and_update().clone();
        info!(
            batch = group.batch.as_str(),
            transactional = group.transactional,
            parallel_calls = group.parallel_calls,
            "group configuration updated"
        );
        self.group = group;
    }

    fn resubscribe_tail(&mut self) {
        if self.tail.is_none() {
            self.tail = self.ctx.channels.subscribe_tail(&self.group.channel).ok();
            if self.tail.is_some() {
                debug!("channel available again");
            }
        }
    }

    fn settle_state(&mut self) {
        let next = if self.retry_at.is_some() {
            WorkerState::Retrying
        } else if self.windows.is_empty() {
            WorkerState::Idle
        } else if self.group.transactional {
            WorkerState::AwaitingAck
        } else {
            WorkerState::Dispatching
        };
        self.enter(next);
    }

    fn publish_progress(&mut self) {
        let range = self.windows.in_flight_range();
        self.cursor.update(|cursor| cursor.in_flight = range);
        self.status.lock().in_flight = self
            .batches
            .values()
            .flat_map(|window| window.items.iter().map(|item| item.sequence_id))
            .collect();
    }

    fn stop(&mut self, reason: &str) {
        self.tasks.abort_all();
        self.enter(WorkerState::Stopped);
        self.status.lock().in_flight.clear();
        info!(reason, delivered = %self.windows.delivered(), "delivery worker stopped");
        self.emit(DeliveryEvent::Stopped {
            group: self.name.clone(),
        });
    }

    fn enter(&mut self, next: WorkerState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "unexpected worker state transition");
        }
        trace!(from = %self.state, to = %next, "worker state");
        self.state = next;
        self.status.lock().state = next;
    }

    fn emit(&self, event: DeliveryEvent) {
        // Nobody listening is fine.
        let _ = self.ctx.events.send(event);
    }
}

/// Waits for a change on an optional watch. Resolves to `false` once the
/// sender is gone; never resolves for `None`.
async fn changed_opt<T>(rx: &mut Option<watch::Receiver<T>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
