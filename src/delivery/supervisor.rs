//! Owns the running delivery workers.
//!
//! The supervisor starts one worker task per subscription group, stops it
//! when the group is deleted, and joins every worker on shutdown. Each worker
//! gets a child of the supervisor's shutdown token, so stopping one group
//! never touches another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::refresh::RefreshCoordinator;
use super::status::{GroupStatus, StatusHandle};
use super::worker::{DeliveryWorker, WorkerContext};
use super::{Callback, DeliveryEvent};
use crate::registry::WorkerBinding;
use crate::types::GroupName;

/// Capacity of the delivery event broadcast. Slow subscribers lag.
pub const EVENT_BUFFER: usize = 1024;

/// How long a stopping worker gets before its task is aborted.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

struct WorkerHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    status: StatusHandle,
}

pub struct Supervisor<C> {
    ctx: WorkerContext<C>,
    workers: Mutex<HashMap<GroupName, WorkerHandle>>,
    refresh: RefreshCoordinator,
    shutdown: CancellationToken,
    stop_grace: Duration,
}

impl<C: Callback> Supervisor<C> {
    pub fn new(ctx: WorkerContext<C>) -> Self {
        Supervisor {
            ctx,
            workers: Mutex::new(HashMap::new()),
            refresh: RefreshCoordinator::new(),
            shutdown: CancellationToken::new(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn context(&self) -> &WorkerContext<C> {
        &self.ctx
    }

    /// Starts the worker for the group behind `binding`, replacing any
    /// worker already running for it.
    pub fn spawn(&self, binding: WorkerBinding) {
        let name = binding.config.borrow().name.clone();
        let status: StatusHandle = Arc::new(Mutex::new(GroupStatus::default()));
        let cancel = self.shutdown.child_token();

        let worker = DeliveryWorker::new(
            self.ctx.clone(),
            binding,
            Arc::clone(&status),
            self.refresh.subscribe(),
            cancel.clone(),
        );
        let task = tokio::spawn(worker.run());

        let previous = self.workers.lock().insert(
            name.clone(),
            WorkerHandle {
                task,
                cancel,
                status,
            },
        );
        if let Some(previous) = previous {
            debug!(group = %name, "replacing running worker");
            self.reap(name, previous);
        } else {
            debug!(group = %name, "worker spawned");
        }
    }

    /// Stops a group's worker. Returns whether one was running.
    ///
    /// In-flight callbacks are abandoned; the worker is aborted if it has
    /// not finished within the stop grace period.
    pub fn stop(&self, name: &GroupName) -> bool {
        let Some(handle) = self.workers.lock().remove(name) else {
            return false;
        };
        self.reap(name.clone(), handle);
        true
    }

    fn reap(&self, name: GroupName, handle: WorkerHandle) {
        handle.cancel.cancel();
        let grace = self.stop_grace;
        let mut task = handle.task;
        tokio::spawn(async move {
            if timeout(grace, &mut task).await.is_err() {
                warn!(group = %name, ?grace, "worker did not stop in time; aborting");
                task.abort();
            }
        });
    }

    pub fn status(&self, name: &GroupName) -> Option<GroupStatus> {
        self.workers
            .lock()
            .get(name)
            .map(|handle| handle.status.lock().clone())
    }

    /// Status of every running worker, ordered by group name.
    pub fn statuses(&self) -> BTreeMap<GroupName, GroupStatus> {
        self.workers
            .lock()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.status.lock().clone()))
            .collect()
    }

    pub fn has_worker(&self, name: &GroupName) -> bool {
        self.workers.lock().contains_key(name)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.ctx.events.subscribe()
    }

    /// Wakes every worker to re-read its channel now.
    pub fn refresh(&self) {
        self.refresh.trigger();
    }

    /// Cancels every worker and waits for them to finish.
    pub async fn shutdown(&self) {
        info!(workers = self.worker_count(), "stopping delivery workers");
        self.shutdown.cancel();

        let handles: Vec<_> = self.workers.lock().drain().collect();
        for (name, mut handle) in handles {
            if timeout(self.stop_grace, &mut handle.task).await.is_err() {
                warn!(group = %name, "worker did not stop in time; aborting");
                handle.task.abort();
            }
        }
        info!("delivery workers stopped");
    }
}
