//! The hub: channels, subscription groups and their delivery workers behind
//! one façade.
//!
//! Every configuration change is saved to the snapshot before it is
//! acknowledged. Cursor progress is only marked dirty and written by the
//! periodic flush, so a crash may redeliver but never skips.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

use crate::channel::{ChannelLog, LogError};
use crate::config::HubConfig;
use crate::delivery::{
    Callback, Clock, DeliveryError, DeliveryEvent, GroupStatus, Supervisor, WorkerContext,
};
use crate::delivery::supervisor::EVENT_BUFFER;
use crate::links::Links;
use crate::persistence::{HubSnapshot, SnapshotError, save_snapshot_atomic, snapshot_path, try_load_snapshot};
use crate::registry::{RegistryError, SubscriptionRegistry};
use crate::types::{
    ChannelConfig, ChannelName, ChannelPatch, CreateChannel, Cursor, GroupName, GroupSpec, Item,
    SubscriptionGroup,
};

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, HubError>;

/// A group as reported to clients.
#[derive(Debug, Clone)]
pub struct GroupView {
    pub group: SubscriptionGroup,
    pub cursor: Cursor,
    /// `None` if the worker is not running.
    pub status: Option<GroupStatus>,
}

pub struct Hub<C: Callback> {
    channels: Arc<ChannelLog>,
    registry: SubscriptionRegistry,
    supervisor: Supervisor<C>,
    links: Links,
    state_dir: Option<PathBuf>,
    /// Serializes snapshot writes.
    persist_lock: Mutex<()>,
}

impl<C: Callback> Hub<C> {
    /// Opens the hub, restoring any saved state, and starts a worker for
    /// every group. Must be called from within a tokio runtime.
    pub fn open(config: &HubConfig, callback: C) -> Result<Self> {
        Self::open_with_clock(config, callback, Clock::System)
    }

    pub fn open_with_clock(config: &HubConfig, callback: C, clock: Clock) -> Result<Self> {
        let channels = Arc::new(match &config.state_dir {
            Some(dir) => ChannelLog::with_store(dir),
            None => ChannelLog::in_memory(),
        });
        let registry = SubscriptionRegistry::new();

        let mut restored = Vec::new();
        if let Some(dir) = &config.state_dir
            && let Some(snapshot) = try_load_snapshot(&snapshot_path(dir))?
        {
            info!(
                snapshot_at = %snapshot.snapshot_at,
                channels = snapshot.channels.len(),
                groups = snapshot.groups.len(),
                "restoring hub state"
            );
            channels.restore(snapshot.channels, snapshot.retired_channels)?;
            restored = registry.restore(snapshot.groups);
        }

        let links = Links::new(config.app_url.clone());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let supervisor = Supervisor::new(WorkerContext {
            channels: Arc::clone(&channels),
            callback: Arc::new(callback),
            links: links.clone(),
            settings: config.worker_settings(),
            events,
            clock,
        })
        .with_stop_grace(config.stop_grace);

        let hub = Hub {
            channels,
            registry,
            supervisor,
            links,
            state_dir: config.state_dir.clone(),
            persist_lock: Mutex::new(()),
        };
        for name in restored {
            hub.supervisor.spawn(hub.registry.binding(&name)?);
        }
        Ok(hub)
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    /// Read access to the channel log.
    pub fn log(&self) -> &ChannelLog {
        &self.channels
    }

    // ─── Channels ───

    pub fn create_channel(&self, request: CreateChannel) -> Result<ChannelConfig> {
        let config = self.channels.create_channel(request, Utc::now())?;
        self.persist()?;
        // Groups waiting on this channel can attach now.
        self.supervisor.refresh();
        Ok(config)
    }

    pub fn update_channel(&self, name: &ChannelName, patch: ChannelPatch) -> Result<ChannelConfig> {
        let config = self.channels.update_channel(name, patch)?;
        self.persist()?;
        Ok(config)
    }

    pub fn delete_channel(&self, name: &ChannelName) -> Result<()> {
        self.channels.delete_channel(name)?;
        self.persist()?;
        Ok(())
    }

    pub fn append(
        &self,
        channel: &ChannelName,
        payload: Vec<u8>,
        content_type: Option<String>,
        tags: BTreeSet<String>,
    ) -> Result<Arc<Item>> {
        Ok(self.channels.append(channel, payload, content_type, tags)?)
    }

    /// Removes expired items from every channel with a TTL.
    ///
    /// Returns how many items were removed in total.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for config in self.channels.channels() {
            let Some(threshold) = config.expiry_threshold(now) else {
                continue;
            };
            match self.channels.expire_older_than(&config.name, threshold) {
                Ok(n) => removed += n,
                // Deleted concurrently.
                Err(LogError::ChannelNotFound(_)) => {}
                Err(e) => error!(channel = %config.name, error = %e, "expiry sweep failed"),
            }
        }
        removed
    }

    // ─── Groups ───

    /// Creates a group, or updates it if it exists. Returns whether it was
    /// created.
    #[instrument(skip_all, fields(group = %name))]
    pub fn put_group(&self, name: GroupName, spec: GroupSpec) -> Result<(SubscriptionGroup, bool)> {
        if self.registry.contains(&name) {
            let group = self.registry.update(&name, spec)?;
            self.persist()?;
            return Ok((group, false));
        }

        let (group, binding) = self
            .registry
            .create(name, spec, |channel| self.channels.tail(channel).ok())?;
        self.supervisor.spawn(binding);
        self.persist()?;
        Ok((group, true))
    }

    pub fn group(&self, name: &GroupName) -> Result<GroupView> {
        let (group, cursor) = self.registry.get(name)?;
        Ok(GroupView {
            group,
            cursor,
            status: self.supervisor.status(name),
        })
    }

    pub fn groups(&self) -> Vec<SubscriptionGroup> {
        self.registry.list()
    }

    /// Deletes a group. Its worker stops within the stop grace period.
    pub fn delete_group(&self, name: &GroupName) -> Result<()> {
        self.registry.delete(name)?;
        self.supervisor.stop(name);
        self.persist()?;
        Ok(())
    }

    /// Groups with recent delivery failures, ordered by name.
    pub fn groups_with_errors(&self) -> Vec<(GroupName, Vec<DeliveryError>)> {
        self.supervisor
            .statuses()
            .into_iter()
            .filter(|(_, status)| !status.errors.is_empty())
            .map(|(name, status)| (name, status.errors.into_iter().collect()))
            .collect()
    }

    /// Groups whose last completed item is older than `max_age`, oldest
    /// first. Groups that have completed nothing yet are not included.
    pub fn stale_groups(
        &self,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Vec<(GroupName, DateTime<Utc>)> {
        let mut stale: Vec<_> = self
            .supervisor
            .statuses()
            .into_iter()
            .filter_map(|(name, status)| Some((name, status.last_completed_at?)))
            .filter(|(_, at)| now.signed_duration_since(*at) > max_age)
            .collect();
        stale.sort_by_key(|(_, at)| *at);
        stale
    }

    // ─── Engine ───

    pub fn refresh(&self) {
        self.supervisor.refresh();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.supervisor.subscribe()
    }

    /// Saves the snapshot if any cursor moved since the last save.
    pub fn flush_if_dirty(&self) -> Result<bool> {
        if self.state_dir.is_none() || !self.registry.take_dirty() {
            return Ok(false);
        }
        self.write_snapshot()?;
        Ok(true)
    }

    /// Saves the snapshot now.
    pub fn persist(&self) -> Result<()> {
        if self.state_dir.is_none() {
            return Ok(());
        }
        self.registry.take_dirty();
        self.write_snapshot()
    }

    fn write_snapshot(&self) -> Result<()> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock();
        let snapshot = HubSnapshot::new(
            self.channels.channels(),
            self.channels.retired(),
            self.registry.records(),
        );
        if let Err(e) = save_snapshot_atomic(&snapshot_path(dir), &snapshot) {
            self.registry.mark_dirty();
            return Err(e.into());
        }
        debug!(groups = snapshot.groups.len(), "snapshot saved");
        Ok(())
    }

    /// Stops every worker and writes a final snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        self.supervisor.shutdown().await;
        self.persist()?;
        info!("hub stopped");
        Ok(())
    }
}
