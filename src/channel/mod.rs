//! Append-only, per-channel item log.
//!
//! Each channel owns its own locks; there is no lock spanning channels on
//! the append or read path.
//!
//! # Ordering
//!
//! Appending takes the per-channel sequencer mutex only long enough to assign
//! the next id and a timestamp strictly after the previous one. Storage then
//! proceeds outside it, so items of one channel may finish storing out of
//! order. Readers only see the *committed* prefix: ids up to the highest id
//! below which every assigned id has settled (stored or failed). A reader
//! that has seen id `n` will therefore never later discover an item `< n`.
//!
//! # Notification
//!
//! Every channel publishes its committed id on a `watch` channel, which
//! delivery workers use to wake up when new items become visible.

pub mod tags;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::persistence::{ItemLog, ItemLogError, ItemRecord, Replayed, item_log_path};
use crate::types::{
    ChannelConfig, ChannelName, ChannelPatch, CreateChannel, InvalidName, Item, SequenceId,
};

pub use tags::TagIndex;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelName),

    #[error("channel already exists: {0}")]
    DuplicateChannel(ChannelName),

    #[error(transparent)]
    InvalidConfig(#[from] InvalidName),

    #[error("storage error: {0}")]
    Storage(#[from] ItemLogError),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Id and timestamp assignment for one channel.
#[derive(Debug, Default)]
struct Sequencer {
    last_id: SequenceId,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Sequencer {
    fn assign(&mut self, now: DateTime<Utc>) -> (SequenceId, DateTime<Utc>) {
        let mut timestamp = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        if let Some(last) = self.last_timestamp
            && timestamp <= last
        {
            timestamp = last + Duration::milliseconds(1);
        }
        self.last_id = self.last_id.next();
        self.last_timestamp = Some(timestamp);
        (self.last_id, timestamp)
    }
}

#[derive(Debug, Default)]
struct ItemsState {
    items: BTreeMap<SequenceId, Arc<Item>>,
    /// Every id `<= committed` has settled.
    committed: SequenceId,
    /// Settled ids above `committed`, waiting for the ids below them.
    settled: BTreeSet<SequenceId>,
    tags: TagIndex,
}

impl ItemsState {
    /// Marks `id` as settled. Returns whether the committed watermark moved.
    fn settle(&mut self, id: SequenceId) -> bool {
        self.settled.insert(id);
        let before = self.committed;
        while self.settled.remove(&self.committed.next()) {
            self.committed = self.committed.next();
        }
        self.committed != before
    }

    fn visible(
        &self,
        after: SequenceId,
        threshold: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = &Arc<Item>> {
        let range = if after < self.committed {
            Some(
                self.items
                    .range((Bound::Excluded(after), Bound::Included(self.committed))),
            )
        } else {
            None
        };
        range
            .into_iter()
            .flatten()
            .map(|(_, item)| item)
            .filter(move |item| live(item, threshold))
    }
}

fn live(item: &Item, threshold: Option<DateTime<Utc>>) -> bool {
    threshold.is_none_or(|t| item.timestamp >= t)
}

struct ChannelEntry {
    config: RwLock<ChannelConfig>,
    sequencer: Mutex<Sequencer>,
    items: RwLock<ItemsState>,
    tail: watch::Sender<SequenceId>,
    writer: Mutex<Option<ItemLog>>,
}

impl ChannelEntry {
    fn new(
        config: ChannelConfig,
        floor: SequenceId,
        replayed: Replayed,
        writer: Option<ItemLog>,
    ) -> Self {
        let mut state = ItemsState::default();
        let mut sequencer = Sequencer {
            last_id: floor,
            last_timestamp: None,
        };
        if let Some(high_water) = replayed.high_water {
            sequencer.last_id = sequencer.last_id.max(high_water.last_seq);
            sequencer.last_timestamp = Some(high_water.last_ts);
        }
        for record in replayed.records {
            let item = record.into_item(config.name.clone());
            sequencer.last_id = sequencer.last_id.max(item.sequence_id);
            sequencer.last_timestamp = sequencer.last_timestamp.max(Some(item.timestamp));
            state.tags.insert(&item);
            state.items.insert(item.sequence_id, Arc::new(item));
        }
        state.committed = sequencer.last_id;
        let (tail, _) = watch::channel(state.committed);

        ChannelEntry {
            config: RwLock::new(config),
            sequencer: Mutex::new(sequencer),
            items: RwLock::new(state),
            tail,
            writer: Mutex::new(writer),
        }
    }

    fn append(
        &self,
        payload: Vec<u8>,
        content_type: Option<String>,
        tags: BTreeSet<String>,
    ) -> Result<Arc<Item>> {
        let (sequence_id, timestamp) = self.sequencer.lock().assign(Utc::now());

        let item = Arc::new(Item {
            channel: self.config.read().name.clone(),
            sequence_id,
            timestamp,
            tags,
            content_type,
            payload,
        });

        let stored = match self.writer.lock().as_mut() {
            Some(log) => log.append(&ItemRecord::from_item(&item)),
            None => Ok(()),
        };

        let committed = {
            let mut state = self.items.write();
            if stored.is_ok() {
                state.tags.insert(&item);
                state.items.insert(sequence_id, Arc::clone(&item));
            }
            state.settle(sequence_id).then_some(state.committed)
        };

        if let Some(committed) = committed {
            self.tail.send_if_modified(|current| {
                let newer = committed > *current;
                if newer {
                    *current = committed;
                }
                newer
            });
        }

        if let Err(e) = stored {
            warn!(channel = %item.channel, seq = %sequence_id, error = %e, "item append failed; id left as a gap");
            return Err(e.into());
        }
        Ok(item)
    }

    fn threshold(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.config.read().expiry_threshold(now)
    }
}

/// The set of channels and their items.
pub struct ChannelLog {
    channels: RwLock<HashMap<ChannelName, Arc<ChannelEntry>>>,
    /// Highest id issued by deleted channels, so a recreated channel never
    /// reuses ids a subscriber has already consumed.
    retired: Mutex<BTreeMap<ChannelName, SequenceId>>,
    store: Option<PathBuf>,
}

impl ChannelLog {
    /// A log kept purely in memory.
    pub fn in_memory() -> Self {
        ChannelLog {
            channels: RwLock::new(HashMap::new()),
            retired: Mutex::new(BTreeMap::new()),
            store: None,
        }
    }

    /// A log persisting items under `state_dir/channels/`.
    pub fn with_store(state_dir: impl Into<PathBuf>) -> Self {
        ChannelLog {
            store: Some(state_dir.into()),
            ..ChannelLog::in_memory()
        }
    }

    fn entry(&self, name: &ChannelName) -> Result<Arc<ChannelEntry>> {
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LogError::ChannelNotFound(name.clone()))
    }

    fn open_writer(&self, name: &ChannelName) -> Result<Option<ItemLog>> {
        self.store
            .as_ref()
            .map(|dir| ItemLog::open(item_log_path(dir, name)))
            .transpose()
            .map_err(|e| LogError::Storage(e.into()))
    }

    /// Rebuilds channels from persisted configs, replaying their item logs.
    pub fn restore(
        &self,
        configs: Vec<ChannelConfig>,
        retired: BTreeMap<ChannelName, SequenceId>,
    ) -> Result<()> {
        for config in configs {
            let name = config.name.clone();
            let floor = retired.get(&name).copied().unwrap_or_default();
            let replayed = match &self.store {
                Some(dir) => ItemLog::replay(item_log_path(dir, &name))?,
                None => Replayed::default(),
            };
            let writer = self.open_writer(&name)?;
            let count = replayed.records.len();
            let entry = ChannelEntry::new(config, floor, replayed, writer);
            let tail = *entry.tail.borrow();
            info!(channel = %name, items = count, tail = %tail, "restored channel");
            self.channels.write().insert(name, Arc::new(entry));
        }
        *self.retired.lock() = retired;
        Ok(())
    }

    pub fn create_channel(&self, request: CreateChannel, now: DateTime<Utc>) -> Result<ChannelConfig> {
        let config = ChannelConfig::from_request(request, now)?;
        let name = config.name.clone();
        if self.channels.read().contains_key(&name) {
            return Err(LogError::DuplicateChannel(name));
        }

        let floor = self.retired.lock().get(&name).copied().unwrap_or_default();
        let writer = self.open_writer(&name)?;
        let entry = Arc::new(ChannelEntry::new(config.clone(), floor, Replayed::default(), writer));

        let mut channels = self.channels.write();
        if channels.contains_key(&name) {
            return Err(LogError::DuplicateChannel(name));
        }
        channels.insert(name.clone(), entry);
        info!(channel = %name, ttl_millis = ?config.ttl_millis, "channel created");
        Ok(config)
    }

    pub fn update_channel(&self, name: &ChannelName, patch: ChannelPatch) -> Result<ChannelConfig> {
        let entry = self.entry(name)?;
        let mut config = entry.config.write();
        let mut updated = config.clone();
        updated.apply(patch)?;
        *config = updated.clone();
        debug!(channel = %name, ttl_millis = ?updated.ttl_millis, "channel updated");
        Ok(updated)
    }

    /// Removes a channel and its items.
    pub fn delete_channel(&self, name: &ChannelName) -> Result<()> {
        let entry = self
            .channels
            .write()
            .remove(name)
            .ok_or_else(|| LogError::ChannelNotFound(name.clone()))?;

        let last_id = entry.sequencer.lock().last_id;
        self.retired.lock().insert(name.clone(), last_id);

        if let Some(log) = entry.writer.lock().take() {
            ItemLog::remove(log.path()).map_err(|e| LogError::Storage(e.into()))?;
        }
        info!(channel = %name, last_id = %last_id, "channel deleted");
        Ok(())
    }

    pub fn channel(&self, name: &ChannelName) -> Result<ChannelConfig> {
        Ok(self.entry(name)?.config.read().clone())
    }

    pub fn contains(&self, name: &ChannelName) -> bool {
        self.channels.read().contains_key(name)
    }

    /// All channel configs, ordered by name.
    pub fn channels(&self) -> Vec<ChannelConfig> {
        let mut configs: Vec<_> = self
            .channels
            .read()
            .values()
            .map(|entry| entry.config.read().clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn retired(&self) -> BTreeMap<ChannelName, SequenceId> {
        self.retired.lock().clone()
    }

    /// Appends an item, assigning its id and timestamp.
    pub fn append(
        &self,
        channel: &ChannelName,
        payload: Vec<u8>,
        content_type: Option<String>,
        tags: BTreeSet<String>,
    ) -> Result<Arc<Item>> {
        let item = self.entry(channel)?.append(payload, content_type, tags)?;
        debug!(channel = %channel, seq = %item.sequence_id, bytes = item.payload.len(), "item appended");
        Ok(item)
    }

    /// Up to `limit` live items after `after`, ascending.
    ///
    /// Restartable from any id; expired items and gaps are skipped.
    pub fn read_from(
        &self,
        channel: &ChannelName,
        after: SequenceId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arc<Item>>> {
        let entry = self.entry(channel)?;
        let threshold = entry.threshold(now);
        let state = entry.items.read();
        Ok(state.visible(after, threshold).take(limit).cloned().collect())
    }

    /// The newest live item, if any.
    pub fn latest(&self, channel: &ChannelName, now: DateTime<Utc>) -> Result<Option<Arc<Item>>> {
        let entry = self.entry(channel)?;
        let threshold = entry.threshold(now);
        let state = entry.items.read();
        Ok(state
            .items
            .range(..=state.committed)
            .rev()
            .map(|(_, item)| item)
            .find(|item| live(item, threshold))
            .cloned())
    }

    pub fn get(
        &self,
        channel: &ChannelName,
        id: SequenceId,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<Item>>> {
        let entry = self.entry(channel)?;
        let threshold = entry.threshold(now);
        let state = entry.items.read();
        if id > state.committed {
            return Ok(None);
        }
        Ok(state
            .items
            .get(&id)
            .filter(|item| live(item, threshold))
            .cloned())
    }

    /// Highest committed id of the channel.
    pub fn tail(&self, channel: &ChannelName) -> Result<SequenceId> {
        Ok(self.entry(channel)?.items.read().committed)
    }

    /// Watches the committed id. The sender goes away with the channel.
    pub fn subscribe_tail(&self, channel: &ChannelName) -> Result<watch::Receiver<SequenceId>> {
        Ok(self.entry(channel)?.tail.subscribe())
    }

    /// Removes committed items with a timestamp before `threshold`.
    ///
    /// Surviving items keep their ids. Returns how many were removed.
    pub fn expire_older_than(&self, channel: &ChannelName, threshold: DateTime<Utc>) -> Result<usize> {
        let entry = self.entry(channel)?;

        let removed: BTreeSet<SequenceId> = {
            let mut guard = entry.items.write();
            let ItemsState {
                items,
                committed,
                tags,
                ..
            } = &mut *guard;
            let expired: Vec<SequenceId> = items
                .range(..=*committed)
                .take_while(|(_, item)| item.timestamp < threshold)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                if let Some(item) = items.remove(id) {
                    tags.remove(&item);
                }
            }
            expired.into_iter().collect()
        };

        if removed.is_empty() {
            return Ok(0);
        }
        if let Some(log) = entry.writer.lock().as_mut() {
            log.retain(|record| !removed.contains(&record.seq))?;
        }
        debug!(channel = %channel, removed = removed.len(), "expired items");
        Ok(removed.len())
    }

    /// Ids of live items in `channel` carrying `tag`.
    pub fn items_with_tag(
        &self,
        channel: &ChannelName,
        tag: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SequenceId>> {
        let entry = self.entry(channel)?;
        let threshold = entry.threshold(now);
        let state = entry.items.read();
        Ok(state
            .tags
            .lookup(tag)
            .take_while(|id| *id <= state.committed)
            .filter(|id| state.items.get(id).is_some_and(|item| live(item, threshold)))
            .collect())
    }

    /// Channels whose config carries `tag`, ordered by name.
    pub fn channels_with_tag(&self, tag: &str) -> Vec<ChannelName> {
        self.channels()
            .into_iter()
            .filter(|config| config.tags.contains(tag))
            .map(|config| config.name)
            .collect()
    }

    /// Union of all channel tags.
    pub fn all_tags(&self) -> BTreeSet<String> {
        self.channels
            .read()
            .values()
            .flat_map(|entry| entry.config.read().tags.clone())
            .collect()
    }
}
