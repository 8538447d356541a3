//! Subscription group configuration and cursor state.
//!
//! The registry owns every group's configuration and its cursor. A worker
//! receives a [`WorkerBinding`]: a `watch` receiver for configuration
//! changes and a [`CursorHandle`] it alone writes through. Deleting a group
//! drops the configuration sender, which a worker also observes as a stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::persistence::GroupRecord;
use crate::types::{
    ChannelName, Cursor, GroupConfigError, GroupName, GroupSpec, SequenceId, SubscriptionGroup,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("group not found: {0}")]
    NotFound(GroupName),

    #[error("group already exists: {0}")]
    DuplicateName(GroupName),

    #[error("invalid group configuration: {0}")]
    InvalidConfig(#[from] GroupConfigError),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Shared access to one group's cursor.
///
/// Every mutation marks the registry dirty so the periodic flush persists it.
#[derive(Debug, Clone)]
pub struct CursorHandle {
    cursor: Arc<Mutex<Cursor>>,
    dirty: Arc<AtomicBool>,
}

impl CursorHandle {
    fn new(cursor: Cursor, dirty: Arc<AtomicBool>) -> Self {
        CursorHandle {
            cursor: Arc::new(Mutex::new(cursor)),
            dirty,
        }
    }

    pub fn get(&self) -> Cursor {
        self.cursor.lock().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Cursor) -> R) -> R {
        let result = f(&mut self.cursor.lock());
        self.dirty.store(true, Ordering::Release);
        result
    }
}

/// What a delivery worker needs from the registry.
#[derive(Debug)]
pub struct WorkerBinding {
    pub config: watch::Receiver<SubscriptionGroup>,
    pub cursor: CursorHandle,
}

struct GroupEntry {
    config: watch::Sender<SubscriptionGroup>,
    cursor: CursorHandle,
}

impl GroupEntry {
    fn binding(&self) -> WorkerBinding {
        WorkerBinding {
            config: self.config.subscribe(),
            cursor: self.cursor.clone(),
        }
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    groups: RwLock<HashMap<GroupName, GroupEntry>>,
    dirty: Arc<AtomicBool>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new group.
    ///
    /// `tail_of` reports the current tail of the group's channel, or `None`
    /// if the channel does not exist. The new cursor starts at that tail, so
    /// a group only receives items appended after its creation.
    pub fn create(
        &self,
        name: GroupName,
        spec: GroupSpec,
        tail_of: impl FnOnce(&ChannelName) -> Option<SequenceId>,
    ) -> Result<(SubscriptionGroup, WorkerBinding)> {
        if self.groups.read().contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        let group = SubscriptionGroup::from_spec(name.clone(), spec)?;
        let tail = tail_of(&group.channel)
            .ok_or_else(|| GroupConfigError::UnknownChannel(group.channel.clone()))?;

        let mut groups = self.groups.write();
        if groups.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        let entry = GroupEntry {
            config: watch::Sender::new(group.clone()),
            cursor: CursorHandle::new(Cursor::starting_after(tail), Arc::clone(&self.dirty)),
        };
        let binding = entry.binding();
        groups.insert(name.clone(), entry);
        self.dirty.store(true, Ordering::Release);

        info!(group = %name, channel = %group.channel, start_after = %tail, "group created");
        Ok((group, binding))
    }

    /// Applies a change to an existing group's mutable fields.
    ///
    /// The running worker sees the new configuration through its binding.
    pub fn update(&self, name: &GroupName, spec: GroupSpec) -> Result<SubscriptionGroup> {
        let groups = self.groups.read();
        let entry = groups
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.clone()))?;

        // Read and replace under the watch's lock.
        let mut outcome = None;
        entry.config.send_if_modified(|current| match current.with_spec(spec) {
            Ok(updated) => {
                *current = updated.clone();
                outcome = Some(Ok(updated));
                true
            }
            Err(e) => {
                outcome = Some(Err(e));
                false
            }
        });
        let updated = match outcome {
            Some(Ok(updated)) => updated,
            Some(Err(e @ GroupConfigError::ChannelUrlChanged { .. })) => {
                return Err(RegistryError::Conflict(e.to_string()));
            }
            Some(Err(other)) => return Err(RegistryError::InvalidConfig(other)),
            None => return Err(RegistryError::NotFound(name.clone())),
        };
        self.dirty.store(true, Ordering::Release);

        debug!(group = %name, "group updated");
        Ok(updated)
    }

    /// Removes a group, returning its final configuration and cursor.
    pub fn delete(&self, name: &GroupName) -> Result<(SubscriptionGroup, Cursor)> {
        let entry = self
            .groups
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.clone()))?;
        self.dirty.store(true, Ordering::Release);

        info!(group = %name, "group deleted");
        let group = entry.config.borrow().clone();
        Ok((group, entry.cursor.get()))
    }

    pub fn get(&self, name: &GroupName) -> Result<(SubscriptionGroup, Cursor)> {
        let groups = self.groups.read();
        let entry = groups
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.clone()))?;
        let group = entry.config.borrow().clone();
        Ok((group, entry.cursor.get()))
    }

    pub fn contains(&self, name: &GroupName) -> bool {
        self.groups.read().contains_key(name)
    }

    /// All groups, ordered by name.
    pub fn list(&self) -> Vec<SubscriptionGroup> {
        let mut groups: Vec<_> = self
            .groups
            .read()
            .values()
            .map(|entry| entry.config.borrow().clone())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    /// A fresh binding for an existing group, used to (re)start its worker.
    pub fn binding(&self, name: &GroupName) -> Result<WorkerBinding> {
        self.groups
            .read()
            .get(name)
            .map(GroupEntry::binding)
            .ok_or_else(|| RegistryError::NotFound(name.clone()))
    }

    /// Every group with its cursor, ordered by name, for snapshots.
    pub fn records(&self) -> Vec<GroupRecord> {
        let mut records: Vec<_> = self
            .groups
            .read()
            .values()
            .map(|entry| GroupRecord {
                group: entry.config.borrow().clone(),
                cursor: entry.cursor.get(),
            })
            .collect();
        records.sort_by(|a, b| a.group.name.cmp(&b.group.name));
        records
    }

    /// Loads persisted groups. In-flight ranges are cleared; their items are
    /// redelivered from `last_delivered`.
    pub fn restore(&self, records: Vec<GroupRecord>) -> Vec<GroupName> {
        let mut groups = self.groups.write();
        records
            .into_iter()
            .map(|record| {
                let name = record.group.name.clone();
                let mut cursor = record.cursor;
                cursor.in_flight = None;
                cursor.next_attempt_at = None;
                groups.insert(
                    name.clone(),
                    GroupEntry {
                        config: watch::Sender::new(record.group),
                        cursor: CursorHandle::new(cursor, Arc::clone(&self.dirty)),
                    },
                );
                name
            })
            .collect()
    }

    /// Returns whether anything changed since the last call, and clears it.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Flags unsaved changes again, e.g. after a failed flush.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}
