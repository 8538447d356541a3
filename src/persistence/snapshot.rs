//! Hub snapshot: channel configs, groups and their cursors.
//!
//! Stored as pretty JSON at `<state_dir>/hub.json` and always replaced
//! atomically, so a reader sees either the previous or the new snapshot.
//! Items are not part of the snapshot; they live in per-channel item logs.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fsync::write_atomic;
use crate::types::{ChannelConfig, ChannelName, Cursor, SequenceId, SubscriptionGroup};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// A group together with its delivery progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group: SubscriptionGroup,
    pub cursor: Cursor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubSnapshot {
    pub schema_version: u32,
    pub snapshot_at: DateTime<Utc>,
    pub channels: Vec<ChannelConfig>,
    /// Last id issued by each deleted channel.
    #[serde(default)]
    pub retired_channels: BTreeMap<ChannelName, SequenceId>,
    pub groups: Vec<GroupRecord>,
}

impl HubSnapshot {
    pub fn new(
        channels: Vec<ChannelConfig>,
        retired_channels: BTreeMap<ChannelName, SequenceId>,
        groups: Vec<GroupRecord>,
    ) -> Self {
        HubSnapshot {
            schema_version: SCHEMA_VERSION,
            snapshot_at: Utc::now(),
            channels,
            retired_channels,
            groups,
        }
    }
}

/// Saves a snapshot atomically, creating parent directories as needed.
pub fn save_snapshot_atomic(path: &Path, snapshot: &HubSnapshot) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Loads a snapshot, rejecting unknown schema versions.
pub fn load_snapshot(path: &Path) -> Result<HubSnapshot> {
    let bytes = std::fs::read(path)?;
    let snapshot: HubSnapshot = serde_json::from_slice(&bytes)?;

    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }
    Ok(snapshot)
}

/// Like [`load_snapshot`], but a missing file is `Ok(None)`.
pub fn try_load_snapshot(path: &Path) -> Result<Option<HubSnapshot>> {
    match load_snapshot(path) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(SnapshotError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
