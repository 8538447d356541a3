//! Persistence layer for the data hub.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   hub.json              # channel configs, groups, cursors (atomic snapshot)
//!   channels/<name>.log   # items of one channel (JSON Lines, fsynced appends)
//! ```
//!
//! # Recovery
//!
//! On startup the snapshot restores channels and groups, then each channel's
//! item log is replayed. Cursors resume from the last flushed position, so a
//! crash can redeliver items but never loses them.
//!
//! # Crash Safety
//!
//! - Item logs: partial final lines are truncated on replay
//! - Snapshot and log rewrites: write-to-temp, fsync, rename, fsync directory

pub mod fsync;
pub mod item_log;
pub mod snapshot;

use std::path::{Path, PathBuf};

use crate::types::ChannelName;

pub use fsync::{fsync_dir, fsync_file, write_atomic};
pub use item_log::{HighWater, ItemLog, ItemLogError, ItemRecord, Replayed};
pub use snapshot::{
    GroupRecord, HubSnapshot, SCHEMA_VERSION, SnapshotError, load_snapshot, save_snapshot_atomic,
    try_load_snapshot,
};

/// Path of the hub snapshot under `state_dir`.
pub fn snapshot_path(state_dir: &Path) -> PathBuf {
    state_dir.join("hub.json")
}

/// Path of a channel's item log under `state_dir`.
pub fn item_log_path(state_dir: &Path, channel: &ChannelName) -> PathBuf {
    state_dir.join("channels").join(format!("{}.log", channel.as_str()))
}
