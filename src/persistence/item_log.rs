//! Per-channel append-only item log.
//!
//! One JSON object per line, payload base64-encoded. Concurrent appenders
//! may land lines out of sequence order, so replay sorts by `seq` instead of
//! treating disorder as corruption.
//!
//! # Recovery
//!
//! A rewrite (after a TTL sweep) starts the file with a high-water line
//! recording the newest id and timestamp the log ever held, so a channel
//! whose items all expired still resumes numbering above them.
//!
//! A crash mid-write leaves a partial final line. Replay stops at the first
//! line that does not parse and truncates the file there, keeping the valid
//! prefix. Sequence ids whose line never made it to disk become permanent
//! gaps; the client that issued them never saw a 201.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::fsync::{fsync_file, write_atomic};
use crate::types::{ChannelName, Item, SequenceId};

#[derive(Debug, Error)]
pub enum ItemLogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ItemLogError>;

/// On-disk form of an item. The channel is implied by the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub seq: SequenceId,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(serialize_with = "encode_payload", deserialize_with = "decode_payload")]
    pub payload: Vec<u8>,
}

impl ItemRecord {
    pub fn from_item(item: &Item) -> Self {
        ItemRecord {
            seq: item.sequence_id,
            ts: item.timestamp,
            tags: item.tags.clone(),
            content_type: item.content_type.clone(),
            payload: item.payload.clone(),
        }
    }

    pub fn into_item(self, channel: ChannelName) -> Item {
        Item {
            channel,
            sequence_id: self.seq,
            timestamp: self.ts,
            tags: self.tags,
            content_type: self.content_type,
            payload: self.payload,
        }
    }
}

/// Newest id and timestamp a log has ever held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWater {
    pub last_seq: SequenceId,
    pub last_ts: DateTime<Utc>,
}

impl HighWater {
    fn raise(current: Option<HighWater>, seq: SequenceId, ts: DateTime<Utc>) -> Option<HighWater> {
        Some(match current {
            Some(hw) => HighWater {
                last_seq: hw.last_seq.max(seq),
                last_ts: hw.last_ts.max(ts),
            },
            None => HighWater {
                last_seq: seq,
                last_ts: ts,
            },
        })
    }
}

/// One line of the log file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum LogLine {
    Item(ItemRecord),
    HighWater { high_water: HighWater },
}

/// Everything recovered from a log file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Replayed {
    /// Sorted by sequence id, duplicates dropped.
    pub records: Vec<ItemRecord>,
    /// Covers both the records and any expired ones recorded by a rewrite.
    pub high_water: Option<HighWater>,
}

fn encode_payload<S: Serializer>(payload: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(payload))
}

fn decode_payload<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// Append handle for one channel's log file.
pub struct ItemLog {
    file: File,
    path: PathBuf,
}

impl ItemLog {
    /// Opens the log for append, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ItemLog { file, path })
    }

    /// Appends one record and syncs it to disk before returning.
    pub fn append(&mut self, record: &ItemRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        fsync_file(&self.file)?;
        Ok(())
    }

    /// Atomically replaces the log with `records` and reopens it for append.
    ///
    /// `high_water` is written first so it outlives the records it covers.
    pub fn rewrite<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a ItemRecord>,
        high_water: Option<HighWater>,
    ) -> Result<()> {
        let mut bytes = Vec::new();
        if let Some(high_water) = high_water {
            serde_json::to_writer(&mut bytes, &LogLine::HighWater { high_water })?;
            bytes.push(b'\n');
        }
        for record in records {
            serde_json::to_writer(&mut bytes, record)?;
            bytes.push(b'\n');
        }
        write_atomic(&self.path, &bytes)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }

    /// Rewrites the log keeping only records for which `keep` holds.
    ///
    /// The file itself is the source of truth, so records appended but not
    /// yet visible to readers are preserved. Returns the number dropped.
    pub fn retain(&mut self, keep: impl Fn(&ItemRecord) -> bool) -> Result<usize> {
        let Replayed {
            records,
            high_water,
        } = Self::replay(&self.path)?;
        let before = records.len();
        let survivors: Vec<ItemRecord> = records.into_iter().filter(|r| keep(r)).collect();
        self.rewrite(&survivors, high_water)?;
        Ok(before - survivors.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every complete record, truncating a partial tail.
    ///
    /// A missing file yields nothing.
    pub fn replay(path: impl AsRef<Path>) -> Result<Replayed> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replayed::default()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut high_water = None;
        let mut valid_len = 0u64;

        loop {
            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }

            let trimmed = line.trim();
            if !trimmed.is_empty() {
                match serde_json::from_str::<LogLine>(trimmed) {
                    // A line without its newline was cut off mid-write even if it parses.
                    Ok(_) if !line.ends_with('\n') => break,
                    Ok(LogLine::Item(record)) => {
                        high_water = HighWater::raise(high_water, record.seq, record.ts);
                        records.push(record);
                    }
                    Ok(LogLine::HighWater { high_water: mark }) => {
                        high_water = HighWater::raise(high_water, mark.last_seq, mark.last_ts);
                    }
                    Err(_) => break,
                }
            }
            valid_len += bytes_read as u64;
        }

        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "truncating partial item log tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            fsync_file(&file)?;
        }

        records.sort_by_key(|r| r.seq);
        records.dedup_by_key(|r| r.seq);
        Ok(Replayed {
            records,
            high_water,
        })
    }

    /// Deletes a channel's log file if present.
    pub fn remove(path: impl AsRef<Path>) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
