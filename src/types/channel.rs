//! Channel configuration and its create/patch request shapes.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::ids::{ChannelName, InvalidName, validate_tag};

/// Configuration of a channel.
///
/// Tags are held in a `BTreeSet`, so they serialize de-duplicated and sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub name: ChannelName,

    /// Retention in milliseconds; `None` keeps items forever.
    pub ttl_millis: Option<u64>,

    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub description: String,

    pub creation_date: DateTime<Utc>,
}

impl ChannelConfig {
    /// Builds a validated configuration from a create request.
    pub fn from_request(request: CreateChannel, now: DateTime<Utc>) -> Result<Self, InvalidName> {
        Ok(ChannelConfig {
            name: ChannelName::new(request.name)?,
            ttl_millis: validate_ttl(request.ttl_millis)?,
            tags: normalize_tags(&request.tags)?,
            description: request.description.unwrap_or_default(),
            creation_date: now,
        })
    }

    /// Applies a patch in place.
    ///
    /// `ttlMillis: null` clears the TTL while an absent field leaves it alone.
    pub fn apply(&mut self, patch: ChannelPatch) -> Result<(), InvalidName> {
        if let Some(ttl) = patch.ttl_millis {
            self.ttl_millis = validate_ttl(ttl)?;
        }
        if let Some(tags) = patch.tags {
            self.tags = normalize_tags(&tags)?;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        Ok(())
    }

    /// Items with a timestamp strictly before this instant are expired.
    pub fn expiry_threshold(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = Duration::try_milliseconds(i64::try_from(self.ttl_millis?).ok()?)?;
        now.checked_sub_signed(ttl)
    }
}

fn validate_ttl(ttl: Option<u64>) -> Result<Option<u64>, InvalidName> {
    match ttl {
        Some(0) => Err(InvalidName {
            kind: "ttlMillis",
            value: "0".to_string(),
            reason: "must be positive or null",
        }),
        other => Ok(other),
    }
}

/// Trims, validates and de-duplicates a tag list.
pub fn normalize_tags(tags: &[String]) -> Result<BTreeSet<String>, InvalidName> {
    tags.iter().map(|t| validate_tag(t)).collect()
}

/// Body of `POST /channel`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannel {
    pub name: String,

    #[serde(default)]
    pub ttl_millis: Option<u64>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,
}

/// Body of `PATCH /channel/{name}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPatch {
    /// Outer `None`: field absent. `Some(None)`: explicit `null`.
    #[serde(default, deserialize_with = "present")]
    pub ttl_millis: Option<Option<u64>>,

    #[serde(default)]
    pub tags: Option<Vec<String>>,

    #[serde(default)]
    pub description: Option<String>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}
