//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of channel names, group names and
//! sequence ids, and validate names once at the boundary so the rest of the
//! engine can treat them as trusted.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest accepted channel or group name.
pub const MAX_NAME_LEN: usize = 48;

/// A name that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} {value:?}: {reason}")]
pub struct InvalidName {
    pub kind: &'static str,
    pub value: String,
    pub reason: &'static str,
}

fn validate(kind: &'static str, value: &str, extra: &[char]) -> Result<(), InvalidName> {
    let fail = |reason| InvalidName {
        kind,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(fail("must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(fail("must be at most 48 characters"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-' || extra.contains(&c);
    if !value.chars().all(allowed) {
        return Err(fail("contains characters outside the allowed set"));
    }
    Ok(())
}

/// Validates a tag and returns it trimmed.
///
/// Tags allow `:` and `.` on top of the name alphabet, so `tag:z` is valid.
pub fn validate_tag(raw: &str) -> Result<String, InvalidName> {
    let tag = raw.trim();
    validate("tag", tag, &[':', '.'])?;
    Ok(tag.to_string())
}

/// The unique, immutable name of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidName> {
        let name = name.into();
        validate("channel name", &name, &[])?;
        Ok(ChannelName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelName {
    type Error = InvalidName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ChannelName::new(value)
    }
}

impl From<ChannelName> for String {
    fn from(name: ChannelName) -> Self {
        name.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unique name of a subscription group (webhook).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupName(String);

impl GroupName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidName> {
        let name = name.into();
        validate("group name", &name, &[])?;
        Ok(GroupName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GroupName {
    type Error = InvalidName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GroupName::new(value)
    }
}

impl From<GroupName> for String {
    fn from(name: GroupName) -> Self {
        name.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an item within its channel.
///
/// Issued starting at 1; `SequenceId::ZERO` means "before the first item"
/// and is what a fresh cursor points at.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(pub u64);

impl SequenceId {
    pub const ZERO: SequenceId = SequenceId(0);

    pub fn next(self) -> SequenceId {
        SequenceId(self.0 + 1)
    }

    pub fn prev(self) -> SequenceId {
        SequenceId(self.0.saturating_sub(1))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceId {
    fn from(n: u64) -> Self {
        SequenceId(n)
    }
}
