//! Immutable data items stored in a channel.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};

use super::ids::{ChannelName, SequenceId};

/// One appended unit of data.
///
/// Items never change after append; the log shares them as `Arc<Item>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub channel: ChannelName,
    pub sequence_id: SequenceId,
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
}

impl Item {
    /// ISO-8601 timestamp with millisecond precision.
    pub fn timestamp_iso(&self) -> String {
        format_timestamp(self.timestamp)
    }

    /// Age of the item relative to `now`, zero if `now` is earlier.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.timestamp).max(chrono::Duration::zero())
    }
}

/// Formats a timestamp the way the hub reports it everywhere.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_is_millisecond_iso() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        assert_eq!(format_timestamp(ts), "2024-01-15T12:00:00.000Z");
    }

    #[test]
    fn age_never_negative() {
        let ts = Utc::now();
        let item = Item {
            channel: ChannelName::new("c").unwrap(),
            sequence_id: SequenceId(1),
            timestamp: ts,
            tags: BTreeSet::new(),
            content_type: None,
            payload: Vec::new(),
        };
        assert_eq!(
            item.age(ts - chrono::Duration::seconds(5)),
            chrono::Duration::zero()
        );
        assert_eq!(
            item.age(ts + chrono::Duration::seconds(5)),
            chrono::Duration::seconds(5)
        );
    }
}
