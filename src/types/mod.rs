//! Core domain types for the data hub.
//!
//! Names are validated once on construction, so the rest of the engine
//! treats `ChannelName`/`GroupName` as trusted.

pub mod channel;
pub mod cursor;
pub mod group;
pub mod ids;
pub mod item;

pub use channel::{ChannelConfig, ChannelPatch, CreateChannel, normalize_tags};
pub use cursor::{Cursor, SequenceRange};
pub use group::{BatchMode, GroupConfigError, GroupSpec, SubscriptionGroup, parse_channel_url};
pub use ids::{ChannelName, GroupName, InvalidName, MAX_NAME_LEN, SequenceId, validate_tag};
pub use item::{Item, format_timestamp};
