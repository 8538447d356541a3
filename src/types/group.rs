//! Subscription group (webhook) configuration.
//!
//! A group watches one channel and delivers new items to a callback URL.
//! The wire body is a closed struct: unknown fields are rejected rather than
//! silently ignored, and `batch` is a closed enum.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{ChannelName, GroupName, InvalidName};

/// Default ceiling on retry backoff and acknowledgment wait.
pub const DEFAULT_MAX_WAIT_MINUTES: u64 = 1;

/// How items are grouped per callback invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchMode {
    /// One item per call.
    #[default]
    Single,
    /// Up to a bounded window of items per call.
    Batch,
    /// Like `Batch`, but windows are never pipelined.
    BatchSequential,
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::Single => "SINGLE",
            BatchMode::Batch => "BATCH",
            BatchMode::BatchSequential => "BATCH_SEQUENTIAL",
        }
    }
}

/// Reasons a group configuration is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid callbackUrl {0:?}: expected an absolute http(s) URL")]
    InvalidCallbackUrl(String),

    #[error("invalid channelUrl {0:?}: expected http(s)://host/channel/{{name}}")]
    InvalidChannelUrl(String),

    #[error("channel {0} does not exist")]
    UnknownChannel(ChannelName),

    #[error("body name {body:?} does not match {path}")]
    NameMismatch { body: String, path: GroupName },

    #[error("{field} must be at least 1")]
    OutOfRange { field: &'static str },

    #[error("channelUrl is immutable: {current} cannot change to {requested}")]
    ChannelUrlChanged { current: String, requested: String },

    #[error(transparent)]
    Name(#[from] InvalidName),
}

/// Body of `PUT /webhook/{name}` (or `/group/{name}`).
///
/// Every field is optional so the same shape serves create and update;
/// create additionally requires `callbackUrl` and `channelUrl`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupSpec {
    pub name: Option<String>,
    pub callback_url: Option<String>,
    pub channel_url: Option<String>,
    pub batch: Option<BatchMode>,
    pub transactional: Option<bool>,
    pub ttl_minutes: Option<u64>,
    pub max_wait_minutes: Option<u64>,
    #[serde(alias = "parallelismHint")]
    pub parallel_calls: Option<u32>,
}

/// A validated subscription group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionGroup {
    pub name: GroupName,
    pub channel_url: String,
    /// Channel parsed out of `channel_url`.
    pub channel: ChannelName,
    pub callback_url: String,
    pub batch: BatchMode,
    pub transactional: bool,
    /// Minutes an item may stay undeliverable before it is skipped; 0 disables.
    pub ttl_minutes: u64,
    pub max_wait_minutes: u64,
    pub parallel_calls: u32,
}

impl SubscriptionGroup {
    /// Validates a create request.
    pub fn from_spec(name: GroupName, spec: GroupSpec) -> Result<Self, GroupConfigError> {
        check_body_name(&name, spec.name.as_deref())?;

        let channel_url = spec
            .channel_url
            .ok_or(GroupConfigError::MissingField("channelUrl"))?;
        let callback_url = spec
            .callback_url
            .ok_or(GroupConfigError::MissingField("callbackUrl"))?;

        let group = SubscriptionGroup {
            channel: parse_channel_url(&channel_url)?,
            channel_url,
            callback_url: validate_callback_url(callback_url)?,
            name,
            batch: spec.batch.unwrap_or_default(),
            transactional: spec.transactional.unwrap_or(false),
            ttl_minutes: spec.ttl_minutes.unwrap_or(0),
            max_wait_minutes: spec.max_wait_minutes.unwrap_or(DEFAULT_MAX_WAIT_MINUTES),
            parallel_calls: spec.parallel_calls.unwrap_or(1),
        };
        group.check_ranges()?;
        Ok(group)
    }

    /// Returns a copy with the mutable fields of `spec` applied.
    ///
    /// `name` and `channelUrl` are immutable; resending the current
    /// `channelUrl` is accepted.
    pub fn with_spec(&self, spec: GroupSpec) -> Result<Self, GroupConfigError> {
        check_body_name(&self.name, spec.name.as_deref())?;

        if let Some(requested) = spec.channel_url
            && requested != self.channel_url
        {
            return Err(GroupConfigError::ChannelUrlChanged {
                current: self.channel_url.clone(),
                requested,
            });
        }

        let mut updated = self.clone();
        if let Some(callback_url) = spec.callback_url {
            updated.callback_url = validate_callback_url(callback_url)?;
        }
        if let Some(batch) = spec.batch {
            updated.batch = batch;
        }
        if let Some(transactional) = spec.transactional {
            updated.transactional = transactional;
        }
        if let Some(ttl) = spec.ttl_minutes {
            updated.ttl_minutes = ttl;
        }
        if let Some(max_wait) = spec.max_wait_minutes {
            updated.max_wait_minutes = max_wait;
        }
        if let Some(parallel) = spec.parallel_calls {
            updated.parallel_calls = parallel;
        }
        updated.check_ranges()?;
        Ok(updated)
    }

    fn check_ranges(&self) -> Result<(), GroupConfigError> {
        if self.max_wait_minutes == 0 {
            return Err(GroupConfigError::OutOfRange {
                field: "maxWaitMinutes",
            });
        }
        if self.parallel_calls == 0 {
            return Err(GroupConfigError::OutOfRange {
                field: "parallelCalls",
            });
        }
        Ok(())
    }

    /// Ceiling on retry backoff and on the wait for a transactional ack.
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_minutes.saturating_mul(60))
    }

    /// Undeliverable age after which an item is skipped, if any.
    pub fn undeliverable_ttl(&self) -> Option<chrono::Duration> {
        if self.ttl_minutes == 0 {
            return None;
        }
        // Out of range means no item can ever be old enough.
        chrono::Duration::try_minutes(i64::try_from(self.ttl_minutes).ok()?)
    }

    /// How many windows may be in flight at once.
    pub fn window_capacity(&self) -> usize {
        if self.transactional || self.batch == BatchMode::BatchSequential {
            1
        } else {
            self.parallel_calls.max(1) as usize
        }
    }

    /// How many items go into one window.
    pub fn items_per_window(&self, batch_window: usize) -> usize {
        match self.batch {
            BatchMode::Single => 1,
            BatchMode::Batch | BatchMode::BatchSequential => batch_window.max(1),
        }
    }
}

fn check_body_name(path: &GroupName, body: Option<&str>) -> Result<(), GroupConfigError> {
    match body {
        Some(body) if body != path.as_str() => Err(GroupConfigError::NameMismatch {
            body: body.to_string(),
            path: path.clone(),
        }),
        _ => Ok(()),
    }
}

fn parse_http_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    let http = matches!(url.scheme(), "http" | "https");
    (http && url.host_str().is_some()).then_some(url)
}

fn validate_callback_url(raw: String) -> Result<String, GroupConfigError> {
    match parse_http_url(&raw) {
        Some(_) => Ok(raw),
        None => Err(GroupConfigError::InvalidCallbackUrl(raw)),
    }
}

/// Extracts the channel name from `http(s)://host[/prefix]/channel/{name}`.
pub fn parse_channel_url(raw: &str) -> Result<ChannelName, GroupConfigError> {
    let invalid = || GroupConfigError::InvalidChannelUrl(raw.to_string());
    let url = parse_http_url(raw).ok_or_else(invalid)?;
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        [.., "channel", name] => ChannelName::new(*name).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> GroupName {
        GroupName::new(n).unwrap()
    }

    fn spec(json: serde_json::Value) -> GroupSpec {
        serde_json::from_value(json).unwrap()
    }

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "callbackUrl": "http://localhost:9000/cb",
            "channelUrl": "http://hub/channel/orders"
        })
    }

    #[test]
    fn defaults_are_applied() {
        let group = SubscriptionGroup::from_spec(name("g"), spec(minimal())).unwrap();
        assert_eq!(group.channel.as_str(), "orders");
        assert_eq!(group.batch, BatchMode::Single);
        assert!(!group.transactional);
        assert_eq!(group.ttl_minutes, 0);
        assert_eq!(group.max_wait_minutes, DEFAULT_MAX_WAIT_MINUTES);
        assert_eq!(group.parallel_calls, 1);
    }

    #[test]
    fn batch_mode_wire_names() {
        let parsed: BatchMode = serde_json::from_str("\"BATCH_SEQUENTIAL\"").unwrap();
        assert_eq!(parsed, BatchMode::BatchSequential);
        assert_eq!(serde_json::to_string(&BatchMode::Single).unwrap(), "\"SINGLE\"");
        assert!(serde_json::from_str::<BatchMode>("\"MINUTE\"").is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut body = minimal();
        body["heartbeat"] = serde_json::json!(true);
        assert!(serde_json::from_value::<GroupSpec>(body).is_err());
    }

    #[test]
    fn parallelism_hint_alias_is_accepted() {
        let mut body = minimal();
        body["parallelismHint"] = serde_json::json!(3);
        let group = SubscriptionGroup::from_spec(name("g"), spec(body)).unwrap();
        assert_eq!(group.parallel_calls, 3);
    }

    #[test]
    fn missing_urls_are_reported() {
        let err = SubscriptionGroup::from_spec(
            name("g"),
            spec(serde_json::json!({"channelUrl": "http://hub/channel/a"})),
        )
        .unwrap_err();
        assert_eq!(err, GroupConfigError::MissingField("callbackUrl"));
    }

    #[test]
    fn malformed_urls_are_rejected() {
        let mut body = minimal();
        body["callbackUrl"] = serde_json::json!("not a url");
        assert!(matches!(
            SubscriptionGroup::from_spec(name("g"), spec(body)),
            Err(GroupConfigError::InvalidCallbackUrl(_))
        ));

        let mut body = minimal();
        body["channelUrl"] = serde_json::json!("http://hub/other/orders");
        assert!(matches!(
            SubscriptionGroup::from_spec(name("g"), spec(body)),
            Err(GroupConfigError::InvalidChannelUrl(_))
        ));
    }

    #[test]
    fn channel_url_accepts_prefix_and_trailing_slash() {
        assert_eq!(
            parse_channel_url("https://hub.example/api/channel/orders/")
                .unwrap()
                .as_str(),
            "orders"
        );
    }

    #[test]
    fn body_name_must_match_path() {
        let mut body = minimal();
        body["name"] = serde_json::json!("other");
        assert!(matches!(
            SubscriptionGroup::from_spec(name("g"), spec(body)),
            Err(GroupConfigError::NameMismatch { .. })
        ));
    }

    #[test]
    fn update_keeps_channel_and_changes_policy() {
        let group = SubscriptionGroup::from_spec(name("g"), spec(minimal())).unwrap();
        let updated = group
            .with_spec(spec(serde_json::json!({
                "callbackUrl": "http://localhost:9001/new",
                "batch": "BATCH",
                "transactional": true
            })))
            .unwrap();
        assert_eq!(updated.callback_url, "http://localhost:9001/new");
        assert_eq!(updated.batch, BatchMode::Batch);
        assert!(updated.transactional);
        assert_eq!(updated.channel, group.channel);
    }

    #[test]
    fn update_rejects_channel_change() {
        let group = SubscriptionGroup::from_spec(name("g"), spec(minimal())).unwrap();
        let err = group
            .with_spec(spec(serde_json::json!({"channelUrl": "http://hub/channel/other"})))
            .unwrap_err();
        assert!(matches!(err, GroupConfigError::ChannelUrlChanged { .. }));

        // Resending the same URL is fine.
        assert!(
            group
                .with_spec(spec(serde_json::json!({"channelUrl": "http://hub/channel/orders"})))
                .is_ok()
        );
    }

    #[test]
    fn zero_ranges_are_rejected() {
        let mut body = minimal();
        body["maxWaitMinutes"] = serde_json::json!(0);
        assert!(matches!(
            SubscriptionGroup::from_spec(name("g"), spec(body)),
            Err(GroupConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn window_capacity_by_mode() {
        let mut group = SubscriptionGroup::from_spec(name("g"), spec(minimal())).unwrap();
        group.parallel_calls = 4;
        assert_eq!(group.window_capacity(), 4);

        group.batch = BatchMode::BatchSequential;
        assert_eq!(group.window_capacity(), 1);

        group.batch = BatchMode::Batch;
        group.transactional = true;
        assert_eq!(group.window_capacity(), 1);
    }

    #[test]
    fn items_per_window_by_mode() {
        let mut group = SubscriptionGroup::from_spec(name("g"), spec(minimal())).unwrap();
        assert_eq!(group.items_per_window(50), 1);
        group.batch = BatchMode::Batch;
        assert_eq!(group.items_per_window(50), 50);
    }

    #[test]
    fn undeliverable_ttl_zero_disables() {
        let mut group = SubscriptionGroup::from_spec(name("g"), spec(minimal())).unwrap();
        assert_eq!(group.undeliverable_ttl(), None);
        group.ttl_minutes = 2;
        assert_eq!(group.undeliverable_ttl(), Some(chrono::Duration::minutes(2)));
    }
}
