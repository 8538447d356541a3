//! Process configuration read from `HUB_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::delivery::retry::DEFAULT_RETRY_BASE;
use crate::delivery::supervisor::DEFAULT_STOP_GRACE;
use crate::delivery::worker::{DEFAULT_BATCH_WINDOW, DEFAULT_POLL_INTERVAL};
use crate::delivery::{RetryScheduler, WorkerSettings};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_APP_URL: &str = "http://localhost:8080";
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: SocketAddr,
    /// Public base URL used in links and `Location` headers.
    pub app_url: String,
    /// Where channel logs and the hub snapshot live. In-memory when `None`.
    pub state_dir: Option<PathBuf>,
    pub poll_interval: Duration,
    pub batch_window: usize,
    pub retry_base: Duration,
    pub stop_grace: Duration,
    pub callback_timeout: Duration,
    pub sweep_interval: Duration,
    pub flush_interval: Duration,
}

impl HubConfig {
    pub fn new() -> Self {
        HubConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            app_url: DEFAULT_APP_URL.to_string(),
            state_dir: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_window: DEFAULT_BATCH_WINDOW,
            retry_base: DEFAULT_RETRY_BASE,
            stop_grace: DEFAULT_STOP_GRACE,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a configuration from `lookup`, falling back to defaults for
    /// anything unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::new();
        let secs = |var: &'static str, default: Duration| -> Result<Duration> {
            Ok(parse::<u64>(&lookup, var)?.map_or(default, Duration::from_secs))
        };

        Ok(HubConfig {
            bind_addr: parse(&lookup, "HUB_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            app_url: lookup("HUB_APP_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.app_url),
            state_dir: lookup("HUB_STATE_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            poll_interval: secs("HUB_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            batch_window: match parse::<usize>(&lookup, "HUB_BATCH_WINDOW")? {
                Some(0) => {
                    return Err(ConfigError::Invalid {
                        var: "HUB_BATCH_WINDOW",
                        value: "0".to_string(),
                    });
                }
                Some(n) => n,
                None => defaults.batch_window,
            },
            retry_base: parse::<u64>(&lookup, "HUB_RETRY_BASE_MILLIS")?
                .map_or(defaults.retry_base, Duration::from_millis),
            stop_grace: secs("HUB_STOP_GRACE_SECS", defaults.stop_grace)?,
            callback_timeout: secs("HUB_CALLBACK_TIMEOUT_SECS", defaults.callback_timeout)?,
            sweep_interval: secs("HUB_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            flush_interval: secs("HUB_FLUSH_INTERVAL_SECS", defaults.flush_interval)?,
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: self.poll_interval,
            batch_window: self.batch_window,
            retry: RetryScheduler::new(self.retry_base),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::Invalid { var, value }),
        },
    }
}
