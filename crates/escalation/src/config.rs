//! Scheduler configuration.
//!
//! Read from the `[scheduler]` section of a TOML file, then overridden from
//! the environment, then validated:
//!
//! ```toml
//! [scheduler]
//! poll_interval_seconds = 30
//! batch_size = 100
//! retry_backoff_seconds = 300
//!
//! [scheduler.tiers.sms_link]
//! delay_minutes = 15
//! max_attempts = 3
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job::Tier;

/// Per-tier override of the default policy table. Unset fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierOverride {
    pub delay_minutes: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Seconds between dispatcher poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Maximum jobs claimed per poll cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fixed delay before retrying a transient failure.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,
    /// Maximum concurrent channel sends per dispatcher.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Upper bound on a single channel send.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: u64,
    #[serde(default)]
    pub tiers: BTreeMap<Tier, TierOverride>,
}

fn default_poll_interval() -> u64 { 30 }
fn default_batch_size() -> usize { 100 }
fn default_retry_backoff() -> u64 { 300 }
fn default_worker_concurrency() -> usize { 8 }
fn default_send_timeout() -> u64 { 25 }

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            batch_size: default_batch_size(),
            retry_backoff_seconds: default_retry_backoff(),
            worker_concurrency: default_worker_concurrency(),
            send_timeout_seconds: default_send_timeout(),
            tiers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    scheduler: EscalationConfig,
}

impl EscalationConfig {
    /// Parse from a TOML document. Sections other than `[scheduler]` are ignored.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = file.scheduler;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `ESCALATION_<KEY>` overrides. Unparsable values are ignored.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("ESCALATION_POLL_INTERVAL_SECONDS") {
            self.poll_interval_seconds = v;
        }
        if let Some(v) = env_parse("ESCALATION_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("ESCALATION_RETRY_BACKOFF_SECONDS") {
            self.retry_backoff_seconds = v;
        }
        if let Some(v) = env_parse("ESCALATION_WORKER_CONCURRENCY") {
            self.worker_concurrency = v;
        }
        if let Some(v) = env_parse("ESCALATION_SEND_TIMEOUT_SECONDS") {
            self.send_timeout_seconds = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid("poll_interval_seconds must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid("worker_concurrency must be > 0".into()));
        }
        if self.send_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("send_timeout_seconds must be > 0".into()));
        }
        if self.send_timeout_seconds > self.poll_interval_seconds {
            return Err(ConfigError::Invalid(format!(
                "send_timeout_seconds ({}) must not exceed poll_interval_seconds ({})",
                self.send_timeout_seconds, self.poll_interval_seconds
            )));
        }
        for (tier, over) in &self.tiers {
            if over.max_attempts == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "tiers.{tier}.max_attempts must be >= 1"
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_seconds)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
