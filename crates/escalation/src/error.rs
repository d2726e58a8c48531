//! Error types for the escalation scheduler.

use thiserror::Error;

use crate::job::{ContactField, Tier};

/// Failures of the shared job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Failures loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced by the public [`Scheduler`](crate::Scheduler) API.
#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("tier {tier} requires a {field} contact")]
    MissingContact { tier: Tier, field: ContactField },

    #[error("no policy configured for tier {0}")]
    NoPolicy(Tier),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, EscalationError>;
