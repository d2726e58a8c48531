//! Errors raised while building channel senders.
//!
//! Failures during a send are reported as
//! [`followup_escalation::ChannelError`] so the dispatcher can classify them.

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read channel config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse channel config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}
