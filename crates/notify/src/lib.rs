//! Channel senders for the escalation scheduler.
//!
//! This crate provides:
//! - `WebhookSender`, delivering each contact attempt to an HTTP provider
//! - `DryRunSender` for development and staging
//! - Minijinja rendering of per-tier messages
//! - `ChannelsConfig`, building a `ChannelRegistry` from TOML

pub mod config;
pub mod dry_run;
pub mod error;
pub mod templating;
pub mod webhook;

pub use config::{ChannelConfig, ChannelsConfig};
pub use dry_run::DryRunSender;
pub use error::NotifyError;
pub use templating::MessageRenderer;
pub use webhook::WebhookSender;
