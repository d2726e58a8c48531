//! Channel sender trait and the types exchanged with it.
//!
//! The scheduler never talks to a voice, SMS, or email provider itself. Each
//! tier is served by a [`ChannelSender`] registered in a [`ChannelRegistry`];
//! the dispatcher only interprets the [`SendReceipt`] it returns.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{ContactField, Job, Tier};

/// What the end user did with a delivered contact attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The user responded; the chain stops.
    Completed,
    /// The user declined; escalate.
    Refused,
    /// No response; escalate.
    Unanswered,
}

impl Outcome {
    pub fn escalates(&self) -> bool {
        matches!(self, Outcome::Refused | Outcome::Unanswered)
    }
}

/// Result of a send call that reached the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub delivered: bool,
    pub outcome: Outcome,
    #[serde(default)]
    pub provider_error: Option<String>,
}

impl SendReceipt {
    pub fn delivered(outcome: Outcome) -> Self {
        Self {
            delivered: true,
            outcome,
            provider_error: None,
        }
    }

    pub fn undelivered(provider_error: impl Into<String>) -> Self {
        Self {
            delivered: false,
            outcome: Outcome::Unanswered,
            provider_error: Some(provider_error.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The job lacks the contact field the tier needs. Never retried.
    #[error("tier {tier} requires a {field} contact")]
    MissingContact { tier: Tier, field: ContactField },

    /// Network or provider-side failure worth retrying.
    #[error("transient channel error: {0}")]
    Transient(String),

    /// The provider rejected the request; retrying would not help.
    #[error("permanent channel error: {0}")]
    Permanent(String),

    #[error("channel send timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Transient(_) | ChannelError::Timeout(_))
    }
}

/// Data handed to a sender for rendering its message.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext {
    pub job_id: String,
    pub session_id: String,
    pub resolution_id: String,
    pub end_user_id: String,
    pub tier: Tier,
    /// 1-based attempt number of this send.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl TemplateContext {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            session_id: job.session_id.clone(),
            resolution_id: job.resolution_id.clone(),
            end_user_id: job.end_user_id.clone(),
            tier: job.tier,
            attempt: job.attempts + 1,
            max_attempts: job.max_attempts,
        }
    }
}

/// Delivers one tier's contact attempt.
#[async_trait::async_trait]
pub trait ChannelSender: Send + Sync {
    /// Contact `destination` (phone or email, already validated non-empty).
    async fn send(
        &self,
        destination: &str,
        context: &TemplateContext,
    ) -> Result<SendReceipt, ChannelError>;

    /// Human-readable name for logs (e.g. "webhook", "dry-run").
    fn channel_name(&self) -> &str;
}

/// Tier -> sender mapping used by the dispatcher.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    senders: HashMap<Tier, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tier: Tier, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(tier, sender);
        self
    }

    pub fn register(&mut self, tier: Tier, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(tier, sender);
    }

    pub fn get(&self, tier: Tier) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&tier)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tiers: Vec<_> = self.senders.keys().collect();
        tiers.sort();
        f.debug_struct("ChannelRegistry").field("tiers", &tiers).finish()
    }
}
