//! Sender that only logs what it would have delivered.

use async_trait::async_trait;
use followup_escalation::{ChannelError, ChannelSender, Outcome, SendReceipt, TemplateContext};
use tracing::info;

/// Reports every send as delivered with a fixed outcome.
///
/// The default outcome is [`Outcome::Unanswered`], so a chain runs through
/// every tier when no real provider is wired up.
#[derive(Debug, Clone)]
pub struct DryRunSender {
    outcome: Outcome,
}

impl DryRunSender {
    pub fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

impl Default for DryRunSender {
    fn default() -> Self {
        Self::new(Outcome::Unanswered)
    }
}

#[async_trait]
impl ChannelSender for DryRunSender {
    async fn send(
        &self,
        destination: &str,
        context: &TemplateContext,
    ) -> Result<SendReceipt, ChannelError> {
        info!(
            tier = %context.tier,
            job_id = %context.job_id,
            %destination,
            attempt = context.attempt,
            outcome = ?self.outcome,
            "dry run: contact attempt not delivered"
        );
        Ok(SendReceipt::delivered(self.outcome))
    }

    fn channel_name(&self) -> &str {
        "dry-run"
    }
}
