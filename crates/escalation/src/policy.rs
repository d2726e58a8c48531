//! Escalation policy: the tier table.
//!
//! Delays, retry limits, and chain order live here as data. The dispatcher
//! only asks "what comes after this tier, and when", so changing a delay or
//! re-pointing `next` never touches dispatch logic.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::config::EscalationConfig;
use crate::error::ConfigError;
use crate::job::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierPolicy {
    /// Delay between scheduling the tier and it becoming due.
    pub delay: Duration,
    /// Failed executions allowed before the job is dropped.
    pub max_attempts: u32,
    /// Tier to escalate to on `refused`/`unanswered`. `None` ends the chain.
    pub next: Option<Tier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationPolicy {
    tiers: BTreeMap<Tier, TierPolicy>,
}

const MINUTE: u64 = 60;

impl Default for EscalationPolicy {
    fn default() -> Self {
        let tiers = BTreeMap::from([
            (
                Tier::AiCall,
                TierPolicy {
                    delay: Duration::from_secs(5 * MINUTE),
                    max_attempts: 1,
                    next: Some(Tier::SmsLink),
                },
            ),
            (
                Tier::SmsLink,
                TierPolicy {
                    delay: Duration::from_secs(30 * MINUTE),
                    max_attempts: 2,
                    next: Some(Tier::EmailLink),
                },
            ),
            (
                Tier::EmailLink,
                TierPolicy {
                    delay: Duration::from_secs(120 * MINUTE),
                    max_attempts: 1,
                    next: None,
                },
            ),
        ]);
        Self { tiers }
    }
}

impl EscalationPolicy {
    /// Build a policy from an explicit table, rejecting cycles and zero retry limits.
    pub fn new(tiers: BTreeMap<Tier, TierPolicy>) -> Result<Self, ConfigError> {
        let policy = Self { tiers };
        policy.validate()?;
        Ok(policy)
    }

    /// Default table with the config's per-tier overrides applied.
    pub fn from_config(config: &EscalationConfig) -> Result<Self, ConfigError> {
        let mut tiers = Self::default().tiers;
        for (tier, over) in &config.tiers {
            let entry = tiers.get_mut(tier).ok_or_else(|| {
                ConfigError::Invalid(format!("no default policy for tier {tier}"))
            })?;
            if let Some(minutes) = over.delay_minutes {
                entry.delay = Duration::from_secs(minutes.saturating_mul(MINUTE));
            }
            if let Some(max) = over.max_attempts {
                entry.max_attempts = max;
            }
        }
        Self::new(tiers)
    }

    pub fn get(&self, tier: Tier) -> Option<&TierPolicy> {
        self.tiers.get(&tier)
    }

    pub fn next_tier(&self, tier: Tier) -> Option<Tier> {
        self.tiers.get(&tier).and_then(|p| p.next)
    }

    pub fn tiers(&self) -> impl Iterator<Item = (&Tier, &TierPolicy)> {
        self.tiers.iter()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (tier, policy) in &self.tiers {
            if policy.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!("tier {tier}: max_attempts must be >= 1")));
            }
            if let Some(next) = policy.next {
                if !self.tiers.contains_key(&next) {
                    return Err(ConfigError::Invalid(format!(
                        "tier {tier} escalates to {next}, which has no policy"
                    )));
                }
            }
        }

        // Walk each chain; revisiting a tier means a cycle.
        for start in self.tiers.keys() {
            let mut seen = vec![*start];
            let mut current = *start;
            while let Some(next) = self.next_tier(current) {
                if seen.contains(&next) {
                    return Err(ConfigError::Invalid(format!(
                        "escalation cycle through tier {next}"
                    )));
                }
                seen.push(next);
                current = next;
            }
        }
        Ok(())
    }
}
