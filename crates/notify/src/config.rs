//! Per-tier channel configuration.
//!
//! Lives next to `[scheduler]` in the worker's TOML file:
//!
//! ```toml
//! [channels.ai_call]
//! url = "https://voice.internal/calls"
//! headers = { Authorization = "Bearer ${VOICE_TOKEN}" }
//!
//! [channels.sms_link]
//! url = "https://sms.internal/send"
//! template = "Continue here: {{ link }}"
//! extra = { link = "https://widget.example/resume" }
//!
//! [channels.email_link]
//! dry_run = true
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use followup_escalation::{ChannelRegistry, ChannelSender, Outcome, Tier};
use serde::Deserialize;
use tracing::{info, warn};

use crate::dry_run::DryRunSender;
use crate::error::NotifyError;
use crate::templating::MessageRenderer;
use crate::webhook::WebhookSender;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    pub url: Option<String>,
    /// HTTP method, default `POST`.
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Minijinja message template; the tier default is used when unset.
    pub template: Option<String>,
    /// Free-form values exposed to the template.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
    /// Log instead of sending.
    #[serde(default)]
    pub dry_run: bool,
    /// Outcome reported in dry-run mode (default `unanswered`).
    pub dry_run_outcome: Option<Outcome>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub channels: BTreeMap<Tier, ChannelConfig>,
}

impl ChannelsConfig {
    /// Parse the `[channels.*]` sections of a TOML document; other sections are ignored.
    pub fn from_toml(toml_str: &str) -> Result<Self, NotifyError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NotifyError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn get(&self, tier: Tier) -> Option<&ChannelConfig> {
        self.channels.get(&tier)
    }

    /// Build one sender per configured tier.
    ///
    /// With `force_dry_run` every tier gets a [`DryRunSender`], configured or
    /// not. Otherwise a tier needs either `dry_run = true` or a `url`; tiers
    /// with no section are left unregistered.
    pub fn build_registry(&self, force_dry_run: bool) -> Result<ChannelRegistry, NotifyError> {
        let renderer = Arc::new(MessageRenderer::new());
        let mut registry = ChannelRegistry::new();

        for tier in Tier::ALL {
            let cfg = self.get(tier);
            let sender: Arc<dyn ChannelSender> = match cfg {
                _ if force_dry_run || cfg.is_some_and(|c| c.dry_run) => {
                    let outcome = cfg
                        .and_then(|c| c.dry_run_outcome)
                        .unwrap_or(Outcome::Unanswered);
                    Arc::new(DryRunSender::new(outcome))
                }
                Some(cfg) => {
                    let url = cfg.url.as_deref().ok_or_else(|| {
                        NotifyError::Config(format!(
                            "channels.{tier}: url is required unless dry_run = true"
                        ))
                    })?;
                    let method = cfg
                        .method
                        .as_deref()
                        .map(WebhookSender::parse_method)
                        .transpose()?;
                    Arc::new(WebhookSender::new(
                        tier,
                        url,
                        method,
                        cfg.headers.clone(),
                        cfg.template.clone(),
                        cfg.extra.clone(),
                        renderer.clone(),
                    )?)
                }
                None => {
                    warn!(%tier, "no channel configured for tier");
                    continue;
                }
            };
            info!(%tier, channel = sender.channel_name(), "channel registered");
            registry.register(tier, sender);
        }

        Ok(registry)
    }
}
