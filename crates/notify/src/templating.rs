//! Minijinja rendering of per-tier contact messages.
//!
//! Templates see the job's [`TemplateContext`] fields at the top level
//! (`session_id`, `resolution_id`, `end_user_id`, `tier`, `attempt`,
//! `max_attempts`, `job_id`), the `destination`, and any free-form `extra`
//! values configured for the channel.
//!
//! Templates are arbitrary per-channel strings rendered with `render_str`
//! against one shared environment.

use std::collections::BTreeMap;

use followup_escalation::{TemplateContext, Tier};
use serde::Serialize;

use crate::error::NotifyError;

/// Message used when a channel configures no template of its own.
pub fn default_template(tier: Tier) -> &'static str {
    match tier {
        Tier::AiCall => {
            "Hello, this is a follow-up call about your recent request {{ resolution_id }}."
        }
        Tier::SmsLink => {
            "We tried to reach you about request {{ resolution_id }}. \
             Reply here to continue: {{ link | default('') }}"
        }
        Tier::EmailLink => {
            "Hi,\n\nWe still have an open follow-up for request {{ resolution_id }}. \
             Continue the conversation here: {{ link | default('') }}\n"
        }
    }
}

#[derive(Serialize)]
struct RenderContext<'a> {
    #[serde(flatten)]
    job: &'a TemplateContext,
    destination: &'a str,
    #[serde(flatten)]
    extra: &'a BTreeMap<String, String>,
}

/// Renders contact messages using minijinja.
///
/// One environment is built up front; `lower`, `upper` and `default` come
/// from minijinja's builtins. On top of those it adds a `mask` filter for
/// destinations and an `env(name)` lookup.
pub struct MessageRenderer {
    env: minijinja::Environment<'static>,
}

impl std::fmt::Debug for MessageRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRenderer").finish_non_exhaustive()
    }
}

impl Default for MessageRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRenderer {
    pub fn new() -> Self {
        let mut env = minijinja::Environment::new();
        env.add_filter("mask", mask_destination);
        env.add_function("env", env_or_empty);
        Self { env }
    }

    /// Render `template_str` for one send.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Template`] if the template is invalid or
    /// rendering fails.
    pub fn render(
        &self,
        template_str: &str,
        ctx: &TemplateContext,
        destination: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<String, NotifyError> {
        let ctx = RenderContext {
            job: ctx,
            destination,
            extra,
        };
        self.env
            .render_str(template_str, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))
    }

    /// Check template syntax without evaluating it.
    pub fn validate(&self, template_str: &str) -> Result<(), NotifyError> {
        self.env
            .template_from_str(template_str)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(())
    }
}

/// `{{ destination | mask }}`: keep the last four characters of a phone
/// number or address, star out the rest.
fn mask_destination(value: String) -> String {
    let keep = 4;
    let len = value.chars().count();
    if len <= keep {
        return value;
    }
    let mut masked = "*".repeat(len - keep);
    masked.extend(value.chars().skip(len - keep));
    masked
}

fn env_or_empty(name: String) -> String {
    std::env::var(&name).unwrap_or_else(|_| {
        tracing::warn!(var = %name, "template references unset environment variable");
        String::new()
    })
}
