//! Job data model: tiers, contact info, and the scheduled unit of work.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Tier ─────────────────────────────────────────────────────────────

/// One step in the escalation chain. Declaration order is chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    AiCall,
    SmsLink,
    EmailLink,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::AiCall, Tier::SmsLink, Tier::EmailLink];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::AiCall => "ai_call",
            Tier::SmsLink => "sms_link",
            Tier::EmailLink => "email_link",
        }
    }

    /// Contact field this tier cannot run without.
    pub fn required_field(&self) -> ContactField {
        match self {
            Tier::AiCall | Tier::SmsLink => ContactField::Phone,
            Tier::EmailLink => ContactField::Email,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_call" => Ok(Tier::AiCall),
            "sms_link" => Ok(Tier::SmsLink),
            "email_link" => Ok(Tier::EmailLink),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

// ── Contact ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactField {
    Phone,
    Email,
}

impl fmt::Display for ContactField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContactField::Phone => f.write_str("phone"),
            ContactField::Email => f.write_str("email"),
        }
    }
}

/// Where an end user can be reached. Either field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Contact {
    pub fn new(phone: Option<&str>, email: Option<&str>) -> Self {
        Self {
            phone: phone.map(String::from),
            email: email.map(String::from),
        }
    }

    /// Destination for `tier`, or `None` if the required field is absent or blank.
    pub fn destination_for(&self, tier: Tier) -> Option<&str> {
        let value = match tier.required_field() {
            ContactField::Phone => self.phone.as_deref(),
            ContactField::Email => self.email.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }
}

// ── Job ──────────────────────────────────────────────────────────────

/// Identity of a pending job. At most one job exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub session_id: String,
    pub tier: Tier,
}

impl JobKey {
    pub fn new(session_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            session_id: session_id.into(),
            tier,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.tier)
    }
}

/// Lifecycle state of a job. Only reported on events; a job missing from
/// the store is done, cancelled, or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Done,
    Cancelled,
    FailedTerminal,
}

/// A scheduled contact attempt for one session at one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// `"{session_id}:{tier}"`, stable across retries.
    pub id: String,
    pub session_id: String,
    pub resolution_id: String,
    pub end_user_id: String,
    pub contact: Contact,
    pub tier: Tier,
    /// Epoch millis at which the job becomes due.
    pub scheduled_at: i64,
    /// Failed executions so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Epoch millis when this tier was first scheduled.
    pub created_at: i64,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.session_id.clone(), self.tier)
    }

    pub fn is_due(&self, now_millis: i64) -> bool {
        self.scheduled_at <= now_millis
    }

    /// Build a job for the next tier of this job's chain, sharing its correlation keys.
    pub fn next_tier(&self, tier: Tier, scheduled_at: i64, max_attempts: u32) -> Job {
        Job {
            id: JobKey::new(self.session_id.clone(), tier).to_string(),
            session_id: self.session_id.clone(),
            resolution_id: self.resolution_id.clone(),
            end_user_id: self.end_user_id.clone(),
            contact: self.contact.clone(),
            tier,
            scheduled_at,
            attempts: 0,
            max_attempts,
            created_at: scheduled_at,
        }
    }
}
