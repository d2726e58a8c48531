//! Per-job lifecycle events.
//!
//! Every state transition is logged through `tracing`, counted in
//! [`DispatchMetrics`], and published on a broadcast channel for whoever
//! wants to forward it (metrics exporter, audit log, tests).

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::job::{Job, JobStatus, Tier};
use crate::metrics::DispatchMetrics;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Scheduled,
    Claimed,
    Completed,
    Escalated,
    Rescheduled,
    TerminalFailure,
    Cancelled,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Scheduled => "scheduled",
            JobEventKind::Claimed => "claimed",
            JobEventKind::Completed => "completed",
            JobEventKind::Escalated => "escalated",
            JobEventKind::Rescheduled => "rescheduled",
            JobEventKind::TerminalFailure => "terminal_failure",
            JobEventKind::Cancelled => "cancelled",
        }
    }

    /// State the job is in after this event.
    pub fn status(&self) -> JobStatus {
        match self {
            JobEventKind::Scheduled | JobEventKind::Rescheduled => JobStatus::Pending,
            JobEventKind::Claimed => JobStatus::Claimed,
            JobEventKind::Completed | JobEventKind::Escalated => JobStatus::Done,
            JobEventKind::TerminalFailure => JobStatus::FailedTerminal,
            JobEventKind::Cancelled => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: String,
    pub session_id: String,
    pub tier: Tier,
    pub attempts: u32,
    pub at_millis: i64,
    pub detail: Option<String>,
}

impl JobEvent {
    pub fn for_job(kind: JobEventKind, job: &Job, at_millis: i64) -> Self {
        Self {
            kind,
            job_id: job.id.clone(),
            session_id: job.session_id.clone(),
            tier: job.tier,
            attempts: job.attempts,
            at_millis,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Fan-out point for [`JobEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    metrics: Arc<DispatchMetrics>,
}

impl EventBus {
    pub fn new(metrics: Arc<DispatchMetrics>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx, metrics }
    }

    /// Receive events emitted after this call. Slow receivers drop the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    pub fn emit(&self, event: JobEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        match event.kind {
            JobEventKind::TerminalFailure => error!(
                job_id = %event.job_id,
                session_id = %event.session_id,
                tier = %event.tier,
                attempts = event.attempts,
                detail,
                "escalation job failed terminally"
            ),
            JobEventKind::Rescheduled => warn!(
                job_id = %event.job_id,
                session_id = %event.session_id,
                tier = %event.tier,
                attempts = event.attempts,
                detail,
                "escalation job rescheduled"
            ),
            kind => info!(
                job_id = %event.job_id,
                session_id = %event.session_id,
                tier = %event.tier,
                attempts = event.attempts,
                detail,
                "escalation job {}",
                kind.as_str()
            ),
        }

        self.metrics.record_event(event.kind);
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
