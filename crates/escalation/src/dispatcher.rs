//! Poll loop that claims due jobs and executes them.
//!
//! Each cycle claims up to `batch_size` due jobs, sends them through their
//! tier's [`ChannelSender`] with at most `worker_concurrency` sends in flight,
//! and writes back the result:
//!
//! - delivered + `completed`: done, the chain stops
//! - delivered + `refused`/`unanswered`: done, the policy's next tier is scheduled
//! - transient failure: rescheduled after the retry backoff until attempts run out
//! - missing contact, permanent error, no sender: terminal failure
//!
//! A write-back the store rejects is kept in memory and retried at the start
//! of the next cycle instead of losing the chain.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::{CancelRegistry, ClaimEpoch};
use crate::clock::{duration_millis, Clock};
use crate::config::EscalationConfig;
use crate::error::StoreError;
use crate::events::{EventBus, JobEvent, JobEventKind};
use crate::job::Job;
use crate::policy::EscalationPolicy;
use crate::sender::{ChannelError, ChannelRegistry, TemplateContext};
use crate::store::JobStore;

// ── Settings ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub worker_concurrency: usize,
    pub retry_backoff: Duration,
    pub send_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&EscalationConfig::default())
    }
}

impl From<&EscalationConfig> for DispatcherSettings {
    fn from(config: &EscalationConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size,
            worker_concurrency: config.worker_concurrency,
            retry_backoff: config.retry_backoff(),
            send_timeout: config.send_timeout(),
        }
    }
}

// ── Tick report ──────────────────────────────────────────────────────

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub escalated: usize,
    pub chain_ended: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub skipped_cancelled: usize,
    /// Write-backs the store rejected this cycle, kept for the next one.
    pub deferred: usize,
    /// Earlier deferred write-backs that reached the store this cycle.
    pub deferred_written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Escalated,
    ChainEnded,
    Rescheduled,
    Failed,
    SkippedCancelled,
    Deferred,
}

impl TickReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Escalated => self.escalated += 1,
            JobOutcome::ChainEnded => self.chain_ended += 1,
            JobOutcome::Rescheduled => self.rescheduled += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::SkippedCancelled => self.skipped_cancelled += 1,
            JobOutcome::Deferred => self.deferred += 1,
        }
    }
}

/// A retry or next-tier job waiting for the store to accept it.
#[derive(Debug, Clone)]
struct DeferredWrite {
    job: Job,
    when: i64,
    /// Event emitted once the write lands.
    kind: JobEventKind,
}

// ── Dispatcher ───────────────────────────────────────────────────────

pub struct Dispatcher {
    id: String,
    store: Arc<dyn JobStore>,
    policy: Arc<EscalationPolicy>,
    channels: ChannelRegistry,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
    events: EventBus,
    cancellations: Arc<CancelRegistry>,
    deferred: Mutex<Vec<DeferredWrite>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        policy: Arc<EscalationPolicy>,
        channels: ChannelRegistry,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
        events: EventBus,
        cancellations: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            store,
            policy,
            channels,
            clock,
            settings,
            events,
            cancellations,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Instance id, used to tell dispatchers apart in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Number of write-backs waiting for the store.
    pub fn deferred_len(&self) -> usize {
        self.deferred().len()
    }

    fn deferred(&self) -> MutexGuard<'_, Vec<DeferredWrite>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the session's deferred write-backs and return their jobs.
    ///
    /// Callers hold the registry's exclusive gate, so no write-back for the
    /// session can be deferred concurrently.
    pub fn discard_deferred(&self, session_id: &str) -> Vec<Job> {
        let mut deferred = self.deferred();
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *deferred)
            .into_iter()
            .partition(|w| w.job.session_id == session_id);
        *deferred = kept;
        dropped.into_iter().map(|w| w.job).collect()
    }

    /// Run poll cycles until `shutdown` flips to `true` (or its sender drops).
    ///
    /// Shutdown is only observed between cycles, so a batch that has been
    /// claimed always runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            dispatcher_id = %self.id,
            poll_interval = ?self.settings.poll_interval,
            batch_size = self.settings.batch_size,
            worker_concurrency = self.settings.worker_concurrency,
            "dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) if report.claimed > 0 || report.deferred_written > 0 => {
                    debug!(dispatcher_id = %self.id, ?report, "poll cycle finished");
                }
                Ok(_) => {}
                Err(e) => {
                    self.events.metrics().record_failed_tick();
                    warn!(
                        dispatcher_id = %self.id,
                        error = %e,
                        "poll cycle failed, retrying next interval"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let pending = self.deferred_len();
        if pending > 0 {
            warn!(dispatcher_id = %self.id, pending, "dispatcher stopped with deferred write-backs");
        }
        info!(dispatcher_id = %self.id, "dispatcher stopped");
    }

    /// One poll cycle: retry deferred write-backs, then claim due jobs and
    /// process them all. Cycles may overlap.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let deferred_written = self.flush_deferred().await;

        let claim = self.cancellations.begin_claim();
        let epoch = claim.epoch();
        let claimed_at = self.clock.now_millis();

        let jobs = self
            .store
            .claim_due(claimed_at, self.settings.batch_size)
            .await?;

        let mut report = TickReport {
            claimed: jobs.len(),
            deferred_written,
            ..TickReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        for job in &jobs {
            self.events
                .emit(JobEvent::for_job(JobEventKind::Claimed, job, claimed_at));
        }

        let outcomes: Vec<JobOutcome> = stream::iter(jobs)
            .map(|job| self.process(job, epoch))
            .buffer_unordered(self.settings.worker_concurrency.max(1))
            .collect()
            .await;
        drop(claim);

        for outcome in outcomes {
            report.record(outcome);
        }
        Ok(report)
    }

    async fn process(&self, job: Job, epoch: ClaimEpoch) -> JobOutcome {
        let Some(destination) = job.contact.destination_for(job.tier) else {
            let err = ChannelError::MissingContact {
                tier: job.tier,
                field: job.tier.required_field(),
            };
            return self.fail(&job, err.to_string());
        };
        let Some(sender) = self.channels.get(job.tier) else {
            return self.fail(&job, format!("no channel sender registered for tier {}", job.tier));
        };

        let context = TemplateContext::for_job(&job);
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.settings.send_timeout,
            sender.send(destination, &context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(self.settings.send_timeout)),
        };
        self.events
            .metrics()
            .record_send(job.tier, started.elapsed());

        match result {
            Ok(receipt) if receipt.delivered => {
                debug!(
                    job_id = %job.id,
                    channel = sender.channel_name(),
                    outcome = ?receipt.outcome,
                    "contact attempt delivered"
                );
                if receipt.outcome.escalates() {
                    self.escalate(job, epoch).await
                } else {
                    let now = self.clock.now_millis();
                    self.events.emit(
                        JobEvent::for_job(JobEventKind::Completed, &job, now)
                            .with_detail("end user responded"),
                    );
                    JobOutcome::Completed
                }
            }
            Ok(receipt) => {
                let reason = receipt
                    .provider_error
                    .unwrap_or_else(|| "not delivered".to_string());
                self.retry(job, epoch, reason).await
            }
            Err(e) if e.is_retryable() => self.retry(job, epoch, e.to_string()).await,
            Err(e) => self.fail(&job, e.to_string()),
        }
    }

    /// Schedule the policy's next tier for this job's session.
    async fn escalate(&self, job: Job, epoch: ClaimEpoch) -> JobOutcome {
        let now = self.clock.now_millis();
        let next = self
            .policy
            .next_tier(job.tier)
            .and_then(|tier| self.policy.get(tier).map(|p| (tier, *p)));

        let Some((next_tier, next_policy)) = next else {
            self.events.emit(
                JobEvent::for_job(JobEventKind::Completed, &job, now)
                    .with_detail("no further tier, chain ended"),
            );
            return JobOutcome::ChainEnded;
        };

        if job.contact.destination_for(next_tier).is_none() {
            self.events.emit(
                JobEvent::for_job(JobEventKind::Completed, &job, now).with_detail(format!(
                    "chain ended, {next_tier} requires a {} contact",
                    next_tier.required_field()
                )),
            );
            return JobOutcome::ChainEnded;
        }

        let _gate = self.cancellations.write_back().await;
        if self.cancellations.cancelled_after(&job.session_id, epoch) {
            return self.skip_cancelled(&job, now);
        }

        let when = now.saturating_add(duration_millis(next_policy.delay));
        let next_job = job.next_tier(next_tier, when, next_policy.max_attempts);
        let written = self.store.add(next_job.clone(), when).await;

        self.events.emit(
            JobEvent::for_job(JobEventKind::Escalated, &job, now)
                .with_detail(format!("escalated to {next_tier}")),
        );
        match written {
            Ok(()) => {
                self.events
                    .emit(JobEvent::for_job(JobEventKind::Scheduled, &next_job, now));
                JobOutcome::Escalated
            }
            Err(e) => self.defer(next_job, when, JobEventKind::Scheduled, &e),
        }
    }

    /// Put the same tier back with the fixed backoff, or drop it when out of attempts.
    async fn retry(&self, mut job: Job, epoch: ClaimEpoch, reason: String) -> JobOutcome {
        let attempts = job.attempts + 1;
        if attempts >= job.max_attempts {
            job.attempts = attempts;
            return self.fail(&job, format!("attempts exhausted: {reason}"));
        }

        let now = self.clock.now_millis();
        let _gate = self.cancellations.write_back().await;
        if self.cancellations.cancelled_after(&job.session_id, epoch) {
            return self.skip_cancelled(&job, now);
        }

        let when = now
            .saturating_add(duration_millis(self.settings.retry_backoff))
            .max(job.scheduled_at);
        job.attempts = attempts;
        if let Err(e) = self.store.add(job.clone(), when).await {
            return self.defer(job, when, JobEventKind::Rescheduled, &e);
        }

        job.scheduled_at = when;
        self.events
            .emit(JobEvent::for_job(JobEventKind::Rescheduled, &job, now).with_detail(reason));
        JobOutcome::Rescheduled
    }

    /// Keep a rejected write-back for the next cycle. Called under the shared gate.
    fn defer(&self, job: Job, when: i64, kind: JobEventKind, err: &StoreError) -> JobOutcome {
        warn!(
            dispatcher_id = %self.id,
            job_id = %job.id,
            error = %err,
            "store write failed, retrying next poll cycle"
        );
        self.deferred().push(DeferredWrite { job, when, kind });
        JobOutcome::Deferred
    }

    /// Retry deferred write-backs; returns how many reached the store.
    async fn flush_deferred(&self) -> usize {
        let _gate = self.cancellations.write_back().await;
        let pending = std::mem::take(&mut *self.deferred());
        if pending.is_empty() {
            return 0;
        }

        let now = self.clock.now_millis();
        let mut written = 0;
        let mut failed = Vec::new();
        for mut write in pending {
            match self.store.add(write.job.clone(), write.when).await {
                Ok(()) => {
                    written += 1;
                    write.job.scheduled_at = write.when;
                    self.events.emit(
                        JobEvent::for_job(write.kind, &write.job, now)
                            .with_detail("deferred store write applied"),
                    );
                }
                Err(e) => {
                    debug!(job_id = %write.job.id, error = %e, "deferred store write failed again");
                    failed.push(write);
                }
            }
        }
        if !failed.is_empty() {
            warn!(
                dispatcher_id = %self.id,
                pending = failed.len(),
                "store still rejecting deferred writes"
            );
            self.deferred().extend(failed);
        }
        written
    }

    fn fail(&self, job: &Job, detail: String) -> JobOutcome {
        let now = self.clock.now_millis();
        self.events
            .emit(JobEvent::for_job(JobEventKind::TerminalFailure, job, now).with_detail(detail));
        JobOutcome::Failed
    }

    fn skip_cancelled(&self, job: &Job, now: i64) -> JobOutcome {
        self.events.emit(
            JobEvent::for_job(JobEventKind::Cancelled, job, now)
                .with_detail("session cancelled while in flight"),
        );
        JobOutcome::SkippedCancelled
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("channels", &self.channels)
            .field("settings", &self.settings)
            .field("deferred", &self.deferred_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{Contact, JobKey, Tier};
    use crate::metrics::DispatchMetrics;
    use crate::sender::{ChannelSender, Outcome, SendReceipt};
    use crate::store::MemoryJobStore;

    const T0: i64 = 1_700_000_000_000;
    const MIN: i64 = 60_000;

    type Scripted = Result<SendReceipt, ChannelError>;

    /// Returns scripted results in order, then `unanswered` forever.
    struct ScriptedSender {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
    }

    impl ScriptedSender {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelSender for ScriptedSender {
        async fn send(&self, _: &str, _: &TemplateContext) -> Result<SendReceipt, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(SendReceipt::delivered(Outcome::Unanswered)))
        }

        fn channel_name(&self) -> &str {
            "scripted"
        }
    }

    struct Harness {
        store: Arc<MemoryJobStore>,
        clock: Arc<ManualClock>,
        cancellations: Arc<CancelRegistry>,
        dispatcher: Dispatcher,
    }

    fn harness(channels: ChannelRegistry, settings: DispatcherSettings) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let cancellations = Arc::new(CancelRegistry::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(EscalationPolicy::default()),
            channels,
            clock.clone(),
            settings,
            EventBus::new(Arc::new(DispatchMetrics::new())),
            cancellations.clone(),
        );
        Harness {
            store,
            clock,
            cancellations,
            dispatcher,
        }
    }

    fn job(session: &str, tier: Tier, contact: Contact) -> Job {
        let max_attempts = EscalationPolicy::default().get(tier).unwrap().max_attempts;
        Job {
            id: JobKey::new(session, tier).to_string(),
            session_id: session.to_string(),
            resolution_id: "res-1".into(),
            end_user_id: "user-1".into(),
            contact,
            tier,
            scheduled_at: T0,
            attempts: 0,
            max_attempts,
            created_at: T0,
        }
    }

    fn full_contact() -> Contact {
        Contact::new(Some("+15550100"), Some("user@example.com"))
    }

    fn all_tiers(sender: Arc<dyn ChannelSender>) -> ChannelRegistry {
        Tier::ALL
            .iter()
            .fold(ChannelRegistry::new(), |reg, tier| reg.with(*tier, sender.clone()))
    }

    #[tokio::test]
    async fn unanswered_call_escalates_to_sms() {
        let sender = ScriptedSender::new(vec![Ok(SendReceipt::delivered(Outcome::Unanswered))]);
        let h = harness(all_tiers(sender.clone()), DispatcherSettings::default());
        h.store.add(job("s1", Tier::AiCall, full_contact()), T0).await.unwrap();

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.escalated, 1);

        let pending = h.store.pending_for_session("s1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tier, Tier::SmsLink);
        assert_eq!(pending[0].scheduled_at, T0 + 30 * MIN);
        assert_eq!(pending[0].attempts, 0);
        assert_eq!(pending[0].max_attempts, 2);
        assert_eq!(pending[0].resolution_id, "res-1");
    }

    #[tokio::test]
    async fn completed_outcome_stops_chain() {
        let sender = ScriptedSender::new(vec![Ok(SendReceipt::delivered(Outcome::Completed))]);
        let h = harness(all_tiers(sender), DispatcherSettings::default());
        h.store.add(job("s1", Tier::AiCall, full_contact()), T0).await.unwrap();

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_sms_retries() {
        let sender = ScriptedSender::new(vec![
            Err(ChannelError::Transient("503".into())),
            Err(ChannelError::Transient("503".into())),
        ]);
        let h = harness(all_tiers(sender.clone()), DispatcherSettings::default());
        h.store.add(job("s1", Tier::SmsLink, full_contact()), T0).await.unwrap();

        let first = h.dispatcher.tick().await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let pending = h.store.pending_for_session("s1").await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].scheduled_at, T0 + 5 * MIN);

        // Not due yet.
        h.clock.advance(Duration::from_secs(299));
        assert_eq!(h.dispatcher.tick().await.unwrap().claimed, 0);

        h.clock.advance(Duration::from_secs(1));
        let second = h.dispatcher.tick().await.unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(h.store.count().await.unwrap(), 0);

        h.clock.advance(Duration::from_secs(3600));
        assert_eq!(h.dispatcher.tick().await.unwrap().claimed, 0);
        assert_eq!(sender.calls(), 2);
    }

    #[tokio::test]
    async fn single_attempt_tier_drops_chain_on_failure() {
        let sender = ScriptedSender::new(vec![Err(ChannelError::Transient("reset".into()))]);
        let h = harness(all_tiers(sender), DispatcherSettings::default());
        h.store.add(job("s1", Tier::AiCall, full_contact()), T0).await.unwrap();

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undelivered_receipt_is_retried() {
        let sender = ScriptedSender::new(vec![Ok(SendReceipt::undelivered("carrier busy"))]);
        let h = harness(all_tiers(sender), DispatcherSettings::default());
        h.store.add(job("s1", Tier::SmsLink, full_contact()), T0).await.unwrap();

        assert_eq!(h.dispatcher.tick().await.unwrap().rescheduled, 1);
        assert_eq!(h.store.pending_for_session("s1").await.unwrap()[0].tier, Tier::SmsLink);
    }

    #[tokio::test]
    async fn missing_contact_is_terminal_without_send() {
        let sender = ScriptedSender::new(vec![]);
        let h = harness(all_tiers(sender.clone()), DispatcherSettings::default());
        let no_phone = Contact::new(None, Some("user@example.com"));
        h.store.add(job("s1", Tier::SmsLink, no_phone), T0).await.unwrap();

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(sender.calls(), 0);
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_error_is_terminal() {
        let sender = ScriptedSender::new(vec![Err(ChannelError::Permanent("400".into()))]);
        let h = harness(all_tiers(sender), DispatcherSettings::default());
        h.store.add(job("s1", Tier::SmsLink, full_contact()), T0).await.unwrap();

        assert_eq!(h.dispatcher.tick().await.unwrap().failed, 1);
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unregistered_tier_is_terminal() {
        let sender = ScriptedSender::new(vec![]);
        let channels = ChannelRegistry::new().with(Tier::AiCall, sender);
        let h = harness(channels, DispatcherSettings::default());
        h.store.add(job("s1", Tier::EmailLink, full_contact()), T0).await.unwrap();

        assert_eq!(h.dispatcher.tick().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn email_unanswered_ends_chain() {
        let sender = ScriptedSender::new(vec![Ok(SendReceipt::delivered(Outcome::Unanswered))]);
        let h = harness(all_tiers(sender), DispatcherSettings::default());
        h.store.add(job("s1", Tier::EmailLink, full_contact()), T0).await.unwrap();

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.chain_ended, 1);
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refused_sms_without_email_ends_chain() {
        let sender = ScriptedSender::new(vec![Ok(SendReceipt::delivered(Outcome::Refused))]);
        let h = harness(all_tiers(sender), DispatcherSettings::default());
        let phone_only = Contact::new(Some("+15550100"), None);
        h.store.add(job("s1", Tier::SmsLink, phone_only), T0).await.unwrap();

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.chain_ended, 1);
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    struct SlowSender(Duration);

    #[async_trait]
    impl ChannelSender for SlowSender {
        async fn send(&self, _: &str, _: &TemplateContext) -> Result<SendReceipt, ChannelError> {
            tokio::time::sleep(self.0).await;
            Ok(SendReceipt::delivered(Outcome::Completed))
        }

        fn channel_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn send_timeout_counts_as_transient() {
        let settings = DispatcherSettings {
            send_timeout: Duration::from_millis(20),
            ..DispatcherSettings::default()
        };
        let h = harness(all_tiers(Arc::new(SlowSender(Duration::from_secs(5)))), settings);
        h.store.add(job("s1", Tier::SmsLink, full_contact()), T0).await.unwrap();

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(h.store.pending_for_session("s1").await.unwrap()[0].attempts, 1);
    }

    /// Tracks how many sends overlap.
    struct PeakTracker {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSender for PeakTracker {
        async fn send(&self, _: &str, _: &TemplateContext) -> Result<SendReceipt, ChannelError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(SendReceipt::delivered(Outcome::Completed))
        }

        fn channel_name(&self) -> &str {
            "peak-tracker"
        }
    }

    #[tokio::test]
    async fn sends_are_bounded_by_worker_concurrency() {
        let tracker = Arc::new(PeakTracker {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let settings = DispatcherSettings {
            worker_concurrency: 3,
            ..DispatcherSettings::default()
        };
        let h = harness(all_tiers(tracker.clone()), settings);
        for i in 0..10 {
            h.store
                .add(job(&format!("s{i}"), Tier::AiCall, full_contact()), T0)
                .await
                .unwrap();
        }

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.completed, 10);
        let peak = tracker.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 2, "sends never overlapped");
    }

    #[tokio::test]
    async fn batch_size_limits_claims() {
        let settings = DispatcherSettings {
            batch_size: 2,
            ..DispatcherSettings::default()
        };
        let sender = ScriptedSender::new(vec![]);
        let h = harness(all_tiers(sender), settings);
        for i in 0..5 {
            h.store
                .add(job(&format!("s{i}"), Tier::EmailLink, full_contact()), T0)
                .await
                .unwrap();
        }

        assert_eq!(h.dispatcher.tick().await.unwrap().claimed, 2);
        assert_eq!(h.store.count().await.unwrap(), 3);
    }

    /// Blocks inside `send` until released.
    struct GatedSender {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ChannelSender for GatedSender {
        async fn send(&self, _: &str, _: &TemplateContext) -> Result<SendReceipt, ChannelError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(SendReceipt::delivered(Outcome::Unanswered))
        }

        fn channel_name(&self) -> &str {
            "gated"
        }
    }

    fn gated() -> Arc<GatedSender> {
        Arc::new(GatedSender {
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    #[tokio::test]
    async fn cancel_during_send_suppresses_escalation() {
        let gate = gated();
        let h = Arc::new(harness(all_tiers(gate.clone()), DispatcherSettings::default()));
        h.store.add(job("s1", Tier::AiCall, full_contact()), T0).await.unwrap();

        let running = h.clone();
        let tick = tokio::spawn(async move { running.dispatcher.tick().await });

        gate.entered.notified().await;
        h.cancellations.record("s1");
        gate.release.notify_one();

        let report = tick.await.unwrap().unwrap();
        assert_eq!(report.skipped_cancelled, 1);
        assert_eq!(h.store.count().await.unwrap(), 0);
        assert!(h.cancellations.is_empty());
    }

    #[tokio::test]
    async fn overlapping_tick_keeps_cancel_for_in_flight_send() {
        let gate = gated();
        let h = Arc::new(harness(all_tiers(gate.clone()), DispatcherSettings::default()));
        h.store.add(job("s1", Tier::AiCall, full_contact()), T0).await.unwrap();

        let running = h.clone();
        let slow_tick = tokio::spawn(async move { running.dispatcher.tick().await });
        gate.entered.notified().await;

        h.cancellations.record("s1");
        h.clock.advance(Duration::from_millis(20));
        let overlapping = h.dispatcher.tick().await.unwrap();
        assert_eq!(overlapping.claimed, 0);
        assert_eq!(h.cancellations.len(), 1);

        gate.release.notify_one();
        let report = slow_tick.await.unwrap().unwrap();
        assert_eq!(report.skipped_cancelled, 1);
        assert_eq!(report.escalated, 0);
        assert!(h.store.pending_for_session("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn job_scheduled_after_cancel_still_escalates() {
        let sender = ScriptedSender::new(vec![Ok(SendReceipt::delivered(Outcome::Unanswered))]);
        let h = harness(all_tiers(sender), DispatcherSettings::default());

        h.cancellations.record("s1");
        h.store.add(job("s1", Tier::AiCall, full_contact()), T0).await.unwrap();

        let report = h.dispatcher.tick().await.unwrap();
        assert_eq!(report.escalated, 1);
        assert_eq!(report.skipped_cancelled, 0);
        assert_eq!(h.store.pending_for_session("s1").await.unwrap()[0].tier, Tier::SmsLink);
    }

    struct BrokenStore;

    #[async_trait]
    impl JobStore for BrokenStore {
        async fn add(&self, _: Job, _: i64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn claim_due(&self, _: i64, _: usize) -> Result<Vec<Job>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn cancel_by_session(&self, _: &str) -> Result<Vec<Job>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn count(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn pending_for_session(&self, _: &str) -> Result<Vec<Job>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn claim_failure_surfaces_from_tick() {
        let dispatcher = Dispatcher::new(
            Arc::new(BrokenStore),
            Arc::new(EscalationPolicy::default()),
            ChannelRegistry::new(),
            Arc::new(ManualClock::new(T0)),
            DispatcherSettings::default(),
            EventBus::new(Arc::new(DispatchMetrics::new())),
            Arc::new(CancelRegistry::new()),
        );
        let err = dispatcher.tick().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    /// Memory store whose `add` can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryJobStore,
        reject_adds: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn set_rejecting(&self, on: bool) {
            self.reject_adds.store(on, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn add(&self, job: Job, when: i64) -> Result<(), StoreError> {
            if self.reject_adds.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.add(job, when).await
        }
        async fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
            self.inner.claim_due(now, limit).await
        }
        async fn cancel_by_session(&self, session_id: &str) -> Result<Vec<Job>, StoreError> {
            self.inner.cancel_by_session(session_id).await
        }
        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
        async fn pending_for_session(&self, session_id: &str) -> Result<Vec<Job>, StoreError> {
            self.inner.pending_for_session(session_id).await
        }
    }

    fn flaky_dispatcher(store: Arc<FlakyStore>, sender: Arc<dyn ChannelSender>) -> Dispatcher {
        Dispatcher::new(
            store,
            Arc::new(EscalationPolicy::default()),
            all_tiers(sender),
            Arc::new(ManualClock::new(T0)),
            DispatcherSettings::default(),
            EventBus::new(Arc::new(DispatchMetrics::new())),
            Arc::new(CancelRegistry::new()),
        )
    }

    #[tokio::test]
    async fn rejected_escalation_write_is_retried_next_tick() {
        let store = Arc::new(FlakyStore::default());
        let sender = ScriptedSender::new(vec![Ok(SendReceipt::delivered(Outcome::Refused))]);
        let dispatcher = flaky_dispatcher(store.clone(), sender);
        store.add(job("s1", Tier::AiCall, full_contact()), T0).await.unwrap();

        store.set_rejecting(true);
        let first = dispatcher.tick().await.unwrap();
        assert_eq!(first.deferred, 1);
        assert_eq!(first.failed, 0);
        assert_eq!(dispatcher.deferred_len(), 1);
        assert_eq!(store.count().await.unwrap(), 0);

        // Still down: kept for later.
        assert_eq!(dispatcher.tick().await.unwrap().deferred_written, 0);
        assert_eq!(dispatcher.deferred_len(), 1);

        store.set_rejecting(false);
        let second = dispatcher.tick().await.unwrap();
        assert_eq!(second.deferred_written, 1);
        assert_eq!(dispatcher.deferred_len(), 0);
        let pending = store.pending_for_session("s1").await.unwrap();
        assert_eq!(pending[0].tier, Tier::SmsLink);
        assert_eq!(pending[0].scheduled_at, T0 + 30 * MIN);
    }

    #[tokio::test]
    async fn rejected_retry_write_keeps_attempt_count() {
        let store = Arc::new(FlakyStore::default());
        let sender = ScriptedSender::new(vec![Err(ChannelError::Transient("503".into()))]);
        let dispatcher = flaky_dispatcher(store.clone(), sender);
        store.add(job("s1", Tier::SmsLink, full_contact()), T0).await.unwrap();

        store.set_rejecting(true);
        assert_eq!(dispatcher.tick().await.unwrap().deferred, 1);
        store.set_rejecting(false);
        assert_eq!(dispatcher.tick().await.unwrap().deferred_written, 1);

        let pending = store.pending_for_session("s1").await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].scheduled_at, T0 + 5 * MIN);
    }

    #[tokio::test]
    async fn discarded_deferred_write_never_lands() {
        let store = Arc::new(FlakyStore::default());
        let sender = ScriptedSender::new(vec![Ok(SendReceipt::delivered(Outcome::Unanswered))]);
        let dispatcher = flaky_dispatcher(store.clone(), sender);
        store.add(job("s1", Tier::AiCall, full_contact()), T0).await.unwrap();

        store.set_rejecting(true);
        dispatcher.tick().await.unwrap();
        let dropped = dispatcher.discard_deferred("s1");
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].tier, Tier::SmsLink);
        assert!(dispatcher.discard_deferred("s1").is_empty());

        store.set_rejecting(false);
        assert_eq!(dispatcher.tick().await.unwrap().deferred_written, 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
