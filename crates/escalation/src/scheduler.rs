//! Public entry points of the escalation scheduler.
//!
//! ```ignore
//! let scheduler = Scheduler::builder(Arc::new(MemoryJobStore::new()))
//!     .config(&config)
//!     .channel(Tier::AiCall, voice_sender)
//!     .channel(Tier::SmsLink, sms_sender)
//!     .channel(Tier::EmailLink, email_sender)
//!     .build()?;
//!
//! scheduler.start().await;
//! scheduler
//!     .schedule_tier(Tier::AiCall, "sess-1", "res-1", "user-1", contact)
//!     .await?;
//! // ... end user answered in the widget after all:
//! scheduler.cancel_session("sess-1").await?;
//! scheduler.stop().await;
//! ```

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::config::EscalationConfig;
use crate::cancel::CancelRegistry;
use crate::dispatcher::{Dispatcher, DispatcherSettings, TickReport};
use crate::error::{EscalationError, Result, StoreError};
use crate::events::{EventBus, JobEvent, JobEventKind};
use crate::job::{Contact, Job, JobKey, Tier};
use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::policy::EscalationPolicy;
use crate::sender::{ChannelRegistry, ChannelSender};
use crate::store::JobStore;

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent builder for a [`Scheduler`].
pub struct SchedulerBuilder {
    store: Arc<dyn JobStore>,
    config: EscalationConfig,
    policy: Option<EscalationPolicy>,
    clock: Arc<dyn Clock>,
    channels: ChannelRegistry,
}

impl SchedulerBuilder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: EscalationConfig::default(),
            policy: None,
            clock: Arc::new(SystemClock),
            channels: ChannelRegistry::new(),
        }
    }

    /// Dispatcher settings and tier overrides (default: [`EscalationConfig::default`]).
    pub fn config(mut self, config: &EscalationConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Use an explicit policy table instead of deriving one from the config.
    pub fn policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Time source (default: [`SystemClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn channel(mut self, tier: Tier, sender: Arc<dyn ChannelSender>) -> Self {
        self.channels.register(tier, sender);
        self
    }

    pub fn channels(mut self, channels: ChannelRegistry) -> Self {
        self.channels = channels;
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;
        let policy = match self.policy {
            Some(p) => p,
            None => EscalationPolicy::from_config(&self.config)?,
        };
        let policy = Arc::new(policy);
        let events = EventBus::new(Arc::new(DispatchMetrics::new()));
        let cancellations = Arc::new(CancelRegistry::new());

        for tier in Tier::ALL {
            if policy.get(tier).is_some() && self.channels.get(tier).is_none() {
                warn!(%tier, "no channel sender registered; jobs for this tier will fail");
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(
            self.store.clone(),
            policy.clone(),
            self.channels,
            self.clock.clone(),
            DispatcherSettings::from(&self.config),
            events.clone(),
            cancellations.clone(),
        ));

        Ok(Scheduler {
            store: self.store,
            policy,
            clock: self.clock,
            events,
            cancellations,
            dispatcher,
            runner: Mutex::new(None),
        })
    }
}

// ── Scheduler ────────────────────────────────────────────────────────

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Facade over the job store and the dispatcher poll loop.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    policy: Arc<EscalationPolicy>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    cancellations: Arc<CancelRegistry>,
    dispatcher: Arc<Dispatcher>,
    runner: Mutex<Option<RunningLoop>>,
}

impl Scheduler {
    pub fn builder(store: Arc<dyn JobStore>) -> SchedulerBuilder {
        SchedulerBuilder::new(store)
    }

    /// Schedule `tier` for a session, due after the tier's policy delay.
    ///
    /// Replaces any pending job for the same `(session_id, tier)`. Fails
    /// without touching the store if the contact lacks the tier's required
    /// field.
    pub async fn schedule_tier(
        &self,
        tier: Tier,
        session_id: &str,
        resolution_id: &str,
        end_user_id: &str,
        contact: Contact,
    ) -> Result<Job> {
        let policy = self.policy.get(tier).ok_or(EscalationError::NoPolicy(tier))?;
        if contact.destination_for(tier).is_none() {
            return Err(EscalationError::MissingContact {
                tier,
                field: tier.required_field(),
            });
        }

        let now = self.clock.now_millis();
        let when = now.saturating_add(duration_millis(policy.delay));
        let job = Job {
            id: JobKey::new(session_id, tier).to_string(),
            session_id: session_id.to_string(),
            resolution_id: resolution_id.to_string(),
            end_user_id: end_user_id.to_string(),
            contact,
            tier,
            scheduled_at: when,
            attempts: 0,
            max_attempts: policy.max_attempts,
            created_at: now,
        };

        self.store.add(job.clone(), when).await?;
        self.events
            .emit(JobEvent::for_job(JobEventKind::Scheduled, &job, now));
        Ok(job)
    }

    /// Drop every pending job of a session. Returns how many were removed;
    /// unknown sessions and repeated calls return 0.
    ///
    /// Jobs of the session that this instance has already claimed finish
    /// their send but write nothing back.
    pub async fn cancel_session(&self, session_id: &str) -> Result<usize> {
        let _exclusive = self.cancellations.exclusive().await;
        self.cancellations.record(session_id);

        let mut removed = self.dispatcher.discard_deferred(session_id);
        removed.extend(self.store.cancel_by_session(session_id).await?);

        let now = self.clock.now_millis();
        for job in &removed {
            self.events
                .emit(JobEvent::for_job(JobEventKind::Cancelled, job, now));
        }
        Ok(removed.len())
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.store.count().await?)
    }

    pub async fn pending_for_session(&self, session_id: &str) -> Result<Vec<Job>> {
        Ok(self.store.pending_for_session(session_id).await?)
    }

    /// Run one poll cycle on the caller's task, outside the background loop.
    pub async fn run_once(&self) -> std::result::Result<TickReport, StoreError> {
        self.dispatcher.tick().await
    }

    /// Spawn the poll loop. Calling it while already running does nothing.
    pub async fn start(&self) {
        let mut runner = self.runner.lock().await;
        if let Some(running) = runner.as_ref() {
            if !running.handle.is_finished() {
                return;
            }
        }

        let (shutdown, rx) = watch::channel(false);
        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(async move { dispatcher.run(rx).await });
        *runner = Some(RunningLoop { shutdown, handle });
        info!(dispatcher_id = %self.dispatcher.id(), "escalation scheduler started");
    }

    /// Stop the poll loop, waiting for an in-flight batch to finish.
    /// Calling it when not running does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.runner.lock().await.take() else {
            return;
        };
        // Receiver gone means the loop already exited.
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            warn!(error = %e, "dispatcher task ended abnormally");
        }
        info!(dispatcher_id = %self.dispatcher.id(), "escalation scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.runner
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Lifecycle events emitted after this call.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.events.metrics().snapshot()
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
