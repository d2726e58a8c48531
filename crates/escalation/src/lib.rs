//! Delayed multi-tier escalation scheduler.
//!
//! When an in-widget feedback attempt goes unanswered, a session is escalated
//! through a fixed chain of contact channels (AI call, SMS link, email link).
//! Each tier runs after its own delay, retries transient failures a bounded
//! number of times, and can be cancelled for a whole session at once.
//!
//! This crate provides:
//! - [`JobStore`] with an in-memory and a PostgreSQL backend (atomic claim)
//! - [`EscalationPolicy`], the tier table driving delays, retries, and order
//! - [`ChannelSender`], the seam that concrete delivery channels implement
//! - [`Dispatcher`], the poll loop that claims and executes due jobs
//! - [`Scheduler`], the public facade (`schedule_tier`, `cancel_session`, ...)

pub mod cancel;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod policy;
pub mod scheduler;
pub mod sender;
pub mod store;

pub use cancel::{CancelRegistry, ClaimEpoch, InFlightClaim};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EscalationConfig, TierOverride};
pub use dispatcher::{Dispatcher, DispatcherSettings, TickReport};
pub use error::{ConfigError, EscalationError, StoreError};
pub use events::{EventBus, JobEvent, JobEventKind};
pub use job::{Contact, ContactField, Job, JobKey, JobStatus, Tier};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use policy::{EscalationPolicy, TierPolicy};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use sender::{ChannelError, ChannelRegistry, ChannelSender, Outcome, SendReceipt, TemplateContext};
pub use store::{JobStore, MemoryJobStore, PgJobStore};
