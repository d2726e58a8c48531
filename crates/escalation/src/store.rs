//! Time-ordered job store with atomic claim.
//!
//! The store is the only state shared between dispatcher instances. The one
//! property everything else relies on is that [`JobStore::claim_due`] removes
//! the jobs it returns in the same atomic step that selects them, so two
//! dispatchers can never both execute the same job.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::Job;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` due at `when_millis`, replacing any pending job with the
    /// same `(session_id, tier)`. Latest write wins.
    async fn add(&self, job: Job, when_millis: i64) -> Result<(), StoreError>;

    /// Atomically remove and return up to `limit` jobs with
    /// `scheduled_at <= now_millis`, earliest first.
    async fn claim_due(&self, now_millis: i64, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Remove every pending job of `session_id` and return the removed jobs.
    async fn cancel_by_session(&self, session_id: &str) -> Result<Vec<Job>, StoreError>;

    /// Number of pending jobs.
    async fn count(&self) -> Result<usize, StoreError>;

    /// Pending jobs of one session, ordered by tier.
    async fn pending_for_session(&self, session_id: &str) -> Result<Vec<Job>, StoreError>;
}
