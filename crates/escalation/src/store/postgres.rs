use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::error::StoreError;
use crate::job::Job;

use super::JobStore;

/// PostgreSQL-backed store shared by any number of dispatcher processes.
///
/// The primary key `(session_id, tier)` doubles as the session index, so
/// cancellation and scheduling can never disagree about which rows exist.
/// Claiming is one `DELETE ... RETURNING` over a `FOR UPDATE SKIP LOCKED`
/// sub-select: concurrent claimers skip each other's rows instead of
/// blocking or double-claiming.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

const UPSERT: &str = "\
INSERT INTO escalation_jobs (session_id, tier, scheduled_at, payload)
VALUES ($1, $2, $3, $4)
ON CONFLICT (session_id, tier)
DO UPDATE SET scheduled_at = EXCLUDED.scheduled_at, payload = EXCLUDED.payload";

const CLAIM_DUE: &str = "\
DELETE FROM escalation_jobs
WHERE (session_id, tier) IN (
    SELECT session_id, tier FROM escalation_jobs
    WHERE scheduled_at <= $1
    ORDER BY scheduled_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
RETURNING payload";

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("escalation job store migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode(rows: Vec<(String,)>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter()
        .map(|(payload,)| serde_json::from_str::<Job>(&payload).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn add(&self, mut job: Job, when_millis: i64) -> Result<(), StoreError> {
        job.scheduled_at = when_millis;
        let payload = serde_json::to_string(&job)?;
        sqlx::query(UPSERT)
            .bind(&job.session_id)
            .bind(job.tier.as_str())
            .bind(when_millis)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_due(&self, now_millis: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, (String,)>(CLAIM_DUE)
            .bind(now_millis)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING order is unspecified.
        let mut jobs = decode(rows)?;
        jobs.sort_by_key(|j| j.scheduled_at);
        Ok(jobs)
    }

    async fn cancel_by_session(&self, session_id: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "DELETE FROM escalation_jobs WHERE session_id = $1 RETURNING payload",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = decode(rows)?;
        jobs.sort_by_key(|j| j.tier);
        Ok(jobs)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM escalation_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as usize)
    }

    async fn pending_for_session(&self, session_id: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT payload FROM escalation_jobs WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = decode(rows)?;
        jobs.sort_by_key(|j| j.tier);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Contact, JobKey, Tier};

    async fn store_from_env() -> Option<PgJobStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        match PgJobStore::connect(&url).await {
            Ok(store) => Some(store),
            Err(e) => {
                eprintln!("skipping postgres test: {e}");
                None
            }
        }
    }

    fn job(session: &str, tier: Tier) -> Job {
        Job {
            id: JobKey::new(session, tier).to_string(),
            session_id: session.to_string(),
            resolution_id: "res".into(),
            end_user_id: "user".into(),
            contact: Contact::new(Some("+15550100"), Some("a@example.com")),
            tier,
            scheduled_at: 0,
            attempts: 0,
            max_attempts: 2,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn upsert_and_cancel_by_session() {
        let Some(store) = store_from_env().await else {
            return;
        };
        let session = format!("pg-test-{}", uuid::Uuid::new_v4());
        let far_future = i64::MAX / 2;

        store.add(job(&session, Tier::AiCall), far_future).await.unwrap();
        store.add(job(&session, Tier::AiCall), far_future + 1).await.unwrap();
        store.add(job(&session, Tier::SmsLink), far_future).await.unwrap();

        let pending = store.pending_for_session(&session).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].tier, Tier::AiCall);
        assert_eq!(pending[0].scheduled_at, far_future + 1);

        assert_eq!(store.cancel_by_session(&session).await.unwrap().len(), 2);
        assert!(store.cancel_by_session(&session).await.unwrap().is_empty());
    }
}
