use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::{Job, JobKey, Tier};

use super::JobStore;

/// In-process store. Primary map, time index, and session index are all
/// guarded by one mutex, so every mutation updates the three together.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Indexes>,
}

#[derive(Debug, Default)]
struct Indexes {
    jobs: HashMap<JobKey, Job>,
    by_time: BTreeSet<(i64, JobKey)>,
    by_session: HashMap<String, BTreeSet<Tier>>,
}

impl Indexes {
    fn insert(&mut self, job: Job) {
        let key = job.key();
        self.remove(&key);
        self.by_time.insert((job.scheduled_at, key.clone()));
        self.by_session
            .entry(key.session_id.clone())
            .or_default()
            .insert(key.tier);
        self.jobs.insert(key, job);
    }

    fn remove(&mut self, key: &JobKey) -> Option<Job> {
        let job = self.jobs.remove(key)?;
        self.by_time.remove(&(job.scheduled_at, key.clone()));
        if let Some(tiers) = self.by_session.get_mut(&key.session_id) {
            tiers.remove(&key.tier);
            if tiers.is_empty() {
                self.by_session.remove(&key.session_id);
            }
        }
        Some(job)
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Indexes>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add(&self, mut job: Job, when_millis: i64) -> Result<(), StoreError> {
        job.scheduled_at = when_millis;
        self.lock()?.insert(job);
        Ok(())
    }

    async fn claim_due(&self, now_millis: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut idx = self.lock()?;
        let due: Vec<JobKey> = idx
            .by_time
            .iter()
            .take_while(|(at, _)| *at <= now_millis)
            .take(limit)
            .map(|(_, key)| key.clone())
            .collect();

        Ok(due.iter().filter_map(|key| idx.remove(key)).collect())
    }

    async fn cancel_by_session(&self, session_id: &str) -> Result<Vec<Job>, StoreError> {
        let mut idx = self.lock()?;
        let Some(tiers) = idx.by_session.get(session_id).cloned() else {
            return Ok(Vec::new());
        };
        Ok(tiers
            .into_iter()
            .filter_map(|tier| idx.remove(&JobKey::new(session_id, tier)))
            .collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.jobs.len())
    }

    async fn pending_for_session(&self, session_id: &str) -> Result<Vec<Job>, StoreError> {
        let idx = self.lock()?;
        let jobs = idx
            .by_session
            .get(session_id)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| idx.jobs.get(&JobKey::new(session_id, *tier)).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(jobs)
    }
}
