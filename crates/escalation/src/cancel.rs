//! Cancellation bookkeeping for jobs that are already claimed.
//!
//! Deleting a session's rows only covers jobs still in the store. A job
//! claimed before the cancel may still finish its send, and its write-back
//! (retry or next tier) must then be dropped.
//!
//! Cancels are numbered from a counter instead of stamped with the clock.
//! Each claim remembers the counter value it started at, so "cancelled after
//! this job was claimed" holds exactly when the cancel's number is greater
//! than the claim's. Cancel entries are kept until no in-flight claim could
//! still be affected by them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Cancel counter value observed when a batch was claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClaimEpoch(u64);

#[derive(Debug, Default)]
struct State {
    /// Number of cancels recorded so far.
    seq: u64,
    /// Session -> number of its latest cancel.
    cancelled: HashMap<String, u64>,
    /// Epochs of claims still being processed, with their counts.
    in_flight: BTreeMap<u64, usize>,
}

impl State {
    /// Drop cancels that no in-flight claim can observe.
    fn prune(&mut self) {
        let bound = self.in_flight.keys().next().copied().unwrap_or(self.seq);
        self.cancelled.retain(|_, seq| *seq > bound);
    }
}

/// Cancels issued through this instance.
///
/// Besides the cancel log it holds a write gate: write-backs take it shared
/// around their "cancelled?" check and the store write, and a cancel takes it
/// exclusively while it records and deletes. A write-back therefore either
/// lands before the cancel's delete or sees the cancel.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    state: Mutex<State>,
    gate: RwLock<()>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // The state is plain counters and maps, valid after any panic.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, session_id: &str) {
        let mut state = self.state();
        state.seq += 1;
        let seq = state.seq;
        state.cancelled.insert(session_id.to_string(), seq);
    }

    /// Register a claim. Cancels recorded from now on apply to it until the
    /// returned guard drops.
    pub fn begin_claim(&self) -> InFlightClaim<'_> {
        let mut state = self.state();
        let epoch = state.seq;
        *state.in_flight.entry(epoch).or_default() += 1;
        InFlightClaim {
            registry: self,
            epoch: ClaimEpoch(epoch),
        }
    }

    /// Whether `session_id` was cancelled after the claim at `epoch` started.
    pub fn cancelled_after(&self, session_id: &str, epoch: ClaimEpoch) -> bool {
        self.state()
            .cancelled
            .get(session_id)
            .is_some_and(|seq| *seq > epoch.0)
    }

    fn finish_claim(&self, epoch: ClaimEpoch) {
        let mut state = self.state();
        if let Some(count) = state.in_flight.get_mut(&epoch.0) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&epoch.0);
            }
        }
        state.prune();
    }

    /// Shared side of the write gate, held around a write-back.
    pub async fn write_back(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Exclusive side of the write gate, held for a whole cancel.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// Cancel entries currently retained.
    pub fn len(&self) -> usize {
        self.state().cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.values().sum()
    }
}

/// A claim in progress; ends when dropped.
#[derive(Debug)]
pub struct InFlightClaim<'a> {
    registry: &'a CancelRegistry,
    epoch: ClaimEpoch,
}

impl InFlightClaim<'_> {
    pub fn epoch(&self) -> ClaimEpoch {
        self.epoch
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.registry.finish_claim(self.epoch);
    }
}
