use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

use crate::events::JobEventKind;
use crate::job::Tier;

/// Point-in-time copy of dispatcher counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Lifecycle events seen, by kind.
    pub events: HashMap<JobEventKind, u64>,
    /// Channel sends performed, by tier.
    pub sends: HashMap<Tier, u64>,
    /// Mean send duration, by tier.
    pub avg_send_duration: HashMap<Tier, Duration>,
    /// Poll cycles that failed with a store error.
    pub failed_ticks: u64,
}

impl MetricsSnapshot {
    pub fn count(&self, kind: JobEventKind) -> u64 {
        self.events.get(&kind).copied().unwrap_or_default()
    }
}

/// Shared counters updated by the dispatcher and the event bus.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    inner: RwLock<MetricsSnapshot>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, kind: JobEventKind) {
        if let Ok(mut m) = self.inner.write() {
            *m.events.entry(kind).or_default() += 1;
        }
    }

    pub fn record_send(&self, tier: Tier, duration: Duration) {
        let Ok(mut m) = self.inner.write() else {
            return;
        };
        let count = {
            let c = m.sends.entry(tier).or_default();
            *c += 1;
            *c
        };
        let prev = m.avg_send_duration.get(&tier).copied().unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        m.avg_send_duration.insert(tier, new_avg);
    }

    pub fn record_failed_tick(&self) {
        if let Ok(mut m) = self.inner.write() {
            m.failed_ticks += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}
