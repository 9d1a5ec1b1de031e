//! Loader counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the loading and owning threads
#[derive(Debug, Default)]
pub struct LoadStats {
    pub requests: AtomicU64,
    pub packages_created: AtomicU64,
    pub packages_completed: AtomicU64,
    pub packages_failed: AtomicU64,
    pub packages_canceled: AtomicU64,
    pub exports_created: AtomicU64,
    pub exports_serialized: AtomicU64,
    pub exports_preloaded: AtomicU64,
    pub imports_resolved: AtomicU64,
    pub imports_failed: AtomicU64,
    pub reads_issued: AtomicU64,
    pub exports_per_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub events_processed: AtomicU64,
    pub stalls: AtomicU64,
}

/// Point-in-time copy of [`LoadStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStatsSnapshot {
    pub requests: u64,
    pub packages_created: u64,
    pub packages_completed: u64,
    pub packages_failed: u64,
    pub packages_canceled: u64,
    pub exports_created: u64,
    pub exports_serialized: u64,
    pub exports_preloaded: u64,
    pub imports_resolved: u64,
    pub imports_failed: u64,
    pub reads_issued: u64,
    pub exports_per_read: u64,
    pub bytes_read: u64,
    pub events_processed: u64,
    pub stalls: u64,
}

impl LoadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoadStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LoadStatsSnapshot {
            requests: get(&self.requests),
            packages_created: get(&self.packages_created),
            packages_completed: get(&self.packages_completed),
            packages_failed: get(&self.packages_failed),
            packages_canceled: get(&self.packages_canceled),
            exports_created: get(&self.exports_created),
            exports_serialized: get(&self.exports_serialized),
            exports_preloaded: get(&self.exports_preloaded),
            imports_resolved: get(&self.imports_resolved),
            imports_failed: get(&self.imports_failed),
            reads_issued: get(&self.reads_issued),
            exports_per_read: get(&self.exports_per_read),
            bytes_read: get(&self.bytes_read),
            events_processed: get(&self.events_processed),
            stalls: get(&self.stalls),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.packages_created,
            &self.packages_completed,
            &self.packages_failed,
            &self.packages_canceled,
            &self.exports_created,
            &self.exports_serialized,
            &self.exports_preloaded,
            &self.imports_resolved,
            &self.imports_failed,
            &self.reads_issued,
            &self.exports_per_read,
            &self.bytes_read,
            &self.events_processed,
            &self.stalls,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl LoadStatsSnapshot {
    /// Average number of exports satisfied per issued read
    pub fn exports_per_read_avg(&self) -> f64 {
        if self.reads_issued == 0 {
            0.0
        } else {
            self.exports_per_read as f64 / self.reads_issued as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = LoadStats::new();
        LoadStats::bump(&stats.packages_completed);
        LoadStats::add(&stats.reads_issued, 2);
        LoadStats::add(&stats.exports_per_read, 5);
        let snap = stats.snapshot();
        assert_eq!(snap.packages_completed, 1);
        assert_eq!(snap.exports_per_read_avg(), 2.5);
        stats.reset();
        assert_eq!(stats.snapshot(), LoadStatsSnapshot::default());
    }
}
