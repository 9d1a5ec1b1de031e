//! Memory-scope tracking and crash-context collaborators
//!
//! Both are owned elsewhere in a host application. The loader only opens and
//! closes named tracked scopes and appends key/value pairs to the crash context.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Narrow begin/end interface onto the host's memory instrumentation
pub trait MemoryScopeTracker: Send + Sync {
    fn begin_scope(&self, tag: &str);
    fn end_scope(&self, tag: &str);
}

/// Tracker that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTracker;

impl MemoryScopeTracker for NullTracker {
    fn begin_scope(&self, _tag: &str) {}
    fn end_scope(&self, _tag: &str) {}
}

/// Tracker counting scope entries and exits
#[derive(Debug, Default)]
pub struct CountingTracker {
    begun: AtomicU64,
    ended: AtomicU64,
}

impl CountingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scopes opened so far
    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::Acquire)
    }

    /// Scopes closed so far
    pub fn ended(&self) -> u64 {
        self.ended.load(Ordering::Acquire)
    }
}

impl MemoryScopeTracker for CountingTracker {
    fn begin_scope(&self, _tag: &str) {
        self.begun.fetch_add(1, Ordering::AcqRel);
    }

    fn end_scope(&self, _tag: &str) {
        self.ended.fetch_add(1, Ordering::AcqRel);
    }
}

/// RAII guard closing a tracked scope on drop
pub struct TrackedScope<'a> {
    tracker: &'a dyn MemoryScopeTracker,
    tag: &'a str,
}

impl<'a> TrackedScope<'a> {
    pub fn new(tracker: &'a dyn MemoryScopeTracker, tag: &'a str) -> Self {
        tracker.begin_scope(tag);
        Self { tracker, tag }
    }
}

impl Drop for TrackedScope<'_> {
    fn drop(&mut self) {
        self.tracker.end_scope(self.tag);
    }
}

/// Crash/telemetry context the loader appends key/value data to
pub trait CrashContext: Send + Sync {
    fn set(&self, key: &str, value: &str);
}

/// Crash context kept in memory
#[derive(Debug, Default)]
pub struct InMemoryCrashContext {
    entries: Mutex<BTreeMap<String, String>>,
}

impl InMemoryCrashContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.lock().clone()
    }
}

impl CrashContext for InMemoryCrashContext {
    fn set(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_scope_pairs() {
        let tracker = CountingTracker::new();
        {
            let _outer = TrackedScope::new(&tracker, "outer");
            let _inner = TrackedScope::new(&tracker, "inner");
            assert_eq!(tracker.begun(), 2);
            assert_eq!(tracker.ended(), 0);
        }
        assert_eq!(tracker.ended(), 2);
    }

    #[test]
    fn test_crash_context() {
        let ctx = InMemoryCrashContext::new();
        ctx.set("LastPackage", "/Game/A");
        ctx.set("LastPackage", "/Game/B");
        assert_eq!(ctx.get("LastPackage").as_deref(), Some("/Game/B"));
        assert_eq!(ctx.snapshot().len(), 1);
    }
}
