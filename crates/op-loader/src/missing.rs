//! Negative cache of packages known not to exist

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Names that failed to resolve to a file. Owned by the loader and
/// cleared when the loader starts and shuts down.
#[derive(Debug, Default)]
pub struct MissingPackageCache {
    names: RwLock<HashSet<String>>,
    hits: AtomicU64,
}

impl MissingPackageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a fresh loader session
    pub fn init(&self) {
        self.clear();
    }

    /// Check `name`, counting a hit when it is known missing
    pub fn contains(&self, name: &str) -> bool {
        let missing = self.names.read().contains(name);
        if missing {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("{} is known missing", name);
        }
        missing
    }

    /// Record `name`; returns false if it was already recorded
    pub fn insert(&self, name: &str) -> bool {
        let inserted = self.names.write().insert(name.to_string());
        if inserted {
            warn!("Package {} does not exist", name);
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.names.write().clear();
        self.hits.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_once() {
        let cache = MissingPackageCache::new();
        assert!(cache.insert("/Game/Nope"));
        assert!(!cache.insert("/Game/Nope"));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("/Game/Nope"));
        assert!(!cache.contains("/Game/Other"));
        assert_eq!(cache.hits(), 1);
        cache.init();
        assert!(cache.is_empty());
        assert_eq!(cache.hits(), 0);
    }
}
