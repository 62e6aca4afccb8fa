//! Single-flight tracking of folder requests
//!
//! Two crawlers (or a crawler and the path resolver) asking for the same
//! folder at the same time are serialized on a per-key async lock, so the
//! second caller finds the first caller's result in the cache instead of
//! issuing a duplicate request against the provider quota.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-key async locks, created on demand and dropped when unused
#[derive(Default)]
pub struct FolderRequestTracker {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FolderRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &str) -> FolderRequestGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(key.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        FolderRequestGuard {
            tracker: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on
    pub fn in_flight(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Releases the key on drop and forgets it once nobody else is waiting
pub struct FolderRequestGuard<'a> {
    tracker: &'a FolderRequestTracker,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FolderRequestGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.tracker.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let tracker = Arc::new(FolderRequestTracker::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..5 {
            let tracker = tracker.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = tracker.acquire("folder-1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let tracker = FolderRequestTracker::new();
        let _a = tracker.acquire("a").await;
        let _b = tracker.acquire("b").await;
        assert_eq!(tracker.in_flight(), 2);
    }
}
