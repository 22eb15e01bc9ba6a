//! Per-resource serialization.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per resource key, created on demand.
///
/// Entries are dropped once no task holds or waits for them.
#[derive(Default)]
pub struct KeyLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: impl Into<String>) -> KeyGuard {
        let key = key.into();
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;

        KeyGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map itself still references the mutex.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let max_inside = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("users/u1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock("users/a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("users/b")).await;
        assert!(b.is_ok());
        drop(b);
        assert_eq!(locks.active(), 1);
    }
}
