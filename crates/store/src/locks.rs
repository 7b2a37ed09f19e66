use std::sync::{Arc, Mutex, PoisonError, Weak};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use magnitude_core::ResourceIdentity;

const PRUNE_AT: usize = 1024;

/// Per-identity async write locks. Entries are held weakly and disappear once the
/// last guard for an identity is dropped; cross-identity operations never contend.
#[derive(Default)]
pub struct IdentityLocks {
    inner: Mutex<FxHashMap<ResourceIdentity, Weak<AsyncMutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self { Self::default() }

    /// Wait for exclusive access to `identity`. The guard may be held across `.await`.
    pub async fn acquire(&self, identity: &ResourceIdentity) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if map.len() >= PRUNE_AT {
                map.retain(|_, w| w.strong_count() > 0);
            }
            match map.get(identity).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    map.insert(identity.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Number of identities with a live lock (held or awaited).
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_identity_is_serialized() {
        let locks = Arc::new(IdentityLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let id = ResourceIdentity::new("", "Pod", Some("ns"), "foo");
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (locks, inside, max_seen, id) = (locks.clone(), inside.clone(), max_seen.clone(), id.clone());
            tasks.push(tokio::spawn(async move {
                let _g = locks.acquire(&id).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_identities_do_not_contend() {
        let locks = IdentityLocks::new();
        let a = ResourceIdentity::new("", "Pod", Some("ns"), "a");
        let b = ResourceIdentity::new("", "Pod", Some("ns"), "b");
        let _ga = locks.acquire(&a).await;
        let gb = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&b)).await;
        assert!(gb.is_ok());
    }
}
