//! In-process revocation store.
//!
//! Entries live in a `DashMap` keyed by the blocklist key, valued by the
//! instant the block lapses. Expired entries are evicted lazily on lookup and
//! by a background reaper. Deadlines use [`tokio::time::Instant`] so the
//! paused test clock drives expiry.
//!
//! Suitable for a single gateway instance; replicas do not share it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::debug;

use super::{RevocationError, RevocationStore};

/// Blocklist held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRevocationStore {
    blocked: DashMap<String, Instant>,
}

impl InMemoryRevocationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included until they are reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    /// `true` when no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

#[async_trait::async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn is_blocked(&self, key: &str) -> Result<bool, RevocationError> {
        let Some(deadline) = self.blocked.get(key).map(|e| *e.value()) else {
            return Ok(false);
        };
        if Instant::now() < deadline {
            return Ok(true);
        }
        // Lazy eviction; a concurrent re-block with a later deadline survives
        self.blocked.remove_if(key, |_, d| *d <= Instant::now());
        debug!("Lazy-evicted expired revocation entry");
        Ok(false)
    }

    async fn block(&self, key: &str, ttl: Duration) -> Result<(), RevocationError> {
        let deadline = Instant::now() + ttl;
        match self.blocked.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if *e.get() < deadline {
                    e.insert(deadline);
                }
            }
            Entry::Vacant(e) => {
                e.insert(deadline);
            }
        }
        Ok(())
    }

    async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.blocked.len();
        self.blocked.retain(|_, deadline| *deadline > now);
        before.saturating_sub(self.blocked.len())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Spawn a background task that reaps expired entries every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn RevocationStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired revocation entries");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Revocation reaper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_blocked_key_is_not_blocked() {
        // GIVEN: an empty store
        let store = InMemoryRevocationStore::new();

        // WHEN/THEN: repeated lookups agree and leave no trace
        assert!(!store.is_blocked("tok").await.unwrap());
        assert!(!store.is_blocked("tok").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn block_holds_until_ttl_elapses() {
        // GIVEN: a key blocked for 10 seconds
        let store = InMemoryRevocationStore::new();
        store.block("tok", Duration::from_secs(10)).await.unwrap();

        // THEN: blocked before the deadline, free at it
        assert!(store.is_blocked("tok").await.unwrap());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.is_blocked("tok").await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.is_blocked("tok").await.unwrap());

        // AND: the expired entry was evicted by the lookup
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reblocking_keeps_the_later_expiry() {
        let store = InMemoryRevocationStore::new();

        store.block("tok", Duration::from_secs(60)).await.unwrap();
        store.block("tok", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.is_blocked("tok").await.unwrap());

        store.block("tok", Duration::from_secs(120)).await.unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(store.is_blocked("tok").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn reap_removes_only_expired_entries() {
        // GIVEN: one long and two short blocks
        let store = InMemoryRevocationStore::new();
        store.block("long", Duration::from_secs(3600)).await.unwrap();
        store.block("short-1", Duration::from_secs(1)).await.unwrap();
        store.block("short-2", Duration::from_secs(10)).await.unwrap();

        // WHEN: the short ones lapse and the reaper runs
        tokio::time::advance(Duration::from_secs(11)).await;
        let reaped = store.reap_expired().await;

        // THEN: two removed, one remains
        assert_eq!(reaped, 2);
        assert_eq!(store.len(), 1);
        assert!(store.is_blocked("long").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_task_runs_until_shutdown() {
        let store = Arc::new(InMemoryRevocationStore::new());
        store.block("tok", Duration::from_secs(1)).await.unwrap();
        let (tx, rx) = tokio::sync::broadcast::channel(1);

        let handle = spawn_reaper(store.clone(), Duration::from_secs(5), rx);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.is_empty());

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
