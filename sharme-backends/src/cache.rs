//! Read-through cache over an inner [`ArchiveGateway`]'s `download`
//! calls.
//!
//! An LRU eviction list (`lru::LruCache`) guarded by an async lock,
//! plus an `scc::HashMap` tracking in-flight work so two callers
//! racing on the same id share one fetch instead of issuing it twice.
//! The seam here is already `async fn`, so the single-flight future
//! itself can simply be awaited by every racing caller.

use async_trait::async_trait;
use sharme_core::error::Result;
use sharme_core::gateway::{ArchiveGateway, QueryHit, Tags};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Wraps an inner gateway, caching downloaded bytes by transaction id.
/// Queries (`query_by_tags`) always pass through: the archive's tag
/// index can grow new matches between calls, so only content-addressed
/// downloads — which never change once written — are safe to cache.
pub struct CachedGateway<G> {
    inner: G,
    entries: RwLock<lru::LruCache<String, Arc<Vec<u8>>>>,
    in_flight: scc::HashMap<String, Arc<Mutex<()>>>,
}

impl<G: ArchiveGateway> CachedGateway<G> {
    pub fn new(inner: G, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            entries: RwLock::new(lru::LruCache::new(capacity)),
            in_flight: scc::HashMap::new(),
        }
    }
}

#[async_trait]
impl<G: ArchiveGateway + Send + Sync> ArchiveGateway for CachedGateway<G> {
    async fn query_by_tags(&self, filter: &Tags) -> Result<Vec<QueryHit>> {
        self.inner.query_by_tags(filter).await
    }

    async fn download(&self, tx_id: &str, max_bytes: usize) -> Result<Vec<u8>> {
        if let Some(hit) = self.entries.write().await.get(tx_id) {
            return Ok(hit.as_ref().clone());
        }

        // Single-flight: whoever inserts the lock for this id first
        // does the fetch; everyone else waits on the same lock and
        // then reads whatever landed in the cache.
        let lock = self
            .in_flight
            .entry(tx_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .get()
            .clone();
        let _guard = lock.lock().await;

        if let Some(hit) = self.entries.write().await.get(tx_id) {
            return Ok(hit.as_ref().clone());
        }

        let bytes = self.inner.download(tx_id, max_bytes).await?;
        self.entries
            .write()
            .await
            .put(tx_id.to_string(), Arc::new(bytes.clone()));
        let _ = self.in_flight.remove(tx_id);

        Ok(bytes)
    }
}
