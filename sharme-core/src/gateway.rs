//! The seam between the sync engine and the archive: traits
//! implemented concretely by `sharme-backends`.
//!
//! A small, `Send + Sync` trait object that the core crate depends on
//! but never implements itself, so tests in `sharme-core` run against
//! an in-memory double instead of real network I/O.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Tags = BTreeMap<String, String>;

/// One transaction matched by a tagged archive query, with its tags
/// already read into a map for the caller's strict-acceptance check.
#[derive(Clone, Debug)]
pub struct QueryHit {
    pub tx_id: String,
    pub block_height: u64,
    pub tags: Tags,
}

#[derive(Clone, Debug)]
pub struct UploadReceipt {
    pub tx_id: String,
}

/// Paginated, tag-filtered archive reads and size-capped downloads.
/// Implementations own gateway failover; callers only see an
/// aggregated [`crate::error::SharmeError::GatewayError`] once every
/// configured gateway has been exhausted.
#[async_trait]
pub trait ArchiveGateway: Send + Sync {
    /// All transactions matching the given tag filter, sorted by
    /// block height ascending, deduplicated by transaction id.
    async fn query_by_tags(&self, filter: &Tags) -> Result<Vec<QueryHit>>;

    /// `download(tx_id, max_bytes)`. Enforces `max_bytes` against
    /// `Content-Length` before reading, then again against actual
    /// received bytes.
    async fn download(&self, tx_id: &str, max_bytes: usize) -> Result<Vec<u8>>;
}

/// Signs and submits an encrypted shard/segment/share payload,
/// returning the archive transaction id.
#[async_trait]
pub trait UploadBackend: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, tags: Tags) -> Result<UploadReceipt>;
}

pub type SharedGateway = Arc<dyn ArchiveGateway>;
pub type SharedUploader = Arc<dyn UploadBackend>;
