//! Push pipeline: dirty facts and pending deletes become shards.

use super::{SyncEngine, APP_NAME};
use crate::crypto;
use crate::gateway::UploadBackend;
use crate::shard::{self, Op};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Nothing was dirty; nothing was uploaded.
    NoOp,
    /// `n` shards uploaded, meta advanced to `last_version`.
    Pushed { shards: usize, last_version: u32 },
}

pub async fn push_once(engine: &SyncEngine) -> anyhow::Result<PushOutcome> {
    // Step 1: snapshot dirty facts and pending deletes.
    let dirty_facts = engine.store.get_dirty_facts().await?;
    let pending_deletes = engine.store.get_pending_deletes().await?;

    // Step 2: no-op if nothing changed.
    if dirty_facts.is_empty() && pending_deletes.is_empty() {
        return Ok(PushOutcome::NoOp);
    }

    // Step 3: build the flat op list, upserts first, then deletes.
    let mut operations: Vec<Op> = dirty_facts.iter().map(shard::fact_to_upsert_op).collect();
    operations.extend(
        pending_deletes
            .iter()
            .map(|pd| Op::Delete {
                key: pd.key.clone(),
                extra: serde_json::Map::new(),
            }),
    );

    // Step 4: read current_version, compute start_version.
    let current_version: u32 = engine
        .store
        .get_meta(crate::meta::CURRENT_VERSION)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let start_version = current_version + 1;

    // Step 5: chunk into size-capped shards.
    let shards = shard::create_chunked_shards(operations, start_version);

    info!(
        shard_count = shards.len(),
        start_version, "push: uploading shards"
    );

    // Step 6: serialize, encrypt, sign, tag, upload each shard in order.
    let mut last_version = current_version;
    for s in &shards {
        let plaintext = shard::serialize(s)?;
        let envelope = crypto::encrypt(&plaintext, &engine.aes_key)?;
        let signature = crypto::sign(&envelope, &engine.privkey)?;

        let mut tags = BTreeMap::new();
        tags.insert("App-Name".to_string(), APP_NAME.to_string());
        tags.insert("Wallet".to_string(), engine.address.clone());
        tags.insert("Type".to_string(), "delta".to_string());
        tags.insert("Version".to_string(), s.shard_version.to_string());
        tags.insert(
            "Timestamp".to_string(),
            chrono::Utc::now().timestamp().to_string(),
        );
        tags.insert("Signature".to_string(), signature);
        tags.insert(
            "Content-Type".to_string(),
            "application/octet-stream".to_string(),
        );

        match engine.uploader.upload(envelope, tags).await {
            Ok(_) => {
                last_version = s.shard_version;
            }
            Err(e) => {
                // Abort the whole push: don't advance meta or clear
                // dirty state. Next tick retries the entire op set.
                warn!(version = s.shard_version, error = %e, "push: shard upload failed, aborting batch");
                error!("push: aborted after uploading through version {last_version}");
                return Err(e.into());
            }
        }
    }

    // Step 7: on full success, advance meta and clear dirty in one transaction.
    engine.store.finalize_push(last_version).await?;

    info!(shards = shards.len(), last_version, "push: complete");

    Ok(PushOutcome::Pushed {
        shards: shards.len(),
        last_version,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gateway::{ArchiveGateway, QueryHit, Tags, UploadBackend, UploadReceipt};
    use crate::store::{Fact, LocalStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::sync::Mutex;

    struct NullGateway;
    #[async_trait]
    impl ArchiveGateway for NullGateway {
        async fn query_by_tags(&self, _filter: &Tags) -> crate::error::Result<Vec<QueryHit>> {
            Ok(Vec::new())
        }
        async fn download(&self, _tx_id: &str, _max_bytes: usize) -> crate::error::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        uploaded: Mutex<Vec<(Vec<u8>, Tags)>>,
        counter: AtomicU32,
        fail_after: Option<u32>,
    }

    #[async_trait]
    impl UploadBackend for RecordingUploader {
        async fn upload(&self, bytes: Vec<u8>, tags: Tags) -> crate::error::Result<UploadReceipt> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            if let Some(fail_after) = self.fail_after {
                if n >= fail_after {
                    return Err(crate::error::SharmeError::NetworkUnavailable(
                        "simulated failure".into(),
                    ));
                }
            }
            self.uploaded.lock().unwrap().push((bytes, tags));
            Ok(UploadReceipt {
                tx_id: format!("tx-{n}"),
            })
        }
    }

    fn sample_fact(key: &str) -> Fact {
        let now = Utc::now();
        Fact {
            id: uuid::Uuid::new_v4().to_string(),
            scope: "global".into(),
            key: key.into(),
            value: "JWT".into(),
            tags: vec!["auth".into()],
            confidence: 1.0,
            source_session: None,
            created: now,
            last_confirmed: now,
            access_count: 0,
            dirty: true,
        }
    }

    async fn engine_with_store(
        store: LocalStore,
        uploader: RecordingUploader,
    ) -> SyncEngine {
        let sk = secp256k1::SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pk = crypto::public_key_from_private(&sk);
        let address = crypto::address_from_public_key(&pk);

        SyncEngine::new(
            store,
            Arc::new(NullGateway),
            Arc::new(uploader),
            sk,
            address,
            [9u8; crypto::KEY_LEN],
        )
    }

    #[tokio::test]
    async fn no_dirty_facts_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db")).await.unwrap();
        let engine = engine_with_store(store, RecordingUploader::default()).await;

        assert_eq!(engine.push().await.unwrap(), PushOutcome::NoOp);
    }

    #[tokio::test]
    async fn pushes_one_shard_at_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db")).await.unwrap();
        store.upsert_fact(&sample_fact("global:auth:strategy")).await.unwrap();

        let engine = engine_with_store(store, RecordingUploader::default()).await;
        let outcome = engine.push().await.unwrap();

        assert_eq!(
            outcome,
            PushOutcome::Pushed {
                shards: 1,
                last_version: 1
            }
        );
        assert!(engine.store.get_dirty_facts().await.unwrap().is_empty());
        assert_eq!(
            engine.store.get_meta(crate::meta::CURRENT_VERSION).await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn two_consecutive_pushes_with_no_mutation_upload_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db")).await.unwrap();
        store.upsert_fact(&sample_fact("global:a")).await.unwrap();

        let engine = engine_with_store(store, RecordingUploader::default()).await;
        engine.push().await.unwrap();
        let version_after_first = engine
            .store
            .get_meta(crate::meta::CURRENT_VERSION)
            .await
            .unwrap();

        let second = engine.push().await.unwrap();
        assert_eq!(second, PushOutcome::NoOp);
        assert_eq!(
            engine.store.get_meta(crate::meta::CURRENT_VERSION).await.unwrap(),
            version_after_first
        );
    }

    #[tokio::test]
    async fn failed_upload_does_not_advance_meta_or_clear_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db")).await.unwrap();
        store.upsert_fact(&sample_fact("global:a")).await.unwrap();

        let uploader = RecordingUploader {
            fail_after: Some(0),
            ..Default::default()
        };
        let engine = engine_with_store(store, uploader).await;

        assert!(engine.push().await.is_err());
        assert_eq!(engine.store.get_dirty_facts().await.unwrap().len(), 1);
        assert_eq!(
            engine.store.get_meta(crate::meta::CURRENT_VERSION).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn upsert_then_delete_emits_both_ops_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db")).await.unwrap();
        store.upsert_fact(&sample_fact("global:k")).await.unwrap();
        store.delete_fact("global:k").await.unwrap();

        let uploader = RecordingUploader::default();
        let engine = engine_with_store(store, uploader).await;
        let outcome = engine.push().await.unwrap();

        match outcome {
            PushOutcome::Pushed { shards, .. } => assert!(shards >= 1),
            PushOutcome::NoOp => panic!("expected a push"),
        }
    }
}
