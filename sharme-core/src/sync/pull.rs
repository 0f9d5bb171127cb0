//! Pull + reconstruct pipeline: query, verify, decrypt, replay.

use super::{SyncEngine, APP_NAME};
use crate::crypto;
use crate::gateway::{ArchiveGateway, QueryHit};
use crate::shard::{self, Op};
use crate::store::Fact;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Pull-time download cap: 100 KiB (> 90 KiB create budget, to
/// tolerate envelope overhead growth).
pub const SHARD_DOWNLOAD_CAP_BYTES: usize = 100 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SkippedShard {
    BadWallet,
    BadVersion,
    MissingSignature,
    TooLarge,
    SignatureInvalid,
    DecryptFailed,
    MalformedJson,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PullOutcome {
    pub accepted: usize,
    pub skipped: Vec<SkippedShard>,
    pub final_version: u32,
}

pub async fn pull_reconstruct(engine: &SyncEngine) -> anyhow::Result<PullOutcome> {
    let mut filter = BTreeMap::new();
    filter.insert("App-Name".to_string(), APP_NAME.to_string());
    filter.insert("Wallet".to_string(), engine.address.clone());

    let hits = engine.gateway.query_by_tags(&filter).await?;
    let accepted_hits = accept_and_sort_shard_hits(hits, &engine.address);

    let mut outcome = PullOutcome::default();
    let mut max_version = 0u32;

    for (hit, version) in accepted_hits {
        match apply_one_shard(engine, &hit, version).await {
            Ok(()) => {
                outcome.accepted += 1;
                max_version = max_version.max(version);
            }
            Err(reason) => {
                debug!(tx_id = %hit.tx_id, ?reason, "pull: skipped shard");
                outcome.skipped.push(reason);
            }
        }
    }

    if max_version > 0 {
        engine.store.set_current_version(max_version).await?;
    }
    outcome.final_version = max_version;

    info!(
        accepted = outcome.accepted,
        skipped = outcome.skipped.len(),
        final_version = outcome.final_version,
        "pull: complete"
    );

    Ok(outcome)
}

/// Strict acceptance: keep only `delta`/`snapshot` with a present
/// `Signature`, a wallet match, and
/// (for delta/snapshot) a `Version` that parses to an integer >= 1.
/// Final sort is by `Version` ascending — the canonical replay order.
fn accept_and_sort_shard_hits(hits: Vec<QueryHit>, wallet: &str) -> Vec<(QueryHit, u32)> {
    let mut accepted: Vec<(QueryHit, u32)> = hits
        .into_iter()
        .filter_map(|hit| {
            let shard_type = hit.tags.get("Type")?;
            if shard_type != "delta" && shard_type != "snapshot" {
                return None;
            }
            let hit_wallet = hit.tags.get("Wallet")?;
            if !hit_wallet.eq_ignore_ascii_case(wallet) {
                return None;
            }
            let signature = hit.tags.get("Signature")?;
            if signature.is_empty() {
                return None;
            }
            let version: u32 = hit.tags.get("Version")?.parse().ok()?;
            if version < 1 {
                return None;
            }
            Some((hit, version))
        })
        .collect();

    accepted.sort_by_key(|(_, version)| *version);
    accepted
}

async fn apply_one_shard(
    engine: &SyncEngine,
    hit: &QueryHit,
    _version: u32,
) -> Result<(), SkippedShard> {
    let envelope = engine
        .gateway
        .download(&hit.tx_id, SHARD_DOWNLOAD_CAP_BYTES)
        .await
        .map_err(|_| SkippedShard::TooLarge)?;

    if envelope.len() > SHARD_DOWNLOAD_CAP_BYTES {
        return Err(SkippedShard::TooLarge);
    }

    let signature = hit.tags.get("Signature").ok_or(SkippedShard::MissingSignature)?;
    let wallet = hit.tags.get("Wallet").ok_or(SkippedShard::BadWallet)?;
    if !crypto::verify(&envelope, signature, wallet) {
        return Err(SkippedShard::SignatureInvalid);
    }

    let plaintext = crypto::decrypt(&envelope, &engine.aes_key).map_err(|_| SkippedShard::DecryptFailed)?;
    let shard = shard::deserialize(&plaintext).map_err(|_| SkippedShard::MalformedJson)?;

    for op in shard.operations {
        match op {
            Op::Upsert { fact, .. } => replay_upsert(engine, fact).await,
            Op::Delete { key, .. } => replay_delete(engine, &key).await,
        }
        .map_err(|_| SkippedShard::MalformedJson)?;
    }

    Ok(())
}

async fn replay_upsert(engine: &SyncEngine, fact: Fact) -> crate::error::Result<()> {
    engine.store.replay_upsert(&fact).await
}

async fn replay_delete(engine: &SyncEngine, key: &str) -> crate::error::Result<()> {
    engine.store.replay_delete(key).await
}
