//! Conversation sync: per-session offset cursor, segment chunking,
//! reassembly, and offset-ordered merge.
//!
//! Structurally this is the same shape as [`crate::sync::push`] /
//! [`crate::sync::pull`] — tag, sign, upload; query, verify, decrypt —
//! adapted to a tail-of-messages cursor instead of a fact version
//! counter. The 90 KiB chunk budget is the same one `shard::chunk_bytes`
//! enforces for shard payloads, applied here to ciphertext instead of
//! plaintext ops.

use crate::crypto;
use crate::gateway::{ArchiveGateway, SharedGateway, SharedUploader, UploadBackend};
use crate::meta;
use crate::shard;
use crate::store::LocalStore;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const SEGMENT_CHUNK_BUDGET_BYTES: usize = 90 * 1024;
pub const CHUNK_DOWNLOAD_CAP_BYTES: usize = 100 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Client {
    Cursor,
    ClaudeCode,
}

impl Client {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Client::Cursor => "cursor",
            Client::ClaudeCode => "claude-code",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Normalized conversation as emitted by the external watcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub client: Client,
    pub project: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub messages: Vec<Message>,
}

/// The plaintext payload encrypted once per push, before chunking.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SegmentPayload {
    conversation_id: String,
    client: Client,
    project: String,
    started_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    offset: usize,
    count: usize,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationPushOutcome {
    NoOp,
    Pushed { chunks: usize, new_offset: usize },
}

/// Push protocol: read the cursor, take the tail of
/// unsynced messages, encrypt+sign once, chunk the ciphertext, upload
/// every chunk with the same full-ciphertext signature, then advance
/// the cursor only once every chunk succeeds.
pub async fn push_conversation(
    store: &LocalStore,
    uploader: &SharedUploader,
    privkey: &SecretKey,
    address: &str,
    aes_key: &[u8; crypto::KEY_LEN],
    conversation: &Conversation,
) -> anyhow::Result<ConversationPushOutcome> {
    let client_tag = conversation.client.as_tag();
    let offset_key = meta::conversation_offset_key(client_tag, &conversation.id);

    let last_synced: usize = store
        .get_meta(&offset_key)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if last_synced >= conversation.messages.len() {
        return Ok(ConversationPushOutcome::NoOp);
    }

    let tail = &conversation.messages[last_synced..];
    let payload = SegmentPayload {
        conversation_id: conversation.id.clone(),
        client: conversation.client,
        project: conversation.project.clone(),
        started_at: conversation.started_at,
        updated_at: conversation.updated_at,
        offset: last_synced,
        count: tail.len(),
        messages: tail.to_vec(),
    };

    let plaintext = serde_json::to_vec(&payload)?;
    let ciphertext = crypto::encrypt(&plaintext, aes_key)?;
    let signature = crypto::sign(&ciphertext, privkey)?;

    let chunks = shard::chunk_bytes(&ciphertext, SEGMENT_CHUNK_BUDGET_BYTES);
    let total = chunks.len();

    for (i, chunk) in chunks.iter().enumerate() {
        let mut tags = BTreeMap::new();
        tags.insert("App-Name".to_string(), crate::sync::APP_NAME.to_string());
        tags.insert("Wallet".to_string(), address.to_string());
        tags.insert("Type".to_string(), "conversation".to_string());
        tags.insert("Client".to_string(), client_tag.to_string());
        tags.insert("Project".to_string(), conversation.project.clone());
        tags.insert("Session".to_string(), conversation.id.clone());
        tags.insert("Offset".to_string(), last_synced.to_string());
        tags.insert("Count".to_string(), tail.len().to_string());
        tags.insert("Chunk".to_string(), format!("{}/{}", i + 1, total));
        tags.insert(
            "Timestamp".to_string(),
            chrono::Utc::now().timestamp().to_string(),
        );
        tags.insert("Signature".to_string(), signature.clone());

        if let Err(e) = uploader.upload(chunk.to_vec(), tags).await {
            warn!(chunk = i + 1, total, error = %e, "conversation push: chunk upload failed, aborting segment");
            return Err(e.into());
        }
    }

    let new_offset = conversation.messages.len();
    store.set_meta(&offset_key, &new_offset.to_string()).await?;

    info!(
        session = %conversation.id,
        chunks = total,
        new_offset,
        "conversation push: complete"
    );

    Ok(ConversationPushOutcome::Pushed {
        chunks: total,
        new_offset,
    })
}

/// One chunk's tags, parsed out of the raw `QueryHit` map. Malformed
/// rows (missing/unparseable fields) are dropped before grouping — a
/// batch path, so it's silent, matching pull's invalid-input policy.
#[derive(Clone, Debug)]
struct ChunkMeta {
    tx_id: String,
    client: String,
    session: String,
    offset: usize,
    count: usize,
    chunk_index: usize,
    chunk_total: usize,
    timestamp: String,
    signature: String,
}

fn parse_chunk_meta(hit: &crate::gateway::QueryHit) -> Option<ChunkMeta> {
    let tags = &hit.tags;
    let client = tags.get("Client")?.clone();
    let session = tags.get("Session")?.clone();
    if session.is_empty() {
        return None;
    }
    let offset: usize = tags.get("Offset")?.parse().ok()?;
    let count: usize = tags.get("Count")?.parse().ok()?;
    let signature = tags.get("Signature").filter(|s| !s.is_empty())?.clone();
    let timestamp = tags.get("Timestamp")?.clone();

    let chunk = tags.get("Chunk")?;
    let (idx_str, total_str) = chunk.split_once('/')?;
    let chunk_index: usize = idx_str.parse().ok()?;
    let chunk_total: usize = total_str.parse().ok()?;
    if chunk_index < 1 || chunk_total < 1 || chunk_index > chunk_total {
        return None;
    }

    Some(ChunkMeta {
        tx_id: hit.tx_id.clone(),
        client,
        session,
        offset,
        count,
        chunk_index,
        chunk_total,
        timestamp,
        signature,
    })
}

struct Segment {
    client: String,
    session: String,
    offset: usize,
    count: usize,
    chunk_total: usize,
    chunks: BTreeMap<usize, String>,
    signature: String,
}

fn group_into_segments(metas: Vec<ChunkMeta>) -> Vec<Segment> {
    let mut groups: BTreeMap<(String, String, usize, usize, String), Segment> = BTreeMap::new();

    for m in metas {
        let key = (
            m.client.clone(),
            m.session.clone(),
            m.offset,
            m.count,
            m.timestamp.clone(),
        );
        let entry = groups.entry(key).or_insert_with(|| Segment {
            client: m.client.clone(),
            session: m.session.clone(),
            offset: m.offset,
            count: m.count,
            chunk_total: m.chunk_total,
            chunks: BTreeMap::new(),
            signature: m.signature.clone(),
        });
        entry.chunks.insert(m.chunk_index, m.tx_id);
    }

    groups
        .into_values()
        .filter(|s| {
            s.count == s.chunk_total
                && s.chunks.len() == s.chunk_total
                && (1..=s.chunk_total).all(|i| s.chunks.contains_key(&i))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulledSegment {
    pub session: String,
    pub offset: usize,
    pub messages: Vec<Message>,
}

/// Pull protocol: query conversation-chunk metadata for
/// the wallet, group into well-formed segments, download and
/// reassemble each, verify the replicated signature once over the
/// whole ciphertext, decrypt, then merge per-session by ascending
/// offset (earlier offset wins on overlap).
pub async fn pull_conversations(
    gateway: &SharedGateway,
    address: &str,
    aes_key: &[u8; crypto::KEY_LEN],
) -> anyhow::Result<Vec<PulledSegment>> {
    let mut filter = BTreeMap::new();
    filter.insert("App-Name".to_string(), crate::sync::APP_NAME.to_string());
    filter.insert("Wallet".to_string(), address.to_string());
    filter.insert("Type".to_string(), "conversation".to_string());

    let hits = gateway.query_by_tags(&filter).await?;
    let metas: Vec<ChunkMeta> = hits.iter().filter_map(parse_chunk_meta).collect();
    let segments = group_into_segments(metas);

    let mut reassembled: Vec<(Segment, Vec<Message>)> = Vec::new();

    for segment in segments {
        match reassemble_segment(gateway, address, aes_key, &segment).await {
            Ok(messages) => reassembled.push((segment, messages)),
            Err(reason) => {
                warn!(session = %segment.session, ?reason, "conversation pull: dropped malformed segment");
            }
        }
    }

    Ok(merge_segments(reassembled))
}

#[derive(Debug)]
enum SegmentError {
    TooLarge,
    SignatureInvalid,
    DecryptFailed,
    MalformedJson,
}

async fn reassemble_segment(
    gateway: &SharedGateway,
    address: &str,
    aes_key: &[u8; crypto::KEY_LEN],
    segment: &Segment,
) -> Result<Vec<Message>, SegmentError> {
    let mut ciphertext = Vec::new();
    for i in 1..=segment.chunk_total {
        let tx_id = &segment.chunks[&i];
        let bytes = gateway
            .download(tx_id, CHUNK_DOWNLOAD_CAP_BYTES)
            .await
            .map_err(|_| SegmentError::TooLarge)?;
        if bytes.len() > CHUNK_DOWNLOAD_CAP_BYTES {
            return Err(SegmentError::TooLarge);
        }
        ciphertext.extend_from_slice(&bytes);
    }

    if !crypto::verify(&ciphertext, &segment.signature, address) {
        return Err(SegmentError::SignatureInvalid);
    }

    let plaintext =
        crypto::decrypt(&ciphertext, aes_key).map_err(|_| SegmentError::DecryptFailed)?;
    let payload: SegmentPayload =
        serde_json::from_slice(&plaintext).map_err(|_| SegmentError::MalformedJson)?;

    Ok(payload.messages)
}

/// Merges reassembled segments per `(client, session)`, sorted by
/// offset ascending; a segment whose offset range overlaps an
/// already-merged range is dropped, keeping the earlier one.
fn merge_segments(reassembled: Vec<(Segment, Vec<Message>)>) -> Vec<PulledSegment> {
    let mut by_session: BTreeMap<(String, String), Vec<(Segment, Vec<Message>)>> = BTreeMap::new();
    for (segment, messages) in reassembled {
        by_session
            .entry((segment.client.clone(), segment.session.clone()))
            .or_default()
            .push((segment, messages));
    }

    let mut out = Vec::new();
    for ((_, session), mut group) in by_session {
        group.sort_by_key(|(s, _)| s.offset);

        let mut merged_messages = Vec::new();
        let mut next_offset = 0usize;
        let mut start_offset = None;
        for (segment, messages) in group {
            if segment.offset < next_offset {
                continue; // overlaps an already-merged, lower-offset segment
            }
            start_offset.get_or_insert(segment.offset);
            merged_messages.extend(messages);
            next_offset = segment.offset + segment.count;
        }

        out.push(PulledSegment {
            session,
            offset: start_offset.unwrap_or(0),
            messages: merged_messages,
        });
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gateway::{ArchiveGateway, QueryHit, Tags, UploadBackend, UploadReceipt};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn sample_conversation(n_messages: usize) -> Conversation {
        let now = chrono::Utc::now();
        Conversation {
            id: "sess-1".into(),
            client: Client::ClaudeCode,
            project: "sharme".into(),
            started_at: now,
            updated_at: now,
            messages: (0..n_messages)
                .map(|i| Message {
                    role: "user".into(),
                    content: format!("message {i}"),
                    extra: Default::default(),
                })
                .collect(),
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        uploaded: Mutex<Vec<(Vec<u8>, Tags)>>,
    }

    #[async_trait]
    impl UploadBackend for RecordingUploader {
        async fn upload(&self, bytes: Vec<u8>, tags: Tags) -> crate::error::Result<UploadReceipt> {
            self.uploaded.lock().unwrap().push((bytes, tags));
            Ok(UploadReceipt {
                tx_id: format!("tx-{}", self.uploaded.lock().unwrap().len()),
            })
        }
    }

    #[tokio::test]
    async fn no_new_messages_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db")).await.unwrap();
        let conversation = sample_conversation(0);
        let sk = SecretKey::from_slice(&[0x44; 32]).unwrap();
        let pk = crypto::public_key_from_private(&sk);
        let addr = crypto::address_from_public_key(&pk);
        let uploader: SharedUploader = Arc::new(RecordingUploader::default());

        let outcome = push_conversation(
            &store,
            &uploader,
            &sk,
            &addr,
            &[1u8; crypto::KEY_LEN],
            &conversation,
        )
        .await
        .unwrap();

        assert_eq!(outcome, ConversationPushOutcome::NoOp);
    }

    #[tokio::test]
    async fn pushes_tail_and_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("db")).await.unwrap();
        let conversation = sample_conversation(3);
        let sk = SecretKey::from_slice(&[0x44; 32]).unwrap();
        let pk = crypto::public_key_from_private(&sk);
        let addr = crypto::address_from_public_key(&pk);
        let uploader: SharedUploader = Arc::new(RecordingUploader::default());

        let outcome = push_conversation(
            &store,
            &uploader,
            &sk,
            &addr,
            &[1u8; crypto::KEY_LEN],
            &conversation,
        )
        .await
        .unwrap();

        match outcome {
            ConversationPushOutcome::Pushed { new_offset, .. } => assert_eq!(new_offset, 3),
            ConversationPushOutcome::NoOp => panic!("expected a push"),
        }

        let offset_key = meta::conversation_offset_key("claude-code", "sess-1");
        assert_eq!(store.get_meta(&offset_key).await.unwrap(), Some("3".to_string()));

        // A second push with no new messages is now a no-op.
        let second = push_conversation(
            &store,
            &uploader,
            &sk,
            &addr,
            &[1u8; crypto::KEY_LEN],
            &conversation,
        )
        .await
        .unwrap();
        assert_eq!(second, ConversationPushOutcome::NoOp);
    }

    struct FakeGateway {
        hits: Vec<QueryHit>,
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ArchiveGateway for FakeGateway {
        async fn query_by_tags(&self, _filter: &Tags) -> crate::error::Result<Vec<QueryHit>> {
            Ok(self.hits.clone())
        }
        async fn download(&self, tx_id: &str, max_bytes: usize) -> crate::error::Result<Vec<u8>> {
            let blobs = self.blobs.lock().unwrap();
            let bytes = blobs.get(tx_id).cloned().unwrap_or_default();
            if bytes.len() > max_bytes {
                return Err(crate::error::SharmeError::BlobTooLarge {
                    size: bytes.len(),
                    max: max_bytes,
                });
            }
            Ok(bytes)
        }
    }

    fn upload_segment(
        aes_key: &[u8; crypto::KEY_LEN],
        sk: &SecretKey,
        session: &str,
        offset: usize,
        messages: Vec<Message>,
        blobs: &mut HashMap<String, Vec<u8>>,
        hits: &mut Vec<QueryHit>,
        timestamp: &str,
    ) {
        let payload = SegmentPayload {
            conversation_id: session.to_string(),
            client: Client::ClaudeCode,
            project: "sharme".into(),
            started_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            offset,
            count: messages.len(),
            messages,
        };
        let plaintext = serde_json::to_vec(&payload).unwrap();
        let ciphertext = crypto::encrypt(&plaintext, aes_key).unwrap();
        let signature = crypto::sign(&ciphertext, sk).unwrap();

        let chunks = shard::chunk_bytes(&ciphertext, 16);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            let tx_id = format!("{session}-{offset}-{i}");
            blobs.insert(tx_id.clone(), chunk.to_vec());

            let mut tags = BTreeMap::new();
            tags.insert("Client".to_string(), "claude-code".to_string());
            tags.insert("Session".to_string(), session.to_string());
            tags.insert("Offset".to_string(), offset.to_string());
            tags.insert("Count".to_string(), payload.count.to_string());
            tags.insert("Chunk".to_string(), format!("{}/{}", i + 1, total));
            tags.insert("Timestamp".to_string(), timestamp.to_string());
            tags.insert("Signature".to_string(), signature.clone());

            hits.push(QueryHit {
                tx_id,
                block_height: offset as u64,
                tags,
            });
        }
    }

    #[tokio::test]
    async fn reassembles_and_merges_two_segments() {
        let key = [3u8; crypto::KEY_LEN];
        let sk = SecretKey::from_slice(&[0x55; 32]).unwrap();
        let pk = crypto::public_key_from_private(&sk);
        let address = crypto::address_from_public_key(&pk);

        let mut blobs = HashMap::new();
        let mut hits = Vec::new();

        upload_segment(
            &key,
            &sk,
            "sess-1",
            0,
            vec![Message {
                role: "user".into(),
                content: "hello".into(),
                extra: Default::default(),
            }],
            &mut blobs,
            &mut hits,
            "1000",
        );
        upload_segment(
            &key,
            &sk,
            "sess-1",
            1,
            vec![Message {
                role: "assistant".into(),
                content: "hi there".into(),
                extra: Default::default(),
            }],
            &mut blobs,
            &mut hits,
            "1001",
        );

        let gateway: SharedGateway = Arc::new(FakeGateway {
            hits,
            blobs: Mutex::new(blobs),
        });

        let segments = pull_conversations(&gateway, &address, &key).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].messages.len(), 2);
        assert_eq!(segments[0].messages[0].content, "hello");
        assert_eq!(segments[0].messages[1].content, "hi there");
    }

    #[tokio::test]
    async fn incomplete_chunk_set_is_dropped() {
        let key = [3u8; crypto::KEY_LEN];
        let sk = SecretKey::from_slice(&[0x55; 32]).unwrap();
        let pk = crypto::public_key_from_private(&sk);
        let address = crypto::address_from_public_key(&pk);

        let mut blobs = HashMap::new();
        let mut hits = Vec::new();
        upload_segment(
            &key,
            &sk,
            "sess-2",
            0,
            vec![Message {
                role: "user".into(),
                content: "x".repeat(100),
                extra: Default::default(),
            }],
            &mut blobs,
            &mut hits,
            "1000",
        );
        hits.pop(); // drop the last chunk, breaking the 1..=total coverage

        let gateway: SharedGateway = Arc::new(FakeGateway {
            hits,
            blobs: Mutex::new(blobs),
        });

        let segments = pull_conversations(&gateway, &address, &key).await.unwrap();
        assert!(segments.is_empty());
    }
}
