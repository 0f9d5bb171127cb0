//! Share channel: one-shot encrypted conversation links.
//!
//! A share payload is encrypted under a fresh, random `share_key`
//! rather than the holder's phrase-derived key — the link itself is
//! the capability, with no further authorization needed to read it.
//! Issuance still signs under the identity private key so a third
//! party can optionally corroborate the wallet; redemption does not
//! require it.

use crate::conversation::Conversation;
use crate::crypto::{self, KEY_LEN};
use crate::error::{Result, SharmeError};
use crate::gateway::{ArchiveGateway, SharedGateway, SharedUploader, UploadBackend};
use crate::store::{LocalStore, SharedConversationImport};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Direct-download cap for a resolved share transaction: generous
/// relative to a single conversation's typical size.
pub const SHARE_DOWNLOAD_CAP_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SharePayload {
    v: u8,
    created_at: chrono::DateTime<chrono::Utc>,
    conversation: Conversation,
}

/// The redeemable token: `base64url(JSON{v, sid, k, t?})`. `k` is
/// itself base64url so the token round-trips through plain JSON
/// without binary fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct TokenBody {
    v: u8,
    sid: String,
    k: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedShare {
    pub share_id: String,
    pub token: String,
    pub url: String,
}

/// Issues a one-shot share link for `conversation`. Generates a fresh
/// `share_id`/`share_key`, encrypts and signs the payload, uploads it,
/// and returns the `sharme://share/...` URL.
pub async fn issue_share(
    uploader: &SharedUploader,
    privkey: &SecretKey,
    address: &str,
    conversation: &Conversation,
) -> Result<IssuedShare> {
    let share_id = uuid::Uuid::new_v4().to_string();
    let share_key = crypto::generate_share_key();

    let payload = SharePayload {
        v: 1,
        created_at: chrono::Utc::now(),
        conversation: conversation.clone(),
    };
    let plaintext =
        serde_json::to_vec(&payload).map_err(|e| SharmeError::InvalidToken(e.to_string()))?;
    let ciphertext = crypto::encrypt(&plaintext, &share_key).map_err(|_| SharmeError::DecryptFailed)?;
    let signature = crypto::sign(&ciphertext, privkey).map_err(|_| SharmeError::SignatureInvalid)?;

    let mut tags = BTreeMap::new();
    tags.insert("App-Name".to_string(), crate::sync::APP_NAME.to_string());
    tags.insert("Type".to_string(), "conversation-share".to_string());
    tags.insert("Share-Id".to_string(), share_id.clone());
    tags.insert("Wallet".to_string(), address.to_string());
    tags.insert(
        "Timestamp".to_string(),
        chrono::Utc::now().timestamp().to_string(),
    );
    tags.insert("Signature".to_string(), signature);
    tags.insert(
        "Content-Type".to_string(),
        "application/octet-stream".to_string(),
    );

    let receipt = uploader
        .upload(ciphertext, tags)
        .await
        .map_err(|e| SharmeError::GatewayError(e.to_string()))?;

    let body = TokenBody {
        v: 1,
        sid: share_id.clone(),
        k: URL_SAFE_NO_PAD.encode(share_key),
        t: Some(receipt.tx_id),
    };
    let token_json =
        serde_json::to_vec(&body).map_err(|e| SharmeError::InvalidToken(e.to_string()))?;
    let token = URL_SAFE_NO_PAD.encode(token_json);
    let url = format!("sharme://share/{token}");

    Ok(IssuedShare {
        share_id,
        token,
        url,
    })
}

/// Extracts the token from a `sharme://share/<token>` URL, or from a
/// bare `token=` query parameter — callers may hand either form.
pub fn extract_token(input: &str) -> Result<&str> {
    if let Some(idx) = input.find("token=") {
        let rest = &input[idx + "token=".len()..];
        let end = rest.find('&').unwrap_or(rest.len());
        return Ok(&rest[..end]);
    }
    if let Some(tail) = input.rsplit('/').next() {
        if !tail.is_empty() {
            return Ok(tail);
        }
    }
    Err(SharmeError::InvalidToken("could not locate a token".into()))
}

fn decode_token(token: &str) -> Result<TokenBody> {
    let json = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| SharmeError::InvalidToken(e.to_string()))?;
    let body: TokenBody =
        serde_json::from_slice(&json).map_err(|e| SharmeError::InvalidToken(e.to_string()))?;

    if body.v != 1 {
        return Err(SharmeError::InvalidToken(format!(
            "unsupported token version {}",
            body.v
        )));
    }
    if body.sid.is_empty() {
        return Err(SharmeError::InvalidToken("empty share id".into()));
    }
    let key_bytes = URL_SAFE_NO_PAD
        .decode(&body.k)
        .map_err(|e| SharmeError::InvalidToken(e.to_string()))?;
    if key_bytes.len() != KEY_LEN {
        return Err(SharmeError::InvalidToken(format!(
            "share key must be {KEY_LEN} bytes, got {}",
            key_bytes.len()
        )));
    }

    Ok(body)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedeemedShare {
    pub share_id: String,
    pub conversation: Conversation,
}

/// Redemption is a single-object critical path, so every failure is
/// loud (a typed error), never a silent drop the way a batch pull
/// skips a bad shard.
pub async fn redeem_share(
    store: &LocalStore,
    gateway: &SharedGateway,
    input: &str,
) -> Result<RedeemedShare> {
    let token = extract_token(input)?;
    let body = decode_token(token)?;

    // A second redemption of the same share id is a no-op, not a
    // repeat of the happy path — check before doing any network or
    // decryption work.
    if store.has_shared_conversation_import(&body.sid).await? {
        return Err(SharmeError::DuplicateImport);
    }

    let share_key_bytes = URL_SAFE_NO_PAD
        .decode(&body.k)
        .map_err(|e| SharmeError::InvalidToken(e.to_string()))?;
    let mut share_key = [0u8; KEY_LEN];
    share_key.copy_from_slice(&share_key_bytes);

    // `resolve_share_bytes` already verified the signature against the
    // tagged wallet when the fallback query path returned one; the
    // direct-download path has no signature to check, by design.
    let (ciphertext, _verified_wallet) = resolve_share_bytes(gateway, &body).await?;

    let plaintext =
        crypto::decrypt(&ciphertext, &share_key).map_err(|_| SharmeError::DecryptFailed)?;
    let payload: SharePayload =
        serde_json::from_slice(&plaintext).map_err(|e| SharmeError::InvalidToken(e.to_string()))?;
    if payload.v != 1 {
        return Err(SharmeError::InvalidToken(
            "unsupported share payload version".into(),
        ));
    }

    store
        .save_shared_conversation_import(&SharedConversationImport {
            share_id: body.sid.clone(),
            conversation_id: payload.conversation.id.clone(),
            imported_at: chrono::Utc::now(),
        })
        .await?;

    Ok(RedeemedShare {
        share_id: body.sid,
        conversation: payload.conversation,
    })
}

/// Step 3/4: try the embedded transaction id first (capped at 2 MiB);
/// on failure, fall back to a `Share-Id` query. If the fallback query
/// returns tagged signature/wallet, the caller should verify before
/// trusting the bytes — [`redeem_share`] checks that when present.
async fn resolve_share_bytes(
    gateway: &SharedGateway,
    body: &TokenBody,
) -> Result<(Vec<u8>, Option<(String, String)>)> {
    if let Some(tx_id) = &body.t {
        if let Ok(bytes) = gateway.download(tx_id, SHARE_DOWNLOAD_CAP_BYTES).await {
            if bytes.len() <= SHARE_DOWNLOAD_CAP_BYTES {
                return Ok((bytes, None));
            }
        }
    }

    let mut filter = BTreeMap::new();
    filter.insert("Type".to_string(), "conversation-share".to_string());
    filter.insert("Share-Id".to_string(), body.sid.clone());

    let mut hits = gateway
        .query_by_tags(&filter)
        .await
        .map_err(|e| SharmeError::GatewayError(e.to_string()))?;
    hits.sort_by(|a, b| b.block_height.cmp(&a.block_height));

    let hit = hits
        .into_iter()
        .next()
        .ok_or_else(|| SharmeError::GatewayError("no share found for id".into()))?;

    let bytes = gateway
        .download(&hit.tx_id, SHARE_DOWNLOAD_CAP_BYTES)
        .await
        .map_err(|e| SharmeError::GatewayError(e.to_string()))?;
    if bytes.len() > SHARE_DOWNLOAD_CAP_BYTES {
        return Err(SharmeError::BlobTooLarge {
            size: bytes.len(),
            max: SHARE_DOWNLOAD_CAP_BYTES,
        });
    }

    let wallet = hit.tags.get("Wallet").cloned();
    let signature = hit.tags.get("Signature").cloned();
    let verified = match (wallet, signature) {
        (Some(w), Some(s)) if crypto::verify(&bytes, &s, &w) => Some((w, s)),
        (Some(_), Some(_)) => return Err(SharmeError::SignatureInvalid),
        _ => None,
    };

    Ok((bytes, verified))
}
