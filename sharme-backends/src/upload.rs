//! Signed upload submission.
//!
//! A shared `reqwest::Client`, a bundler endpoint reachable over plain
//! HTTP POST, status-code-range success check. The bundler signs the
//! data item with its own wallet key, distinct from the
//! application-level signature already present in the caller's tags.

use async_trait::async_trait;
use serde::Serialize;
use sharme_core::error::{Result, SharmeError};
use sharme_core::gateway::{Tags, UploadBackend, UploadReceipt};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("bundler rejected the upload: status {status}, body {body}")]
    Rejected { status: u16, body: String },
    #[error("bundler response was missing a transaction id")]
    MissingTxId,
}

impl From<UploadError> for SharmeError {
    fn from(e: UploadError) -> Self {
        SharmeError::NetworkUnavailable(e.to_string())
    }
}

/// Which bundler network to submit against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

/// Submits bytes+tags to an Arweave-shaped bundler over HTTP. The
/// bundler signs the underlying data item with its own wallet key;
/// the application-level `Signature` tag the caller already attached
/// is carried through untouched.
pub struct ArweaveUploader {
    endpoint: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl ArweaveUploader {
    pub fn new(network: Network, auth_token: Option<String>) -> Self {
        let endpoint = match network {
            Network::Mainnet => "https://node1.bundlr.network/tx".to_string(),
            Network::Testnet => "https://devnet.bundlr.network/tx".to_string(),
        };

        Self {
            endpoint,
            auth_token,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_endpoint(endpoint: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct BundlerTag {
    name: String,
    value: String,
}

#[derive(Serialize)]
struct BundlerRequest {
    data: String,
    tags: Vec<BundlerTag>,
}

#[derive(serde::Deserialize)]
struct BundlerResponse {
    id: String,
}

#[async_trait]
impl UploadBackend for ArweaveUploader {
    async fn upload(&self, bytes: Vec<u8>, tags: Tags) -> Result<UploadReceipt> {
        use base64::Engine;

        let body = BundlerRequest {
            data: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&bytes),
            tags: tags
                .into_iter()
                .map(|(name, value)| BundlerTag { name, value })
                .collect(),
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "bundler rejected upload");
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let parsed: BundlerResponse = resp
            .json()
            .await
            .map_err(|_| UploadError::MissingTxId)?;

        if parsed.id.is_empty() {
            return Err(UploadError::MissingTxId.into());
        }

        Ok(UploadReceipt { tx_id: parsed.id })
    }
}
