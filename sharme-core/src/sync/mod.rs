//! The sync engine: push (dirty → shards → upload) and pull+reconstruct
//! (query → verify → decrypt → apply).
//!
//! `SyncEngine` borrows the local store and the backend for the
//! duration of one operation and owns no background-task state of its
//! own beyond what [`crate::scheduler`] drives it with.

mod pull;
mod push;

pub use pull::{PullOutcome, SkippedShard};
pub use push::PushOutcome;

use crate::gateway::{SharedGateway, SharedUploader};
use crate::store::LocalStore;
use secp256k1::SecretKey;

pub const APP_NAME: &str = "sharme";

/// Everything the push/pull pipelines need: the local store, the
/// archive gateway and uploader, and the identity used to sign and
/// decrypt.
pub struct SyncEngine {
    pub store: LocalStore,
    pub gateway: SharedGateway,
    pub uploader: SharedUploader,
    pub privkey: SecretKey,
    pub address: String,
    pub aes_key: [u8; crate::crypto::KEY_LEN],
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        gateway: SharedGateway,
        uploader: SharedUploader,
        privkey: SecretKey,
        address: String,
        aes_key: [u8; crate::crypto::KEY_LEN],
    ) -> Self {
        Self {
            store,
            gateway,
            uploader,
            privkey,
            address,
            aes_key,
        }
    }

    /// Runs one push tick. See [`push::push_once`].
    pub async fn push(&self) -> anyhow::Result<PushOutcome> {
        push::push_once(self).await
    }

    /// Runs pull + reconstruct. See [`pull::pull_reconstruct`].
    pub async fn pull(&self) -> anyhow::Result<PullOutcome> {
        pull::pull_reconstruct(self).await
    }
}
