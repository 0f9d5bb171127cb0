//! Opaque identifiers handed out locally before a shard or share is
//! ever uploaded: random bytes with a hex `Display`/`TryFrom<&str>`.

use ring::rand::{SecureRandom, SystemRandom};
use std::{convert::TryFrom, fmt};

const SHARD_ID_BYTES: usize = 16;

/// Locally generated id for a shard, assigned before upload and carried
/// inside the shard's plaintext payload (`shard_id`). Distinct from the
/// archive transaction id the upload backend returns.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ShardId([u8; SHARD_ID_BYTES]);

impl ShardId {
    pub fn new() -> Self {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; SHARD_ID_BYTES];
        rng.fill(&mut bytes).expect("system RNG failure");
        Self(bytes)
    }
}

impl Default for ShardId {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<[u8]> for ShardId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&str> for ShardId {
    type Error = hex::FromHexError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let bytes = hex::decode(value)?;
        let mut out = [0u8; SHARD_ID_BYTES];
        if bytes.len() != SHARD_ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self)
    }
}
