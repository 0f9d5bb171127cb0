//! Identity: 12-word BIP39 recovery phrase, deterministic keypair
//! derivation, wallet address.
//!
//! Phrase handling follows the usual BIP39 + Argon2id pattern for
//! deriving a key from a mnemonic; `derive_keypair` stays a single
//! pure function from secret material to a typed key.

use crate::crypto::{self, address_from_public_key, public_key_from_private, SALT_LEN};
use crate::error::{SharmeError, Result};
use crate::gateway::ArchiveGateway;
use crate::sync::APP_NAME;
use bip39::{Language, Mnemonic};
use secp256k1::{PublicKey, SecretKey};
use std::collections::BTreeMap;

/// Identity records are small; 16 KiB is generous headroom over a
/// 32-byte encrypted scalar.
const IDENTITY_DOWNLOAD_CAP_BYTES: usize = 16 * 1024;

/// A derived identity: private key, public key, and wallet address.
/// Never serialized as a whole; callers persist the encrypted private
/// key separately (see `IdentityFile`).
pub struct Keypair {
    pub privkey: SecretKey,
    pub pubkey: PublicKey,
    pub address: String,
}

/// Generates a new 12-word (128-bit entropy) English BIP39 phrase.
pub fn generate_phrase() -> String {
    let mut entropy = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut entropy);
    Mnemonic::from_entropy_in(Language::English, &entropy)
        .expect("16 bytes of entropy always yields a valid 12-word mnemonic")
        .to_string()
}

/// Validates a 12-word phrase: English wordlist, correct length,
/// checksum. Returns the normalized (NFKD, single-space, lowercase)
/// phrase text used for derivation.
pub fn validate_phrase(phrase: &str) -> Result<String> {
    let normalized = normalize_phrase(phrase);

    let words: Vec<&str> = normalized.split(' ').collect();
    if words.len() != 12 {
        return Err(SharmeError::InvalidPhrase(format!(
            "expected 12 words, got {}",
            words.len()
        )));
    }

    Mnemonic::parse_in(Language::English, &normalized)
        .map_err(|e| SharmeError::InvalidPhrase(e.to_string()))?;

    Ok(normalized)
}

fn normalize_phrase(phrase: &str) -> String {
    use unicode_normalization::UnicodeNormalization;

    phrase
        .nfkd()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Pure function of the normalized phrase text: derives the keypair
/// deterministically via the phrase-derived AES key as seed material
/// for a secp256k1 secret key. The phrase's Argon2id-derived key
/// doubles as the raw secp256k1 scalar; this keeps one KDF call
/// serving both the envelope key and the identity key rather than
/// re-running the KDF per purpose.
pub fn derive_keypair(phrase: &str) -> Result<Keypair> {
    let normalized = validate_phrase(phrase)?;
    let salt = identity_salt();
    let key = crypto::derive_key(&normalized, &salt)
        .map_err(|e| SharmeError::InvalidPhrase(e.to_string()))?;

    let privkey = SecretKey::from_slice(&key)
        .map_err(|e| SharmeError::InvalidPhrase(format!("invalid scalar: {e}")))?;
    let pubkey = public_key_from_private(&privkey);
    let address = address_from_public_key(&pubkey);

    Ok(Keypair {
        privkey,
        pubkey,
        address,
    })
}

/// Fixed context salt for deriving the *identity* scalar from the
/// phrase, distinct from the per-device random `salt` file used to
/// derive the AES envelope key. Using a fixed salt here (rather than
/// the random one) is what makes `derive_keypair` a pure function of
/// the phrase alone.
fn identity_salt() -> [u8; SALT_LEN] {
    *b"sharme-identity-"
}

/// What comes back from the archive for a wallet's `identity`-typed
/// shard: the per-device salt and the phrase-derived private key,
/// still encrypted under the phrase-derived AES key.
pub struct IdentityRecord {
    pub salt: [u8; SALT_LEN],
    pub encrypted_private_key: Vec<u8>,
}

/// On-disk sidecar for `identity.enc`: the salt travels alongside the
/// encrypted key so a fresh device can derive the same AES key
/// without re-deriving it from the archive.
pub struct IdentityFile {
    pub salt: [u8; SALT_LEN],
    pub envelope: Vec<u8>,
}

impl IdentityFile {
    pub fn seal(phrase: &str, salt: [u8; SALT_LEN], privkey: &SecretKey) -> Result<Self> {
        let key = crypto::derive_key(phrase, &salt)
            .map_err(|e| SharmeError::InvalidPhrase(e.to_string()))?;
        let envelope = crypto::encrypt(&privkey.secret_bytes(), &key)
            .map_err(|_| SharmeError::DecryptFailed)?;
        Ok(Self { salt, envelope })
    }

    pub fn open(&self, phrase: &str) -> Result<Keypair> {
        let key = crypto::derive_key(phrase, &self.salt)
            .map_err(|e| SharmeError::InvalidPhrase(e.to_string()))?;
        let raw = crypto::decrypt(&self.envelope, &key).map_err(|_| SharmeError::DecryptFailed)?;
        let privkey =
            SecretKey::from_slice(&raw).map_err(|_| SharmeError::StoreCorruption("bad identity scalar".into()))?;
        let pubkey = public_key_from_private(&privkey);
        let address = address_from_public_key(&pubkey);
        Ok(Keypair { privkey, pubkey, address })
    }
}

/// `fetchIdentity(address) -> {salt, encryptedPrivateKey}`. Selects
/// the newest `identity`-typed shard for `address`, tie-broken by
/// transaction id descending. A single-object critical path: failures
/// here are loud, not silently dropped the way a batch pull skips a
/// bad shard. Returns `Ok(None)` only when no identity shard carries a
/// `Salt` tag — never guess one.
pub async fn fetch_identity(
    gateway: &dyn ArchiveGateway,
    address: &str,
) -> Result<Option<IdentityRecord>> {
    let mut filter = BTreeMap::new();
    filter.insert("App-Name".to_string(), APP_NAME.to_string());
    filter.insert("Wallet".to_string(), address.to_string());
    filter.insert("Type".to_string(), "identity".to_string());

    let hits = gateway
        .query_by_tags(&filter)
        .await
        .map_err(|e| SharmeError::GatewayError(e.to_string()))?;

    let newest = match hits.into_iter().max_by(|a, b| {
        a.block_height
            .cmp(&b.block_height)
            .then_with(|| a.tx_id.cmp(&b.tx_id))
    }) {
        Some(hit) => hit,
        None => return Ok(None),
    };

    let salt_hex = match newest.tags.get("Salt") {
        Some(s) => s,
        None => return Ok(None),
    };
    let salt_bytes = hex::decode(salt_hex).map_err(|e| SharmeError::GatewayError(e.to_string()))?;
    if salt_bytes.len() != SALT_LEN {
        return Err(SharmeError::GatewayError(format!(
            "identity salt has wrong length: {}",
            salt_bytes.len()
        )));
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&salt_bytes);

    let encrypted_private_key = gateway
        .download(&newest.tx_id, IDENTITY_DOWNLOAD_CAP_BYTES)
        .await
        .map_err(|e| SharmeError::GatewayError(e.to_string()))?;

    Ok(Some(IdentityRecord {
        salt,
        encrypted_private_key,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_phrase_has_twelve_words() {
        let phrase = generate_phrase();
        assert_eq!(phrase.split_whitespace().count(), 12);
        assert!(validate_phrase(&phrase).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(validate_phrase("only two words").is_err());
    }

    #[test]
    fn rejects_unknown_words() {
        let bad = "zzznotaword ".repeat(12);
        assert!(validate_phrase(bad.trim()).is_err());
    }

    #[test]
    fn rejects_bad_checksum() {
        // 12 valid words, but not a valid BIP39 sentence (checksum mismatch).
        let bad = "abandon abandon abandon abandon abandon abandon \
                    abandon abandon abandon abandon abandon abandon";
        assert!(validate_phrase(bad).is_err());
    }

    #[test]
    fn derive_keypair_is_deterministic() {
        let phrase = generate_phrase();
        let a = derive_keypair(&phrase).unwrap();
        let b = derive_keypair(&phrase).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.privkey, b.privkey);
    }

    #[test]
    fn normalizes_case_and_spacing() {
        let phrase = generate_phrase();
        let shouty = phrase.to_uppercase();
        let padded = format!("  {}  ", shouty.replace(' ', "   "));
        let a = derive_keypair(&phrase).unwrap();
        let b = derive_keypair(&padded).unwrap();
        assert_eq!(a.address, b.address);
    }

    #[test]
    fn identity_file_roundtrips() {
        let phrase = generate_phrase();
        let kp = derive_keypair(&phrase).unwrap();
        let salt = crypto::generate_salt();

        let file = IdentityFile::seal(&phrase, salt, &kp.privkey).unwrap();
        let reopened = file.open(&phrase).unwrap();
        assert_eq!(reopened.privkey, kp.privkey);
        assert_eq!(reopened.address, kp.address);
    }

    #[test]
    fn identity_file_rejects_wrong_phrase() {
        let phrase = generate_phrase();
        let other_phrase = generate_phrase();
        let kp = derive_keypair(&phrase).unwrap();
        let salt = crypto::generate_salt();

        let file = IdentityFile::seal(&phrase, salt, &kp.privkey).unwrap();
        assert!(file.open(&other_phrase).is_err());
    }

    mod fetch {
        use super::super::*;
        use crate::gateway::{QueryHit, Tags};
        use async_trait::async_trait;
        use std::collections::HashMap;
        use std::sync::Mutex;

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
                    return Err(SharmeError::BlobTooLarge {
                        size: bytes.len(),
                        max: max_bytes,
                    });
                }
                Ok(bytes)
            }
        }

        fn hit(tx_id: &str, block_height: u64, salt_hex: Option<&str>) -> QueryHit {
            let mut tags = BTreeMap::new();
            tags.insert("App-Name".to_string(), "sharme".to_string());
            tags.insert("Type".to_string(), "identity".to_string());
            if let Some(s) = salt_hex {
                tags.insert("Salt".to_string(), s.to_string());
            }
            QueryHit {
                tx_id: tx_id.to_string(),
                block_height,
                tags,
            }
        }

        #[tokio::test]
        async fn picks_newest_by_block_height() {
            let mut blobs = HashMap::new();
            blobs.insert("tx-old".to_string(), vec![1, 2, 3]);
            blobs.insert("tx-new".to_string(), vec![4, 5, 6]);

            let salt_hex = hex::encode([0u8; SALT_LEN]);
            let gateway = FakeGateway {
                hits: vec![hit("tx-old", 1, Some(&salt_hex)), hit("tx-new", 2, Some(&salt_hex))],
                blobs: Mutex::new(blobs),
            };

            let record = fetch_identity(&gateway, "addr").await.unwrap().unwrap();
            assert_eq!(record.encrypted_private_key, vec![4, 5, 6]);
        }

        #[tokio::test]
        async fn missing_salt_returns_none_without_guessing() {
            let gateway = FakeGateway {
                hits: vec![hit("tx-a", 1, None)],
                blobs: Mutex::new(HashMap::new()),
            };
            assert_eq!(fetch_identity(&gateway, "addr").await.unwrap().is_none(), true);
        }

        #[tokio::test]
        async fn no_hits_returns_none() {
            let gateway = FakeGateway {
                hits: vec![],
                blobs: Mutex::new(HashMap::new()),
            };
            assert!(fetch_identity(&gateway, "addr").await.unwrap().is_none());
        }
    }
}
