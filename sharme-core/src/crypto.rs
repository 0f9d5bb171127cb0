//! Crypto primitives: Argon2id KDF, AES-256-GCM AEAD, secp256k1
//! sign/verify and wallet-address derivation.
//!
//! A KDF function wrapping `argon2`, and AEAD built on `ring` with the
//! envelope pinned to AES-256-GCM: `nonce ∥ ciphertext ∥ tag`. Signing
//! and address derivation build on `secp256k1`/`sha2`/`bs58`.

use ring::aead::{self, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Fixed, documented Argon2id parameters. Pinned so that key
/// derivation is reproducible across every device that holds the same
/// phrase and salt.
const ARGON2_MEM_COST_KIB: u32 = 19 * 1024;
const ARGON2_TIME_COST: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;

pub const SALT_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("signing failed: {0}")]
    Sign(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Generates a fresh random 16-byte salt from a CSPRNG.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).expect("system RNG failure");
    salt
}

/// Generates a fresh random 32-byte share key, independent of any
/// phrase-derived key, since the link itself is the capability.
pub fn generate_share_key() -> [u8; KEY_LEN] {
    let rng = SystemRandom::new();
    let mut key = [0u8; KEY_LEN];
    rng.fill(&mut key).expect("system RNG failure");
    key
}

/// `derive_key(phrase, salt) -> 32 bytes` via Argon2id.
/// Deterministic given identical inputs.
pub fn derive_key(phrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let config = argon2::Config {
        variant: argon2::Variant::Argon2id,
        version: argon2::Version::Version13,
        mem_cost: ARGON2_MEM_COST_KIB,
        time_cost: ARGON2_TIME_COST,
        lanes: ARGON2_PARALLELISM,
        thread_mode: argon2::ThreadMode::Sequential,
        secret: &[],
        ad: &[],
        hash_length: KEY_LEN as u32,
    };

    let mut raw = argon2::hash_raw(phrase.as_bytes(), salt, &config)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;

    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&raw);
    raw.zeroize();
    Ok(out)
}

struct SingleNonce(Option<Nonce>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0.take().ok_or(ring::error::Unspecified)
    }
}

/// `encrypt(plaintext, key) -> nonce(12) || ciphertext || tag(16)`
/// using AES-256-GCM with a fresh random nonce per call.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Encrypt)?;

    let unbound =
        UnboundKey::new(&aead::AES_256_GCM, key).map_err(|_| CryptoError::Encrypt)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);
    let mut sealing = SealingKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Inverse of [`encrypt`]. Fails if nonce/tag/length are invalid or
/// the key doesn't match.
pub fn decrypt(envelope: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    if envelope.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::MalformedEnvelope(format!(
            "envelope too short: {} bytes",
            envelope.len()
        )));
    }

    let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
    let mut nonce_arr = [0u8; NONCE_LEN];
    nonce_arr.copy_from_slice(nonce_bytes);

    let unbound =
        UnboundKey::new(&aead::AES_256_GCM, key).map_err(|_| CryptoError::Decrypt)?;
    let nonce = Nonce::assume_unique_for_key(nonce_arr);
    let mut opening = OpeningKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening
        .open_in_place(aead::Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Decrypt)?;

    Ok(plaintext.to_vec())
}

/// secp256k1 over the SHA-256 of the given bytes.
/// `sign(bytes, privkey) -> compact hex signature`.
pub fn sign(bytes: &[u8], privkey: &SecretKey) -> Result<String> {
    let digest = Sha256::digest(bytes);
    let msg = Message::from_digest_slice(&digest).map_err(|e| CryptoError::Sign(e.to_string()))?;
    let (recovery_id, sig) = SECP256K1
        .sign_ecdsa_recoverable(&msg, privkey)
        .serialize_compact();

    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&sig);
    out.push(recovery_id_to_byte(recovery_id));
    Ok(hex::encode(out))
}

fn recovery_id_to_byte(id: RecoveryId) -> u8 {
    i32::from(id) as u8
}

/// `verify(bytes, signature, address) -> bool`: recovers the public
/// key from the signature + digest, derives the address, and compares.
pub fn verify(bytes: &[u8], signature_hex: &str, address: &str) -> bool {
    match recover_address(bytes, signature_hex) {
        Ok(recovered) => recovered.eq_ignore_ascii_case(address),
        Err(_) => false,
    }
}

/// Recovers the wallet address that produced `signature_hex` over
/// `bytes`, without needing the claimed address up front. Used by the
/// archive adapter when the tagged `Wallet` is the value under test.
pub fn recover_address(bytes: &[u8], signature_hex: &str) -> Result<String> {
    let raw = hex::decode(signature_hex).map_err(|e| CryptoError::Sign(e.to_string()))?;
    if raw.len() != 65 {
        return Err(CryptoError::Sign(format!(
            "expected 65-byte compact signature, got {}",
            raw.len()
        )));
    }

    let (sig_bytes, recovery_byte) = raw.split_at(64);
    let recovery_id = RecoveryId::from_i32(recovery_byte[0] as i32)
        .map_err(|e| CryptoError::Sign(e.to_string()))?;
    let recoverable = RecoverableSignature::from_compact(sig_bytes, recovery_id)
        .map_err(|e| CryptoError::Sign(e.to_string()))?;

    let digest = Sha256::digest(bytes);
    let msg = Message::from_digest_slice(&digest).map_err(|e| CryptoError::Sign(e.to_string()))?;

    let pubkey = SECP256K1
        .recover_ecdsa(&msg, &recoverable)
        .map_err(|e| CryptoError::Sign(e.to_string()))?;

    Ok(address_from_public_key(&pubkey))
}

/// `address = base58(sha256(pubkey_uncompressed[1..]))`, matching the
/// archive's canonical wallet-address form.
pub fn address_from_public_key(pubkey: &PublicKey) -> String {
    let uncompressed = pubkey.serialize_uncompressed();
    let digest = Sha256::digest(&uncompressed[1..]);
    bs58::encode(digest).into_string()
}

pub fn public_key_from_private(privkey: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(SECP256K1, privkey)
}
