//! AEAD encryption for the credential store's on-disk artifact.
//!
//! Mirrors the positioned-nonce AES-256-GCM pattern used elsewhere in this
//! codebase, but here there is exactly one ciphertext per file rather than
//! one per chunk, so a single random 96-bit nonce suffices.

use crate::common::error::{Result, TransferError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Derives a 256-bit key from a passphrase and salt via PBKDF2-HMAC-SHA256.
///
/// Falls back to a plain SHA-256 digest of the passphrase only if called
/// with a zero-length salt, which the store never persists — every real
/// artifact carries a random salt generated on first write.
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        let mut hasher = Sha256::new();
        hasher.update(passphrase);
        return hasher.finalize().into();
    }
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn encrypt(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| TransferError::Integrity {
            expected: "encryptable plaintext".into(),
            actual: "AEAD encryption failure".into(),
        })
}

pub fn decrypt(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TransferError::Integrity {
            expected: "valid AEAD tag".into(),
            actual: "decryption failed".into(),
        })
}
