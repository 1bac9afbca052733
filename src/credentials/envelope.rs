//! Authenticated-encryption envelope for the file credential provider.
//!
//! Layout on disk: 12-byte random nonce followed by the AES-256-GCM
//! ciphertext (tag included). The same key decrypts what it encrypted, so a
//! credential file can be sealed by an operator tool and opened here.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};

use crate::error::{ProxyError, ProxyResult};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` under `key`, prepending the random nonce.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> ProxyResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| ProxyError::Config("credential file encryption failed".to_owned()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an envelope produced by `seal`. Fails on truncated input, a wrong
/// key, or any bit flip in nonce or ciphertext.
pub fn open(key: &[u8; KEY_LEN], data: &[u8]) -> ProxyResult<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(ProxyError::Config(
            "credential file too short for encryption envelope".to_owned(),
        ));
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| ProxyError::Config("credential file decryption failed".to_owned()))
}
