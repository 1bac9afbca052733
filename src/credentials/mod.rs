//! SCRAM credential store.
//!
//! The store keeps per-user SCRAM verifiers, never plaintext passwords:
//! verifier fields are computed once at insert time and the password is
//! dropped. Lookups are lock-free; a provider reload swaps the whole map
//! atomically.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::auth::scram;

pub mod envelope;
pub mod provider;

pub const DEFAULT_ITERATIONS: u32 = 4096;
pub const SALT_LEN: usize = 16;

/// SCRAM-SHA-256 verifier for one user, as defined in RFC 5802:
///
/// ```text
/// SaltedPassword := Hi(Normalize(password), salt, i)
/// StoredKey      := H(HMAC(SaltedPassword, "Client Key"))
/// ServerKey      := HMAC(SaltedPassword, "Server Key")
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub username: String,
    pub salt: [u8; SALT_LEN],
    pub iterations: u32,
    pub stored_key: [u8; 32],
    pub server_key: [u8; 32],
}

impl UserCredential {
    /// Compute the verifier from a plaintext password with a fresh salt.
    pub fn from_password(username: &str, password: &str) -> UserCredential {
        let salt: [u8; SALT_LEN] = rand::random();
        Self::from_password_with_salt(username, password, salt, DEFAULT_ITERATIONS)
    }

    pub fn from_password_with_salt(
        username: &str,
        password: &str,
        salt: [u8; SALT_LEN],
        iterations: u32,
    ) -> UserCredential {
        let salted_password = scram::salted_password(password, &salt, iterations);
        let client_key = scram::hmac_sha256(&salted_password, b"Client Key");
        let stored_key = scram::sha256(&client_key);
        let server_key = scram::hmac_sha256(&salted_password, b"Server Key");

        UserCredential {
            username: username.to_owned(),
            salt,
            iterations,
            stored_key,
            server_key,
        }
    }
}

/// Thread-safe verifier store with atomic-replace reload.
#[derive(Debug, Default)]
pub struct CredentialStore {
    users: ArcSwap<HashMap<String, UserCredential>>,
}

impl CredentialStore {
    pub fn new() -> CredentialStore {
        CredentialStore::default()
    }

    /// Build a store from plaintext pairs; plaintext is discarded after the
    /// verifiers are computed.
    pub fn from_plaintext(pairs: &[(String, String)]) -> CredentialStore {
        let store = CredentialStore::new();
        store.replace(pairs);
        store
    }

    pub fn lookup(&self, username: &str) -> Option<UserCredential> {
        self.users.load().get(username).cloned()
    }

    /// An empty store puts sessions in trust mode.
    pub fn is_empty(&self) -> bool {
        self.users.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.load().len()
    }

    /// Replace the whole store atomically. Concurrent lookups see either the
    /// old map or the new one, never a mix.
    pub fn replace(&self, pairs: &[(String, String)]) {
        let map: HashMap<String, UserCredential> = pairs
            .iter()
            .map(|(user, pass)| (user.clone(), UserCredential::from_password(user, pass)))
            .collect();
        self.users.store(Arc::new(map));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_verifier_fields_are_deterministic_for_fixed_salt() {
        let salt = [1u8; SALT_LEN];
        let a = UserCredential::from_password_with_salt("alice", "wonderland", salt, 4096);
        let b = UserCredential::from_password_with_salt("alice", "wonderland", salt, 4096);
        assert_eq!(a, b);

        let c = UserCredential::from_password_with_salt("alice", "rabbit", salt, 4096);
        assert_ne!(a.stored_key, c.stored_key);
        assert_ne!(a.server_key, c.server_key);
    }

    #[test]
    fn test_fresh_salt_per_insert() {
        let a = UserCredential::from_password("alice", "wonderland");
        let b = UserCredential::from_password("alice", "wonderland");
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn test_lookup_and_replace() {
        let store = CredentialStore::from_plaintext(&[
            ("alice".to_owned(), "wonderland".to_owned()),
            ("bob".to_owned(), "builder".to_owned()),
        ]);
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
        assert!(store.lookup("alice").is_some());
        assert!(store.lookup("mallory").is_none());

        store.replace(&[("carol".to_owned(), "xmas".to_owned())]);
        assert_eq!(store.len(), 1);
        assert!(store.lookup("alice").is_none());
        assert!(store.lookup("carol").is_some());
    }

    #[test]
    fn test_empty_store_is_trust_mode() {
        let store = CredentialStore::new();
        assert!(store.is_empty());
        assert!(store.lookup("anyone").is_none());
    }
}
