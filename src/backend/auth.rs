//! Client side of backend authentication.
//!
//! Backends decide the mechanism; the proxy answers cleartext, md5 and
//! SCRAM-SHA-256 challenges using the password from the endpoint string.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

use crate::auth::scram::{constant_time_eq, hmac_sha256, random_nonce, salted_password, sha256};
use crate::error::{ProxyError, ProxyResult};

/// Postgres md5 password format: `"md5" + md5(md5(password + username) + salt)`.
pub(crate) fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// SCRAM-SHA-256 client state for one backend session. Channel binding is
/// not offered; backends accept the plain mechanism on TLS connections too.
pub(crate) struct ScramClient {
    password: String,
    nonce: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    const GS2_HEADER: &'static str = "n,,";

    pub(crate) fn new(password: &str) -> ScramClient {
        ScramClient {
            password: password.to_owned(),
            nonce: random_nonce(),
            auth_message: None,
            salted_password: None,
        }
    }

    /// `client-first-message`. Postgres ignores the SCRAM username and uses
    /// the startup user instead, so `n=` stays empty.
    pub(crate) fn client_first_message(&self) -> String {
        format!("{}n=,r={}", Self::GS2_HEADER, self.nonce)
    }

    /// Consume `server-first-message`, produce `client-final-message`.
    pub(crate) fn process_server_first(&mut self, server_first: &str) -> ProxyResult<String> {
        let mut combined_nonce = None;
        let mut salt_b64 = None;
        let mut iterations: Option<u32> = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt_b64 = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse().ok();
            }
        }

        let (combined_nonce, salt_b64, iterations) = match (combined_nonce, salt_b64, iterations) {
            (Some(n), Some(s), Some(i)) => (n, s, i),
            _ => {
                return Err(ProxyError::InvalidScramMessage(server_first.to_owned()));
            }
        };

        if !combined_nonce.starts_with(&self.nonce) {
            return Err(ProxyError::InvalidScramMessage(
                "server nonce does not extend client nonce".to_owned(),
            ));
        }

        let salt = STANDARD
            .decode(salt_b64)
            .map_err(|_| ProxyError::InvalidScramMessage("malformed salt".to_owned()))?;

        let salted = salted_password(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!(
            "c={},r={}",
            STANDARD.encode(Self::GS2_HEADER),
            combined_nonce
        );
        let auth_message = format!(
            "n=,r={},{},{}",
            self.nonce, server_first, without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.salted_password = Some(salted);
        self.auth_message = Some(auth_message);

        Ok(format!("{},p={}", without_proof, STANDARD.encode(proof)))
    }

    /// Verify the backend's `v=` signature so we know it holds the real
    /// verifier, not just our traffic.
    pub(crate) fn verify_server_final(&self, server_final: &str) -> ProxyResult<()> {
        let signature_b64 = server_final
            .strip_prefix("v=")
            .ok_or_else(|| ProxyError::InvalidScramMessage(server_final.to_owned()))?;
        let signature = STANDARD
            .decode(signature_b64)
            .map_err(|_| ProxyError::InvalidScramMessage("malformed signature".to_owned()))?;

        let (salted, auth_message) = match (&self.salted_password, &self.auth_message) {
            (Some(s), Some(a)) => (s, a),
            _ => {
                return Err(ProxyError::InvalidScramMessage(
                    "server-final out of order".to_owned(),
                ));
            }
        };

        let server_key = hmac_sha256(salted, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());

        if constant_time_eq(&signature, &expected) {
            Ok(())
        } else {
            Err(ProxyError::InvalidScramMessage(
                "server signature mismatch".to_owned(),
            ))
        }
    }
}
