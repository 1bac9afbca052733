//! Server side of the SCRAM-SHA-256 exchange (RFC 5802), with
//! `tls-server-end-point` channel binding (RFC 5929).
//!
//! Verification never needs the plaintext password: the client proof is
//! unwound with the stored key only,
//!
//! ```text
//! ClientKey = ClientProof XOR HMAC(StoredKey, AuthMessage)
//! valid     = H(ClientKey) == StoredKey
//! ```
//!
//! and the reply carries `v = HMAC(ServerKey, AuthMessage)` so the client
//! can authenticate us in return.

use std::borrow::Cow;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use crate::credentials::{SALT_LEN, UserCredential};
use crate::error::{ProxyError, ProxyResult};

/// Compute SaltedPassword as defined in RFC 5802:
///
/// ```text
/// SaltedPassword := Hi(Normalize(password), salt, i)
/// ```
///
/// Following postgres, a password that fails SASLprep normalization is used
/// as-is instead of being rejected.
pub(crate) fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let normalized = stringprep::saslprep(password).unwrap_or(Cow::Borrowed(password));
    let mut buf = [0u8; 32];
    pbkdf2_hmac::<Sha256>(normalized.as_bytes(), salt, iterations, &mut buf);
    buf
}

pub(crate) fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

pub(crate) fn sha256(msg: &[u8]) -> [u8; 32] {
    Sha256::digest(msg).into()
}

fn xor32(lhs: &[u8; 32], rhs: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (l, r)) in out.iter_mut().zip(lhs.iter().zip(rhs.iter())) {
        *o = l ^ r;
    }
    out
}

/// Constant-time equality so proof verification leaks no prefix timing.
pub(crate) fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut acc = 0u8;
    for (l, r) in lhs.iter().zip(rhs.iter()) {
        acc |= l ^ r;
    }
    acc == 0
}

pub fn random_nonce() -> String {
    STANDARD.encode(rand::random::<[u8; 18]>())
}

const GS2_TLS_SERVER_END_POINT: &str = "p=tls-server-end-point";

enum ExchangeState {
    Initial,
    ServerFirstSent {
        gs2_header: String,
        combined_nonce: String,
        // client-first-bare "," server-first
        partial_auth_message: String,
    },
    Finished,
}

/// One SCRAM exchange for one session.
///
/// When the user is unknown the exchange runs against a decoy credential so
/// the wire traffic is indistinguishable from a wrong password; the final
/// verification then always fails.
pub struct ScramExchange {
    username: String,
    credential: UserCredential,
    decoy: bool,
    secure: bool,
    cert_fingerprint: Option<[u8; 32]>,
    state: ExchangeState,
}

impl ScramExchange {
    pub fn new(
        username: &str,
        credential: Option<UserCredential>,
        secure: bool,
        cert_fingerprint: Option<[u8; 32]>,
    ) -> ScramExchange {
        let (credential, decoy) = match credential {
            Some(credential) => (credential, false),
            None => (Self::decoy_credential(username), true),
        };

        ScramExchange {
            username: username.to_owned(),
            credential,
            decoy,
            secure,
            cert_fingerprint,
            state: ExchangeState::Initial,
        }
    }

    fn decoy_credential(username: &str) -> UserCredential {
        UserCredential {
            username: username.to_owned(),
            salt: rand::random::<[u8; SALT_LEN]>(),
            iterations: crate::credentials::DEFAULT_ITERATIONS,
            stored_key: rand::random(),
            server_key: rand::random(),
        }
    }

    /// Handle the client-first message, producing the server-first message.
    pub fn server_first(&mut self, client_first: &str) -> ProxyResult<String> {
        if !matches!(self.state, ExchangeState::Initial) {
            return Err(ProxyError::InvalidScramMessage(
                "client-first out of order".to_owned(),
            ));
        }

        let client_first = ClientFirst::try_new(client_first)?;

        let mut combined_nonce = client_first.nonce.clone();
        combined_nonce.push_str(random_nonce().as_str());

        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            STANDARD.encode(self.credential.salt),
            self.credential.iterations
        );

        self.state = ExchangeState::ServerFirstSent {
            gs2_header: client_first.gs2_header(),
            combined_nonce,
            partial_auth_message: format!("{},{}", client_first.bare(), server_first),
        };

        Ok(server_first)
    }

    /// Handle the client-final message. Returns the server-final message
    /// (`v=...`) on success; any failure is an authentication error.
    pub fn server_final(&mut self, client_final: &str) -> ProxyResult<String> {
        let ExchangeState::ServerFirstSent {
            gs2_header,
            combined_nonce,
            partial_auth_message,
        } = std::mem::replace(&mut self.state, ExchangeState::Finished)
        else {
            return Err(ProxyError::InvalidScramMessage(
                "client-final out of order".to_owned(),
            ));
        };

        let client_final = ClientFinal::try_new(client_final)?;

        if client_final.nonce != combined_nonce {
            return Err(ProxyError::InvalidScramMessage(
                "nonce mismatch".to_owned(),
            ));
        }

        self.validate_channel_binding(&gs2_header, &client_final.channel_binding)?;

        let auth_message = format!("{},{}", partial_auth_message, client_final.without_proof());

        let proof = STANDARD
            .decode(&client_final.proof)
            .ok()
            .and_then(|p| <[u8; 32]>::try_from(p).ok())
            .ok_or_else(|| ProxyError::InvalidScramMessage("malformed proof".to_owned()))?;

        let client_signature = hmac_sha256(&self.credential.stored_key, auth_message.as_bytes());
        let client_key = xor32(&proof, &client_signature);

        let proof_matches = constant_time_eq(&sha256(&client_key), &self.credential.stored_key);
        if !proof_matches || self.decoy {
            return Err(ProxyError::AuthenticationFailed(self.username.clone()));
        }

        let server_signature = hmac_sha256(&self.credential.server_key, auth_message.as_bytes());
        Ok(format!("v={}", STANDARD.encode(server_signature)))
    }

    /// Check the `c=` blob against the GS2 header from client-first.
    ///
    /// * `n,,`: the client declared no channel-binding support; only
    ///   acceptable over plaintext.
    /// * `y,,`: the client supports channel binding but saw no PLUS
    ///   mechanism advertised, which is our steady state on any transport.
    /// * `p=tls-server-end-point,,`: requires an encrypted session and the
    ///   trailing bytes must equal SHA-256 of our certificate's DER.
    fn validate_channel_binding(&self, gs2_header: &str, channel_binding: &str) -> ProxyResult<()> {
        let mut expected = gs2_header.as_bytes().to_vec();

        if gs2_header.starts_with(GS2_TLS_SERVER_END_POINT) {
            if !self.secure {
                return Err(ProxyError::ChannelBindingRequiresSsl);
            }
            let fingerprint = self
                .cert_fingerprint
                .as_ref()
                .ok_or(ProxyError::ChannelBindingRequiresSsl)?;
            expected.extend_from_slice(fingerprint);
        } else if gs2_header.starts_with("n") && self.secure {
            // a client that can speak TLS must bind the channel
            return Err(ProxyError::ChannelBindingMismatch);
        }

        let presented = STANDARD
            .decode(channel_binding)
            .map_err(|_| ProxyError::InvalidScramMessage("malformed channel binding".to_owned()))?;

        if presented == expected {
            Ok(())
        } else {
            Err(ProxyError::ChannelBindingMismatch)
        }
    }
}

#[derive(Debug)]
struct ClientFirst {
    cbind_flag: String,
    auth_zid: String,
    username: String,
    nonce: String,
}

impl ClientFirst {
    fn try_new(s: &str) -> ProxyResult<ClientFirst> {
        let parts: Vec<&str> = s.splitn(4, ',').collect();
        if parts.len() != 4
            || !Self::validate_cbind_flag(parts[0])
            || !parts[2].starts_with("n=")
            || !parts[3].starts_with("r=")
        {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        }
        // safe to unwrap after the checks above
        let cbind_flag = parts[0].to_owned();
        let auth_zid = parts[1].to_owned();
        let username = parts[2].strip_prefix("n=").unwrap().to_owned();
        let nonce = parts[3].strip_prefix("r=").unwrap().to_owned();

        if nonce.is_empty() {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        }

        Ok(ClientFirst {
            cbind_flag,
            auth_zid,
            username,
            nonce,
        })
    }

    fn validate_cbind_flag(flag: &str) -> bool {
        flag == "n" || flag == "y" || flag == GS2_TLS_SERVER_END_POINT
    }

    fn bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    fn gs2_header(&self) -> String {
        format!("{},{},", self.cbind_flag, self.auth_zid)
    }
}

#[derive(Debug)]
struct ClientFinal {
    channel_binding: String,
    nonce: String,
    proof: String,
}

impl ClientFinal {
    fn try_new(s: &str) -> ProxyResult<ClientFinal> {
        let parts: Vec<&str> = s.splitn(3, ',').collect();
        if parts.len() != 3
            || !parts[0].starts_with("c=")
            || !parts[1].starts_with("r=")
            || !parts[2].starts_with("p=")
        {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        }

        // safe to unwrap after the checks above
        let channel_binding = parts[0].strip_prefix("c=").unwrap().to_owned();
        let nonce = parts[1].strip_prefix("r=").unwrap().to_owned();
        let proof = parts[2].strip_prefix("p=").unwrap().to_owned();

        Ok(ClientFinal {
            channel_binding,
            nonce,
            proof,
        })
    }

    fn without_proof(&self) -> String {
        format!("c={},r={}", self.channel_binding, self.nonce)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Client-side proof computation, used to drive the exchange the way a
    /// real frontend would.
    fn client_final_message(
        password: &str,
        gs2_header: &str,
        cb_data: Option<&[u8]>,
        client_first_bare: &str,
        server_first: &str,
    ) -> String {
        let (combined_nonce, salt, iterations) = parse_server_first(server_first);

        let mut cbind = gs2_header.as_bytes().to_vec();
        if let Some(data) = cb_data {
            cbind.extend_from_slice(data);
        }
        let without_proof = format!("c={},r={}", STANDARD.encode(cbind), combined_nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let salted = salted_password(password, &salt, iterations);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof = xor32(&client_key, &client_signature);

        format!("{},p={}", without_proof, STANDARD.encode(proof))
    }

    fn parse_server_first(server_first: &str) -> (String, Vec<u8>, u32) {
        let mut nonce = String::new();
        let mut salt = Vec::new();
        let mut iterations = 0;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = v.to_owned();
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = STANDARD.decode(v).unwrap();
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = v.parse().unwrap();
            }
        }
        (nonce, salt, iterations)
    }

    fn exchange_for(password: &str, secure: bool, fp: Option<[u8; 32]>) -> ScramExchange {
        let credential = UserCredential::from_password("alice", password);
        ScramExchange::new("alice", Some(credential), secure, fp)
    }

    #[test]
    fn test_correct_password_authenticates() {
        let mut exchange = exchange_for("wonderland", false, None);

        let client_first_bare = "n=,r=clientnonce";
        let server_first = exchange
            .server_first(&format!("n,,{}", client_first_bare))
            .unwrap();

        let client_final =
            client_final_message("wonderland", "n,,", None, client_first_bare, &server_first);
        let server_final = exchange.server_final(&client_final).unwrap();
        assert!(server_final.starts_with("v="));
    }

    #[test]
    fn test_wrong_password_fails() {
        let mut exchange = exchange_for("wonderland", false, None);

        let client_first_bare = "n=,r=clientnonce";
        let server_first = exchange
            .server_first(&format!("n,,{}", client_first_bare))
            .unwrap();

        let client_final =
            client_final_message("rabbit", "n,,", None, client_first_bare, &server_first);
        let result = exchange.server_final(&client_final);
        assert!(matches!(result, Err(ProxyError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_unknown_user_fails_after_full_handshake() {
        let mut exchange = ScramExchange::new("mallory", None, false, None);

        let client_first_bare = "n=,r=clientnonce";
        // the decoy still produces a plausible server-first
        let server_first = exchange
            .server_first(&format!("n,,{}", client_first_bare))
            .unwrap();
        assert!(server_first.contains(",i=4096"));

        let client_final =
            client_final_message("anything", "n,,", None, client_first_bare, &server_first);
        let result = exchange.server_final(&client_final);
        assert!(matches!(result, Err(ProxyError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_nonce_tampering_is_rejected() {
        let mut exchange = exchange_for("wonderland", false, None);

        let client_first_bare = "n=,r=clientnonce";
        let server_first = exchange
            .server_first(&format!("n,,{}", client_first_bare))
            .unwrap();

        // substitute a foreign combined nonce
        let forged_server_first = server_first.replace("r=clientnonce", "r=forgednonce");
        let client_final = client_final_message(
            "wonderland",
            "n,,",
            None,
            client_first_bare,
            &forged_server_first,
        );
        let result = exchange.server_final(&client_final);
        assert!(matches!(result, Err(ProxyError::InvalidScramMessage(_))));
    }

    #[test]
    fn test_channel_binding_end_to_end() {
        let fingerprint: [u8; 32] = [0xAB; 32];
        let mut exchange = exchange_for("wonderland", true, Some(fingerprint));

        let gs2 = "p=tls-server-end-point,,";
        let client_first_bare = "n=,r=clientnonce";
        let server_first = exchange
            .server_first(&format!("{}{}", gs2, client_first_bare))
            .unwrap();

        let client_final = client_final_message(
            "wonderland",
            gs2,
            Some(&fingerprint),
            client_first_bare,
            &server_first,
        );
        assert!(exchange.server_final(&client_final).unwrap().starts_with("v="));
    }

    #[test]
    fn test_channel_binding_fingerprint_mismatch() {
        let mut exchange = exchange_for("wonderland", true, Some([0xAB; 32]));

        let gs2 = "p=tls-server-end-point,,";
        let client_first_bare = "n=,r=clientnonce";
        let server_first = exchange
            .server_first(&format!("{}{}", gs2, client_first_bare))
            .unwrap();

        let wrong_fingerprint = [0xCD; 32];
        let client_final = client_final_message(
            "wonderland",
            gs2,
            Some(&wrong_fingerprint),
            client_first_bare,
            &server_first,
        );
        let result = exchange.server_final(&client_final);
        assert!(matches!(result, Err(ProxyError::ChannelBindingMismatch)));
    }

    #[test]
    fn test_channel_binding_requires_tls() {
        let mut exchange = exchange_for("wonderland", false, None);

        let gs2 = "p=tls-server-end-point,,";
        let client_first_bare = "n=,r=clientnonce";
        let server_first = exchange
            .server_first(&format!("{}{}", gs2, client_first_bare))
            .unwrap();

        let client_final = client_final_message(
            "wonderland",
            gs2,
            Some(&[0u8; 32]),
            client_first_bare,
            &server_first,
        );
        let result = exchange.server_final(&client_final);
        assert!(matches!(result, Err(ProxyError::ChannelBindingRequiresSsl)));
    }

    #[test]
    fn test_no_binding_rejected_over_tls() {
        let mut exchange = exchange_for("wonderland", true, Some([0xAB; 32]));

        let client_first_bare = "n=,r=clientnonce";
        let server_first = exchange
            .server_first(&format!("n,,{}", client_first_bare))
            .unwrap();

        let client_final =
            client_final_message("wonderland", "n,,", None, client_first_bare, &server_first);
        let result = exchange.server_final(&client_final);
        assert!(matches!(result, Err(ProxyError::ChannelBindingMismatch)));
    }

    #[test]
    fn test_malformed_client_first() {
        let mut exchange = exchange_for("wonderland", false, None);
        assert!(exchange.server_first("x,,n=,r=abc").is_err());
        assert!(exchange.server_first("n,,r=abc").is_err());
        assert!(exchange.server_first("n,,n=,r=").is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"s4me"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }
}
