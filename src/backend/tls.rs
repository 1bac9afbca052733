//! TLS policy for backend sessions.
//!
//! The connector is built once at startup from the configured transport
//! mode. `encrypted-no-verify` and `encrypted-verify-ca` need custom
//! certificate verifiers because rustls has no built-in notion of "validate
//! the chain but skip hostname matching".

use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::verify_server_cert_signed_by_trust_anchor;
use tokio_rustls::rustls::crypto::{
    self, CryptoProvider, WebPkiSupportedAlgorithms, aws_lc_rs,
};
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme,
};

use super::endpoint::BackendTlsMode;
use crate::error::{ProxyError, ProxyResult};

/// Everything a backend session needs to decide its transport.
pub struct BackendTls {
    pub mode: BackendTlsMode,
    pub connector: Option<TlsConnector>,
}

impl BackendTls {
    pub fn plaintext() -> BackendTls {
        BackendTls {
            mode: BackendTlsMode::Plaintext,
            connector: None,
        }
    }

    pub fn new(
        mode: BackendTlsMode,
        root_ca: Option<&Path>,
        client_cert: Option<&Path>,
        client_key: Option<&Path>,
    ) -> ProxyResult<BackendTls> {
        if !mode.is_encrypted() {
            return Ok(BackendTls::plaintext());
        }

        let provider = Arc::new(aws_lc_rs::default_provider());

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Config(format!("tls provider setup failed: {}", e)))?;

        let builder = match mode {
            BackendTlsMode::Plaintext => unreachable!("handled above"),
            BackendTlsMode::EncryptedNoVerify => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoopVerifier::new(&provider))),
            BackendTlsMode::EncryptedVerifyCa => {
                let roots = load_roots(mode, root_ca)?;
                builder.dangerous().with_custom_certificate_verifier(Arc::new(
                    SkipHostnameVerifier::new_with_provider(roots, &provider),
                ))
            }
            BackendTlsMode::EncryptedVerifyFull => {
                let roots = load_roots(mode, root_ca)?;
                builder.with_root_certificates(roots)
            }
        };

        let config = match (client_cert, client_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| ProxyError::Config(format!("invalid client certificate: {}", e)))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(ProxyError::Config(
                    "client certificate and key must be configured together".to_owned(),
                ));
            }
        };

        Ok(BackendTls {
            mode,
            connector: Some(TlsConnector::from(Arc::new(config))),
        })
    }
}

fn load_roots(mode: BackendTlsMode, root_ca: Option<&Path>) -> ProxyResult<RootCertStore> {
    let root_ca = root_ca.ok_or_else(|| {
        ProxyError::Config(format!(
            "backend tls mode {:?} requires a root CA bundle",
            mode
        ))
    })?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(root_ca)? {
        roots
            .add(cert)
            .map_err(|e| ProxyError::Config(format!("invalid root certificate: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(ProxyError::Config(format!(
            "no certificates found in {}",
            root_ca.display()
        )));
    }
    Ok(roots)
}

pub(crate) fn load_certs(path: &Path) -> ProxyResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("cannot read {}: {}", path.display(), e)))
}

pub(crate) fn load_key(path: &Path) -> ProxyResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ProxyError::Config(format!("cannot read {}: {}", path.display(), e)))?
        .ok_or_else(|| ProxyError::Config(format!("no private key found in {}", path.display())))
}

/// Validates the certificate chain against the configured roots but skips
/// hostname verification, matching the `verify-ca` backend transport mode.
#[derive(Debug)]
pub struct SkipHostnameVerifier {
    roots: Arc<RootCertStore>,
    supported: WebPkiSupportedAlgorithms,
}

impl SkipHostnameVerifier {
    pub fn new_with_provider(
        roots: impl Into<Arc<RootCertStore>>,
        provider: &Arc<CryptoProvider>,
    ) -> Self {
        Self {
            roots: roots.into(),
            supported: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for SkipHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let cert = ParsedCertificate::try_from(end_entity)
            .map_err(|_| Error::InvalidCertificate(CertificateError::BadEncoding))?;

        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.supported.all,
        )?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Accepts any certificate, for the `encrypted-no-verify` transport mode.
/// The channel is private but the peer is unauthenticated.
#[derive(Debug)]
pub struct NoopVerifier {
    supported: WebPkiSupportedAlgorithms,
}

impl NoopVerifier {
    pub fn new(provider: &Arc<CryptoProvider>) -> Self {
        Self {
            supported: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoopVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_plaintext_has_no_connector() {
        let tls = BackendTls::new(BackendTlsMode::Plaintext, None, None, None).unwrap();
        assert!(tls.connector.is_none());
    }

    #[test]
    fn test_verify_modes_require_root_ca() {
        assert!(BackendTls::new(BackendTlsMode::EncryptedVerifyCa, None, None, None).is_err());
        assert!(BackendTls::new(BackendTlsMode::EncryptedVerifyFull, None, None, None).is_err());
    }

    #[test]
    fn test_no_verify_builds_without_roots() {
        let tls = BackendTls::new(BackendTlsMode::EncryptedNoVerify, None, None, None).unwrap();
        assert!(tls.connector.is_some());
    }

    #[test]
    fn test_client_cert_requires_key() {
        let result = BackendTls::new(
            BackendTlsMode::EncryptedNoVerify,
            None,
            Some(Path::new("/etc/pgmirror/client.crt")),
            None,
        );
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }
}
