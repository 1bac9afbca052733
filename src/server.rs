//! Listener and per-process shared state.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::crypto::aws_lc_rs;
use tracing::{debug, info};

use crate::backend::tls::{load_certs, load_key};
use crate::backend::{BackendTls, Endpoint};
use crate::config::{ClientTlsConfig, ProxyConfig};
use crate::credentials::CredentialStore;
use crate::error::{ProxyError, ProxyResult};
use crate::session;

/// Immutable state shared by every session. The credential store is the
/// only piece with interior mutability, and only of the atomic-replace
/// kind.
pub struct ProxyShared {
    pub reader: Endpoint,
    pub writers: Vec<Endpoint>,
    pub backend_tls: BackendTls,
    pub credentials: Arc<CredentialStore>,
    /// SHA-256 of our server certificate's DER encoding, for
    /// tls-server-end-point channel binding. Present only with client TLS.
    pub cert_fingerprint: Option<[u8; 32]>,
    pub query_deadline: Duration,
}

impl ProxyShared {
    pub fn from_config(
        config: &ProxyConfig,
        credentials: Arc<CredentialStore>,
        cert_fingerprint: Option<[u8; 32]>,
    ) -> ProxyResult<ProxyShared> {
        let reader = Endpoint::parse(&config.reader)?;
        let writers = config
            .writers
            .iter()
            .map(|w| Endpoint::parse(w))
            .collect::<ProxyResult<Vec<_>>>()?;

        let backend_tls = BackendTls::new(
            config.backend_tls.mode,
            config.backend_tls.root_ca.as_deref(),
            config.backend_tls.client_cert.as_deref(),
            config.backend_tls.client_key.as_deref(),
        )?;

        Ok(ProxyShared {
            reader,
            writers,
            backend_tls,
            credentials,
            cert_fingerprint,
            query_deadline: Duration::from_millis(config.query_deadline_ms),
        })
    }
}

/// Build the client-facing TLS acceptor and the certificate fingerprint
/// used for channel binding.
fn build_acceptor(tls: &ClientTlsConfig) -> ProxyResult<(TlsAcceptor, [u8; 32])> {
    let certs = load_certs(&tls.cert)?;
    let first = certs.first().ok_or_else(|| {
        ProxyError::Config(format!("no certificates found in {}", tls.cert.display()))
    })?;
    let fingerprint: [u8; 32] = Sha256::digest(first.as_ref()).into();

    let key = load_key(&tls.key)?;

    let server_config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("tls provider setup failed: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("invalid server certificate: {}", e)))?;

    Ok((TlsAcceptor::from(Arc::new(server_config)), fingerprint))
}

/// Bind the listener and serve sessions until the task is cancelled.
pub async fn run(config: ProxyConfig, credentials: Arc<CredentialStore>) -> ProxyResult<()> {
    let (tls_acceptor, cert_fingerprint) = match &config.client_tls {
        Some(tls) => {
            let (acceptor, fingerprint) = build_acceptor(tls)?;
            debug!(
                fingerprint = %hex::encode(fingerprint),
                "client tls configured, channel binding available"
            );
            (Some(acceptor), Some(fingerprint))
        }
        None => (None, None),
    };

    let shared = Arc::new(ProxyShared::from_config(
        &config,
        credentials,
        cert_fingerprint,
    )?);

    let listener = TcpListener::bind(&config.listen).await?;
    info!(
        listen = %config.listen,
        reader = %shared.reader,
        writers = shared.writers.len(),
        tls = tls_acceptor.is_some(),
        "pgmirror listening"
    );

    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(peer = %peer, "accepted connection");

        let shared = Arc::clone(&shared);
        let acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = session::process_socket(socket, acceptor, shared).await {
                debug!(peer = %peer, error = %e, "session ended with error");
            }
        });
    }
}
