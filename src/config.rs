//! Configuration surface.
//!
//! Loaded once at startup from a TOML file, with a couple of CLI
//! overrides. Configuration problems are surfaced before the listener
//! binds; nothing here is mutated afterwards.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::backend::endpoint::{BackendTlsMode, Endpoint};
use crate::credentials::provider::ProviderConfig;
use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Listen address for the client-facing TCP endpoint.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Reader endpoint connection string.
    pub reader: String,

    /// Writer endpoint connection strings, in fan-out order.
    pub writers: Vec<String>,

    /// Client-facing TLS; absent means plaintext only.
    #[serde(default)]
    pub client_tls: Option<ClientTlsConfig>,

    /// Backend transport policy, shared by reader and writers.
    #[serde(default)]
    pub backend_tls: BackendTlsConfig,

    /// Credential provider; absent means trust mode.
    #[serde(default)]
    pub credentials: Option<ProviderConfig>,

    /// Poll interval for reloadable credential providers. Zero disables
    /// polling.
    #[serde(default = "default_reload_secs")]
    pub credential_reload_secs: u64,

    /// Per-query deadline for backend operations.
    #[serde(default = "default_deadline_ms")]
    pub query_deadline_ms: u64,
}

fn default_listen() -> String {
    "127.0.0.1:5433".to_owned()
}

fn default_reload_secs() -> u64 {
    60
}

fn default_deadline_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientTlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendTlsConfig {
    #[serde(default)]
    pub mode: BackendTlsMode,
    #[serde(default)]
    pub root_ca: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

impl ProxyConfig {
    pub fn load(path: &Path) -> ProxyResult<ProxyConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> ProxyResult<ProxyConfig> {
        toml::from_str(raw).map_err(|e| ProxyError::Config(e.to_string()))
    }

    /// Reject anything that cannot work before a single session is
    /// accepted. Mid-session surprises from configuration are a bug.
    pub fn validate(&self) -> ProxyResult<()> {
        self.listen.parse::<SocketAddr>().map_err(|_| {
            ProxyError::Config(format!("invalid listen address {:?}", self.listen))
        })?;

        Endpoint::parse(&self.reader)?;

        if self.writers.is_empty() {
            return Err(ProxyError::Config("no writers configured".to_owned()));
        }
        for writer in &self.writers {
            Endpoint::parse(writer)?;
        }

        match (
            &self.backend_tls.client_cert,
            &self.backend_tls.client_key,
        ) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ProxyError::Config(
                    "backend client certificate and key must be configured together".to_owned(),
                ));
            }
            _ => {}
        }

        if self.backend_tls.root_ca.is_none()
            && matches!(
                self.backend_tls.mode,
                BackendTlsMode::EncryptedVerifyCa | BackendTlsMode::EncryptedVerifyFull
            )
        {
            return Err(ProxyError::Config(format!(
                "backend tls mode {:?} requires root_ca",
                self.backend_tls.mode
            )));
        }

        Ok(())
    }
}
