//! Credential providers.
//!
//! A provider produces plaintext `user:password` pairs; the store turns
//! them into SCRAM verifiers immediately. Providers that support reload are
//! polled on an interval and replace the store atomically on success.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{CredentialStore, envelope};
use crate::error::{ProxyError, ProxyResult};

/// Provider selection, from configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProviderConfig {
    /// `USER:PASS` pairs in a single environment variable, separated by
    /// commas or whitespace. No reload.
    Env { var: String },
    /// JSON file `{"users": [{"username": ..., "password": ...}]}`,
    /// optionally sealed in an AES-256-GCM envelope. `key` is the 32-byte
    /// key, base64 encoded.
    File {
        path: PathBuf,
        #[serde(default)]
        key: Option<String>,
    },
    /// Directory of newline-delimited `user:password` files, the layout a
    /// mounted kubernetes secret produces.
    MountedSecret { dir: PathBuf },
    RemoteKv { url: String },
    CloudSecret { name: String },
    Http { url: String },
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> ProxyResult<Vec<(String, String)>>;

    fn supports_reload(&self) -> bool {
        true
    }
}

/// Instantiate the configured provider. Unsupported kinds fail here, at
/// startup, not mid-session.
pub fn build(config: &ProviderConfig) -> ProxyResult<Arc<dyn CredentialSource>> {
    match config {
        ProviderConfig::Env { var } => Ok(Arc::new(EnvSource { var: var.clone() })),
        ProviderConfig::File { path, key } => {
            let key = key
                .as_deref()
                .map(|encoded| {
                    let bytes = STANDARD.decode(encoded).map_err(|_| {
                        ProxyError::Config("credential file key is not valid base64".to_owned())
                    })?;
                    <[u8; envelope::KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
                        ProxyError::Config(format!(
                            "credential file key must be {} bytes",
                            envelope::KEY_LEN
                        ))
                    })
                })
                .transpose()?;
            Ok(Arc::new(FileSource {
                path: path.clone(),
                key,
            }))
        }
        ProviderConfig::MountedSecret { dir } => Ok(Arc::new(MountedSecretSource {
            dir: dir.clone(),
        })),
        ProviderConfig::RemoteKv { .. } => Err(ProxyError::Config(
            "credential provider \"remote-kv\" is not supported in this build".to_owned(),
        )),
        ProviderConfig::CloudSecret { .. } => Err(ProxyError::Config(
            "credential provider \"cloud-secret\" is not supported in this build".to_owned(),
        )),
        ProviderConfig::Http { .. } => Err(ProxyError::Config(
            "credential provider \"http\" is not supported in this build".to_owned(),
        )),
    }
}

/// Poll a reloadable provider and swap the store on each successful fetch.
/// A failed fetch keeps the previous credentials.
pub fn spawn_reload(
    store: Arc<CredentialStore>,
    source: Arc<dyn CredentialSource>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the initial load happened before the server started
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match source.fetch().await {
                Ok(pairs) => {
                    store.replace(&pairs);
                    debug!(users = store.len(), "credentials reloaded");
                }
                Err(e) => {
                    warn!(error = %e, "credential reload failed, keeping previous store");
                }
            }
        }
    })
}

struct EnvSource {
    var: String,
}

#[async_trait]
impl CredentialSource for EnvSource {
    async fn fetch(&self) -> ProxyResult<Vec<(String, String)>> {
        let raw = std::env::var(&self.var).map_err(|_| {
            ProxyError::Config(format!("environment variable {} is not set", self.var))
        })?;
        parse_compact_pairs(&raw)
    }

    fn supports_reload(&self) -> bool {
        false
    }
}

struct FileSource {
    path: PathBuf,
    key: Option<[u8; envelope::KEY_LEN]>,
}

#[derive(Deserialize)]
struct CredentialFile {
    users: Vec<CredentialEntry>,
}

#[derive(Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

#[async_trait]
impl CredentialSource for FileSource {
    async fn fetch(&self) -> ProxyResult<Vec<(String, String)>> {
        let raw = tokio::fs::read(&self.path).await?;
        let json = match &self.key {
            Some(key) => envelope::open(key, &raw)?,
            None => raw,
        };

        let parsed: CredentialFile = serde_json::from_slice(&json).map_err(|e| {
            ProxyError::Config(format!(
                "malformed credential file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(parsed
            .users
            .into_iter()
            .map(|entry| (entry.username, entry.password))
            .collect())
    }
}

struct MountedSecretSource {
    dir: PathBuf,
}

#[async_trait]
impl CredentialSource for MountedSecretSource {
    async fn fetch(&self) -> ProxyResult<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            // mounted secrets hide bookkeeping under dot-prefixed paths
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let content = tokio::fs::read_to_string(entry.path()).await?;
            pairs.extend(parse_line_pairs(&content)?);
        }

        Ok(pairs)
    }
}

/// Parse `USER:PASS` pairs separated by commas or whitespace.
fn parse_compact_pairs(raw: &str) -> ProxyResult<Vec<(String, String)>> {
    raw.split([',', ' ', '\t', '\n'])
        .filter(|chunk| !chunk.is_empty())
        .map(split_pair)
        .collect()
}

/// Parse newline-delimited `user:password` entries; blank lines and `#`
/// comments are skipped.
fn parse_line_pairs(raw: &str) -> ProxyResult<Vec<(String, String)>> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(split_pair)
        .collect()
}

fn split_pair(chunk: &str) -> ProxyResult<(String, String)> {
    match chunk.split_once(':') {
        Some((user, pass)) if !user.is_empty() => Ok((user.to_owned(), pass.to_owned())),
        _ => Err(ProxyError::Config(format!(
            "malformed credential entry {:?}, expected user:password",
            chunk
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_compact_pairs() {
        let pairs = parse_compact_pairs("alice:wonderland,bob:builder").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("alice".to_owned(), "wonderland".to_owned()),
                ("bob".to_owned(), "builder".to_owned()),
            ]
        );

        let pairs = parse_compact_pairs("alice:wonderland bob:builder").unwrap();
        assert_eq!(pairs.len(), 2);

        // password may contain a colon
        let pairs = parse_compact_pairs("alice:won:der").unwrap();
        assert_eq!(pairs[0].1, "won:der");
    }

    #[test]
    fn test_parse_compact_pairs_rejects_malformed() {
        assert!(parse_compact_pairs("alicewonderland").is_err());
        assert!(parse_compact_pairs(":nopassword").is_err());
    }

    #[test]
    fn test_parse_line_pairs() {
        let content = "# staging users\nalice:wonderland\n\n  bob:builder  \n";
        let pairs = parse_line_pairs(content).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1], ("bob".to_owned(), "builder".to_owned()));
    }

    #[test]
    fn test_build_rejects_remote_kinds() {
        let config = ProviderConfig::Http {
            url: "https://vault.internal/creds".to_owned(),
        };
        assert!(build(&config).is_err());
    }

    #[test]
    fn test_build_rejects_short_file_key() {
        let config = ProviderConfig::File {
            path: PathBuf::from("/tmp/creds.json"),
            key: Some(STANDARD.encode([0u8; 16])),
        };
        assert!(build(&config).is_err());
    }

    #[tokio::test]
    async fn test_file_source_plain_and_sealed() {
        let dir = std::env::temp_dir().join(format!("pgmirror-prov-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let json = br#"{"users":[{"username":"alice","password":"wonderland"}]}"#;

        let plain_path = dir.join("creds.json");
        std::fs::write(&plain_path, json).unwrap();
        let source = FileSource {
            path: plain_path,
            key: None,
        };
        let pairs = source.fetch().await.unwrap();
        assert_eq!(pairs, vec![("alice".to_owned(), "wonderland".to_owned())]);

        let key = [9u8; envelope::KEY_LEN];
        let sealed_path = dir.join("creds.enc");
        std::fs::write(&sealed_path, envelope::seal(&key, json).unwrap()).unwrap();
        let source = FileSource {
            path: sealed_path,
            key: Some(key),
        };
        let pairs = source.fetch().await.unwrap();
        assert_eq!(pairs.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_mounted_secret_source() {
        let dir = std::env::temp_dir().join(format!("pgmirror-secret-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("app-users"), "alice:wonderland\nbob:builder\n").unwrap();
        std::fs::write(dir.join(".hidden"), "ignored:entry\n").unwrap();

        let source = MountedSecretSource { dir: dir.clone() };
        let mut pairs = source.fetch().await.unwrap();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("alice".to_owned(), "wonderland".to_owned()),
                ("bob".to_owned(), "builder".to_owned()),
            ]
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
