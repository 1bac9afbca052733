use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pgmirror::config::ProxyConfig;
use pgmirror::credentials::{CredentialStore, provider};
use pgmirror::error::ProxyResult;
use pgmirror::server;

#[derive(Parser, Debug)]
#[command(name = "pgmirror", version, about = "Read/write-splitting postgres proxy with mirrored writes")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "pgmirror.toml", env = "PGMIRROR_CONFIG")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "pgmirror failed to start");
        std::process::exit(1);
    }
}

async fn run() -> ProxyResult<()> {
    let args = Args::parse();

    let mut config = ProxyConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    config.validate()?;

    let credentials = Arc::new(CredentialStore::new());
    match &config.credentials {
        Some(provider_config) => {
            let source = provider::build(provider_config)?;
            let pairs = source.fetch().await?;
            credentials.replace(&pairs);
            info!(users = credentials.len(), "credentials loaded");

            if source.supports_reload() && config.credential_reload_secs > 0 {
                // detached; lives for the rest of the process
                let _ = provider::spawn_reload(
                    Arc::clone(&credentials),
                    source,
                    Duration::from_secs(config.credential_reload_secs),
                );
            }
        }
        None => {
            warn!("no credential provider configured, accepting all clients (trust mode)");
        }
    }

    tokio::select! {
        result = server::run(config, credentials) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
