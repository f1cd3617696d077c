//! # parley-agent
//!
//! parley relay binary: loads settings, builds the provider chains and the
//! session store, and runs the HTTP/WebSocket server until a shutdown
//! signal arrives.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::logging::{LogFormat, init_subscriber};
use parley_providers::{ProviderHealthTracker, build_provider_chain};
use parley_server::config::ServerConfig;
use parley_server::server::RelayServer;
use parley_server::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use parley_settings::RelaySettings;

/// parley live speech relay.
#[derive(Parser, Debug)]
#[command(name = "parley-agent", about = "Live speech translation relay")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// `SQLite` file for session records (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,
}

impl Cli {
    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.db_path {
            settings.storage.database_path = Some(path.to_string_lossy().into_owned());
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn open_store(settings: &RelaySettings) -> Result<Arc<dyn SessionStore>> {
    match settings.storage.database_path.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            ensure_parent_dir(path)?;
            let store = SqliteSessionStore::open(path)
                .with_context(|| format!("Failed to open session database: {}", path.display()))?;
            tracing::info!(path = %path.display(), "session records persisted to sqlite");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("session records kept in memory");
            Ok(Arc::new(MemorySessionStore::new()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                let _ = sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(parley_settings::settings_path);
    let mut settings = parley_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    args.apply(&mut settings);

    init_subscriber(
        &settings.logging.level,
        LogFormat::from_name(&settings.logging.format),
    );
    let metrics = parley_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let health = Arc::new(ProviderHealthTracker::new());
    let chain = Arc::new(build_provider_chain(&settings.providers, health));
    let store = open_store(&settings)?;

    let config = ServerConfig::from_settings(&settings);
    let server = RelayServer::new(config, chain, Some(store), metrics);

    let addr = server
        .serve_until(shutdown_signal())
        .await
        .context("Failed to bind server")?;
    tracing::info!(%addr, "shutdown complete");
    Ok(())
}
