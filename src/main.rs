mod auth;
mod config;
mod error;
mod git;
mod ssh;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::{AllowAll, Authorizer, AuthorizedKeysLookup, ClientAuth, RuleAuthorizer};
use crate::config::Config;
use crate::git::{BareRepoInitializer, RepoInitializer};
use crate::ssh::GitSshServer;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitsshd", version, about = "SSH front-end for git repositories")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitsshd/config.yaml")]
    config: PathBuf,

    /// Listen address, overriding `listen` from the config file.
    #[arg(short, long, env = "GITSSHD_LISTEN")]
    listen: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Configuration and capabilities shared by every connection.
pub struct AppState {
    pub config: Arc<Config>,
    /// How clients authenticate during the handshake.
    pub client_auth: ClientAuth,
    /// Consulted for every exec before a service process is spawned.
    pub authorizer: Arc<dyn Authorizer>,
    /// Creates missing repositories on push when `auto_create` is set.
    pub initializer: Arc<dyn RepoInitializer>,
}

fn build_state(config: Arc<Config>) -> Result<AppState> {
    let client_auth = if config.auth.enabled {
        let path = config
            .auth
            .authorized_keys
            .clone()
            .context("auth.authorized_keys is required when auth is enabled")?;
        let lookup = AuthorizedKeysLookup::new(path);
        tracing::info!(
            authorized_keys = %lookup.path().display(),
            "public key authentication enabled"
        );
        ClientAuth::PublicKey(Arc::new(lookup))
    } else {
        tracing::warn!("client authentication disabled; every client is accepted");
        ClientAuth::Disabled
    };

    let authorizer: Arc<dyn Authorizer> = if config.access.is_empty() {
        tracing::info!("no access rules configured; every command is allowed");
        Arc::new(AllowAll)
    } else {
        tracing::info!(rules = config.access.len(), "access rules loaded");
        Arc::new(RuleAuthorizer::new(config.access.clone()))
    };

    Ok(AppState {
        config,
        client_auth,
        authorizer,
        initializer: Arc::new(BareRepoInitializer),
    })
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ---- Config ----
    let mut config = config::load_config(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    let config = Arc::new(config);

    tracing::info!(
        config_path = %cli.config.display(),
        listen = %config.listen,
        repo_root = %config.repo_root.display(),
        "starting gitsshd"
    );

    // ---- Ensure repository root exists ----
    tokio::fs::create_dir_all(&config.repo_root)
        .await
        .with_context(|| {
            format!(
                "failed to create repository root: {}",
                config.repo_root.display()
            )
        })?;

    // ---- App state ----
    let state = Arc::new(build_state(config)?);

    // ---- SSH server ----
    let server = GitSshServer::setup(state)?;
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    server.run().await.context("SSH server failed")?;

    tracing::info!("gitsshd shut down cleanly");
    Ok(())
}
