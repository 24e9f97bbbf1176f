//! wardend - authenticated remote command execution daemon
//!
//! Binds the listener, loads the keyring and policy snapshot, and
//! serves sessions until interrupted.
//!
//! The runtime is constructed manually from a synchronous `main` with a
//! current-thread scheduler: the whole daemon is one readiness-driven
//! reactor, and sessions are tasks multiplexed on it rather than
//! threads.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden_core::secure::Keyring;
use warden_daemon::config::DaemonConfig;
use warden_daemon::server::WardenServer;

/// warden daemon - remote command execution with per-command ACLs
#[derive(Parser, Debug)]
#[command(name = "wardend")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file.
    #[arg(short, long, default_value = "/etc/warden/warden.toml")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = DaemonConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    let keyring = Keyring::from_file(&config.daemon.keyring)
        .with_context(|| format!("loading keyring from {}", config.daemon.keyring.display()))?;
    let policy = config.build_policy().context("building policy")?;

    let mut server_config = config.server_config();
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(serve(server_config, keyring, policy))
}

async fn serve(
    config: warden_daemon::server::ServerConfig,
    keyring: Keyring,
    policy: warden_core::policy::Policy,
) -> Result<()> {
    let server = WardenServer::bind(config, keyring, policy)
        .await
        .context("binding listener")?;

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!(error = %e, "accept loop failed");
            }
            result.context("accept loop")
        },
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            Ok(())
        },
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            Ok(())
        },
    }
}
