//! warden - command-line client for the warden daemon
//!
//! Runs one remote command, relaying its output streams to this
//! process's stdout and stderr, and exits with the remote status.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use warden_cli::WardenClient;
use warden_core::identity::PeerIdentity;
use warden_core::protocol::{ProtocolVersion, StreamId};
use warden_core::secure::{Keyring, ProtectionLevel};

/// warden - run a command on a remote warden daemon
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server address.
    #[arg(short, long, default_value = "127.0.0.1:4373")]
    server: String,

    /// Principal to authenticate as; defaults to the identity the
    /// environment provides (`WARDEN_USER`).
    #[arg(short, long)]
    principal: Option<String>,

    /// Keyring file holding the principal's key.
    #[arg(short, long, default_value = "/etc/warden/keyring")]
    keyring: PathBuf,

    /// Protocol generation to speak (1 or 2).
    #[arg(long, default_value_t = 2)]
    protocol: u8,

    /// Authenticate without encrypting the channel.
    #[arg(long)]
    integrity_only: bool,

    /// Command and arguments to run remotely.
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let Some(version) = ProtocolVersion::from_u8(args.protocol) else {
        bail!("unsupported protocol generation {}", args.protocol);
    };
    let principal = match args.principal {
        Some(principal) => principal,
        None => match PeerIdentity::from_environment() {
            Some(identity) => identity.principal,
            None => bail!("no --principal given and none in the environment"),
        },
    };
    let protection = if args.integrity_only {
        ProtectionLevel::Integrity
    } else {
        ProtectionLevel::Private
    };

    let keyring = Keyring::from_file(&args.keyring)
        .with_context(|| format!("loading keyring from {}", args.keyring.display()))?;
    let key = keyring
        .lookup(&principal)
        .with_context(|| format!("no key for principal '{principal}' in keyring"))?
        .clone();

    let mut client =
        WardenClient::connect_with(&args.server, &principal, key, version, protection)
            .await
            .with_context(|| format!("connecting to {}", args.server))?;

    let command_args: Vec<Vec<u8>> = args.command.iter().map(|s| s.clone().into_bytes()).collect();

    let result = client
        .call_streamed(&command_args, false, |stream, data| {
            let written = match stream {
                StreamId::Stdout => std::io::stdout().write_all(data),
                StreamId::Stderr => std::io::stderr().write_all(data),
            };
            if let Err(e) = written {
                tracing::warn!(error = %e, "cannot relay output");
            }
        })
        .await;

    match result {
        Ok(status) => {
            let code = u8::try_from(status).unwrap_or(u8::MAX);
            Ok(ExitCode::from(code))
        },
        Err(warden_cli::ClientError::Remote { code, message }) => {
            eprintln!("warden: {code}: {message}");
            Ok(ExitCode::from(255))
        },
        Err(error) => Err(error).context("running remote command"),
    }
}
