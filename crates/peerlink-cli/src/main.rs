//! `peerlink` command-line entry point.
//!
//! Loads configuration, spawns the media engine, and drives one side of a
//! rendezvous handshake.

mod commands;
mod state;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use peerlink_core::config::load_config;

use crate::commands::MediaArgs;
use crate::state::Runtime;

#[derive(Debug, Parser)]
#[command(name = "peerlink", version, about = "Peer-to-peer audio sessions via a rendezvous relay")]
struct Cli {
    /// Path to a peerlink.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the engine's audio device catalog as JSON.
    Catalog,
    /// Create a session and wait for a peer to join.
    Listen(MediaArgs),
    /// Join the session with the given id.
    Join {
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("loading configuration")?;
    info!(relay = %config.relay.base_url, "peerlink starting");

    let runtime = Runtime::start(&config).await?;
    let result = match cli.command {
        Command::Catalog => commands::catalog(runtime.context()).await,
        Command::Listen(media) => commands::listen(runtime.context(), &media).await,
        Command::Join { session_id } => {
            commands::join(runtime.context(), session_id.as_str().into()).await
        }
    };
    runtime.shutdown().await;
    result
}
