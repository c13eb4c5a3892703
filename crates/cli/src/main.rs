//! cidsift - search engine crawler for the IPFS DHT.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

mod commands;
mod logging;

use commands::{cmd_add, cmd_crawl, cmd_config};
use logging::init_logging;

#[derive(Parser)]
#[command(name = "cidsift")]
#[command(about = "Crawler and indexer for content sniffed off the IPFS DHT")]
struct Cli {
  /// Load configuration from FILE
  #[arg(short, long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Add a CID to the crawler queue
  #[command(visible_alias = "a")]
  Add {
    /// The CID to queue
    cid: String,
  },
  /// Start the crawler worker pool
  #[command(visible_alias = "c")]
  Crawl,
  /// Configuration management
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Write the default configuration to the --config file
  Generate,
  /// Validate the effective configuration
  Check,
  /// Print the effective configuration to stdout
  Dump,
}

/// First signal cancels gracefully; a second one force-exits.
fn watch_signals(cancel: CancellationToken) {
  tokio::spawn(async move {
    wait_for_signal().await;
    warn!("shutdown signal received, finishing up (send again to force quit)");
    cancel.cancel();

    wait_for_signal().await;
    error!("second shutdown signal, exiting immediately");
    std::process::exit(1);
  });
}

#[cfg(unix)]
async fn wait_for_signal() {
  use tokio::signal::unix::{SignalKind, signal};

  let mut terminate = match signal(SignalKind::terminate()) {
    Ok(terminate) => terminate,
    Err(e) => {
      error!(error = %e, "cannot install SIGTERM handler");
      let _ = tokio::signal::ctrl_c().await;
      return;
    }
  };

  tokio::select! {
    _ = tokio::signal::ctrl_c() => {}
    _ = terminate.recv() => {}
  }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
  let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
  init_logging();

  let cli = Cli::parse();
  let config_file = cli.config.as_deref();

  match cli.command {
    Commands::Add { cid } => {
      let cancel = CancellationToken::new();
      watch_signals(cancel.clone());
      cmd_add(config_file, &cid).await
    }
    Commands::Crawl => {
      let cancel = CancellationToken::new();
      watch_signals(cancel.clone());
      cmd_crawl(config_file, cancel).await
    }
    Commands::Config { command } => cmd_config(config_file, command).await,
  }
}
