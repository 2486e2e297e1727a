//! ClipMirror - clipboard mirroring between paired devices
//!
//! This is the main entry point for the `clipmirror` binary.

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipmirror::cli::{Cli, CliHandler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let handler = CliHandler::new(cli.config.clone())?;

    // Initialize logging
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        handler.config().log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipmirror={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!("ClipMirror v{}", clipmirror::VERSION);

    handler.handle_command(cli.command).await
}
