//! Main entry point for the binary daemon
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use mncon::config;
use mncon::ConnectorServer;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// MongoDB-NATS JetStream Connector Daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (YAML)
    #[arg(short, long, env = "CONFIG_FILE", default_value = "connector.yaml")]
    config: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = config::load(&cli.config)?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_env("MNCON_LOG")
                .unwrap_or_else(|_| EnvFilter::new(&settings.log.level)),
        )
        .init();

    let server = ConnectorServer::new(settings);
    server.serve().await?;

    // The daemon runs until signalled; every exit, including a clean drain
    // after SIGINT/SIGTERM, is reported as a failure.
    tracing::error!("exiting");
    Ok(ExitCode::FAILURE)
}
