//! promstore client process
//!
//! Starts a storage client against the configured database, verifies it is
//! reachable and runs until interrupted.
//!
//! # Configuration
//!
//! Settings come from the TOML file given with `--config` (defaults when
//! omitted), then environment overrides: `PROMSTORE_DB_URL`,
//! `PROMSTORE_DB_MAX_CONNECTIONS`, `PROMSTORE_READ_ONLY`, `RUST_LOG`.
//!
//! # Commands
//!
//! - `start` - run the client (default)
//! - `check-config` - validate the configuration and exit

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

use promstore::store::postgres::schema_lock_hook;
use promstore::{Client, Config, InstanceId};

#[derive(Parser)]
#[command(name = "promstore")]
#[command(version)]
#[command(about = "Prometheus remote-storage client over PostgreSQL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "PROMSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Reject writes; no ingestion workers are started
    #[arg(long, global = true)]
    read_only: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client (default)
    Start,

    /// Validate configuration without connecting
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<Config, String> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file_with_env(&path.to_string_lossy())?,
        None => Config::from_env(),
    };
    if cli.read_only {
        config.read_only = true;
    }
    Ok(config)
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler installation failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if matches!(cli.command, Some(Commands::CheckConfig)) {
        config.validate()?;
        println!("configuration is valid");
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let instance_id = InstanceId::generate();
    info!(%instance_id, "starting promstore v{}", env!("CARGO_PKG_VERSION"));

    let client = Client::builder(config)
        .instance_id(instance_id)
        .connect_hook(schema_lock_hook())
        .build()
        .await
        .map_err(|e| {
            error!(error = %e, "starting client");
            e
        })?;

    if let Err(e) = client.health_check().await {
        warn!(error = %e, "initial health check failed");
    }

    shutdown_signal().await;
    client.close().await;
    Ok(())
}
