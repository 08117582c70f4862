//! Sluice CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sluice_config::{load_config, load_from_file, validate_config, LoggingConfig};
use sluice_runtime::{GatewayBuilder, SignalHandler};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Pipelined HTTP forwarding proxy", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the gateway (start the server)
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "sluice.yaml")]
        config: PathBuf,

        /// Log level (trace, debug, info, warn, error); overrides the config
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "sluice.yaml")]
        config: PathBuf,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config: path, log_level } => {
            let config = load_from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;

            let mut logging = config.observability.logging.clone();
            if let Some(level) = log_level {
                logging.level = level;
            }
            init_tracing(&logging)?;

            tracing::info!("Config file: {}", path.display());
            validate_config(&config).context("invalid configuration")?;

            tracing::info!(
                listen = %config.gateway.listen,
                base = %config.proxy.base,
                pipelining = config.proxy.pool.pipelining,
                connections = config.proxy.pool.connections,
                "Configuration loaded"
            );

            let gateway = GatewayBuilder::new().config(config).build()?;

            let shutdown_signal = gateway.shutdown_signal();
            tokio::spawn(async move {
                SignalHandler::new(shutdown_signal).run().await;
            });

            gateway.run().await?;

            let stats = serde_json::to_string(&gateway.proxy().stats())?;
            tracing::info!(%stats, "Final proxy statistics");
            Ok(())
        }

        Commands::Validate { config } => {
            tracing_subscriber::fmt().with_target(false).init();

            tracing::info!("Validating configuration: {}", config.display());

            match load_config(&config) {
                Ok(cfg) => {
                    tracing::info!("Configuration is valid");
                    tracing::info!("  Listen: {}", cfg.gateway.listen);
                    tracing::info!("  Upstream: {}", cfg.proxy.base);
                    tracing::info!(
                        "  Pool: pipelining={} connections={} request_timeout={:?}",
                        cfg.proxy.pool.pipelining,
                        cfg.proxy.pool.connections,
                        cfg.proxy.pool.request_timeout
                    );
                    if let Some(prefix) = &cfg.gateway.strip_prefix {
                        tracing::info!("  Mount prefix: {}", prefix);
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("Configuration validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("sluice");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let level = match logging.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_level(true);

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(layer.json()).try_init()?;
    } else {
        registry.with(layer).try_init()?;
    }

    Ok(())
}
