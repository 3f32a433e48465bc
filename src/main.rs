//! Zola Telemetry - standalone pipeline service
//!
//! Runs the telemetry pipeline with its dashboard and admin HTTP API, or
//! validates a configuration file.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info, warn};
use zola_telemetry::{
    config::apply_env_overrides, init_with_config, load_config, InitConfig, Pipeline, PipelineConfig,
    TelemetryServer,
};

/// Zola Telemetry - traces, logs, metrics, errors and alert notifications
#[derive(Parser)]
#[command(name = "zola-telemetry")]
#[command(about = "In-process telemetry pipeline with a dashboard and admin API")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Set the log filter (e.g. "info" or "info,zola_telemetry=debug")
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path (TOML)
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline and serve the HTTP API
    Serve {
        /// Address to bind the HTTP API to
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("zola-telemetry {}", zola_telemetry::VERSION);
            println!("{}", env!("CARGO_PKG_DESCRIPTION"));
            Ok(())
        }
        Some(Commands::Validate) => {
            let config = load_configuration(cli.config_file.as_deref())?;
            validate_configuration(&config)
        }
        Some(Commands::Serve { listen }) => serve(cli.config_file.as_deref(), &cli.log_level, listen).await,
        None => serve(cli.config_file.as_deref(), &cli.log_level, ([0, 0, 0, 0], 8080).into()).await,
    }
}

fn load_configuration(config_file: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let mut config = match config_file {
        Some(path) => load_config(path)?,
        None => PipelineConfig::default(),
    };
    let rejected = apply_env_overrides(&mut config);
    if !rejected.is_empty() {
        // The subscriber may not be installed yet
        eprintln!("Ignoring unparseable environment overrides: {}", rejected.join(", "));
    }
    config.validate()?;
    Ok(config)
}

fn validate_configuration(config: &PipelineConfig) -> anyhow::Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid");
            println!("  enabled: {}", config.enabled);
            println!("  tracing.sample_rate: {}", config.tracing.sample_rate);
            println!("  metrics.retention_secs: {}", config.metrics.retention_secs);
            println!("  logs.max_entries: {}", config.logs.max_entries);
            println!("  notifications.max_attempts: {}", config.notifications.max_attempts);
            println!("  dispatcher.queue_capacity: {}", config.dispatcher.queue_capacity);
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Configuration validation failed: {}", e)),
    }
}

async fn serve(config_file: Option<&Path>, log_level: &str, listen: SocketAddr) -> anyhow::Result<()> {
    let config = load_configuration(config_file)?;
    let capture_logs = config.logs.capture_tracing_events;
    let pipeline = Pipeline::new(config)?;

    let init = InitConfig {
        log_filter: log_level.to_string(),
        enable_metrics: true,
    };
    let index = capture_logs.then(|| pipeline.logs());
    let prometheus = match init_with_config(init, index) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Fatal: failed to initialize logging: {}. Exiting.", e);
            return Err(anyhow::anyhow!("initialization failed: {}", e));
        }
    };

    pipeline.start()?;
    info!(%listen, enabled = pipeline.is_enabled(), "Zola telemetry starting");

    let mut server = TelemetryServer::new(pipeline.clone(), listen);
    if let Some(handle) = prometheus {
        server = server.with_prometheus(handle);
    }
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for the shutdown signal, shutting down now");
    }
    info!("Shutdown signal received, stopping pipeline");

    pipeline.shutdown().await;
    let _ = stop_tx.send(());
    if let Err(e) = server_handle.await {
        error!(error = %e, "HTTP server task failed");
    }
    info!("Zola telemetry stopped");
    Ok(())
}
