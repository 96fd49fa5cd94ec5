//! autoheal: closed-loop anomaly detection and remediation engine.
//!
//! Wires telemetry, the orchestrator and the metrics exporter, then runs
//! detection cycles until interrupted.

use autoheal_agents::Orchestrator;
use autoheal_core::config::AppConfig;
use autoheal_core::ports::{SnapshotTelemetry, TelemetrySource};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "autoheal")]
#[command(about = "Closed-loop anomaly detection and automated remediation")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "AUTOHEAL_CONFIG")]
    config: Option<String>,

    /// Plan and log remediations without mutating anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Run a single detection cycle, print its report and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// JSON telemetry snapshot served as the telemetry source
    #[arg(long, env = "AUTOHEAL_TELEMETRY_FILE")]
    telemetry_file: Option<String>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "AUTOHEAL__METRICS__PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autoheal=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if cli.dry_run {
        config.remediation.dry_run = true;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        dry_run = config.remediation.dry_run,
        remediation_enabled = config.remediation.enabled,
        interval_secs = config.orchestrator.check_interval_seconds,
        "Configuration loaded"
    );

    let telemetry: Arc<dyn TelemetrySource> = match &cli.telemetry_file {
        Some(path) => Arc::new(SnapshotTelemetry::from_json_file(path)?),
        None => {
            warn!("No telemetry source configured, serving an empty snapshot");
            Arc::new(SnapshotTelemetry::default())
        }
    };

    let orchestrator = Orchestrator::from_config(config.clone(), telemetry)?;

    if cli.once {
        let learned = orchestrator.relearn_now().await?;
        info!(count = learned, "Baselines learned");
        let report = orchestrator.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);
        return Ok(());
    }

    if let Err(e) = start_metrics(config.metrics.port) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("autoheal is running");
    orchestrator.run(shutdown_rx).await;
    info!(status = ?orchestrator.status(), "autoheal stopped");
    Ok(())
}

fn start_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
        .install()?;
    info!(port = port, "Metrics exporter started");
    Ok(())
}
