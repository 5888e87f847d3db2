//! Tessera maintenance operator binary
//!
//! Subcommands:
//! - `gc`: run metadata garbage collection against the database
//! - `migrate`: apply metabase migrations
//! - `config`: print the effective configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tessera_maintenance::{metrics, MaintenanceConfig};
use tessera_metabase::{GcChore, MetabaseGc, PostgresMetabase};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tessera-maintenance")]
#[command(about = "Tessera segment repair and metadata garbage collection")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, global = true, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL (overrides file and environment)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Prometheus exporter port
    #[arg(long, global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Delete expired and zombie objects
    Gc {
        /// Run both passes once and exit
        #[arg(long)]
        once: bool,

        /// Objects per page
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Apply metabase migrations
    Migrate,
    /// Print the effective configuration as TOML
    Config,
}

impl Cli {
    fn apply(&self, config: &mut MaintenanceConfig) {
        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if self.log_json {
            config.logging.json = true;
        }
        if let Some(port) = self.metrics_port {
            config.metrics.port = port;
        }
        if let Command::Gc {
            batch_size: Some(batch_size),
            ..
        } = self.command
        {
            config.gc.batch_size = batch_size;
        }
    }
}

fn init_tracing(config: &MaintenanceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

async fn run_gc(config: MaintenanceConfig, once: bool) -> anyhow::Result<()> {
    if config.metrics.enabled {
        metrics::init_metrics(config.metrics.port)
            .context("Failed to install Prometheus exporter")?;
        info!(port = config.metrics.port, "Metrics exporter listening");
    }

    let store = PostgresMetabase::connect(&config.database)
        .await
        .context("Failed to connect to metabase")?;

    let cancel = CancellationToken::new();
    let gc = MetabaseGc::new(Arc::new(store)).with_cancellation(cancel.clone());
    let chore = GcChore::new(gc, config.gc.clone());

    if once {
        let run = chore.run_once().await?;
        for report in [run.expired, run.zombie].into_iter().flatten() {
            info!(
                pass = %report.pass,
                batches = report.batches,
                deleted = report.objects_deleted,
                segments = report.segments_deleted,
                failures = report.failures.len(),
                "GC pass finished"
            );
        }
        return Ok(());
    }

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            cancel.cancel();
        }
    });

    chore.run(cancel).await?;
    info!("GC chore stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = MaintenanceConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    cli.apply(&mut config);

    init_tracing(&config);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    match cli.command {
        Command::Gc { once, .. } => {
            info!(
                interval = ?config.gc.interval(),
                batch_size = config.gc.batch_size,
                once,
                "Starting metadata GC"
            );
            run_gc(config, once).await
        }
        Command::Migrate => {
            let store = PostgresMetabase::connect(&config.database)
                .await
                .context("Failed to connect to metabase")?;
            store.migrate().await?;
            Ok(())
        }
        Command::Config => {
            if config.identity.secret_key_hex.is_some() {
                config.identity.secret_key_hex = Some("<redacted>".to_string());
            }
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
