//! tib-daemon entry point.
//!
//! Thin by design: parses the CLI, loads config, builds the connection
//! pool, and hands off to `Supervisor`. All decision logic lives in
//! `tib-core`; all I/O plumbing lives in `tib-db` and `supervisor.rs`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tib_daemon::config::{load_layered_yaml, AppConfig};
use tib_daemon::supervisor::{run_retention_cycle, Supervisor};
use tracing::info;

#[derive(Parser)]
#[command(name = "tib-daemon", about = "Telemetry ingestion bridge daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: connect to the broker, ingest, enforce retention.
    Run {
        #[arg(long, default_value = "config/base.yaml")]
        config: Vec<String>,
    },
    /// Run a single retention sweep against the store, then exit.
    Cleanup {
        #[arg(long, default_value = "config/base.yaml")]
        config: Vec<String>,
    },
    /// Probe the database connection and exit 0/1.
    Health {
        #[arg(long, default_value = "config/base.yaml")]
        config: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Cleanup { config } => cleanup(&config).await,
        Command::Health { config } => health(&config).await,
    }
}

async fn run(config_paths: &[String]) -> anyhow::Result<()> {
    let loaded = load_config(config_paths)?;
    info!(config_hash = %loaded.config_hash, "starting tib-daemon");
    let pool = connect(&loaded.config).await?;
    let supervisor = Supervisor::new(loaded.config, pool).await?;
    supervisor.run().await
}

async fn cleanup(config_paths: &[String]) -> anyhow::Result<()> {
    let loaded = load_config(config_paths)?;
    let pool = connect(&loaded.config).await?;
    tib_db::migrate(&pool).await.context("migration failed")?;
    let port = tib_db::PgPersistence::new(pool);
    let clock = tib_core::clock::SystemClock;
    info!("running one-off retention sweep");
    run_retention_cycle(&port, &clock, &loaded.config.retention).await;
    Ok(())
}

async fn health(config_paths: &[String]) -> anyhow::Result<()> {
    let loaded = load_config(config_paths)?;
    match connect(&loaded.config).await {
        Ok(pool) => {
            sqlx::query("select 1").execute(&pool).await.context("health probe query failed")?;
            info!("health check ok");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            std::process::exit(1);
        }
    }
}

fn load_config(paths: &[String]) -> anyhow::Result<tib_daemon::config::LoadedConfig> {
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_layered_yaml(&refs).with_context(|| format!("failed to load config from {refs:?}"))?;
    info!(config_hash = %loaded.config_hash, "loaded configuration");
    Ok(loaded)
}

async fn connect(config: &AppConfig) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(config.postgres.pool_max)
        .min_connections(config.postgres.pool_min)
        .connect(&config.postgres.connection_url())
        .await
        .context("failed to connect to postgres")
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
