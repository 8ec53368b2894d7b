use anyhow::Result;
use clap::Parser;
use fleet_ingest::config;
use fleet_ingest::db;
use fleet_ingest::governor::RateGovernor;
use fleet_ingest::ingest::{IngestOptions, Ingestor};
use fleet_ingest::store::SqliteStore;
use fleet_ingest::upstream::TrackingClient;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Stop after this many poll cycles
    #[arg(long)]
    max_cycles: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool, Duration::from_secs(cfg.store.op_timeout_secs));

    let source = TrackingClient::from_config(&cfg.upstream)?;
    let governor = RateGovernor::from_config(&cfg.ingest);
    let options = IngestOptions {
        max_cycles: args.max_cycles,
        ..IngestOptions::from_config(&cfg)
    };

    info!(source = ?source, floor = cfg.ingest.quota_floor, "starting ingestion");
    let mut ingestor = Ingestor::new(source, store, governor, options);
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    match ingestor.run(shutdown).await {
        Ok(stats) => {
            info!(
                cycles = stats.cycles,
                failed_cycles = stats.failed_cycles,
                inserted = stats.inserted,
                already_stored = stats.already_stored,
                rejected = stats.rejected,
                backoff_waits = stats.backoff_waits,
                quota_alarms = stats.quota_alarms,
                "ingestion stopped"
            );
            Ok(())
        }
        Err(err) => {
            error!(%err, "ingestion aborted");
            Err(err.into())
        }
    }
}
