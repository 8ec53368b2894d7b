use anyhow::Result;
use clap::Parser;
use fleet_ingest::config;
use fleet_ingest::export::{run_export, ApiRouteSource, ExportPlan};
use fleet_ingest::upstream::TrackingClient;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(about = "Export stops as GeoJSON and fetch per-route details")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output directory (defaults to <data_dir>/export)
    #[arg(long)]
    out: Option<PathBuf>,
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
    let out_dir = args.out.unwrap_or_else(|| cfg.export_dir());

    let client = TrackingClient::from_config(&cfg.upstream)?;
    let source = ApiRouteSource::new(client, cfg.export.clone());
    let plan = ExportPlan {
        out_dir: &out_dir,
        operator: &cfg.export.operator,
        route_delay: Duration::from_millis(cfg.export.route_request_delay_ms),
    };

    let summary = run_export(&source, &plan).await?;
    info!(
        stops = summary.stops,
        routes_written = summary.routes_written,
        routes_failed = summary.routes_failed,
        "export finished"
    );
    println!("Wrote {}", plan.stops_path().display());
    println!("Route details in {}", plan.routes_dir().display());
    Ok(())
}
