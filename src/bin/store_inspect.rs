use anyhow::Result;
use clap::Parser;
use fleet_ingest::config;
use fleet_ingest::db;
use std::path::PathBuf;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Show the most recent samples of one vehicle
    #[arg(long)]
    vehicle: Option<i64>,

    /// Number of samples to show with --vehicle
    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let Some(vehicle_id) = args.vehicle else {
        println!("Samples: {}", db::count_all_samples(&pool).await?);
        for v in db::vehicle_summaries(&pool).await? {
            println!(
                "  {:>6} {:<14} {:>7} samples  {} .. {}",
                v.vehicle_id, v.vehicle_number, v.samples, v.first_observed_at, v.last_observed_at
            );
        }
        return Ok(());
    };

    println!(
        "Vehicle {}: {} samples",
        vehicle_id,
        db::count_samples(&pool, vehicle_id).await?
    );
    for s in db::vehicle_samples(&pool, vehicle_id, args.limit).await? {
        let position = s
            .position
            .map(|p| format!("{:.6},{:.6}", p.latitude, p.longitude))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  pos={}  speed={}  ignition={}  route={}",
            s.observed_at,
            position,
            s.speed,
            s.ignition,
            s.route_no.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}
