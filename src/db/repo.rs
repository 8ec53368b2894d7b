use super::model::VehicleSummary;
use crate::model::{NormalizedSample, Position};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open sample store at {normalized}"))?;
    // WAL plus full sync: a stored sample must survive a crash.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expands a leading `~/` in file-backed SQLite URLs, creates the parent
/// directory and asks SQLite to create the file. In-memory and non-sqlite
/// URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{path}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Point lookup on the dedup key.
#[instrument(skip(pool))]
pub async fn sample_exists(pool: &Pool, vehicle_id: i64, observed_at: NaiveDateTime) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM samples WHERE vehicle_id = ? AND observed_at = ? LIMIT 1",
    )
    .bind(vehicle_id)
    .bind(observed_at)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

/// Appends one sample. Returns `false` when the unique index already holds
/// a row for (`vehicle_id`, `observed_at`); existing rows are never touched.
#[instrument(skip_all, fields(vehicle_id = sample.vehicle_id))]
pub async fn insert_sample(pool: &Pool, sample: &NormalizedSample) -> Result<bool> {
    let (longitude, latitude) = match sample.position {
        Some(p) => (Some(p.longitude), Some(p.latitude)),
        None => (None, None),
    };
    let res = sqlx::query(
        "INSERT INTO samples (\
            vehicle_id, observed_at, vehicle_number, previous_observed_at, \
            last_notification_sent_at, dispatch_at, longitude, latitude, \
            speed, fuel, odometer, distance, average_speed, \
            eta_time, eta_time_alt, eta_old_time, eta_old_time_alt, \
            ignition, aux1, digital_input_4, air_conditioning, route_flag, route_flag_alt, \
            direction_from, direction_to, eta_route_name, eta_route, \
            notification_sent, compliance_sent, temperature, \
            track_id, company_id, route_no, waybill_no, waypoint_no, last_waypoint_id, token, \
            city, image_path\
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (vehicle_id, observed_at) DO NOTHING",
    )
    .bind(sample.vehicle_id)
    .bind(sample.observed_at)
    .bind(&sample.vehicle_number)
    .bind(sample.previous_observed_at)
    .bind(sample.last_notification_sent_at)
    .bind(sample.dispatch_at)
    .bind(longitude)
    .bind(latitude)
    .bind(sample.speed)
    .bind(sample.fuel)
    .bind(sample.odometer)
    .bind(sample.distance)
    .bind(sample.average_speed)
    .bind(sample.eta_time)
    .bind(sample.eta_time_alt)
    .bind(sample.eta_old_time)
    .bind(sample.eta_old_time_alt)
    .bind(sample.ignition)
    .bind(sample.aux1)
    .bind(sample.digital_input_4)
    .bind(sample.air_conditioning)
    .bind(sample.route_flag)
    .bind(sample.route_flag_alt)
    .bind(&sample.direction_from)
    .bind(&sample.direction_to)
    .bind(&sample.eta_route_name)
    .bind(&sample.eta_route)
    .bind(&sample.notification_sent)
    .bind(&sample.compliance_sent)
    .bind(&sample.temperature)
    .bind(sample.track_id)
    .bind(sample.company_id)
    .bind(sample.route_no)
    .bind(sample.waybill_no)
    .bind(sample.waypoint_no)
    .bind(sample.last_waypoint_id)
    .bind(sample.token)
    .bind(&sample.city)
    .bind(&sample.image_path)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn count_samples(pool: &Pool, vehicle_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM samples WHERE vehicle_id = ?")
        .bind(vehicle_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_all_samples(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM samples")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Newest-first slice of one vehicle's partition.
#[instrument(skip_all)]
pub async fn vehicle_samples(pool: &Pool, vehicle_id: i64, limit: i64) -> Result<Vec<NormalizedSample>> {
    let rows = sqlx::query(
        "SELECT * FROM samples WHERE vehicle_id = ? ORDER BY observed_at DESC LIMIT ?",
    )
    .bind(vehicle_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(sample_from_row).collect()
}

#[instrument(skip_all)]
pub async fn vehicle_summaries(pool: &Pool) -> Result<Vec<VehicleSummary>> {
    let rows = sqlx::query(
        "SELECT s.vehicle_id, COUNT(*) AS samples, \
                MIN(s.observed_at) AS first_observed_at, MAX(s.observed_at) AS last_observed_at, \
                (SELECT l.vehicle_number FROM samples l WHERE l.vehicle_id = s.vehicle_id \
                 ORDER BY l.observed_at DESC LIMIT 1) AS vehicle_number \
         FROM samples s GROUP BY s.vehicle_id ORDER BY s.vehicle_id",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(VehicleSummary {
                vehicle_id: row.try_get("vehicle_id")?,
                vehicle_number: row
                    .try_get::<Option<String>, _>("vehicle_number")?
                    .unwrap_or_default(),
                samples: row.try_get("samples")?,
                first_observed_at: parse_stored_time(&row, "first_observed_at")?,
                last_observed_at: parse_stored_time(&row, "last_observed_at")?,
            })
        })
        .collect()
}

// Aggregates come back as plain TEXT, so decode them the way sqlx writes them.
fn parse_stored_time(row: &SqliteRow, column: &str) -> Result<NaiveDateTime> {
    let raw: String = row.try_get(column)?;
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
        .with_context(|| format!("bad stored timestamp {raw:?} in {column}"))
}

fn sample_from_row(row: &SqliteRow) -> Result<NormalizedSample> {
    let longitude: Option<f64> = row.try_get("longitude")?;
    let latitude: Option<f64> = row.try_get("latitude")?;
    let position = match (longitude, latitude) {
        (Some(longitude), Some(latitude)) => Some(Position { longitude, latitude }),
        _ => None,
    };

    Ok(NormalizedSample {
        vehicle_id: row.try_get("vehicle_id")?,
        vehicle_number: row.try_get("vehicle_number")?,
        observed_at: row.try_get("observed_at")?,
        previous_observed_at: row.try_get("previous_observed_at")?,
        last_notification_sent_at: row.try_get("last_notification_sent_at")?,
        dispatch_at: row.try_get("dispatch_at")?,
        position,
        speed: row.try_get("speed")?,
        fuel: row.try_get("fuel")?,
        odometer: row.try_get("odometer")?,
        distance: row.try_get("distance")?,
        average_speed: row.try_get("average_speed")?,
        eta_time: row.try_get("eta_time")?,
        eta_time_alt: row.try_get("eta_time_alt")?,
        eta_old_time: row.try_get("eta_old_time")?,
        eta_old_time_alt: row.try_get("eta_old_time_alt")?,
        ignition: row.try_get("ignition")?,
        aux1: row.try_get("aux1")?,
        digital_input_4: row.try_get("digital_input_4")?,
        air_conditioning: row.try_get("air_conditioning")?,
        route_flag: row.try_get("route_flag")?,
        route_flag_alt: row.try_get("route_flag_alt")?,
        direction_from: row.try_get("direction_from")?,
        direction_to: row.try_get("direction_to")?,
        eta_route_name: row.try_get("eta_route_name")?,
        eta_route: row.try_get("eta_route")?,
        notification_sent: row.try_get("notification_sent")?,
        compliance_sent: row.try_get("compliance_sent")?,
        temperature: row.try_get("temperature")?,
        track_id: row.try_get("track_id")?,
        company_id: row.try_get("company_id")?,
        route_no: row.try_get("route_no")?,
        waybill_no: row.try_get("waybill_no")?,
        waypoint_no: row.try_get("waypoint_no")?,
        last_waypoint_id: row.try_get("last_waypoint_id")?,
        token: row.try_get("token")?,
        city: row.try_get("city")?,
        image_path: row.try_get("image_path")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::parse_timestamp;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample(vehicle_id: i64, at: &str) -> NormalizedSample {
        NormalizedSample {
            vehicle_id,
            vehicle_number: format!("MH04-{vehicle_id}"),
            observed_at: parse_timestamp(at).unwrap(),
            previous_observed_at: None,
            last_notification_sent_at: None,
            dispatch_at: parse_timestamp("2024-01-01 06:00:00"),
            position: Some(Position { longitude: 72.9, latitude: 19.2 }),
            speed: 31.5,
            fuel: 0.0,
            odometer: 1200.0,
            distance: 0.0,
            average_speed: 0.0,
            eta_time: 0.0,
            eta_time_alt: 0.0,
            eta_old_time: 0.0,
            eta_old_time_alt: 0.0,
            ignition: true,
            aux1: false,
            digital_input_4: false,
            air_conditioning: true,
            route_flag: false,
            route_flag_alt: Some(1),
            direction_from: "Thane".into(),
            direction_to: "Borivali".into(),
            eta_route_name: String::new(),
            eta_route: String::new(),
            notification_sent: None,
            compliance_sent: Some("1".into()),
            temperature: None,
            track_id: Some(9),
            company_id: None,
            route_no: Some(44),
            waybill_no: None,
            waypoint_no: None,
            last_waypoint_id: None,
            token: None,
            city: None,
            image_path: None,
        }
    }

    #[test]
    fn sqlite_url_preparation() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x/y"), "postgres://x/y");
        let td = tempfile::tempdir().unwrap();
        let file = td.path().join("nested").join("t.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}", file.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", file.display()));
        assert!(file.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn insert_then_lookup() {
        let pool = setup_pool().await;
        let s = sample(101, "2024-01-01 10:00:00");

        assert!(!sample_exists(&pool, 101, s.observed_at).await.unwrap());
        assert!(insert_sample(&pool, &s).await.unwrap());
        assert!(sample_exists(&pool, 101, s.observed_at).await.unwrap());
        assert!(!sample_exists(&pool, 102, s.observed_at).await.unwrap());

        let stored = vehicle_samples(&pool, 101, 10).await.unwrap();
        assert_eq!(stored, vec![s]);
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let pool = setup_pool().await;
        let first = sample(101, "2024-01-01 10:00:00");
        let mut second = first.clone();
        second.speed = 99.0;

        assert!(insert_sample(&pool, &first).await.unwrap());
        assert!(!insert_sample(&pool, &second).await.unwrap());
        assert_eq!(count_samples(&pool, 101).await.unwrap(), 1);
        let stored = vehicle_samples(&pool, 101, 10).await.unwrap();
        assert_eq!(stored[0].speed, 31.5);
    }

    #[tokio::test]
    async fn summaries_per_vehicle() {
        let pool = setup_pool().await;
        for (vid, at) in [
            (7, "2024-01-01 10:00:00"),
            (7, "2024-01-01 10:00:10"),
            (3, "2024-01-01 09:59:00"),
        ] {
            insert_sample(&pool, &sample(vid, at)).await.unwrap();
        }

        let summaries = vehicle_summaries(&pool).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].vehicle_id, 3);
        assert_eq!(summaries[1].samples, 2);
        assert_eq!(summaries[1].vehicle_number, "MH04-7");
        assert_eq!(
            summaries[1].last_observed_at,
            parse_timestamp("2024-01-01 10:00:10").unwrap()
        );
        assert_eq!(count_all_samples(&pool).await.unwrap(), 3);

        let newest = vehicle_samples(&pool, 7, 1).await.unwrap();
        assert_eq!(newest[0].observed_at, parse_timestamp("2024-01-01 10:00:10").unwrap());
    }
}
