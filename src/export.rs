//! Stop and route exporter.
//!
//! Writes the stop list as a GeoJSON FeatureCollection and keeps the raw
//! per-route detail documents next to it. Runs once and shares nothing with
//! the ingestion loop. The set of already-emitted references is a plain
//! value threaded through each step and dropped at the end of the run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::config;
use crate::model::Loose;
use crate::upstream::TrackingClient;

/// References already emitted during one export run.
pub type SeenRefs = HashSet<String>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Waypoint {
    #[serde(rename = "WpointName")]
    pub name: Loose,
    #[serde(rename = "WpointNameEng")]
    pub name_en: Loose,
    #[serde(rename = "WPointNo")]
    pub number: Loose,
    #[serde(rename = "Longitude")]
    pub longitude: Loose,
    #[serde(rename = "Latitude")]
    pub latitude: Loose,
    #[serde(rename = "group_type")]
    pub group_type: Loose,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Route {
    #[serde(rename = "RouteNo")]
    pub number: Loose,
    #[serde(rename = "RouteName")]
    pub name: Loose,
    #[serde(rename = "RouteNum")]
    pub public_number: Loose,
    #[serde(rename = "RouteDirection")]
    pub direction: Loose,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<Vec<T>>,
}

fn parse_list<T: for<'de> Deserialize<'de>>(body: &str, what: &str) -> Result<Vec<T>> {
    let env: Envelope<T> =
        serde_json::from_str(body).with_context(|| format!("malformed {what} response"))?;
    Ok(env.data.unwrap_or_default())
}

pub fn parse_waypoints(body: &str) -> Result<Vec<Waypoint>> {
    parse_list(body, "waypoint")
}

pub fn parse_routes(body: &str) -> Result<Vec<Route>> {
    parse_list(body, "route master")
}

fn coordinate(value: &Loose) -> Option<f64> {
    value
        .scalar()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Builds one Point feature per waypoint not yet in `seen`. Waypoints with
/// unusable coordinates are skipped.
pub fn stop_features(waypoints: &[Waypoint], operator: &str, mut seen: SeenRefs) -> (Vec<Value>, SeenRefs) {
    let mut features = Vec::with_capacity(waypoints.len());
    for wp in waypoints {
        let reference = wp.number.to_text().unwrap_or_default();
        let (Some(lon), Some(lat)) = (coordinate(&wp.longitude), coordinate(&wp.latitude)) else {
            warn!(reference = %reference, "skipping waypoint with bad coordinates");
            continue;
        };
        if !reference.is_empty() && !seen.insert(reference.clone()) {
            continue;
        }
        features.push(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [lon, lat] },
            "properties": {
                "name": wp.name.to_text().unwrap_or_default(),
                "ref": reference,
                "highway": "bus_stop",
                "operator": operator,
                "public_transport": "platform",
            }
        }));
    }
    (features, seen)
}

pub fn feature_collection(features: Vec<Value>) -> Value {
    json!({ "type": "FeatureCollection", "features": features })
}

/// A route detail request still to be made, with the file it lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteJob {
    pub route_no: String,
    pub file_name: String,
}

/// One job per distinct route number not yet in `seen`.
pub fn plan_routes(routes: &[Route], mut seen: SeenRefs) -> (Vec<RouteJob>, SeenRefs) {
    let mut jobs = Vec::new();
    for route in routes {
        let Some(route_no) = route.number.to_text() else {
            warn!("skipping route without RouteNo");
            continue;
        };
        if !seen.insert(route_no.clone()) {
            continue;
        }
        let public = route.public_number.to_text().unwrap_or_default();
        let file_name = format!("route-{}-{}.json", sanitize(&route_no), sanitize(&public));
        jobs.push(RouteJob { route_no, file_name });
    }
    (jobs, seen)
}

fn sanitize(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn waypoints(&self) -> Result<String>;
    async fn route_master(&self) -> Result<String>;
    async fn route_details(&self, route_no: &str) -> Result<String>;
}

/// [`RouteSource`] backed by the tracking API.
#[derive(Debug, Clone)]
pub struct ApiRouteSource {
    client: TrackingClient,
    paths: config::Export,
}

impl ApiRouteSource {
    pub fn new(client: TrackingClient, paths: config::Export) -> Self {
        Self { client, paths }
    }
}

#[async_trait]
impl RouteSource for ApiRouteSource {
    async fn waypoints(&self) -> Result<String> {
        self.client.get_text(&self.paths.waypoints_path).await
    }

    async fn route_master(&self) -> Result<String> {
        self.client.get_text(&self.paths.route_master_path).await
    }

    async fn route_details(&self, route_no: &str) -> Result<String> {
        self.client
            .post_form(&self.paths.route_details_path, &[("RouteNo", route_no)])
            .await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub stops: usize,
    pub routes_written: usize,
    pub routes_failed: usize,
}

pub struct ExportPlan<'a> {
    pub out_dir: &'a Path,
    pub operator: &'a str,
    pub route_delay: Duration,
}

impl ExportPlan<'_> {
    pub fn stops_path(&self) -> PathBuf {
        self.out_dir.join("stops.geojson")
    }

    pub fn routes_dir(&self) -> PathBuf {
        self.out_dir.join("routes")
    }
}

/// Runs the full export. Stop and route-master failures abort; a failed
/// route detail request is logged and skipped.
pub async fn run_export(source: &dyn RouteSource, plan: &ExportPlan<'_>) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();
    tokio::fs::create_dir_all(plan.routes_dir())
        .await
        .with_context(|| format!("failed to create {}", plan.routes_dir().display()))?;

    let seen = SeenRefs::new();
    let waypoints = parse_waypoints(&source.waypoints().await.context("failed to fetch waypoints")?)?;
    let (features, _seen) = stop_features(&waypoints, plan.operator, seen);
    summary.stops = features.len();
    let doc = serde_json::to_vec_pretty(&feature_collection(features))?;
    tokio::fs::write(plan.stops_path(), doc)
        .await
        .with_context(|| format!("failed to write {}", plan.stops_path().display()))?;
    info!(stops = summary.stops, path = %plan.stops_path().display(), "stops exported");

    let routes = parse_routes(&source.route_master().await.context("failed to fetch route master")?)?;
    let (jobs, _seen) = plan_routes(&routes, SeenRefs::new());
    for (i, job) in jobs.iter().enumerate() {
        if i > 0 && !plan.route_delay.is_zero() {
            tokio::time::sleep(plan.route_delay).await;
        }
        match source.route_details(&job.route_no).await {
            Ok(body) => {
                let path = plan.routes_dir().join(&job.file_name);
                tokio::fs::write(&path, body)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                summary.routes_written += 1;
                info!(route = %job.route_no, done = i + 1, total = jobs.len(), "route exported");
            }
            Err(err) => {
                summary.routes_failed += 1;
                warn!(route = %job.route_no, error = %err, "route details unavailable");
            }
        }
    }

    Ok(summary)
}
