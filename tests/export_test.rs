use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use fleet_ingest::export::{run_export, ExportPlan, RouteSource};

#[derive(Clone, Default)]
struct RecordingRoutes {
    detail_calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl RouteSource for RecordingRoutes {
    async fn waypoints(&self) -> Result<String> {
        Ok(r#"{"status":"1","data":[
            {"WpointName":"Thane Station","WPointNo":"11","Longitude":"72.97","Latitude":"19.18"},
            {"WpointName":"Thane Station","WPointNo":"11","Longitude":"72.97","Latitude":"19.18"},
            {"WpointName":"Nowhere","WPointNo":"12","Longitude":"abc","Latitude":"19.1"},
            {"WpointName":"Majiwada","WPointNo":"13","Longitude":"72.98","Latitude":"19.21"}
        ]}"#
        .to_string())
    }

    async fn route_master(&self) -> Result<String> {
        Ok(r#"{"data":[
            {"RouteNo":"5","RouteName":"Station - Majiwada","RouteNum":"44"},
            {"RouteNo":"6","RouteName":"Broken","RouteNum":"45"},
            {"RouteNo":"5","RouteName":"Station - Majiwada","RouteNum":"44"}
        ]}"#
        .to_string())
    }

    async fn route_details(&self, route_no: &str) -> Result<String> {
        self.detail_calls.lock().await.push(route_no.to_string());
        if route_no == "6" {
            return Err(anyhow!("upstream error 500"));
        }
        Ok(format!(r#"{{"RouteNo":"{route_no}","stops":[]}}"#))
    }
}

#[tokio::test]
async fn export_writes_stops_and_route_details() {
    let td = tempfile::tempdir().unwrap();
    let source = RecordingRoutes::default();
    let plan = ExportPlan {
        out_dir: td.path(),
        operator: "Thane Municipal Transport",
        route_delay: Duration::from_millis(1),
    };

    let summary = run_export(&source, &plan).await.unwrap();
    assert_eq!(summary.stops, 2);
    assert_eq!(summary.routes_written, 1);
    assert_eq!(summary.routes_failed, 1);

    let geojson: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(plan.stops_path()).unwrap()).unwrap();
    assert_eq!(geojson["type"], "FeatureCollection");
    let features = geojson["features"].as_array().unwrap();
    assert_eq!(features.len(), 2);
    assert_eq!(features[0]["properties"]["ref"], "11");
    assert_eq!(features[0]["properties"]["public_transport"], "platform");
    assert_eq!(features[1]["geometry"]["coordinates"][1], 19.21);

    let detail = std::fs::read_to_string(plan.routes_dir().join("route-5-44.json")).unwrap();
    assert!(detail.contains(r#""RouteNo":"5""#));
    assert!(!plan.routes_dir().join("route-6-45.json").exists());

    // Duplicate route numbers are requested once.
    assert_eq!(*source.detail_calls.lock().await, vec!["5".to_string(), "6".to_string()]);
}
