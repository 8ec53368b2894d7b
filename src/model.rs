use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::borrow::Cow;

/// A loosely-typed upstream value. Upstream declares most fields as strings
/// but sends numbers, `null` or nested objects for some of them, so every
/// field is captured as-is here and collapsed by the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Loose {
    /// `null` or missing key.
    #[default]
    Absent,
    Text(String),
    Number(Number),
    Flag(bool),
    List(Vec<Value>),
    Object(Map<String, Value>),
}

impl Loose {
    pub fn text(s: impl Into<String>) -> Self {
        Loose::Text(s.into())
    }

    /// Scalar content as text. Blank strings, `null` and structured values
    /// yield `None`.
    pub fn scalar(&self) -> Option<Cow<'_, str>> {
        match self {
            Loose::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then_some(Cow::Borrowed(trimmed))
            }
            Loose::Number(n) => Some(Cow::Owned(n.to_string())),
            Loose::Flag(b) => Some(Cow::Owned(b.to_string())),
            Loose::Absent | Loose::List(_) | Loose::Object(_) => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        match self {
            Loose::Absent => true,
            Loose::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Text rendition kept for pass-through fields: scalars verbatim,
    /// structured values as compact JSON.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Loose::Text(s) if s.trim().is_empty() => None,
            Loose::Text(s) => Some(s.clone()),
            Loose::List(items) => serde_json::to_string(items).ok(),
            Loose::Object(map) => serde_json::to_string(map).ok(),
            other => other.scalar().map(Cow::into_owned),
        }
    }

    /// Look up a key when the value is a nested object.
    pub fn field(&self, key: &str) -> Loose {
        match self {
            Loose::Object(map) => map
                .get(key)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            _ => Loose::Absent,
        }
    }
}

/// One vehicle observation exactly as the tracking API sends it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSample {
    #[serde(rename = "idx_Trackid_pk")]
    pub track_id: Loose,
    #[serde(rename = "VehId")]
    pub vehicle_id: Loose,
    #[serde(rename = "CmpId")]
    pub company_id: Loose,
    #[serde(rename = "LastTrackdt")]
    pub last_track_time: Loose,
    #[serde(rename = "NCSent")]
    pub nc_sent: Loose,
    #[serde(rename = "CSent")]
    pub c_sent: Loose,
    #[serde(rename = "PrevTrackDt")]
    pub previous_track_time: Loose,
    #[serde(rename = "LastNCSentDate")]
    pub last_nc_sent_date: Loose,
    #[serde(rename = "Longitude")]
    pub longitude: Loose,
    #[serde(rename = "Latitude")]
    pub latitude: Loose,
    #[serde(rename = "City")]
    pub city: Loose,
    #[serde(rename = "Speed")]
    pub speed: Loose,
    #[serde(rename = "ImagePath")]
    pub image_path: Loose,
    #[serde(rename = "AC")]
    pub ac: Loose,
    #[serde(rename = "Ignition")]
    pub ignition: Loose,
    #[serde(rename = "AUX1")]
    pub aux1: Loose,
    #[serde(rename = "DI4")]
    pub di4: Loose,
    #[serde(rename = "Fuel")]
    pub fuel: Loose,
    // upstream spelling
    #[serde(rename = "Temparature")]
    pub temperature: Loose,
    #[serde(rename = "WPointNo")]
    pub waypoint_no: Loose,
    #[serde(rename = "Odometer")]
    pub odometer: Loose,
    #[serde(rename = "Distance")]
    pub distance: Loose,
    #[serde(rename = "ETATime")]
    pub eta_time: Loose,
    #[serde(rename = "ETARoute")]
    pub eta_route: Loose,
    #[serde(rename = "ETAOldTime")]
    pub eta_old_time: Loose,
    #[serde(rename = "routeflag")]
    pub route_flag: Loose,
    #[serde(rename = "ETARouteName")]
    pub eta_route_name: Loose,
    #[serde(rename = "DirectionFrom")]
    pub direction_from: Loose,
    #[serde(rename = "DirectionTo")]
    pub direction_to: Loose,
    #[serde(rename = "DispatchDateTime")]
    pub dispatch_time: Loose,
    #[serde(rename = "ETATime1")]
    pub eta_time_alt: Loose,
    #[serde(rename = "ETAOldTime1")]
    pub eta_old_time_alt: Loose,
    #[serde(rename = "routeflag1")]
    pub route_flag_alt: Loose,
    #[serde(rename = "RouteNo")]
    pub route_no: Loose,
    #[serde(rename = "WaybillNo")]
    pub waybill_no: Loose,
    #[serde(rename = "lastwaypointid")]
    pub last_waypoint_id: Loose,
    #[serde(rename = "token")]
    pub token: Loose,
    #[serde(rename = "avgspeed")]
    pub average_speed: Loose,
    #[serde(rename = "LatLong")]
    pub lat_long: Loose,
    /// `{vehid, VehNo}`
    #[serde(rename = "get_vehicle")]
    pub vehicle: Loose,
}

/// Envelope of one tracking API response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub status: Loose,
    pub messages: Loose,
    pub data: Option<Vec<RawSample>>,
}

impl Snapshot {
    pub fn into_samples(self) -> Vec<RawSample> {
        self.data.unwrap_or_default()
    }
}

/// WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub longitude: f64,
    pub latitude: f64,
}

/// Canonical telemetry record. One row per (`vehicle_id`, `observed_at`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSample {
    pub vehicle_id: i64,
    pub vehicle_number: String,
    pub observed_at: NaiveDateTime,
    pub previous_observed_at: Option<NaiveDateTime>,
    pub last_notification_sent_at: Option<NaiveDateTime>,
    pub dispatch_at: Option<NaiveDateTime>,
    pub position: Option<Position>,

    pub speed: f64,
    pub fuel: f64,
    pub odometer: f64,
    pub distance: f64,
    pub average_speed: f64,
    pub eta_time: f64,
    pub eta_time_alt: f64,
    pub eta_old_time: f64,
    pub eta_old_time_alt: f64,

    pub ignition: bool,
    pub aux1: bool,
    pub digital_input_4: bool,
    pub air_conditioning: bool,

    pub route_flag: bool,
    pub route_flag_alt: Option<i64>,

    pub direction_from: String,
    pub direction_to: String,
    pub eta_route_name: String,
    pub eta_route: String,

    pub notification_sent: Option<String>,
    pub compliance_sent: Option<String>,
    pub temperature: Option<String>,

    pub track_id: Option<i64>,
    pub company_id: Option<i64>,
    pub route_no: Option<i64>,
    pub waybill_no: Option<i64>,
    pub waypoint_no: Option<i64>,
    pub last_waypoint_id: Option<i64>,
    pub token: Option<i64>,
    pub city: Option<String>,
    pub image_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loose_accepts_every_shape() {
        let raw: RawSample = serde_json::from_value(json!({
            "VehId": "101",
            "idx_Trackid_pk": 77,
            "City": null,
            "ImagePath": {"small": "a.png"},
            "AC": true,
            "LatLong": [19.2, 72.9],
        }))
        .unwrap();
        assert_eq!(raw.vehicle_id, Loose::text("101"));
        assert_eq!(raw.track_id.scalar().as_deref(), Some("77"));
        assert_eq!(raw.city, Loose::Absent);
        assert!(matches!(raw.image_path, Loose::Object(_)));
        assert_eq!(raw.ac, Loose::Flag(true));
        assert!(matches!(raw.lat_long, Loose::List(_)));
        assert!(raw.speed.is_absent());
    }

    #[test]
    fn blank_text_is_absent() {
        assert!(Loose::text("   ").is_absent());
        assert_eq!(Loose::text("  ").scalar(), None);
        assert_eq!(Loose::text(" 12 ").scalar().as_deref(), Some("12"));
        assert_eq!(Loose::text("").to_text(), None);
    }

    #[test]
    fn nested_field_lookup() {
        let v: Loose = serde_json::from_value(json!({"vehid": "9", "VehNo": "MH04"})).unwrap();
        assert_eq!(v.field("VehNo"), Loose::text("MH04"));
        assert_eq!(v.field("missing"), Loose::Absent);
        assert_eq!(Loose::text("x").field("VehNo"), Loose::Absent);
    }

    #[test]
    fn snapshot_without_data_is_empty() {
        let snap: Snapshot = serde_json::from_str(r#"{"status":"1","messages":"ok"}"#).unwrap();
        assert!(snap.into_samples().is_empty());
        let snap: Snapshot = serde_json::from_str(r#"{"status":"1","data":null}"#).unwrap();
        assert!(snap.into_samples().is_empty());
    }
}
