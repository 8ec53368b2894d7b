//! Field normalizer: collapses a [`RawSample`] into a [`NormalizedSample`].
//!
//! Only the identity fields (`VehId`, `LastTrackdt`) can reject a sample.
//! Every other field is defaulted on failure and reported as a
//! [`NormalizationIssue`]:
//! - numeric telemetry falls back to `0.0`
//! - timestamps and integer identifiers fall back to `None`
//! - toggles are `true` only for the exact string `"ON"`
//! - `NCSent`, `CSent`, `Temparature` and `LastNCSentDate` treat `"0"` as
//!   "not applicable"; everywhere else `"0"` is the number zero
//!
//! Blank strings and `null` are absent values, not failures.

use chrono::NaiveDateTime;
use std::fmt;
use thiserror::Error;

use crate::model::{Loose, NormalizedSample, Position, RawSample};

/// Upstream wall-clock format for every timestamp field.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NOT_APPLICABLE: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Number,
    Integer,
    Timestamp,
    Boolean,
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Expected::Number => "a number",
            Expected::Integer => "an integer",
            Expected::Timestamp => "a timestamp",
            Expected::Boolean => "a boolean",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationIssue {
    #[error("{field}: missing")]
    Missing { field: &'static str },
    #[error("{field}: cannot parse {value:?} as {expected}")]
    Unparseable {
        field: &'static str,
        expected: Expected,
        value: String,
    },
    #[error("{field}: {value} is out of range")]
    OutOfRange { field: &'static str, value: f64 },
}

impl NormalizationIssue {
    pub fn field(&self) -> &'static str {
        match self {
            NormalizationIssue::Missing { field }
            | NormalizationIssue::Unparseable { field, .. }
            | NormalizationIssue::OutOfRange { field, .. } => field,
        }
    }
}

/// A sample that made it through, with the non-fatal issues met on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub sample: NormalizedSample,
    pub issues: Vec<NormalizationIssue>,
}

/// A sample without a usable identity (`vehicle_id`, `observed_at`).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("sample rejected: {}", describe(.issues))]
pub struct Rejected {
    pub issues: Vec<NormalizationIssue>,
}

fn describe(issues: &[NormalizationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn normalize(raw: &RawSample) -> Result<Normalized, Rejected> {
    let mut f = Fields::default();

    let vehicle_ref = if raw.vehicle_id.is_absent() {
        raw.vehicle.field("vehid")
    } else {
        raw.vehicle_id.clone()
    };
    let vehicle_id = f.required_integer("VehId", &vehicle_ref);
    let observed_at = f.required_timestamp("LastTrackdt", &raw.last_track_time);
    let (Some(vehicle_id), Some(observed_at)) = (vehicle_id, observed_at) else {
        return Err(Rejected { issues: f.issues });
    };

    let sample = NormalizedSample {
        vehicle_id,
        vehicle_number: raw.vehicle.field("VehNo").to_text().unwrap_or_default(),
        observed_at,
        previous_observed_at: f.timestamp("PrevTrackDt", &raw.previous_track_time),
        last_notification_sent_at: f
            .timestamp("LastNCSentDate", &not_applicable_as_absent(&raw.last_nc_sent_date)),
        dispatch_at: f.timestamp("DispatchDateTime", &raw.dispatch_time),
        position: f.position(&raw.longitude, &raw.latitude),

        speed: f.number("Speed", &raw.speed),
        fuel: f.number("Fuel", &raw.fuel),
        odometer: f.number("Odometer", &raw.odometer),
        distance: f.number("Distance", &raw.distance),
        average_speed: f.number("avgspeed", &raw.average_speed),
        eta_time: f.number("ETATime", &raw.eta_time),
        eta_time_alt: f.number("ETATime1", &raw.eta_time_alt),
        eta_old_time: f.number("ETAOldTime", &raw.eta_old_time),
        eta_old_time_alt: f.number("ETAOldTime1", &raw.eta_old_time_alt),

        ignition: is_on(&raw.ignition),
        aux1: is_on(&raw.aux1),
        digital_input_4: is_on(&raw.di4),
        air_conditioning: is_on(&raw.ac),

        route_flag: f.flag("routeflag", &raw.route_flag),
        route_flag_alt: f.integer("routeflag1", &raw.route_flag_alt),

        direction_from: raw.direction_from.to_text().unwrap_or_default(),
        direction_to: raw.direction_to.to_text().unwrap_or_default(),
        eta_route_name: raw.eta_route_name.to_text().unwrap_or_default(),
        eta_route: raw.eta_route.to_text().unwrap_or_default(),

        notification_sent: sentinel_text(&raw.nc_sent),
        compliance_sent: sentinel_text(&raw.c_sent),
        temperature: sentinel_text(&raw.temperature),

        track_id: f.integer("idx_Trackid_pk", &raw.track_id),
        company_id: f.integer("CmpId", &raw.company_id),
        route_no: f.integer("RouteNo", &raw.route_no),
        waybill_no: f.integer("WaybillNo", &raw.waybill_no),
        waypoint_no: f.integer("WPointNo", &raw.waypoint_no),
        last_waypoint_id: f.integer("lastwaypointid", &raw.last_waypoint_id),
        token: f.integer("token", &raw.token),
        city: raw.city.to_text(),
        image_path: raw.image_path.to_text(),
    };

    Ok(Normalized {
        sample,
        issues: f.issues,
    })
}

/// Exact match on `"ON"`; `"on"`, `"1"` or `true` are all off.
pub fn is_on(value: &Loose) -> bool {
    matches!(value, Loose::Text(s) if s == "ON")
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT).ok()
}

fn sentinel_text(value: &Loose) -> Option<String> {
    value
        .to_text()
        .filter(|s| s.trim() != NOT_APPLICABLE)
}

fn not_applicable_as_absent(value: &Loose) -> Loose {
    match value.scalar() {
        Some(s) if s == NOT_APPLICABLE => Loose::Absent,
        _ => value.clone(),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn parse_integer(value: &Loose) -> Option<i64> {
    match value {
        Loose::Number(n) => n.as_i64(),
        other => other.scalar().and_then(|s| s.parse::<i64>().ok()),
    }
}

fn parse_number(value: &Loose) -> Option<f64> {
    match value {
        Loose::Number(n) => n.as_f64(),
        Loose::Text(_) => value
            .scalar()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite()),
        _ => None,
    }
}

fn raw_text(value: &Loose) -> String {
    value
        .to_text()
        .or_else(|| serde_json::to_string(value).ok())
        .unwrap_or_default()
}

#[derive(Default)]
struct Fields {
    issues: Vec<NormalizationIssue>,
}

impl Fields {
    fn unparseable(&mut self, field: &'static str, expected: Expected, value: &Loose) {
        self.issues.push(NormalizationIssue::Unparseable {
            field,
            expected,
            value: raw_text(value),
        });
    }

    fn required_integer(&mut self, field: &'static str, value: &Loose) -> Option<i64> {
        if value.is_absent() {
            self.issues.push(NormalizationIssue::Missing { field });
            return None;
        }
        self.integer(field, value)
    }

    fn required_timestamp(&mut self, field: &'static str, value: &Loose) -> Option<NaiveDateTime> {
        if value.is_absent() {
            self.issues.push(NormalizationIssue::Missing { field });
            return None;
        }
        self.timestamp(field, value)
    }

    fn integer(&mut self, field: &'static str, value: &Loose) -> Option<i64> {
        if value.is_absent() {
            return None;
        }
        let parsed = parse_integer(value);
        if parsed.is_none() {
            self.unparseable(field, Expected::Integer, value);
        }
        parsed
    }

    fn timestamp(&mut self, field: &'static str, value: &Loose) -> Option<NaiveDateTime> {
        if value.is_absent() {
            return None;
        }
        let parsed = match value {
            Loose::Text(s) => parse_timestamp(s),
            _ => None,
        };
        if parsed.is_none() {
            self.unparseable(field, Expected::Timestamp, value);
        }
        parsed
    }

    fn number(&mut self, field: &'static str, value: &Loose) -> f64 {
        if value.is_absent() {
            return 0.0;
        }
        parse_number(value).unwrap_or_else(|| {
            self.unparseable(field, Expected::Number, value);
            0.0
        })
    }

    fn flag(&mut self, field: &'static str, value: &Loose) -> bool {
        let parsed = match value {
            Loose::Flag(b) => Some(*b),
            Loose::Number(_) | Loose::Text(_) => value.scalar().and_then(|s| parse_bool(&s)),
            Loose::Absent => return false,
            _ => None,
        };
        parsed.unwrap_or_else(|| {
            if !value.is_absent() {
                self.unparseable(field, Expected::Boolean, value);
            }
            false
        })
    }

    fn position(&mut self, longitude: &Loose, latitude: &Loose) -> Option<Position> {
        if longitude.is_absent() && latitude.is_absent() {
            self.issues.push(NormalizationIssue::Missing { field: "Latitude/Longitude" });
            return None;
        }
        let lon = self.coordinate("Longitude", longitude, 180.0);
        let lat = self.coordinate("Latitude", latitude, 90.0);
        Some(Position {
            longitude: lon?,
            latitude: lat?,
        })
    }

    fn coordinate(&mut self, field: &'static str, value: &Loose, limit: f64) -> Option<f64> {
        if value.is_absent() {
            self.issues.push(NormalizationIssue::Missing { field });
            return None;
        }
        let Some(v) = parse_number(value) else {
            self.unparseable(field, Expected::Number, value);
            return None;
        };
        if v.abs() > limit {
            self.issues.push(NormalizationIssue::OutOfRange { field, value: v });
            return None;
        }
        Some(v)
    }
}
