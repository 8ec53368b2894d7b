//! View models returned by repository queries that are not whole samples.

use chrono::NaiveDateTime;

/// Per-vehicle partition overview used by `store_inspect`.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleSummary {
    pub vehicle_id: i64,
    pub vehicle_number: String,
    pub samples: i64,
    pub first_observed_at: NaiveDateTime,
    pub last_observed_at: NaiveDateTime,
}
