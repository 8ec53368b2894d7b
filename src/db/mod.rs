//! Sample store on SQLite.
//!
//! - `model`: view models returned by summary queries.
//! - `repo`: SQL-only functions mapping rows to and from samples.
//!
//! The repository API is re-exported at `fleet_ingest::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::VehicleSummary;
