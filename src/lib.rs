pub mod config;
pub mod db;
pub mod export;
pub mod governor;
pub mod ingest;
pub mod model;
pub mod normalize;
pub mod store;
pub mod upstream;
