//! Configuration loader and validator for the telemetry ingester.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub upstream: Upstream,
    pub ingest: Ingest,
    pub store: Store,
    pub export: Export,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Keep the raw body of every snapshot under `{data_dir}/snapshots`.
    #[serde(default)]
    pub archive_snapshots: bool,
}

/// Tracking API endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    pub base_url: String,
    pub tracking_path: String,
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Polling cadence and quota policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ingest {
    pub poll_interval_ms: u64,
    pub quota_floor: i64,
    pub backoff_interval_ms: u64,
    pub max_backoff_polls: u32,
    pub startup_fetch_attempts: u32,
    pub pending_capacity: usize,
}

/// Sample store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Store {
    #[serde(default)]
    pub database_url: Option<String>,
    pub op_timeout_secs: u64,
}

/// Stop/route exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Export {
    pub waypoints_path: String,
    pub route_master_path: String,
    pub route_details_path: String,
    pub route_request_delay_ms: u64,
    pub operator: String,
}

fn default_user_agent() -> String {
    "fleet-ingest/0.1".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and the
    /// snapshot archive when enabled).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)?;
        if self.app.archive_snapshots {
            fs::create_dir_all(self.snapshot_dir())?;
        }
        Ok(())
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join("snapshots")
    }

    pub fn export_dir(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join("export")
    }

    /// Store target: `DATABASE_URL` wins, then `store.database_url`, then a
    /// file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.store.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/telemetry.db", self.app.data_dir))
    }
}

impl Ingest {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_interval(&self) -> Duration {
        Duration::from_millis(self.backoff_interval_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let base = cfg.upstream.base_url.trim();
    if base.is_empty() {
        return Err(ConfigError::Invalid("upstream.base_url must be non-empty"));
    }
    if reqwest::Url::parse(base).is_err() {
        return Err(ConfigError::Invalid("upstream.base_url must be an absolute URL"));
    }
    if cfg.upstream.tracking_path.trim().is_empty() {
        return Err(ConfigError::Invalid("upstream.tracking_path must be non-empty"));
    }
    if cfg.upstream.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("upstream.request_timeout_secs must be > 0"));
    }

    let ingest = &cfg.ingest;
    if ingest.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("ingest.poll_interval_ms must be > 0"));
    }
    if ingest.backoff_interval_ms == 0 {
        return Err(ConfigError::Invalid("ingest.backoff_interval_ms must be > 0"));
    }
    if ingest.quota_floor < 0 {
        return Err(ConfigError::Invalid("ingest.quota_floor must be >= 0"));
    }
    if ingest.max_backoff_polls == 0 {
        return Err(ConfigError::Invalid("ingest.max_backoff_polls must be > 0"));
    }
    if ingest.startup_fetch_attempts == 0 {
        return Err(ConfigError::Invalid("ingest.startup_fetch_attempts must be > 0"));
    }
    // pending_capacity may be 0: failed writes are then dropped immediately.

    if let Some(url) = &cfg.store.database_url {
        if url.trim().is_empty() {
            return Err(ConfigError::Invalid("store.database_url must be non-empty when set"));
        }
    }
    if cfg.store.op_timeout_secs == 0 {
        return Err(ConfigError::Invalid("store.op_timeout_secs must be > 0"));
    }

    let ex = &cfg.export;
    if ex.waypoints_path.trim().is_empty() {
        return Err(ConfigError::Invalid("export.waypoints_path must be non-empty"));
    }
    if ex.route_master_path.trim().is_empty() {
        return Err(ConfigError::Invalid("export.route_master_path must be non-empty"));
    }
    if ex.route_details_path.trim().is_empty() {
        return Err(ConfigError::Invalid("export.route_details_path must be non-empty"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  archive_snapshots: false

upstream:
  base_url: "http://tmtitsapi.locationtracker.com/api/"
  tracking_path: "getLastTrackingData"
  request_timeout_secs: 30

ingest:
  poll_interval_ms: 5000
  quota_floor: 2
  backoff_interval_ms: 10000
  max_backoff_polls: 30
  startup_fetch_attempts: 3
  pending_capacity: 512

store:
  op_timeout_secs: 10

export:
  waypoints_path: "getWayPoints"
  route_master_path: "getRouteMaster"
  route_details_path: "getRouteDetailsNew"
  route_request_delay_ms: 2000
  operator: "Thane Municipal Transport"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.upstream.user_agent, "fleet-ingest/0.1");
        assert!(cfg.store.database_url.is_none());
        assert_eq!(cfg.ingest.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.ingest.backoff_interval(), Duration::from_secs(10));
    }

    #[test]
    fn invalid_upstream() {
        let mut cfg = example_cfg();
        cfg.upstream.base_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("upstream.base_url")), _ => panic!("wrong error") }

        let mut cfg = example_cfg();
        cfg.upstream.base_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.upstream.tracking_path = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("tracking_path")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_intervals() {
        let mut cfg = example_cfg();
        cfg.ingest.poll_interval_ms = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("poll_interval_ms")), _ => panic!("wrong error") }

        let mut cfg = example_cfg();
        cfg.ingest.backoff_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.ingest.max_backoff_polls = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.ingest.quota_floor = -1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.store.op_timeout_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn explicit_database_url_is_used() {
        let mut cfg = example_cfg();
        cfg.store.database_url = Some("sqlite::memory:".into());
        validate(&cfg).unwrap();
        if std::env::var("DATABASE_URL").is_err() {
            assert_eq!(cfg.database_url(), "sqlite::memory:");
        }

        cfg.store.database_url = Some("".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_archive_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.app.archive_snapshots = true;
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(data_path.join("snapshots").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.ingest.quota_floor, 2);
        assert_eq!(cfg.export.operator, "Thane Municipal Transport");
    }
}
