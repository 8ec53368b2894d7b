use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config;
use crate::governor;
use crate::model::{RawSample, Snapshot};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("upstream returned {status}: {body}")]
    Status {
        status: StatusCode,
        body: String,
        remaining_quota: Option<i64>,
    },
    #[error("unreadable response body: {0}")]
    Body(#[source] reqwest::Error),
    #[error("malformed snapshot JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid tracking request: {0:#}")]
    Request(anyhow::Error),
}

/// One successful poll: the records plus the quota reported alongside them.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub samples: Vec<RawSample>,
    pub remaining_quota: Option<i64>,
    /// Raw body as received, for archiving.
    pub body: String,
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<FetchedSnapshot, FetchError>;
}

/// HTTP client for the tracking API.
#[derive(Clone)]
pub struct TrackingClient {
    http: Client,
    base_url: Url,
    tracking_path: String,
}

impl fmt::Debug for TrackingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingClient")
            .field("base_url", &self.base_url)
            .field("tracking_path", &self.tracking_path)
            .finish_non_exhaustive()
    }
}

impl TrackingClient {
    pub fn from_config(cfg: &config::Upstream) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid upstream.base_url")?;
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::with_client(http, base_url, cfg.tracking_path.clone()))
    }

    pub fn with_client(http: Client, base_url: Url, tracking_path: String) -> Self {
        Self {
            http,
            base_url,
            tracking_path,
        }
    }

    /// Resolves an endpoint path against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid endpoint path {path:?}"))
    }

    pub fn build_tracking_request(&self) -> Result<reqwest::Request> {
        let url = self.endpoint(&self.tracking_path)?;
        self.http
            .get(url)
            .header("Accept", "application/json")
            .build()
            .context("failed to build tracking request")
    }

    /// GET returning the body as text; non-2xx is an error.
    pub async fn get_text(&self, path: &str) -> Result<String> {
        let url = self.endpoint(path)?;
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        read_success(res).await
    }

    /// Form POST returning the body as text; non-2xx is an error.
    pub async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<String> {
        let url = self.endpoint(path)?;
        let res = self
            .http
            .post(url.clone())
            .form(form)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        read_success(res).await
    }
}

async fn read_success(res: reqwest::Response) -> Result<String> {
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;
    if !status.is_success() {
        anyhow::bail!("upstream error {status}: {body}");
    }
    Ok(body)
}

/// Parses a tracking API body into its records.
pub fn parse_snapshot(body: &str) -> Result<Snapshot, serde_json::Error> {
    serde_json::from_str(body)
}

#[async_trait]
impl TelemetrySource for TrackingClient {
    async fn fetch_snapshot(&self) -> Result<FetchedSnapshot, FetchError> {
        let request = self
            .build_tracking_request()
            .map_err(FetchError::Request)?;
        let url = request.url().to_string();
        debug!(%url, "fetching snapshot");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = res.status();
        let remaining_quota = governor::remaining_quota(res.headers());
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, remaining = ?remaining_quota, "tracking API error");
            return Err(FetchError::Status {
                status,
                body,
                remaining_quota,
            });
        }

        let body = res.text().await.map_err(FetchError::Body)?;
        let snapshot = parse_snapshot(&body)?;
        Ok(FetchedSnapshot {
            samples: snapshot.into_samples(),
            remaining_quota,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> TrackingClient {
        TrackingClient::with_client(
            Client::new(),
            Url::parse(base).unwrap(),
            "getLastTrackingData".into(),
        )
    }

    #[test]
    fn tracking_request_targets_configured_path() {
        let c = client("http://tracker.example/api/");
        let req = c.build_tracking_request().unwrap();
        assert_eq!(req.method(), reqwest::Method::GET);
        assert_eq!(req.url().as_str(), "http://tracker.example/api/getLastTrackingData");
        assert_eq!(c.endpoint("/getWayPoints").unwrap().as_str(), "http://tracker.example/api/getWayPoints");
    }

    #[test]
    fn from_config_uses_example() {
        let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
        let c = TrackingClient::from_config(&cfg.upstream).unwrap();
        assert!(format!("{c:?}").contains("getLastTrackingData"));
    }

    #[test]
    fn parses_envelope() {
        let body = r#"{
            "status": "1",
            "messages": "Success",
            "data": [
                {"idx_Trackid_pk": 1, "VehId": "101", "LastTrackdt": "2024-01-01 10:00:00", "Speed": "12"},
                {"VehId": "102", "City": null, "get_vehicle": {"vehid": "102", "VehNo": "MH04"}}
            ]
        }"#;
        let samples = parse_snapshot(body).unwrap().into_samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].speed.scalar().as_deref(), Some("12"));
        assert_eq!(samples[1].vehicle.field("VehNo").scalar().as_deref(), Some("MH04"));
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        assert!(parse_snapshot("<html>busy</html>").is_err());
        assert!(parse_snapshot(r#"{"data": "nope"}"#).is_err());
    }
}
