//! Novelty checker and persistence writer behind one trait, so the loop can
//! run against SQLite in production and recording fakes in tests.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::db::{self, Pool};
use crate::model::NormalizedSample;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// The store's unique key already held this sample; nothing was written.
    AlreadyStored,
}

#[async_trait]
pub trait SampleStore: Send + Sync {
    /// `Ok(true)` when no sample with this key is stored yet. Lookup failures
    /// are errors, never a guess in either direction.
    async fn is_novel(&self, vehicle_id: i64, observed_at: NaiveDateTime) -> Result<bool, StoreError>;

    /// Single insert. Does not check novelty itself.
    async fn append(&self, sample: &NormalizedSample) -> Result<AppendOutcome, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
    op_timeout: Duration,
}

impl SqliteStore {
    pub fn new(pool: Pool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn bounded<T>(&self, op: impl Future<Output = anyhow::Result<T>>) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl SampleStore for SqliteStore {
    async fn is_novel(&self, vehicle_id: i64, observed_at: NaiveDateTime) -> Result<bool, StoreError> {
        let exists = self
            .bounded(db::sample_exists(&self.pool, vehicle_id, observed_at))
            .await?;
        Ok(!exists)
    }

    async fn append(&self, sample: &NormalizedSample) -> Result<AppendOutcome, StoreError> {
        let inserted = self.bounded(db::insert_sample(&self.pool, sample)).await?;
        Ok(if inserted {
            AppendOutcome::Inserted
        } else {
            AppendOutcome::AlreadyStored
        })
    }
}
