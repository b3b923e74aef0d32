//! Bulk fetcher adapters
//!
//! One [`BulkFetcher`] per entity type, backed either by the in-memory store
//! (`WHERE id IN (...)`) or by one outbound call to the owning service
//! (`POST /<entity>/batch`). Both are a single round trip per batch.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::batcher::BulkFetcher;
use crate::model::{Alert, EntityType, Robot, RobotId, Site, SiteId, Telemetry, User, UserId};
use crate::store::InMemoryFleet;
use crate::FetchError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outer collections the orchestrator joins against
#[async_trait]
pub trait FleetCatalog: Send + Sync {
    /// Every robot, ordered by id
    async fn list_robots(&self) -> Result<Vec<Robot>, FetchError>;

    /// Every critical alert, newest first
    async fn critical_alerts(&self) -> Result<Vec<Alert>, FetchError>;
}

/// Fetcher over one in-memory table
pub struct TableFetcher<K, V> {
    fleet: Arc<InMemoryFleet>,
    entity: EntityType,
    table: fn(&InMemoryFleet) -> &HashMap<K, V>,
}

impl TableFetcher<RobotId, Robot> {
    pub fn robots(fleet: Arc<InMemoryFleet>) -> Self {
        Self {
            fleet,
            entity: EntityType::Robots,
            table: InMemoryFleet::robot_rows,
        }
    }
}

impl TableFetcher<RobotId, Telemetry> {
    pub fn telemetry(fleet: Arc<InMemoryFleet>) -> Self {
        Self {
            fleet,
            entity: EntityType::Telemetry,
            table: InMemoryFleet::telemetry_rows,
        }
    }
}

impl TableFetcher<RobotId, Vec<Alert>> {
    pub fn alerts(fleet: Arc<InMemoryFleet>) -> Self {
        Self {
            fleet,
            entity: EntityType::Alerts,
            table: InMemoryFleet::alert_rows,
        }
    }
}

impl TableFetcher<UserId, User> {
    pub fn users(fleet: Arc<InMemoryFleet>) -> Self {
        Self {
            fleet,
            entity: EntityType::Users,
            table: InMemoryFleet::user_rows,
        }
    }
}

impl TableFetcher<SiteId, Site> {
    pub fn sites(fleet: Arc<InMemoryFleet>) -> Self {
        Self {
            fleet,
            entity: EntityType::Sites,
            table: InMemoryFleet::site_rows,
        }
    }
}

#[async_trait]
impl<K, V> BulkFetcher<K, V> for TableFetcher<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    async fn fetch(&self, keys: &[K]) -> Result<HashMap<K, V>, FetchError> {
        self.fleet.ensure_available(self.entity).await?;
        self.fleet.simulate_batch(keys.len()).await;

        let rows = (self.table)(self.fleet.as_ref());
        Ok(keys
            .iter()
            .filter_map(|key| rows.get(key).map(|row| (key.clone(), row.clone())))
            .collect())
    }

    async fn fetch_one(&self, key: &K) -> Result<Option<V>, FetchError> {
        self.fleet.ensure_available(self.entity).await?;
        self.fleet.simulate_single().await;

        Ok((self.table)(self.fleet.as_ref()).get(key).cloned())
    }
}

/// Fetcher wrapper recording the key set of every call
pub struct RecordingFetcher<K, V>
where
    K: Send + Sync + Clone + Eq + Hash,
    V: Send + Sync + Clone,
{
    inner: Arc<dyn BulkFetcher<K, V>>,
    calls: Mutex<Vec<Vec<K>>>,
}

impl<K, V> RecordingFetcher<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    pub fn new(inner: Arc<dyn BulkFetcher<K, V>>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Key sets of every call so far, in call order
    pub async fn calls(&self) -> Vec<Vec<K>> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn reset(&self) {
        self.calls.lock().await.clear();
    }
}

#[async_trait]
impl<K, V> BulkFetcher<K, V> for RecordingFetcher<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    async fn fetch(&self, keys: &[K]) -> Result<HashMap<K, V>, FetchError> {
        self.calls.lock().await.push(keys.to_vec());
        self.inner.fetch(keys).await
    }

    async fn fetch_one(&self, key: &K) -> Result<Option<V>, FetchError> {
        self.calls.lock().await.push(vec![key.clone()]);
        self.inner.fetch_one(key).await
    }
}

/// Base URL and client of a service exposing the fleet entity endpoints
#[derive(Clone)]
pub struct HttpUpstream {
    base_url: String,
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Creates a new client targeting the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, entity: EntityType, path: &str) -> Result<reqwest::Response, FetchError> {
        self.client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| transport_error(entity, e))
    }

    /// Single record; 404 means the record does not exist
    async fn get_record<T: DeserializeOwned>(
        &self,
        entity: EntityType,
        path: &str,
    ) -> Result<Option<T>, FetchError> {
        let response = self.get(entity, path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(entity, response)?;
        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| malformed(entity, e))
    }

    /// Whole collection; any non-2xx, 404 included, is a failure
    async fn get_collection<T: DeserializeOwned>(
        &self,
        entity: EntityType,
        path: &str,
    ) -> Result<Vec<T>, FetchError> {
        let response = ensure_success(entity, self.get(entity, path).await?)?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| malformed(entity, e))
    }
}

fn transport_error(entity: EntityType, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout { entity }
    } else {
        FetchError::Unavailable {
            entity,
            message: err.to_string(),
        }
    }
}

fn malformed(entity: EntityType, err: impl Display) -> FetchError {
    FetchError::Malformed {
        entity,
        message: err.to_string(),
    }
}

fn ensure_success(
    entity: EntityType,
    response: reqwest::Response,
) -> Result<reqwest::Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(FetchError::Status {
            entity,
            status: status.as_u16(),
        })
    }
}

/// Fetcher calling the owning service's batch endpoint
///
/// Sends `POST /<entity>/batch` with `{"<key>_ids": [...]}` and expects an
/// object mapping each requested id to its record or `null`.
pub struct HttpBulkFetcher<K, V> {
    entity: EntityType,
    upstream: HttpUpstream,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> HttpBulkFetcher<K, V> {
    pub fn new(entity: EntityType, upstream: HttpUpstream) -> Self {
        Self {
            entity,
            upstream,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K, V> BulkFetcher<K, V> for HttpBulkFetcher<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + Display + Serialize + 'static,
    V: Send + Sync + Clone + DeserializeOwned + 'static,
{
    #[instrument(skip_all, fields(entity = %self.entity, keys = keys.len()))]
    async fn fetch(&self, keys: &[K]) -> Result<HashMap<K, V>, FetchError> {
        let mut body = serde_json::Map::new();
        body.insert(
            self.entity.key_field().to_string(),
            serde_json::to_value(keys).map_err(|e| malformed(self.entity, e))?,
        );

        let response = self
            .upstream
            .client
            .post(self.upstream.url(&format!("{}/batch", self.entity.path())))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.entity, e))?;
        let response = ensure_success(self.entity, response)?;

        let mut records: HashMap<String, Option<V>> = response
            .json()
            .await
            .map_err(|e| malformed(self.entity, e))?;

        Ok(keys
            .iter()
            .filter_map(|key| {
                records
                    .remove(&key.to_string())
                    .flatten()
                    .map(|record| (key.clone(), record))
            })
            .collect())
    }

    async fn fetch_one(&self, key: &K) -> Result<Option<V>, FetchError> {
        self.upstream
            .get_record(self.entity, &format!("{}/{}", self.entity.path(), key))
            .await
    }
}

/// Catalog served by a remote robot/alert service
#[derive(Clone)]
pub struct HttpCatalog {
    upstream: HttpUpstream,
}

impl HttpCatalog {
    pub fn new(upstream: HttpUpstream) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl FleetCatalog for HttpCatalog {
    async fn list_robots(&self) -> Result<Vec<Robot>, FetchError> {
        self.upstream
            .get_collection(EntityType::Robots, "robots")
            .await
    }

    async fn critical_alerts(&self) -> Result<Vec<Alert>, FetchError> {
        self.upstream
            .get_collection(EntityType::Alerts, "alerts/critical")
            .await
    }
}
