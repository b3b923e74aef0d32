//! Per-request batcher context
//!
//! A [`RequestContext`] owns one fresh [`KeyedBatcher`] per entity type and is
//! dropped with the request it was created for. Nothing cached in one context
//! is ever visible to another.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::batcher::{BatchConfig, BulkFetcher, KeyedBatcher};
use crate::fetchers::{FleetCatalog, HttpBulkFetcher, HttpCatalog, HttpUpstream, TableFetcher};
use crate::model::{Alert, EntityType, Robot, RobotId, Site, SiteId, Telemetry, User, UserId};
use crate::store::InMemoryFleet;

/// Fetchers for every entity type, shared by all requests
#[derive(Clone)]
pub struct FleetServices {
    pub catalog: Arc<dyn FleetCatalog>,
    pub robots: Arc<dyn BulkFetcher<RobotId, Robot>>,
    pub telemetry: Arc<dyn BulkFetcher<RobotId, Telemetry>>,
    pub alerts: Arc<dyn BulkFetcher<RobotId, Vec<Alert>>>,
    pub users: Arc<dyn BulkFetcher<UserId, User>>,
    pub sites: Arc<dyn BulkFetcher<SiteId, Site>>,
    pub batch: BatchConfig,
}

impl FleetServices {
    /// Services answered directly from the in-memory store
    pub fn in_memory(fleet: Arc<InMemoryFleet>, batch: BatchConfig) -> Self {
        Self {
            catalog: fleet.clone(),
            robots: Arc::new(TableFetcher::robots(fleet.clone())),
            telemetry: Arc::new(TableFetcher::telemetry(fleet.clone())),
            alerts: Arc::new(TableFetcher::alerts(fleet.clone())),
            users: Arc::new(TableFetcher::users(fleet.clone())),
            sites: Arc::new(TableFetcher::sites(fleet)),
            batch,
        }
    }

    /// Services reached over HTTP at `base_url`
    pub fn over_http(base_url: &str, timeout: Duration, batch: BatchConfig) -> Self {
        let upstream = HttpUpstream::with_timeout(base_url, timeout);
        Self {
            catalog: Arc::new(HttpCatalog::new(upstream.clone())),
            robots: Arc::new(HttpBulkFetcher::new(EntityType::Robots, upstream.clone())),
            telemetry: Arc::new(HttpBulkFetcher::new(EntityType::Telemetry, upstream.clone())),
            alerts: Arc::new(HttpBulkFetcher::new(EntityType::Alerts, upstream.clone())),
            users: Arc::new(HttpBulkFetcher::new(EntityType::Users, upstream.clone())),
            sites: Arc::new(HttpBulkFetcher::new(EntityType::Sites, upstream)),
            batch,
        }
    }

    /// Fresh context for one inbound request
    pub fn new_context(&self) -> RequestContext {
        RequestContext::new(self)
    }
}

/// Batchers scoped to one inbound request
pub struct RequestContext {
    request_id: Uuid,
    robots: KeyedBatcher<RobotId, Robot>,
    telemetry: KeyedBatcher<RobotId, Telemetry>,
    alerts: KeyedBatcher<RobotId, Vec<Alert>>,
    users: KeyedBatcher<UserId, User>,
    sites: KeyedBatcher<SiteId, Site>,
}

impl RequestContext {
    pub fn new(services: &FleetServices) -> Self {
        Self::with_request_id(services, Uuid::new_v4())
    }

    pub fn with_request_id(services: &FleetServices, request_id: Uuid) -> Self {
        let batch = services.batch;
        Self {
            request_id,
            robots: KeyedBatcher::new(EntityType::Robots, services.robots.clone(), batch),
            telemetry: KeyedBatcher::new(EntityType::Telemetry, services.telemetry.clone(), batch),
            alerts: KeyedBatcher::new(EntityType::Alerts, services.alerts.clone(), batch),
            users: KeyedBatcher::new(EntityType::Users, services.users.clone(), batch),
            sites: KeyedBatcher::new(EntityType::Sites, services.sites.clone(), batch),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn robots(&self) -> &KeyedBatcher<RobotId, Robot> {
        &self.robots
    }

    pub fn telemetry(&self) -> &KeyedBatcher<RobotId, Telemetry> {
        &self.telemetry
    }

    pub fn alerts(&self) -> &KeyedBatcher<RobotId, Vec<Alert>> {
        &self.alerts
    }

    pub fn users(&self) -> &KeyedBatcher<UserId, User> {
        &self.users
    }

    pub fn sites(&self) -> &KeyedBatcher<SiteId, Site> {
        &self.sites
    }
}
