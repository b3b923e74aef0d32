//! In-memory fleet data with simulated latency
//!
//! Stands in for the robot, telemetry, alert, user and site services. Every
//! call sleeps for the configured round-trip latency, and an outage can be
//! injected per entity type.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::fetchers::FleetCatalog;
use crate::model::{Alert, EntityType, Robot, RobotId, Site, SiteId, Telemetry, User, UserId};
use crate::FetchError;

const ROBOT_MODELS: [&str; 5] = ["AGV-X100", "AGV-X200", "AGV-X300", "ARM-A1", "ARM-A2"];

const LOCATIONS: [&str; 5] = [
    "Building-1-Floor-1",
    "Building-1-Floor-2",
    "Building-2-Floor-1",
    "Building-2-Floor-2",
    "Building-3-Floor-1",
];

const TIMEZONES: [&str; 3] = ["Asia/Seoul", "Europe/Berlin", "America/Chicago"];

const ALERT_TYPES: [(&str, &str); 6] = [
    ("critical", "Temperature exceeds threshold"),
    ("critical", "Battery critically low"),
    ("warning", "Battery below 30%"),
    ("warning", "CPU usage high"),
    ("info", "Scheduled maintenance due"),
    ("info", "Firmware update available"),
];

/// Simulated round-trip latencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyProfile {
    /// Listing a whole collection
    pub list: Duration,
    /// Fetching one record
    pub single: Duration,
    /// Base cost of one bulk fetch
    pub batch: Duration,
    /// Marshalling cost per key of a bulk fetch
    pub per_key: Duration,
}

impl Default for LatencyProfile {
    fn default() -> Self {
        Self {
            list: Duration::from_millis(15),
            single: Duration::from_millis(7),
            batch: Duration::from_millis(10),
            per_key: Duration::from_micros(100),
        }
    }
}

impl LatencyProfile {
    /// No simulated latency at all
    pub fn none() -> Self {
        Self {
            list: Duration::ZERO,
            single: Duration::ZERO,
            batch: Duration::ZERO,
            per_key: Duration::ZERO,
        }
    }

    fn batch_cost(&self, keys: usize) -> Duration {
        let keys = u32::try_from(keys).unwrap_or(u32::MAX);
        self.batch + self.per_key.saturating_mul(keys)
    }
}

async fn simulate(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Size of the seeded fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedConfig {
    pub robots: usize,
    pub users: usize,
    pub sites: usize,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            robots: 15,
            users: 10,
            sites: 5,
        }
    }
}

/// In-memory tables for every fleet entity type
#[derive(Debug)]
pub struct InMemoryFleet {
    robots: HashMap<RobotId, Robot>,
    telemetry: HashMap<RobotId, Telemetry>,
    alerts: HashMap<RobotId, Vec<Alert>>,
    users: HashMap<UserId, User>,
    sites: HashMap<SiteId, Site>,
    latency: LatencyProfile,
    outages: RwLock<HashSet<EntityType>>,
}

impl InMemoryFleet {
    /// Build a deterministic fleet.
    ///
    /// Robots in maintenance (every 7th) report no telemetry; robot `i` has
    /// `i % 4` alerts, some of them critical.
    pub fn seeded(seed: &SeedConfig, latency: LatencyProfile) -> Self {
        let now = Utc::now();
        let users_total = seed.users.max(1);
        let sites_total = seed.sites.max(1);

        let mut robots = HashMap::new();
        let mut telemetry = HashMap::new();
        let mut alerts = HashMap::new();
        let mut next_alert_id = 1i64;

        for i in 1..=seed.robots {
            let id = format!("robot-{:03}", i);
            let status = if i % 7 == 0 { "maintenance" } else { "active" };
            robots.insert(
                id.clone(),
                Robot {
                    id: id.clone(),
                    name: format!("AGV-{}", i),
                    model: ROBOT_MODELS[i % ROBOT_MODELS.len()].to_string(),
                    location: LOCATIONS[i % LOCATIONS.len()].to_string(),
                    status: status.to_string(),
                    owner_id: ((i - 1) % users_total + 1) as UserId,
                    site_id: ((i - 1) % sites_total + 1) as SiteId,
                    battery: (20 + (i * 37) % 81) as i32,
                },
            );

            if status == "active" {
                telemetry.insert(
                    id.clone(),
                    Telemetry {
                        robot_id: id.clone(),
                        battery_level: 10.0 + ((i * 13) % 90) as f64,
                        cpu_usage: 5.0 + ((i * 29) % 90) as f64,
                        temperature: 25.0 + ((i * 7) % 50) as f64,
                        timestamp: (now - ChronoDuration::minutes(i as i64)).into(),
                    },
                );
            }

            let robot_alerts: Vec<Alert> = (0..i % 4)
                .map(|j| {
                    let (severity, message) = ALERT_TYPES[(i + j) % ALERT_TYPES.len()];
                    let minutes_ago = ((i * 37 + j * 11) % 1440 + 1) as i64;
                    let alert = Alert {
                        id: next_alert_id,
                        robot_id: id.clone(),
                        severity: severity.to_string(),
                        message: format!("{} on AGV-{}", message, i),
                        created_at: (now - ChronoDuration::minutes(minutes_ago)).into(),
                    };
                    next_alert_id += 1;
                    alert
                })
                .collect();
            alerts.insert(id, robot_alerts);
        }

        let users = (1..=seed.users)
            .map(|u| {
                let user = User {
                    id: u as UserId,
                    name: format!("User{}", u),
                    email: format!("user{}@robot.com", u),
                    role: if u % 3 == 0 { "admin" } else { "operator" }.to_string(),
                    site_id: (u % sites_total + 1) as SiteId,
                };
                (user.id, user)
            })
            .collect();

        let sites = (1..=seed.sites)
            .map(|s| {
                let site = Site {
                    id: s as SiteId,
                    name: format!("Site-{}", s),
                    location: LOCATIONS[(s - 1) % LOCATIONS.len()].to_string(),
                    timezone: TIMEZONES[(s - 1) % TIMEZONES.len()].to_string(),
                    capacity: (50 * s) as i32,
                };
                (site.id, site)
            })
            .collect();

        info!(
            robots = seed.robots,
            users = seed.users,
            sites = seed.sites,
            "seeded in-memory fleet"
        );

        Self {
            robots,
            telemetry,
            alerts,
            users,
            sites,
            latency,
            outages: RwLock::new(HashSet::new()),
        }
    }

    pub fn latency(&self) -> LatencyProfile {
        self.latency
    }

    /// Start or end a simulated outage of the service owning `entity`
    pub async fn set_outage(&self, entity: EntityType, down: bool) {
        let mut outages = self.outages.write().await;
        if down {
            outages.insert(entity);
        } else {
            outages.remove(&entity);
        }
    }

    pub(crate) async fn ensure_available(&self, entity: EntityType) -> Result<(), FetchError> {
        if self.outages.read().await.contains(&entity) {
            return Err(FetchError::Unavailable {
                entity,
                message: "simulated outage".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) async fn simulate_batch(&self, keys: usize) {
        simulate(self.latency.batch_cost(keys)).await;
    }

    pub(crate) async fn simulate_single(&self) {
        simulate(self.latency.single).await;
    }

    pub(crate) fn robot_rows(&self) -> &HashMap<RobotId, Robot> {
        &self.robots
    }

    pub(crate) fn telemetry_rows(&self) -> &HashMap<RobotId, Telemetry> {
        &self.telemetry
    }

    pub(crate) fn alert_rows(&self) -> &HashMap<RobotId, Vec<Alert>> {
        &self.alerts
    }

    pub(crate) fn user_rows(&self) -> &HashMap<UserId, User> {
        &self.users
    }

    pub(crate) fn site_rows(&self) -> &HashMap<SiteId, Site> {
        &self.sites
    }
}

#[async_trait]
impl FleetCatalog for InMemoryFleet {
    async fn list_robots(&self) -> Result<Vec<Robot>, FetchError> {
        self.ensure_available(EntityType::Robots).await?;
        simulate(self.latency.list).await;

        let mut robots: Vec<Robot> = self.robots.values().cloned().collect();
        robots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(robots)
    }

    async fn critical_alerts(&self) -> Result<Vec<Alert>, FetchError> {
        self.ensure_available(EntityType::Alerts).await?;
        simulate(self.latency.list).await;

        let mut critical: Vec<Alert> = self
            .alerts
            .values()
            .flatten()
            .filter(|alert| alert.is_critical())
            .cloned()
            .collect();
        critical.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(critical)
    }
}
