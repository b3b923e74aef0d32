//! Fleet entity records

use std::fmt;

use async_graphql::SimpleObject;
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Robot key, e.g. `robot-001`
pub type RobotId = String;

/// User key
pub type UserId = i64;

/// Site key
pub type SiteId = i64;

/// Entity types served by the fleet services.
///
/// Keys are only unique within one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Robots,
    Telemetry,
    Alerts,
    Users,
    Sites,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Robots,
        EntityType::Telemetry,
        EntityType::Alerts,
        EntityType::Users,
        EntityType::Sites,
    ];

    /// URL path segment of the owning service, e.g. `/telemetry/batch`
    pub fn path(self) -> &'static str {
        match self {
            EntityType::Robots => "robots",
            EntityType::Telemetry => "telemetry",
            EntityType::Alerts => "alerts",
            EntityType::Users => "users",
            EntityType::Sites => "sites",
        }
    }

    /// Body field carrying the key list of a batch request.
    ///
    /// Telemetry and alerts are keyed by the robot they belong to.
    pub fn key_field(self) -> &'static str {
        match self {
            EntityType::Robots | EntityType::Telemetry | EntityType::Alerts => "robot_ids",
            EntityType::Users => "user_ids",
            EntityType::Sites => "site_ids",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Robot owned by the robot service
#[derive(SimpleObject, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[graphql(complex)]
pub struct Robot {
    pub id: RobotId,
    pub name: String,
    pub model: String,
    pub location: String,
    pub status: String,
    pub owner_id: UserId,
    pub site_id: SiteId,
    pub battery: i32,
}

/// Latest telemetry reading of one robot
#[derive(SimpleObject, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub robot_id: RobotId,
    pub battery_level: f64,
    pub cpu_usage: f64,
    pub temperature: f64,
    pub timestamp: Timestamp,
}

#[derive(SimpleObject, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[graphql(complex)]
pub struct Alert {
    pub id: i64,
    pub robot_id: RobotId,
    pub severity: String,
    pub message: String,
    pub created_at: Timestamp,
}

impl Alert {
    pub fn is_critical(&self) -> bool {
        self.severity == "critical"
    }
}

#[derive(SimpleObject, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: String,
    pub site_id: SiteId,
}

#[derive(SimpleObject, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub location: String,
    pub timezone: String,
    pub capacity: i32,
}
