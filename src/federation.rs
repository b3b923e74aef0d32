//! Federation reference resolution
//!
//! Another service's schema can hold a robot, user or site only as an opaque
//! key. These helpers resolve such keys through the request's batchers, so all
//! sibling references in one query collapse into one bulk call to the owner.

use std::hash::Hash;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::batcher::KeyedBatcher;
use crate::context::RequestContext;
use crate::model::{Alert, EntityType, Robot, RobotId, Site, Telemetry, User};
use crate::policy::{DependencyPolicy, FieldPolicy};
use crate::Result;

/// Resolved entity of any fleet type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__typename", content = "data")]
pub enum Entity {
    Robot(Robot),
    Telemetry(Telemetry),
    Alerts(Vec<Alert>),
    User(User),
    Site(Site),
}

/// Robot reference as held by a service that does not own robots
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityStub {
    pub id: RobotId,
}

impl EntityStub {
    pub fn new(id: impl Into<RobotId>) -> Self {
        Self { id: id.into() }
    }
}

/// Fields the telemetry and alert services add to a robot stub
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotExtension {
    pub latest_telemetry: Option<Telemetry>,
    pub active_alerts: Vec<Alert>,
}

/// Entity resolver trait for Apollo Federation
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// Resolve keys of `entity` in order; unknown keys resolve to `None`.
    async fn resolve_references(
        &self,
        entity: EntityType,
        keys: &[String],
    ) -> Result<Vec<Option<Entity>>>;

    /// Resolve a single key
    async fn resolve_reference(&self, entity: EntityType, key: &str) -> Result<Option<Entity>> {
        let mut resolved = self
            .resolve_references(entity, &[key.to_string()])
            .await?;
        Ok(resolved.pop().flatten())
    }
}

/// Loads keys that may not parse as `K`; unparsable keys resolve to `None`
/// without reaching the owning service.
async fn load_parsed<K, V>(batcher: &KeyedBatcher<K, V>, keys: &[String]) -> Result<Vec<Option<V>>>
where
    K: FromStr + Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    let parsed: Vec<Option<K>> = keys.iter().map(|key| key.parse().ok()).collect();
    let valid: Vec<K> = parsed.iter().flatten().cloned().collect();

    let mut loaded = batcher.load_many(&valid).await?.into_iter();
    Ok(parsed
        .into_iter()
        .map(|key| key.and_then(|_| loaded.next().flatten()))
        .collect())
}

fn settle_many<T: Clone>(
    policy: FieldPolicy,
    field: &'static str,
    outcome: Result<Vec<Option<T>>>,
    len: usize,
) -> Result<Vec<Option<T>>> {
    Ok(policy
        .settle(field, outcome.map(Some))?
        .unwrap_or_else(|| vec![None; len]))
}

/// Reference resolver borrowing one request's batchers
pub struct ReferenceResolver<'a> {
    context: &'a RequestContext,
    policy: DependencyPolicy,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(context: &'a RequestContext) -> Self {
        Self {
            context,
            policy: DependencyPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DependencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve the telemetry and alert extension of each stub, in order.
    ///
    /// An unreachable telemetry or alert service yields absent fields when
    /// its policy is [`FieldPolicy::Optional`] and an error otherwise.
    pub async fn extend_robots(&self, stubs: &[EntityStub]) -> Result<Vec<RobotExtension>> {
        let ids: Vec<RobotId> = stubs.iter().map(|stub| stub.id.clone()).collect();

        let (telemetry, alerts) = tokio::join!(
            self.context.telemetry().load_many(&ids),
            self.context.alerts().load_many(&ids),
        );
        let telemetry = settle_many(self.policy.telemetry, "telemetry", telemetry, ids.len())?;
        let alerts = settle_many(self.policy.alerts, "alerts", alerts, ids.len())?;

        Ok(telemetry
            .into_iter()
            .zip(alerts)
            .map(|(latest_telemetry, active_alerts)| RobotExtension {
                latest_telemetry,
                active_alerts: active_alerts.unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl EntityResolver for ReferenceResolver<'_> {
    async fn resolve_references(
        &self,
        entity: EntityType,
        keys: &[String],
    ) -> Result<Vec<Option<Entity>>> {
        let context = self.context;
        let resolved = match entity {
            EntityType::Robots => load_parsed(context.robots(), keys)
                .await?
                .into_iter()
                .map(|r| r.map(Entity::Robot))
                .collect(),
            EntityType::Telemetry => load_parsed(context.telemetry(), keys)
                .await?
                .into_iter()
                .map(|t| t.map(Entity::Telemetry))
                .collect(),
            EntityType::Alerts => load_parsed(context.alerts(), keys)
                .await?
                .into_iter()
                .map(|a| a.map(Entity::Alerts))
                .collect(),
            EntityType::Users => load_parsed(context.users(), keys)
                .await?
                .into_iter()
                .map(|u| u.map(Entity::User))
                .collect(),
            EntityType::Sites => load_parsed(context.sites(), keys)
                .await?
                .into_iter()
                .map(|s| s.map(Entity::Site))
                .collect(),
        };
        Ok(resolved)
    }
}
