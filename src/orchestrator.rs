//! Fleet view orchestration
//!
//! Joins robots with their owner, site, telemetry and alerts using one of three
//! interchangeable strategies. All three produce the same views for the same
//! data; they differ only in how many downstream calls they make and how long
//! the caller waits.
//!
//! | Strategy | Calls for N robots | Latency |
//! |---|---|---|
//! | [`Strategy::Sequential`] | one per relation per robot | sum of every call |
//! | [`Strategy::Parallel`] | one per relation per robot | slowest call |
//! | [`Strategy::Batched`] | one per relation | slowest bulk call |

use std::future::Future;

use futures::future::try_join_all;
use futures::TryFutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::context::{FleetServices, RequestContext};
use crate::model::{Alert, Robot, Site, Telemetry, User};
use crate::policy::{DependencyPolicy, FieldPolicy};
use crate::{Error, Result};

const DEFAULT_DASHBOARD_LIMIT: usize = 15;

/// How child lookups are issued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One call per child per item, strictly in order (the N+1 baseline)
    Sequential,
    /// Same calls as sequential, issued concurrently
    Parallel,
    /// Child lookups coalesced through the request's batchers
    #[default]
    Batched,
}

/// Relations joined onto each robot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Include {
    pub owner: bool,
    pub site: bool,
    pub telemetry: bool,
    pub alerts: bool,
}

impl Include {
    /// Telemetry and alerts, the fleet dashboard's shape
    pub fn dashboard() -> Self {
        Self {
            owner: false,
            site: false,
            telemetry: true,
            alerts: true,
        }
    }

    pub fn all() -> Self {
        Self {
            owner: true,
            site: true,
            telemetry: true,
            alerts: true,
        }
    }
}

/// Robot joined with its relations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotView {
    #[serde(flatten)]
    pub robot: Robot,
    pub owner: Option<User>,
    pub site: Option<Site>,
    pub telemetry: Option<Telemetry>,
    pub alerts: Vec<Alert>,
}

/// Critical alert with the robot it was raised on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalAlertView {
    #[serde(flatten)]
    pub alert: Alert,
    pub robot: Option<Robot>,
    pub telemetry: Option<Telemetry>,
}

async fn relation<T>(
    enabled: bool,
    policy: FieldPolicy,
    field: &'static str,
    lookup: impl Future<Output = Result<Option<T>>>,
) -> Result<Option<T>> {
    if !enabled {
        return Ok(None);
    }
    policy.settle(field, lookup.await)
}

/// Composes fleet views over [`FleetServices`]
#[derive(Clone)]
pub struct Orchestrator {
    services: FleetServices,
    policy: DependencyPolicy,
    dashboard_limit: usize,
}

impl Orchestrator {
    pub fn new(services: FleetServices) -> Self {
        Self {
            services,
            policy: DependencyPolicy::default(),
            dashboard_limit: DEFAULT_DASHBOARD_LIMIT,
        }
    }

    pub fn with_policy(mut self, policy: DependencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_dashboard_limit(mut self, limit: usize) -> Self {
        self.dashboard_limit = limit;
        self
    }

    pub fn services(&self) -> &FleetServices {
        &self.services
    }

    /// First `dashboard_limit` robots joined with `include`.
    ///
    /// Only the batched strategy reads through `context`.
    #[instrument(skip(self, context), fields(request_id = %context.request_id()))]
    pub async fn dashboard(
        &self,
        context: &RequestContext,
        strategy: Strategy,
        include: Include,
    ) -> Result<Vec<RobotView>> {
        let robots: Vec<Robot> = self
            .services
            .catalog
            .list_robots()
            .await?
            .into_iter()
            .take(self.dashboard_limit)
            .collect();
        debug!(robots = robots.len(), "joining dashboard");

        match strategy {
            Strategy::Sequential => {
                let mut views = Vec::with_capacity(robots.len());
                for robot in robots {
                    views.push(self.join_sequential(robot, include).await?);
                }
                Ok(views)
            }
            Strategy::Parallel => {
                try_join_all(robots.into_iter().map(|robot| self.join_parallel(robot, include)))
                    .await
            }
            Strategy::Batched => {
                for robot in &robots {
                    context.robots().prime(robot.id.clone(), robot.clone()).await;
                }
                try_join_all(
                    robots
                        .into_iter()
                        .map(|robot| self.join_batched(context, robot, include)),
                )
                .await
            }
        }
    }

    /// One robot with every relation, `None` when the robot does not exist
    #[instrument(skip(self, context), fields(request_id = %context.request_id()))]
    pub async fn robot_monitor(
        &self,
        context: &RequestContext,
        strategy: Strategy,
        robot_id: &str,
    ) -> Result<Option<RobotView>> {
        let robot_id = robot_id.to_string();
        let robot = match strategy {
            Strategy::Sequential | Strategy::Parallel => {
                self.services.robots.fetch_one(&robot_id).await?
            }
            Strategy::Batched => context.robots().load(robot_id).await?,
        };
        let Some(robot) = robot else {
            return Ok(None);
        };

        let view = match strategy {
            Strategy::Sequential => self.join_sequential(robot, Include::all()).await?,
            Strategy::Parallel => self.join_parallel(robot, Include::all()).await?,
            Strategy::Batched => self.join_batched(context, robot, Include::all()).await?,
        };
        Ok(Some(view))
    }

    /// Every critical alert with its robot and that robot's telemetry
    #[instrument(skip(self, context), fields(request_id = %context.request_id()))]
    pub async fn critical_alerts(
        &self,
        context: &RequestContext,
        strategy: Strategy,
    ) -> Result<Vec<CriticalAlertView>> {
        let alerts = self.services.catalog.critical_alerts().await?;
        debug!(alerts = alerts.len(), "joining critical alerts");

        match strategy {
            Strategy::Sequential => {
                let mut views = Vec::with_capacity(alerts.len());
                for alert in alerts {
                    let robot = self
                        .services
                        .robots
                        .fetch_one(&alert.robot_id)
                        .await?;
                    let telemetry = self.policy.telemetry.settle(
                        "telemetry",
                        self.services
                            .telemetry
                            .fetch_one(&alert.robot_id)
                            .map_err(Error::from)
                            .await,
                    )?;
                    views.push(CriticalAlertView {
                        alert,
                        robot,
                        telemetry,
                    });
                }
                Ok(views)
            }
            Strategy::Parallel => {
                try_join_all(alerts.into_iter().map(|alert| async move {
                    let (robot, telemetry) = tokio::join!(
                        self.services.robots.fetch_one(&alert.robot_id).map_err(Error::from),
                        self.services
                            .telemetry
                            .fetch_one(&alert.robot_id)
                            .map_err(Error::from),
                    );
                    let robot = robot?;
                    let telemetry = self.policy.telemetry.settle("telemetry", telemetry)?;
                    Ok::<_, Error>(CriticalAlertView {
                        alert,
                        robot,
                        telemetry,
                    })
                }))
                .await
            }
            Strategy::Batched => {
                try_join_all(alerts.into_iter().map(|alert| async move {
                    let (robot, telemetry) = tokio::join!(
                        context.robots().load(alert.robot_id.clone()),
                        context.telemetry().load(alert.robot_id.clone()),
                    );
                    let robot = robot?;
                    let telemetry = self.policy.telemetry.settle("telemetry", telemetry)?;
                    Ok::<_, Error>(CriticalAlertView {
                        alert,
                        robot,
                        telemetry,
                    })
                }))
                .await
            }
        }
    }

    async fn join_sequential(&self, robot: Robot, include: Include) -> Result<RobotView> {
        let services = &self.services;
        let policy = &self.policy;

        let owner = relation(
            include.owner,
            policy.owner,
            "owner",
            services.users.fetch_one(&robot.owner_id).map_err(Error::from),
        )
        .await?;
        let site = relation(
            include.site,
            policy.site,
            "site",
            services.sites.fetch_one(&robot.site_id).map_err(Error::from),
        )
        .await?;
        let telemetry = relation(
            include.telemetry,
            policy.telemetry,
            "telemetry",
            services.telemetry.fetch_one(&robot.id).map_err(Error::from),
        )
        .await?;
        let alerts = relation(
            include.alerts,
            policy.alerts,
            "alerts",
            services.alerts.fetch_one(&robot.id).map_err(Error::from),
        )
        .await?;

        Ok(RobotView {
            robot,
            owner,
            site,
            telemetry,
            alerts: alerts.unwrap_or_default(),
        })
    }

    async fn join_parallel(&self, robot: Robot, include: Include) -> Result<RobotView> {
        let services = &self.services;
        let policy = &self.policy;

        let (owner, site, telemetry, alerts) = tokio::join!(
            relation(
                include.owner,
                policy.owner,
                "owner",
                services.users.fetch_one(&robot.owner_id).map_err(Error::from),
            ),
            relation(
                include.site,
                policy.site,
                "site",
                services.sites.fetch_one(&robot.site_id).map_err(Error::from),
            ),
            relation(
                include.telemetry,
                policy.telemetry,
                "telemetry",
                services.telemetry.fetch_one(&robot.id).map_err(Error::from),
            ),
            relation(
                include.alerts,
                policy.alerts,
                "alerts",
                services.alerts.fetch_one(&robot.id).map_err(Error::from),
            ),
        );

        Ok(RobotView {
            owner: owner?,
            site: site?,
            telemetry: telemetry?,
            alerts: alerts?.unwrap_or_default(),
            robot,
        })
    }

    async fn join_batched(
        &self,
        context: &RequestContext,
        robot: Robot,
        include: Include,
    ) -> Result<RobotView> {
        let policy = &self.policy;

        let (owner, site, telemetry, alerts) = tokio::join!(
            relation(
                include.owner,
                policy.owner,
                "owner",
                context.users().load(robot.owner_id),
            ),
            relation(
                include.site,
                policy.site,
                "site",
                context.sites().load(robot.site_id),
            ),
            relation(
                include.telemetry,
                policy.telemetry,
                "telemetry",
                context.telemetry().load(robot.id.clone()),
            ),
            relation(
                include.alerts,
                policy.alerts,
                "alerts",
                context.alerts().load(robot.id.clone()),
            ),
        );

        Ok(RobotView {
            owner: owner?,
            site: site?,
            telemetry: telemetry?,
            alerts: alerts?.unwrap_or_default(),
            robot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::BatchConfig;
    use crate::store::{InMemoryFleet, LatencyProfile, SeedConfig};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn orchestrator() -> (Orchestrator, Arc<InMemoryFleet>) {
        let fleet = Arc::new(InMemoryFleet::seeded(
            &SeedConfig::default(),
            LatencyProfile::none(),
        ));
        let services = FleetServices::in_memory(fleet.clone(), BatchConfig::default());
        (Orchestrator::new(services), fleet)
    }

    #[tokio::test]
    async fn test_strategies_agree_on_dashboard() {
        let (orchestrator, _) = orchestrator();

        let mut results = Vec::new();
        for strategy in [Strategy::Sequential, Strategy::Parallel, Strategy::Batched] {
            let context = orchestrator.services().new_context();
            results.push(assert_ok!(
                orchestrator
                    .dashboard(&context, strategy, Include::all())
                    .await
            ));
        }

        assert_eq!(results[0].len(), 15);
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[tokio::test]
    async fn test_dashboard_limit() {
        let (orchestrator, _) = orchestrator();
        let orchestrator = orchestrator.with_dashboard_limit(4);
        let context = orchestrator.services().new_context();

        let views = assert_ok!(
            orchestrator
                .dashboard(&context, Strategy::Batched, Include::dashboard())
                .await
        );

        assert_eq!(views.len(), 4);
        assert!(views.iter().all(|v| v.owner.is_none() && v.site.is_none()));
    }

    #[tokio::test]
    async fn test_robot_monitor_unknown_robot() {
        let (orchestrator, _) = orchestrator();
        for strategy in [Strategy::Sequential, Strategy::Parallel, Strategy::Batched] {
            let context = orchestrator.services().new_context();
            let view = assert_ok!(
                orchestrator
                    .robot_monitor(&context, strategy, "robot-404")
                    .await
            );
            assert!(view.is_none());
        }
    }

    #[tokio::test]
    async fn test_robot_monitor_joins_everything() {
        let (orchestrator, _) = orchestrator();
        let context = orchestrator.services().new_context();

        let view = assert_ok!(
            orchestrator
                .robot_monitor(&context, Strategy::Batched, "robot-003")
                .await
        )
        .expect("robot-003 exists");

        assert_eq!(view.robot.id, "robot-003");
        assert_eq!(view.owner.map(|u| u.id), Some(3));
        assert_eq!(view.site.map(|s| s.id), Some(3));
        assert!(view.telemetry.is_some());
        assert_eq!(view.alerts.len(), 3);
    }

    #[tokio::test]
    async fn test_strategies_agree_on_critical_alerts() {
        let (orchestrator, _) = orchestrator();

        let mut results = Vec::new();
        for strategy in [Strategy::Sequential, Strategy::Parallel, Strategy::Batched] {
            let context = orchestrator.services().new_context();
            results.push(assert_ok!(
                orchestrator.critical_alerts(&context, strategy).await
            ));
        }

        assert!(!results[0].is_empty());
        assert!(results[0].iter().all(|v| v.robot.is_some()));
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[tokio::test]
    async fn test_required_relation_failure_fails_view() {
        let (orchestrator, fleet) = orchestrator();
        fleet.set_outage(crate::EntityType::Users, true).await;

        for strategy in [Strategy::Sequential, Strategy::Parallel, Strategy::Batched] {
            let context = orchestrator.services().new_context();
            let result = orchestrator
                .dashboard(&context, strategy, Include::all())
                .await;
            assert!(matches!(result, Err(Error::Fetch(_))));
        }
    }

    #[test]
    fn test_strategy_serde() {
        let parsed: Strategy = serde_json::from_str("\"parallel\"").unwrap();
        assert_eq!(parsed, Strategy::Parallel);
        assert_eq!(Strategy::default(), Strategy::Batched);
    }
}
