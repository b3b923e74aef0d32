//! GraphQL schema for the fleet gateway
//!
//! Every relation field reads through the [`RequestContext`] attached to the
//! request, so sibling fields in one query share one bulk call per entity type.
//! Federation entity resolvers for `Robot`, `User` and `Site` go through the
//! same batchers, which makes `_entities` queries coalesce as well.

use async_graphql::{ComplexObject, Context, EmptyMutation, EmptySubscription, Object, Schema};

use crate::context::{FleetServices, RequestContext};
use crate::model::{Alert, Robot, Site, SiteId, Telemetry, User, UserId};
use crate::policy::DependencyPolicy;

/// Fleet gateway schema
pub type FleetSchema = Schema<QueryRoot, EmptyMutation, EmptySubscription>;

/// Build the schema with the default dependency policy
pub fn build_schema(services: FleetServices) -> FleetSchema {
    build_schema_with_policy(services, DependencyPolicy::default())
}

pub fn build_schema_with_policy(services: FleetServices, policy: DependencyPolicy) -> FleetSchema {
    Schema::build(QueryRoot, EmptyMutation, EmptySubscription)
        .data(services)
        .data(policy)
        .enable_federation()
        .finish()
}

/// Request-scoped batchers attached by the transport
fn request_context<'a>(ctx: &Context<'a>) -> async_graphql::Result<&'a RequestContext> {
    ctx.data::<RequestContext>()
}

fn policy(ctx: &Context<'_>) -> DependencyPolicy {
    ctx.data_opt::<DependencyPolicy>().copied().unwrap_or_default()
}

/// Lists robots and primes them into the request's robot batcher
async fn primed_robots(ctx: &Context<'_>) -> async_graphql::Result<Vec<Robot>> {
    let services = ctx.data::<FleetServices>()?;
    let robots = services.catalog.list_robots().await?;

    let request = request_context(ctx)?;
    for robot in &robots {
        request.robots().prime(robot.id.clone(), robot.clone()).await;
    }
    Ok(robots)
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Every robot, ordered by id
    async fn robots(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Robot>> {
        primed_robots(ctx).await
    }

    /// First `limit` robots, the shape rendered by the fleet dashboard
    async fn fleet_dashboard(
        &self,
        ctx: &Context<'_>,
        #[graphql(default = 15)] limit: i32,
    ) -> async_graphql::Result<Vec<Robot>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut robots = primed_robots(ctx).await?;
        robots.truncate(limit);
        Ok(robots)
    }

    async fn robot(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<Option<Robot>> {
        Ok(request_context(ctx)?.robots().load(id).await?)
    }

    /// Critical alerts, newest first
    async fn critical_alerts(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Alert>> {
        let services = ctx.data::<FleetServices>()?;
        Ok(services.catalog.critical_alerts().await?)
    }

    #[graphql(entity)]
    async fn find_robot_by_id(
        &self,
        ctx: &Context<'_>,
        id: String,
    ) -> async_graphql::Result<Option<Robot>> {
        Ok(request_context(ctx)?.robots().load(id).await?)
    }

    #[graphql(entity)]
    async fn find_user_by_id(
        &self,
        ctx: &Context<'_>,
        id: UserId,
    ) -> async_graphql::Result<Option<User>> {
        Ok(request_context(ctx)?.users().load(id).await?)
    }

    #[graphql(entity)]
    async fn find_site_by_id(
        &self,
        ctx: &Context<'_>,
        id: SiteId,
    ) -> async_graphql::Result<Option<Site>> {
        Ok(request_context(ctx)?.sites().load(id).await?)
    }
}

#[ComplexObject]
impl Robot {
    /// Latest reading, absent while the telemetry service is unreachable
    async fn latest_telemetry(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<Telemetry>> {
        let loaded = request_context(ctx)?.telemetry().load(self.id.clone()).await;
        Ok(policy(ctx).telemetry.settle("telemetry", loaded)?)
    }

    async fn active_alerts(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Alert>> {
        let loaded = request_context(ctx)?.alerts().load(self.id.clone()).await;
        Ok(policy(ctx)
            .alerts
            .settle("alerts", loaded)?
            .unwrap_or_default())
    }

    async fn owner(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<User>> {
        let loaded = request_context(ctx)?.users().load(self.owner_id).await;
        Ok(policy(ctx).owner.settle("owner", loaded)?)
    }

    async fn site(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<Site>> {
        let loaded = request_context(ctx)?.sites().load(self.site_id).await;
        Ok(policy(ctx).site.settle("site", loaded)?)
    }
}

#[ComplexObject]
impl Alert {
    /// Robot the alert was raised on
    async fn robot(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<Robot>> {
        Ok(request_context(ctx)?
            .robots()
            .load(self.robot_id.clone())
            .await?)
    }
}
