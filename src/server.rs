//! HTTP surface of the fleet gateway
//!
//! Serves the entity endpoints of the in-memory store (the same shape the
//! HTTP bulk fetcher calls), the orchestrated fleet views and `/graphql`.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use async_graphql::{Request, Response};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::batcher::BulkFetcher;
use crate::context::{FleetServices, RequestContext};
use crate::model::{EntityType, RobotId, SiteId, UserId};
use crate::orchestrator::{Include, Orchestrator, Strategy};
use crate::schema::{build_schema, FleetSchema};
use crate::store::InMemoryFleet;
use crate::{Error, FetchError};

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    /// In-process fetchers answering the entity endpoints
    owned: FleetServices,
    orchestrator: Orchestrator,
    schema: FleetSchema,
}

impl AppState {
    /// Entity endpoints serve `fleet`; views and GraphQL join through the
    /// orchestrator's services, which may be remote.
    pub fn new(fleet: Arc<InMemoryFleet>, orchestrator: Orchestrator) -> Self {
        let services = orchestrator.services().clone();
        Self {
            owned: FleetServices::in_memory(fleet, services.batch),
            schema: build_schema(services),
            orchestrator,
        }
    }

    fn new_context(&self, headers: &HeaderMap) -> RequestContext {
        let request_id = extract_request_id(headers).unwrap_or_else(Uuid::new_v4);
        RequestContext::with_request_id(self.orchestrator.services(), request_id)
    }
}

/// Extract the request id from the x-request-id header
pub fn extract_request_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/graphql", post(graphql_handler))
        .route("/robots", get(list_robots_handler))
        .route("/alerts/critical", get(critical_alerts_handler))
        .route("/fleet/dashboard", get(dashboard_handler))
        .route("/fleet/robots/{id}/monitor", get(monitor_handler))
        .route("/fleet/alerts/critical", get(fleet_alerts_handler));

    for entity in EntityType::ALL {
        router = router
            .route(
                &format!("/{}/batch", entity.path()),
                post(move |state: State<AppState>, body: Json<BatchRequest>| {
                    batch_handler(state, entity, body)
                }),
            )
            .route(
                &format!("/{}/{{id}}", entity.path()),
                get(move |state: State<AppState>, id: Path<String>| {
                    entity_handler(state, entity, id)
                }),
            );
    }

    router.with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Upstream(FetchError),
    Internal(String),
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        ApiError::Upstream(err)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Fetch(fetch) => ApiError::Upstream(fetch),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Upstream(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            ApiError::Internal(message) => {
                error!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// GraphQL handler with a fresh request context per request
async fn graphql_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Json<Request>,
) -> Json<Response> {
    let context = state.new_context(&headers);
    info!(request_id = %context.request_id(), "graphql request");

    let request = req.0.data(context);
    Json(state.schema.execute(request).await)
}

async fn list_robots_handler(State(state): State<AppState>) -> ApiResult<HttpResponse> {
    let robots = state.owned.catalog.list_robots().await?;
    Ok(Json(robots).into_response())
}

async fn critical_alerts_handler(State(state): State<AppState>) -> ApiResult<HttpResponse> {
    let alerts = state.owned.catalog.critical_alerts().await?;
    Ok(Json(alerts).into_response())
}

/// Body of `POST /{entity}/batch`
#[derive(Debug, Default, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    robot_ids: Vec<RobotId>,
    #[serde(default)]
    user_ids: Vec<UserId>,
    #[serde(default)]
    site_ids: Vec<SiteId>,
}

/// Every requested id mapped to its record or `null`
async fn batch_response<K, V>(fetcher: &dyn BulkFetcher<K, V>, keys: &[K]) -> ApiResult<HttpResponse>
where
    K: Send + Sync + Clone + Eq + Hash + Display + 'static,
    V: Send + Sync + Clone + Serialize + 'static,
{
    let found = fetcher.fetch(keys).await?;
    let body: HashMap<String, Option<V>> = keys
        .iter()
        .map(|key| (key.to_string(), found.get(key).cloned()))
        .collect();
    Ok(Json(body).into_response())
}

async fn batch_handler(
    State(state): State<AppState>,
    entity: EntityType,
    Json(body): Json<BatchRequest>,
) -> ApiResult<HttpResponse> {
    let owned = &state.owned;
    match entity {
        EntityType::Robots => batch_response(owned.robots.as_ref(), &body.robot_ids).await,
        EntityType::Telemetry => batch_response(owned.telemetry.as_ref(), &body.robot_ids).await,
        EntityType::Alerts => batch_response(owned.alerts.as_ref(), &body.robot_ids).await,
        EntityType::Users => batch_response(owned.users.as_ref(), &body.user_ids).await,
        EntityType::Sites => batch_response(owned.sites.as_ref(), &body.site_ids).await,
    }
}

async fn single_response<K, V>(
    fetcher: &dyn BulkFetcher<K, V>,
    entity: EntityType,
    raw_id: &str,
) -> ApiResult<HttpResponse>
where
    K: Send + Sync + Clone + Eq + Hash + FromStr + 'static,
    V: Send + Sync + Clone + Serialize + 'static,
{
    let not_found = || ApiError::NotFound(format!("{entity} {raw_id} not found"));
    let key: K = raw_id.parse().map_err(|_| not_found())?;
    match fetcher.fetch_one(&key).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(not_found()),
    }
}

async fn entity_handler(
    State(state): State<AppState>,
    entity: EntityType,
    Path(id): Path<String>,
) -> ApiResult<HttpResponse> {
    let owned = &state.owned;
    match entity {
        EntityType::Robots => single_response(owned.robots.as_ref(), entity, &id).await,
        EntityType::Telemetry => single_response(owned.telemetry.as_ref(), entity, &id).await,
        EntityType::Alerts => single_response(owned.alerts.as_ref(), entity, &id).await,
        EntityType::Users => single_response(owned.users.as_ref(), entity, &id).await,
        EntityType::Sites => single_response(owned.sites.as_ref(), entity, &id).await,
    }
}

#[derive(Debug, Default, Deserialize)]
struct ViewQuery {
    #[serde(default)]
    strategy: Strategy,
    /// Join owner and site too
    #[serde(default)]
    full: bool,
}

async fn dashboard_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ViewQuery>,
) -> ApiResult<HttpResponse> {
    let context = state.new_context(&headers);
    let include = if query.full {
        Include::all()
    } else {
        Include::dashboard()
    };
    let views = state
        .orchestrator
        .dashboard(&context, query.strategy, include)
        .await?;
    Ok(Json(views).into_response())
}

async fn monitor_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> ApiResult<HttpResponse> {
    let context = state.new_context(&headers);
    match state
        .orchestrator
        .robot_monitor(&context, query.strategy, &id)
        .await?
    {
        Some(view) => Ok(Json(view).into_response()),
        None => Err(ApiError::NotFound(format!("robot {id} not found"))),
    }
}

async fn fleet_alerts_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ViewQuery>,
) -> ApiResult<HttpResponse> {
    let context = state.new_context(&headers);
    let views = state
        .orchestrator
        .critical_alerts(&context, query.strategy)
        .await?;
    Ok(Json(views).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::BatchConfig;
    use crate::store::{LatencyProfile, SeedConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<InMemoryFleet>) {
        let fleet = Arc::new(InMemoryFleet::seeded(
            &SeedConfig::default(),
            LatencyProfile::none(),
        ));
        let services = FleetServices::in_memory(fleet.clone(), BatchConfig::default());
        let state = AppState::new(fleet.clone(), Orchestrator::new(services));
        (router(state), fleet)
    }

    async fn call(app: Router, request: HttpRequest<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::get(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_request_id() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        assert_eq!(extract_request_id(&headers), None);

        headers.insert("x-request-id", "not-a-uuid".parse().unwrap());
        assert_eq!(extract_request_id(&headers), None);

        headers.insert("x-request-id", id.to_string().parse().unwrap());
        assert_eq!(extract_request_id(&headers), Some(id));
    }

    #[tokio::test]
    async fn test_batch_endpoint_maps_every_id() {
        let (app, _) = app();
        let request = HttpRequest::post("/users/batch")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"user_ids": [2, 42]}"#))
            .unwrap();

        let (status, body) = call(app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["2"]["name"], "User2");
        assert!(body["42"].is_null());
    }

    #[tokio::test]
    async fn test_batch_endpoint_repeated_ids() {
        let (app, _) = app();
        let request = HttpRequest::post("/robots/batch")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"robot_ids": ["robot-002", "robot-404", "robot-002"]}"#,
            ))
            .unwrap();

        let (status, body) = call(app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["robot-002"]["name"], "AGV-2");
        assert!(body["robot-404"].is_null());
        assert_eq!(body.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_single_entity_not_found() {
        let (app, _) = app();
        let (status, _) = call(app.clone(), get("/robots/robot-404")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(app, get("/sites/abc")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_outage_maps_to_service_unavailable() {
        let (app, fleet) = app();
        fleet.set_outage(EntityType::Robots, true).await;

        let (status, body) = call(app, get("/fleet/dashboard?strategy=parallel")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("robots"));
    }

    #[tokio::test]
    async fn test_dashboard_strategies_agree() {
        let (app, _) = app();
        let (_, sequential) = call(app.clone(), get("/fleet/dashboard?strategy=sequential")).await;
        let (status, batched) = call(app, get("/fleet/dashboard")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(sequential, batched);
        assert_eq!(batched.as_array().unwrap().len(), 15);
    }

    #[tokio::test]
    async fn test_monitor_unknown_robot() {
        let (app, _) = app();
        let (status, _) = call(app, get("/fleet/robots/robot-999/monitor")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_graphql_endpoint() {
        let (app, _) = app();
        let request = HttpRequest::post("/graphql")
            .header("content-type", "application/json")
            .header("x-request-id", Uuid::new_v4().to_string())
            .body(Body::from(
                r#"{"query": "{ robot(id: \"robot-002\") { name site { name } } }"}"#,
            ))
            .unwrap();

        let (status, body) = call(app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["robot"]["name"], "AGV-2");
        assert_eq!(body["data"]["robot"]["site"]["name"], "Site-2");
    }
}
