use std::sync::Arc;

use fleet_batching::config::FleetConfig;
use fleet_batching::observability::init_logging;
use fleet_batching::server::{router, AppState};
use fleet_batching::{Error, FleetServices, InMemoryFleet, Orchestrator, Result};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = FleetConfig::from_env()?;
    init_logging(config.log_format);

    let fleet = Arc::new(InMemoryFleet::seeded(&config.seed, config.latency));
    let services = match &config.upstream_url {
        Some(url) => {
            info!(upstream = %url, "joining against remote fleet services");
            FleetServices::over_http(url, config.request_timeout, config.batch)
        }
        None => FleetServices::in_memory(fleet.clone(), config.batch),
    };
    let orchestrator = Orchestrator::new(services).with_dashboard_limit(config.dashboard_limit);
    let app = router(AppState::new(fleet, orchestrator));

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "fleet gateway listening");

    axum::serve(listener, app).await.map_err(Error::from)
}
