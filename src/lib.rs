//! # fleet-batching
//!
//! Request-scoped batching for the fleet monitoring services.
//!
//! ## Features
//!
//! - **Keyed Batcher** - coalesces scattered `load(key)` calls into one bulk fetch per entity type
//! - **Bulk Fetchers** - in-memory and HTTP adapters behind one `BulkFetcher` trait
//! - **Request Context** - one fresh set of batchers per inbound request
//! - **Orchestrator** - sequential, parallel-gather and batched joins over the same entity graph
//! - **Federation** - reference resolution for entities owned by another service
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleet_batching::{FleetServices, InMemoryFleet, Include, Orchestrator, Strategy};
//!
//! # async fn example() -> fleet_batching::Result<()> {
//! let fleet = Arc::new(InMemoryFleet::seeded(&Default::default(), Default::default()));
//! let services = FleetServices::in_memory(fleet, Default::default());
//! let orchestrator = Orchestrator::new(services.clone());
//!
//! // One context per inbound request
//! let context = services.new_context();
//! let views = orchestrator
//!     .dashboard(&context, Strategy::Batched, Include::dashboard())
//!     .await?;
//! assert_eq!(views.len(), 15);
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod config;
pub mod context;
pub mod federation;
pub mod fetchers;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod policy;
pub mod schema;
pub mod server;
pub mod store;
pub mod types;

pub use batcher::{BatchConfig, BulkFetcher, KeyedBatcher};
pub use config::FleetConfig;
pub use context::{FleetServices, RequestContext};
pub use federation::{Entity, EntityResolver, EntityStub, ReferenceResolver, RobotExtension};
pub use fetchers::{FleetCatalog, HttpBulkFetcher, RecordingFetcher};
pub use model::{Alert, EntityType, Robot, RobotId, Site, SiteId, Telemetry, User, UserId};
pub use orchestrator::{CriticalAlertView, Include, Orchestrator, RobotView, Strategy};
pub use policy::{DependencyPolicy, FieldPolicy};
pub use schema::{build_schema, FleetSchema};
pub use store::{InMemoryFleet, LatencyProfile, SeedConfig};
pub use types::Timestamp;

use thiserror::Error;

/// Failure of a bulk call to the service or store that owns an entity type.
///
/// Distinct from "not found": a missing record is a `None` result, never a `FetchError`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("{entity} service unavailable: {message}")]
    Unavailable { entity: EntityType, message: String },

    #[error("{entity} request timed out")]
    Timeout { entity: EntityType },

    #[error("{entity} service responded with status {status}")]
    Status { entity: EntityType, status: u16 },

    #[error("malformed {entity} response: {message}")]
    Malformed { entity: EntityType, message: String },
}

impl FetchError {
    /// Entity type whose owning service failed
    pub fn entity(&self) -> EntityType {
        match self {
            FetchError::Unavailable { entity, .. }
            | FetchError::Timeout { entity }
            | FetchError::Status { entity, .. }
            | FetchError::Malformed { entity, .. } => *entity,
        }
    }
}

/// Fleet errors
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{entity} batch was abandoned before it completed")]
    BatchAbandoned { entity: EntityType },

    #[error("invalid configuration for {key}: {message}")]
    Configuration { key: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fleet operations
pub type Result<T> = std::result::Result<T, Error>;
