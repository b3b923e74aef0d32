//! Per-field failure policy
//!
//! Batchers never hide a failed fetch. Whether a failed side-car lookup aborts
//! the response or is reported absent is decided here, by the component that
//! assembles the response.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

/// What to do when the service owning a field cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldPolicy {
    /// Propagate the failure and fail the whole response
    Required,
    /// Report the field absent and keep the rest of the response
    Optional,
}

impl FieldPolicy {
    /// Apply the policy to the outcome of a lookup.
    ///
    /// A missing record is `Ok(None)` under both policies; only failures differ.
    pub fn settle<T>(self, field: &'static str, outcome: Result<Option<T>>) -> Result<Option<T>> {
        match (self, outcome) {
            (_, Ok(value)) => Ok(value),
            (FieldPolicy::Optional, Err(err)) => {
                warn!(field, error = %err, "optional dependency failed, reporting field absent");
                Ok(None)
            }
            (FieldPolicy::Required, Err(err)) => Err(err),
        }
    }
}

/// Policies for the relations joined onto a robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyPolicy {
    pub owner: FieldPolicy,
    pub site: FieldPolicy,
    pub telemetry: FieldPolicy,
    pub alerts: FieldPolicy,
}

impl Default for DependencyPolicy {
    fn default() -> Self {
        Self {
            owner: FieldPolicy::Required,
            site: FieldPolicy::Required,
            telemetry: FieldPolicy::Optional,
            alerts: FieldPolicy::Optional,
        }
    }
}

impl DependencyPolicy {
    /// Every relation required; any failure fails the response
    pub fn strict() -> Self {
        Self {
            owner: FieldPolicy::Required,
            site: FieldPolicy::Required,
            telemetry: FieldPolicy::Required,
            alerts: FieldPolicy::Required,
        }
    }
}
