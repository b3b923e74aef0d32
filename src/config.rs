//! Gateway configuration from `FLEET_*` environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `FLEET_BIND_ADDR` | `0.0.0.0:8080` |
//! | `FLEET_UPSTREAM_URL` | unset: join against the in-memory store |
//! | `FLEET_NUM_ROBOTS` / `FLEET_NUM_USERS` / `FLEET_NUM_SITES` | 15 / 10 / 5 |
//! | `FLEET_LATENCY_LIST_MS` / `_SINGLE_MS` / `_BATCH_MS` | 15 / 7 / 10 |
//! | `FLEET_LATENCY_PER_KEY_US` | 100 |
//! | `FLEET_BATCH_DELAY_MS` | 2 |
//! | `FLEET_MAX_BATCH_SIZE` | 1000 |
//! | `FLEET_DASHBOARD_LIMIT` | 15 |
//! | `FLEET_REQUEST_TIMEOUT_SECS` | 30 |
//! | `FLEET_LOG_FORMAT` | `pretty` |

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::batcher::BatchConfig;
use crate::observability::LogFormat;
use crate::store::{LatencyProfile, SeedConfig};
use crate::{Error, Result};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub bind_addr: SocketAddr,
    /// Base URL of the services owning the entities; `None` serves them in-process
    pub upstream_url: Option<String>,
    pub seed: SeedConfig,
    pub latency: LatencyProfile,
    pub batch: BatchConfig,
    pub dashboard_limit: usize,
    pub request_timeout: Duration,
    pub log_format: LogFormat,
}

impl FleetConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let seed_defaults = SeedConfig::default();
        let latency_defaults = LatencyProfile::default();
        let batch_defaults = BatchConfig::default();

        let bind_addr = parse(&lookup, "FLEET_BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?;
        let upstream_url = lookup("FLEET_UPSTREAM_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let seed = SeedConfig {
            robots: parse(&lookup, "FLEET_NUM_ROBOTS", Some(seed_defaults.robots))?,
            users: parse(&lookup, "FLEET_NUM_USERS", Some(seed_defaults.users))?,
            sites: parse(&lookup, "FLEET_NUM_SITES", Some(seed_defaults.sites))?,
        };

        let latency = LatencyProfile {
            list: millis(&lookup, "FLEET_LATENCY_LIST_MS", latency_defaults.list)?,
            single: millis(&lookup, "FLEET_LATENCY_SINGLE_MS", latency_defaults.single)?,
            batch: millis(&lookup, "FLEET_LATENCY_BATCH_MS", latency_defaults.batch)?,
            per_key: Duration::from_micros(parse(
                &lookup,
                "FLEET_LATENCY_PER_KEY_US",
                u64::try_from(latency_defaults.per_key.as_micros()).ok(),
            )?),
        };

        let max_batch_size: usize = parse(
            &lookup,
            "FLEET_MAX_BATCH_SIZE",
            Some(batch_defaults.max_batch_size),
        )?;
        if max_batch_size == 0 {
            return Err(invalid("FLEET_MAX_BATCH_SIZE", "must be at least 1"));
        }
        let batch = batch_defaults
            .with_delay(millis(&lookup, "FLEET_BATCH_DELAY_MS", batch_defaults.delay)?)
            .with_max_batch_size(max_batch_size);

        let log_format = match lookup("FLEET_LOG_FORMAT") {
            Some(value) => value.trim().parse()?,
            None => LogFormat::default(),
        };

        Ok(Self {
            bind_addr,
            upstream_url,
            seed,
            latency,
            batch,
            dashboard_limit: parse(&lookup, "FLEET_DASHBOARD_LIMIT", Some(15))?,
            request_timeout: Duration::from_secs(parse(
                &lookup,
                "FLEET_REQUEST_TIMEOUT_SECS",
                Some(30),
            )?),
            log_format,
        })
    }
}

fn invalid(key: &str, message: impl Into<String>) -> Error {
    Error::Configuration {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Parse `key`, falling back to `default` when it is unset
fn parse<F, T>(lookup: &F, key: &str, default: Option<T>) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| invalid(key, format!("cannot parse `{raw}`: {e}"))),
        None => default.ok_or_else(|| invalid(key, "missing")),
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let default = u64::try_from(default.as_millis()).ok();
    parse(lookup, key, default).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FleetConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.upstream_url.is_none());
        assert_eq!(config.seed, SeedConfig::default());
        assert_eq!(config.latency, LatencyProfile::default());
        assert_eq!(config.batch, BatchConfig::default());
        assert_eq!(config.dashboard_limit, 15);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let config = FleetConfig::from_lookup(lookup(&[
            ("FLEET_BIND_ADDR", "127.0.0.1:9000"),
            ("FLEET_UPSTREAM_URL", "http://robots.internal"),
            ("FLEET_NUM_ROBOTS", "100"),
            ("FLEET_LATENCY_SINGLE_MS", "0"),
            ("FLEET_BATCH_DELAY_MS", "5"),
            ("FLEET_MAX_BATCH_SIZE", "50"),
            ("FLEET_LOG_FORMAT", "json"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.upstream_url.as_deref(), Some("http://robots.internal"));
        assert_eq!(config.seed.robots, 100);
        assert_eq!(config.latency.single, Duration::ZERO);
        assert_eq!(config.batch.delay, Duration::from_millis(5));
        assert_eq!(config.batch.max_batch_size, 50);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_value_names_the_variable() {
        let err = FleetConfig::from_lookup(lookup(&[("FLEET_NUM_USERS", "many")])).unwrap_err();
        assert!(matches!(err, Error::Configuration { ref key, .. } if key == "FLEET_NUM_USERS"));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = FleetConfig::from_lookup(lookup(&[("FLEET_MAX_BATCH_SIZE", "0")]));
        assert!(result.is_err());
    }
}
