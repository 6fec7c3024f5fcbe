//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `DRIPLINE_DATABASE_URL`: PostgreSQL connection string (required)
//! - `DRIPLINE_DB_MAX_CONNECTIONS`: Pool size (default: 10)
//! - `DRIPLINE_API_ADDR`: Inbound HTTP bind address (default: 0.0.0.0:3000)
//! - `DRIPLINE_DOWNSTREAM_BASE_URL`: CRM proxy base URL
//! - `DRIPLINE_DOWNSTREAM_API_KEY`: Sent as the `Authorization` header (optional)
//! - `DRIPLINE_DOWNSTREAM_TIMEOUT_MS`: Per-request timeout (default: 30000)
//! - `DRIPLINE_FIELD_NAME`: Custom field to look up (default: timerdone)
//! - `DRIPLINE_FIELD_VALUE`: Value written when a delay elapses (default: YES)
//! - `DRIPLINE_PROMOTER_POLL_INTERVAL_MS`: Promotion poll interval (default: 1000)
//! - `DRIPLINE_PROMOTER_ERROR_BACKOFF_MS`: Sleep after a failed pass (default: 5000)
//! - `DRIPLINE_PROMOTER_BATCH_SIZE`: Due items promoted per pass (default: 50)
//! - `DRIPLINE_CONSUMER_GROUP`: Shared consumer group (default: dripline)
//! - `DRIPLINE_CONSUMER_NAME`: This worker's name (default: worker-<uuid>)
//! - `DRIPLINE_DISCOVERY_INTERVAL_MS`: Partition discovery interval (default: 5000)
//! - `DRIPLINE_DISCOVERY_LOOKBACK_SECS`: Recent-staging window (default: 600)
//! - `DRIPLINE_BLOCK_TIMEOUT_MS`: Max wait for a new message (default: 5000)
//! - `DRIPLINE_READ_POLL_INTERVAL_MS`: Poll interval while waiting (default: 250)
//! - `DRIPLINE_CLAIM_TIMEOUT_MS`: Idle time before reclaim (default: 60000)
//! - `DRIPLINE_IDLE_TIMEOUT_MS`: Quiet time before a consumer exits (default: 60000)
//! - `DRIPLINE_MAX_DELIVERIES`: Deliveries before dead-lettering (default: 10)

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::downstream::DownstreamConfig;
use crate::promoter::PromoterConfig;
use crate::workers::WorkerPoolConfig;

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub api_addr: SocketAddr,
    pub downstream: DownstreamConfig,
    pub promoter: PromoterConfig,
    pub workers: WorkerPoolConfig,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unparseable optional values
    /// fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DRIPLINE_DATABASE_URL")
            .context("DRIPLINE_DATABASE_URL environment variable is required")?;

        let api_addr = lookup("DRIPLINE_API_ADDR").unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let api_addr =
            SocketAddr::from_str(&api_addr).context("invalid DRIPLINE_API_ADDR format")?;

        let parsed = |name: &str| lookup(name).and_then(|value| value.trim().parse::<u64>().ok());
        let millis = |name: &str, default: Duration| {
            parsed(name).map(Duration::from_millis).unwrap_or(default)
        };

        let defaults = DownstreamConfig::default();
        let downstream = DownstreamConfig {
            base_url: lookup("DRIPLINE_DOWNSTREAM_BASE_URL").unwrap_or(defaults.base_url),
            api_key: lookup("DRIPLINE_DOWNSTREAM_API_KEY").filter(|key| !key.is_empty()),
            timeout: millis("DRIPLINE_DOWNSTREAM_TIMEOUT_MS", defaults.timeout),
            field_name: lookup("DRIPLINE_FIELD_NAME").unwrap_or(defaults.field_name),
            field_value: lookup("DRIPLINE_FIELD_VALUE").unwrap_or(defaults.field_value),
        };

        let defaults = PromoterConfig::default();
        let promoter = PromoterConfig {
            poll_interval: millis("DRIPLINE_PROMOTER_POLL_INTERVAL_MS", defaults.poll_interval),
            error_backoff: millis("DRIPLINE_PROMOTER_ERROR_BACKOFF_MS", defaults.error_backoff),
            batch_size: parsed("DRIPLINE_PROMOTER_BATCH_SIZE")
                .map(|value| value as usize)
                .filter(|value| *value > 0)
                .unwrap_or(defaults.batch_size),
        };

        let defaults = WorkerPoolConfig::default();
        let workers = WorkerPoolConfig {
            group: lookup("DRIPLINE_CONSUMER_GROUP").unwrap_or(defaults.group),
            consumer_name: lookup("DRIPLINE_CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            discovery_interval: millis(
                "DRIPLINE_DISCOVERY_INTERVAL_MS",
                defaults.discovery_interval,
            ),
            discovery_lookback: parsed("DRIPLINE_DISCOVERY_LOOKBACK_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.discovery_lookback),
            read_poll_interval: millis(
                "DRIPLINE_READ_POLL_INTERVAL_MS",
                defaults.read_poll_interval,
            ),
            block_timeout: millis("DRIPLINE_BLOCK_TIMEOUT_MS", defaults.block_timeout),
            claim_timeout: millis("DRIPLINE_CLAIM_TIMEOUT_MS", defaults.claim_timeout),
            idle_timeout: millis("DRIPLINE_IDLE_TIMEOUT_MS", defaults.idle_timeout),
            max_deliveries: parsed("DRIPLINE_MAX_DELIVERIES")
                .and_then(|value| i32::try_from(value).ok())
                .unwrap_or(defaults.max_deliveries),
            field_value: downstream.field_value.clone(),
        };

        Ok(Self {
            database_url,
            db_max_connections: parsed("DRIPLINE_DB_MAX_CONNECTIONS")
                .and_then(|value| u32::try_from(value).ok())
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
            api_addr,
            downstream,
            promoter,
            workers,
        })
    }
}
