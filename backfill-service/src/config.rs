use serde::Deserialize;
use std::fs;
use time::UtcOffset;

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the vendor cloud API.
    pub base_url: String,
    /// API-gateway subscription key sent with every request.
    pub subscription_key: String,
    /// Static bearer token; may be overridden by BACKFILL_BEARER_TOKEN.
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum spacing between outbound requests, shared by all backfills.
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    /// Global ceiling on in-flight requests, shared by all backfills.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_min_request_interval_ms() -> u64 {
    1_000
}

fn default_max_in_flight() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillConfig {
    pub default_depth_days: u16,
    /// UTC offset (whole hours) of the installations' reporting timezone.
    /// Daily and monthly buckets are aligned to local midnight in this zone.
    #[serde(default)]
    pub reporting_utc_offset_hours: i8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub job_queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub store: StoreConfig,
    pub backfill: BackfillConfig,
    pub service: ServiceConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("BACKFILL_CONFIG").unwrap_or_else(|_| "backfill-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }

    pub fn reporting_offset(&self) -> UtcOffset {
        UtcOffset::from_hms(self.backfill.reporting_utc_offset_hours, 0, 0)
            .unwrap_or(UtcOffset::UTC)
    }
}
