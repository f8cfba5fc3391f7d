use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::retry::{Backoff, RetryPolicy};

const DEFAULT_CONGESTION_API_BASE: &str =
    "https://apis.data.go.kr/B551011/TatsCnctrRateService/tatsCnctrRatedList";
const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_FREQUENT_THRESHOLD: u64 = 20;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub cache_ttl_secs: u64,
    pub sync_interval_ms: u64,
    pub recompute_interval_ms: u64,
    pub store_max_retries: u32,
    pub store_retry_base_ms: u64,
    pub retry_backoff: Backoff,
    pub frequent_threshold: u64,
    pub congestion_api_base: String,
    pub congestion_api_key: Option<SecretString>,
    pub congestion_timeout_ms: u64,
    pub congestion_rate_limit_qps: u32,
    pub congestion_window_days: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub cache_ttl_secs: u64,
    pub sync_interval_ms: u64,
    pub recompute_interval_ms: u64,
    pub store_max_retries: u32,
    pub store_retry_base_ms: u64,
    pub retry_backoff: &'static str,
    pub frequent_threshold: u64,
    pub congestion_api_base: String,
    pub congestion_timeout_ms: u64,
    pub congestion_rate_limit_qps: u32,
    pub congestion_window_days: u32,
    pub has_congestion_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            data_dir: env::var("PLACEWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data-store")),
            cache_ttl_secs: parse_u64("CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS).max(1),
            sync_interval_ms: parse_u64("SYNC_INTERVAL_MS", 30_000).max(100),
            recompute_interval_ms: parse_u64("RECOMPUTE_INTERVAL_MS", 5 * 60 * 1000).max(100),
            store_max_retries: parse_u32("STORE_MAX_RETRIES", 3).max(1),
            store_retry_base_ms: parse_u64("STORE_RETRY_BASE_MS", 1_000),
            retry_backoff: env::var("RETRY_BACKOFF")
                .ok()
                .and_then(|v| Backoff::parse(&v))
                .unwrap_or(Backoff::Linear),
            frequent_threshold: parse_u64("FREQUENT_THRESHOLD", DEFAULT_FREQUENT_THRESHOLD),
            congestion_api_base: env::var("CONGESTION_API_BASE")
                .unwrap_or_else(|_| DEFAULT_CONGESTION_API_BASE.to_string()),
            congestion_api_key: env::var("CONGESTION_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            congestion_timeout_ms: parse_u64("CONGESTION_TIMEOUT_MS", 10_000).max(100),
            congestion_rate_limit_qps: parse_u32("CONGESTION_RATE_LIMIT_QPS", 3).max(1),
            congestion_window_days: parse_u32("CONGESTION_WINDOW_DAYS", 7).clamp(1, 30),
        }
    }

    pub fn store_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store_max_retries,
            Duration::from_millis(self.store_retry_base_ms),
        )
        .with_backoff(self.retry_backoff)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.cache_ttl_secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn recompute_interval(&self) -> Duration {
        Duration::from_millis(self.recompute_interval_ms)
    }

    pub fn congestion_timeout(&self) -> Duration {
        Duration::from_millis(self.congestion_timeout_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            cache_ttl_secs: self.cache_ttl_secs,
            sync_interval_ms: self.sync_interval_ms,
            recompute_interval_ms: self.recompute_interval_ms,
            store_max_retries: self.store_max_retries,
            store_retry_base_ms: self.store_retry_base_ms,
            retry_backoff: self.retry_backoff.as_str(),
            frequent_threshold: self.frequent_threshold,
            congestion_api_base: self.congestion_api_base.clone(),
            congestion_timeout_ms: self.congestion_timeout_ms,
            congestion_rate_limit_qps: self.congestion_rate_limit_qps,
            congestion_window_days: self.congestion_window_days,
            has_congestion_api_key: self.congestion_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data-store"),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            sync_interval_ms: 30_000,
            recompute_interval_ms: 5 * 60 * 1000,
            store_max_retries: 3,
            store_retry_base_ms: 1_000,
            retry_backoff: Backoff::Linear,
            frequent_threshold: DEFAULT_FREQUENT_THRESHOLD,
            congestion_api_base: DEFAULT_CONGESTION_API_BASE.to_string(),
            congestion_api_key: None,
            congestion_timeout_ms: 10_000,
            congestion_rate_limit_qps: 3,
            congestion_window_days: 7,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
