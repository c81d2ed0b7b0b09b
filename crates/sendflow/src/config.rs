use std::collections::HashSet;
use std::time::Duration;

use crate::gateway::ErrorKind;
use crate::resilience::{default_retryable_kinds, CircuitBreakerConfig, RetryConfig};

// Config is the one place runtime settings are read.
// Values come from SENDFLOW_* variables with unprefixed fallbacks, so a plain
// `.env` works for local runs.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub reclaim_interval_ms: u64,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    /// Terminal entries older than this are purged. `None` keeps everything.
    pub retention_days: Option<i64>,
    /// Keep circuit state in Postgres so every worker sees the same breaker.
    pub shared_circuit_state: bool,
    pub default_country_code: Option<String>,
    pub dispatch: DispatchConfig,
    pub gateway: GatewayConfig,
}

/// Retry, circuit breaker and recovery knobs.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub max_attempts: i32,
    /// Tries inside one claim before the entry goes back to the queue.
    pub inline_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_seconds: u64,
    pub half_open_max_calls: u32,
    pub retryable_error_kinds: HashSet<ErrorKind>,
    pub stale_processing_threshold_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            inline_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter_pct: 0.0,
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 60,
            half_open_max_calls: 1,
            retryable_error_kinds: default_retryable_kinds(),
            stale_processing_threshold_seconds: 300,
        }
    }
}

impl DispatchConfig {
    fn retry_config(&self, max_attempts: u32, jitter_pct: f64) -> RetryConfig {
        RetryConfig {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            retryable_kinds: self.retryable_error_kinds.clone(),
            jitter_pct,
        }
    }

    /// Retries around a single provider call, inside the breaker.
    pub fn inline_retry(&self) -> RetryConfig {
        self.retry_config(self.inline_attempts, 0.0)
    }

    /// Backoff between claims of the same entry.
    pub fn queue_retry(&self) -> RetryConfig {
        self.retry_config(self.max_attempts.max(1) as u32, self.jitter_pct)
    }

    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            success_threshold: self.success_threshold.max(1),
            timeout: Duration::from_secs(self.timeout_seconds),
            half_open_max_calls: self.half_open_max_calls.max(1),
        }
    }

    pub fn stale_processing_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_processing_threshold_seconds)
    }
}

#[derive(Clone, Debug, Default)]
pub enum GatewayConfig {
    /// Log messages instead of sending them.
    #[default]
    DryRun,
    Orange(OrangeConfig),
    WhatsApp(WhatsAppConfig),
}

#[derive(Clone)]
pub struct OrangeConfig {
    pub base_url: String,
    /// Full `Authorization` value for the token endpoint, e.g. `Basic <base64>`.
    pub authorization_header: String,
    /// The sender MSISDN, with or without `tel:+`.
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for OrangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrangeConfig")
            .field("base_url", &self.base_url)
            .field("authorization_header", &"<redacted>")
            .field("sender_address", &self.sender_address)
            .field("sender_name", &self.sender_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct WhatsAppConfig {
    pub base_url: String,
    pub api_version: String,
    pub phone_number_id: String,
    pub access_token: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for WhatsAppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhatsAppConfig")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("phone_number_id", &self.phone_number_id)
            .field("access_token", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source. `from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get: Lookup = &get;

        let database_url = non_empty(get, "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback(get, "SENDFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| non_empty(get, "HOSTNAME"))
            .unwrap_or_else(|| "worker-1".to_string());

        let batch_size = parsed(get, "SENDFLOW_BATCH_SIZE", "BATCH_SIZE")
            .unwrap_or(100usize)
            .clamp(1, 10_000);

        let poll_interval_ms = parsed(get, "SENDFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS").unwrap_or(1000);

        let reclaim_interval_ms =
            parsed(get, "SENDFLOW_RECLAIM_INTERVAL_MS", "RECLAIM_INTERVAL_MS").unwrap_or(30_000);

        let admin_addr = env_or_fallback(get, "SENDFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool(get, "SENDFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let retention_days = parsed::<i64>(get, "SENDFLOW_RETENTION_DAYS", "RETENTION_DAYS").filter(|d| *d > 0);

        let shared_circuit_state = env_bool(get, "SENDFLOW_SHARED_CIRCUIT_STATE").unwrap_or(false);

        let default_country_code = env_or_fallback(get, "SENDFLOW_DEFAULT_COUNTRY_CODE", "DEFAULT_COUNTRY_CODE");

        Ok(Self {
            database_url,
            worker_id,
            batch_size,
            poll_interval_ms,
            reclaim_interval_ms,
            admin_addr,
            migrate_on_startup,
            retention_days,
            shared_circuit_state,
            default_country_code,
            dispatch: dispatch_from(get)?,
            gateway: gateway_from(get)?,
        })
    }
}

fn dispatch_from(get: Lookup) -> anyhow::Result<DispatchConfig> {
    let d = DispatchConfig::default();

    let retryable_error_kinds = match env_or_fallback(get, "SENDFLOW_RETRYABLE_ERROR_KINDS", "RETRYABLE_ERROR_KINDS") {
        Some(list) => parse_error_kinds(&list)?,
        None => d.retryable_error_kinds,
    };

    Ok(DispatchConfig {
        max_attempts: parsed::<i32>(get, "SENDFLOW_MAX_ATTEMPTS", "MAX_ATTEMPTS")
            .unwrap_or(d.max_attempts)
            .max(1),
        inline_attempts: parsed(get, "SENDFLOW_INLINE_ATTEMPTS", "INLINE_ATTEMPTS").unwrap_or(d.inline_attempts),
        base_delay_ms: parsed(get, "SENDFLOW_BASE_DELAY_MS", "BASE_DELAY_MS").unwrap_or(d.base_delay_ms),
        multiplier: parsed::<f64>(get, "SENDFLOW_MULTIPLIER", "MULTIPLIER")
            .filter(|m| m.is_finite() && *m >= 1.0)
            .unwrap_or(d.multiplier),
        max_delay_ms: parsed(get, "SENDFLOW_MAX_DELAY_MS", "MAX_DELAY_MS").unwrap_or(d.max_delay_ms),
        jitter_pct: parsed::<f64>(get, "SENDFLOW_JITTER_PCT", "JITTER_PCT")
            .filter(|j| j.is_finite())
            .map(|j| j.clamp(0.0, 1.0))
            .unwrap_or(d.jitter_pct),
        failure_threshold: parsed(get, "SENDFLOW_FAILURE_THRESHOLD", "FAILURE_THRESHOLD")
            .unwrap_or(d.failure_threshold),
        success_threshold: parsed(get, "SENDFLOW_SUCCESS_THRESHOLD", "SUCCESS_THRESHOLD")
            .unwrap_or(d.success_threshold),
        timeout_seconds: parsed(get, "SENDFLOW_TIMEOUT_SECONDS", "TIMEOUT_SECONDS").unwrap_or(d.timeout_seconds),
        half_open_max_calls: parsed(get, "SENDFLOW_HALF_OPEN_MAX_CALLS", "HALF_OPEN_MAX_CALLS")
            .unwrap_or(d.half_open_max_calls),
        retryable_error_kinds,
        stale_processing_threshold_seconds: parsed(
            get,
            "SENDFLOW_STALE_PROCESSING_THRESHOLD_SECONDS",
            "STALE_PROCESSING_THRESHOLD_SECONDS",
        )
        .unwrap_or(d.stale_processing_threshold_seconds),
    })
}

fn gateway_from(get: Lookup) -> anyhow::Result<GatewayConfig> {
    let provider = env_or_fallback(get, "SENDFLOW_GATEWAY", "GATEWAY")
        .unwrap_or_else(|| "dry-run".to_string())
        .to_lowercase();

    match provider.as_str() {
        "dry-run" | "dry_run" | "dryrun" | "none" => Ok(GatewayConfig::DryRun),
        "orange" | "orange-sms" => Ok(GatewayConfig::Orange(OrangeConfig {
            base_url: non_empty(get, "ORANGE_BASE_URL").unwrap_or_else(|| "https://api.orange.com".to_string()),
            authorization_header: required(get, "ORANGE_AUTHORIZATION_HEADER")?,
            sender_address: required(get, "ORANGE_SENDER_ADDRESS")?,
            sender_name: non_empty(get, "ORANGE_SENDER_NAME"),
            timeout: timeout_from(get, "ORANGE_TIMEOUT_MS"),
        })),
        "whatsapp" | "whatsapp-cloud" => Ok(GatewayConfig::WhatsApp(WhatsAppConfig {
            base_url: non_empty(get, "WHATSAPP_BASE_URL")
                .unwrap_or_else(|| "https://graph.facebook.com".to_string()),
            api_version: non_empty(get, "WHATSAPP_API_VERSION").unwrap_or_else(|| "v19.0".to_string()),
            phone_number_id: required(get, "WHATSAPP_PHONE_NUMBER_ID")?,
            access_token: required(get, "WHATSAPP_ACCESS_TOKEN")?,
            timeout: timeout_from(get, "WHATSAPP_TIMEOUT_MS"),
        })),
        other => anyhow::bail!("unknown gateway provider '{other}' (expected dry-run, orange or whatsapp)"),
    }
}

pub fn parse_error_kinds(list: &str) -> anyhow::Result<HashSet<ErrorKind>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| ErrorKind::parse(s).ok_or_else(|| anyhow::anyhow!("unknown error kind '{s}'")))
        .collect()
}

fn timeout_from(get: Lookup, key: &str) -> Duration {
    let ms = non_empty(get, key)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10_000);
    Duration::from_millis(ms.max(1))
}

fn non_empty(get: Lookup, key: &str) -> Option<String> {
    get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn required(get: Lookup, key: &str) -> anyhow::Result<String> {
    non_empty(get, key).ok_or_else(|| anyhow::anyhow!("{key} is missing"))
}

fn env_or_fallback(get: Lookup, primary: &str, fallback: &str) -> Option<String> {
    non_empty(get, primary).or_else(|| non_empty(get, fallback))
}

fn parsed<T: std::str::FromStr>(get: Lookup, primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(get, primary, fallback).and_then(|s| s.parse().ok())
}

fn env_bool(get: Lookup, key: &str) -> Option<bool> {
    get(key).map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
