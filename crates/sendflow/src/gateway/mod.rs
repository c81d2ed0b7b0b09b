use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::queue::QueueEntry;

pub mod dry_run;
pub mod orange;
pub mod resilient;
pub mod whatsapp;

pub use dry_run::DryRunGateway;
pub use orange::OrangeSmsGateway;
pub use resilient::ResilientGatewayClient;
pub use whatsapp::WhatsAppCloudGateway;

/// Classification tag for gateway failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Server,
    RateLimit,
    Validation,
    CircuitOpen,
    RetriesExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Validation => "validation",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RetriesExhausted => "retries_exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "network" | "transient_network" | "connect" | "timeout" => Some(ErrorKind::Network),
            "server" | "5xx" => Some(ErrorKind::Server),
            "rate_limit" | "ratelimit" | "429" => Some(ErrorKind::RateLimit),
            "validation" | "4xx" => Some(ErrorKind::Validation),
            "circuit_open" => Some(ErrorKind::CircuitOpen),
            "retries_exhausted" => Some(ErrorKind::RetriesExhausted),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("provider returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("rate limited by provider: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("rejected by provider: {0}")]
    Validation(String),

    #[error("circuit '{dependency}' is open, retry in {}s", .retry_after.as_secs())]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<GatewayError>,
    },
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::TransientNetwork(_) => ErrorKind::Network,
            GatewayError::Server { .. } => ErrorKind::Server,
            GatewayError::RateLimited { .. } => ErrorKind::RateLimit,
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            GatewayError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }

    /// The innermost error, looking through `RetriesExhausted` wrappers.
    pub fn root(&self) -> &GatewayError {
        match self {
            GatewayError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn root_kind(&self) -> ErrorKind {
        self.root().kind()
    }

    /// Whether this outcome says something about the dependency's health.
    /// A rejected payload means the provider is up and answering.
    pub fn counts_against_circuit(&self) -> bool {
        !matches!(
            self.root(),
            GatewayError::Validation(_) | GatewayError::CircuitOpen { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return GatewayError::Server {
                status: err.status().map(|s| s.as_u16()).unwrap_or(502),
                message: format!("unreadable provider response: {err}"),
            };
        }
        if let Some(status) = err.status() {
            return error_for_status(status, None, err.to_string());
        }
        GatewayError::TransientNetwork(err.to_string())
    }
}

/// Maps a non-success provider status to the error taxonomy.
pub fn error_for_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> GatewayError {
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        truncate(body.trim(), 512)
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::RateLimited {
            retry_after,
            message,
        }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        GatewayError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        GatewayError::Validation(format!("{}: {message}", status.as_u16()))
    }
}

/// Integer-seconds form of `Retry-After`. HTTP-date values are ignored.
pub fn retry_after_from(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// What a provider needs to deliver one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub entry_id: Uuid,
    pub phone_number: String,
    pub body: String,
    pub sender_name: Option<String>,
}

impl From<&QueueEntry> for OutboundMessage {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            entry_id: entry.id,
            phone_number: entry.phone_number.clone(),
            body: entry.message.clone(),
            sender_name: entry.sender_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub external_message_id: String,
    pub provider: String,
}

/// A raw, unprotected provider call.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError>;
}

pub fn from_config(cfg: &GatewayConfig) -> anyhow::Result<Arc<dyn MessageGateway>> {
    let gateway: Arc<dyn MessageGateway> = match cfg {
        GatewayConfig::DryRun => Arc::new(DryRunGateway::new()),
        GatewayConfig::Orange(orange) => Arc::new(OrangeSmsGateway::new(orange.clone())?),
        GatewayConfig::WhatsApp(whatsapp) => Arc::new(WhatsAppCloudGateway::new(whatsapp.clone())?),
    };
    Ok(gateway)
}
