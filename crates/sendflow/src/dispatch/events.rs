use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::gateway::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSent {
    pub entry_id: Uuid,
    pub batch_id: Uuid,
    pub phone_number: String,
    pub user_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub provider: String,
    pub external_message_id: String,
    /// Failed attempts before this delivery.
    pub attempts: i32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageFailed {
    pub entry_id: Uuid,
    pub batch_id: Uuid,
    pub phone_number: String,
    pub user_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub attempts: i32,
    pub occurred_at: DateTime<Utc>,
}

/// Terminal outcome of one queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    MessageSent(MessageSent),
    MessageFailed(MessageFailed),
}

impl DispatchEvent {
    pub fn entry_id(&self) -> Uuid {
        match self {
            DispatchEvent::MessageSent(e) => e.entry_id,
            DispatchEvent::MessageFailed(e) => e.entry_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            DispatchEvent::MessageSent(_) => "message_sent",
            DispatchEvent::MessageFailed(_) => "message_failed",
        }
    }
}

#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &DispatchEvent) -> anyhow::Result<()>;
}

/// Fans events out to a fixed set of listeners. A failing listener is
/// logged and does not stop the others or the dispatch that produced it.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventDispatcher {
    pub fn new(listeners: Vec<Arc<dyn EventListener>>) -> Self {
        Self { listeners }
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub async fn publish(&self, event: &DispatchEvent) {
        for listener in &self.listeners {
            if let Err(err) = listener.on_event(event).await {
                tracing::error!(
                    listener = listener.name(),
                    event = event.event_type(),
                    entry_id = %event.entry_id(),
                    error = %err,
                    "event listener failed"
                );
            }
        }
    }
}

/// Writes each outcome to the log.
#[derive(Debug, Default)]
pub struct TracingListener;

#[async_trait]
impl EventListener for TracingListener {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn on_event(&self, event: &DispatchEvent) -> anyhow::Result<()> {
        match event {
            DispatchEvent::MessageSent(e) => tracing::info!(
                entry_id = %e.entry_id,
                batch_id = %e.batch_id,
                provider = %e.provider,
                external_message_id = %e.external_message_id,
                "message sent"
            ),
            DispatchEvent::MessageFailed(e) => tracing::warn!(
                entry_id = %e.entry_id,
                batch_id = %e.batch_id,
                kind = e.error_kind.as_str(),
                attempts = e.attempts,
                error = %e.error_message,
                "message failed"
            ),
        }
        Ok(())
    }
}

/// Appends outcomes to `message_history` for auditing and billing.
#[derive(Clone)]
pub struct PgHistoryListener {
    pool: PgPool,
}

impl PgHistoryListener {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventListener for PgHistoryListener {
    fn name(&self) -> &str {
        "message_history"
    }

    async fn on_event(&self, event: &DispatchEvent) -> anyhow::Result<()> {
        let (provider, external_id, error_kind, error_message, attempts, occurred_at) = match event {
            DispatchEvent::MessageSent(e) => (
                Some(e.provider.as_str()),
                Some(e.external_message_id.as_str()),
                None,
                None,
                e.attempts,
                e.occurred_at,
            ),
            DispatchEvent::MessageFailed(e) => (
                None,
                None,
                Some(e.error_kind.as_str()),
                Some(e.error_message.as_str()),
                e.attempts,
                e.occurred_at,
            ),
        };
        let (batch_id, phone_number) = match event {
            DispatchEvent::MessageSent(e) => (e.batch_id, e.phone_number.as_str()),
            DispatchEvent::MessageFailed(e) => (e.batch_id, e.phone_number.as_str()),
        };

        sqlx::query(
            r#"
            INSERT INTO message_history (
                id, entry_id, batch_id, phone_number, event_type,
                provider, external_message_id, error_kind, error_message,
                attempts, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.entry_id())
        .bind(batch_id)
        .bind(phone_number)
        .bind(event.event_type())
        .bind(provider)
        .bind(external_id)
        .bind(error_kind)
        .bind(error_message)
        .bind(attempts)
        .bind(occurred_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
