use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through.
    Closed,
    /// Calls fail fast.
    Open,
    /// Probing whether the dependency recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

/// Everything a breaker needs to remember between calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            last_transition_at: None,
        }
    }
}

/// Where breaker state lives. The in-process map is the default; a shared
/// store lets several worker processes agree on a dependency's health.
#[async_trait]
pub trait CircuitBreakerStateStore: Send + Sync {
    /// Returns the default (closed) snapshot for names never saved.
    async fn load(&self, name: &str) -> anyhow::Result<CircuitSnapshot>;

    async fn save(&self, name: &str, snapshot: &CircuitSnapshot) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCircuitStateStore {
    states: RwLock<HashMap<String, CircuitSnapshot>>,
}

impl InMemoryCircuitStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircuitBreakerStateStore for InMemoryCircuitStateStore {
    async fn load(&self, name: &str) -> anyhow::Result<CircuitSnapshot> {
        Ok(self.states.read().get(name).cloned().unwrap_or_default())
    }

    async fn save(&self, name: &str, snapshot: &CircuitSnapshot) -> anyhow::Result<()> {
        self.states.write().insert(name.to_string(), snapshot.clone());
        Ok(())
    }
}

/// Breaker state in the `circuit_breakers` table. Writes are
/// last-writer-wins across processes.
#[derive(Clone)]
pub struct PgCircuitStateStore {
    pool: PgPool,
}

impl PgCircuitStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CircuitRow {
    state: String,
    failure_count: i32,
    success_count: i32,
    half_open_in_flight: i32,
    last_transition_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl CircuitBreakerStateStore for PgCircuitStateStore {
    async fn load(&self, name: &str) -> anyhow::Result<CircuitSnapshot> {
        let row = sqlx::query_as::<_, CircuitRow>(
            r#"
            SELECT state, failure_count, success_count, half_open_in_flight, last_transition_at
            FROM circuit_breakers
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(CircuitSnapshot::default());
        };

        let state = CircuitState::parse(&row.state)
            .ok_or_else(|| anyhow::anyhow!("unknown circuit state '{}' for {name}", row.state))?;

        Ok(CircuitSnapshot {
            state,
            failure_count: row.failure_count.max(0) as u32,
            success_count: row.success_count.max(0) as u32,
            half_open_in_flight: row.half_open_in_flight.max(0) as u32,
            last_transition_at: row.last_transition_at,
        })
    }

    async fn save(&self, name: &str, snapshot: &CircuitSnapshot) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breakers (
                name, state, failure_count, success_count, half_open_in_flight,
                last_transition_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (name) DO UPDATE
            SET state = EXCLUDED.state,
                failure_count = EXCLUDED.failure_count,
                success_count = EXCLUDED.success_count,
                half_open_in_flight = EXCLUDED.half_open_in_flight,
                last_transition_at = EXCLUDED.last_transition_at,
                updated_at = now()
            "#,
        )
        .bind(name)
        .bind(snapshot.state.as_str())
        .bind(snapshot.failure_count as i32)
        .bind(snapshot.success_count as i32)
        .bind(snapshot.half_open_in_flight as i32)
        .bind(snapshot.last_transition_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
