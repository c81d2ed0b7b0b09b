//! Circuit breaker for one external dependency.
//!
//! ```text
//! Closed    -> Open      failure_count reaches failure_threshold
//! Open      -> HalfOpen  first call after `timeout` has elapsed
//! HalfOpen  -> Closed    success_threshold consecutive successes
//! HalfOpen  -> Open      any failure (fresh timeout window)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::state_store::{CircuitBreakerStateStore, CircuitSnapshot, CircuitState};
use crate::clock::Clock;
use crate::gateway::GatewayError;

// How long a caller should wait when every half-open probe slot is taken.
const HALF_OPEN_BUSY_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub timeout: Duration,
    /// Concurrent probe calls allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

enum Admission {
    Allowed { probe: bool },
    Rejected { retry_after: Duration },
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    store: Arc<dyn CircuitBreakerStateStore>,
    clock: Arc<dyn Clock>,
    // Serializes load-modify-save on the snapshot within this process.
    gate: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn CircuitBreakerStateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            clock,
            gate: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn snapshot(&self) -> anyhow::Result<CircuitSnapshot> {
        self.store.load(&self.name).await
    }

    pub async fn state(&self) -> anyhow::Result<CircuitState> {
        Ok(self.snapshot().await?.state)
    }

    /// Runs `op` unless the circuit is open. The operation's outcome is
    /// recorded before its result is handed back.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let probe = match self.admit().await {
            Admission::Allowed { probe } => probe,
            Admission::Rejected { retry_after } => {
                tracing::debug!(dependency = %self.name, "circuit open, failing fast");
                return Err(GatewayError::CircuitOpen {
                    dependency: self.name.clone(),
                    retry_after,
                });
            }
        };

        let result = op().await;
        let healthy = match &result {
            Ok(_) => true,
            Err(err) => !err.counts_against_circuit(),
        };
        self.record(healthy, probe).await;

        result
    }

    async fn admit(&self) -> Admission {
        let _gate = self.gate.lock().await;
        let now = self.clock.now();

        let mut snap = match self.store.load(&self.name).await {
            Ok(snap) => snap,
            Err(err) => {
                // Without state there is nothing to gate on; let the call through.
                tracing::error!(dependency = %self.name, error = %err, "failed to load circuit state");
                return Admission::Allowed { probe: false };
            }
        };

        let admission = match snap.state {
            CircuitState::Closed => return Admission::Allowed { probe: false },
            CircuitState::Open => {
                let elapsed = elapsed_since(snap.last_transition_at, now, self.config.timeout);
                if elapsed < self.config.timeout {
                    return Admission::Rejected {
                        retry_after: self.config.timeout - elapsed,
                    };
                }
                snap.state = CircuitState::HalfOpen;
                snap.success_count = 0;
                snap.half_open_in_flight = 1;
                snap.last_transition_at = Some(now);
                tracing::info!(dependency = %self.name, "circuit half-open, probing dependency");
                Admission::Allowed { probe: true }
            }
            CircuitState::HalfOpen => {
                let elapsed = elapsed_since(snap.last_transition_at, now, self.config.timeout);
                if snap.half_open_in_flight < self.config.half_open_max_calls.max(1) {
                    snap.half_open_in_flight += 1;
                    Admission::Allowed { probe: true }
                } else if elapsed >= self.config.timeout {
                    // Probes that never reported back (cancelled or crashed) are forgotten.
                    snap.half_open_in_flight = 1;
                    snap.last_transition_at = Some(now);
                    Admission::Allowed { probe: true }
                } else {
                    return Admission::Rejected {
                        retry_after: HALF_OPEN_BUSY_RETRY,
                    };
                }
            }
        };

        self.persist(&snap).await;
        admission
    }

    async fn record(&self, healthy: bool, probe: bool) {
        let _gate = self.gate.lock().await;
        let now = self.clock.now();

        let mut snap = match self.store.load(&self.name).await {
            Ok(snap) => snap,
            Err(err) => {
                tracing::error!(dependency = %self.name, error = %err, "failed to load circuit state");
                return;
            }
        };

        if probe && snap.state == CircuitState::HalfOpen {
            snap.half_open_in_flight = snap.half_open_in_flight.saturating_sub(1);
        }

        match (snap.state, healthy) {
            (CircuitState::Closed, true) => snap.failure_count = 0,
            (CircuitState::Closed, false) => {
                snap.failure_count += 1;
                if snap.failure_count >= self.config.failure_threshold {
                    self.open(&mut snap, now);
                }
            }
            (CircuitState::HalfOpen, true) if probe => {
                snap.success_count += 1;
                if snap.success_count >= self.config.success_threshold {
                    snap.state = CircuitState::Closed;
                    snap.failure_count = 0;
                    snap.success_count = 0;
                    snap.half_open_in_flight = 0;
                    snap.last_transition_at = Some(now);
                    tracing::info!(dependency = %self.name, "circuit closed, dependency recovered");
                }
            }
            // Admitted while closed; says nothing about the recovering dependency.
            (CircuitState::HalfOpen, true) => {}
            (CircuitState::HalfOpen, false) => self.open(&mut snap, now),
            // A late outcome from a call admitted before the circuit opened.
            (CircuitState::Open, _) => {}
        }

        self.persist(&snap).await;
    }

    fn open(&self, snap: &mut CircuitSnapshot, now: DateTime<Utc>) {
        let from = snap.state;
        snap.state = CircuitState::Open;
        snap.success_count = 0;
        snap.half_open_in_flight = 0;
        snap.last_transition_at = Some(now);
        tracing::warn!(
            dependency = %self.name,
            from = from.as_str(),
            failures = snap.failure_count,
            timeout_secs = self.config.timeout.as_secs(),
            "circuit opened"
        );
    }

    async fn persist(&self, snap: &CircuitSnapshot) {
        if let Err(err) = self.store.save(&self.name, snap).await {
            tracing::error!(dependency = %self.name, error = %err, "failed to save circuit state");
        }
    }
}

fn elapsed_since(at: Option<DateTime<Utc>>, now: DateTime<Utc>, fallback: Duration) -> Duration {
    match at {
        Some(at) => (now - at).to_std().unwrap_or(Duration::ZERO),
        None => fallback,
    }
}
