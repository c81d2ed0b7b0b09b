pub mod circuit_breaker;
pub mod retry;
pub mod state_store;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use retry::{default_retryable_kinds, RetryConfig, RetryPolicy};
pub use state_store::{
    CircuitBreakerStateStore, CircuitSnapshot, CircuitState, InMemoryCircuitStateStore,
    PgCircuitStateStore,
};
