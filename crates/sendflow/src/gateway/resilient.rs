use std::sync::Arc;

use super::{GatewayError, MessageGateway, OutboundMessage, SendReceipt};
use crate::resilience::{CircuitBreaker, RetryPolicy};

/// A provider call wrapped in a circuit breaker, with inline retries inside
/// the breaker. One `send` counts once toward the breaker however many
/// retries it took.
pub struct ResilientGatewayClient {
    gateway: Arc<dyn MessageGateway>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl ResilientGatewayClient {
    pub fn new(gateway: Arc<dyn MessageGateway>, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            gateway,
            breaker,
            retry,
        }
    }

    pub fn provider(&self) -> &str {
        self.gateway.name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        let gateway = &self.gateway;
        let retry = &self.retry;
        self.breaker
            .call(move || retry.execute(move || gateway.send(message)))
            .await
    }
}
