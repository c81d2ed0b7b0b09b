use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use super::{GatewayError, MessageGateway, OutboundMessage, SendReceipt};

/// Logs instead of sending. Used for local runs and staging.
#[derive(Debug, Default)]
pub struct DryRunGateway {
    sent: AtomicU64,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageGateway for DryRunGateway {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            entry_id = %message.entry_id,
            to = %message.phone_number,
            chars = message.body.chars().count(),
            "dry-run send"
        );
        Ok(SendReceipt {
            external_message_id: format!("dry-run-{}", Uuid::new_v4()),
            provider: self.name().to_string(),
        })
    }
}
