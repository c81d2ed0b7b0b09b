use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use uuid::Uuid;

use super::events::{DispatchEvent, EventDispatcher, MessageFailed, MessageSent};
use crate::clock::Clock;
use crate::gateway::{GatewayError, OutboundMessage, ResilientGatewayClient};
use crate::queue::{CancelScope, QueueEntry, QueueStore};
use crate::resilience::RetryPolicy;

const MIN_DEFER: Duration = Duration::from_secs(1);
const DEFAULT_CANCEL_REASON: &str = "cancelled";
const DEFAULT_WORKER_ID: &str = "sendflow";

/// What one `process_next_batch` call did. An entry whose outcome could not
/// be written counts toward `total` only; it stays processing until reclaimed.
/// Entries another worker took over before they were sent count as `skipped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub retried: usize,
    pub deferred: usize,
    pub skipped: usize,
}

impl BatchSummary {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Failed,
    Retried,
    Deferred,
    // Row left processing before we could record the result.
    Lost,
}

/// Pulls due entries, claims them, sends them and records the outcome.
pub struct BatchProcessor {
    store: Arc<dyn QueueStore>,
    client: Arc<ResilientGatewayClient>,
    // Queue-level schedule between claims; inline retries live in the client.
    requeue: RetryPolicy,
    events: EventDispatcher,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    worker_id: String,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        client: Arc<ResilientGatewayClient>,
        requeue: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            client,
            requeue,
            events: EventDispatcher::default(),
            clock,
            rng: Mutex::new(StdRng::from_entropy()),
            worker_id: DEFAULT_WORKER_ID.to_string(),
        }
    }

    /// Prefix of the claim tokens this processor stamps on entries.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn client(&self) -> &Arc<ResilientGatewayClient> {
        &self.client
    }

    pub async fn process_next_batch(&self, batch_size: usize) -> anyhow::Result<BatchSummary> {
        let now = self.clock.now();
        let due = self.store.select_due(now, batch_size as i64).await?;

        let mut summary = BatchSummary {
            total: due.len(),
            ..BatchSummary::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        // fresh per pass, so a claim lost to reclaim is never mistaken for ours
        let owner = format!("{}:{}", self.worker_id, Uuid::new_v4());

        let mut claimed = Vec::with_capacity(due.len());
        for entry in due {
            match self.store.claim(entry.id, &owner, now).await {
                Ok(true) => claimed.push(entry),
                Ok(false) => summary.skipped += 1,
                Err(err) => {
                    tracing::warn!(entry_id = %entry.id, error = %err, "claim failed");
                    summary.skipped += 1;
                }
            }
        }

        for entry in claimed {
            let entry_id = entry.id;
            match self.dispatch(entry, &owner).await {
                Ok(Outcome::Sent) => summary.sent += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Ok(Outcome::Retried) => summary.retried += 1,
                Ok(Outcome::Deferred) => summary.deferred += 1,
                Ok(Outcome::Lost) => summary.skipped += 1,
                Err(err) => {
                    tracing::error!(
                        entry_id = %entry_id,
                        error = %err,
                        "failed to record dispatch outcome, leaving entry for reclaim"
                    );
                }
            }
        }

        tracing::info!(
            total = summary.total,
            sent = summary.sent,
            failed = summary.failed,
            retried = summary.retried,
            deferred = summary.deferred,
            skipped = summary.skipped,
            "batch processed"
        );
        Ok(summary)
    }

    async fn dispatch(&self, entry: QueueEntry, owner: &str) -> anyhow::Result<Outcome> {
        // the tail of a slow batch may have been reclaimed and sent elsewhere
        if !self
            .store
            .renew_claim(entry.id, owner, self.clock.now())
            .await?
        {
            tracing::warn!(
                entry_id = %entry.id,
                worker_id = %self.worker_id,
                "claim taken over before send, skipping"
            );
            return Ok(Outcome::Lost);
        }

        let message = OutboundMessage::from(&entry);
        let result = self.client.send(&message).await;
        let now = self.clock.now();

        match result {
            Ok(receipt) => {
                if !self
                    .store
                    .mark_sent(entry.id, owner, &receipt.external_message_id, now)
                    .await?
                {
                    return Ok(lost(&entry));
                }
                self.events
                    .publish(&DispatchEvent::MessageSent(MessageSent {
                        entry_id: entry.id,
                        batch_id: entry.batch_id,
                        phone_number: entry.phone_number.clone(),
                        user_id: entry.user_id,
                        segment_id: entry.segment_id,
                        provider: receipt.provider,
                        external_message_id: receipt.external_message_id,
                        attempts: entry.attempts,
                        occurred_at: now,
                    }))
                    .await;
                Ok(Outcome::Sent)
            }
            Err(err) => self.record_failure(&entry, owner, err, now).await,
        }
    }

    async fn record_failure(
        &self,
        entry: &QueueEntry,
        owner: &str,
        err: GatewayError,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Outcome> {
        if let GatewayError::CircuitOpen { retry_after, .. } = &err {
            let next = now + to_chrono((*retry_after).max(MIN_DEFER));
            tracing::debug!(entry_id = %entry.id, next_attempt_at = %next, "circuit open, deferring");
            let applied = self
                .store
                .defer(entry.id, owner, next, &err.to_string(), now)
                .await?;
            return Ok(if applied { Outcome::Deferred } else { lost(entry) });
        }

        let attempts = entry.attempts.saturating_add(1);
        let retryable = self.requeue.is_retryable_outcome(&err);

        if retryable && attempts < entry.max_attempts {
            let delay = {
                let mut rng = self.rng.lock();
                self.requeue.jittered_delay(attempts as u32, &mut *rng)
            };
            let next = now + to_chrono(delay);
            tracing::warn!(
                entry_id = %entry.id,
                attempts,
                max_attempts = entry.max_attempts,
                next_attempt_at = %next,
                error = %err,
                "send failed, requeued"
            );
            let applied = self
                .store
                .schedule_retry(entry.id, owner, attempts, next, &err.to_string(), now)
                .await?;
            return Ok(if applied { Outcome::Retried } else { lost(entry) });
        }

        let attempts = attempts.min(entry.max_attempts);
        let error_message = if retryable {
            format!("gave up after {attempts} attempt(s): {}", err.root())
        } else {
            err.to_string()
        };

        if !self
            .store
            .mark_failed(entry.id, owner, attempts, &error_message, now)
            .await?
        {
            return Ok(lost(entry));
        }

        self.events
            .publish(&DispatchEvent::MessageFailed(MessageFailed {
                entry_id: entry.id,
                batch_id: entry.batch_id,
                phone_number: entry.phone_number.clone(),
                user_id: entry.user_id,
                segment_id: entry.segment_id,
                error_kind: err.root_kind(),
                error_message,
                attempts,
                occurred_at: now,
            }))
            .await;
        Ok(Outcome::Failed)
    }

    /// Puts entries stuck in processing for longer than `stale_threshold`
    /// back to pending. Their attempt counts are not touched.
    pub async fn find_expired_processing(&self, stale_threshold: Duration) -> anyhow::Result<u64> {
        let now = self.clock.now();
        let reclaimed = self
            .store
            .reclaim_stale(now - to_chrono(stale_threshold), now)
            .await?;
        if reclaimed > 0 {
            tracing::warn!(
                reclaimed,
                threshold_secs = stale_threshold.as_secs(),
                "reclaimed stale processing entries"
            );
        }
        Ok(reclaimed)
    }

    pub async fn cancel_pending_by_batch_id(
        &self,
        batch_id: Uuid,
        reason: Option<&str>,
    ) -> anyhow::Result<u64> {
        self.cancel(CancelScope::Batch(batch_id), reason).await
    }

    pub async fn cancel_pending_by_segment(
        &self,
        segment_id: Uuid,
        reason: Option<&str>,
    ) -> anyhow::Result<u64> {
        self.cancel(CancelScope::Segment(segment_id), reason).await
    }

    pub async fn cancel_pending_by_user(
        &self,
        user_id: Uuid,
        reason: Option<&str>,
    ) -> anyhow::Result<u64> {
        self.cancel(CancelScope::User(user_id), reason).await
    }

    async fn cancel(&self, scope: CancelScope, reason: Option<&str>) -> anyhow::Result<u64> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_CANCEL_REASON);
        let cancelled = self
            .store
            .cancel_pending(scope, reason, self.clock.now())
            .await?;
        tracing::info!(?scope, cancelled, reason, "cancelled pending entries");
        Ok(cancelled)
    }
}

fn lost(entry: &QueueEntry) -> Outcome {
    tracing::warn!(
        entry_id = %entry.id,
        "entry left processing before its outcome was recorded, discarding"
    );
    Outcome::Lost
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}
