use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::model::{QueueEntry, StatusCounts};

/// Which pending entries a cancellation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum CancelScope {
    Batch(Uuid),
    Segment(Uuid),
    User(Uuid),
}

/// Persistence for the outbound queue.
///
/// A claim stamps the row with the caller's `owner` token. Every later write
/// on a processing row (`renew_claim`, the outcome writes) requires the row
/// to still be `processing` under that same token and returns whether it
/// applied. Once a row is reclaimed and claimed again, the previous holder
/// can no longer touch it.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts all entries or none.
    async fn insert_batch(&self, entries: &[QueueEntry]) -> anyhow::Result<u64>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<QueueEntry>>;

    /// Pending entries with `next_attempt_at <= now`, highest priority first,
    /// then oldest schedule.
    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<QueueEntry>>;

    /// `pending -> processing` under `owner` if the entry is still pending
    /// and due.
    async fn claim(&self, id: Uuid, owner: &str, now: DateTime<Utc>) -> anyhow::Result<bool>;

    /// Refreshes `claimed_at` if `owner` still holds the entry.
    async fn renew_claim(&self, id: Uuid, owner: &str, now: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn mark_sent(
        &self,
        id: Uuid,
        owner: &str,
        external_message_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Back to pending with a new attempt count and due time.
    async fn schedule_retry(
        &self,
        id: Uuid,
        owner: &str,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Back to pending without touching `attempts`.
    async fn defer(
        &self,
        id: Uuid,
        owner: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn mark_failed(
        &self,
        id: Uuid,
        owner: &str,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Processing entries claimed before `claimed_before` go back to pending,
    /// due immediately.
    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Pending entries in scope become cancelled. Other statuses are untouched.
    async fn cancel_pending(
        &self,
        scope: CancelScope,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Counts for one batch, or for the whole queue when `batch_id` is `None`.
    async fn count_by_status(&self, batch_id: Option<Uuid>) -> anyhow::Result<StatusCounts>;

    async fn list_batch(&self, batch_id: Uuid) -> anyhow::Result<Vec<QueueEntry>>;

    /// Deletes up to `limit` terminal entries last updated before `cutoff`.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: i64) -> anyhow::Result<u64>;
}
