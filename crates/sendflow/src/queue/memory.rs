use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::model::{QueueEntry, QueueStatus, StatusCounts};
use super::store::{CancelScope, QueueStore};

/// Process-local queue. Used by tests and dry runs; every operation takes
/// the one lock, so conditional transitions are atomic the same way the
/// Postgres `UPDATE ... WHERE status = ...` statements are.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    entries: Mutex<HashMap<Uuid, QueueEntry>>,
    fail_writes: AtomicBool,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every outcome write (`mark_*`, `schedule_retry`, `defer`) fail
    /// until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let mut all: Vec<QueueEntry> = self.entries.lock().values().cloned().collect();
        all.sort_by_key(|e| (e.created_at, e.id));
        all
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("queue store unavailable");
        }
        Ok(())
    }

    fn update_processing<F>(&self, id: Uuid, owner: &str, apply: F) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut QueueEntry),
    {
        self.check_writable()?;
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if held_by(entry, owner) => {
                apply(entry);
                entry.claimed_at = None;
                entry.claimed_by = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn held_by(entry: &QueueEntry, owner: &str) -> bool {
    entry.status == QueueStatus::Processing && entry.claimed_by.as_deref() == Some(owner)
}

fn dispatch_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_at.cmp(&b.scheduled_at))
        .then(a.created_at.cmp(&b.created_at))
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert_batch(&self, batch: &[QueueEntry]) -> anyhow::Result<u64> {
        let mut entries = self.entries.lock();
        if let Some(dup) = batch.iter().find(|e| entries.contains_key(&e.id)) {
            anyhow::bail!("duplicate queue entry id {}", dup.id);
        }
        for entry in batch {
            entries.insert(entry.id, entry.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<QueueEntry>> {
        Ok(self.entries.lock().get(&id).cloned())
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<QueueEntry>> {
        let entries = self.entries.lock();
        let mut due: Vec<QueueEntry> = entries
            .values()
            .filter(|e| {
                e.status == QueueStatus::Pending && e.next_attempt_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(dispatch_order);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim(&self, id: Uuid, owner: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry)
                if entry.status == QueueStatus::Pending
                    && entry.next_attempt_at.is_some_and(|at| at <= now) =>
            {
                entry.status = QueueStatus::Processing;
                entry.claimed_at = Some(now);
                entry.claimed_by = Some(owner.to_string());
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew_claim(&self, id: Uuid, owner: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if held_by(entry, owner) => {
                entry.claimed_at = Some(now);
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        owner: &str,
        external_message_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        self.update_processing(id, owner, |e| {
            e.status = QueueStatus::Sent;
            e.external_message_id = Some(external_message_id.to_string());
            e.error_message = None;
            e.next_attempt_at = None;
            e.updated_at = now;
        })
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        owner: &str,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        self.update_processing(id, owner, |e| {
            e.status = QueueStatus::Pending;
            e.attempts = attempts.min(e.max_attempts);
            e.next_attempt_at = Some(next_attempt_at);
            e.error_message = Some(error.to_string());
            e.updated_at = now;
        })
    }

    async fn defer(
        &self,
        id: Uuid,
        owner: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        self.update_processing(id, owner, |e| {
            e.status = QueueStatus::Pending;
            e.next_attempt_at = Some(next_attempt_at);
            e.error_message = Some(error.to_string());
            e.updated_at = now;
        })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        owner: &str,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        self.update_processing(id, owner, |e| {
            e.status = QueueStatus::Failed;
            e.attempts = attempts.min(e.max_attempts);
            e.next_attempt_at = None;
            e.error_message = Some(error.to_string());
            e.updated_at = now;
        })
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut entries = self.entries.lock();
        let mut n = 0;
        for entry in entries.values_mut() {
            let stale = entry.status == QueueStatus::Processing
                && entry.claimed_at.map_or(true, |at| at < claimed_before);
            if stale {
                entry.status = QueueStatus::Pending;
                entry.claimed_at = None;
                entry.claimed_by = None;
                entry.next_attempt_at = Some(now);
                entry.updated_at = now;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn cancel_pending(
        &self,
        scope: CancelScope,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut entries = self.entries.lock();
        let mut n = 0;
        for entry in entries.values_mut() {
            let in_scope = match scope {
                CancelScope::Batch(id) => entry.batch_id == id,
                CancelScope::Segment(id) => entry.segment_id == Some(id),
                CancelScope::User(id) => entry.user_id == Some(id),
            };
            if in_scope && entry.status == QueueStatus::Pending {
                entry.status = QueueStatus::Cancelled;
                entry.next_attempt_at = None;
                entry.error_message = Some(reason.to_string());
                entry.updated_at = now;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn count_by_status(&self, batch_id: Option<Uuid>) -> anyhow::Result<StatusCounts> {
        let entries = self.entries.lock();
        let mut counts = StatusCounts::default();
        for entry in entries.values() {
            if batch_id.map_or(true, |b| entry.batch_id == b) {
                counts.add(entry.status, 1);
            }
        }
        Ok(counts)
    }

    async fn list_batch(&self, batch_id: Uuid) -> anyhow::Result<Vec<QueueEntry>> {
        let entries = self.entries.lock();
        let mut rows: Vec<QueueEntry> = entries
            .values()
            .filter(|e| e.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| (e.created_at, e.id));
        Ok(rows)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: i64) -> anyhow::Result<u64> {
        let mut entries = self.entries.lock();
        let mut doomed: Vec<(DateTime<Utc>, Uuid)> = entries
            .values()
            .filter(|e| e.status.is_terminal() && e.updated_at < cutoff)
            .map(|e| (e.updated_at, e.id))
            .collect();
        doomed.sort();
        doomed.truncate(limit.max(0) as usize);
        for (_, id) in &doomed {
            entries.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
