use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::model::{Priority, QueueEntry, QueueStatus, StatusCounts};
use super::store::{CancelScope, QueueStore};

// 19 binds per row keeps each statement well under the 65535 parameter cap.
const INSERT_CHUNK: usize = 1000;

const ENTRY_COLUMNS: &str = r#"
    id, phone_number, message, user_id, segment_id, sender_name,
    priority, status, attempts, max_attempts, batch_id,
    scheduled_at, next_attempt_at, claimed_at, claimed_by,
    external_message_id, error_message, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    phone_number: String,
    message: String,
    user_id: Option<Uuid>,
    segment_id: Option<Uuid>,
    sender_name: Option<String>,
    priority: i16,
    status: String,
    attempts: i32,
    max_attempts: i32,
    batch_id: Uuid,
    scheduled_at: DateTime<Utc>,
    next_attempt_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    external_message_id: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = anyhow::Error;

    fn try_from(row: QueueRow) -> anyhow::Result<Self> {
        let priority = Priority::from_rank(row.priority)
            .ok_or_else(|| anyhow::anyhow!("entry {} has unknown priority {}", row.id, row.priority))?;
        let status = QueueStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("entry {} has unknown status '{}'", row.id, row.status))?;

        Ok(QueueEntry {
            id: row.id,
            phone_number: row.phone_number,
            message: row.message,
            user_id: row.user_id,
            segment_id: row.segment_id,
            sender_name: row.sender_name,
            priority,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            batch_id: row.batch_id,
            scheduled_at: row.scheduled_at,
            next_attempt_at: row.next_attempt_at,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by,
            external_message_id: row.external_message_id,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_entries(rows: Vec<QueueRow>) -> anyhow::Result<Vec<QueueEntry>> {
    rows.into_iter().map(QueueEntry::try_from).collect()
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn insert_batch(&self, entries: &[QueueEntry]) -> anyhow::Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in entries.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO message_queue ({ENTRY_COLUMNS}) "));
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(e.id)
                    .push_bind(&e.phone_number)
                    .push_bind(&e.message)
                    .push_bind(e.user_id)
                    .push_bind(e.segment_id)
                    .push_bind(&e.sender_name)
                    .push_bind(e.priority.rank())
                    .push_bind(e.status.as_str())
                    .push_bind(e.attempts)
                    .push_bind(e.max_attempts)
                    .push_bind(e.batch_id)
                    .push_bind(e.scheduled_at)
                    .push_bind(e.next_attempt_at)
                    .push_bind(e.claimed_at)
                    .push_bind(&e.claimed_by)
                    .push_bind(&e.external_message_id)
                    .push_bind(&e.error_message)
                    .push_bind(e.created_at)
                    .push_bind(e.updated_at);
            });
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM message_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueEntry::try_from).transpose()
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM message_queue
            WHERE status = 'pending'
              AND next_attempt_at <= $1
            ORDER BY priority DESC, scheduled_at ASC, created_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    async fn claim(&self, id: Uuid, owner: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = 'processing',
                claimed_at = $3,
                claimed_by = $2,
                updated_at = $3
            WHERE id = $1
              AND status = 'pending'
              AND next_attempt_at <= $3
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn renew_claim(&self, id: Uuid, owner: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET claimed_at = $3,
                updated_at = $3
            WHERE id = $1
              AND status = 'processing'
              AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        owner: &str,
        external_message_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = 'sent',
                external_message_id = $2,
                error_message = NULL,
                next_attempt_at = NULL,
                claimed_at = NULL,
                claimed_by = NULL,
                updated_at = $3
            WHERE id = $1
              AND status = 'processing'
              AND claimed_by = $4
            "#,
        )
        .bind(id)
        .bind(external_message_id)
        .bind(now)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
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
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = 'pending',
                attempts = LEAST($2, max_attempts),
                next_attempt_at = $3,
                error_message = $4,
                claimed_at = NULL,
                claimed_by = NULL,
                updated_at = $5
            WHERE id = $1
              AND status = 'processing'
              AND claimed_by = $6
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn defer(
        &self,
        id: Uuid,
        owner: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = 'pending',
                next_attempt_at = $2,
                error_message = $3,
                claimed_at = NULL,
                claimed_by = NULL,
                updated_at = $4
            WHERE id = $1
              AND status = 'processing'
              AND claimed_by = $5
            "#,
        )
        .bind(id)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        owner: &str,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = 'failed',
                attempts = LEAST($2, max_attempts),
                next_attempt_at = NULL,
                error_message = $3,
                claimed_at = NULL,
                claimed_by = NULL,
                updated_at = $4
            WHERE id = $1
              AND status = 'processing'
              AND claimed_by = $5
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(now)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = 'pending',
                claimed_at = NULL,
                claimed_by = NULL,
                next_attempt_at = $2,
                updated_at = $2
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at < $1)
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn cancel_pending(
        &self,
        scope: CancelScope,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let (column, id) = match scope {
            CancelScope::Batch(id) => ("batch_id", id),
            CancelScope::Segment(id) => ("segment_id", id),
            CancelScope::User(id) => ("user_id", id),
        };

        let res = sqlx::query(&format!(
            r#"
            UPDATE message_queue
            SET status = 'cancelled',
                next_attempt_at = NULL,
                error_message = $2,
                updated_at = $3
            WHERE {column} = $1
              AND status = 'pending'
            "#
        ))
        .bind(id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn count_by_status(&self, batch_id: Option<Uuid>) -> anyhow::Result<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM message_queue
            WHERE ($1::uuid IS NULL OR batch_id = $1)
            GROUP BY status
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match QueueStatus::parse(&status) {
                Some(status) => counts.add(status, n),
                None => tracing::warn!(status = %status, n, "ignoring unknown queue status"),
            }
        }
        Ok(counts)
    }

    async fn list_batch(&self, batch_id: Uuid) -> anyhow::Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM message_queue
            WHERE batch_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: i64) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            WITH doomed AS (
                SELECT id
                FROM message_queue
                WHERE status IN ('sent', 'failed', 'cancelled')
                  AND updated_at < $1
                ORDER BY updated_at ASC
                LIMIT $2
            )
            DELETE FROM message_queue q
            USING doomed d
            WHERE q.id = d.id
            "#,
        )
        .bind(cutoff)
        .bind(limit.max(0))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}
