use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch priority. Stored as its rank so `ORDER BY priority DESC`
/// puts urgent messages first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "sent" => Some(QueueStatus::Sent),
            "failed" => Some(QueueStatus::Failed),
            "cancelled" => Some(QueueStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Sent | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }
}

/// One outbound message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub phone_number: String,
    pub message: String,
    pub user_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub sender_name: Option<String>,
    pub priority: Priority,
    pub status: QueueStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub batch_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    /// Earliest time the entry may be picked. `None` once terminal.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Claim token of the worker holding a processing entry.
    pub claimed_by: Option<String>,
    pub external_message_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields of an entry; the rest is filled in on enqueue.
#[derive(Debug, Clone, Default)]
pub struct NewQueueEntry {
    pub phone_number: String,
    pub message: String,
    pub user_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub sender_name: Option<String>,
    pub priority: Priority,
    pub max_attempts: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn pending(
        new: NewQueueEntry,
        batch_id: Uuid,
        default_max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Self {
        let scheduled_at = new.scheduled_at.unwrap_or(now);
        Self {
            id: Uuid::new_v4(),
            phone_number: new.phone_number,
            message: new.message,
            user_id: new.user_id,
            segment_id: new.segment_id,
            sender_name: new.sender_name,
            priority: new.priority,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(default_max_attempts).max(1),
            batch_id,
            scheduled_at,
            next_attempt_at: Some(scheduled_at),
            claimed_at: None,
            claimed_by: None,
            external_message_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-status entry counts for a batch or the whole queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: QueueStatus, n: i64) {
        match status {
            QueueStatus::Pending => self.pending += n,
            QueueStatus::Processing => self.processing += n,
            QueueStatus::Sent => self.sent += n,
            QueueStatus::Failed => self.failed += n,
            QueueStatus::Cancelled => self.cancelled += n,
        }
        self.total += n;
    }

    /// Nothing left to dispatch.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_by_rank() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        for p in [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent] {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn pending_entry_is_due_at_its_schedule() {
        let now = Utc::now();
        let later = now + chrono::Duration::minutes(5);
        let entry = QueueEntry::pending(
            NewQueueEntry {
                phone_number: "+2250700000001".into(),
                message: "hi".into(),
                scheduled_at: Some(later),
                ..NewQueueEntry::default()
            },
            Uuid::new_v4(),
            3,
            now,
        );
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.max_attempts, 3);
        assert_eq!(entry.next_attempt_at, Some(later));
    }

    #[test]
    fn counts_track_total() {
        let mut c = StatusCounts::default();
        c.add(QueueStatus::Sent, 3);
        c.add(QueueStatus::Pending, 1);
        assert_eq!(c.total, 4);
        assert!(!c.is_settled());
        assert!(QueueStatus::Cancelled.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
    }
}
