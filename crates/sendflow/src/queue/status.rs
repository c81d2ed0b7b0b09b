use std::sync::Arc;

use uuid::Uuid;

use super::model::{QueueEntry, StatusCounts};
use super::store::QueueStore;

/// Read-only progress views over the queue.
#[derive(Clone)]
pub struct BatchStatusTracker {
    store: Arc<dyn QueueStore>,
}

impl BatchStatusTracker {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// All-zero counts for an unknown batch.
    pub async fn batch_status(&self, batch_id: Uuid) -> anyhow::Result<StatusCounts> {
        self.store.count_by_status(Some(batch_id)).await
    }

    pub async fn queue_stats(&self) -> anyhow::Result<StatusCounts> {
        self.store.count_by_status(None).await
    }

    pub async fn batch_entries(&self, batch_id: Uuid) -> anyhow::Result<Vec<QueueEntry>> {
        self.store.list_batch(batch_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::InMemoryQueueStore;
    use crate::queue::model::{NewQueueEntry, QueueStatus};
    use chrono::Utc;

    #[tokio::test]
    async fn counts_are_scoped_to_the_batch() {
        let store = Arc::new(InMemoryQueueStore::new());
        let now = Utc::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mk = |batch| {
            QueueEntry::pending(
                NewQueueEntry {
                    phone_number: "+2250700000001".into(),
                    message: "hi".into(),
                    ..NewQueueEntry::default()
                },
                batch,
                3,
                now,
            )
        };
        let first = mk(a);
        store.insert_batch(&[first.clone(), mk(a), mk(b)]).await.unwrap();
        store.claim(first.id, "w1", now).await.unwrap();
        store.mark_sent(first.id, "w1", "ext-1", now).await.unwrap();

        let tracker = BatchStatusTracker::new(store);
        let counts = tracker.batch_status(a).await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.pending, 1);

        assert_eq!(tracker.queue_stats().await.unwrap().total, 3);
        assert_eq!(tracker.batch_status(Uuid::new_v4()).await.unwrap(), StatusCounts::default());

        let entries = tracker.batch_entries(a).await.unwrap();
        assert_eq!(entries.iter().filter(|e| e.status == QueueStatus::Sent).count(), 1);
    }
}
