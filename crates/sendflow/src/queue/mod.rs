pub mod enqueuer;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod status;
pub mod store;

pub use enqueuer::{
    BatchReceipt, BulkRecipient, E164Validator, EnqueueError, EnqueueOptions, PhoneValidator,
    QueueEnqueuer, RecipientDirectory,
};
pub use memory::InMemoryQueueStore;
pub use model::{NewQueueEntry, Priority, QueueEntry, QueueStatus, StatusCounts};
pub use postgres::PgQueueStore;
pub use status::BatchStatusTracker;
pub use store::{CancelScope, QueueStore};
