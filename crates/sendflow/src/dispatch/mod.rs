pub mod events;
pub mod processor;

pub use events::{
    DispatchEvent, EventDispatcher, EventListener, MessageFailed, MessageSent, PgHistoryListener,
    TracingListener,
};
pub use processor::{BatchProcessor, BatchSummary};
