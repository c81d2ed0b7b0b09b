#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{postgres::PgPoolOptions, PgPool};

use sendflow::clock::ManualClock;
use sendflow::dispatch::{BatchProcessor, DispatchEvent, EventDispatcher, EventListener};
use sendflow::gateway::{
    GatewayError, MessageGateway, OutboundMessage, ResilientGatewayClient, SendReceipt,
};
use sendflow::queue::{BatchStatusTracker, InMemoryQueueStore, QueueEnqueuer};
use sendflow::resilience::{
    CircuitBreaker, CircuitBreakerConfig, InMemoryCircuitStateStore, RetryConfig, RetryPolicy,
};

/// Connects to `TEST_DATABASE_URL`, migrates and truncates.
/// Returns `None` (and the caller skips) when no database is configured.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            message_history,
            circuit_breakers,
            message_queue
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

pub fn server_down() -> GatewayError {
    GatewayError::Server {
        status: 503,
        message: "service unavailable".into(),
    }
}

pub fn rejected() -> GatewayError {
    GatewayError::Validation("invalid destination".into())
}

/// Provider double. Plays back scripted outcomes first, then either
/// succeeds or fails with `failing` for every later call.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<(), GatewayError>>>,
    failing: Mutex<Option<fn() -> GatewayError>>,
    delivered: Mutex<Vec<OutboundMessage>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn healthy() -> Arc<Self> {
        Self::scripted(vec![])
    }

    pub fn scripted(outcomes: Vec<Result<(), GatewayError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            failing: Mutex::new(None),
            delivered: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing_with(make: fn() -> GatewayError) -> Arc<Self> {
        let gw = Self::healthy();
        gw.set_failing(Some(make));
        gw
    }

    pub fn set_failing(&self, make: Option<fn() -> GatewayError>) {
        *self.failing.lock() = make;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl MessageGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // let concurrent workers interleave
        tokio::task::yield_now().await;

        let next = self.script.lock().pop_front();
        let outcome = match next {
            Some(outcome) => outcome,
            None => match *self.failing.lock() {
                Some(make) => Err(make()),
                None => Ok(()),
            },
        };

        outcome.map(|_| {
            self.delivered.lock().push(message.clone());
            SendReceipt {
                external_message_id: format!("ext-{}", message.entry_id),
                provider: "scripted".into(),
            }
        })
    }
}

#[derive(Default)]
pub struct CollectingListener {
    events: Mutex<Vec<DispatchEvent>>,
}

impl CollectingListener {
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventListener for CollectingListener {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn on_event(&self, event: &DispatchEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub inline_attempts: u32,
    pub failure_threshold: u32,
    pub default_max_attempts: i32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            inline_attempts: 1,
            failure_threshold: 5,
            default_max_attempts: 3,
        }
    }
}

/// Everything a worker process wires together, over in-memory stores
/// and a manual clock.
pub struct Pipeline {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryQueueStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub client: Arc<ResilientGatewayClient>,
    pub processor: Arc<BatchProcessor>,
    pub enqueuer: Arc<QueueEnqueuer>,
    pub tracker: BatchStatusTracker,
    pub listener: Arc<CollectingListener>,
}

impl Pipeline {
    pub fn new(gateway: Arc<ScriptedGateway>, opts: PipelineOptions) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryQueueStore::new());

        let breaker = CircuitBreaker::new(
            "scripted",
            CircuitBreakerConfig {
                failure_threshold: opts.failure_threshold,
                ..CircuitBreakerConfig::default()
            },
            Arc::new(InMemoryCircuitStateStore::new()),
            clock.clone(),
        );
        let inline = RetryPolicy::new(RetryConfig {
            max_attempts: opts.inline_attempts,
            base_delay: Duration::from_millis(100),
            ..RetryConfig::default()
        });
        let client = Arc::new(ResilientGatewayClient::new(
            gateway.clone(),
            Arc::new(breaker),
            inline,
        ));

        let listener = Arc::new(CollectingListener::default());
        let processor = Arc::new(
            BatchProcessor::new(
                store.clone(),
                client.clone(),
                RetryPolicy::new(RetryConfig::default()),
                clock.clone(),
            )
            .with_events(EventDispatcher::default().with_listener(listener.clone())),
        );
        let enqueuer = Arc::new(QueueEnqueuer::new(
            store.clone(),
            clock.clone(),
            opts.default_max_attempts,
        ));

        Self {
            tracker: BatchStatusTracker::new(store.clone()),
            clock,
            store,
            gateway,
            client,
            processor,
            enqueuer,
            listener,
        }
    }

    pub fn healthy() -> Self {
        Self::new(ScriptedGateway::healthy(), PipelineOptions::default())
    }

    /// A second worker over the same queue and provider.
    pub fn extra_worker(&self) -> Arc<BatchProcessor> {
        Arc::new(BatchProcessor::new(
            self.store.clone(),
            self.client.clone(),
            RetryPolicy::new(RetryConfig::default()),
            self.clock.clone(),
        ))
    }
}

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn phone(n: usize) -> String {
    format!("+22507{n:08}")
}
