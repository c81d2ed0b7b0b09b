use std::sync::Arc;
use std::time::{Duration, Instant};

use sendflow::api;
use sendflow::clock::{Clock, SystemClock};
use sendflow::config;
use sendflow::db;
use sendflow::dispatch::{BatchProcessor, EventDispatcher, PgHistoryListener, TracingListener};
use sendflow::gateway::{self, ResilientGatewayClient};
use sendflow::queue::{BatchStatusTracker, E164Validator, PgQueueStore, QueueEnqueuer, QueueStore};
use sendflow::resilience::{
    CircuitBreaker, CircuitBreakerStateStore, InMemoryCircuitStateStore, PgCircuitStateStore,
    RetryPolicy,
};
use tracing_subscriber::EnvFilter;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);
const PURGE_CHUNK: i64 = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::Config::from_env()?;
    let api_addr = cfg.admin_addr.clone();
    let batch_size = cfg.batch_size;
    let poll_interval = Duration::from_millis(cfg.poll_interval_ms);
    let reclaim_interval = Duration::from_millis(cfg.reclaim_interval_ms);
    let stale_threshold = cfg.dispatch.stale_processing_threshold();

    tracing::info!(
        worker_id = %cfg.worker_id,
        batch_size,
        poll_interval_ms = cfg.poll_interval_ms,
        reclaim_interval_ms = cfg.reclaim_interval_ms,
        stale_threshold_secs = stale_threshold.as_secs(),
        api = api_addr.as_deref().unwrap_or("disabled"),
        shared_circuit_state = cfg.shared_circuit_state,
        migrate_on_startup = cfg.migrate_on_startup,
        retention_days = ?cfg.retention_days,
        gateway = ?cfg.gateway,
        "sendflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn QueueStore> = Arc::new(PgQueueStore::new(pool.clone()));

    let circuit_store: Arc<dyn CircuitBreakerStateStore> = if cfg.shared_circuit_state {
        Arc::new(PgCircuitStateStore::new(pool.clone()))
    } else {
        Arc::new(InMemoryCircuitStateStore::new())
    };

    let raw_gateway = gateway::from_config(&cfg.gateway)?;
    let breaker = Arc::new(CircuitBreaker::new(
        raw_gateway.name(),
        cfg.dispatch.breaker(),
        circuit_store,
        clock.clone(),
    ));
    let inline_retry = RetryPolicy::new(cfg.dispatch.inline_retry()).with_on_retry(|err, attempt, delay| {
        tracing::debug!(
            kind = err.kind().as_str(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying provider call"
        );
    });
    let client = Arc::new(ResilientGatewayClient::new(raw_gateway, breaker, inline_retry));

    let events = EventDispatcher::default()
        .with_listener(Arc::new(TracingListener))
        .with_listener(Arc::new(PgHistoryListener::new(pool.clone())));

    let processor = Arc::new(
        BatchProcessor::new(
            store.clone(),
            client,
            RetryPolicy::new(cfg.dispatch.queue_retry()),
            clock.clone(),
        )
        .with_events(events)
        .with_worker_id(cfg.worker_id.clone()),
    );

    let enqueuer = Arc::new(
        QueueEnqueuer::new(store.clone(), clock.clone(), cfg.dispatch.max_attempts)
            .with_validator(Arc::new(E164Validator::new(cfg.default_country_code.clone()))),
    );

    // ---- API task ----
    let app = api::router(api::ApiState {
        enqueuer,
        processor: processor.clone(),
        tracker: BatchStatusTracker::new(store.clone()),
    });

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Retention task ----
    let retention_days = cfg.retention_days;
    let purge_store = store.clone();
    let purge_clock = clock.clone();
    let purge_handle = tokio::spawn(async move {
        let Some(days) = retention_days else {
            std::future::pending::<()>().await;
            return Ok(());
        };

        loop {
            let cutoff = purge_clock.now() - chrono::Duration::days(days);
            let mut purged = 0;
            loop {
                match purge_store.purge_finished_before(cutoff, PURGE_CHUNK).await {
                    Ok(n) => {
                        purged += n;
                        if n < PURGE_CHUNK as u64 {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "purge failed");
                        break;
                    }
                }
            }
            if purged > 0 {
                tracing::info!(purged, retention_days = days, "purged finished entries");
            }

            tokio::time::sleep(PURGE_INTERVAL).await;
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    // ---- Dispatch loop task ----
    let worker_id = cfg.worker_id.clone();
    let worker_handle = tokio::spawn(async move {
        let mut last_reclaim_at: Option<Instant> = None;

        loop {
            // stale claims are checked on a fixed interval, not every batch
            if last_reclaim_at.map_or(true, |at| at.elapsed() >= reclaim_interval) {
                if let Err(e) = processor.find_expired_processing(stale_threshold).await {
                    tracing::error!(worker_id = %worker_id, error = %e, "reclaim failed");
                }
                last_reclaim_at = Some(Instant::now());
            }

            match processor.process_next_batch(batch_size).await {
                Ok(summary) if summary.is_empty() => tokio::time::sleep(poll_interval).await,
                // a short batch means the queue is drained for now
                Ok(summary) if summary.total < batch_size => tokio::time::sleep(poll_interval / 4).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "batch failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = api_handle => res??,
        res = worker_handle => res??,
        res = purge_handle => res??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, stopping worker");
        }
    }

    Ok(())
}
