use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// `SET synchronous_commit = OFF` per connection. Faster, but a crash can
    /// lose the last few committed outcomes (they are re-sent after reclaim).
    pub disable_sync_commit: bool,
    pub disable_jit: bool,
}

impl PoolSettings {
    pub fn from_env() -> Self {
        let max_connections = std::env::var("SENDFLOW_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(8)
            .clamp(1, 64);

        let acquire_timeout_secs = std::env::var("SENDFLOW_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(10)
            .clamp(1, 60);

        Self {
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            disable_sync_commit: env_flag("SENDFLOW_DB_DISABLE_SYNC_COMMIT", false),
            disable_jit: env_flag("SENDFLOW_DB_DISABLE_JIT", true),
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

pub async fn make_pool(database_url: &str) -> anyhow::Result<PgPool> {
    connect(database_url, PoolSettings::from_env()).await
}

pub async fn connect(database_url: &str, settings: PoolSettings) -> anyhow::Result<PgPool> {
    let PoolSettings {
        max_connections,
        acquire_timeout,
        disable_sync_commit,
        disable_jit,
    } = settings;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if disable_sync_commit {
                    sqlx::query("SET synchronous_commit = OFF")
                        .execute(&mut *conn)
                        .await?;
                }
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    tracing::debug!(max_connections, "database pool ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
