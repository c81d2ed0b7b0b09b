use std::env;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sendflow::clock::SystemClock;
use sendflow::config::Config;
use sendflow::db;
use sendflow::queue::{
    BatchStatusTracker, CancelScope, E164Validator, EnqueueOptions, PgQueueStore, Priority,
    QueueEnqueuer, QueueStore, StatusCounts,
};

const USAGE: &str = "sendflowctl <command>\n\
Commands:\n\
- migrate\n\
- stats\n\
- batch <batch_id>\n\
- entries <batch_id>\n\
- cancel <batch_id> [reason]\n\
- reclaim [stale_seconds]\n\
- enqueue <phone> <message> [priority]\n\
- purge <older_than_days>\n\
\n\
Reads the same environment as the worker (DATABASE_URL, SENDFLOW_*).\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries command output; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprint!("{USAGE}");
        std::process::exit(2);
    };

    let cfg = Config::from_env()?;
    let pool = db::make_pool(&cfg.database_url).await?;
    let store = Arc::new(PgQueueStore::new(pool.clone()));
    let tracker = BatchStatusTracker::new(store.clone());

    match command.as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "stats" => {
            let counts = tracker.queue_stats().await?;
            print_counts("queue", &counts);
        }
        "batch" => {
            let batch_id = uuid_arg(&args, 2, "batch <batch_id>")?;
            let counts = tracker.batch_status(batch_id).await?;
            print_counts(&format!("batch {batch_id}"), &counts);
            if counts.total > 0 && counts.is_settled() {
                println!("batch is settled");
            }
        }
        "entries" => {
            let batch_id = uuid_arg(&args, 2, "entries <batch_id>")?;
            for e in tracker.batch_entries(batch_id).await? {
                println!(
                    "{} {:<10} {:<6} attempts={}/{} to={} {}",
                    e.id,
                    e.status.as_str(),
                    e.priority.as_str(),
                    e.attempts,
                    e.max_attempts,
                    e.phone_number,
                    e.error_message.as_deref().unwrap_or("")
                );
            }
        }
        "cancel" => {
            let batch_id = uuid_arg(&args, 2, "cancel <batch_id> [reason]")?;
            let reason = args.get(3).map(String::as_str).unwrap_or("cancelled");
            let n = store
                .cancel_pending(CancelScope::Batch(batch_id), reason, Utc::now())
                .await?;
            println!("cancelled {n} pending entries");
        }
        "reclaim" => {
            let secs: i64 = match args.get(2) {
                Some(s) => s.parse()?,
                None => cfg.dispatch.stale_processing_threshold_seconds as i64,
            };
            let now = Utc::now();
            let n = store.reclaim_stale(now - Duration::seconds(secs), now).await?;
            println!("reclaimed {n} entries stuck in processing for more than {secs}s");
        }
        "enqueue" => {
            let (Some(phone), Some(message)) = (args.get(2), args.get(3)) else {
                anyhow::bail!("usage: sendflowctl enqueue <phone> <message> [priority]");
            };
            let priority = match args.get(4) {
                Some(p) => Priority::parse(p).ok_or_else(|| anyhow::anyhow!("unknown priority '{p}'"))?,
                None => Priority::Normal,
            };
            let enqueuer = QueueEnqueuer::new(
                store.clone(),
                Arc::new(SystemClock),
                cfg.dispatch.max_attempts,
            )
            .with_validator(Arc::new(E164Validator::new(cfg.default_country_code.clone())));
            let entry = enqueuer
                .enqueue(
                    phone,
                    message,
                    EnqueueOptions {
                        priority,
                        ..EnqueueOptions::default()
                    },
                )
                .await?;
            println!("+ enqueued id={} batch={} to={}", entry.id, entry.batch_id, entry.phone_number);
        }
        "purge" => {
            let days: i64 = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: sendflowctl purge <older_than_days>"))?
                .parse()?;
            let cutoff = Utc::now() - Duration::days(days);
            let mut total = 0;
            loop {
                let n = store.purge_finished_before(cutoff, 1000).await?;
                total += n;
                if n < 1000 {
                    break;
                }
            }
            println!("purged {total} finished entries older than {days} days");
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprint!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn uuid_arg(args: &[String], idx: usize, usage: &str) -> anyhow::Result<Uuid> {
    let raw = args
        .get(idx)
        .ok_or_else(|| anyhow::anyhow!("usage: sendflowctl {usage}"))?;
    Ok(raw.parse()?)
}

fn print_counts(label: &str, c: &StatusCounts) {
    println!(
        "{label}: total={} pending={} processing={} sent={} failed={} cancelled={}",
        c.total, c.pending, c.processing, c.sent, c.failed, c.cancelled
    );
}
