use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::gateway::{ErrorKind, GatewayError};

type RetryHook = dyn Fn(&GatewayError, u32, Duration) + Send + Sync;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub retryable_kinds: HashSet<ErrorKind>,
    /// Spread applied by `jittered_delay`, e.g. 0.2 for +/-20%.
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
            retryable_kinds: default_retryable_kinds(),
            jitter_pct: 0.0,
        }
    }
}

pub fn default_retryable_kinds() -> HashSet<ErrorKind> {
    [ErrorKind::Network, ErrorKind::Server, ErrorKind::RateLimit]
        .into_iter()
        .collect()
}

/// Exponential backoff with a cap, plus the retry loop that uses it.
#[derive(Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
    on_retry: Option<Arc<RetryHook>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("cfg", &self.cfg)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg, on_retry: None }
    }

    /// Observer called before every backoff sleep with
    /// (error, attempt that just failed, delay about to be slept).
    pub fn with_on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&GatewayError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.cfg
    }

    /// `min(base * multiplier^(attempt-1), max)`. `attempt` is 1-based.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = self.cfg.max_delay.as_millis() as f64;
        let raw_ms = self.cfg.base_delay.as_millis() as f64 * self.cfg.multiplier.powi(exp);

        let ms = if raw_ms.is_finite() {
            raw_ms.clamp(0.0, max_ms)
        } else {
            max_ms
        };
        Duration::from_millis(ms.round() as u64)
    }

    /// `compute_delay` with +/- `jitter_pct` noise, still within `[0, max_delay]`.
    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let delay = self.compute_delay(attempt);
        if self.cfg.jitter_pct <= 0.0 {
            return delay;
        }

        let delay_ms = delay.as_millis() as f64;
        let range = delay_ms * self.cfg.jitter_pct;
        let jitter = rng.gen_range(-range..=range);
        let max_ms = self.cfg.max_delay.as_millis() as f64;
        Duration::from_millis((delay_ms + jitter).round().clamp(0.0, max_ms) as u64)
    }

    /// Retry eligibility of a single call's error.
    pub fn is_retryable(&self, err: &GatewayError) -> bool {
        self.cfg.retryable_kinds.contains(&err.kind())
    }

    /// Retry eligibility of a whole send's outcome, looking through
    /// exhausted-retry wrappers to the underlying failure.
    pub fn is_retryable_outcome(&self, err: &GatewayError) -> bool {
        self.cfg.retryable_kinds.contains(&err.root_kind())
    }

    fn delay_after(&self, err: &GatewayError, attempt: u32) -> Duration {
        let delay = self.compute_delay(attempt);
        match err {
            GatewayError::RateLimited {
                retry_after: Some(hint),
                ..
            } => delay.max(*hint).min(self.cfg.max_delay),
            _ => delay,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` tries have failed.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let max_attempts = self.cfg.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.is_retryable(&err) {
                return Err(err);
            }

            if attempt >= max_attempts {
                return Err(GatewayError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_after(&err, attempt);
            if let Some(hook) = &self.on_retry {
                hook(&err, attempt, delay);
            }
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "gateway call failed, backing off"
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            ..RetryConfig::default()
        })
    }

    fn server_error() -> GatewayError {
        GatewayError::Server {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = policy(5);
        assert_eq!(p.compute_delay(1), Duration::from_millis(1000));
        assert_eq!(p.compute_delay(2), Duration::from_millis(2000));
        assert_eq!(p.compute_delay(3), Duration::from_millis(4000));
        assert_eq!(p.compute_delay(4), Duration::from_millis(8000));
        assert_eq!(p.compute_delay(5), Duration::from_millis(10_000));
    }

    #[test]
    fn delay_never_exceeds_max_even_for_huge_attempts() {
        let p = policy(5);
        for attempt in [6, 10, 64, 1_000, u32::MAX] {
            assert_eq!(p.compute_delay(attempt), Duration::from_millis(10_000));
        }
        assert_eq!(p.compute_delay(0), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy::new(RetryConfig {
            jitter_pct: 0.2,
            ..RetryConfig::default()
        });
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = p.jittered_delay(2, &mut rng);
            assert!(d >= Duration::from_millis(1600) && d <= Duration::from_millis(2400));
            assert!(p.jittered_delay(9, &mut rng) <= Duration::from_millis(10_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = policy(3)
            .execute(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(GatewayError::TransientNetwork("connection reset".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = policy(5)
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Validation("invalid msisdn".into()))
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_wrap_the_last_error() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = policy(3)
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(server_error())
            })
            .await;

        match result {
            Err(GatewayError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, GatewayError::Server { status: 503, .. }));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn on_retry_hook_sees_each_backoff() {
        let seen: Arc<Mutex<Vec<(u32, Duration)>>> = Arc::default();
        let sink = seen.clone();
        let p = policy(3).with_on_retry(move |_err, attempt, delay| {
            sink.lock().push((attempt, delay));
        });

        let _ = p.execute(|| async { Err::<(), _>(server_error()) }).await;

        assert_eq!(
            *seen.lock(),
            vec![(1, Duration::from_millis(1000)), (2, Duration::from_millis(2000))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_for_the_computed_delay() {
        let start = tokio::time::Instant::now();
        let _ = policy(3).execute(|| async { Err::<(), _>(server_error()) }).await;
        // 1s after attempt 1, 2s after attempt 2
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_extends_the_wait() {
        let seen: Arc<Mutex<Vec<Duration>>> = Arc::default();
        let sink = seen.clone();
        let p = policy(2).with_on_retry(move |_err, _attempt, delay| sink.lock().push(delay));

        let _ = p
            .execute(|| async {
                Err::<(), _>(GatewayError::RateLimited {
                    retry_after: Some(Duration::from_secs(5)),
                    message: "slow down".into(),
                })
            })
            .await;

        assert_eq!(*seen.lock(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn outcome_classification_looks_through_wrapper() {
        let p = policy(3);
        let wrapped = GatewayError::RetriesExhausted {
            attempts: 3,
            last: Box::new(server_error()),
        };
        assert!(!p.is_retryable(&wrapped));
        assert!(p.is_retryable_outcome(&wrapped));
        assert!(!p.is_retryable_outcome(&GatewayError::Validation("x".into())));
    }
}
