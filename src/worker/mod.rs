//! Worker loop and per-domain politeness limiting.
//!
//! Workers poll the store for due queued runs and execute them with
//! bounded concurrency. Within a worker each run executes as one
//! synchronous flow; parallelism comes from running several executors at
//! once. A token-bucket limiter keyed by domain keeps the HTTP tier
//! polite independently of any anti-bot signals.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;

use crate::executor::RunExecutor;
use crate::intervention::InterventionEngine;
use crate::store::Store;
use crate::utils::now_unix;

/// How often the worker polls for due runs.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How often the intervention expiry sweep runs.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Runs claimed per poll round.
const CLAIM_BATCH: u32 = 16;

/// Rate-limit decision for one domain bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    Deny { retry_after: Duration },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket politeness limiter, one bucket per domain.
///
/// A non-positive rate disables limiting entirely.
pub struct PolitenessLimiter {
    rate_rps: f64,
    buckets: DashMap<String, parking_lot::Mutex<Bucket>>,
}

impl PolitenessLimiter {
    #[must_use]
    pub fn new(rate_rps: f64) -> Self {
        Self {
            rate_rps,
            buckets: DashMap::new(),
        }
    }

    /// Try to take one token for a domain.
    #[must_use]
    pub fn check(&self, domain: &str) -> RateDecision {
        if self.rate_rps <= 0.0 {
            return RateDecision::Allow;
        }

        let max_tokens = self.rate_rps.max(1.0);
        let entry = self.buckets.entry(domain.to_string()).or_insert_with(|| {
            parking_lot::Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            })
        });

        let mut bucket = entry.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_rps).min(max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allow
        } else {
            let deficit = 1.0 - bucket.tokens;
            RateDecision::Deny {
                retry_after: Duration::from_secs_f64(deficit / self.rate_rps),
            }
        }
    }

    /// Sleep until a token is available for the domain.
    pub async fn wait_for_slot(&self, domain: &str) {
        loop {
            match self.check(domain) {
                RateDecision::Allow => return,
                RateDecision::Deny { retry_after } => {
                    debug!("politeness limiter deferring fetch to {domain} for {retry_after:?}");
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }

    #[must_use]
    pub fn tracked_domains(&self) -> usize {
        self.buckets.len()
    }
}

/// Polling worker: claims due runs and drives executors concurrently.
pub struct Worker {
    store: Store,
    executor: Arc<RunExecutor>,
    intervention: Arc<InterventionEngine>,
    concurrency: usize,
}

impl Worker {
    #[must_use]
    pub fn new(
        store: Store,
        executor: Arc<RunExecutor>,
        intervention: Arc<InterventionEngine>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            executor,
            intervention,
            concurrency: concurrency.max(1),
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("worker loop starting with concurrency {}", self.concurrency);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut active: FuturesUnordered<tokio::task::JoinHandle<()>> = FuturesUnordered::new();
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let mut expiry_sweep = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.claim_round(&semaphore, &mut active).await {
                        warn!("claim round failed: {e}");
                    }
                }
                _ = expiry_sweep.tick() => {
                    match self.intervention.expire_overdue().await {
                        Ok(0) => {}
                        Ok(n) => debug!("expiry sweep complete: {n} tasks expired"),
                        Err(e) => warn!("expiry sweep failed: {e}"),
                    }
                }
                Some(finished) = active.next(), if !active.is_empty() => {
                    if let Err(e) = finished {
                        error!("executor task panicked: {e}");
                    }
                }
            }
        }

        // Drain in-flight executors before returning
        info!("worker draining {} in-flight executors", active.len());
        while let Some(finished) = active.next().await {
            if let Err(e) = finished {
                error!("executor task panicked during drain: {e}");
            }
        }
        info!("worker loop stopped");
    }

    async fn claim_round(
        &self,
        semaphore: &Arc<Semaphore>,
        active: &mut FuturesUnordered<tokio::task::JoinHandle<()>>,
    ) -> Result<(), crate::store::StoreError> {
        let due = self.store.due_queued_runs(now_unix(), CLAIM_BATCH).await?;

        for run_id in due {
            let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
                error!("worker semaphore closed unexpectedly");
                return Ok(());
            };

            let executor = Arc::clone(&self.executor);
            active.push(tokio::spawn(async move {
                let _permit = permit;
                match executor.execute(&run_id).await {
                    Ok(outcome) => debug!("run {run_id} finished: {outcome:?}"),
                    Err(e) => warn!("run {run_id} execution error: {e}"),
                }
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_then_denies() {
        let limiter = PolitenessLimiter::new(1.0);
        assert_eq!(limiter.check("example.com"), RateDecision::Allow);
        assert!(matches!(
            limiter.check("example.com"),
            RateDecision::Deny { .. }
        ));
        // Other domains have their own buckets
        assert_eq!(limiter.check("other.com"), RateDecision::Allow);
    }

    #[test]
    fn zero_rate_disables_limiting() {
        let limiter = PolitenessLimiter::new(0.0);
        for _ in 0..100 {
            assert_eq!(limiter.check("example.com"), RateDecision::Allow);
        }
        assert_eq!(limiter.tracked_domains(), 0);
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = PolitenessLimiter::new(50.0);
        // Drain the bucket
        while limiter.check("example.com") == RateDecision::Allow {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.check("example.com"), RateDecision::Allow);
    }
}
