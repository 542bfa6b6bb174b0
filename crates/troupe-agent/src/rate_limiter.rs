//! Per-model rate limiter gating every LLM call
//!
//! Each configured model gets its own bucket with three limits:
//!
//! - **Connections**: a semaphore caps in-flight calls
//! - **Tokens per minute**: a 60-second sliding window of reservations and
//!   recorded usage; a call only starts if its estimate fits the window
//! - **Daily budget**: cumulative spend per UTC day; once spent, every
//!   acquire fails with `DailyBudgetExceeded` until the day rolls over.
//!   A granted permit reserves the cost of its estimate, so concurrent
//!   callers cannot all pass the same budget check
//!
//! Every mutation of a bucket happens under that bucket's single lock.

use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use troupe_core::{ModelLimits, Result, TroupeError};

/// Length of the tokens-per-minute window
const WINDOW: Duration = Duration::from_secs(60);

/// How often the background sweeper prunes windows and wakes waiters
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time usage of one model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelUsage {
    pub model: String,
    pub window_tokens: u64,
    pub max_tpm: u64,
    pub spent_usd: f64,
    /// Estimated cost held by permits that have not recorded usage yet
    pub reserved_usd: f64,
    pub daily_budget_usd: f64,
    pub in_flight: usize,
    pub max_connections: usize,
}

struct UsageWindow {
    entries: VecDeque<(Instant, u64)>,
    window_tokens: u64,
    day: NaiveDate,
    spent_usd: f64,
    reserved_usd: f64,
}

impl UsageWindow {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            window_tokens: 0,
            day: Utc::now().date_naive(),
            spent_usd: 0.0,
            reserved_usd: 0.0,
        }
    }

    fn prune(&mut self, now: Instant) -> bool {
        let before = self.window_tokens;
        while let Some(&(at, tokens)) = self.entries.front() {
            if at + WINDOW > now {
                break;
            }
            self.entries.pop_front();
            self.window_tokens -= tokens;
        }
        self.window_tokens != before
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.day {
            info!("New UTC day {}, resetting spend of ${:.4}", today, self.spent_usd);
            self.day = today;
            self.spent_usd = 0.0;
        }
    }

    fn push(&mut self, now: Instant, tokens: u64) {
        if tokens > 0 {
            self.entries.push_back((now, tokens));
            self.window_tokens += tokens;
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.entries.front().map(|&(at, _)| at + WINDOW)
    }

    fn release(&mut self, reserved_usd: f64) {
        self.reserved_usd = (self.reserved_usd - reserved_usd).max(0.0);
    }
}

struct ModelBucket {
    limits: ModelLimits,
    connections: Arc<Semaphore>,
    usage: Mutex<UsageWindow>,
    freed: Notify,
}

impl ModelBucket {
    fn new(limits: ModelLimits) -> Self {
        Self {
            connections: Arc::new(Semaphore::new(limits.max_connections)),
            limits,
            usage: Mutex::new(UsageWindow::new()),
            freed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UsageWindow> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_budget(&self, usage: &UsageWindow, estimated_tokens: u64) -> Result<()> {
        let budget = self.limits.daily_budget_usd;
        let committed = usage.spent_usd + usage.reserved_usd;
        let projected = committed + self.limits.cost_of(estimated_tokens);
        if committed >= budget || projected > budget {
            return Err(TroupeError::DailyBudgetExceeded {
                model: self.limits.name.clone(),
                spent: usage.spent_usd,
                budget,
            });
        }
        Ok(())
    }

    fn record(&self, window_tokens: u64, billed_tokens: u64, released_usd: f64) {
        let mut usage = self.lock();
        usage.roll_day(Utc::now().date_naive());
        usage.push(Instant::now(), window_tokens);
        usage.release(released_usd);
        usage.spent_usd += self.limits.cost_of(billed_tokens);
        debug!(
            "{}: recorded {} tokens (window {} / {}, spent ${:.4}, reserved ${:.4})",
            self.limits.name,
            billed_tokens,
            usage.window_tokens,
            self.limits.max_tpm,
            usage.spent_usd,
            usage.reserved_usd
        );
    }

    fn snapshot(&self) -> ModelUsage {
        let mut usage = self.lock();
        usage.prune(Instant::now());
        usage.roll_day(Utc::now().date_naive());
        ModelUsage {
            model: self.limits.name.clone(),
            window_tokens: usage.window_tokens,
            max_tpm: self.limits.max_tpm,
            spent_usd: usage.spent_usd,
            reserved_usd: usage.reserved_usd,
            daily_budget_usd: self.limits.daily_budget_usd,
            in_flight: self.limits.max_connections - self.connections.available_permits(),
            max_connections: self.limits.max_connections,
        }
    }
}

/// Connection slot plus token and spend reservation for one LLM call
///
/// Dropping the permit frees the connection slot and any spend reservation
/// that was never settled by [`RatePermit::record_usage`]. The token
/// reservation stays in the window until it ages out, so an over-estimate
/// is never refunded early.
pub struct RatePermit {
    bucket: Arc<ModelBucket>,
    reserved: u64,
    reserved_usd: f64,
    settled: AtomicBool,
    _connection: OwnedSemaphorePermit,
}

impl RatePermit {
    pub fn model(&self) -> &str {
        &self.bucket.limits.name
    }

    pub fn reserved_tokens(&self) -> u64 {
        self.reserved
    }

    /// Record actual usage for this call
    ///
    /// Tokens beyond the reservation are added to the window; the full
    /// amount is billed against the daily budget and replaces the spend
    /// reserved at acquire time.
    pub fn record_usage(&self, tokens: u64) {
        let released = if self.settled.swap(true, Ordering::AcqRel) {
            0.0
        } else {
            self.reserved_usd
        };
        self.bucket
            .record(tokens.saturating_sub(self.reserved), tokens, released);
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.bucket.lock().release(self.reserved_usd);
        }
    }
}

impl std::fmt::Debug for RatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatePermit")
            .field("model", &self.bucket.limits.name)
            .field("reserved", &self.reserved)
            .finish()
    }
}

/// Shared per-model gate consulted before every LLM call
pub struct RateLimiter {
    buckets: HashMap<String, Arc<ModelBucket>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter for the given models
    ///
    /// When called inside a Tokio runtime a background sweeper is started;
    /// stop it with [`RateLimiter::close`].
    pub fn new(models: Vec<ModelLimits>) -> Self {
        let buckets: HashMap<String, Arc<ModelBucket>> = models
            .into_iter()
            .map(|limits| (limits.name.clone(), Arc::new(ModelBucket::new(limits))))
            .collect();
        let shutdown = CancellationToken::new();

        let sweeper = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let buckets: Vec<Arc<ModelBucket>> = buckets.values().cloned().collect();
            let shutdown = shutdown.clone();
            handle.spawn(sweep(buckets, shutdown))
        });

        Self {
            buckets,
            closed: AtomicBool::new(false),
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    fn bucket(&self, model: &str) -> Result<&Arc<ModelBucket>> {
        self.buckets
            .get(model)
            .ok_or_else(|| TroupeError::UnknownModel(model.to_string()))
    }

    /// Wait for a connection slot and token headroom for `model`
    ///
    /// Fails fast with `DailyBudgetExceeded` when the day's budget cannot
    /// cover the estimate. Cancellation releases anything already taken.
    pub async fn acquire(
        &self,
        model: &str,
        estimated_tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<RatePermit> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TroupeError::LimiterClosed);
        }
        let bucket = Arc::clone(self.bucket(model)?);
        let limits = &bucket.limits;

        if estimated_tokens > limits.max_tpm {
            return Err(TroupeError::TokenLimitExceeded {
                model: limits.name.clone(),
                requested: estimated_tokens,
                max_tpm: limits.max_tpm,
            });
        }

        {
            let mut usage = bucket.lock();
            usage.roll_day(Utc::now().date_naive());
            bucket.check_budget(&usage, estimated_tokens)?;
        }

        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TroupeError::Canceled),
            _ = self.shutdown.cancelled() => return Err(TroupeError::LimiterClosed),
            permit = Arc::clone(&bucket.connections).acquire_owned() => {
                permit.map_err(|_| TroupeError::LimiterClosed)?
            }
        };

        let reserved_usd = limits.cost_of(estimated_tokens);
        loop {
            let wait_until = {
                let now = Instant::now();
                let mut usage = bucket.lock();
                usage.roll_day(Utc::now().date_naive());
                bucket.check_budget(&usage, estimated_tokens)?;
                usage.prune(now);

                if usage.window_tokens + estimated_tokens <= limits.max_tpm {
                    usage.push(now, estimated_tokens);
                    usage.reserved_usd += reserved_usd;
                    debug!(
                        "{}: acquired slot, reserved {} tokens and ${:.4} (window {} / {})",
                        limits.name,
                        estimated_tokens,
                        reserved_usd,
                        usage.window_tokens,
                        limits.max_tpm
                    );
                    break;
                }
                usage.next_expiry().unwrap_or(now + SWEEP_INTERVAL)
            };

            debug!("{}: waiting for TPM headroom", limits.name);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TroupeError::Canceled),
                _ = self.shutdown.cancelled() => return Err(TroupeError::LimiterClosed),
                _ = bucket.freed.notified() => {}
                _ = tokio::time::sleep_until(wait_until) => {}
            }
        }

        Ok(RatePermit {
            reserved: estimated_tokens,
            reserved_usd,
            settled: AtomicBool::new(false),
            bucket,
            _connection: connection,
        })
    }

    /// Record usage that did not go through a permit
    pub fn record_usage(&self, model: &str, tokens: u64) -> Result<()> {
        self.bucket(model)?.record(tokens, tokens, 0.0);
        Ok(())
    }

    /// Current usage of `model`
    pub fn usage(&self, model: &str) -> Result<ModelUsage> {
        Ok(self.bucket(model)?.snapshot())
    }

    /// Names of all configured models
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the background sweeper and reject further acquires; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        info!("Rate limiter closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn force_day(&self, model: &str, day: NaiveDate) {
        if let Ok(bucket) = self.bucket(model) {
            bucket.lock().day = day;
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sweep(buckets: Vec<Arc<ModelBucket>>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let today = Utc::now().date_naive();
        for bucket in &buckets {
            let freed = {
                let mut usage = bucket.lock();
                usage.roll_day(today);
                usage.prune(now)
            };
            if freed {
                bucket.freed.notify_waiters();
            }
        }
    }
    debug!("Rate limiter sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limits: ModelLimits) -> RateLimiter {
        RateLimiter::new(vec![limits])
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_budget_allows_exactly_n_calls() {
        // $1.00 budget at $0.25 per 1k tokens: four 1k-token calls fit
        let limiter = limiter(ModelLimits::new("sonnet", 1_000_000, 1.0, 2).with_price(0.25));
        let cancel = CancellationToken::new();

        for _ in 0..4 {
            let permit = limiter.acquire("sonnet", 1000, &cancel).await.unwrap();
            permit.record_usage(1000);
        }

        let fifth = limiter.acquire("sonnet", 1000, &cancel).await;
        assert!(matches!(fifth, Err(TroupeError::DailyBudgetExceeded { .. })));
        assert_eq!(limiter.usage("sonnet").unwrap().spent_usd, 1.0);
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_permits_cannot_overspend() {
        // Eight connections, but only four 1k-token reservations fit in $1.00
        let limiter = limiter(ModelLimits::new("sonnet", 1_000_000, 1.0, 8).with_price(0.25));
        let cancel = CancellationToken::new();

        let mut permits = Vec::new();
        let mut rejected = 0;
        for _ in 0..8 {
            match limiter.acquire("sonnet", 1000, &cancel).await {
                Ok(permit) => permits.push(permit),
                Err(TroupeError::DailyBudgetExceeded { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(permits.len(), 4);
        assert_eq!(rejected, 4);
        assert_eq!(limiter.usage("sonnet").unwrap().reserved_usd, 1.0);

        for permit in &permits {
            permit.record_usage(1000);
        }
        let usage = limiter.usage("sonnet").unwrap();
        assert_eq!(usage.spent_usd, 1.0);
        assert_eq!(usage.reserved_usd, 0.0);
        assert!(usage.spent_usd <= usage.daily_budget_usd);
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_releases_reservation() {
        let limiter = limiter(ModelLimits::new("sonnet", 1_000_000, 0.5, 4).with_price(0.25));
        let cancel = CancellationToken::new();

        let first = limiter.acquire("sonnet", 1000, &cancel).await.unwrap();
        let second = limiter.acquire("sonnet", 1000, &cancel).await.unwrap();
        assert!(limiter.acquire("sonnet", 1000, &cancel).await.is_err());

        // A call that never reports usage gives its reservation back
        drop(first);
        assert_eq!(limiter.usage("sonnet").unwrap().reserved_usd, 0.25);
        let third = limiter.acquire("sonnet", 1000, &cancel).await.unwrap();

        // Settled permits do not release twice
        second.record_usage(1000);
        drop(second);
        let usage = limiter.usage("sonnet").unwrap();
        assert_eq!(usage.spent_usd, 0.25);
        assert_eq!(usage.reserved_usd, 0.25);
        drop(third);
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_resets_on_new_day() {
        let limiter = limiter(ModelLimits::new("sonnet", 1_000_000, 0.5, 1).with_price(0.5));
        let cancel = CancellationToken::new();

        limiter.record_usage("sonnet", 1000).unwrap();
        assert!(limiter.acquire("sonnet", 10, &cancel).await.is_err());

        let yesterday = Utc::now().date_naive().pred_opt().unwrap();
        limiter.force_day("sonnet", yesterday);
        assert!(limiter.acquire("sonnet", 10, &cancel).await.is_ok());
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_cap_blocks_until_release() {
        let limiter = Arc::new(limiter(ModelLimits::new("opus", 1_000_000, 100.0, 1)));
        let cancel = CancellationToken::new();

        let first = limiter.acquire("opus", 10, &cancel).await.unwrap();
        assert_eq!(limiter.usage("opus").unwrap().in_flight, 1);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("opus", 10, &cancel).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap().unwrap();
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_releases_nothing() {
        let limiter = Arc::new(limiter(ModelLimits::new("opus", 1_000_000, 100.0, 1)));
        let held = limiter.acquire("opus", 10, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("opus", 10, &cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(TroupeError::Canceled)));
        drop(held);
        assert_eq!(limiter.usage("opus").unwrap().in_flight, 0);
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tpm_window_refills_after_sixty_seconds() {
        let limiter = Arc::new(limiter(ModelLimits::new("haiku", 1000, 100.0, 4)));
        let cancel = CancellationToken::new();

        let started = Instant::now();
        drop(limiter.acquire("haiku", 800, &cancel).await.unwrap());

        // 800 + 400 exceeds 1000 until the first reservation ages out
        drop(limiter.acquire("haiku", 400, &cancel).await.unwrap());
        assert!(started.elapsed() >= WINDOW);
        limiter.close();
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let limiter = limiter(ModelLimits::new("haiku", 1000, 100.0, 1));
        let result = limiter.acquire("haiku", 1001, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TroupeError::TokenLimitExceeded { .. })));
        limiter.close();
    }

    #[tokio::test]
    async fn test_unknown_model_and_close() {
        let limiter = limiter(ModelLimits::new("haiku", 1000, 100.0, 1));
        let cancel = CancellationToken::new();

        assert!(matches!(
            limiter.acquire("gpt", 1, &cancel).await,
            Err(TroupeError::UnknownModel(_))
        ));

        limiter.close();
        limiter.close();
        assert!(limiter.is_closed());
        assert!(matches!(
            limiter.acquire("haiku", 1, &cancel).await,
            Err(TroupeError::LimiterClosed)
        ));
    }

    #[test]
    fn test_new_outside_runtime_has_no_sweeper() {
        let limiter = limiter(ModelLimits::new("haiku", 1000, 100.0, 1));
        assert!(limiter.sweeper.lock().unwrap().is_none());
        limiter.close();
    }
}
