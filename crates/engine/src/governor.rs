//! Per-provider admission control with adaptive throttling.
//!
//! Each provider tag owns a permit pool initialized to a configured base
//! concurrency. `acquire` suspends only the calling step until a permit
//! frees up or the step's deadline elapses; steps targeting other providers
//! are unaffected. Observed outcomes feed back into the pool: throttle
//! signals shrink permitted concurrency multiplicatively (floored, with a
//! cooldown so bursts of 429s adjust once), sustained successes restore it
//! additively up to the base.
//!
//! `tokio::sync::Semaphore` cannot shrink its permit count safely while
//! permits are outstanding, so the pool is a mutex-guarded counter with
//! `Notify` wakeups; in-flight permits above a lowered limit simply drain.
//!
//! Distributed deployments can plug a [`RateWindowBackend`] so several
//! engine processes share one logical request ceiling per provider; the
//! default backend counts in-process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, warn};

use loom_types::StepFailure;

/// Outcome a step reports for one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOutcome {
    /// Call completed normally.
    Success,
    /// Provider signalled rate limiting; drives backoff.
    Throttled,
    /// Any other failure; resets the success streak without backoff.
    OtherError,
}

/// Tuning for the governor's adaptive behavior.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Base concurrency for provider tags without an explicit entry.
    pub base_concurrency: usize,
    /// Per-tag base concurrency overrides.
    pub provider_base: IndexMap<String, usize>,
    /// Floor permitted concurrency can never drop below.
    pub min_concurrency: usize,
    /// Multiplier applied to permitted concurrency on a throttle signal.
    pub backoff_factor: f64,
    /// Consecutive successes required before capacity is restored.
    pub recovery_threshold: u32,
    /// Permits restored per recovery, capped at the base.
    pub recovery_step: usize,
    /// Window after a backoff during which further throttle signals
    /// accumulate without re-adjusting.
    pub cooldown: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            base_concurrency: 4,
            provider_base: IndexMap::new(),
            min_concurrency: 1,
            backoff_factor: 0.5,
            recovery_threshold: 5,
            recovery_step: 1,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Shared request-rate accounting seam.
///
/// Backed in-process by [`LocalRateWindow`], or externally (a shared
/// counter keyed by provider tag and a fixed time window) so multiple
/// engine processes collectively respect one ceiling. Same interface,
/// same algorithm, either way.
pub trait RateWindowBackend: Send + Sync {
    /// Reserve one request slot in the current window; `false` when the
    /// window is exhausted (nothing is counted on denial).
    fn try_reserve_slot(&self, provider_tag: &str) -> bool;

    /// Fixed accounting window length in seconds.
    fn window_seconds(&self) -> u64;
}

/// Process-local sliding-window request counter.
#[derive(Debug)]
pub struct LocalRateWindow {
    requests_per_window: u64,
    window: Duration,
    counters: Mutex<HashMap<String, WindowCounter>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    started: Instant,
    count: u64,
}

impl LocalRateWindow {
    /// Allow `requests_per_window` calls per tag per `window_seconds`.
    pub fn new(requests_per_window: u64, window_seconds: u64) -> Self {
        Self {
            requests_per_window,
            window: Duration::from_secs(window_seconds),
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl RateWindowBackend for LocalRateWindow {
    fn try_reserve_slot(&self, provider_tag: &str) -> bool {
        let mut counters = self.counters.lock().expect("rate window lock");
        let now = Instant::now();
        let counter = counters
            .entry(provider_tag.to_string())
            .or_insert(WindowCounter { started: now, count: 0 });

        if now.duration_since(counter.started) >= self.window {
            counter.started = now;
            counter.count = 0;
        }
        if counter.count >= self.requests_per_window {
            return false;
        }
        counter.count += 1;
        true
    }

    fn window_seconds(&self) -> u64 {
        self.window.as_secs()
    }
}

/// Mutable pool state for one provider tag. Mutated only by the governor.
#[derive(Debug, Clone, Copy)]
struct PoolState {
    permitted: usize,
    base: usize,
    in_flight: usize,
    consecutive_successes: u32,
    throttle_count: u64,
    cooldown_until: Option<Instant>,
    last_adjusted: Option<Instant>,
}

/// Read-only view of a provider pool for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Currently permitted concurrency.
    pub permitted: usize,
    /// Configured base concurrency.
    pub base: usize,
    /// Permits currently held.
    pub in_flight: usize,
    /// Success streak since the last adjustment.
    pub consecutive_successes: u32,
    /// Total throttle signals observed, including during cooldown.
    pub throttle_count: u64,
    /// When permitted concurrency last changed, if ever.
    pub last_adjusted: Option<Instant>,
}

/// Direction of a limit adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitChangeKind {
    /// Capacity was reduced after a throttle signal.
    Throttled,
    /// Capacity was restored after sustained successes.
    Recovered,
}

/// Notification that a pool's permitted concurrency changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitChange {
    /// Provider tag whose pool adjusted.
    pub provider: String,
    /// Permitted concurrency after the adjustment.
    pub permitted: usize,
    /// Whether this was a backoff or a recovery.
    pub kind: LimitChangeKind,
}

/// Permit pools for all provider tags. Shared across concurrently
/// executing steps; internal synchronization only.
#[derive(Debug)]
pub struct ConcurrencyGovernor {
    config: GovernorConfig,
    pools: Mutex<HashMap<String, PoolState>>,
    notify: Notify,
    rate_backend: Option<Arc<dyn RateWindowBackend>>,
}

impl std::fmt::Debug for dyn RateWindowBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RateWindowBackend(window={}s)", self.window_seconds())
    }
}

impl ConcurrencyGovernor {
    /// Governor with in-process accounting only.
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            rate_backend: None,
        }
    }

    /// Attach a shared request-rate backend.
    pub fn with_rate_backend(mut self, backend: Arc<dyn RateWindowBackend>) -> Self {
        self.rate_backend = Some(backend);
        self
    }

    /// Acquire a permit for the provider pool, waiting up to `deadline`.
    ///
    /// Fails with [`StepFailure::Timeout`] when the deadline elapses before
    /// a permit (and, if configured, a rate-window slot) is available.
    pub async fn acquire(self: &Arc<Self>, provider_tag: &str, deadline: Duration) -> Result<GovernorPermit, StepFailure> {
        let waited = time::timeout(deadline, async {
            loop {
                let notified = self.notify.notified();
                if self.try_acquire(provider_tag) {
                    return;
                }
                // A released permit signals the notifier; rate-window
                // rollovers do not, so cap the wait and re-check.
                tokio::select! {
                    _ = notified => {}
                    _ = time::sleep(Duration::from_millis(50)) => {}
                }
            }
        })
        .await;

        match waited {
            Ok(()) => Ok(GovernorPermit {
                governor: Arc::clone(self),
                provider_tag: provider_tag.to_string(),
            }),
            Err(_) => {
                debug!(provider = provider_tag, ?deadline, "permit acquisition timed out");
                Err(StepFailure::Timeout)
            }
        }
    }

    fn try_acquire(&self, provider_tag: &str) -> bool {
        let mut pools = self.pools.lock().expect("governor lock");
        let pool = self.pool_entry(&mut pools, provider_tag);
        if pool.in_flight >= pool.permitted {
            return false;
        }
        if let Some(backend) = &self.rate_backend
            && !backend.try_reserve_slot(provider_tag)
        {
            return false;
        }
        pool.in_flight += 1;
        true
    }

    fn release(&self, provider_tag: &str) {
        let mut pools = self.pools.lock().expect("governor lock");
        if let Some(pool) = pools.get_mut(provider_tag) {
            pool.in_flight = pool.in_flight.saturating_sub(1);
        }
        drop(pools);
        self.notify.notify_waiters();
    }

    /// Feed an observed call outcome back into the pool.
    ///
    /// Returns the limit change, if this outcome adjusted capacity, so the
    /// caller can surface a throttle/recovery event.
    pub fn report_outcome(&self, provider_tag: &str, outcome: ProviderOutcome) -> Option<LimitChange> {
        let mut pools = self.pools.lock().expect("governor lock");
        let pool = self.pool_entry(&mut pools, provider_tag);

        match outcome {
            ProviderOutcome::Success => {
                pool.consecutive_successes += 1;
                if pool.consecutive_successes >= self.config.recovery_threshold {
                    pool.consecutive_successes = 0;
                    if pool.permitted < pool.base {
                        pool.permitted = (pool.permitted + self.config.recovery_step).min(pool.base);
                        pool.last_adjusted = Some(Instant::now());
                        let change = LimitChange {
                            provider: provider_tag.to_string(),
                            permitted: pool.permitted,
                            kind: LimitChangeKind::Recovered,
                        };
                        debug!(provider = provider_tag, permitted = pool.permitted, "provider pool recovered capacity");
                        drop(pools);
                        self.notify.notify_waiters();
                        return Some(change);
                    }
                }
                None
            }
            ProviderOutcome::Throttled => {
                pool.throttle_count += 1;
                pool.consecutive_successes = 0;
                let now = Instant::now();
                if pool.cooldown_until.is_some_and(|until| now < until) {
                    // Accumulate during cooldown without re-adjusting.
                    return None;
                }
                let reduced = ((pool.permitted as f64) * self.config.backoff_factor).floor() as usize;
                pool.permitted = reduced.max(self.config.min_concurrency);
                pool.cooldown_until = Some(now + self.config.cooldown);
                pool.last_adjusted = Some(now);
                warn!(
                    provider = provider_tag,
                    permitted = pool.permitted,
                    throttle_count = pool.throttle_count,
                    "provider throttled; backing off"
                );
                Some(LimitChange {
                    provider: provider_tag.to_string(),
                    permitted: pool.permitted,
                    kind: LimitChangeKind::Throttled,
                })
            }
            ProviderOutcome::OtherError => {
                pool.consecutive_successes = 0;
                None
            }
        }
    }

    /// Read-only view of a provider pool.
    pub fn snapshot(&self, provider_tag: &str) -> PoolSnapshot {
        let mut pools = self.pools.lock().expect("governor lock");
        let pool = self.pool_entry(&mut pools, provider_tag);
        PoolSnapshot {
            permitted: pool.permitted,
            base: pool.base,
            in_flight: pool.in_flight,
            consecutive_successes: pool.consecutive_successes,
            throttle_count: pool.throttle_count,
            last_adjusted: pool.last_adjusted,
        }
    }

    fn pool_entry<'a>(&self, pools: &'a mut HashMap<String, PoolState>, provider_tag: &str) -> &'a mut PoolState {
        pools.entry(provider_tag.to_string()).or_insert_with(|| {
            let base = self
                .config
                .provider_base
                .get(provider_tag)
                .copied()
                .unwrap_or(self.config.base_concurrency)
                .max(self.config.min_concurrency);
            PoolState {
                permitted: base,
                base,
                in_flight: 0,
                consecutive_successes: 0,
                throttle_count: 0,
                cooldown_until: None,
                last_adjusted: None,
            }
        })
    }
}

/// Held while a step's provider call is in flight; releasing (dropping)
/// wakes waiters on the pool.
pub struct GovernorPermit {
    governor: Arc<ConcurrencyGovernor>,
    provider_tag: String,
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        self.governor.release(&self.provider_tag);
    }
}
