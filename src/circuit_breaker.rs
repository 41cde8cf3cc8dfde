//! Per-path circuit breakers guarding outbound calls.
//!
//! Hystrix-style breaker with three states:
//! - **Closed**: calls flow through
//! - **Open**: too many failures, calls take the fallback
//! - **HalfOpen**: after the open interval, probe calls decide whether to close

use crate::rule::CircuitBreakerPolicy;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u64,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub open_interval: Duration,
    /// Number of successful requests in HalfOpen before closing
    pub success_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_interval: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl From<&CircuitBreakerPolicy> for CircuitBreakerConfig {
    fn from(policy: &CircuitBreakerPolicy) -> Self {
        Self {
            failure_threshold: policy.failure_threshold.max(1),
            open_interval: Duration::from_millis(policy.open_ms),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    last_failure: Option<Instant>,
}

/// Circuit breaker for one guarded path.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    config: CircuitBreakerConfig,
    total_requests: AtomicUsize,
    total_failures: AtomicUsize,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: State::Closed,
                last_failure: None,
            }),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            config,
            total_requests: AtomicUsize::new(0),
            total_failures: AtomicUsize::new(0),
        }
    }

    /// Whether a call may go through. Moves Open to HalfOpen once the open
    /// interval has elapsed.
    pub fn allow_request(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let inner = self.inner.upgradable_read();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let expired = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.open_interval)
                    .unwrap_or(false);
                if expired {
                    let mut inner = parking_lot::RwLockUpgradableReadGuard::upgrade(inner);
                    inner.state = State::HalfOpen;
                    self.success_count.store(0, Ordering::Relaxed);
                    debug!("circuit half-open");
                }
                expired
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let state = self.inner.read().state;
        match state {
            State::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.success_threshold {
                    self.inner.write().state = State::Closed;
                    self.failure_count.store(0, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                    info!("circuit closed");
                }
            }
            State::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            State::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write();
        match inner.state {
            State::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold {
                    inner.state = State::Open;
                    inner.last_failure = Some(Instant::now());
                    info!(failures, "circuit opened");
                }
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.last_failure = Some(Instant::now());
                self.failure_count.store(0, Ordering::Relaxed);
                self.success_count.store(0, Ordering::Relaxed);
            }
            State::Open => {
                inner.last_failure = Some(Instant::now());
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.inner.read().state
    }

    /// Counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            current_failure_count: self.failure_count.load(Ordering::Relaxed),
            current_success_count: self.success_count.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub total_requests: usize,
    pub total_failures: usize,
    pub current_failure_count: u64,
    pub current_success_count: u64,
}

/// Breaker plus the bulkhead bounding concurrent guarded calls.
#[derive(Debug)]
pub struct GuardedPath {
    policy: CircuitBreakerPolicy,
    breaker: CircuitBreaker,
    permits: Arc<Semaphore>,
}

impl GuardedPath {
    fn new(policy: &CircuitBreakerPolicy) -> Self {
        Self {
            policy: policy.clone(),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::from(policy)),
            permits: Arc::new(Semaphore::new(policy.thread_core_size.max(1))),
        }
    }

    /// Policy the breaker and bulkhead were sized from.
    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    /// The breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Takes a bulkhead slot without waiting. `None` when saturated.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }
}

/// Breakers keyed by `uniqueId.path`, created on first use and rebuilt when
/// the rule's policy for that path changes.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    paths: DashMap<String, Arc<GuardedPath>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Breaker of `unique_id` and `policy.path`.
    pub fn get_or_create(&self, unique_id: &str, policy: &CircuitBreakerPolicy) -> Arc<GuardedPath> {
        let key = format!("{}.{}", unique_id, policy.path);
        if let Some(guarded) = self.paths.get(&key) {
            if guarded.policy == *policy {
                return Arc::clone(guarded.value());
            }
        }
        let mut guarded = self
            .paths
            .entry(key)
            .or_insert_with(|| Arc::new(GuardedPath::new(policy)));
        if guarded.policy != *policy {
            info!(
                key = %guarded.key(),
                failure_threshold = policy.failure_threshold,
                open_ms = policy.open_ms,
                thread_core_size = policy.thread_core_size,
                "circuit breaker policy changed, rebuilding"
            );
            *guarded = Arc::new(GuardedPath::new(policy));
        }
        Arc::clone(guarded.value())
    }

    /// Number of breakers created.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether no breaker was created yet.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
