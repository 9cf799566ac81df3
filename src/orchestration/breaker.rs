//! Per-operation-class circuit breakers.
//!
//! Classic three-state breaker: Closed (normal operation), Open (failing
//! fast), HalfOpen (probing recovery). Each operation class gets its own
//! breaker so a flaky integration cannot poison unrelated classes. State
//! lives in an `AtomicU8` for lock-free reads; counters sit behind a tokio
//! mutex because they are only touched around actual calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::{rlog, rlog_debug, rlog_warn};

/// Operational mode of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed = 0,
    /// Failing fast, calls are rejected without executing
    Open = 1,
    /// Probing recovery, a limited number of calls pass through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed before tripping to Open.
    pub failure_threshold: u32,
    /// How long Open lasts before the first recovery probe is allowed.
    pub timeout: Duration,
    /// Consecutive probe successes in HalfOpen before closing again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerCounters {
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// How a call was admitted through the breaker.
enum Admission {
    /// Breaker closed, call passes through normally.
    Normal,
    /// Half-open recovery probe, holding one of the bounded slots.
    Probe,
    /// Breaker open, call must not execute.
    Rejected,
}

/// RAII hold on a half-open probe slot; released on drop so a call
/// future dropped mid-flight cannot leak the slot.
struct ProbeSlot<'a>(&'a CircuitBreaker);

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .half_open_inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

/// Circuit breaker for one operation class.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Operation class this breaker guards.
    class: String,
    /// Current state, readable without locking.
    state: AtomicU8,
    /// Probes admitted but not yet resolved, capped at success_threshold.
    half_open_inflight: AtomicU32,
    config: BreakerConfig,
    counters: Mutex<BreakerCounters>,
}

impl CircuitBreaker {
    pub fn new(class: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            class: class.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            half_open_inflight: AtomicU32::new(0),
            config,
            counters: Mutex::new(BreakerCounters::default()),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Operation class this breaker guards.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Run an operation under breaker protection.
    ///
    /// If the breaker is Open and its timeout has not elapsed the operation
    /// is never executed and `Error::CircuitOpen` is returned immediately.
    /// In HalfOpen at most success_threshold probes are admitted at once;
    /// excess calls are rejected the same way. Otherwise the operation runs
    /// and its outcome feeds the breaker's failure and success accounting.
    /// A cancelled operation counts as neither success nor failure.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _slot = match self.admit().await {
            Admission::Rejected => {
                rlog_debug!("CircuitBreaker[{}] rejecting call while open", self.class);
                return Err(Error::CircuitOpen {
                    class: self.class.clone(),
                });
            }
            Admission::Normal => None,
            Admission::Probe => Some(ProbeSlot(self)),
        };

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success().await,
            // A cancelled run says nothing about the class's health
            Err(Error::Cancelled) => {}
            Err(_) => self.record_failure().await,
        }
        result
    }

    async fn admit(&self) -> Admission {
        match self.state() {
            CircuitState::Closed => Admission::Normal,
            CircuitState::HalfOpen => self.try_claim_probe(),
            CircuitState::Open => {
                let counters = self.counters.lock().await;
                match counters.opened_at {
                    Some(opened) if opened.elapsed() >= self.config.timeout => {
                        drop(counters);
                        self.transition_to_half_open().await;
                        self.try_claim_probe()
                    }
                    Some(_) => Admission::Rejected,
                    None => {
                        // Open without a timestamp; allow the call rather
                        // than wedging the class forever.
                        rlog_warn!(
                            "CircuitBreaker[{}] open with no timestamp",
                            self.class
                        );
                        Admission::Normal
                    }
                }
            }
        }
    }

    fn try_claim_probe(&self) -> Admission {
        let claimed = self
            .half_open_inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v < self.config.success_threshold {
                    Some(v + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if claimed {
            Admission::Probe
        } else {
            Admission::Rejected
        }
    }

    async fn record_success(&self) {
        let mut counters = self.counters.lock().await;
        match self.state() {
            CircuitState::Closed => {
                counters.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                counters.half_open_successes += 1;
                if counters.half_open_successes >= self.config.success_threshold {
                    drop(counters);
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut counters = self.counters.lock().await;
        match self.state() {
            CircuitState::Closed => {
                counters.consecutive_failures += 1;
                if counters.consecutive_failures >= self.config.failure_threshold {
                    drop(counters);
                    self.transition_to_open().await;
                }
            }
            // Any probe failure reopens immediately
            CircuitState::HalfOpen => {
                drop(counters);
                self.transition_to_open().await;
            }
            CircuitState::Open => {}
        }
    }

    async fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        let mut counters = self.counters.lock().await;
        counters.opened_at = Some(Instant::now());
        counters.half_open_successes = 0;
        rlog_warn!(
            "CircuitBreaker[{}] opened after {} consecutive failures",
            self.class,
            counters.consecutive_failures
        );
    }

    async fn transition_to_half_open(&self) {
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);
        self.half_open_inflight.store(0, Ordering::Release);
        let mut counters = self.counters.lock().await;
        counters.half_open_successes = 0;
        rlog!("CircuitBreaker[{}] half-open, probing recovery", self.class);
    }

    async fn transition_to_closed(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        let mut counters = self.counters.lock().await;
        counters.consecutive_failures = 0;
        counters.half_open_successes = 0;
        counters.opened_at = None;
        rlog!("CircuitBreaker[{}] closed, recovered", self.class);
    }
}

/// Lazily-populated map of operation class to breaker.
///
/// All breakers share one configuration. The outer lock only guards map
/// structure; each breaker carries its own synchronization, so concurrent
/// calls on different classes never contend.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for a class, creating it on first use.
    pub fn breaker_for(&self, class: &str) -> Arc<CircuitBreaker> {
        if let Ok(map) = self.breakers.read() {
            if let Some(breaker) = map.get(class) {
                return Arc::clone(breaker);
            }
        }

        let mut map = match self.breakers.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            map.entry(class.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(class, self.config))),
        )
    }

    /// Current state of a class's breaker, if one exists yet.
    pub fn state_of(&self, class: &str) -> Option<CircuitState> {
        self.breakers
            .read()
            .ok()
            .and_then(|map| map.get(class).map(|b| b.state()))
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
