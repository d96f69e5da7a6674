//! Circuit breaker around fallible async calls.
//!
//! Transitions: closed -> open once failures inside the rolling
//! monitoring window reach the threshold; open -> half-open after the
//! recovery timeout; half-open -> closed after enough consecutive
//! successes, or straight back to open on any failure.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker is open; the call was not attempted.
    #[error("circuit '{0}' is open")]
    Open(String),

    /// The wrapped operation exceeded the configured timeout. Counts as
    /// a failure.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The wrapped operation itself failed.
    #[error(transparent)]
    Inner(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures inside the monitoring window that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: u32,
    /// How long an open breaker waits before probing.
    pub recovery_timeout: Duration,
    /// Rolling window over which failures are counted.
    pub monitoring_window: Duration,
    /// Per-call deadline; exceeding it cancels the call and counts as a
    /// failure.
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}

/// State-change event published on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub breaker: String,
    pub from: BreakerState,
    pub to: BreakerState,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BreakerCounters {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub opened: u64,
    pub half_opened: u64,
    pub closed: u64,
}

struct BreakerInner {
    state: BreakerState,
    window: VecDeque<Instant>,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: broadcast::Sender<BreakerTransition>,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    opened: AtomicU64,
    half_opened: AtomicU64,
    closed: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                half_open_successes: 0,
                opened_at: None,
            }),
            events,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            opened: AtomicU64::new(0),
            half_opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    /// Run `op` through the gate.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.admit() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(BreakerError::Open(self.name.clone()));
        }

        match tokio::time::timeout(self.config.timeout, op()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(error)) => {
                self.on_failure(false);
                Err(BreakerError::Inner(error))
            }
            Err(_) => {
                self.on_failure(true);
                Err(BreakerError::Timeout(self.config.timeout))
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn counters(&self) -> BreakerCounters {
        BreakerCounters {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            half_opened: self.half_opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    /// Gate check. Flips open -> half-open once the recovery timeout has
    /// elapsed.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.window.clear();
                    inner.opened_at = None;
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Closed => {
                self.prune_window(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self, timed_out: bool) {
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed => {
                inner.window.push_back(Instant::now());
                self.prune_window(&mut inner);
                if inner.window.len() as u32 >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn prune_window(&self, inner: &mut BreakerInner) {
        let Some(cutoff) = Instant::now().checked_sub(self.config.monitoring_window) else {
            return;
        };
        while inner.window.front().is_some_and(|t| *t < cutoff) {
            inner.window.pop_front();
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => {
                self.opened.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = %self.name, ?from, "circuit opened");
            }
            BreakerState::HalfOpen => {
                self.half_opened.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, "circuit half-open, probing");
            }
            BreakerState::Closed => {
                self.closed.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, "circuit closed");
            }
        }
        let _ = self.events.send(BreakerTransition {
            breaker: self.name.clone(),
            from,
            to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
            monitoring_window: Duration::from_secs(10),
            timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(anyhow!("boom")) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let result = breaker.execute(|| async { Ok(1u32) }).await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert_eq!(breaker.counters().rejected, 1);
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(anyhow!("boom")) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.execute(|| async { Ok(()) }).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.execute(|| async { Ok(()) }).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(anyhow!("boom")) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = breaker
            .execute(|| async { Err::<(), _>(anyhow!("still broken")) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("test", quick_config());
        let result = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert_eq!(breaker.counters().timeouts, 1);
    }

    #[tokio::test]
    async fn emits_transition_events() {
        let breaker = CircuitBreaker::new("test", quick_config());
        let mut events = breaker.subscribe();
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(anyhow!("boom")) })
                .await;
        }
        let event = events.recv().await.unwrap();
        assert_eq!(event.to, BreakerState::Open);
    }
}
