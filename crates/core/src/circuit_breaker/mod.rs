//! C4 — Circuit Breaker. Three-state failure isolation, one instance per
//! string key: Closed/Open/HalfOpen with a failure-count window and a
//! cooldown, wrapped in a keyed registry so the Connection Pool and tool
//! invocation path can share one breaker set.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit open for {key}")]
    Open { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub fail_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

struct Breaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl Breaker {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_probe_in_flight: false,
            }),
        }
    }

    fn current_state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.settings.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probe_in_flight = false;
                }
            }
        }
        inner.state
    }

    /// Returns `Err` immediately if the breaker will not admit a call right
    /// now; otherwise reserves the call slot (a HalfOpen admission reserves
    /// the single allowed probe).
    fn try_admit(&self, key: &str) -> Result<(), BreakerError> {
        match self.current_state() {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(BreakerError::Open { key: key.to_string() }),
            BreakerState::HalfOpen => {
                let mut inner = self.inner.lock();
                if inner.half_open_probe_in_flight {
                    Err(BreakerError::Open { key: key.to_string() })
                } else {
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.half_open_probe_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            inner.half_open_probe_in_flight = false;
            return;
        }
        inner.failures.push_back(now);
        let window = self.settings.window;
        while let Some(front) = inner.failures.front() {
            if now.duration_since(*front) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
        if inner.failures.len() as u32 >= self.settings.fail_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            inner.failures.clear();
        }
    }
}

/// Keyed registry of breakers, one per logical dependency (e.g. a vector
/// store backend, a tool handler class).
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: Arc<DashMap<String, Arc<Breaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self { settings, breakers: Arc::new(DashMap::new()) }
    }

    fn breaker_for(&self, key: &str) -> Arc<Breaker> {
        if let Some(b) = self.breakers.get(key) {
            return b.clone();
        }
        let b = Arc::new(Breaker::new(self.settings));
        self.breakers.entry(key.to_string()).or_insert(b).clone()
    }

    pub fn state(&self, key: &str) -> BreakerState {
        self.breaker_for(key).current_state()
    }

    /// Runs `f` through the breaker identified by `key`: fails fast with
    /// `BreakerError::Open` if the breaker is not admitting calls, otherwise
    /// runs `f` and feeds its success/failure back into the state machine.
    pub async fn call<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, CallOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker_for(key);
        breaker.try_admit(key).map_err(CallOutcome::Open)?;
        match f().await {
            Ok(v) => {
                breaker.record_success();
                Ok(v)
            }
            Err(e) => {
                breaker.record_failure();
                Err(CallOutcome::Inner(e))
            }
        }
    }
}

#[derive(Debug)]
pub enum CallOutcome<E> {
    Open(BreakerError),
    Inner(E),
}
