//! Circuit breaker for backend calls.
//!
//! Stops calling a backend that keeps failing so requests move on to the next
//! backend in the chain instead of waiting on timeouts.
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                                │ cooldown elapsed
//!     │ probe ok                       ▼
//!     └──────────────────────────── HALF_OPEN ──probe failed──▶ OPEN
//! ```
//!
//! In `HALF_OPEN` exactly one call (the probe) is let through; concurrent
//! callers are rejected as if the circuit were still open.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use geosieve_error::{Result, SieveError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
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

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        let settings = BreakerSettings::default();
        Self {
            name: "unknown".to_string(),
            failure_threshold: settings.failure_threshold,
            cooldown: settings.cooldown(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(name: impl Into<String>, settings: &BreakerSettings) -> Self {
        Self {
            name: name.into(),
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: settings.cooldown(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    probe_in_flight: bool,
}

/// Point-in-time view of a breaker, for stats and logging.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub millis_since_last_failure: Option<u64>,
    pub millis_in_state: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission ticket for one call. A probe ticket that is dropped without an
/// outcome (the call was cancelled) frees the half-open slot again.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut inner = self.breaker.inner.lock();
            inner.probe_in_flight = false;
            debug!(
                target: "breaker",
                name = %self.breaker.config.name,
                "Half-open probe abandoned"
            );
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_state_change: Instant::now(),
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.config.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            millis_since_last_failure: inner
                .last_failure
                .map(|t| t.elapsed().as_millis() as u64),
            millis_in_state: inner.last_state_change.elapsed().as_millis() as u64,
        }
    }

    /// Run `operation` through the breaker, counting every error as a failure.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_classified(operation, |_| true).await
    }

    /// Run `operation` through the breaker. Errors for which `is_failure`
    /// returns false are passed through without counting against the backend.
    pub async fn call_classified<T, F, Fut, C>(&self, operation: F, is_failure: C) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&SieveError) -> bool,
    {
        let mut admission = self.admit()?;
        let outcome = operation().await;
        admission.settled = true;

        match &outcome {
            Ok(_) => self.record_success(),
            Err(e) if e.is_cancelled() => self.release_probe(admission.probe),
            Err(e) if is_failure(e) => self.record_failure(),
            Err(_) => self.record_success(),
        }
        outcome
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let mut inner = self.inner.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if inner.last_state_change.elapsed() < self.config.cooldown {
                    return Err(SieveError::circuit_open(&self.config.name));
                }
                self.transition_to(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(SieveError::circuit_open(&self.config.name));
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Ok(Admission {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            self.transition_to(&mut inner, CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.transition_to(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn release_probe(&self, probe: bool) {
        if probe {
            self.inner.lock().probe_in_flight = false;
        }
    }

    fn transition_to(&self, inner: &mut BreakerState, new_state: CircuitState) {
        if inner.state == new_state {
            return;
        }
        warn!(
            target: "breaker",
            name = %self.config.name,
            from = %inner.state,
            to = %new_state,
            failures = inner.consecutive_failures,
            "Circuit breaker state transition"
        );
        inner.state = new_state;
        inner.last_state_change = Instant::now();
    }
}

/// Shares one breaker per backend kind across all call sites.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
                    name,
                    &self.settings,
                )))
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock();
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
