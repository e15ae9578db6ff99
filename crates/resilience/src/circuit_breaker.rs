//! Circuit breaker guarding calls to volatile dependencies.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────► Open
//!     ▲                                │ cooldown elapsed
//!     │ probe succeeds                 ▼
//!     └───────────────────────────── HalfOpen ── probe fails ──► Open
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::BreakerError;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed.
    pub reset_timeout: Duration,
    /// Budget of a single call; exceeding it counts as a failure.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of a breaker, for health surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Milliseconds since the last recorded failure.
    pub last_failure_ms_ago: Option<u64>,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    rejected_calls: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
                rejected_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `operation` through the breaker.
    ///
    /// While open the operation is not invoked. While half-open exactly one
    /// probe runs; concurrent calls are rejected until it settles. A probe
    /// that is cancelled counts as failed.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = self.acquire().ok_or_else(|| BreakerError::Open {
            name: self.name.clone(),
        })?;
        let mut guard = CallGuard {
            breaker: self,
            probe,
            settled: false,
        };

        let result = tokio::time::timeout(self.config.call_timeout, operation()).await;
        match result {
            Ok(Ok(value)) => {
                guard.settle(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                guard.settle(false);
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                guard.settle(false);
                tracing::warn!(
                    circuit = %self.name,
                    timeout_ms = self.config.call_timeout.as_millis() as u64,
                    "guarded call timed out"
                );
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.config.call_timeout,
                })
            }
        }
    }

    /// Closes the circuit and clears the failure counter.
    pub fn reset(&self) {
        let mut s = self.lock();
        s.consecutive_failures = 0;
        s.probe_in_flight = false;
        self.transition(&mut s, CircuitState::Closed);
        tracing::info!(circuit = %self.name, "circuit reset");
    }

    /// Opens the circuit now, starting a fresh cooldown.
    pub fn force_open(&self) {
        let mut s = self.lock();
        s.last_failure = Some(Instant::now());
        self.transition(&mut s, CircuitState::Open);
        tracing::warn!(circuit = %self.name, "circuit force-opened");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            last_failure_ms_ago: s.last_failure.map(|t| t.elapsed().as_millis() as u64),
            rejected_calls: s.rejected_calls,
        }
    }

    /// Admits a call. Returns `Some(true)` for a half-open probe,
    /// `Some(false)` for a normal call and `None` when rejected.
    fn acquire(&self) -> Option<bool> {
        let mut s = self.lock();
        let admitted = match s.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let cooled = s
                    .last_failure
                    .is_none_or(|t| t.elapsed() > self.config.reset_timeout);
                if cooled {
                    s.probe_in_flight = true;
                    self.transition(&mut s, CircuitState::HalfOpen);
                    tracing::info!(circuit = %self.name, "cooldown elapsed, probing");
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen if s.probe_in_flight => None,
            CircuitState::HalfOpen => {
                s.probe_in_flight = true;
                Some(true)
            }
        };

        if admitted.is_none() {
            s.rejected_calls += 1;
            metrics::counter!("circuit_breaker_rejections_total", "breaker" => self.name.clone())
                .increment(1);
            tracing::debug!(circuit = %self.name, state = %s.state, "call rejected");
        }
        admitted
    }

    fn on_success(&self, probe: bool) {
        let mut s = self.lock();
        if probe {
            s.probe_in_flight = false;
            s.consecutive_failures = 0;
            self.transition(&mut s, CircuitState::Closed);
            tracing::info!(circuit = %self.name, "probe succeeded, circuit closed");
        } else if s.state == CircuitState::Closed {
            s.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut s = self.lock();
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.last_failure = Some(Instant::now());

        if probe {
            s.probe_in_flight = false;
            self.transition(&mut s, CircuitState::Open);
            tracing::warn!(circuit = %self.name, "probe failed, circuit reopened");
        } else if s.state == CircuitState::Closed
            && s.consecutive_failures >= self.config.failure_threshold
        {
            self.transition(&mut s, CircuitState::Open);
            tracing::error!(
                circuit = %self.name,
                failures = s.consecutive_failures,
                "failure threshold reached, circuit opened"
            );
        }
    }

    fn transition(&self, s: &mut BreakerState, to: CircuitState) {
        s.state = to;
        metrics::gauge!("circuit_breaker_state", "breaker" => self.name.clone())
            .set(to.gauge_value());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Records the call's result, or a failed probe if the call is dropped.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.probe);
        } else {
            self.breaker.on_failure(self.probe);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_failure(true);
        }
    }
}

/// Named breakers owned by a service.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::default(),
            default_config,
        }
    }

    /// Returns the breaker for `name`, creating it with the default config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Returns the breaker for `name`, creating it with `config`. An
    /// existing breaker keeps its original config.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_config(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshots every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
