//! Three-state circuit breaker.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{BreakerError, CircuitOpenError, OpenReason};

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` before tripping.
    pub max_failures: u32,
    /// Cooldown measured from the last failure.
    pub open_timeout: Duration,
    /// Concurrent trial calls allowed while `HalfOpen`.
    pub half_open_max_probes: u32,
    /// Successful probes needed to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max_probes: 3,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time snapshot of a breaker, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub probes_in_flight: u32,
    /// Time since the most recent recorded failure.
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    probes_in_flight: u32,
    last_failure: Option<Instant>,
    /// Bumped on every transition; outcomes from an older generation are dropped.
    generation: u64,
}

/// Guards one logical dependency.
///
/// Admission and outcome recording each take the internal lock briefly;
/// the wrapped future always runs unlocked.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                probes_in_flight: 0,
                last_failure: None,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state without advancing `Open` to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `f` if admitted, recording its outcome.
    pub async fn execute<F, Fut, E>(&self, f: F) -> Result<(), BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.execute_with_result(f).await
    }

    /// Run `f` if admitted, recording its outcome and returning its value.
    ///
    /// `f` is invoked at most once. If the returned future is dropped
    /// before completion, no outcome is recorded and any half-open probe
    /// slot it held is released.
    pub async fn execute_with_result<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit()?;
        let result = f().await;
        permit.complete(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    /// Force `Closed` with all counters cleared.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let from = inner.state;
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.probes_in_flight = 0;
        inner.generation += 1;
        info!(breaker = %self.name, %from, "circuit breaker reset");
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            probes_in_flight: inner.probes_in_flight,
            since_last_failure: inner.last_failure.map(|t| t.elapsed()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn admit(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, inner.generation, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.open_timeout);
                if elapsed >= self.config.open_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probes_in_flight = 1;
                    Ok(Permit::new(self, inner.generation, true))
                } else {
                    Err(self.refuse(OpenReason::Cooling {
                        retry_after: self.config.open_timeout - elapsed,
                    }))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight >= self.config.half_open_max_probes {
                    return Err(self.refuse(OpenReason::ProbeLimit));
                }
                inner.probes_in_flight += 1;
                Ok(Permit::new(self, inner.generation, true))
            }
        }
    }

    fn refuse(&self, reason: OpenReason) -> CircuitOpenError {
        debug!(breaker = %self.name, %reason, "call rejected");
        CircuitOpenError {
            name: self.name.clone(),
            reason,
        }
    }

    fn record(&self, generation: u64, probe: bool, success: bool) {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(breaker = %self.name, success, "stale outcome ignored");
            return;
        }
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }

        if success {
            match inner.state {
                CircuitState::Closed => inner.failures = 0,
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.config.success_threshold {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
                CircuitState::Open => {}
            }
            return;
        }

        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed if inner.failures >= self.config.max_failures => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            _ => {}
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            debug!(breaker = %self.name, "abandoned probe released");
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.successes = 0;
        inner.probes_in_flight = 0;
        inner.generation += 1;
        match to {
            CircuitState::Open => {
                warn!(breaker = %self.name, %from, failures = inner.failures, "circuit opened");
            }
            CircuitState::HalfOpen => {
                inner.failures = 0;
                info!(breaker = %self.name, %from, "circuit half-open, probing");
            }
            CircuitState::Closed => {
                inner.failures = 0;
                info!(breaker = %self.name, %from, "circuit closed");
            }
        }
    }
}

/// An admitted call. Releases its probe slot if dropped unfinished.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    done: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, probe: bool) -> Self {
        Self {
            breaker,
            generation,
            probe,
            done: false,
        }
    }

    fn complete(mut self, success: bool) {
        self.done = true;
        self.breaker.record(self.generation, self.probe, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done && self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}
