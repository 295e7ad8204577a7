// Copyright 2018-2026 the Som authors. MIT license.

//! Per-key circuit breakers gating calls to unreliable collaborators, plus
//! the orthogonal retry policy. Breakers use deadline timestamps rather
//! than live timers, so there is nothing to cancel except on shutdown.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use log::warn;
use rand::Rng;
use serde::Serialize;

use crate::errors::AnyError;
use crate::errors::CircuitOpenError;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
  Closed,
  Open,
  HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
  /// Failures within `failure_window` that open the circuit.
  pub failure_threshold: u32,
  pub failure_window: Duration,
  /// Base backoff before the first half-open trial; doubles per reopen.
  pub recovery_timeout: Duration,
  pub max_backoff: Duration,
  pub jitter: bool,
  /// Consecutive half-open successes required to close again.
  pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      failure_window: Duration::from_secs(60),
      recovery_timeout: Duration::from_secs(30),
      max_backoff: Duration::from_secs(300),
      jitter: true,
      half_open_successes: 3,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
  pub key: String,
  pub state: BreakerState,
  pub recent_failures: usize,
  pub open_for_ms: Option<u64>,
  pub reopen_count: u32,
}

#[derive(Debug)]
struct BreakerInner {
  state: BreakerState,
  failures: VecDeque<Instant>,
  open_until: Option<Instant>,
  opened_at: Option<Instant>,
  reopen_count: u32,
  half_open_successes: u32,
}

pub struct CircuitBreaker {
  key: String,
  config: CircuitBreakerConfig,
  inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
  pub fn new(key: String, config: CircuitBreakerConfig) -> Self {
    Self {
      key,
      config,
      inner: Mutex::new(BreakerInner {
        state: BreakerState::Closed,
        failures: VecDeque::new(),
        open_until: None,
        opened_at: None,
        reopen_count: 0,
        half_open_successes: 0,
      }),
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Gate an invocation. An open circuit fails fast; an elapsed backoff
  /// transitions to half-open and admits a trial.
  pub fn check(&self) -> Result<(), CircuitOpenError> {
    let mut inner = self.inner.lock().unwrap();
    if inner.state == BreakerState::Open {
      let elapsed = inner
        .open_until
        .map(|until| Instant::now() >= until)
        .unwrap_or(true);
      if elapsed {
        inner.state = BreakerState::HalfOpen;
        inner.half_open_successes = 0;
      } else {
        return Err(CircuitOpenError {
          key: self.key.clone(),
        });
      }
    }
    Ok(())
  }

  pub fn record_success(&self) {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      BreakerState::Closed => {
        inner.failures.clear();
      }
      BreakerState::HalfOpen => {
        inner.half_open_successes += 1;
        if inner.half_open_successes >= self.config.half_open_successes {
          inner.state = BreakerState::Closed;
          inner.failures.clear();
          inner.open_until = None;
          inner.opened_at = None;
          inner.reopen_count = 0;
        }
      }
      BreakerState::Open => {}
    }
  }

  /// Record a failure; returns true when this failure tripped the
  /// breaker open.
  pub fn record_failure(&self) -> bool {
    let mut inner = self.inner.lock().unwrap();
    let now = Instant::now();
    inner.failures.push_back(now);
    let window = self.config.failure_window;
    while let Some(oldest) = inner.failures.front() {
      if now.duration_since(*oldest) > window {
        inner.failures.pop_front();
      } else {
        break;
      }
    }

    match inner.state {
      BreakerState::HalfOpen => {
        self.open_inner(&mut inner, now);
        true
      }
      BreakerState::Closed
        if inner.failures.len() >= self.config.failure_threshold as usize =>
      {
        self.open_inner(&mut inner, now);
        true
      }
      _ => false,
    }
  }

  fn open_inner(&self, inner: &mut BreakerInner, now: Instant) {
    let exponent = inner.reopen_count.min(10);
    let mut backoff = self
      .config
      .recovery_timeout
      .saturating_mul(1u32 << exponent)
      .min(self.config.max_backoff);
    if self.config.jitter {
      let factor = 0.5 + rand::thread_rng().gen::<f64>() / 2.0;
      backoff = backoff.mul_f64(factor);
    }
    inner.state = BreakerState::Open;
    inner.opened_at = Some(now);
    inner.open_until = Some(now + backoff);
    inner.reopen_count += 1;
    inner.half_open_successes = 0;
    warn!(
      "circuit breaker opened for {} (backoff {:?})",
      self.key, backoff
    );
  }

  pub fn state(&self) -> BreakerState {
    self.inner.lock().unwrap().state
  }

  /// Force the breaker closed, forgetting all history.
  pub fn reset(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.state = BreakerState::Closed;
    inner.failures.clear();
    inner.open_until = None;
    inner.opened_at = None;
    inner.reopen_count = 0;
    inner.half_open_successes = 0;
  }

  /// Force the breaker open for a fixed duration.
  pub fn force_open(&self, duration: Duration) {
    let mut inner = self.inner.lock().unwrap();
    let now = Instant::now();
    inner.state = BreakerState::Open;
    inner.opened_at = Some(now);
    inner.open_until = Some(now + duration);
  }

  pub fn stats(&self) -> BreakerStats {
    let inner = self.inner.lock().unwrap();
    BreakerStats {
      key: self.key.clone(),
      state: inner.state,
      recent_failures: inner.failures.len(),
      open_for_ms: inner
        .opened_at
        .map(|at| at.elapsed().as_millis() as u64),
      reopen_count: inner.reopen_count,
    }
  }
}

/// Maintains one breaker per external key and aggregates their health.
pub struct CircuitBreakerManager {
  config: CircuitBreakerConfig,
  breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
  maybe_metrics: Option<Arc<Metrics>>,
}

impl CircuitBreakerManager {
  pub fn new(
    config: CircuitBreakerConfig,
    maybe_metrics: Option<Arc<Metrics>>,
  ) -> Self {
    Self {
      config,
      breakers: Mutex::new(HashMap::new()),
      maybe_metrics,
    }
  }

  pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
    let mut breakers = self.breakers.lock().unwrap();
    breakers
      .entry(key.to_string())
      .or_insert_with(|| {
        Arc::new(CircuitBreaker::new(
          key.to_string(),
          self.config.clone(),
        ))
      })
      .clone()
  }

  pub fn check(&self, key: &str) -> Result<(), CircuitOpenError> {
    self.breaker(key).check()
  }

  pub fn record_success(&self, key: &str) {
    self.breaker(key).record_success();
  }

  pub fn record_failure(&self, key: &str) {
    if self.breaker(key).record_failure() {
      if let Some(metrics) = &self.maybe_metrics {
        metrics
          .counters
          .breaker_trips
          .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
      }
    }
  }

  pub fn reset(&self, key: &str) -> bool {
    let breakers = self.breakers.lock().unwrap();
    match breakers.get(key) {
      Some(breaker) => {
        breaker.reset();
        true
      }
      None => false,
    }
  }

  pub fn reset_all(&self) {
    for breaker in self.breakers.lock().unwrap().values() {
      breaker.reset();
    }
  }

  pub fn statuses(&self) -> Vec<BreakerStats> {
    let mut statuses: Vec<BreakerStats> = self
      .breakers
      .lock()
      .unwrap()
      .values()
      .map(|breaker| breaker.stats())
      .collect();
    statuses.sort_by(|a, b| a.key.cmp(&b.key));
    statuses
  }

  pub fn open_count(&self) -> usize {
    self
      .breakers
      .lock()
      .unwrap()
      .values()
      .filter(|breaker| breaker.state() == BreakerState::Open)
      .count()
  }

  pub fn len(&self) -> usize {
    self.breakers.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.breakers.lock().unwrap().is_empty()
  }

  /// Drop all breakers; their backoff deadlines die with them.
  pub fn shutdown(&self) {
    self.breakers.lock().unwrap().clear();
  }
}

/// Retry with exponential backoff and multiplicative jitter. Orthogonal
/// to the breaker: retries only happen between breaker-allowed attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub jitter: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_delay: Duration::from_millis(100),
      max_delay: Duration::from_secs(10),
      jitter: true,
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (0-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.min(16);
    let mut delay = self
      .initial_delay
      .saturating_mul(1u32 << exponent)
      .min(self.max_delay);
    if self.jitter {
      let factor = 0.5 + rand::thread_rng().gen::<f64>() / 2.0;
      delay = delay.mul_f64(factor);
    }
    delay
  }

  /// Run `op` through an optional breaker, retrying failures until the
  /// budget is spent. The breaker sees every attempt; an open circuit
  /// stops the retry loop immediately.
  pub async fn run<T, F, Fut>(
    &self,
    maybe_breaker: Option<&CircuitBreaker>,
    mut op: F,
  ) -> Result<T, AnyError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AnyError>>,
  {
    let mut last_error: Option<AnyError> = None;
    for attempt in 0..=self.max_retries {
      if let Some(breaker) = maybe_breaker {
        breaker.check()?;
      }
      match op().await {
        Ok(value) => {
          if let Some(breaker) = maybe_breaker {
            breaker.record_success();
          }
          return Ok(value);
        }
        Err(err) => {
          if let Some(breaker) = maybe_breaker {
            breaker.record_failure();
          }
          last_error = Some(err);
        }
      }
      if attempt < self.max_retries {
        tokio::time::sleep(self.delay_for(attempt)).await;
      }
    }
    Err(
      last_error
        .unwrap_or_else(|| anyhow::anyhow!("retry budget exhausted")),
    )
  }
}
