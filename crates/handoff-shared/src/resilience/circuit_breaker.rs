//! # Circuit Breaker
//!
//! Fault-isolation wrapper for the Queue Gateway and Broker: after
//! `failure_threshold` consecutive failures the breaker opens and fails fast
//! for `timeout`, then allows a trial call (half-open) before closing again
//! on `success_threshold` consecutive successes. This is an ambient
//! resilience concern wrapping the Queue/Broker backends, which are
//! themselves external collaborators.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::behavior::CircuitBreakerBehavior;
use super::metrics::CircuitBreakerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct CountersSnapshot {
    total_calls: u64,
    success_count: u64,
    failure_count: u64,
    total_duration: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
    opened_at: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(CircuitState::Closed),
            opened_at: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_duration_nanos: AtomicU64::new(0),
        }
    }

    fn transition_if_recovery_elapsed(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == CircuitState::Open {
            let opened_at = *self.opened_at.lock().unwrap();
            if let Some(opened_at) = opened_at {
                if opened_at.elapsed() >= self.config.timeout {
                    *state = CircuitState::HalfOpen;
                    self.consecutive_successes.store(0, Ordering::SeqCst);
                }
            }
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);

        if success {
            self.success_count.fetch_add(1, Ordering::SeqCst);
            self.consecutive_failures.store(0, Ordering::SeqCst);
            let mut state = self.state.lock().unwrap();
            if *state == CircuitState::HalfOpen {
                let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    *state = CircuitState::Closed;
                    *self.opened_at.lock().unwrap() = None;
                }
            }
        } else {
            self.failure_count.fetch_add(1, Ordering::SeqCst);
            self.consecutive_successes.store(0, Ordering::SeqCst);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            let mut state = self.state.lock().unwrap();
            match *state {
                CircuitState::HalfOpen => {
                    *state = CircuitState::Open;
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                }
                CircuitState::Closed if failures >= self.config.failure_threshold => {
                    *state = CircuitState::Open;
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                }
                _ => {}
            }
        }
    }

    pub fn record_success_manual(&self, duration: Duration) {
        self.record(true, duration);
    }

    pub fn record_failure_manual(&self, duration: Duration) {
        self.record(false, duration);
    }

    fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            total_calls: self.total_calls.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            total_duration: Duration::from_nanos(self.total_duration_nanos.load(Ordering::SeqCst)),
        }
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        self.transition_if_recovery_elapsed();
        *self.state.lock().unwrap()
    }

    fn should_allow(&self) -> bool {
        self.transition_if_recovery_elapsed();
        *self.state.lock().unwrap() != CircuitState::Open
    }

    fn record_success(&self, duration: Duration) {
        self.record(true, duration);
    }

    fn record_failure(&self, duration: Duration) {
        self.record(false, duration);
    }

    fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }

    fn force_open(&self) {
        *self.state.lock().unwrap() = CircuitState::Open;
        *self.opened_at.lock().unwrap() = Some(Instant::now());
    }

    fn force_closed(&self) {
        *self.state.lock().unwrap() = CircuitState::Closed;
        *self.opened_at.lock().unwrap() = None;
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let snapshot = self.snapshot();
        let failure_rate = if snapshot.total_calls > 0 {
            snapshot.failure_count as f64 / snapshot.total_calls as f64
        } else {
            0.0
        };
        let average_duration = if snapshot.total_calls > 0 {
            snapshot.total_duration / snapshot.total_calls as u32
        } else {
            Duration::ZERO
        };
        CircuitBreakerMetrics {
            total_calls: snapshot.total_calls,
            success_count: snapshot.success_count,
            failure_count: snapshot.failure_count,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst) as u64,
            total_duration: snapshot.total_duration,
            current_state: self.state(),
            failure_rate,
            success_rate: 1.0 - failure_rate,
            average_duration,
        }
    }
}
