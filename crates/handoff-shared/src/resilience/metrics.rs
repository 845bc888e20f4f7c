//! Circuit breaker metrics snapshot and collection.

use std::time::Duration;

use super::circuit_breaker::CircuitState;

/// Point-in-time snapshot of one breaker's counters.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub total_duration: Duration,
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn calls_per_second(&self, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        self.total_calls as f64 / window.as_secs_f64()
    }

    pub fn is_healthy(&self) -> bool {
        self.current_state != CircuitState::Open && self.failure_rate < 0.5
    }

    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    pub fn format_summary(&self) -> String {
        format!(
            "{} calls, {:.1}% failure rate, state={}",
            self.total_calls,
            self.failure_rate * 100.0,
            self.state_description()
        )
    }
}

/// Sink for exporting breaker snapshots, implemented by whatever observability
/// backend a deployment wires in (metrics are ambient infrastructure, not
/// something every caller needs to know the concrete type of).
pub trait MetricsCollector: Send + Sync + std::fmt::Debug {
    fn record(&self, breaker_name: &str, metrics: CircuitBreakerMetrics);
}

/// Collector that emits one `tracing` event per snapshot.
#[derive(Debug, Default)]
pub struct TracingMetricsCollector;

impl MetricsCollector for TracingMetricsCollector {
    fn record(&self, breaker_name: &str, metrics: CircuitBreakerMetrics) {
        tracing::info!(
            breaker = breaker_name,
            total_calls = metrics.total_calls,
            failure_rate = metrics.failure_rate,
            state = metrics.state_description(),
            "circuit breaker snapshot"
        );
    }
}
