//! # Circuit Breaker Behavior Trait
//!
//! Unifies circuit breaker implementations behind one object-safe trait, so
//! observability code can hold `&dyn CircuitBreakerBehavior` while the
//! Queue Gateway and Broker wrappers use the concrete type directly.

use std::time::Duration;

use super::circuit_breaker::CircuitState;
use super::metrics::CircuitBreakerMetrics;

pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    fn should_allow(&self) -> bool;
    fn record_success(&self, duration: Duration);
    fn record_failure(&self, duration: Duration);
    fn is_healthy(&self) -> bool;
    fn force_open(&self);
    fn force_closed(&self);
    fn metrics(&self) -> CircuitBreakerMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safe(_: &dyn CircuitBreakerBehavior) {}
}
