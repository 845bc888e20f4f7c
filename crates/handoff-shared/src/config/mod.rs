//! Configuration surfaces for the handoff bus.

pub mod routing;

pub use routing::{RoutingConfig, ROUTING_CONFIG_PATH_ENV};

/// Env vars controlling per-queue worker concurrency. Invalid
/// values fall back to the default rather than panicking.
pub struct ConcurrencyEnv;

impl ConcurrencyEnv {
    pub const DEFAULT_CONCURRENCY: usize = 20;

    pub const DISPATCHER: &'static str = "XPERT_HANDOFF_DISPATCHER_CONCURRENCY";
    pub const REALTIME: &'static str = "XPERT_HANDOFF_CONCURRENCY_REALTIME";
    pub const BATCH: &'static str = "XPERT_HANDOFF_CONCURRENCY_BATCH";
    pub const INTEGRATION: &'static str = "XPERT_HANDOFF_CONCURRENCY_INTEGRATION";

    /// Read `env_var`, falling back to [`Self::DEFAULT_CONCURRENCY`] on
    /// missing or non-positive-integer values, logging the fallback once.
    pub fn read(env_var: &str) -> usize {
        match std::env::var(env_var) {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(value) if value > 0 => value,
                _ => {
                    tracing::warn!(
                        env_var,
                        raw_value = %raw,
                        default = Self::DEFAULT_CONCURRENCY,
                        "invalid concurrency value, falling back to default"
                    );
                    Self::DEFAULT_CONCURRENCY
                }
            },
            Err(_) => Self::DEFAULT_CONCURRENCY,
        }
    }
}
