//! # Handoff Error Types
//!
//! Unified error type for the handoff bus: one `thiserror` enum, one
//! `Result` alias, no ad-hoc `String` error returns outside this module.

use thiserror::Error;

/// Result alias used across the handoff bus.
pub type HandoffResult<T> = Result<T, HandoffError>;

/// Errors recognized by the handoff bus core.
///
/// Validation, missing processor, messaging/transport, routing config,
/// permission, and internal registry failures each get their own variant so
/// callers can match on kind without string-sniffing (the permanent-error
/// prefixes in `dispatcher`/`queue_processor` are a distinct, narrower
/// classification used only for the retry/dead-letter decision).
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Invalid handoff message: {0}")]
    Validation(String),

    #[error("No handoff processor found")]
    ProcessorNotFound,

    #[error("Handoff message id is required")]
    MissingMessageId,

    #[error("Local task not found: {0}")]
    LocalTaskNotFound(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("routing config error: {0}")]
    RoutingConfig(#[from] RoutingConfigError),

    #[error("lock acquisition failed for {0}")]
    LockUnavailable(String),

    #[error("Plugin '{plugin}' attempted {op_kind} operation '{op}' without permission")]
    PermissionDenied {
        plugin: String,
        op_kind: &'static str,
        op: String,
    },

    #[error("waiter timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("duplicate waiter registered for message id {0}")]
    DuplicateWaiter(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandoffError {
    /// Permanent-error prefixes recognized by the queue
    /// processor as non-retryable regardless of remaining attempts.
    pub fn is_permanent(reason: &str) -> bool {
        const PERMANENT_PREFIXES: &[&str] = &[
            "No handoff processor found",
            "Invalid handoff message:",
            "Handoff message id is required",
        ];
        PERMANENT_PREFIXES
            .iter()
            .any(|prefix| reason.starts_with(prefix))
    }
}

/// Errors surfaced while loading/parsing the routing config file.
#[derive(Debug, Error)]
pub enum RoutingConfigError {
    #[error("failed to read routing config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse routing config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("route at index {index} has no match conditions")]
    EmptyMatch { index: usize },
}
