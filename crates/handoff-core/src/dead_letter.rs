//! Dead Letter Sink (C8): terminal record for non-retryable failures,
//! excluding canceled outcomes.

use async_trait::async_trait;

use handoff_shared::HandoffMessage;

/// Pluggable terminal-failure sink. Implementations may persist or alert;
/// canceled results must never reach `record`.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + std::fmt::Debug {
    async fn record(&self, message: &HandoffMessage, reason: &str);
}

/// Default sink: logs at error level with type, id, traceId, reason.
#[derive(Debug, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn record(&self, message: &HandoffMessage, reason: &str) {
        tracing::error!(
            message_type = %message.message_type,
            message_id = %message.id,
            trace_id = %message.trace_id,
            reason,
            "dead-lettered handoff message"
        );
    }
}
