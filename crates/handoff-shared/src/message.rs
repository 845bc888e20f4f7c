//! # Handoff Message Envelope & Result Types (C1)
//!
//! Immutable shape of a handoff message, its headers, and the processor's
//! structured outcome, represented as a tagged enum so callers can match on
//! `status` directly after deserializing from JSON.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HandoffError, HandoffResult};

/// Reserved payload key: references a [`crate::task_registry`] closure.
pub const PAYLOAD_TASK_ID: &str = "taskId";
/// Reserved payload key: the execution id a cancel targets.
pub const PAYLOAD_EXECUTION_ID: &str = "executionId";

/// Reserved header keys.
pub const HEADER_ORGANIZATION_ID: &str = "organizationId";
pub const HEADER_USER_ID: &str = "userId";
pub const HEADER_LANGUAGE: &str = "language";
pub const HEADER_THREAD_ID: &str = "threadId";
pub const HEADER_CONVERSATION_ID: &str = "conversationId";
pub const HEADER_SOURCE: &str = "source";
pub const HEADER_REQUESTED_LANE: &str = "requestedLane";
pub const HEADER_HANDOFF_QUEUE: &str = "handoffQueue";
pub const HEADER_POLICY_TIMEOUT_MS: &str = "policyTimeoutMs";
pub const HEADER_INTEGRATION_ID: &str = "integrationId";

/// The canonical prefix that marks a `dead` result as terminal-and-clean.
pub const CANCELED_PREFIX: &str = "canceled:";

/// Immutable envelope for one unit of asynchronous work routed through the bus.
///
/// Once an id enters the system the envelope is treated as
/// immutable; a retry produces a new envelope with `attempt` incremented
/// rather than mutating the original in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub version: u32,
    pub tenant_id: String,
    pub session_key: String,
    pub business_key: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: u64,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl HandoffMessage {
    /// Epoch milliseconds "now", used to stamp `enqueued_at` at first enqueue.
    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Invariants: non-empty id/type/tenant/session/trace/business
    /// and `attempt <= max_attempts`.
    pub fn validate(&self) -> HandoffResult<()> {
        if self.id.is_empty() {
            return Err(HandoffError::MissingMessageId);
        }
        let missing = [
            ("type", self.message_type.as_str()),
            ("tenantId", self.tenant_id.as_str()),
            ("sessionKey", self.session_key.as_str()),
            ("traceId", self.trace_id.as_str()),
            ("businessKey", self.business_key.as_str()),
        ]
        .into_iter()
        .find(|(_, v)| v.is_empty());

        if let Some((field, _)) = missing {
            return Err(HandoffError::Validation(format!(
                "{field} must not be empty"
            )));
        }
        if self.attempt > self.max_attempts {
            return Err(HandoffError::Validation(format!(
                "attempt {} exceeds maxAttempts {}",
                self.attempt, self.max_attempts
            )));
        }
        Ok(())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.header(HEADER_ORGANIZATION_ID)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.payload.get(PAYLOAD_TASK_ID).and_then(|v| v.as_str())
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.payload
            .get(PAYLOAD_EXECUTION_ID)
            .and_then(|v| v.as_str())
    }

    /// Produce the next-attempt envelope for a retry: same id/headers/payload,
    /// `attempt` bumped by one. The copy is what gets
    /// re-enqueued; the original envelope is otherwise discarded.
    pub fn with_next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }
}

/// Builder used by the queue service facade (C12) to normalize a
/// producer-supplied message before enqueue.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub id: Option<String>,
    pub message_type: String,
    pub tenant_id: String,
    pub session_key: String,
    pub business_key: String,
    pub trace_id: String,
    pub parent_message_id: Option<String>,
    pub max_attempts: Option<u32>,
    pub payload: HashMap<String, serde_json::Value>,
    pub headers: HashMap<String, String>,
}

impl NewMessage {
    /// Stamp defaults: fresh id if absent, `version = 1`,
    /// `attempt = 1`, `enqueuedAt = now`. `max_attempts` precedence is
    /// resolved by the caller (route policy may override the default of 3).
    pub fn into_envelope(self, resolved_max_attempts: u32) -> HandoffMessage {
        HandoffMessage {
            id: self.id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            message_type: self.message_type,
            version: 1,
            tenant_id: self.tenant_id,
            session_key: self.session_key,
            business_key: self.business_key,
            attempt: 1,
            max_attempts: resolved_max_attempts.max(1),
            enqueued_at: HandoffMessage::now_millis(),
            trace_id: self.trace_id,
            parent_message_id: self.parent_message_id,
            payload: self.payload,
            headers: self.headers,
        }
    }
}

/// The processor's structured outcome for one dispatch attempt.
///
/// A `dead` result whose `reason` carries the literal
/// [`CANCELED_PREFIX`] is a distinguished subclass — never dead-lettered,
/// never retried, always terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessResult {
    Ok {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outbound: Vec<HandoffMessage>,
    },
    Retry {
        delay_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Dead {
        reason: String,
    },
}

impl ProcessResult {
    pub fn dead(reason: impl Into<String>) -> Self {
        Self::Dead {
            reason: reason.into(),
        }
    }

    pub fn canceled(reason: impl AsRef<str>) -> Self {
        Self::Dead {
            reason: format!("{CANCELED_PREFIX}{}", reason.as_ref()),
        }
    }

    pub fn ok() -> Self {
        Self::Ok { outbound: vec![] }
    }

    /// True iff this is a `dead` result carrying the canceled-prefix reason.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Dead { reason } if reason.starts_with(CANCELED_PREFIX))
    }

    pub fn dead_reason(&self) -> Option<&str> {
        match self {
            Self::Dead { reason } => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Policy attached to a processor registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorPolicy {
    pub lane: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}
