//! Processor Registry (C2): resolves a processor for a (message type,
//! organization-scope) pair.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use handoff_shared::{HandoffMessage, HandoffResult, ProcessResult, ProcessorPolicy};

/// Context handed to a processor for one dispatch attempt.
#[derive(Clone)]
pub struct ProcessorContext {
    pub run_id: String,
    pub trace_id: String,
    pub cancellation: CancellationToken,
    emit: Arc<dyn Fn(serde_json::Value) + Send + Sync>,
}

impl fmt::Debug for ProcessorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("run_id", &self.run_id)
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

impl ProcessorContext {
    pub fn new(
        run_id: String,
        trace_id: String,
        cancellation: CancellationToken,
        emit: Arc<dyn Fn(serde_json::Value) + Send + Sync>,
    ) -> Self {
        Self {
            run_id,
            trace_id,
            cancellation,
            emit,
        }
    }

    /// Forward a progress event to the pending-result rendezvous, if any
    /// waiter is listening.
    pub fn emit(&self, event: serde_json::Value) {
        (self.emit)(event);
    }
}

/// Domain logic invoked by the dispatcher for a resolved message type. An
/// `Err` return represents a thrown exception in the source system: the
/// queue processor classifies it (permanent / abort-like / transient) to
/// decide between dead-letter, cancel, and retry.
#[async_trait]
pub trait Processor: Send + Sync + fmt::Debug {
    async fn process(&self, ctx: ProcessorContext, message: HandoffMessage) -> HandoffResult<ProcessResult>;
}

/// Metadata describing a processor registration.
#[derive(Clone, Debug)]
pub struct ProcessorMetadata {
    pub types: Vec<String>,
    pub policy: ProcessorPolicy,
}

#[derive(Clone)]
struct Registration {
    processor: Arc<dyn Processor>,
    metadata: ProcessorMetadata,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Resolved processor handle returned by [`ProcessorRegistry::get`].
#[derive(Clone)]
pub struct ResolvedProcessor {
    pub processor: Arc<dyn Processor>,
    pub metadata: ProcessorMetadata,
}

/// Strategy registry keyed by message type with optional per-organization
/// override. Populated once at startup and treated as read-only at dispatch
/// time; concurrent registration is still safe since each key is a single
/// writer via `DashMap`'s entry API.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    // key: (message_type, organization_id) where a `None` org is the
    // type-wide fallback registration.
    entries: DashMap<(String, Option<String>), Registration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for `message_type`, optionally scoped to
    /// `organization_id`. Re-registering the same key overwrites the prior
    /// entry.
    pub fn register(
        &self,
        message_type: impl Into<String>,
        organization_id: Option<String>,
        processor: Arc<dyn Processor>,
        metadata: ProcessorMetadata,
    ) {
        self.entries.insert(
            (message_type.into(), organization_id),
            Registration {
                processor,
                metadata,
            },
        );
    }

    /// Resolve a processor for `message_type`, preferring an
    /// organization-scoped registration over the type-wide fallback.
    pub fn get(&self, message_type: &str, organization_id: Option<&str>) -> Option<ResolvedProcessor> {
        if let Some(org) = organization_id {
            if let Some(entry) = self
                .entries
                .get(&(message_type.to_string(), Some(org.to_string())))
            {
                return Some(ResolvedProcessor {
                    processor: entry.processor.clone(),
                    metadata: entry.metadata.clone(),
                });
            }
        }
        self.entries
            .get(&(message_type.to_string(), None))
            .map(|entry| ResolvedProcessor {
                processor: entry.processor.clone(),
                metadata: entry.metadata.clone(),
            })
    }
}
