//! Dispatcher (C10): resolves a processor or local task, binds cancellation,
//! runs it, and normalizes abort/exception outcomes into canceled `dead`.

use std::sync::Arc;

use handoff_shared::{HandoffError, HandoffMessage, HandoffResult, ProcessResult};

use crate::cancel::{CancelService, DEFAULT_CANCEL_REASON};
use crate::pending::PendingResults;
use crate::registry::{ProcessorContext, ProcessorRegistry};
use crate::task_registry::LocalTaskRegistry;

/// True iff `reason` looks like an abort: name `AbortError`, or the message
/// contains "abort"/"cancel" case-insensitively.
pub fn is_abort_like(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("aborterror") || lower.contains("abort") || lower.contains("cancel")
}

#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ProcessorRegistry>,
    local_tasks: Arc<LocalTaskRegistry>,
    cancel_service: Arc<CancelService>,
    pending_results: Arc<PendingResults>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        local_tasks: Arc<LocalTaskRegistry>,
        cancel_service: Arc<CancelService>,
        pending_results: Arc<PendingResults>,
    ) -> Self {
        Self {
            registry,
            local_tasks,
            cancel_service,
            pending_results,
        }
    }

    pub fn local_tasks(&self) -> &Arc<LocalTaskRegistry> {
        &self.local_tasks
    }

    /// Run one dispatch attempt. `Ok(ProcessResult)` covers every structural
    /// and processor-returned outcome (including canceled `dead`); `Err`
    /// surfaces a processor-thrown error that was neither abort-like nor
    /// already observed as canceled, for the queue processor to classify
    /// into retry/dead-letter.
    pub async fn dispatch(&self, message: HandoffMessage) -> HandoffResult<ProcessResult> {
        if let Err(error) = message.validate() {
            return Ok(ProcessResult::dead(error.to_string()));
        }

        let id = message.id.clone();
        let token = self.cancel_service.register(&id);

        let pending_results = self.pending_results.clone();
        let emit_id = id.clone();
        let emit = Arc::new(move |event: serde_json::Value| {
            pending_results.publish(&emit_id, event);
        });

        let ctx = ProcessorContext::new(id.clone(), message.trace_id.clone(), token.clone(), emit);

        let outcome = if let Some(task_id) = message.task_id().map(str::to_string) {
            self.run_local_task(&task_id, ctx, message.clone()).await
        } else {
            self.run_registered_processor(ctx, message.clone()).await
        };

        self.cancel_service.unregister(&id);

        if token.is_cancelled() {
            let reason = self
                .cancel_service
                .take_reason(&id)
                .unwrap_or_else(|| format!("{}{}", handoff_shared::CANCELED_PREFIX, DEFAULT_CANCEL_REASON));
            return Ok(ProcessResult::Dead { reason });
        }

        match outcome {
            Ok(result) => Ok(result),
            Err(error) => {
                let reason = error.to_string();
                if is_abort_like(&reason) {
                    Ok(ProcessResult::canceled(reason))
                } else {
                    // Neither canceled nor abort-like: a genuine thrown
                    // error. Left as `Err` so the queue processor can retry
                    // it (or dead-letter and reject the waiter once attempts
                    // are exhausted) instead of resolving the waiter early.
                    Err(error)
                }
            }
        }
    }

    async fn run_registered_processor(
        &self,
        ctx: ProcessorContext,
        message: HandoffMessage,
    ) -> HandoffResult<ProcessResult> {
        let resolved = self
            .registry
            .get(&message.message_type, message.organization_id());
        let Some(resolved) = resolved else {
            return Ok(ProcessResult::dead(HandoffError::ProcessorNotFound.to_string()));
        };
        resolved.processor.process(ctx, message).await
    }

    async fn run_local_task(
        &self,
        task_id: &str,
        ctx: ProcessorContext,
        _message: HandoffMessage,
    ) -> HandoffResult<ProcessResult> {
        let Some(task) = self.local_tasks.take(task_id) else {
            return Ok(ProcessResult::dead(format!(
                "Local task not found: {task_id}"
            )));
        };
        Ok(task(ctx).await.unwrap_or_else(ProcessResult::ok))
    }
}
