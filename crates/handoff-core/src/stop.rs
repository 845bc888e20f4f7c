//! Stop Command (C13): finds jobs by message-id or execution-id across every
//! queue and state, removes what's still queued, aborts what's active, and
//! resolves every matched waiter with a canceled `dead` result.

use std::collections::HashSet;
use std::sync::Arc;

use handoff_shared::{JobState, CANCELED_PREFIX};

use crate::cancel::{CancelService, DEFAULT_CANCEL_REASON};
use crate::pending::PendingResults;
use crate::queue_gateway::{JobMatch, QueueGateway};
use crate::task_registry::LocalTaskRegistry;

#[derive(Debug, Clone, Default)]
pub struct StopRequest {
    pub message_ids: Vec<String>,
    pub execution_ids: Vec<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotFound {
    pub message_ids: Vec<String>,
    pub execution_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StopSummary {
    pub requested: usize,
    pub matched: usize,
    pub removed: usize,
    pub aborted: usize,
    pub not_found: NotFound,
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect()
}

#[derive(Debug)]
pub struct StopCommand {
    gateway: Arc<QueueGateway>,
    cancel_service: Arc<CancelService>,
    pending_results: Arc<PendingResults>,
    local_tasks: Arc<LocalTaskRegistry>,
}

impl StopCommand {
    pub fn new(
        gateway: Arc<QueueGateway>,
        cancel_service: Arc<CancelService>,
        pending_results: Arc<PendingResults>,
        local_tasks: Arc<LocalTaskRegistry>,
    ) -> Self {
        Self {
            gateway,
            cancel_service,
            pending_results,
            local_tasks,
        }
    }

    pub async fn execute(&self, request: StopRequest) -> StopSummary {
        let message_ids = dedup(&request.message_ids);
        let execution_ids = dedup(&request.execution_ids);
        let requested = message_ids.len() + execution_ids.len();

        if message_ids.is_empty() && execution_ids.is_empty() {
            return StopSummary::default();
        }

        let message_id_set: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let execution_id_set: HashSet<&str> = execution_ids.iter().map(String::as_str).collect();

        let matches = self
            .gateway
            .find_jobs(&JobState::ALL, |message| {
                message_id_set.contains(message.id.as_str())
                    || message
                        .execution_id()
                        .is_some_and(|execution_id| execution_id_set.contains(execution_id))
            })
            .await;

        let (queued, active): (Vec<JobMatch>, Vec<JobMatch>) = matches
            .into_iter()
            .partition(|job_match| JobState::QUEUED.contains(&job_match.job.state));

        let matched_message_ids: HashSet<String> = queued
            .iter()
            .chain(active.iter())
            .map(|job_match| job_match.job.message.id.clone())
            .collect();
        let matched_execution_ids: HashSet<String> = queued
            .iter()
            .chain(active.iter())
            .filter_map(|job_match| job_match.job.message.execution_id().map(str::to_string))
            .collect();

        let removed = self.gateway.remove_jobs(queued).await;
        for job_match in &removed {
            if let Some(task_id) = job_match.job.message.task_id() {
                self.local_tasks.remove(task_id);
            }
        }

        let active_ids: Vec<String> = active
            .iter()
            .map(|job_match| job_match.job.message.id.clone())
            .collect();
        let aborted = self
            .cancel_service
            .cancel_messages(&active_ids, request.reason.as_deref())
            .await;

        let canonical_reason = format!(
            "{}{}",
            CANCELED_PREFIX,
            request.reason.as_deref().unwrap_or(DEFAULT_CANCEL_REASON)
        );
        for id in &matched_message_ids {
            self.pending_results.cancel(id, canonical_reason.clone());
        }

        let not_found = NotFound {
            message_ids: message_ids
                .into_iter()
                .filter(|id| !matched_message_ids.contains(id))
                .collect(),
            execution_ids: execution_ids
                .into_iter()
                .filter(|id| !matched_execution_ids.contains(id))
                .collect(),
        };

        StopSummary {
            requested,
            matched: matched_message_ids.len(),
            removed: removed.len(),
            aborted: aborted.len(),
            not_found,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_shared::{
        Broker, EnqueueOptions, HandoffMessage, InMemoryBroker, InMemoryQueue, Queue,
        PAYLOAD_EXECUTION_ID, PAYLOAD_TASK_ID,
    };
    use std::collections::HashMap;

    fn message(id: &str, execution_id: Option<&str>, task_id: Option<&str>) -> HandoffMessage {
        let mut payload = HashMap::new();
        if let Some(execution_id) = execution_id {
            payload.insert(
                PAYLOAD_EXECUTION_ID.to_string(),
                serde_json::json!(execution_id),
            );
        }
        if let Some(task_id) = task_id {
            payload.insert(PAYLOAD_TASK_ID.to_string(), serde_json::json!(task_id));
        }
        HandoffMessage {
            id: id.to_string(),
            message_type: "agent.chat.v1".into(),
            version: 1,
            tenant_id: "t".into(),
            session_key: "s".into(),
            business_key: "b".into(),
            attempt: 1,
            max_attempts: 3,
            enqueued_at: 0,
            trace_id: "tr".into(),
            parent_message_id: None,
            payload,
            headers: HashMap::new(),
        }
    }

    fn command() -> (StopCommand, Arc<InMemoryQueue>, Arc<CancelService>, Arc<PendingResults>, Arc<LocalTaskRegistry>) {
        let queue = Arc::new(InMemoryQueue::new());
        let gateway = Arc::new(QueueGateway::new(queue.clone()));
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let cancel_service = Arc::new(CancelService::new(broker));
        let pending_results = Arc::new(PendingResults::new());
        let local_tasks = Arc::new(LocalTaskRegistry::new());
        let command = StopCommand::new(
            gateway,
            cancel_service.clone(),
            pending_results.clone(),
            local_tasks.clone(),
        );
        (command, queue, cancel_service, pending_results, local_tasks)
    }

    #[tokio::test]
    async fn both_empty_returns_empty_summary() {
        let (command, _queue, _cancel, _pending, _tasks) = command();
        let summary = command.execute(StopRequest::default()).await;
        assert_eq!(summary.requested, 0);
        assert_eq!(summary.matched, 0);
    }

    #[tokio::test]
    async fn stops_queued_and_active_jobs() {
        let (command, queue, cancel_service, pending_results, local_tasks) = command();

        let task_id = local_tasks.register(Box::new(|_ctx| {
            Box::pin(async { None })
        }));

        queue
            .enqueue(
                "handoff",
                message("m-queued", None, Some(&task_id)),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        queue
            .enqueue(
                "handoff",
                message("m-active", Some("e2"), None),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        let active_job_id = {
            let jobs = queue.scan("handoff", &JobState::ALL).await.unwrap();
            jobs.iter()
                .find(|j| j.message.id == "m-active")
                .unwrap()
                .job_id
                .clone()
        };
        queue.mark_active("handoff", &active_job_id).await;
        cancel_service.register("m-active");

        let waiter_queued = {
            let pending_results = pending_results.clone();
            tokio::spawn(async move {
                pending_results
                    .wait_for("m-queued", crate::pending::WaitOptions::default())
                    .await
            })
        };
        let waiter_active = {
            let pending_results = pending_results.clone();
            tokio::spawn(async move {
                pending_results
                    .wait_for("m-active", crate::pending::WaitOptions::default())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let summary = command
            .execute(StopRequest {
                message_ids: vec!["m-queued".to_string()],
                execution_ids: vec!["e2".to_string()],
                reason: Some("Canceled by user".to_string()),
            })
            .await;

        assert_eq!(summary.matched, 2);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.aborted, 1);
        assert!(summary.not_found.message_ids.is_empty());
        assert!(summary.not_found.execution_ids.is_empty());

        assert!(local_tasks.take(&task_id).is_none());

        let queued_result = waiter_queued.await.unwrap().unwrap();
        assert!(
            matches!(queued_result, ProcessResultAlias::Dead { ref reason } if reason == "canceled:Canceled by user")
        );
        let active_result = waiter_active.await.unwrap().unwrap();
        assert!(
            matches!(active_result, ProcessResultAlias::Dead { ref reason } if reason == "canceled:Canceled by user")
        );
    }

    use handoff_shared::ProcessResult as ProcessResultAlias;

    #[tokio::test]
    async fn unmatched_ids_are_reported_as_not_found() {
        let (command, _queue, _cancel, _pending, _tasks) = command();
        let summary = command
            .execute(StopRequest {
                message_ids: vec!["ghost".to_string()],
                execution_ids: vec!["ghost-exec".to_string()],
                reason: None,
            })
            .await;
        assert_eq!(summary.matched, 0);
        assert_eq!(summary.not_found.message_ids, vec!["ghost".to_string()]);
        assert_eq!(
            summary.not_found.execution_ids,
            vec!["ghost-exec".to_string()]
        );
    }
}
