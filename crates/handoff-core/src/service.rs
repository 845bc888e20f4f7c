//! Queue Service / public façade (C12): the only entry point producers use
//! to enqueue work. Normalizes message defaults, stamps route headers, and
//! enforces the permission guard before touching the queue gateway.

use std::collections::HashSet;
use std::sync::Arc;

use handoff_shared::{
    EnqueueOptions, HandoffError, HandoffMessage, HandoffResult, NewMessage, ProcessResult,
    RoutingConfig, HEADER_HANDOFF_QUEUE, HEADER_POLICY_TIMEOUT_MS, HEADER_REQUESTED_LANE,
};

use crate::pending::{EventListener, PendingResults};
use crate::queue_gateway::{QueueGateway, QueueStats};
use crate::route_resolver::{ResolvedRoute, RouteResolver};

/// Default `maxAttempts` when neither the producer nor the type policy sets one.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// One of the two operation tags a caller's permission set may grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enqueue,
    Wait,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Enqueue => "enqueue",
            Operation::Wait => "wait",
        }
    }
}

/// Identifies the caller for the permission guard: a plugin name plus the
/// set of operation tags it was granted at install time.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub plugin: String,
    pub allowed: HashSet<Operation>,
}

impl CallerContext {
    pub fn new(plugin: impl Into<String>, allowed: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            plugin: plugin.into(),
            allowed: allowed.into_iter().collect(),
        }
    }

    /// A caller allowed every operation; used internally (bootstrap
    /// recovery, trigger callbacks) where there is no external plugin.
    pub fn trusted(plugin: impl Into<String>) -> Self {
        Self::new(plugin, [Operation::Enqueue, Operation::Wait])
    }
}

#[derive(Default)]
pub struct EnqueueAndWaitOptions {
    pub delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub on_event: Option<EventListener>,
}

impl std::fmt::Debug for EnqueueAndWaitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueAndWaitOptions")
            .field("delay_ms", &self.delay_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("on_event", &self.on_event.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[derive(Debug)]
pub struct QueueService {
    gateway: Arc<QueueGateway>,
    route_resolver: Arc<RouteResolver>,
    routing_config: Arc<RoutingConfig>,
    pending_results: Arc<PendingResults>,
}

impl QueueService {
    pub fn new(
        gateway: Arc<QueueGateway>,
        route_resolver: Arc<RouteResolver>,
        routing_config: Arc<RoutingConfig>,
        pending_results: Arc<PendingResults>,
    ) -> Self {
        Self {
            gateway,
            route_resolver,
            routing_config,
            pending_results,
        }
    }

    fn guard(&self, caller: &CallerContext, tag: Operation, op: &str) -> HandoffResult<()> {
        if caller.allowed.contains(&tag) {
            Ok(())
        } else {
            Err(HandoffError::PermissionDenied {
                plugin: caller.plugin.clone(),
                op_kind: tag.as_str(),
                op: op.to_string(),
            })
        }
    }

    /// Resolve `maxAttempts`, build the envelope, resolve its route, and
    /// stamp route headers not already set by the producer.
    fn normalize(&self, new_message: NewMessage) -> (HandoffMessage, ResolvedRoute) {
        let type_policy = self
            .routing_config
            .type_policies
            .get(&new_message.message_type)
            .cloned();
        let resolved_max_attempts = new_message
            .max_attempts
            .or_else(|| {
                type_policy
                    .as_ref()
                    .and_then(|p| p.retry.as_ref())
                    .and_then(|r| r.max_attempts)
            })
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .max(1);

        let mut envelope = new_message.into_envelope(resolved_max_attempts);
        let resolved = self.route_resolver.resolve(&self.routing_config, &envelope);
        stamp_route_headers(&mut envelope, &resolved);
        (envelope, resolved)
    }

    /// Fire-and-forget enqueue. Returns the normalized id; never surfaces
    /// downstream dispatch failures to the caller.
    pub async fn enqueue(
        &self,
        caller: &CallerContext,
        new_message: NewMessage,
        delay_ms: Option<u64>,
    ) -> HandoffResult<String> {
        self.guard(caller, Operation::Enqueue, "enqueue")?;
        let (envelope, resolved) = self.normalize(new_message);
        let id = envelope.id.clone();
        self.gateway
            .enqueue(&resolved.queue, envelope, EnqueueOptions { delay_ms })
            .await
            .map_err(|error| HandoffError::Messaging(error.to_string()))?;
        Ok(id)
    }

    /// Batched enqueue preserving input order.
    pub async fn enqueue_many(
        &self,
        caller: &CallerContext,
        new_messages: Vec<NewMessage>,
        delay_ms: Option<u64>,
    ) -> HandoffResult<Vec<String>> {
        self.guard(caller, Operation::Enqueue, "enqueueMany")?;
        let mut ids = Vec::with_capacity(new_messages.len());
        let mut items = Vec::with_capacity(new_messages.len());
        for new_message in new_messages {
            let (envelope, resolved) = self.normalize(new_message);
            ids.push(envelope.id.clone());
            items.push((resolved.queue, envelope, EnqueueOptions { delay_ms }));
        }
        self.gateway
            .enqueue_many(items)
            .await
            .map_err(|error| HandoffError::Messaging(error.to_string()))?;
        Ok(ids)
    }

    /// Register the waiter for the normalized id *before* enqueuing, then
    /// enqueue. An enqueue failure rejects the waiter with that error rather
    /// than leaving it pending.
    pub async fn enqueue_and_wait(
        &self,
        caller: &CallerContext,
        new_message: NewMessage,
        options: EnqueueAndWaitOptions,
    ) -> HandoffResult<ProcessResult> {
        self.guard(caller, Operation::Wait, "enqueueAndWait")?;
        let (envelope, resolved) = self.normalize(new_message);
        let id = envelope.id.clone();

        let receiver = self.pending_results.register(&id, options.on_event)?;

        let enqueue_result = self
            .gateway
            .enqueue(
                &resolved.queue,
                envelope,
                EnqueueOptions {
                    delay_ms: options.delay_ms,
                },
            )
            .await;

        if let Err(error) = enqueue_result {
            let error = HandoffError::Messaging(error.to_string());
            self.pending_results.reject(&id, error);
        }

        match options.timeout_ms {
            None => receiver.await.map_err(|_| {
                HandoffError::Internal(format!("waiter for {id} dropped without resolution"))
            })?,
            Some(timeout_ms) => {
                match tokio::time::timeout(
                    std::time::Duration::from_millis(timeout_ms),
                    receiver,
                )
                .await
                {
                    Ok(received) => received.map_err(|_| {
                        HandoffError::Internal(format!(
                            "waiter for {id} dropped without resolution"
                        ))
                    })?,
                    Err(_) => Err(HandoffError::Timeout(std::time::Duration::from_millis(
                        timeout_ms,
                    ))),
                }
            }
        }
    }

    /// Resolve `queue_alias` to its backend queue name and report its
    /// current job count.
    pub async fn stats(&self, queue_alias: &str) -> QueueStats {
        let queue_name = self.routing_config.resolve_queue_alias(queue_alias);
        self.gateway.stats(&queue_name).await
    }

    pub fn route_resolver(&self) -> &Arc<RouteResolver> {
        &self.route_resolver
    }

    pub fn routing_config(&self) -> &Arc<RoutingConfig> {
        &self.routing_config
    }

    pub fn gateway(&self) -> &Arc<QueueGateway> {
        &self.gateway
    }
}

fn stamp_route_headers(envelope: &mut HandoffMessage, resolved: &ResolvedRoute) {
    envelope
        .headers
        .entry(HEADER_REQUESTED_LANE.to_string())
        .or_insert_with(|| resolved.lane.clone());
    envelope
        .headers
        .entry(HEADER_HANDOFF_QUEUE.to_string())
        .or_insert_with(|| resolved.queue.clone());
    if let Some(timeout_ms) = resolved.timeout_ms {
        envelope
            .headers
            .entry(HEADER_POLICY_TIMEOUT_MS.to_string())
            .or_insert_with(|| timeout_ms.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_shared::{InMemoryQueue, Queue};

    fn new_message(message_type: &str) -> NewMessage {
        NewMessage {
            id: None,
            message_type: message_type.into(),
            tenant_id: "t".into(),
            session_key: "s".into(),
            business_key: "b".into(),
            trace_id: "tr".into(),
            parent_message_id: None,
            max_attempts: None,
            payload: Default::default(),
            headers: Default::default(),
        }
    }

    fn service() -> (QueueService, Arc<QueueGateway>) {
        let queue = Arc::new(InMemoryQueue::new());
        let gateway = Arc::new(QueueGateway::new(queue));
        let service = QueueService::new(
            gateway.clone(),
            Arc::new(RouteResolver::new()),
            Arc::new(RoutingConfig::empty()),
            Arc::new(PendingResults::new()),
        );
        (service, gateway)
    }

    #[tokio::test]
    async fn enqueue_stamps_defaults_and_route_headers() {
        let (service, gateway) = service();
        let caller = CallerContext::trusted("test");
        let id = service
            .enqueue(&caller, new_message("agent.chat.v1"), None)
            .await
            .unwrap();
        assert!(!id.is_empty());

        let matches = gateway
            .find_jobs(&handoff_shared::JobState::ALL, |m| m.id == id)
            .await;
        assert_eq!(matches.len(), 1);
        let message = &matches[0].job.message;
        assert_eq!(message.max_attempts, 3);
        assert_eq!(message.headers.get("requestedLane"), Some(&"main".to_string()));
        assert_eq!(message.headers.get("handoffQueue"), Some(&"handoff".to_string()));
    }

    #[tokio::test]
    async fn enqueue_without_permission_is_rejected() {
        let (service, _gateway) = service();
        let caller = CallerContext::new("untrusted-plugin", []);
        let err = service
            .enqueue(&caller, new_message("agent.chat.v1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn enqueue_many_preserves_order_and_returns_all_ids() {
        let (service, _gateway) = service();
        let caller = CallerContext::trusted("test");
        let ids = service
            .enqueue_many(
                &caller,
                vec![new_message("agent.chat.v1"), new_message("system.sweep.v1")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn enqueue_and_wait_resolves_once_a_worker_processes_the_job() {
        use async_trait::async_trait;

        use crate::cancel::CancelService;
        use crate::dispatcher::Dispatcher;
        use crate::queue_gateway::QueueGateway;
        use crate::queue_processor::QueueProcessor;
        use crate::registry::{Processor, ProcessorContext, ProcessorMetadata, ProcessorRegistry};
        use crate::task_registry::LocalTaskRegistry;
        use handoff_shared::{Broker, HandoffResult, InMemoryBroker, ProcessorPolicy};

        #[derive(Debug)]
        struct OkProcessor;

        #[async_trait]
        impl Processor for OkProcessor {
            async fn process(
                &self,
                _ctx: ProcessorContext,
                _message: HandoffMessage,
            ) -> HandoffResult<ProcessResult> {
                Ok(ProcessResult::ok())
            }
        }

        let queue = Arc::new(InMemoryQueue::new());
        let gateway = Arc::new(QueueGateway::new(queue.clone()));
        let pending_results = Arc::new(PendingResults::new());
        let registry = Arc::new(ProcessorRegistry::new());
        registry.register(
            "agent.chat.v1",
            None,
            Arc::new(OkProcessor),
            ProcessorMetadata {
                types: vec!["agent.chat.v1".into()],
                policy: ProcessorPolicy {
                    lane: "main".into(),
                    timeout_ms: None,
                },
            },
        );
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            Arc::new(LocalTaskRegistry::new()),
            Arc::new(CancelService::new(broker)),
            pending_results.clone(),
        ));
        let route_resolver = Arc::new(RouteResolver::new());
        let routing_config = Arc::new(RoutingConfig::empty());
        let processor = Arc::new(QueueProcessor::new(
            "handoff",
            queue.clone() as Arc<dyn handoff_shared::Queue>,
            gateway.clone(),
            dispatcher,
            Arc::new(crate::dead_letter::LoggingDeadLetterSink),
            pending_results.clone(),
            route_resolver.clone(),
            routing_config.clone(),
            2,
        ));

        let service = QueueService::new(gateway, route_resolver, routing_config, pending_results);
        let caller = CallerContext::trusted("test");

        let wait = tokio::spawn(async move {
            service
                .enqueue_and_wait(&caller, new_message("agent.chat.v1"), EnqueueAndWaitOptions::default())
                .await
        });
        tokio::task::yield_now().await;

        let job = queue.claim_next("handoff").await.unwrap().unwrap();
        processor.process_job(job).await;

        let result = wait.await.unwrap().unwrap();
        assert!(matches!(result, ProcessResult::Ok { .. }));
    }

    #[tokio::test]
    async fn stats_resolves_alias_to_backend_queue_name() {
        let (service, _gateway) = service();
        let caller = CallerContext::trusted("test");
        service
            .enqueue(&caller, new_message("agent.chat.v1"), None)
            .await
            .unwrap();
        let stats = service.stats("default").await;
        assert_eq!(stats.queue_name, "handoff");
        assert_eq!(stats.message_count, 1);
    }

    #[tokio::test]
    async fn enqueue_and_wait_timeout_rejects() {
        let (service, _gateway) = service();
        let caller = CallerContext::trusted("test");
        let result = service
            .enqueue_and_wait(
                &caller,
                new_message("agent.chat.v1"),
                EnqueueAndWaitOptions {
                    timeout_ms: Some(10),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(HandoffError::Timeout(_))));
    }
}
