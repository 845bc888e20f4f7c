//! Queue Processor (C11): the worker pool draining one backend queue,
//! running each claimed job through the dispatcher and applying the
//! retry / dead-letter / waiter-resolution state machine to the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use handoff_shared::{
    EnqueueOptions, HandoffError, HandoffMessage, Job, ProcessResult, Queue, RoutingConfig,
    CANCELED_PREFIX,
};

use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::Dispatcher;
use crate::pending::PendingResults;
use crate::queue_gateway::QueueGateway;
use crate::route_resolver::RouteResolver;

/// How long an idle worker sleeps between empty `claim_next` polls.
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Backoff after a claim error, to avoid a hot loop against a failing backend.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_millis(200);

fn retry_exhausted_reason(max_attempts: u32) -> String {
    format!("Retry exhausted after {max_attempts} attempts")
}

/// Owns one backend queue's worker pool. Holds both the raw [`Queue`] (to
/// claim/remove/re-enqueue within this queue) and a [`QueueGateway`] (to
/// enqueue outbound messages, which may resolve to a different queue).
#[derive(Debug)]
pub struct QueueProcessor {
    queue_name: String,
    queue: Arc<dyn Queue>,
    gateway: Arc<QueueGateway>,
    dispatcher: Arc<Dispatcher>,
    dead_letter: Arc<dyn DeadLetterSink>,
    pending_results: Arc<PendingResults>,
    route_resolver: Arc<RouteResolver>,
    routing_config: Arc<RoutingConfig>,
    concurrency: usize,
}

impl QueueProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_name: impl Into<String>,
        queue: Arc<dyn Queue>,
        gateway: Arc<QueueGateway>,
        dispatcher: Arc<Dispatcher>,
        dead_letter: Arc<dyn DeadLetterSink>,
        pending_results: Arc<PendingResults>,
        route_resolver: Arc<RouteResolver>,
        routing_config: Arc<RoutingConfig>,
        concurrency: usize,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue,
            gateway,
            dispatcher,
            dead_letter,
            pending_results,
            route_resolver,
            routing_config,
            concurrency: concurrency.max(1),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Spawn the polling worker-pool loop; exits once `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        loop {
            let claimed = tokio::select! {
                claimed = self.queue.claim_next(&self.queue_name) => claimed,
                _ = shutdown.cancelled() => break,
            };
            match claimed {
                Ok(Some(job)) => {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("queue processor semaphore is never closed");
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.process_job(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(error) => {
                    tracing::warn!(queue = %self.queue_name, %error, "claim_next failed, backing off");
                    tokio::time::sleep(CLAIM_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Run one claimed job through the dispatcher to a terminal or retried
    /// outcome. Public so tests (and a single-shot poll loop) can drive it
    /// directly without the background worker-pool task.
    pub async fn process_job(&self, job: Job) {
        let message = job.message.clone();
        if message.id.is_empty() {
            tracing::error!(
                queue = %self.queue_name,
                job_id = ?job.job_id,
                "job carries a message with no id, dropping without dispatch"
            );
            let _ = self.queue.remove(&self.queue_name, &job.job_id).await;
            return;
        }

        match self.dispatcher.dispatch(message.clone()).await {
            Ok(result) => self.apply_result(&job, message, result).await,
            Err(error) => self.apply_thrown_error(&job, message, error).await,
        }
    }

    async fn apply_result(&self, job: &Job, message: HandoffMessage, result: ProcessResult) {
        match result {
            ProcessResult::Ok { outbound } => {
                let _ = self.queue.remove(&self.queue_name, &job.job_id).await;
                self.enqueue_outbound(outbound).await;
                self.pending_results
                    .resolve(&message.id, ProcessResult::ok());
            }
            ProcessResult::Retry { delay_ms, reason } => {
                let _ = self.queue.remove(&self.queue_name, &job.job_id).await;
                self.retry_or_dead_letter(message, delay_ms, reason).await;
            }
            ProcessResult::Dead { reason } => {
                let _ = self.queue.remove(&self.queue_name, &job.job_id).await;
                if !reason.starts_with(CANCELED_PREFIX) {
                    self.dead_letter.record(&message, &reason).await;
                }
                self.pending_results
                    .resolve(&message.id, ProcessResult::Dead { reason });
            }
        }
    }

    /// A processor-returned `retry`: re-enqueue with a bumped attempt, or
    /// dead-letter and resolve `dead` once attempts are exhausted.
    async fn retry_or_dead_letter(
        &self,
        message: HandoffMessage,
        delay_ms: u64,
        reason: Option<String>,
    ) {
        let next_attempt = message.attempt + 1;
        if next_attempt > message.max_attempts {
            let reason = reason.unwrap_or_else(|| retry_exhausted_reason(message.max_attempts));
            self.dead_letter.record(&message, &reason).await;
            self.pending_results
                .resolve(&message.id, ProcessResult::Dead { reason });
            return;
        }

        let next = message.with_next_attempt();
        let options = EnqueueOptions {
            delay_ms: Some(delay_ms),
        };
        if let Err(error) = self.queue.enqueue(&self.queue_name, next, options).await {
            tracing::error!(
                queue = %self.queue_name,
                message_id = %message.id,
                %error,
                "failed to re-enqueue retry, rejecting waiter"
            );
            self.pending_results
                .reject(&message.id, HandoffError::Internal(error.to_string()));
        }
    }

    /// A thrown error from `Dispatcher::dispatch`: permanent prefixes always
    /// dead-letter; everything else retries like a processor `retry` would,
    /// except the final attempt dead-letters and *rejects* the waiter with
    /// the original error rather than resolving it as `dead`.
    async fn apply_thrown_error(&self, job: &Job, message: HandoffMessage, error: HandoffError) {
        let _ = self.queue.remove(&self.queue_name, &job.job_id).await;
        let reason = error.to_string();

        if HandoffError::is_permanent(&reason) {
            self.dead_letter.record(&message, &reason).await;
            self.pending_results
                .resolve(&message.id, ProcessResult::dead(reason));
            return;
        }

        let next_attempt = message.attempt + 1;
        if next_attempt > message.max_attempts {
            self.dead_letter.record(&message, &reason).await;
            self.pending_results.reject(&message.id, error);
            return;
        }

        let next = message.with_next_attempt();
        if let Err(enqueue_error) = self
            .queue
            .enqueue(&self.queue_name, next, EnqueueOptions::default())
            .await
        {
            tracing::error!(
                queue = %self.queue_name,
                message_id = %message.id,
                %enqueue_error,
                "failed to re-enqueue after thrown error, rejecting waiter"
            );
            self.pending_results.reject(&message.id, error);
        }
    }

    async fn enqueue_outbound(&self, outbound: Vec<HandoffMessage>) {
        for message in outbound {
            let resolved = self.route_resolver.resolve(&self.routing_config, &message);
            if let Err(error) = self
                .gateway
                .enqueue(&resolved.queue, message, EnqueueOptions::default())
                .await
            {
                tracing::error!(queue = %resolved.queue, %error, "failed to enqueue outbound message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::cancel::CancelService;
    use crate::registry::{Processor, ProcessorContext, ProcessorMetadata, ProcessorRegistry};
    use crate::task_registry::LocalTaskRegistry;
    use handoff_shared::{
        Broker, HandoffResult, InMemoryBroker, InMemoryQueue, JobState, ProcessorPolicy,
    };

    fn message(id: &str, attempt: u32, max_attempts: u32) -> HandoffMessage {
        HandoffMessage {
            id: id.to_string(),
            message_type: "agent.chat.v1".into(),
            version: 1,
            tenant_id: "t".into(),
            session_key: "s".into(),
            business_key: "b".into(),
            attempt,
            max_attempts,
            enqueued_at: 0,
            trace_id: "tr".into(),
            parent_message_id: None,
            payload: HashMap::new(),
            headers: HashMap::new(),
        }
    }

    fn policy() -> ProcessorMetadata {
        ProcessorMetadata {
            types: vec!["agent.chat.v1".into()],
            policy: ProcessorPolicy {
                lane: "main".into(),
                timeout_ms: None,
            },
        }
    }

    struct Harness {
        queue: Arc<InMemoryQueue>,
        gateway: Arc<QueueGateway>,
        registry: Arc<ProcessorRegistry>,
        pending_results: Arc<PendingResults>,
        cancel_service: Arc<CancelService>,
    }

    impl Harness {
        fn new() -> Self {
            let queue = Arc::new(InMemoryQueue::new());
            let gateway = Arc::new(QueueGateway::new(queue.clone()));
            let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
            Self {
                queue,
                gateway,
                registry: Arc::new(ProcessorRegistry::new()),
                pending_results: Arc::new(PendingResults::new()),
                cancel_service: Arc::new(CancelService::new(broker)),
            }
        }

        fn processor(&self) -> QueueProcessor {
            let dispatcher = Arc::new(Dispatcher::new(
                self.registry.clone(),
                Arc::new(LocalTaskRegistry::new()),
                self.cancel_service.clone(),
                self.pending_results.clone(),
            ));
            QueueProcessor::new(
                "handoff",
                self.queue.clone() as Arc<dyn Queue>,
                self.gateway.clone(),
                dispatcher,
                Arc::new(crate::dead_letter::LoggingDeadLetterSink),
                self.pending_results.clone(),
                Arc::new(RouteResolver::new()),
                Arc::new(RoutingConfig::empty()),
                4,
            )
        }
    }

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

    #[tokio::test]
    async fn successful_job_is_removed_and_waiter_resolved() {
        let harness = Harness::new();
        harness
            .registry
            .register("agent.chat.v1", None, Arc::new(OkProcessor), policy());
        let processor = harness.processor();

        let msg = message("m1", 1, 3);
        harness
            .queue
            .enqueue("handoff", msg, EnqueueOptions::default())
            .await
            .unwrap();
        let waiter = harness.pending_results.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for("m1", crate::pending::WaitOptions::default())
                .await
        });
        tokio::task::yield_now().await;

        let job = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        processor.process_job(job).await;

        let result = wait.await.unwrap().unwrap();
        assert!(matches!(result, ProcessResult::Ok { .. }));
        assert!(harness
            .queue
            .scan("handoff", &JobState::ALL)
            .await
            .unwrap()
            .is_empty());
    }

    #[derive(Debug)]
    struct RetryOnceProcessor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Processor for RetryOnceProcessor {
        async fn process(
            &self,
            _ctx: ProcessorContext,
            message: HandoffMessage,
        ) -> HandoffResult<ProcessResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message.attempt == 1 {
                Ok(ProcessResult::Retry {
                    delay_ms: 0,
                    reason: Some("transient".into()),
                })
            } else {
                Ok(ProcessResult::ok())
            }
        }
    }

    #[tokio::test]
    async fn retry_then_success_resolves_waiter_after_second_attempt() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        harness.registry.register(
            "agent.chat.v1",
            None,
            Arc::new(RetryOnceProcessor {
                calls: calls.clone(),
            }),
            policy(),
        );
        let processor = harness.processor();

        harness
            .queue
            .enqueue("handoff", message("m1", 1, 3), EnqueueOptions::default())
            .await
            .unwrap();
        let waiter = harness.pending_results.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for("m1", crate::pending::WaitOptions::default())
                .await
        });
        tokio::task::yield_now().await;

        let first = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        processor.process_job(first).await;

        let second = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        assert_eq!(second.message.attempt, 2);
        processor.process_job(second).await;

        let result = wait.await.unwrap().unwrap();
        assert!(matches!(result, ProcessResult::Ok { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[derive(Debug)]
    struct AlwaysRetryProcessor;

    #[async_trait]
    impl Processor for AlwaysRetryProcessor {
        async fn process(
            &self,
            _ctx: ProcessorContext,
            _message: HandoffMessage,
        ) -> HandoffResult<ProcessResult> {
            Ok(ProcessResult::Retry {
                delay_ms: 0,
                reason: None,
            })
        }
    }

    #[tokio::test]
    async fn retry_exhausted_dead_letters_and_resolves_dead() {
        let harness = Harness::new();
        harness.registry.register(
            "agent.chat.v1",
            None,
            Arc::new(AlwaysRetryProcessor),
            policy(),
        );
        let processor = harness.processor();

        harness
            .queue
            .enqueue("handoff", message("m1", 1, 2), EnqueueOptions::default())
            .await
            .unwrap();
        let waiter = harness.pending_results.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for("m1", crate::pending::WaitOptions::default())
                .await
        });
        tokio::task::yield_now().await;

        let first = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        processor.process_job(first).await;
        let second = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        assert_eq!(second.message.attempt, 2);
        processor.process_job(second).await;

        let result = wait.await.unwrap().unwrap();
        assert!(matches!(result, ProcessResult::Dead { ref reason } if reason == "Retry exhausted after 2 attempts"));
        assert!(harness
            .queue
            .scan("handoff", &JobState::ALL)
            .await
            .unwrap()
            .is_empty());
    }

    #[derive(Debug)]
    struct ThrowingProcessor;

    #[async_trait]
    impl Processor for ThrowingProcessor {
        async fn process(
            &self,
            _ctx: ProcessorContext,
            _message: HandoffMessage,
        ) -> HandoffResult<ProcessResult> {
            Err(HandoffError::Internal("downstream timeout".into()))
        }
    }

    #[tokio::test]
    async fn thrown_error_final_attempt_dead_letters_and_rejects_waiter() {
        let harness = Harness::new();
        harness
            .registry
            .register("agent.chat.v1", None, Arc::new(ThrowingProcessor), policy());
        let processor = harness.processor();

        harness
            .queue
            .enqueue("handoff", message("m1", 1, 1), EnqueueOptions::default())
            .await
            .unwrap();
        let waiter = harness.pending_results.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for("m1", crate::pending::WaitOptions::default())
                .await
        });
        tokio::task::yield_now().await;

        let job = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        processor.process_job(job).await;

        let result = wait.await.unwrap();
        assert!(matches!(result, Err(HandoffError::Internal(_))));
    }

    #[derive(Debug)]
    struct OutboundProcessor;

    #[async_trait]
    impl Processor for OutboundProcessor {
        async fn process(
            &self,
            _ctx: ProcessorContext,
            _message: HandoffMessage,
        ) -> HandoffResult<ProcessResult> {
            Ok(ProcessResult::Ok {
                outbound: vec![message("m2", 1, 3)],
            })
        }
    }

    #[tokio::test]
    async fn outbound_messages_are_enqueued_on_success() {
        let harness = Harness::new();
        harness
            .registry
            .register("agent.chat.v1", None, Arc::new(OutboundProcessor), policy());
        let processor = harness.processor();

        harness
            .queue
            .enqueue("handoff", message("m1", 1, 3), EnqueueOptions::default())
            .await
            .unwrap();
        let job = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        processor.process_job(job).await;

        let jobs = harness.queue.scan("handoff", &JobState::ALL).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].message.id, "m2");
    }

    #[derive(Debug)]
    struct DeadProcessor;

    #[async_trait]
    impl Processor for DeadProcessor {
        async fn process(
            &self,
            _ctx: ProcessorContext,
            _message: HandoffMessage,
        ) -> HandoffResult<ProcessResult> {
            Ok(ProcessResult::dead("schema mismatch"))
        }
    }

    #[tokio::test]
    async fn processor_returned_dead_is_always_dead_lettered_never_retried() {
        let harness = Harness::new();
        harness
            .registry
            .register("agent.chat.v1", None, Arc::new(DeadProcessor), policy());
        let processor = harness.processor();

        harness
            .queue
            .enqueue("handoff", message("m1", 1, 5), EnqueueOptions::default())
            .await
            .unwrap();
        let waiter = harness.pending_results.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for("m1", crate::pending::WaitOptions::default())
                .await
        });
        tokio::task::yield_now().await;

        let job = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        processor.process_job(job).await;

        let result = wait.await.unwrap().unwrap();
        assert!(matches!(result, ProcessResult::Dead { ref reason } if reason == "schema mismatch"));
        assert!(harness
            .queue
            .scan("handoff", &JobState::ALL)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn canceled_dead_skips_dead_letter_sink() {
        let harness = Harness::new();
        harness.registry.register(
            "agent.chat.v1",
            None,
            Arc::new({
                #[derive(Debug)]
                struct CanceledProcessor;
                #[async_trait]
                impl Processor for CanceledProcessor {
                    async fn process(
                        &self,
                        _ctx: ProcessorContext,
                        _message: HandoffMessage,
                    ) -> HandoffResult<ProcessResult> {
                        Ok(ProcessResult::canceled("Canceled by user"))
                    }
                }
                CanceledProcessor
            }),
            policy(),
        );
        let dead_letter_calls = Arc::new(AtomicUsize::new(0));

        #[derive(Debug)]
        struct CountingSink(Arc<AtomicUsize>);
        #[async_trait]
        impl DeadLetterSink for CountingSink {
            async fn record(&self, _message: &HandoffMessage, _reason: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(
            harness.registry.clone(),
            Arc::new(LocalTaskRegistry::new()),
            harness.cancel_service.clone(),
            harness.pending_results.clone(),
        ));
        let processor = QueueProcessor::new(
            "handoff",
            harness.queue.clone() as Arc<dyn Queue>,
            harness.gateway.clone(),
            dispatcher,
            Arc::new(CountingSink(dead_letter_calls.clone())),
            harness.pending_results.clone(),
            Arc::new(RouteResolver::new()),
            Arc::new(RoutingConfig::empty()),
            4,
        );

        harness
            .queue
            .enqueue("handoff", message("m1", 1, 3), EnqueueOptions::default())
            .await
            .unwrap();
        let job = harness.queue.claim_next("handoff").await.unwrap().unwrap();
        processor.process_job(job).await;

        assert_eq!(dead_letter_calls.load(Ordering::SeqCst), 0);
    }
}
