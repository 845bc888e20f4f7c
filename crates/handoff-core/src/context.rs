//! System context: wires every component into one runnable bus instance.
//! Construction never fails — a missing routing config file degrades to
//! [`RoutingConfig::empty`] rather than aborting startup.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use handoff_shared::config::ConcurrencyEnv;
use handoff_shared::resilience::CircuitBreakerConfig;
use handoff_shared::{
    Broker, CircuitBreakerBroker, InMemoryBroker, InMemoryQueue, Queue, RoutingConfig,
};

use crate::cancel::CancelService;
use crate::dead_letter::{DeadLetterSink, LoggingDeadLetterSink};
use crate::dispatcher::Dispatcher;
use crate::lock::{DistributedLock, InMemoryDistributedLock};
use crate::pending::PendingResults;
use crate::queue_gateway::QueueGateway;
use crate::queue_processor::QueueProcessor;
use crate::registry::ProcessorRegistry;
use crate::route_resolver::RouteResolver;
use crate::service::QueueService;
use crate::stop::StopCommand;
use crate::task_registry::LocalTaskRegistry;
use crate::triggers::{PublishCommand, TriggerProviderRegistry};

/// The four backend queues every deployment serves, each with its own
/// worker-pool concurrency env var.
const WELL_KNOWN_QUEUES: &[(&str, &str)] = &[
    ("handoff", ConcurrencyEnv::DISPATCHER),
    ("handoff:realtime", ConcurrencyEnv::REALTIME),
    ("handoff:batch", ConcurrencyEnv::BATCH),
    ("handoff:integration", ConcurrencyEnv::INTEGRATION),
];

/// Assembles the registries, gateway, dispatcher, per-queue worker pools and
/// public façades that make up one running bus instance.
#[derive(Debug)]
pub struct HandoffContext {
    pub processor_registry: Arc<ProcessorRegistry>,
    pub local_tasks: Arc<LocalTaskRegistry>,
    pub cancel_service: Arc<CancelService>,
    pub pending_results: Arc<PendingResults>,
    pub routing_config: Arc<RoutingConfig>,
    pub route_resolver: Arc<RouteResolver>,
    pub gateway: Arc<QueueGateway>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue_service: Arc<QueueService>,
    pub stop_command: Arc<StopCommand>,
    pub trigger_providers: Arc<TriggerProviderRegistry>,
    pub publish_command: Arc<PublishCommand>,
    pub lock: Arc<dyn DistributedLock>,
    queue_processors: Vec<Arc<QueueProcessor>>,
    shutdown: CancellationToken,
}

impl HandoffContext {
    /// Build a context backed by in-process queue and broker implementations
    /// and the routing config found at `HANDOFF_ROUTING_CONFIG_PATH` relative
    /// to `server_root` (or an empty, defaults-only config if unset). The
    /// broker is wrapped in a circuit breaker so cross-instance cancel/
    /// trigger traffic fails fast instead of piling up once the transport is
    /// unhealthy.
    pub fn bootstrap(server_root: &Path) -> Self {
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let broker: Arc<dyn Broker> = Arc::new(CircuitBreakerBroker::new(
            Arc::new(InMemoryBroker::new()),
            CircuitBreakerConfig::default(),
        ));
        let routing_config = Arc::new(RoutingConfig::load_from_env(server_root));
        let dead_letter: Arc<dyn DeadLetterSink> = Arc::new(LoggingDeadLetterSink);
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryDistributedLock::new());
        Self::new(queue, broker, routing_config, dead_letter, lock)
    }

    pub fn new(
        queue: Arc<dyn Queue>,
        broker: Arc<dyn Broker>,
        routing_config: Arc<RoutingConfig>,
        dead_letter: Arc<dyn DeadLetterSink>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        let processor_registry = Arc::new(ProcessorRegistry::new());
        let local_tasks = Arc::new(LocalTaskRegistry::new());
        let cancel_service = Arc::new(CancelService::new(broker));
        let pending_results = Arc::new(PendingResults::new());
        let route_resolver = Arc::new(RouteResolver::new());
        let gateway = Arc::new(QueueGateway::new(queue.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            processor_registry.clone(),
            local_tasks.clone(),
            cancel_service.clone(),
            pending_results.clone(),
        ));

        let queue_processors = WELL_KNOWN_QUEUES
            .iter()
            .map(|(queue_name, env_var)| {
                Arc::new(QueueProcessor::new(
                    *queue_name,
                    queue.clone(),
                    gateway.clone(),
                    dispatcher.clone(),
                    dead_letter.clone(),
                    pending_results.clone(),
                    route_resolver.clone(),
                    routing_config.clone(),
                    ConcurrencyEnv::read(env_var),
                ))
            })
            .collect();

        let queue_service = Arc::new(QueueService::new(
            gateway.clone(),
            route_resolver.clone(),
            routing_config.clone(),
            pending_results.clone(),
        ));

        let stop_command = Arc::new(StopCommand::new(
            gateway.clone(),
            cancel_service.clone(),
            pending_results.clone(),
            local_tasks.clone(),
        ));

        let trigger_providers = Arc::new(TriggerProviderRegistry::new());
        let publish_command = Arc::new(PublishCommand::new(
            trigger_providers.clone(),
            queue_service.clone(),
        ));

        Self {
            processor_registry,
            local_tasks,
            cancel_service,
            pending_results,
            routing_config,
            route_resolver,
            gateway,
            dispatcher,
            queue_service,
            stop_command,
            trigger_providers,
            publish_command,
            lock,
            queue_processors,
            shutdown: CancellationToken::new(),
        }
    }

    /// Subscribe the cancel service to cross-instance cancellation and spawn
    /// one worker-pool task per well-known queue. Idempotent cancellation of
    /// the returned handles is via [`Self::shutdown`].
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        self.cancel_service.start().await;
        self.queue_processors
            .iter()
            .cloned()
            .map(|processor| processor.spawn(self.shutdown.clone()))
            .collect()
    }

    /// Signal every spawned worker-pool loop to stop polling and drop
    /// in-flight local task state.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_service.shutdown();
        self.local_tasks.clear();
    }

    pub fn queue_processors(&self) -> &[Arc<QueueProcessor>] {
        &self.queue_processors
    }
}
