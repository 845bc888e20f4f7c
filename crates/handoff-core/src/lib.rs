//! Handoff message bus core: routes typed messages to queues and lanes,
//! dispatches them to registered processors under cooperative cancellation,
//! applies retry/dead-letter policy, and lets producers optionally block on
//! the outcome.

pub mod cancel;
pub mod context;
pub mod dead_letter;
pub mod dispatcher;
pub mod lock;
pub mod pending;
pub mod queue_gateway;
pub mod queue_processor;
pub mod registry;
pub mod route_resolver;
pub mod service;
pub mod stop;
pub mod task_registry;
pub mod triggers;

pub use cancel::CancelService;
pub use context::HandoffContext;
pub use dead_letter::{DeadLetterSink, LoggingDeadLetterSink};
pub use dispatcher::Dispatcher;
pub use lock::{DistributedLock, InMemoryDistributedLock, LockHandle};
pub use pending::PendingResults;
pub use queue_gateway::{JobMatch, QueueGateway, QueueStats};
pub use queue_processor::QueueProcessor;
pub use registry::{Processor, ProcessorContext, ProcessorMetadata, ProcessorRegistry, ResolvedProcessor};
pub use route_resolver::{ResolvedRoute, RouteResolver};
pub use service::{CallerContext, EnqueueAndWaitOptions, Operation, QueueService};
pub use stop::{NotFound, StopCommand, StopRequest, StopSummary};
pub use task_registry::LocalTaskRegistry;
pub use triggers::{
    make_trigger_callback, BootstrapDirective, BootstrapMode, BootstrapRecovery, BootstrapSummary,
    Graph, PublishCommand, PublishSummary, PublishedTargetSource, Trigger, TriggerCallback,
    TriggerCallbackPayload, TriggerError, TriggerProvider, TriggerProviderRegistry,
};
