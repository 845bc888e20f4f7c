//! Shared data model, configuration, messaging abstractions, and resilience
//! primitives used by the handoff message bus.

pub mod config;
pub mod error;
pub mod message;
pub mod messaging;
pub mod naming;
pub mod resilience;

pub use config::{RoutingConfig, ROUTING_CONFIG_PATH_ENV};
pub use error::{HandoffError, HandoffResult, RoutingConfigError};
pub use message::{
    HandoffMessage, NewMessage, ProcessResult, ProcessorPolicy, CANCELED_PREFIX,
    HEADER_CONVERSATION_ID, HEADER_HANDOFF_QUEUE, HEADER_INTEGRATION_ID, HEADER_LANGUAGE,
    HEADER_ORGANIZATION_ID, HEADER_POLICY_TIMEOUT_MS, HEADER_REQUESTED_LANE, HEADER_SOURCE,
    HEADER_THREAD_ID, HEADER_USER_ID, PAYLOAD_EXECUTION_ID, PAYLOAD_TASK_ID,
};
pub use messaging::{
    Broker, BrokerError, CancelPayload, CircuitBreakerBroker, EnqueueOptions, InMemoryBroker,
    InMemoryQueue, Job, JobId, JobState, Queue, QueueError, CANCEL_CHANNEL,
};
pub use resilience::{
    CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig, CircuitBreakerMetrics,
    CircuitState, MetricsCollector, TracingMetricsCollector,
};
