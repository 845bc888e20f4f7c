pub mod broker;
pub mod queue;

pub use broker::{
    Broker, BrokerError, CancelPayload, CircuitBreakerBroker, InMemoryBroker, CANCEL_CHANNEL,
};
pub use queue::{EnqueueOptions, InMemoryQueue, Job, JobId, JobState, Queue, QueueError};
