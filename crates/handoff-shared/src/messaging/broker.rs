//! # Abstract Pub/Sub Broker
//!
//! The pub/sub transport is an external collaborator, abstracted here as
//! "abstract Broker with publish/subscribe". This module is that
//! abstraction plus an in-memory implementation (single-process deployments
//! degrade to local-only cancel) and a realistic cross-instance transport
//! built on `redis`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::resilience::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};

/// Channel name for cross-instance cancel notifications.
pub const CANCEL_CHANNEL: &str = "ai:handoff:cancel";

/// Wire payload published on [`CANCEL_CHANNEL`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPayload {
    pub message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Abstract fire-and-forget pub/sub transport.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribe to `channel`; returns a receiver of raw payload strings.
    /// Subscribers must tolerate malformed frames (warn + drop), handled by
    /// the caller (`CancelService`), not by the broker itself.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, BrokerError>;
}

/// In-memory broker for single-process deployments and tests. Publishing
/// with no subscribers is not an error (fire-and-forget semantics).
#[derive(Debug)]
pub struct InMemoryBroker {
    sender: broadcast::Sender<(String, String)>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        // A send error here only means there are currently no receivers,
        // which is not a publish failure for fire-and-forget semantics.
        let _ = self.sender.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, BrokerError> {
        let mut inbound = self.sender.subscribe();
        let (forward_tx, forward_rx) = broadcast::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok((ch, payload)) if ch == channel => {
                        let _ = forward_tx.send(payload);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(forward_rx)
    }
}

/// Wraps any [`Broker`] with a [`CircuitBreaker`]: once publish/subscribe
/// failures cross the threshold, calls fail fast with [`BrokerError`]
/// instead of waiting on (or retrying into) a broker that is down.
#[derive(Debug)]
pub struct CircuitBreakerBroker {
    inner: Arc<dyn Broker>,
    breaker: CircuitBreaker,
}

impl CircuitBreakerBroker {
    pub fn new(inner: Arc<dyn Broker>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new("broker".to_string(), config),
        }
    }

    pub fn metrics(&self) -> crate::resilience::CircuitBreakerMetrics {
        self.breaker.metrics()
    }
}

#[async_trait]
impl Broker for CircuitBreakerBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        if !self.breaker.should_allow() {
            return Err(BrokerError::Publish(format!(
                "circuit open for broker, failing fast on channel {channel}"
            )));
        }
        let started = Instant::now();
        let result = self.inner.publish(channel, payload).await;
        match &result {
            Ok(()) => self.breaker.record_success(started.elapsed()),
            Err(_) => self.breaker.record_failure(started.elapsed()),
        }
        result
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, BrokerError> {
        if !self.breaker.should_allow() {
            return Err(BrokerError::Subscribe(format!(
                "circuit open for broker, failing fast on channel {channel}"
            )));
        }
        let started = Instant::now();
        let result = self.inner.subscribe(channel).await;
        match &result {
            Ok(_) => self.breaker.record_success(started.elapsed()),
            Err(_) => self.breaker.record_failure(started.elapsed()),
        }
        result
    }
}

#[cfg(feature = "redis-broker")]
pub mod redis_broker {
    //! Redis-backed `Broker`, the realistic cross-instance transport for
    //! production deployments (teacher declares `redis` as a workspace
    //! dependency; this is the same crate used the same way).

    use super::*;
    use redis::AsyncCommands;

    #[derive(Debug)]
    pub struct RedisBroker {
        client: redis::Client,
    }

    impl RedisBroker {
        pub fn new(redis_url: &str) -> Result<Self, BrokerError> {
            let client =
                redis::Client::open(redis_url).map_err(|e| BrokerError::Subscribe(e.to_string()))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl Broker for RedisBroker {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
            let _: () = conn
                .publish(channel, payload)
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
            Ok(())
        }

        async fn subscribe(
            &self,
            channel: &str,
        ) -> Result<broadcast::Receiver<String>, BrokerError> {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

            let (forward_tx, forward_rx) = broadcast::channel(256);
            tokio::spawn(async move {
                use futures::StreamExt;
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    if let Ok(payload) = msg.get_payload::<String>() {
                        let _ = forward_tx.send(payload);
                    }
                }
            });
            Ok(forward_rx)
        }
    }
}
