//! Cancel Service (C7): in-process abort registry plus pub/sub subscription
//! for cross-instance cancellation.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use handoff_shared::{Broker, CancelPayload, CANCEL_CHANNEL};

/// Canonical "canceled by user" reason used when no explicit reason is
/// supplied.
pub const DEFAULT_CANCEL_REASON: &str = "Canceled by user";

/// Maintains `messageId -> CancellationToken` and `messageId -> reason`, and
/// mirrors cancel requests across instances via the broker. The reason map
/// outlives the controller entry it was cancelled from, so a dispatcher
/// racing the cancel can still read back why its token was tripped; callers
/// consume it once via [`CancelService::take_reason`].
#[derive(Debug)]
pub struct CancelService {
    broker: Arc<dyn Broker>,
    controllers: DashMap<String, CancellationToken>,
    reasons: DashMap<String, String>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl CancelService {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            controllers: DashMap::new(),
            reasons: DashMap::new(),
            subscriber: Mutex::new(None),
        }
    }

    /// Subscribe to the cross-instance cancel channel. Call once at startup.
    pub async fn start(self: &Arc<Self>) {
        let mut receiver = match self.broker.subscribe(CANCEL_CHANNEL).await {
            Ok(receiver) => receiver,
            Err(error) => {
                tracing::warn!(%error, "failed to subscribe to cancel channel, degrading to local-only cancel");
                return;
            }
        };
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => match serde_json::from_str::<CancelPayload>(&payload) {
                        Ok(cancel) => {
                            this.apply_cancel(&cancel.message_ids, cancel.reason.as_deref());
                        }
                        Err(error) => {
                            tracing::warn!(%error, %payload, "dropping malformed cancel payload");
                        }
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.subscriber.lock().unwrap() = Some(handle);
    }

    /// Unsubscribe and stop the background listener.
    pub fn shutdown(&self) {
        if let Some(handle) = self.subscriber.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Register a fresh token for `message_id`; idempotent (overwrites a
    /// stale entry from a prior, already-finished attempt with the same id).
    pub fn register(&self, message_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.controllers
            .insert(message_id.to_string(), token.clone());
        token
    }

    /// Idempotent: unregistering an id with no entry is a no-op. Does not
    /// touch a stored cancel reason — that is consumed separately via
    /// [`Self::take_reason`].
    pub fn unregister(&self, message_id: &str) {
        self.controllers.remove(message_id);
    }

    /// Non-destructive peek at the canonical reason stored for `message_id`.
    pub fn reason_for(&self, message_id: &str) -> Option<String> {
        self.reasons.get(message_id).map(|r| r.clone())
    }

    /// Remove and return the canonical reason stored for `message_id`.
    pub fn take_reason(&self, message_id: &str) -> Option<String> {
        self.reasons.remove(message_id).map(|(_, reason)| reason)
    }

    /// Dedup `ids`, build the canonical `canceled:<reason>` string, publish
    /// to the broker, then apply the cancel locally. Returns the ids that
    /// were locally registered (and thus actually aborted).
    pub async fn cancel_messages(&self, ids: &[String], reason: Option<&str>) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();
        if deduped.is_empty() {
            return vec![];
        }

        let reason = reason.unwrap_or(DEFAULT_CANCEL_REASON).to_string();
        let payload = CancelPayload {
            message_ids: deduped.clone(),
            reason: Some(reason.clone()),
        };
        if let Ok(body) = serde_json::to_string(&payload) {
            if let Err(error) = self.broker.publish(CANCEL_CHANNEL, &body).await {
                tracing::warn!(%error, "failed to publish cancel event");
            }
        }

        self.apply_cancel(&deduped, Some(&reason))
    }

    /// For each id with a live controller: store the canonical reason,
    /// cancel the token if not already canceled, remove the controller.
    /// Returns the ids that actually had a controller to abort.
    pub fn apply_cancel(&self, ids: &[String], reason: Option<&str>) -> Vec<String> {
        let canonical = format!(
            "{}{}",
            handoff_shared::CANCELED_PREFIX,
            reason.unwrap_or(DEFAULT_CANCEL_REASON)
        );
        let mut aborted = Vec::new();
        for id in ids {
            if let Some((_, token)) = self.controllers.remove(id) {
                self.reasons.insert(id.clone(), canonical.clone());
                if !token.is_cancelled() {
                    token.cancel();
                }
                aborted.push(id.clone());
            }
        }
        aborted
    }

    /// Snapshot of ids currently registered, used by tests and diagnostics.
    pub fn registered_ids(&self) -> Vec<String> {
        self.controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_shared::InMemoryBroker;

    #[tokio::test]
    async fn register_then_cancel_aborts_token() {
        let service = CancelService::new(Arc::new(InMemoryBroker::new()));
        let token = service.register("m1");
        let aborted = service.cancel_messages(&["m1".to_string()], None).await;
        assert_eq!(aborted, vec!["m1".to_string()]);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_messages_dedupes_ids() {
        let service = CancelService::new(Arc::new(InMemoryBroker::new()));
        service.register("m1");
        let aborted = service
            .cancel_messages(&["m1".to_string(), "m1".to_string()], None)
            .await;
        assert_eq!(aborted, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let service = CancelService::new(Arc::new(InMemoryBroker::new()));
        service.unregister("missing");
        service.unregister("missing");
    }

    #[tokio::test]
    async fn apply_cancel_stores_reason_readable_after_controller_removed() {
        let service = CancelService::new(Arc::new(InMemoryBroker::new()));
        service.register("m1");
        service.apply_cancel(&["m1".to_string()], Some("timed out"));
        assert_eq!(
            service.reason_for("m1"),
            Some("canceled:timed out".to_string())
        );
        assert_eq!(
            service.take_reason("m1"),
            Some("canceled:timed out".to_string())
        );
        assert!(service.reason_for("m1").is_none());
    }

    #[tokio::test]
    async fn cross_instance_cancel_applies_locally() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = Arc::new(CancelService::new(broker.clone()));
        service.start().await;
        let token = service.register("m1");

        let payload = CancelPayload {
            message_ids: vec!["m1".to_string()],
            reason: Some("remote stop".to_string()),
        };
        broker
            .publish(CANCEL_CHANNEL, &serde_json::to_string(&payload).unwrap())
            .await
            .unwrap();

        for _ in 0..50 {
            if token.is_cancelled() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(token.is_cancelled());
        service.shutdown();
    }
}
