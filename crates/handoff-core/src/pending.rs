//! Pending Result Rendezvous (C9): an id-keyed table letting a synchronous
//! caller wait on a message that may be executed by a remote worker.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use handoff_shared::{HandoffError, HandoffResult, ProcessResult};

pub type EventListener = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Per-call options for [`PendingResults::wait_for`].
#[derive(Default)]
pub struct WaitOptions {
    pub timeout_ms: Option<u64>,
    pub on_event: Option<EventListener>,
}

struct Waiter {
    sender: oneshot::Sender<HandoffResult<ProcessResult>>,
    on_event: Option<EventListener>,
}

/// Id-keyed table of single-use completion channels. Each map method is the
/// single writer of its own entry; a second waiter registered for an id
/// already awaited is rejected rather than silently replacing the first.
#[derive(Debug, Default)]
pub struct PendingResults {
    waiters: DashMap<String, Waiter>,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter").finish()
    }
}

impl PendingResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronously register a waiter for `id`, returning the receiver half
    /// to be awaited separately. Lets a caller (e.g. the queue service
    /// façade) guarantee the waiter exists before enqueuing the message it
    /// waits on, without racing a spawned task's first poll.
    pub fn register(
        &self,
        id: &str,
        on_event: Option<EventListener>,
    ) -> HandoffResult<oneshot::Receiver<HandoffResult<ProcessResult>>> {
        let (sender, receiver) = oneshot::channel();
        match self.waiters.entry(id.to_string()) {
            Entry::Occupied(_) => Err(HandoffError::DuplicateWaiter(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Waiter { sender, on_event });
                Ok(receiver)
            }
        }
    }

    /// Register a waiter for `id` and block until resolved, rejected, or
    /// timed out. A second concurrent waiter for the same id fails
    /// immediately with [`HandoffError::DuplicateWaiter`].
    pub async fn wait_for(&self, id: &str, options: WaitOptions) -> HandoffResult<ProcessResult> {
        let receiver = self.register(id, options.on_event)?;

        let recv = async {
            receiver.await.map_err(|_| {
                HandoffError::Internal(format!("waiter for {id} dropped without resolution"))
            })?
        };

        match options.timeout_ms {
            None => recv.await,
            Some(timeout_ms) => {
                let duration = Duration::from_millis(timeout_ms);
                match tokio::time::timeout(duration, recv).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.waiters.remove(id);
                        Err(HandoffError::Timeout(duration))
                    }
                }
            }
        }
    }

    pub fn resolve(&self, id: &str, result: ProcessResult) {
        if let Some((_, waiter)) = self.waiters.remove(id) {
            let _ = waiter.sender.send(Ok(result));
        }
    }

    pub fn reject(&self, id: &str, error: HandoffError) {
        if let Some((_, waiter)) = self.waiters.remove(id) {
            let _ = waiter.sender.send(Err(error));
        }
    }

    /// Forward `event` synchronously to the waiter's listener, if any.
    pub fn publish(&self, id: &str, event: serde_json::Value) {
        if let Some(waiter) = self.waiters.get(id) {
            if let Some(on_event) = &waiter.on_event {
                on_event(event);
            }
        }
    }

    /// Equivalent to resolving with a canceled `dead` result.
    pub fn cancel(&self, id: &str, reason: String) {
        self.resolve(id, ProcessResult::Dead { reason });
    }

    pub fn is_waiting(&self, id: &str) -> bool {
        self.waiters.contains_key(id)
    }
}
