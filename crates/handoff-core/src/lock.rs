//! Distributed lock (supports C14): a short-TTL mutual-exclusion primitive
//! so bootstrap recovery and trigger publish never run twice concurrently
//! for the same target. Never blocks waiting for the lock — callers that
//! fail to acquire must skip.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Opaque handle returned on successful acquisition; must be passed back to
/// `release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle(String);

#[async_trait]
pub trait DistributedLock: Send + Sync + std::fmt::Debug {
    /// Attempt to acquire `key` for `ttl`. Returns `None` immediately if
    /// already held (and not expired) rather than waiting.
    async fn acquire(&self, key: &str, ttl: Duration) -> Option<LockHandle>;

    /// Release a previously acquired lock. A mismatched or already-expired
    /// handle is a no-op.
    async fn release(&self, key: &str, handle: &LockHandle);
}

#[derive(Debug)]
struct Entry {
    handle: LockHandle,
    expires_at: Instant,
}

/// In-memory TTL lock for single-instance bootstrapping and tests. A real
/// deployment would back this with a shared store (e.g. Redis `SET NX PX`);
/// this implementation only enforces mutual exclusion within one process.
#[derive(Debug, Default)]
pub struct InMemoryDistributedLock {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryDistributedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Option<LockHandle> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return None;
            }
        }
        let handle = LockHandle(uuid::Uuid::now_v7().to_string());
        entries.insert(
            key.to_string(),
            Entry {
                handle: handle.clone(),
                expires_at: now + ttl,
            },
        );
        Some(handle)
    }

    async fn release(&self, key: &str, handle: &LockHandle) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key) {
            if &existing.handle == handle {
                entries.remove(key);
            }
        }
    }
}
