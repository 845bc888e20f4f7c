//! Local Task Registry (C3): a process-local id-to-closure map letting a
//! queued message carry an opaque unit of in-memory work by id.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;

use futures::future::Future;

use handoff_shared::ProcessResult;

use crate::registry::ProcessorContext;

/// A registered unit of work. Returning `None` means "no opinion", letting
/// the caller's own `ProcessResult` (e.g. from a wrapping processor) stand.
pub type TaskFuture = Pin<Box<dyn Future<Output = Option<ProcessResult>> + Send>>;
pub type TaskClosure = Box<dyn FnOnce(ProcessorContext) -> TaskFuture + Send>;

/// Process-local `taskId -> closure` map. Cleared entirely on shutdown;
/// every method is the single writer of its own entry (`Mutex`-guarded
/// `HashMap`, consistent with the registry's advertised single-writer
/// discipline).
#[derive(Default)]
pub struct LocalTaskRegistry {
    tasks: Mutex<HashMap<String, TaskClosure>>,
}

impl std::fmt::Debug for LocalTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.tasks.lock().unwrap().len();
        f.debug_struct("LocalTaskRegistry")
            .field("registered", &len)
            .finish()
    }
}

impl LocalTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task`, returning a fresh random id.
    pub fn register(&self, task: TaskClosure) -> String {
        let task_id = uuid::Uuid::now_v7().to_string();
        self.tasks.lock().unwrap().insert(task_id.clone(), task);
        task_id
    }

    /// Atomically remove and return the closure for `task_id`, if present.
    pub fn take(&self, task_id: &str) -> Option<TaskClosure> {
        self.tasks.lock().unwrap().remove(task_id)
    }

    /// Idempotent removal with no return value, used by cleanup paths that
    /// don't intend to run the closure (e.g. `StopCommand`).
    pub fn remove(&self, task_id: &str) {
        self.tasks.lock().unwrap().remove(task_id);
    }

    /// Drop every registered task, called on process shutdown.
    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
