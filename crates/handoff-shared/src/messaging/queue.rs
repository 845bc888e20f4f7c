//! # Abstract Queue Backend
//!
//! The durable queue backend is an external collaborator, abstracted here
//! as "an abstract Queue with enqueue, scan-by-state, and remove operations".
//! This module is that abstraction: a `Queue` trait plus an in-memory
//! implementation used for local bootstrapping and tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::HandoffMessage;

/// States a queued job can be observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Delayed,
    Paused,
    Active,
}

impl JobState {
    /// The default scan set used by `findJobs`/`QueueGateway::find_jobs`.
    pub const ALL: [JobState; 4] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Paused,
        JobState::Active,
    ];

    /// The subset `StopCommand` treats as still-queued (removable outright).
    pub const QUEUED: [JobState; 3] = [JobState::Waiting, JobState::Delayed, JobState::Paused];
}

/// Opaque handle identifying one enqueued job within a backend queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

/// A single backing job as the Queue Gateway sees it.
#[derive(Debug)]
pub struct Job {
    pub job_id: JobId,
    pub state: JobState,
    pub message: HandoffMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("job not found: {0:?}")]
    JobNotFound(JobId),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Per-enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay_ms: Option<u64>,
}

/// Abstract durable queue backend.
///
/// A concrete implementation would be PGMQ/SQS/BullMQ-equivalent; this trait
/// is the seam the rest of the bus depends on so the real backend stays an
/// external collaborator.
#[async_trait]
pub trait Queue: Send + Sync + std::fmt::Debug {
    /// Append a job tagged with the dispatch-job name; semantically
    /// `removeOnComplete=true, removeOnFail=false` (the gateway/processor own
    /// honoring that by always calling `remove` explicitly on success paths
    /// and leaving failed jobs for dead-letter/retry bookkeeping).
    async fn enqueue(
        &self,
        queue_name: &str,
        message: HandoffMessage,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError>;

    /// Scan jobs in `states` across this queue.
    async fn scan(&self, queue_name: &str, states: &[JobState]) -> Result<Vec<Job>, QueueError>;

    /// Remove a job from this queue. Idempotent: removing an already-removed
    /// job is not an error.
    async fn remove(&self, queue_name: &str, job_id: &JobId) -> Result<(), QueueError>;

    /// Names of all queues this backend manages (used by `findJobs`'s
    /// all-queues scan in `QueueGateway`).
    fn queue_names(&self) -> Vec<String>;

    /// Atomically claim the next waiting job in `queue_name`, transitioning
    /// it to `Active` and returning it. Delay/scheduling of `Delayed` jobs
    /// into `Waiting` is the backend's own concern and is not modeled here.
    async fn claim_next(&self, queue_name: &str) -> Result<Option<Job>, QueueError>;
}

/// In-memory `Queue` implementation for local bootstrapping and tests.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    jobs: Mutex<std::collections::HashMap<String, VecDeque<Job>>>,
    next_id: Mutex<u64>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> JobId {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        JobId(next.to_string())
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        message: HandoffMessage,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let job_id = self.fresh_id();
        let state = if options.delay_ms.unwrap_or(0) > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let job = Job {
            job_id: job_id.clone(),
            state,
            message,
        };
        self.jobs
            .lock()
            .unwrap()
            .entry(queue_name.to_string())
            .or_default()
            .push_back(job);
        Ok(job_id)
    }

    async fn scan(&self, queue_name: &str, states: &[JobState]) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.lock().unwrap();
        let Some(queue) = jobs.get(queue_name) else {
            return Ok(vec![]);
        };
        Ok(queue
            .iter()
            .filter(|job| states.contains(&job.state))
            .cloned()
            .collect())
    }

    async fn remove(&self, queue_name: &str, job_id: &JobId) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(queue) = jobs.get_mut(queue_name) {
            queue.retain(|job| &job.job_id != job_id);
        }
        Ok(())
    }

    fn queue_names(&self) -> Vec<String> {
        self.jobs.lock().unwrap().keys().cloned().collect()
    }

    async fn claim_next(&self, queue_name: &str) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(queue) = jobs.get_mut(queue_name) else {
            return Ok(None);
        };
        let Some(position) = queue.iter().position(|job| job.state == JobState::Waiting) else {
            return Ok(None);
        };
        let job = &mut queue[position];
        job.state = JobState::Active;
        Ok(Some(job.clone()))
    }
}

impl Clone for Job {
    fn clone(&self) -> Self {
        Self {
            job_id: self.job_id.clone(),
            state: self.state,
            message: self.message.clone(),
        }
    }
}

/// Mark a job active, used by tests simulating an in-flight processor pickup.
impl InMemoryQueue {
    pub async fn mark_active(&self, queue_name: &str, job_id: &JobId) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(queue) = jobs.get_mut(queue_name) {
            for job in queue.iter_mut() {
                if &job.job_id == job_id {
                    job.state = JobState::Active;
                }
            }
        }
    }
}
