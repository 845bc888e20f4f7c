//! Queue Gateway (C6): multi-queue convenience operations layered over the
//! abstract [`Queue`] backend — enqueue, enqueueMany, findJobs, removeJobs.

use std::sync::Arc;

use handoff_shared::{EnqueueOptions, HandoffMessage, Job, JobId, JobState, Queue, QueueError};

/// One job located by [`QueueGateway::find_jobs`], identified by the queue
/// it lives in alongside its backend state and job handle.
#[derive(Debug, Clone)]
pub struct JobMatch {
    pub queue_name: String,
    pub job: Job,
}

/// A point-in-time health snapshot for one backend queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_name: String,
    pub message_count: usize,
}

#[derive(Debug)]
pub struct QueueGateway {
    queue: Arc<dyn Queue>,
}

impl QueueGateway {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self { queue }
    }

    pub async fn enqueue(
        &self,
        queue_name: &str,
        message: HandoffMessage,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.queue.enqueue(queue_name, message, options).await
    }

    /// Sequential enqueue preserving input order.
    pub async fn enqueue_many(
        &self,
        items: Vec<(String, HandoffMessage, EnqueueOptions)>,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut ids = Vec::with_capacity(items.len());
        for (queue_name, message, options) in items {
            ids.push(self.enqueue(&queue_name, message, options).await?);
        }
        Ok(ids)
    }

    /// Scan every known queue in `states` (default: all four job states) and
    /// return matches satisfying `predicate`.
    pub async fn find_jobs(
        &self,
        states: &[JobState],
        predicate: impl Fn(&HandoffMessage) -> bool,
    ) -> Vec<JobMatch> {
        let mut matches = Vec::new();
        for queue_name in self.queue.queue_names() {
            let Ok(jobs) = self.queue.scan(&queue_name, states).await else {
                continue;
            };
            for job in jobs {
                if predicate(&job.message) {
                    matches.push(JobMatch {
                        queue_name: queue_name.clone(),
                        job,
                    });
                }
            }
        }
        matches
    }

    /// Remove each match's backing job. Per-job failures are logged and
    /// skipped, never aborting the batch; returns the successfully removed
    /// matches.
    pub async fn remove_jobs(&self, matches: Vec<JobMatch>) -> Vec<JobMatch> {
        let mut removed = Vec::with_capacity(matches.len());
        for job_match in matches {
            match self
                .queue
                .remove(&job_match.queue_name, &job_match.job.job_id)
                .await
            {
                Ok(()) => removed.push(job_match),
                Err(error) => {
                    tracing::warn!(
                        queue = %job_match.queue_name,
                        job_id = ?job_match.job.job_id,
                        %error,
                        "failed to remove job, skipping"
                    );
                }
            }
        }
        removed
    }

    /// Waiting/delayed/paused/active job count for `queue_name`. An unknown
    /// or unreachable queue reports zero rather than failing the caller.
    pub async fn stats(&self, queue_name: &str) -> QueueStats {
        let message_count = self
            .queue
            .scan(queue_name, &JobState::ALL)
            .await
            .map(|jobs| jobs.len())
            .unwrap_or(0);
        QueueStats {
            queue_name: queue_name.to_string(),
            message_count,
        }
    }
}
