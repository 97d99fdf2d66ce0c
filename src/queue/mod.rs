//! Background task queue: fire-and-forget job submission with retries.
//!
//! Producers hold an `Arc<dyn TaskSubmitter>`. The in-process implementation
//! ([`LocalQueue`]) feeds an mpsc channel drained by [`run_worker`], which
//! hands each job to a [`JobHandler`] and retries failed deliveries with a
//! linear backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::Id;

/// Entry points the queue can invoke. Each is safe to re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    ExecuteSingleRun { run_id: Id },
    RunScheduledBatch { schedule_id: Id },
    ProcessDueEvents,
    SyncRepository { repository_id: Id },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
}

pub trait TaskSubmitter: Send + Sync {
    fn submit(&self, job: Job) -> Result<JobHandle, QueueError>;
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct Envelope {
    pub handle: JobHandle,
    pub job: Job,
}

/// Submitter backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl LocalQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskSubmitter for LocalQueue {
    fn submit(&self, job: Job) -> Result<JobHandle, QueueError> {
        let handle = JobHandle { id: Uuid::new_v4() };
        debug!(job_id = %handle.id, ?job, "job submitted");
        self.tx
            .send(Envelope { handle, job })
            .map_err(|_| QueueError::Closed)?;
        Ok(handle)
    }
}

/// Keeps submitted jobs in memory without running them.
///
/// Used by one-shot CLI commands, where nothing drains a queue.
#[derive(Default)]
pub struct RecordingSubmitter {
    jobs: Mutex<Vec<Job>>,
}

impl RecordingSubmitter {
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl TaskSubmitter for RecordingSubmitter {
    fn submit(&self, job: Job) -> Result<JobHandle, QueueError> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).push(job);
        Ok(JobHandle { id: Uuid::new_v4() })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Jobs handled at once.
    pub concurrency: usize,
}

/// Drain `rx` until every sender is dropped.
pub async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
) {
    info!(concurrency = policy.concurrency, max_attempts = policy.max_attempts, "queue worker started");
    let slots = Arc::new(Semaphore::new(policy.concurrency.max(1)));

    while let Some(envelope) = rx.recv().await {
        let permit = match slots.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            deliver(handler.as_ref(), &envelope, policy).await;
        });
    }
    info!("queue worker stopped");
}

async fn deliver(handler: &dyn JobHandler, envelope: &Envelope, policy: RetryPolicy) -> bool {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match handler.handle(&envelope.job).await {
            Ok(()) => {
                debug!(job_id = %envelope.handle.id, attempt, "job done");
                return true;
            }
            Err(e) if attempt < attempts => {
                warn!(job_id = %envelope.handle.id, attempt, error = %e, "job failed, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => {
                error!(job_id = %envelope.handle.id, attempt, job = ?envelope.job, error = %e, "job failed permanently");
            }
        }
    }
    false
}
