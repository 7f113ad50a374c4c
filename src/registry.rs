//! Job Registry: the one place that knows which jobs have a live worker.
//!
//! Every operation takes the same mutex, so for a given job id start, stop
//! and status queries never interleave. Starting a job only registers it and
//! launches its supervisor task; nothing here waits on a worker except
//! `stop_job`, which waits (bounded) for reconciliation to finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DatabaseError, JobError, Result};
use crate::job::{Job, JobSpec, JobStatus};
use crate::store::JobStore;
use crate::supervisor::Supervisor;

/// Extra time `stop_job` allows beyond the grace period for reconciliation.
const STOP_SLACK: Duration = Duration::from_secs(5);

/// Handle to a job with a live supervisor.
struct ActiveJob {
    status: JobStatus,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Concurrency-safe map of job id to active supervisor.
pub struct JobRegistry {
    supervisor: Arc<Supervisor>,
    store: Arc<dyn JobStore>,
    max_parallel_jobs: usize,
    grace_period: Duration,
    jobs: Arc<Mutex<HashMap<Uuid, ActiveJob>>>,
}

impl JobRegistry {
    pub fn new(supervisor: Arc<Supervisor>, store: Arc<dyn JobStore>) -> Self {
        let config = supervisor.config();
        Self {
            max_parallel_jobs: config.max_parallel_jobs,
            grace_period: config.grace_period,
            supervisor,
            store,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a worker for `spec`. Returns `false` without spawning anything
    /// when the job already has a live worker.
    pub async fn start_job(&self, spec: JobSpec) -> Result<bool> {
        let job_id = spec.id;
        let mut jobs = self.jobs.lock().await;

        if jobs.contains_key(&job_id) {
            tracing::info!(job_id = %job_id, "Job already running, not starting");
            return Ok(false);
        }
        if jobs.len() >= self.max_parallel_jobs {
            return Err(JobError::MaxJobsExceeded {
                max: self.max_parallel_jobs,
            }
            .into());
        }

        match self.store.get_job(job_id).await? {
            Some(job) => {
                if !job.status.can_transition_to(JobStatus::Running) {
                    tracing::warn!(job_id = %job_id, status = %job.status, "Replacing stale job status");
                }
                self.store
                    .set_job_status(job_id, JobStatus::Running, None)
                    .await?;
            }
            None => {
                let mut job = Job::new(spec.clone());
                job.status = JobStatus::Running;
                self.store.save_job(&job).await?;
            }
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        jobs.insert(
            job_id,
            ActiveJob {
                status: JobStatus::Running,
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let supervisor = Arc::clone(&self.supervisor);
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let run = tokio::spawn(async move { supervisor.run(&spec, cancel).await });
            match run.await {
                Ok(outcome) => {
                    tracing::info!(job_id = %job_id, status = %outcome.status, "Job finished");
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, "Supervisor task failed: {}", e);
                    if let Err(e) = store
                        .set_job_status(job_id, JobStatus::Error, Some("supervisor task failed"))
                        .await
                    {
                        tracing::warn!(job_id = %job_id, "Failed to persist job status: {}", e);
                    }
                }
            }
            registry.lock().await.remove(&job_id);
            let _ = done_tx.send(true);
        });

        tracing::info!(job_id = %job_id, "Job started");
        Ok(true)
    }

    /// Stop the job's worker. Returns `false` when there was none, after
    /// persisting Stopped. A running job's persisted status is left to its
    /// supervisor task, which writes Stopped (or whatever the worker finished
    /// with) once reconciled.
    pub async fn stop_job(&self, job_id: Uuid) -> Result<bool> {
        let done = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&job_id) {
                // Stopping is never persisted: the supervisor task may already
                // have written the terminal status, and only it writes another.
                Some(active) => {
                    active.status = JobStatus::Stopping;
                    active.cancel.cancel();
                    Some(active.done.clone())
                }
                None => {
                    match self
                        .store
                        .set_job_status(job_id, JobStatus::Stopped, Some("No running process found"))
                        .await
                    {
                        Ok(()) | Err(DatabaseError::NotFound { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                    None
                }
            }
        };

        let Some(mut done) = done else {
            tracing::info!(job_id = %job_id, "No running process found");
            return Ok(false);
        };

        let wait = self.grace_period + STOP_SLACK;
        match tokio::time::timeout(wait, done.wait_for(|finished| *finished)).await {
            Ok(_) => tracing::info!(job_id = %job_id, "Job stopped"),
            Err(_) => tracing::warn!(
                job_id = %job_id,
                "Job still reconciling {}s after stop request",
                wait.as_secs()
            ),
        }
        Ok(true)
    }

    /// Stop the job's worker if it has one, then delete the job and its
    /// Results. Returns `false` when the job did not exist.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        if self.is_running(job_id).await {
            self.stop_job(job_id).await?;
        }
        let deleted = self.store.delete_job(job_id).await?;
        if deleted {
            tracing::info!(job_id = %job_id, "Job deleted");
        }
        Ok(deleted)
    }

    /// Whether the job has a live worker.
    pub async fn is_running(&self, job_id: Uuid) -> bool {
        self.jobs.lock().await.contains_key(&job_id)
    }

    /// Live status for active jobs, else the persisted one, else Idle.
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatus> {
        if let Some(active) = self.jobs.lock().await.get(&job_id) {
            return Ok(active.status);
        }
        Ok(self
            .store
            .get_job(job_id)
            .await?
            .map(|job| job.status)
            .unwrap_or(JobStatus::Idle))
    }

    /// Ids of all jobs with a live worker.
    pub async fn running_jobs(&self) -> Vec<Uuid> {
        self.jobs.lock().await.keys().copied().collect()
    }

    pub async fn running_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Stop every live job concurrently (shutdown path).
    pub async fn stop_all(&self) {
        let ids = self.running_jobs().await;
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "Stopping all running jobs");

        let results = futures::future::join_all(ids.iter().map(|id| self.stop_job(*id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(job_id = %id, "Failed to stop job: {}", e);
            }
        }
    }
}
