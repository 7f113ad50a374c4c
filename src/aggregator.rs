//! Result Aggregator: turns what a finished worker left behind into durable
//! Results and a terminal job status.
//!
//! Reconciliation is layered so partial progress always survives:
//!
//! 1. every progress entry is committed first;
//! 2. the completion signal classifies the run;
//! 3. the error signal is merged on top of the committed progress;
//! 4. with no signal at all, an error is synthesised from the exit code and
//!    the captured output.
//!
//! All writes are upserts keyed on `(job_id, credential_identifier)`, so
//! reconciling the same scratch directory twice changes nothing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{CredentialResult, JOB_LEVEL_IDENTIFIER, JobOutcome, JobStatus};
use crate::outcome::{
    CompletionStatus, FileOutcomeReader, ResultsManifest, WorkerErrorSignal, WorkerOutcome,
};
use crate::store::JobStore;
use crate::supervisor::scratch::ScratchDir;

/// How the worker process ended, as observed by the supervisor.
#[derive(Debug, Clone, Default)]
pub struct WorkerExit {
    /// Exit code, if the worker exited on its own.
    pub code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Set when the hard timeout fired.
    pub timed_out: Option<Duration>,
    /// Set when an operator asked for the job to stop.
    pub stop_requested: bool,
    /// Set when the worker never started.
    pub spawn_error: Option<String>,
    /// Last lines of combined stdout/stderr.
    pub output_tail: Vec<String>,
}

impl WorkerExit {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::default()
        }
    }

    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// Reconciles Outcome Channel data into the job store.
pub struct ResultAggregator {
    store: Arc<dyn JobStore>,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Reconcile a finished run and release its scratch directory.
    ///
    /// The scratch directory is released on every path, including when
    /// persistence fails.
    pub async fn reconcile(&self, job_id: Uuid, scratch: ScratchDir, exit: &WorkerExit) -> JobOutcome {
        let reader = FileOutcomeReader::new(scratch.path());
        let outcome = self.reconcile_outcome(job_id, &reader, exit).await;
        scratch.release().await;
        outcome
    }

    /// Reconcile from any `WorkerOutcome` source without touching it.
    pub async fn reconcile_outcome(
        &self,
        job_id: Uuid,
        source: &dyn WorkerOutcome,
        exit: &WorkerExit,
    ) -> JobOutcome {
        let mut plan = Plan::new(job_id);

        if let Some(reason) = &exit.spawn_error {
            plan.job_error = Some(reason.clone());
            let outcome = plan.finish(JobStatus::Error, Some(reason.clone()));
            return self.persist(outcome).await;
        }

        // (1) progress: durable per-credential outcomes, trusted as written.
        match source.progress().await {
            Ok(entries) => {
                for entry in &entries {
                    plan.commit(entry.to_result(job_id));
                }
            }
            Err(e) => plan.unreadable.push(e.to_string()),
        }

        // (2)-(3) completion and error signals; the manifest fills gaps.
        let completion = plan.read(source.completion().await);
        let error = plan.read(source.error().await);
        let manifest = plan.read(source.results().await);

        if let Some(manifest) = &manifest {
            plan.merge_manifest(manifest);
        }
        if let Some(signal) = &error {
            plan.merge_error(signal);
        }

        let (status, message) = if exit.stop_requested {
            (JobStatus::Stopped, Some("stopped by operator".to_string()))
        } else if let Some(timeout) = exit.timed_out {
            let message = format!("worker timed out after {}s", timeout.as_secs());
            plan.job_error = Some(message.clone());
            (JobStatus::Error, Some(message))
        } else if let Some(signal) = error.as_ref().filter(|s| s.kind.is_fatal()) {
            (JobStatus::Error, Some(signal.message.clone()))
        } else if let Some(completion) = &completion {
            match completion.status {
                CompletionStatus::Completed if exit.success() => {
                    (JobStatus::Completed, non_empty(&completion.message))
                }
                CompletionStatus::Completed => (
                    JobStatus::Error,
                    Some(format!(
                        "worker reported completion but ended with {}",
                        exit.describe()
                    )),
                ),
                CompletionStatus::CompletedWithError => (
                    JobStatus::Error,
                    non_empty(&completion.message)
                        .or_else(|| Some("worker completed with errors".to_string())),
                ),
                CompletionStatus::Interrupted => (
                    JobStatus::Error,
                    Some(match non_empty(&completion.message) {
                        Some(m) => format!("worker interrupted: {m}"),
                        None => "worker interrupted".to_string(),
                    }),
                ),
            }
        } else if let Some(signal) = &error {
            if exit.success() {
                (JobStatus::Completed, Some(signal.message.clone()))
            } else {
                (JobStatus::Error, Some(signal.message.clone()))
            }
        } else if exit.success() && manifest.is_some() {
            (JobStatus::Completed, None)
        } else {
            // (4) no signal at all: best-effort crash report.
            let message = crash_message(exit, &plan.unreadable);
            plan.job_error = Some(message.clone());
            (JobStatus::Error, Some(message))
        };

        if !plan.unreadable.is_empty() {
            tracing::warn!(
                job_id = %job_id,
                errors = ?plan.unreadable,
                "Unreadable outcome documents"
            );
        }

        let outcome = plan.finish(status, message);
        self.persist(outcome).await
    }

    async fn persist(&self, outcome: JobOutcome) -> JobOutcome {
        let current = self.store.get_job(outcome.job_id).await.ok().flatten();
        if let Some(job) = current.filter(|job| !job.status.can_transition_to(outcome.status)) {
            tracing::warn!(
                job_id = %outcome.job_id,
                from = %job.status,
                to = %outcome.status,
                "Unexpected status transition while reconciling"
            );
        }

        // A job-level error from an earlier run no longer describes this one.
        if !outcome.results.iter().any(|r| r.is_job_level()) {
            let cleared = self
                .store
                .delete_result(outcome.job_id, JOB_LEVEL_IDENTIFIER)
                .await;
            if let Err(e) = cleared {
                tracing::warn!(job_id = %outcome.job_id, "Failed to clear job-level result: {}", e);
            }
        }

        for result in &outcome.results {
            if let Err(e) = self.store.upsert_result(result).await {
                tracing::error!(
                    job_id = %outcome.job_id,
                    credential = %result.credential_identifier,
                    "Failed to persist result: {}", e
                );
            }
        }

        match self
            .store
            .set_job_status(outcome.job_id, outcome.status, outcome.message.as_deref())
            .await
        {
            Ok(()) => {}
            Err(DatabaseError::NotFound { .. }) => {
                tracing::warn!(job_id = %outcome.job_id, "Reconciled a job the store does not know");
            }
            Err(e) => {
                tracing::error!(job_id = %outcome.job_id, "Failed to persist job status: {}", e);
            }
        }

        tracing::info!(
            job_id = %outcome.job_id,
            status = %outcome.status,
            successful = outcome.successful(),
            failed = outcome.failed(),
            "Job reconciled"
        );
        outcome
    }
}

/// Results collected during one reconciliation, in commit order.
struct Plan {
    job_id: Uuid,
    results: Vec<CredentialResult>,
    seen: HashSet<String>,
    job_error: Option<String>,
    unreadable: Vec<String>,
}

impl Plan {
    fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            results: Vec::new(),
            seen: HashSet::new(),
            job_error: None,
            unreadable: Vec::new(),
        }
    }

    fn commit(&mut self, result: CredentialResult) {
        if self.seen.insert(result.credential_identifier.clone()) {
            self.results.push(result);
        } else if let Some(existing) = self
            .results
            .iter_mut()
            .find(|r| r.credential_identifier == result.credential_identifier)
        {
            *existing = result;
        }
    }

    fn read<T>(&mut self, document: Result<Option<T>, crate::error::OutcomeError>) -> Option<T> {
        document.unwrap_or_else(|e| {
            self.unreadable.push(e.to_string());
            None
        })
    }

    fn merge_manifest(&mut self, manifest: &ResultsManifest) {
        for entry in &manifest.results {
            if !self.seen.contains(&entry.credential_identifier) {
                self.commit(entry.to_result(self.job_id));
            }
        }
    }

    fn merge_error(&mut self, signal: &WorkerErrorSignal) {
        match signal.credential_identifier.as_deref() {
            Some(credential) if !signal.kind.is_fatal() => {
                if !self.seen.contains(credential) {
                    self.commit(
                        CredentialResult::error(self.job_id, credential, &signal.message, 0)
                            .with_final_error(&signal.message),
                    );
                }
            }
            _ => self.job_error = Some(signal.message.clone()),
        }
    }

    fn finish(mut self, status: JobStatus, message: Option<String>) -> JobOutcome {
        if let Some(error) = self.job_error.take() {
            self.commit(CredentialResult::job_error(self.job_id, error));
        }
        JobOutcome {
            job_id: self.job_id,
            status,
            message,
            results: self.results,
        }
    }
}

fn non_empty(message: &str) -> Option<String> {
    let trimmed = message.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn crash_message(exit: &WorkerExit, unreadable: &[String]) -> String {
    let mut message = format!(
        "worker ended with {} without reporting an outcome",
        exit.describe()
    );
    for detail in unreadable {
        message.push_str("; ");
        message.push_str(detail);
    }
    if !exit.output_tail.is_empty() {
        message.push_str("\n--- output ---\n");
        message.push_str(&exit.output_tail.join("\n"));
    }
    message
}
