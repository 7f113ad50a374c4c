//! Job Supervisor: owns one worker's lifecycle.
//!
//! A run stages the credential batch into a fresh scratch directory, spawns
//! the worker in its own process group, and then waits for whichever comes
//! first: the worker exiting, the hard timeout (force kill), or a stop
//! request (graceful terminate). Whatever happened, the Outcome Channel is
//! reconciled and the scratch directory released.

pub mod scratch;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::{ResultAggregator, WorkerExit};
use crate::config::SupervisorConfig;
use crate::error::{Error, StorageError, SupervisorError};
use crate::job::{CredentialSource, JobOutcome, JobSpec};
use crate::outcome::{FileOutcomeReader, env};
use crate::process::{ProcessGroup, SpawnSpec};
use crate::storage::ArtifactStorage;
use crate::store::JobStore;

pub use scratch::ScratchDir;

/// File the credential batch is staged into for object and inline sources.
const CREDENTIALS_FILE: &str = "credentials.json";

/// How long to keep draining output after the worker group is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs workers for jobs. One instance is shared by every job.
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    storage: Arc<dyn ArtifactStorage>,
    aggregator: ResultAggregator,
}

impl Supervisor {
    pub fn new(
        config: Arc<SupervisorConfig>,
        store: Arc<dyn JobStore>,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Self {
        Self {
            config,
            storage,
            aggregator: ResultAggregator::new(store),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run `spec` to a terminal outcome. `cancel` requests a graceful stop.
    pub async fn run(&self, spec: &JobSpec, cancel: CancellationToken) -> JobOutcome {
        let scratch = match ScratchDir::create(&self.config.scratch_root, spec.id).await {
            Ok(scratch) => scratch,
            Err(e) => {
                tracing::error!(job_id = %spec.id, "Cannot create scratch directory: {}", e);
                let reader = FileOutcomeReader::new(&self.config.scratch_root);
                return self
                    .aggregator
                    .reconcile_outcome(spec.id, &reader, &WorkerExit::spawn_failed(e.to_string()))
                    .await;
            }
        };

        let exit = self.execute(spec, scratch.path(), &cancel).await;
        self.aggregator.reconcile(spec.id, scratch, &exit).await
    }

    async fn execute(&self, spec: &JobSpec, dir: &Path, cancel: &CancellationToken) -> WorkerExit {
        let job_id = spec.id;

        let credentials = match self.stage_credentials(spec, dir).await {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(job_id = %job_id, "Credential staging failed: {}", e);
                return WorkerExit::spawn_failed(format!("credential staging failed: {e}"));
            }
        };

        if cancel.is_cancelled() {
            return WorkerExit {
                stop_requested: true,
                ..WorkerExit::default()
            };
        }

        let mut group = match ProcessGroup::spawn(&self.spawn_spec(spec, dir, &credentials)) {
            Ok(group) => group,
            Err(e) => {
                tracing::error!(job_id = %job_id, "{}", e);
                return WorkerExit::spawn_failed(e.to_string());
            }
        };
        let pid = group.id();
        let tail = OutputTail::capture(job_id, &mut group, self.config.output_tail_lines);

        let grace = self.config.grace_period;
        let timeout = self.config.job_timeout;
        let mut exit = WorkerExit::default();

        tokio::select! {
            status = group.wait() => match status {
                Ok(status) => record_status(&mut exit, status),
                Err(e) => tracing::warn!(job_id = %job_id, pid, "Failed to wait for worker: {}", e),
            },
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(job_id = %job_id, pid, "{}", SupervisorError::Timeout { timeout });
                exit.timed_out = Some(timeout);
                group.terminate(false, grace).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job_id, pid, "Stop requested, terminating worker");
                exit.stop_requested = true;
                group.terminate(true, grace).await;
            }
        }

        // Strays left in the group after a normal exit go too.
        group.terminate(false, grace).await;

        if exit.code.is_none() && exit.signal.is_none() {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, group.wait()).await {
                record_status(&mut exit, status);
            }
        }

        exit.output_tail = tail.finish(OUTPUT_DRAIN_TIMEOUT).await;
        tracing::info!(
            job_id = %job_id,
            pid,
            code = ?exit.code,
            signal = ?exit.signal,
            timed_out = exit.timed_out.is_some(),
            stopped = exit.stop_requested,
            "Worker finished"
        );
        exit
    }

    /// Make the credential batch available as a file the worker can read.
    async fn stage_credentials(&self, spec: &JobSpec, dir: &Path) -> Result<PathBuf, Error> {
        let staged = dir.join(CREDENTIALS_FILE);
        let payload = match &spec.credential_source {
            CredentialSource::Path(path) => {
                return tokio::fs::canonicalize(path)
                    .await
                    .map_err(|_| Error::from(StorageError::NotFound(path.display().to_string())));
            }
            CredentialSource::Object(reference) => self.storage.download_object(reference).await?,
            CredentialSource::Inline(payload) => payload.clone().into_bytes(),
        };

        tokio::fs::write(&staged, payload)
            .await
            .map_err(|source| SupervisorError::Scratch {
                path: staged.clone(),
                source,
            })?;
        Ok(staged)
    }

    fn spawn_spec(&self, spec: &JobSpec, dir: &Path, credentials: &Path) -> SpawnSpec {
        let mut spawn = SpawnSpec::new(&self.config.worker_program, dir)
            .args(self.config.worker_args.iter().cloned())
            .env(env::JOB_ID, spec.id.to_string())
            .env(env::SCRATCH_DIR, dir.display().to_string())
            .env(env::CREDENTIALS_PATH, credentials.display().to_string())
            .env(env::LOGIN_URL, &spec.login_url)
            .env(env::TARGET_URL, &spec.target_url);
        for (key, value) in self.config.retry.to_env() {
            spawn = spawn.env(key, value);
        }
        spawn
    }
}

fn record_status(exit: &mut WorkerExit, status: ExitStatus) {
    exit.code = status.code();
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        exit.signal = status.signal();
    }
}

/// Bounded tail of the worker's combined output. Each line is also logged
/// at debug level.
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputTail {
    fn capture(job_id: Uuid, group: &mut ProcessGroup, limit: usize) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(limit.min(1024))));
        let (stdout, stderr) = group.take_output();

        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(pump(job_id, "stdout", stdout, lines.clone(), limit)));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(pump(job_id, "stderr", stderr, lines.clone(), limit)));
        }
        Self { lines, readers }
    }

    async fn finish(self, wait: Duration) -> Vec<String> {
        for mut reader in self.readers {
            if tokio::time::timeout(wait, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        self.lines.lock().await.drain(..).collect()
    }
}

async fn pump<R>(
    job_id: Uuid,
    stream: &'static str,
    reader: R,
    lines: Arc<Mutex<VecDeque<String>>>,
    limit: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut stream_lines = LinesStream::new(BufReader::new(reader).lines());
    while let Some(Ok(line)) = stream_lines.next().await {
        tracing::debug!(job_id = %job_id, stream, "{}", line);
        if limit == 0 {
            continue;
        }
        let mut tail = lines.lock().await;
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::job::{Job, JobStatus, ResultStatus};
    use crate::storage::LocalStorage;
    use crate::store::LibSqlStore;

    struct Harness {
        _base: tempfile::TempDir,
        store: Arc<LibSqlStore>,
        supervisor: Supervisor,
        scratch_root: PathBuf,
    }

    async fn harness(script: &str, timeout: Duration) -> Harness {
        let base = tempfile::tempdir().unwrap();
        let worker = base.path().join("worker.sh");
        std::fs::write(&worker, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&worker, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = SupervisorConfig {
            worker_program: worker.display().to_string(),
            scratch_root: base.path().join("scratch"),
            storage_root: base.path().join("objects"),
            job_timeout: timeout,
            grace_period: Duration::from_secs(1),
            ..SupervisorConfig::default()
        };
        let scratch_root = config.scratch_root.clone();
        let storage = Arc::new(LocalStorage::new(&config.storage_root));
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let supervisor = Supervisor::new(Arc::new(config), store.clone(), storage);
        Harness {
            _base: base,
            store,
            supervisor,
            scratch_root,
        }
    }

    async fn register(store: &LibSqlStore, source: CredentialSource) -> JobSpec {
        let spec = JobSpec::new(
            Uuid::new_v4(),
            source,
            "https://portal.example.com/login",
            "https://portal.example.com/billing",
        );
        store.save_job(&Job::new(spec.clone())).await.unwrap();
        spec
    }

    #[tokio::test]
    async fn worker_sees_environment_and_completes() {
        let script = r#"
cat > progress.json <<EOF
[{"credential_identifier": "$WORKER_JOB_ID", "status": "success", "artifact_reference": "bills/one.pdf", "retry_attempts": 1}]
EOF
grep -q alice "$WORKER_CREDENTIALS_PATH" || exit 3
echo '{"results": []}' > results.json
echo '{"status": "completed", "message": "ok"}' > completion.json
"#;
        let h = harness(script, Duration::from_secs(10)).await;
        let spec = register(
            &h.store,
            CredentialSource::Inline(r#"[{"identifier": "alice", "secret": "pw"}]"#.into()),
        )
        .await;

        let outcome = h.supervisor.run(&spec, CancellationToken::new()).await;

        assert_eq!(outcome.status, JobStatus::Completed, "{:?}", outcome.message);
        let results = h.store.list_results(spec.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].credential_identifier, spec.id.to_string());
        assert_eq!(results[0].status, ResultStatus::Success);
        assert!(!h.scratch_root.join(format!("job_{}", spec.id)).exists());
    }

    #[tokio::test]
    async fn missing_worker_binary_is_job_error() {
        let h = harness("exit 0", Duration::from_secs(5)).await;
        let mut config = (*h.supervisor.config).clone();
        config.worker_program = "/nonexistent/batch-worker".into();
        let supervisor = Supervisor::new(
            Arc::new(config),
            h.store.clone(),
            Arc::new(LocalStorage::new("/nonexistent")),
        );
        let spec = register(&h.store, CredentialSource::Inline("[]".into())).await;

        let outcome = supervisor.run(&spec, CancellationToken::new()).await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.message.unwrap().contains("Failed to spawn worker"));
    }

    #[tokio::test]
    async fn missing_credential_object_is_job_error() {
        let h = harness("exit 0", Duration::from_secs(5)).await;
        let spec = register(&h.store, CredentialSource::Object("uploads/missing.json".into())).await;

        let outcome = h.supervisor.run(&spec, CancellationToken::new()).await;

        assert_eq!(outcome.status, JobStatus::Error);
        assert!(outcome.message.unwrap().contains("credential staging failed"));
    }

    #[tokio::test]
    async fn crash_without_signal_uses_output_tail() {
        let h = harness("echo 'browser launch failed' >&2; exit 4", Duration::from_secs(10)).await;
        let spec = register(&h.store, CredentialSource::Inline("[]".into())).await;

        let outcome = h.supervisor.run(&spec, CancellationToken::new()).await;

        assert_eq!(outcome.status, JobStatus::Error);
        let message = outcome.message.unwrap();
        assert!(message.contains("exit code 4"));
        assert!(message.contains("browser launch failed"));
    }

    #[tokio::test]
    async fn stop_request_terminates_worker() {
        let h = harness("echo started > started; sleep 30", Duration::from_secs(60)).await;
        let spec = register(&h.store, CredentialSource::Inline("[]".into())).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = h.supervisor.run(&spec, cancel).await;

        assert_eq!(outcome.status, JobStatus::Stopped);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            h.store.get_job(spec.id).await.unwrap().unwrap().status,
            JobStatus::Stopped
        );
    }
}
