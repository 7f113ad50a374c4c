//! Worker-side batch runner.
//!
//! A worker binary links this module to honour the supervisor's contract:
//! read the `WORKER_*` environment, work through the credential batch one
//! credential at a time under the shared `RetryPolicy`, and report through
//! the Outcome Channel. The automation itself lives behind
//! `CredentialProcessor`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, OutcomeError};
use crate::outcome::{CompletionStatus, CredentialEntry, OutcomeWriter, WorkerErrorKind, env};
use crate::retry::{AttemptResult, RetryOutcome, RetryPolicy};

/// One credential from the batch file. The secret never appears in logs.
#[derive(Debug, Clone)]
pub struct Credential {
    pub identifier: String,
    pub secret: SecretString,
}

#[derive(Deserialize)]
struct RawCredential {
    identifier: String,
    secret: String,
}

impl From<RawCredential> for Credential {
    fn from(raw: RawCredential) -> Self {
        Self {
            identifier: raw.identifier,
            secret: SecretString::from(raw.secret),
        }
    }
}

/// Read a credential batch: a JSON array of `{identifier, secret}`.
pub async fn load_credentials(path: &Path) -> Result<Vec<Credential>, OutcomeError> {
    let raw = tokio::fs::read(path).await.map_err(|source| OutcomeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: Vec<RawCredential> =
        serde_json::from_slice(&raw).map_err(|e| OutcomeError::Parse {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(raw.into_iter().map(Credential::from).collect())
}

/// What the supervisor hands a worker through its environment.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub job_id: String,
    pub scratch_dir: PathBuf,
    pub credentials_path: PathBuf,
    pub login_url: String,
    pub target_url: String,
    pub retry: RetryPolicy,
}

impl WorkerContext {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require =
            |key: &str| lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        Ok(Self {
            job_id: require(env::JOB_ID)?,
            scratch_dir: PathBuf::from(require(env::SCRATCH_DIR)?),
            credentials_path: PathBuf::from(require(env::CREDENTIALS_PATH)?),
            login_url: require(env::LOGIN_URL)?,
            target_url: require(env::TARGET_URL)?,
            retry: RetryPolicy::from_lookup(&lookup)?,
        })
    }
}

/// The automation applied to one credential.
#[async_trait]
pub trait CredentialProcessor: Send + Sync {
    /// Make one attempt. `Ok(Some(reference))` is a produced artifact.
    async fn process(&self, credential: &Credential, attempt: u32) -> AttemptResult;
}

/// Drives a credential batch through a processor and reports every outcome.
pub struct BatchRunner {
    policy: RetryPolicy,
    writer: OutcomeWriter,
    cancel: CancellationToken,
}

impl BatchRunner {
    pub fn new(policy: RetryPolicy, writer: OutcomeWriter, cancel: CancellationToken) -> Self {
        Self {
            policy,
            writer,
            cancel,
        }
    }

    /// Process `credentials` in order. Returns the entries written to
    /// `results.json`; on cancellation the remaining credentials are skipped
    /// and completion is reported as interrupted.
    pub async fn run(
        &self,
        credentials: &[Credential],
        processor: &dyn CredentialProcessor,
    ) -> Result<Vec<CredentialEntry>, OutcomeError> {
        let mut entries = Vec::with_capacity(credentials.len());
        let mut interrupted = false;

        for credential in credentials {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }

            let outcome = self
                .policy
                .run(&self.cancel, |attempt| processor.process(credential, attempt))
                .await;

            let entry = match outcome {
                RetryOutcome::Succeeded {
                    artifact: Some(artifact),
                    attempts,
                } => CredentialEntry::success(&credential.identifier, artifact, attempts),
                RetryOutcome::Succeeded {
                    artifact: None,
                    attempts,
                } => CredentialEntry::failure(
                    &credential.identifier,
                    "no artifact produced",
                    attempts,
                    None,
                ),
                RetryOutcome::Exhausted {
                    attempts,
                    final_error,
                } => CredentialEntry::failure(
                    &credential.identifier,
                    final_error.clone(),
                    attempts,
                    Some(final_error),
                ),
                RetryOutcome::Cancelled {
                    attempts,
                    last_error,
                } => {
                    interrupted = true;
                    if attempts == 0 {
                        break;
                    }
                    CredentialEntry::failure(
                        &credential.identifier,
                        last_error.unwrap_or_else(|| "cancelled".to_string()),
                        attempts,
                        None,
                    )
                }
            };

            tracing::info!(
                credential = %credential.identifier,
                status = entry.status.as_str(),
                attempts = entry.retry_attempts,
                "Credential processed"
            );
            self.writer.record_progress(entry.clone()).await?;
            entries.push(entry);

            if interrupted {
                break;
            }
        }

        self.writer.write_results(entries.clone()).await?;

        let (status, message) = if interrupted {
            (
                CompletionStatus::Interrupted,
                format!("interrupted after {} of {} credentials", entries.len(), credentials.len()),
            )
        } else {
            (
                CompletionStatus::Completed,
                format!("processed {} credentials", entries.len()),
            )
        };
        self.writer.write_completion(status, message).await?;

        Ok(entries)
    }

    /// Report a failure that prevents the batch from running at all.
    pub async fn fail(&self, kind: WorkerErrorKind, message: &str) -> Result<(), OutcomeError> {
        tracing::error!(kind = kind.as_str(), "{}", message);
        self.writer.write_error(kind, message, None).await
    }
}

/// Cancel `token` on SIGTERM or Ctrl-C, so a supervisor's graceful stop is
/// seen between attempts.
pub fn cancel_on_terminate(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = term.recv() => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("Cannot install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Termination requested, finishing current attempt");
        token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use secrecy::ExposeSecret;

    use super::*;
    use crate::job::ResultStatus;
    use crate::outcome::{FileOutcomeReader, WorkerOutcome};

    /// Fails each credential a scripted number of times before succeeding.
    struct Scripted {
        failures_before_success: HashMap<String, u32>,
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl Scripted {
        fn new(plan: &[(&str, u32)]) -> Self {
            Self {
                failures_before_success: plan.iter().map(|(id, n)| (id.to_string(), *n)).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CredentialProcessor for Scripted {
        async fn process(&self, credential: &Credential, attempt: u32) -> AttemptResult {
            self.calls
                .lock()
                .unwrap()
                .push((credential.identifier.clone(), attempt));
            let failures = self.failures_before_success[&credential.identifier];
            if attempt > failures {
                Ok(Some(format!("bills/{}.pdf", credential.identifier)))
            } else {
                Err(format!("portal timeout on attempt {attempt}"))
            }
        }
    }

    fn credential(id: &str) -> Credential {
        Credential {
            identifier: id.to_string(),
            secret: SecretString::from("hunter2"),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_backoff(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn success_on_later_attempt_records_attempt_count() {
        let dir = tempfile::tempdir().unwrap();
        let runner = BatchRunner::new(
            policy(3),
            OutcomeWriter::new(dir.path()),
            CancellationToken::new(),
        );
        let processor = Scripted::new(&[("acct-1", 1), ("acct-2", 0)]);

        let entries = runner
            .run(&[credential("acct-1"), credential("acct-2")], &processor)
            .await
            .unwrap();

        assert_eq!(entries[0].status, ResultStatus::Success);
        assert_eq!(entries[0].retry_attempts, 2);
        assert_eq!(entries[1].retry_attempts, 1);

        let reader = FileOutcomeReader::new(dir.path());
        assert_eq!(reader.progress().await.unwrap().len(), 2);
        assert_eq!(reader.results().await.unwrap().unwrap().successful, 2);
        assert_eq!(
            reader.completion().await.unwrap().unwrap().status,
            CompletionStatus::Completed
        );
    }

    #[tokio::test]
    async fn exhausted_credential_carries_final_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = BatchRunner::new(
            policy(3),
            OutcomeWriter::new(dir.path()),
            CancellationToken::new(),
        );
        let processor = Scripted::new(&[("acct-1", u32::MAX)]);

        let entries = runner.run(&[credential("acct-1")], &processor).await.unwrap();

        assert_eq!(entries[0].status, ResultStatus::Error);
        assert_eq!(entries[0].retry_attempts, 3);
        let final_error = entries[0].final_error.as_deref().unwrap();
        assert!(final_error.contains("Failed after 3 attempts"));
        assert!(final_error.contains("portal timeout on attempt 3"));
        assert_eq!(processor.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_credential() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = BatchRunner::new(policy(3), OutcomeWriter::new(dir.path()), cancel);
        let processor = Scripted::new(&[("acct-1", 0)]);

        let entries = runner.run(&[credential("acct-1")], &processor).await.unwrap();

        assert!(entries.is_empty());
        assert!(processor.calls.lock().unwrap().is_empty());
        assert_eq!(
            FileOutcomeReader::new(dir.path())
                .completion()
                .await
                .unwrap()
                .unwrap()
                .status,
            CompletionStatus::Interrupted
        );
    }

    #[tokio::test]
    async fn loads_credential_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(
            &path,
            r#"[{"identifier":"acct-1","secret":"s3cret"},{"identifier":"acct-2","secret":"x"}]"#,
        )
        .await
        .unwrap();

        let credentials = load_credentials(&path).await.unwrap();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].secret.expose_secret(), "s3cret");
        assert!(!format!("{:?}", credentials[0]).contains("s3cret"));

        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(matches!(
            load_credentials(&path).await.unwrap_err(),
            OutcomeError::Parse { .. }
        ));
    }

    #[test]
    fn context_requires_worker_environment() {
        let vars: HashMap<&str, &str> = [
            (env::JOB_ID, "7f9c"),
            (env::SCRATCH_DIR, "/tmp/job_7f9c"),
            (env::CREDENTIALS_PATH, "/tmp/job_7f9c/credentials.json"),
            (env::LOGIN_URL, "https://portal.example.com/login"),
            (env::TARGET_URL, "https://portal.example.com/billing"),
            (env::MAX_ATTEMPTS, "4"),
        ]
        .into_iter()
        .collect();

        let context =
            WorkerContext::from_lookup(|key: &str| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(context.retry.max_attempts, 4);
        assert_eq!(context.scratch_dir, PathBuf::from("/tmp/job_7f9c"));

        let err = WorkerContext::from_lookup(|_: &str| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == env::JOB_ID));
    }
}
