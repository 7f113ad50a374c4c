//! Per-credential retry policy.
//!
//! A `RetryPolicy` is a plain value: how many attempts, how long to wait
//! between them, and what counts as success. `RetryPolicy::run` applies it to
//! any async attempt closure, checking a cancellation token before every
//! attempt and during every backoff sleep.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::outcome::env;

/// Upper bound accepted for `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Result of a single attempt: `Ok(artifact)` when the attempt ran to
/// completion without error, `Err(message)` otherwise.
pub type AttemptResult = Result<Option<String>, String>;

/// Decides whether a finished attempt counts as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessCriterion {
    /// The attempt must complete without error AND yield an artifact.
    #[default]
    ArtifactRequired,
    /// Completing without error is enough.
    CompletionOnly,
}

impl SuccessCriterion {
    /// Apply the criterion, turning an artifact-less completion into a failure
    /// where required.
    pub fn accept(&self, result: AttemptResult) -> AttemptResult {
        match (self, result) {
            (Self::ArtifactRequired, Ok(None)) => {
                Err("completed without producing an artifact".to_string())
            }
            (_, other) => other,
        }
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Succeeded on attempt `attempts`.
    Succeeded {
        artifact: Option<String>,
        attempts: u32,
    },
    /// Every attempt failed.
    Exhausted { attempts: u32, final_error: String },
    /// A stop was requested before the attempts ran out.
    Cancelled {
        attempts: u32,
        last_error: Option<String>,
    },
}

impl RetryOutcome {
    /// Number of attempts actually made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Retry policy shared by the supervisor and the worker-side runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts per credential (at least 1).
    pub max_attempts: u32,
    /// Backoff base: the delay after attempt `n` is `base * 2^n`.
    pub base: Duration,
    /// Backoff ceiling.
    pub cap: Duration,
    /// What counts as a successful attempt.
    pub criterion: SuccessCriterion,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            criterion: SuccessCriterion::ArtifactRequired,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with `max_attempts` and the default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT),
            ..Self::default()
        }
    }

    /// Set the backoff base and ceiling.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.base = base;
        self.cap = cap;
        self
    }

    /// Set the success criterion.
    pub fn with_criterion(mut self, criterion: SuccessCriterion) -> Self {
        self.criterion = criterion;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Read the policy a supervisor exported into the worker environment.
    /// Missing variables fall back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env` but with an injectable variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut policy = Self::default();

        if let Some(raw) = lookup(env::MAX_ATTEMPTS) {
            let attempts: u32 = parse_number(env::MAX_ATTEMPTS, &raw)?;
            if !(1..=MAX_ATTEMPTS_LIMIT).contains(&attempts) {
                return Err(ConfigError::InvalidValue {
                    key: env::MAX_ATTEMPTS.to_string(),
                    message: format!("must be between 1 and {MAX_ATTEMPTS_LIMIT}"),
                });
            }
            policy.max_attempts = attempts;
        }
        if let Some(raw) = lookup(env::BACKOFF_BASE_MS) {
            policy.base = Duration::from_millis(parse_number(env::BACKOFF_BASE_MS, &raw)?);
        }
        if let Some(raw) = lookup(env::BACKOFF_CAP_SECS) {
            policy.cap = Duration::from_secs(parse_number(env::BACKOFF_CAP_SECS, &raw)?);
        }

        Ok(policy)
    }

    /// Environment variables that hand this policy to a worker.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (env::MAX_ATTEMPTS, self.max_attempts.to_string()),
            (env::BACKOFF_BASE_MS, self.base.as_millis().to_string()),
            (env::BACKOFF_CAP_SECS, self.cap.as_secs().to_string()),
        ]
    }

    /// Run `op` until it satisfies the success criterion, the attempts run
    /// out, or `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptResult>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled {
                    attempts: attempt - 1,
                    last_error,
                };
            }

            match self.criterion.accept(op(attempt).await) {
                Ok(artifact) => {
                    tracing::debug!(attempt, "Attempt succeeded");
                    return RetryOutcome::Succeeded {
                        artifact,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "Attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                let delay = self.backoff(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return RetryOutcome::Cancelled { attempts: attempt, last_error };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        RetryOutcome::Exhausted {
            attempts: max_attempts,
            final_error: format!(
                "Failed after {max_attempts} attempts: {}",
                last_error.unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
