//! Configuration types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;

use crate::error::ConfigError;
use crate::retry::{MAX_ATTEMPTS_LIMIT, RetryPolicy};

/// Bounds of the termination grace period.
const MIN_GRACE: Duration = Duration::from_secs(1);
const MAX_GRACE: Duration = Duration::from_secs(5);

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker binary to run for every job.
    pub worker_program: String,
    /// Extra arguments passed to the worker.
    pub worker_args: Vec<String>,
    /// Parent of all job scratch directories.
    pub scratch_root: PathBuf,
    /// Hard ceiling on a single worker run.
    pub job_timeout: Duration,
    /// Time a worker gets between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Maximum number of jobs running at once.
    pub max_parallel_jobs: usize,
    /// Command-line regex identifying leftover workers. Defaults to the
    /// worker program's file name.
    pub orphan_pattern: Option<String>,
    /// Lines of worker output kept for crash reports.
    pub output_tail_lines: usize,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Root of the local artifact store.
    pub storage_root: PathBuf,
    /// How often recurring jobs are checked.
    pub schedule_interval: Duration,
    /// Per-credential retry policy handed to workers.
    pub retry: RetryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_program: "batch-worker".to_string(),
            worker_args: Vec::new(),
            scratch_root: PathBuf::from("./data/scratch"),
            job_timeout: Duration::from_secs(1800), // 30 minutes
            grace_period: Duration::from_secs(3),
            max_parallel_jobs: 10,
            orphan_pattern: None,
            output_tail_lines: 200,
            db_path: PathBuf::from("./data/supervisor.db"),
            storage_root: PathBuf::from("./data/objects"),
            schedule_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    /// Build from `SUPERVISOR_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env` but with an injectable variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(program) = get("SUPERVISOR_WORKER_PROGRAM") {
            config.worker_program = program;
        }
        if let Some(args) = get("SUPERVISOR_WORKER_ARGS") {
            config.worker_args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(root) = get("SUPERVISOR_SCRATCH_ROOT") {
            config.scratch_root = PathBuf::from(root);
        }
        if let Some(raw) = get("SUPERVISOR_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse("SUPERVISOR_JOB_TIMEOUT_SECS", &raw)?;
            if secs == 0 {
                return Err(invalid("SUPERVISOR_JOB_TIMEOUT_SECS", "must be positive"));
            }
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get("SUPERVISOR_GRACE_PERIOD_SECS") {
            let secs: u64 = parse("SUPERVISOR_GRACE_PERIOD_SECS", &raw)?;
            config.grace_period = Duration::from_secs(secs).clamp(MIN_GRACE, MAX_GRACE);
        }
        if let Some(raw) = get("SUPERVISOR_MAX_PARALLEL_JOBS") {
            let max: usize = parse("SUPERVISOR_MAX_PARALLEL_JOBS", &raw)?;
            if max == 0 {
                return Err(invalid("SUPERVISOR_MAX_PARALLEL_JOBS", "must be positive"));
            }
            config.max_parallel_jobs = max;
        }
        if let Some(pattern) = get("SUPERVISOR_ORPHAN_PATTERN") {
            config.orphan_pattern = Some(pattern);
        }
        if let Some(raw) = get("SUPERVISOR_OUTPUT_TAIL_LINES") {
            config.output_tail_lines = parse("SUPERVISOR_OUTPUT_TAIL_LINES", &raw)?;
        }
        if let Some(path) = get("SUPERVISOR_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(root) = get("SUPERVISOR_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(raw) = get("SUPERVISOR_SCHEDULE_INTERVAL_SECS") {
            let secs: u64 = parse("SUPERVISOR_SCHEDULE_INTERVAL_SECS", &raw)?;
            config.schedule_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(raw) = get("SUPERVISOR_MAX_ATTEMPTS") {
            let attempts: u32 = parse("SUPERVISOR_MAX_ATTEMPTS", &raw)?;
            if !(1..=MAX_ATTEMPTS_LIMIT).contains(&attempts) {
                return Err(invalid(
                    "SUPERVISOR_MAX_ATTEMPTS",
                    &format!("must be between 1 and {MAX_ATTEMPTS_LIMIT}"),
                ));
            }
            config.retry.max_attempts = attempts;
        }
        if let Some(raw) = get("SUPERVISOR_BACKOFF_BASE_MS") {
            config.retry.base = Duration::from_millis(parse("SUPERVISOR_BACKOFF_BASE_MS", &raw)?);
        }
        if let Some(raw) = get("SUPERVISOR_BACKOFF_CAP_SECS") {
            config.retry.cap = Duration::from_secs(parse("SUPERVISOR_BACKOFF_CAP_SECS", &raw)?);
        }

        // Fail at startup rather than on the first reaper pass.
        config.orphan_regex()?;
        Ok(config)
    }

    /// Regex matching leftover worker command lines. By default the worker's
    /// file name must appear as a whole path component followed by an
    /// argument boundary, so `tail -f batch-worker.log` is left alone.
    pub fn orphan_regex(&self) -> Result<Regex, ConfigError> {
        let pattern = match &self.orphan_pattern {
            Some(pattern) => pattern.clone(),
            None => {
                let name = Path::new(&self.worker_program)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.worker_program.clone());
                format!(r"(^|/){}(\s|$)", regex::escape(&name))
            }
        };
        Regex::new(&pattern).map_err(|e| invalid("SUPERVISOR_ORPHAN_PATTERN", &e.to_string()))
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, &e.to_string()))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = SupervisorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.worker_program, "batch-worker");
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
        assert_eq!(config.grace_period, Duration::from_secs(3));
        assert_eq!(config.max_parallel_jobs, 10);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn reads_overrides() {
        let config = SupervisorConfig::from_lookup(lookup(&[
            ("SUPERVISOR_WORKER_PROGRAM", "/opt/bin/bill-fetcher"),
            ("SUPERVISOR_WORKER_ARGS", "--headless  --fast"),
            ("SUPERVISOR_JOB_TIMEOUT_SECS", "5"),
            ("SUPERVISOR_GRACE_PERIOD_SECS", "60"),
            ("SUPERVISOR_MAX_ATTEMPTS", "5"),
            ("SUPERVISOR_BACKOFF_BASE_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.worker_args, vec!["--headless", "--fast"]);
        assert_eq!(config.job_timeout, Duration::from_secs(5));
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base, Duration::from_millis(250));
        assert!(
            config
                .orphan_regex()
                .unwrap()
                .is_match("/opt/bin/bill-fetcher --headless")
        );
    }

    #[test]
    fn default_orphan_pattern_matches_whole_program_name() {
        let config = SupervisorConfig::from_lookup(lookup(&[])).unwrap();
        let pattern = config.orphan_regex().unwrap();

        assert!(pattern.is_match("batch-worker"));
        assert!(pattern.is_match("/usr/local/bin/batch-worker --headless"));
        assert!(pattern.is_match("/bin/sh /opt/batch-worker"));
        assert!(!pattern.is_match("tail -f batch-worker.log"));
        assert!(!pattern.is_match("vim /tmp/old-batch-worker"));
        assert!(!pattern.is_match("less batch-worker-notes.txt"));
    }

    #[test]
    fn rejects_malformed_values() {
        for (key, value) in [
            ("SUPERVISOR_JOB_TIMEOUT_SECS", "soon"),
            ("SUPERVISOR_JOB_TIMEOUT_SECS", "0"),
            ("SUPERVISOR_MAX_ATTEMPTS", "11"),
            ("SUPERVISOR_ORPHAN_PATTERN", "(unclosed"),
        ] {
            let err = SupervisorConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { key: ref k, .. } if k == key),
                "{key}={value} gave {err:?}"
            );
        }
    }
}
