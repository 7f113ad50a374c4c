//! Job status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but never run.
    Idle,
    /// A worker process is active.
    Running,
    /// A stop was requested; termination is in progress.
    Stopping,
    /// Stopped by an operator.
    Stopped,
    /// Worker finished and reported completion.
    Completed,
    /// Spawn failure, timeout, crash or fatal worker error.
    Error,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Running) | (Idle, Stopped) |
            // From Running
            (Running, Stopping) | (Running, Stopped) |
            (Running, Completed) | (Running, Error) |
            // Stopping collapses to Stopped
            (Stopping, Stopped) |
            // Re-trigger or stop of a finished job
            (Stopped, Running) | (Completed, Running) | (Error, Running) |
            (Stopped, Stopped) | (Completed, Stopped) | (Error, Stopped)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(JobStatus::Idle.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Error));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Stopping));
        assert!(JobStatus::Stopping.can_transition_to(JobStatus::Stopped));
        assert!(JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Error.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Stopped.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Stopping.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Stopping.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Idle.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Idle));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Stopping.is_terminal());
        assert!(!JobStatus::Idle.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            JobStatus::Idle,
            JobStatus::Running,
            JobStatus::Stopping,
            JobStatus::Stopped,
            JobStatus::Completed,
            JobStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn job_status_serde() {
        let json = serde_json::to_string(&JobStatus::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
    }
}
