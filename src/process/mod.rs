//! Process Group Controller.
//!
//! A `ProcessGroup` is a worker started in its own process group, so the
//! worker and everything it forks can be signalled as a unit. Termination
//! is best-effort and idempotent: processes that already exited, or that we
//! may not signal, are skipped silently.

pub mod reaper;
mod sys;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::error::SupervisorError;

pub use reaper::{OrphanReaper, ReapReport};

/// How often liveness is polled during the grace period.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on reaping the worker after a force kill.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// What to start.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: PathBuf,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            workdir: workdir.into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A running worker and its process group.
pub struct ProcessGroup {
    child: Child,
    pid: u32,
    exit: Option<ExitStatus>,
}

impl ProcessGroup {
    /// Start the worker in a new process group with piped output.
    ///
    /// A missing or unexecutable binary is `SupervisorError::Spawn`.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            program: spec.program.clone(),
            reason: "process exited before its pid was known".to_string(),
        })?;

        tracing::info!(pid, program = %spec.program, "Worker spawned");

        Ok(Self {
            child,
            pid,
            exit: None,
        })
    }

    /// Worker pid; also the process group id.
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Take the worker's output pipes. Returns `None`s on the second call.
    pub fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }

    /// Wait for the worker itself to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    fn try_reap(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                true
            }
            Ok(None) => false,
            Err(_) => true,
        }
    }

    /// Live descendants of the worker, found by walking parent links.
    pub async fn descendants(&self) -> Vec<u32> {
        let root = self.pid;
        tokio::task::spawn_blocking(move || descendants_of(root))
            .await
            .unwrap_or_default()
    }

    /// Terminate the worker and every descendant.
    ///
    /// Graceful: SIGTERM to each descendant, then the worker, then the whole
    /// group; wait up to `grace` for them to exit; SIGKILL any survivor.
    /// Not graceful: SIGKILL everything at once. Safe to call repeatedly and
    /// after the worker has already exited.
    pub async fn terminate(&mut self, graceful: bool, grace: Duration) {
        let mut targets = self.descendants().await;
        let worker_alive = !self.try_reap();
        if worker_alive {
            targets.push(self.pid);
        }

        if graceful {
            tracing::debug!(pid = self.pid, targets = targets.len(), "Sending SIGTERM");
            for pid in &targets {
                sys::terminate(*pid);
            }
            sys::terminate_group(self.pid);

            let deadline = tokio::time::Instant::now() + grace;
            loop {
                let worker_done = self.try_reap();
                let survivors = alive(&targets, self.pid).await;
                if worker_done && survivors.is_empty() {
                    tracing::debug!(pid = self.pid, "Worker group exited within grace period");
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(
                        pid = self.pid,
                        survivors = survivors.len(),
                        "Grace period expired, force killing"
                    );
                    targets = survivors;
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        self.force_kill(&targets).await;
    }

    async fn force_kill(&mut self, targets: &[u32]) {
        for pid in targets {
            sys::kill(*pid);
        }
        sys::kill_group(self.pid);

        if !self.try_reap() {
            let _ = self.child.start_kill();
            if let Ok(Ok(status)) = tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
                self.exit = Some(status);
            }
        }
    }
}

/// Pids of `targets` that are still running. The worker pid is judged by
/// the caller through `try_wait`, everything else through the process table.
async fn alive(targets: &[u32], worker: u32) -> Vec<u32> {
    let pids: Vec<u32> = targets.iter().copied().filter(|p| *p != worker).collect();
    if pids.is_empty() {
        return pids;
    }
    tokio::task::spawn_blocking(move || running_among(&pids))
        .await
        .unwrap_or_default()
}

/// Walk the process table for every transitive child of `root`.
pub(crate) fn descendants_of(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if process.status() == ProcessStatus::Zombie {
            continue;
        }
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root]);
    let mut found = Vec::new();
    while let Some(pid) = queue.pop_front() {
        for child in children.get(&pid).into_iter().flatten() {
            if *child != root && seen.insert(*child) {
                found.push(*child);
                queue.push_back(*child);
            }
        }
    }
    found
}

/// Subset of `pids` that exist and are not zombies.
pub(crate) fn running_among(pids: &[u32]) -> Vec<u32> {
    let sys_pids: Vec<sysinfo::Pid> = pids.iter().map(|p| sysinfo::Pid::from_u32(*p)).collect();
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&sys_pids), true);

    pids.iter()
        .copied()
        .filter(|pid| {
            system
                .process(sysinfo::Pid::from_u32(*pid))
                .is_some_and(|p| p.status() != ProcessStatus::Zombie)
        })
        .collect()
}
