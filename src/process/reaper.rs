//! Orphan Reaper: cleans up after a supervisor that died without tidying.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use uuid::Uuid;

use crate::process::sys;
use crate::supervisor::scratch::SCRATCH_PREFIX;

/// What one reaper pass cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Pids that were force-killed.
    pub killed: Vec<u32>,
    /// Scratch directories that were deleted.
    pub removed_dirs: Vec<PathBuf>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.killed.is_empty() && self.removed_dirs.is_empty()
    }
}

/// Kills leftover worker processes and deletes stale scratch directories.
pub struct OrphanReaper {
    pattern: Regex,
    scratch_root: PathBuf,
}

impl OrphanReaper {
    /// `pattern` is matched against each process's full command line.
    pub fn new(pattern: Regex, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            pattern,
            scratch_root: scratch_root.into(),
        }
    }

    /// Startup pass: nothing is live yet, so everything matching is stale.
    pub async fn reap_startup(&self) -> ReapReport {
        self.reap(&HashSet::new(), &HashSet::new()).await
    }

    /// Kill matching processes not in `live_pids` (nor their descendants),
    /// then delete scratch directories not owned by `active_jobs`.
    pub async fn reap(&self, active_jobs: &HashSet<Uuid>, live_pids: &HashSet<u32>) -> ReapReport {
        let pattern = self.pattern.clone();
        let live = live_pids.clone();
        let killed = tokio::task::spawn_blocking(move || kill_matching(&pattern, &live))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Orphan process scan failed: {}", e);
                Vec::new()
            });

        let removed_dirs = remove_stale_dirs(&self.scratch_root, active_jobs).await;

        let report = ReapReport {
            killed,
            removed_dirs,
        };
        if report.is_empty() {
            tracing::debug!("Orphan reaper found nothing to clean");
        } else {
            tracing::info!(
                killed = report.killed.len(),
                removed_dirs = report.removed_dirs.len(),
                "Orphan reaper cleaned up"
            );
        }
        report
    }
}

fn kill_matching(pattern: &Regex, live: &HashSet<u32>) -> Vec<u32> {
    let own_pid = sysinfo::get_current_pid().ok().map(|p| p.as_u32());

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut roots = Vec::new();
    for (pid, process) in system.processes() {
        let pid = pid.as_u32();
        if process.status() == ProcessStatus::Zombie {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid);
        }
        if Some(pid) == own_pid || live.contains(&pid) {
            continue;
        }
        let cmdline = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if !cmdline.is_empty() && pattern.is_match(&cmdline) {
            tracing::warn!(pid, cmdline = %cmdline, "Killing orphaned worker");
            roots.push(pid);
        }
    }

    let mut targets: Vec<u32> = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = roots;
    while let Some(pid) = stack.pop() {
        if Some(pid) == own_pid || live.contains(&pid) || !seen.insert(pid) {
            continue;
        }
        targets.push(pid);
        stack.extend(children.get(&pid).into_iter().flatten().copied());
    }

    for pid in &targets {
        sys::kill(*pid);
    }
    targets
}

async fn remove_stale_dirs(root: &Path, active_jobs: &HashSet<Uuid>) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return removed,
        Err(e) => {
            tracing::warn!(root = %root.display(), "Cannot scan scratch root: {}", e);
            return removed;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(root = %root.display(), "Scratch scan interrupted: {}", e);
                break;
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix(SCRATCH_PREFIX) else {
            continue;
        };
        if Uuid::parse_str(rest).is_ok_and(|job_id| active_jobs.contains(&job_id)) {
            continue;
        }
        if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Removed stale scratch directory");
                removed.push(path);
            }
            Err(e) => tracing::warn!(path = %path.display(), "Failed to remove scratch directory: {}", e),
        }
    }

    // Drop the root itself once nothing is left in it.
    if active_jobs.is_empty() && tokio::fs::remove_dir(root).await.is_ok() {
        tracing::debug!(root = %root.display(), "Removed empty scratch root");
    }

    removed
}
