//! Platform signalling. Every function ignores failures: the target may
//! already be gone, or belong to someone we may not signal.

#[cfg(unix)]
mod imp {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    fn to_pid(pid: u32) -> Option<Pid> {
        // 0 and negative values address whole groups (including our own).
        i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
    }

    pub fn terminate(pid: u32) {
        if let Some(pid) = to_pid(pid) {
            let _ = signal::kill(pid, Signal::SIGTERM);
        }
    }

    pub fn kill(pid: u32) {
        if let Some(pid) = to_pid(pid) {
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
    }

    pub fn terminate_group(pgid: u32) {
        if let Some(pgid) = to_pid(pgid) {
            let _ = signal::killpg(pgid, Signal::SIGTERM);
        }
    }

    pub fn kill_group(pgid: u32) {
        if let Some(pgid) = to_pid(pgid) {
            let _ = signal::killpg(pgid, Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    fn kill_one(pid: u32) {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if let Some(process) = system.process(pid) {
            process.kill();
        }
    }

    // No graceful signal or process groups here; callers already pass every
    // descendant explicitly.
    pub fn terminate(pid: u32) {
        kill_one(pid);
    }

    pub fn kill(pid: u32) {
        kill_one(pid);
    }

    pub fn terminate_group(_pgid: u32) {}

    pub fn kill_group(_pgid: u32) {}
}

pub use imp::{kill, kill_group, terminate, terminate_group};
