//! Is the process named in a lock record still the one that wrote it?
//!
//! A PID alone is not enough: PIDs are recycled, so the record also carries
//! the owner's start time and a live PID with a different start time counts
//! as dead.

use {
    serde::{Deserialize, Serialize},
    sysinfo::{Pid, ProcessesToUpdate, System},
    tracing::debug,
};

/// PID plus start time (seconds since the Unix epoch, as reported by the OS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerIdentity {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

impl OwnerIdentity {
    /// Identity of the calling process.
    pub fn current() -> Self {
        let pid = std::process::id();
        Self {
            pid,
            started_at: process_start_time(pid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe could not tell. Callers fall back to record age.
    Unknown,
}

pub trait LivenessProbe: Send + Sync {
    /// Whether this platform can introspect other processes at all.
    fn is_supported(&self) -> bool;

    fn probe(&self, owner: &OwnerIdentity) -> Liveness;
}

/// Signal probe on Unix, process table elsewhere, start-time check on both.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl LivenessProbe for SystemProbe {
    fn is_supported(&self) -> bool {
        sysinfo::IS_SUPPORTED_SYSTEM
    }

    fn probe(&self, owner: &OwnerIdentity) -> Liveness {
        match pid_exists(owner.pid) {
            Liveness::Alive => {},
            other => return other,
        }

        let (Some(recorded), Some(actual)) = (owner.started_at, process_start_time(owner.pid))
        else {
            return Liveness::Alive;
        };
        // Start times are whole seconds derived from boot time; allow jitter.
        if recorded.abs_diff(actual) > 1 {
            debug!(
                pid = owner.pid,
                recorded, actual, "pid is alive but was reused by another process"
            );
            return Liveness::Dead;
        }
        Liveness::Alive
    }
}

#[cfg(unix)]
fn pid_exists(pid: u32) -> Liveness {
    use nix::{
        errno::Errno,
        sys::signal,
        unistd::Pid as NixPid,
    };

    let Ok(raw) = i32::try_from(pid) else {
        return Liveness::Dead;
    };
    if raw <= 0 {
        return Liveness::Dead;
    }
    match signal::kill(NixPid::from_raw(raw), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        // Exists, owned by someone else.
        Err(Errno::EPERM) => Liveness::Alive,
        Err(e) => {
            debug!(pid, error = %e, "signal probe inconclusive");
            Liveness::Unknown
        },
    }
}

#[cfg(not(unix))]
fn pid_exists(pid: u32) -> Liveness {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return Liveness::Unknown;
    }
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    if system.process(sys_pid).is_some() {
        Liveness::Alive
    } else {
        Liveness::Dead
    }
}

fn process_start_time(pid: u32) -> Option<u64> {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return None;
    }
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    system.process(sys_pid).map(|p| p.start_time())
}
