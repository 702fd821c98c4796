//! Task seizure and run-state classification.

use std::fs;
use std::io;
use std::ptr;
use std::thread;
use std::time::Duration;

use libc::{c_void, pid_t, SIGSTOP, __WALL};

use super::ptrace::{PTRACE_DETACH, PTRACE_INTERRUPT, PTRACE_SEIZE};
use crate::error::{InfectError, Result};

/// Stable run states a seized task can settle into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Alive,
    Dead,
    Stopped,
    Zombie,
}

/// Snapshot of the /proc status fields the controller consults while
/// waiting for a seized task to settle.
#[derive(Debug, Clone, Default)]
pub struct TaskStatus {
    pub state: char,
    pub ppid: pid_t,
    pub sigpnd: u64,
    pub shdpnd: u64,
    pub seccomp_mode: i32,
}

/// Externally supplied process-status probe.
pub trait StatusProbe {
    fn status(&mut self, pid: pid_t) -> io::Result<TaskStatus>;
}

/// Default probe reading /proc/<pid>/stat and /proc/<pid>/status.
#[derive(Debug, Default)]
pub struct ProcStatusProbe;

impl StatusProbe for ProcStatusProbe {
    fn status(&mut self, pid: pid_t) -> io::Result<TaskStatus> {
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;
        // comm may contain spaces and parens; fields resume after the
        // last ')'
        let rest = stat
            .rfind(')')
            .map(|i| &stat[i + 1..])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat"))?;
        let mut fields = rest.split_ascii_whitespace();
        let state = fields
            .next()
            .and_then(|s| s.chars().next())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing state"))?;
        let ppid = fields
            .next()
            .and_then(|s| s.parse::<pid_t>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing ppid"))?;

        let mut st = TaskStatus {
            state,
            ppid,
            ..TaskStatus::default()
        };
        let status = fs::read_to_string(format!("/proc/{}/status", pid))?;
        for line in status.lines() {
            if let Some(v) = line.strip_prefix("SigPnd:") {
                st.sigpnd = u64::from_str_radix(v.trim(), 16).unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("ShdPnd:") {
                st.shdpnd = u64::from_str_radix(v.trim(), 16).unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("Seccomp:") {
                st.seccomp_mode = v.trim().parse().unwrap_or(0);
            }
        }
        Ok(st)
    }
}

/// Attach to `pid` without altering its pending signal state.
///
/// On any partial attach the task is detached again, so a failed seize
/// never leaves the target modified.
pub fn seize(pid: pid_t) -> Result<()> {
    let ret = unsafe {
        libc::ptrace(
            PTRACE_SEIZE,
            pid,
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    if ret != 0 {
        return Err(InfectError::AttachFailed {
            pid,
            reason: format!("PTRACE_SEIZE: {}", io::Error::last_os_error()),
        });
    }

    let ret = unsafe {
        libc::ptrace(
            PTRACE_INTERRUPT,
            pid,
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        detach(pid);
        return Err(InfectError::AttachFailed {
            pid,
            reason: format!("PTRACE_INTERRUPT: {}", err),
        });
    }
    Ok(())
}

/// Detach from `pid`, best effort.
pub fn detach(pid: pid_t) {
    let ret = unsafe {
        libc::ptrace(
            PTRACE_DETACH,
            pid,
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    if ret != 0 {
        log::debug!(
            "PTRACE_DETACH for {} failed: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

const WAIT_POLL_MAX: u32 = 100;
const WAIT_POLL_DELAY: Duration = Duration::from_millis(1);

/// Poll `probe` until the seized task reaches a stable state.
///
/// `ppid` of -1 skips the reparent check. A task that never settles, or
/// that shows a run state outside the known set, is a classified attach
/// failure; the caller detaches and the target keeps running untouched.
pub fn wait_task(pid: pid_t, ppid: pid_t, probe: &mut dyn StatusProbe) -> Result<TaskState> {
    let mut settled = None;

    for _ in 0..WAIT_POLL_MAX {
        let st = match probe.status(pid) {
            Ok(st) => st,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TaskState::Dead),
            Err(e) => {
                return Err(InfectError::AttachFailed {
                    pid,
                    reason: format!("status probe: {}", e),
                })
            }
        };

        if ppid != -1 && st.ppid != ppid {
            return Err(InfectError::AttachFailed {
                pid,
                reason: format!("task reparented from {} to {}", ppid, st.ppid),
            });
        }

        match st.state {
            'Z' => return Ok(TaskState::Zombie),
            'X' | 'x' => return Ok(TaskState::Dead),
            't' | 'T' => {
                // Trace stop reached. A pending SIGSTOP means the task
                // was group-stopped before we came.
                let stop_bit = 1u64 << (SIGSTOP - 1);
                if st.state == 'T' || (st.sigpnd | st.shdpnd) & stop_bit != 0 {
                    settled = Some(TaskState::Stopped);
                } else {
                    settled = Some(TaskState::Alive);
                }
                break;
            }
            'R' | 'S' | 'D' => {
                // Still on the way to the interrupt stop.
                thread::sleep(WAIT_POLL_DELAY);
            }
            other => {
                return Err(InfectError::AttachFailed {
                    pid,
                    reason: format!("unexpected run state '{}'", other),
                })
            }
        }
    }

    let state = settled.ok_or_else(|| InfectError::AttachFailed {
        pid,
        reason: "task did not settle after seize".into(),
    })?;

    // Consume the interrupt notification so later waits only ever see
    // parasite traps.
    let mut status: i32 = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, __WALL) };
    if ret != pid || !wifstopped(status) {
        return Err(InfectError::AttachFailed {
            pid,
            reason: format!("bad wait status {:#x}", status),
        });
    }

    log::debug!("task {} seized in state {:?}", pid, state);
    Ok(state)
}

// Wrappers for libc wait status macros
pub(crate) fn wifstopped(status: i32) -> bool {
    (status & 0xff) == 0x7f
}

pub(crate) fn wstopsig(status: i32) -> i32 {
    (status >> 8) & 0xff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_probe_reads_own_status() {
        let mut probe = ProcStatusProbe;
        let st = probe.status(std::process::id() as pid_t).unwrap();
        assert!(matches!(st.state, 'R' | 'S'));
        assert!(st.ppid > 0);
        assert!(st.seccomp_mode >= 0);
    }

    #[test]
    fn probe_on_missing_pid_is_not_found() {
        let mut probe = ProcStatusProbe;
        // PID 0 never has a /proc entry from our point of view
        let err = probe.status(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn wait_status_helpers() {
        let stopped = (libc::SIGTRAP << 8) | 0x7f;
        assert!(wifstopped(stopped));
        assert_eq!(wstopsig(stopped), libc::SIGTRAP);
        assert!(!wifstopped(0));
    }
}
