//! Sandbox exit reporting

use crate::isolation::CpuStat;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::time::Duration;

/// Status reported when the sandbox could not be set up or the command
/// was killed by a signal
pub const FAILURE_EXIT_CODE: i32 = 1;

/// How a sandboxed command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code to propagate; the child's own code on normal exit
    pub exit_code: i32,

    /// Terminating signal, if the command was killed
    pub signal: Option<i32>,

    /// Wall-clock time from clone to reap
    pub duration: Duration,

    /// Peak memory of the sandbox cgroup in bytes
    pub memory_peak: Option<u64>,

    /// Whether the memory ceiling triggered the OOM killer
    pub oom_killed: bool,

    /// Pid of the command as the launcher saw it, outside the new PID namespace
    pub host_pid: Option<i32>,

    /// cpu.stat counters of the sandbox cgroup
    pub cpu_stat: Option<CpuStat>,
}

impl ExitOutcome {
    /// Map a terminal wait status. Signals never leak through as
    /// `128 + signo`; they collapse to [`FAILURE_EXIT_CODE`].
    #[must_use]
    pub fn from_wait_status(status: WaitStatus, duration: Duration) -> Self {
        let (exit_code, signal) = match status {
            WaitStatus::Exited(_, code) => (code, None),
            WaitStatus::Signaled(_, signal, _) => (FAILURE_EXIT_CODE, Some(signal as i32)),
            _ => (FAILURE_EXIT_CODE, None),
        };

        Self {
            exit_code,
            signal,
            duration,
            memory_peak: None,
            oom_killed: false,
            host_pid: status.pid().map(Pid::as_raw),
            cpu_stat: None,
        }
    }

    /// Check if the command exited 0 on its own
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}
