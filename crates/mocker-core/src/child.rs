//! Code that runs inside the cloned child, up to exec

use crate::barrier::BarrierReceiver;
use crate::config::SandboxSpec;
use crate::isolation::mounts;
use crate::result::FAILURE_EXIT_CODE;
use crate::{MockerError, Result};
use std::convert::Infallible;
use std::path::Path;

/// Progress of the child through its fixed setup sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildState {
    WaitingForBarrier,
    HostnameSet,
    RootChanged,
    ProcMounted,
    /// Never observed from inside: the process image is gone
    Execd,
    Failed(String),
}

/// Child entry point: barrier, hostname, chroot, /proc, exec.
///
/// Every step is fatal on error. There is no retry because the parent has
/// already released the barrier and cannot help any more.
#[derive(Debug)]
pub struct ChildEntry<'a> {
    spec: &'a SandboxSpec,
    state: ChildState,
}

impl<'a> ChildEntry<'a> {
    #[must_use]
    pub const fn new(spec: &'a SandboxSpec) -> Self {
        Self {
            spec,
            state: ChildState::WaitingForBarrier,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &ChildState {
        &self.state
    }

    /// Run the sequence. Only returns on failure, with the status the child
    /// should exit with.
    pub fn run(mut self, barrier: BarrierReceiver) -> isize {
        barrier.close_inherited_sender();

        let err = match self.advance(barrier) {
            Ok(never) => match never {},
            Err(e) => e,
        };

        tracing::error!(state = ?self.state, "sandbox setup failed: {err}");
        self.state = ChildState::Failed(err.to_string());
        FAILURE_EXIT_CODE as isize
    }

    fn advance(&mut self, barrier: BarrierReceiver) -> Result<Infallible> {
        barrier.wait()?;

        if self.spec.namespaces().uts {
            nix::unistd::sethostname(self.spec.hostname()).map_err(|e| {
                MockerError::ChildSetup(format!("sethostname {}: {e}", self.spec.hostname()))
            })?;
        }
        self.state = ChildState::HostnameSet;

        if self.spec.namespaces().mount {
            mounts::make_root_private()?;
        }
        mounts::change_root(self.spec.rootfs())?;
        self.state = ChildState::RootChanged;

        mounts::mount_proc()?;
        self.state = ChildState::ProcMounted;

        Err(self.exec())
    }

    fn exec(&self) -> MockerError {
        let program = self.spec.program();
        let Err(errno) = nix::unistd::execvp(program, self.spec.argv());

        let err = MockerError::Exec(format!("execvp {}: {errno}", program.to_string_lossy()));
        if let Err(cleanup) = mounts::unmount_proc(Path::new("/")) {
            tracing::warn!("{cleanup}");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::StartBarrier;

    #[test]
    fn fails_before_any_action_when_barrier_drops() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SandboxSpec::builder("/bin/true").rootfs(dir.path()).build().unwrap();
        let (tx, rx) = StartBarrier::new().unwrap().split();

        let mut entry = ChildEntry::new(&spec);
        assert_eq!(entry.state(), &ChildState::WaitingForBarrier);

        // run() would close the sender fd; drive the steps directly instead
        drop(tx);
        let err = entry.advance(rx).unwrap_err();
        assert!(matches!(err, MockerError::Barrier(_)));
        assert_eq!(entry.state(), &ChildState::WaitingForBarrier);
    }
}
