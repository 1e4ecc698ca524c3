//! Reaping the sandboxed child and releasing what it leaves behind

use crate::isolation::{CgroupHandle, mounts};
use crate::rootfs::Rootfs;
use crate::{MockerError, Result};
use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Block until `pid` exits or is killed
pub fn wait_for_exit(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                tracing::debug!(?status, "sandbox child reaped");
                return Ok(status);
            }
            Ok(status) => tracing::debug!(?status, "ignoring non-terminal wait status"),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(MockerError::Launch(format!("waitpid {pid}: {e}"))),
        }
    }
}

/// Post-exit teardown. Every step runs even if an earlier one failed, and
/// failures are only logged.
#[derive(Debug)]
pub struct Cleanup {
    root: PathBuf,
    rootfs: Option<Rootfs>,
    cgroup: Option<CgroupHandle>,
}

impl Cleanup {
    /// `root` is the sandbox root whose `/proc` gets unmounted. `rootfs`,
    /// when given, is removed afterwards.
    #[must_use]
    pub fn new(root: &Path, rootfs: Option<Rootfs>) -> Self {
        Self {
            root: root.to_path_buf(),
            rootfs,
            cgroup: None,
        }
    }

    /// Take ownership of the cgroup so it is removed during teardown
    pub fn track_cgroup(&mut self, cgroup: CgroupHandle) -> &mut CgroupHandle {
        self.cgroup.insert(cgroup)
    }

    /// Unmount /proc, remove the rootfs, remove the cgroup.
    /// Returns the errors that were logged.
    pub fn run(self) -> Vec<MockerError> {
        let mut errors = Vec::new();

        if let Err(e) = mounts::unmount_proc(&self.root) {
            errors.push(e);
        }
        if let Some(rootfs) = self.rootfs
            && let Err(e) = rootfs.cleanup()
        {
            errors.push(e);
        }
        if let Some(cgroup) = self.cgroup
            && let Err(e) = cgroup.destroy()
        {
            errors.push(e);
        }

        for error in &errors {
            tracing::warn!("{error}");
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::CgroupsConfig;
    use crate::rootfs::RootfsProvisioner;

    fn provisioned(scratch: &Path) -> Rootfs {
        let template = scratch.join("template");
        std::fs::create_dir_all(template.join("bin")).unwrap();
        RootfsProvisioner::template(&template)
            .in_dir(scratch)
            .provision()
            .unwrap()
    }

    #[test]
    fn removes_rootfs_and_cgroup() {
        let scratch = tempfile::tempdir().unwrap();
        let rootfs = provisioned(scratch.path());
        let root = rootfs.path().to_path_buf();

        let cgroups = CgroupsConfig::new(scratch.path(), "cg");
        let mut cleanup = Cleanup::new(&root, Some(rootfs));
        cleanup.track_cgroup(cgroups.create_cgroup().unwrap());

        assert!(cleanup.run().is_empty());
        assert!(!root.exists());
        assert!(!scratch.path().join("cg").exists());
    }

    #[test]
    fn failures_do_not_stop_later_steps() {
        let scratch = tempfile::tempdir().unwrap();
        let rootfs = provisioned(scratch.path());
        let root = rootfs.path().to_path_buf();

        let mut cleanup = Cleanup::new(&root, Some(rootfs));
        let cgroup = cleanup.track_cgroup(
            CgroupsConfig::new(scratch.path(), "cg")
                .create_cgroup()
                .unwrap(),
        );
        // leaves a file behind so rmdir fails like a still-busy cgroup
        cgroup.add_process(Pid::from_raw(1)).unwrap();

        let errors = cleanup.run();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], MockerError::Cleanup(_)));
        assert!(!root.exists());
    }

    #[test]
    fn borrowed_root_is_left_in_place() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir(scratch.path().join("proc")).unwrap();

        assert!(Cleanup::new(scratch.path(), None).run().is_empty());
        assert!(scratch.path().exists());
        assert!(!scratch.path().join("proc").exists());
    }

    #[test]
    fn wait_reports_exit_code() {
        let child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 7"])
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());

        assert_eq!(wait_for_exit(pid).unwrap(), WaitStatus::Exited(pid, 7));
    }
}
