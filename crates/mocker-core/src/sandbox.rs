//! Parent side of a sandbox run: clone, configure, release, reap

use crate::barrier::{BarrierSender, StartBarrier};
use crate::child::ChildEntry;
use crate::config::SandboxSpec;
use crate::isolation::{CgroupHandle, CgroupsConfig, IdMapWriter, clone};
use crate::reaper::{self, Cleanup};
use crate::result::{ExitOutcome, FAILURE_EXIT_CODE};
use crate::rootfs::Rootfs;
use crate::Result;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Cloned, blocked on the start barrier
    Created,
    /// Parent is writing id maps and cgroup settings
    Configuring,
    /// Barrier released, child is running its setup or the command
    Started,
    /// Reaped
    Exited,
}

/// The cloned child as seen from the parent
#[derive(Debug)]
pub(crate) struct SandboxProcess {
    pid: Pid,
    state: SandboxState,
    started_at: Instant,
}

impl SandboxProcess {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: SandboxState::Created,
            started_at: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn transition(&mut self, next: SandboxState) {
        tracing::debug!(pid = %self.pid, from = ?self.state, to = ?next, "sandbox state");
        self.state = next;
    }

    fn wait(&mut self) -> Result<WaitStatus> {
        let status = reaper::wait_for_exit(self.pid)?;
        self.transition(SandboxState::Exited);
        Ok(status)
    }

    /// Kill and reap a child that never got past the barrier
    fn abort(&mut self) {
        tracing::warn!(pid = %self.pid, state = ?self.state, "aborting sandbox");
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid = %self.pid, "kill: {e}"),
        }
        if let Err(e) = self.wait() {
            tracing::warn!("{e}");
        }
    }
}

/// One sandboxed command, from clone to cleanup
#[derive(Debug)]
pub struct Sandbox {
    spec: SandboxSpec,
    cgroups: CgroupsConfig,
    id_maps: IdMapWriter,
    rootfs: Option<Rootfs>,
}

impl Sandbox {
    #[must_use]
    pub fn new(spec: SandboxSpec, cgroups: CgroupsConfig) -> Self {
        Self {
            spec,
            cgroups,
            id_maps: IdMapWriter::default(),
            rootfs: None,
        }
    }

    /// Hand over the provisioned rootfs so it is removed after the run.
    /// Its path should be the one the spec was built with.
    #[must_use]
    pub fn with_rootfs(mut self, rootfs: Rootfs) -> Self {
        self.rootfs = Some(rootfs);
        self
    }

    #[must_use]
    pub fn with_id_map_writer(mut self, writer: IdMapWriter) -> Self {
        self.id_maps = writer;
        self
    }

    /// Run the command to completion.
    ///
    /// Returns an error only when the sandbox could not be started; once the
    /// child is released its exit status is reported through [`ExitOutcome`].
    /// Teardown runs on both paths.
    pub fn run(self) -> Result<ExitOutcome> {
        let Self {
            spec,
            cgroups,
            id_maps,
            rootfs,
        } = self;

        let mut cleanup = Cleanup::new(spec.rootfs(), rootfs);
        let result = supervise(&spec, &cgroups, &id_maps, &mut cleanup);
        cleanup.run();

        if let Ok(outcome) = &result {
            tracing::info!(
                exit_code = outcome.exit_code,
                signal = ?outcome.signal,
                duration_ms = outcome.duration.as_millis(),
                "sandbox finished"
            );
        }
        result
    }
}

fn supervise(
    spec: &SandboxSpec,
    cgroups: &CgroupsConfig,
    id_maps: &IdMapWriter,
    cleanup: &mut Cleanup,
) -> Result<ExitOutcome> {
    let cgroup = cleanup.track_cgroup(cgroups.create_cgroup()?);
    let (sender, receiver) = StartBarrier::new()?.split();

    let mut receiver = Some(receiver);
    let pid = clone::launch(spec, || match receiver.take() {
        Some(rx) => ChildEntry::new(spec).run(rx),
        None => FAILURE_EXIT_CODE as isize,
    })?;
    // the child has its own copy; ours must go so EOF reaches it on abort
    drop(receiver);

    let mut process = SandboxProcess::new(pid);
    process.transition(SandboxState::Configuring);
    if let Err(e) = release(spec, id_maps, cgroup, pid, sender) {
        process.abort();
        return Err(e);
    }
    process.transition(SandboxState::Started);

    let status = process.wait()?;
    let mut outcome = ExitOutcome::from_wait_status(status, process.elapsed());
    collect_usage(cgroup, &mut outcome);
    Ok(outcome)
}

/// Write id maps and cgroup settings, then signal the barrier. On error the
/// sender is dropped unsignaled.
fn release(
    spec: &SandboxSpec,
    id_maps: &IdMapWriter,
    cgroup: &mut CgroupHandle,
    pid: Pid,
    sender: BarrierSender,
) -> Result<()> {
    if spec.namespaces().user {
        id_maps.configure(pid, spec.uid_map(), spec.gid_map())?;
    }
    cgroup.configure(spec.limits(), pid)?;
    sender.send()
}

fn collect_usage(cgroup: &CgroupHandle, outcome: &mut ExitOutcome) {
    match cgroup.memory_peak() {
        Ok(peak) => outcome.memory_peak = peak,
        Err(e) => tracing::debug!("{e}"),
    }
    match cgroup.was_oom_killed() {
        Ok(killed) => outcome.oom_killed = killed,
        Err(e) => tracing::debug!("{e}"),
    }
    match cgroup.cpu_stat() {
        Ok(stat) => outcome.cpu_stat = stat,
        Err(e) => tracing::debug!("{e}"),
    }
    if outcome.oom_killed {
        tracing::warn!(pid = ?cgroup.attached_pid(), "sandbox hit its memory limit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn usage_read_from_cgroup_files() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = CgroupsConfig::new(root.path(), "box").create_cgroup().unwrap();
        fs::write(cgroup.path().join("memory.peak"), "4096\n").unwrap();
        fs::write(
            cgroup.path().join("memory.events"),
            "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n",
        )
        .unwrap();
        fs::write(
            cgroup.path().join("cpu.stat"),
            "usage_usec 200000\nnr_periods 20\nnr_throttled 18\nthrottled_usec 1700000\n",
        )
        .unwrap();

        let mut outcome = ExitOutcome::from_wait_status(
            WaitStatus::Signaled(Pid::from_raw(2), Signal::SIGKILL, false),
            Duration::ZERO,
        );
        collect_usage(&cgroup, &mut outcome);

        assert_eq!(outcome.memory_peak, Some(4096));
        assert!(outcome.oom_killed);
        assert_eq!(outcome.cpu_stat.map(|stat| stat.nr_throttled), Some(18));
        assert_eq!(outcome.host_pid, Some(2));
        assert_eq!(outcome.exit_code, FAILURE_EXIT_CODE);
    }

    #[test]
    fn missing_usage_files_are_not_errors() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = CgroupsConfig::new(root.path(), "box").create_cgroup().unwrap();

        let mut outcome = ExitOutcome::from_wait_status(
            WaitStatus::Exited(Pid::from_raw(2), 0),
            Duration::ZERO,
        );
        collect_usage(&cgroup, &mut outcome);

        assert_eq!(outcome.memory_peak, None);
        assert!(!outcome.oom_killed);
        assert_eq!(outcome.cpu_stat, None);
    }

    #[test]
    fn failed_cgroup_creation_still_removes_rootfs() {
        let scratch = tempfile::tempdir().unwrap();
        let template = scratch.path().join("template");
        fs::create_dir_all(template.join("bin")).unwrap();
        let rootfs = crate::rootfs::RootfsProvisioner::template(&template)
            .in_dir(scratch.path())
            .provision()
            .unwrap();
        let root = rootfs.path().to_path_buf();

        let spec = SandboxSpec::builder("/bin/true").rootfs(&root).build().unwrap();
        // a regular file where the cgroup hierarchy should be
        let bogus = scratch.path().join("not-a-hierarchy");
        fs::write(&bogus, "").unwrap();

        let err = Sandbox::new(spec, CgroupsConfig::new(&bogus, "box"))
            .with_rootfs(rootfs)
            .run()
            .unwrap_err();

        assert!(matches!(err, crate::MockerError::Setup(_)));
        assert!(!root.exists());
    }
}
