//! Cgroups v2 resource limits

use crate::config::ResourceLimits;
use crate::{MockerError, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const PROCS_FILE: &str = "cgroup.procs";
const MEMORY_MAX_FILE: &str = "memory.max";
const CPU_MAX_FILE: &str = "cpu.max";

/// Where the sandbox cgroup lives in the unified hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupsConfig {
    /// Mount point of the cgroup v2 hierarchy (or a delegated subtree)
    pub root: PathBuf,
    /// Directory name created under `root`
    pub name: String,
}

impl Default for CgroupsConfig {
    fn default() -> Self {
        Self {
            root: default_cgroup_root(),
            name: format!("mocker-{}", std::process::id()),
        }
    }
}

impl CgroupsConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    /// Create the cgroup directory. An existing directory is reused.
    pub fn create_cgroup(&self) -> Result<CgroupHandle> {
        let path = self.path();
        match std::fs::create_dir(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "created cgroup"),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "reusing existing cgroup");
            }
            Err(e) => {
                return Err(MockerError::Setup(format!(
                    "mkdir {}: {e}",
                    path.display()
                )));
            }
        }

        Ok(CgroupHandle {
            name: self.name.clone(),
            path,
            pid: None,
            limits: None,
        })
    }
}

/// Counters read from cpu.stat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub usage_usec: u64,
    /// Enforcement periods that elapsed while the group was runnable
    pub nr_periods: u64,
    /// Periods in which the group exhausted its quota
    pub nr_throttled: u64,
    pub throttled_usec: u64,
}

/// Handle to a cgroup
#[derive(Debug)]
pub struct CgroupHandle {
    name: String,
    path: PathBuf,
    pid: Option<Pid>,
    limits: Option<ResourceLimits>,
}

impl CgroupHandle {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn attached_pid(&self) -> Option<Pid> {
        self.pid
    }

    #[must_use]
    pub const fn limits(&self) -> Option<&ResourceLimits> {
        self.limits.as_ref()
    }

    /// Apply limits then attach `pid`. Only after this returns Ok may the
    /// child be released; a half-configured group would let it run unbounded.
    pub fn configure(&mut self, limits: &ResourceLimits, pid: Pid) -> Result<()> {
        self.apply_limits(limits)?;
        self.add_process(pid)?;
        tracing::info!(cgroup = %self.name, %pid, "cgroup configured");
        Ok(())
    }

    /// Write memory.max and cpu.max
    pub fn apply_limits(&mut self, limits: &ResourceLimits) -> Result<()> {
        self.write_control(MEMORY_MAX_FILE, &limits.memory_max_value())?;
        self.write_control(CPU_MAX_FILE, &limits.cpu_max_value())?;
        self.limits = Some(*limits);
        Ok(())
    }

    /// Add a process to this cgroup. A handle accepts one attachment only.
    pub fn add_process(&mut self, pid: Pid) -> Result<()> {
        if let Some(existing) = self.pid {
            return Err(MockerError::Setup(format!(
                "cgroup {} already has pid {existing} attached",
                self.name
            )));
        }
        self.write_control(PROCS_FILE, &pid.to_string())?;
        self.pid = Some(pid);
        Ok(())
    }

    /// Peak memory usage from memory.peak, if the kernel exposes it (5.19+)
    pub fn memory_peak(&self) -> Result<Option<u64>> {
        let path = self.path.join("memory.peak");
        match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| MockerError::Setup(format!("parse {}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MockerError::Setup(format!("read {}: {e}", path.display()))),
        }
    }

    /// Check memory.events for a non-zero oom_kill counter
    pub fn was_oom_killed(&self) -> Result<bool> {
        let path = self.path.join("memory.events");
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(MockerError::Setup(format!("read {}: {e}", path.display()))),
        };
        Ok(raw
            .lines()
            .filter_map(|line| line.split_once(' '))
            .any(|(key, value)| key == "oom_kill" && value.trim() != "0"))
    }

    /// CPU accounting and throttling counters from cpu.stat.
    ///
    /// The throttling fields only appear once the cpu controller is enabled
    /// for the group; absent keys read as zero.
    pub fn cpu_stat(&self) -> Result<Option<CpuStat>> {
        let path = self.path.join("cpu.stat");
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MockerError::Setup(format!("read {}: {e}", path.display()))),
        };

        let mut stat = CpuStat::default();
        for (key, value) in raw.lines().filter_map(|line| line.split_once(' ')) {
            let slot = match key {
                "usage_usec" => &mut stat.usage_usec,
                "nr_periods" => &mut stat.nr_periods,
                "nr_throttled" => &mut stat.nr_throttled,
                "throttled_usec" => &mut stat.throttled_usec,
                _ => continue,
            };
            *slot = value.trim().parse().map_err(|e| {
                MockerError::Setup(format!("parse {key} in {}: {e}", path.display()))
            })?;
        }
        Ok(Some(stat))
    }

    /// Remove the cgroup directory.
    ///
    /// rmdir fails with EBUSY while the kernel still accounts an exiting
    /// member to the group, so callers treat errors as best-effort.
    pub fn destroy(self) -> Result<()> {
        std::fs::remove_dir(&self.path).map_err(|e| {
            MockerError::Cleanup(format!("rmdir {}: {e}", self.path.display()))
        })?;
        tracing::debug!(cgroup = %self.name, "destroyed cgroup");
        Ok(())
    }

    fn write_control(&self, file: &str, value: &str) -> Result<()> {
        let path = self.path.join(file);
        std::fs::write(&path, value)
            .map_err(|e| MockerError::Setup(format!("write {}: {e}", path.display())))?;
        tracing::debug!(cgroup = %self.name, file, value, "wrote cgroup control");
        Ok(())
    }
}

/// Get cgroup hierarchy root from MOCKER_CGROUP_ROOT env var or system default
///
/// Returns:
/// - `$MOCKER_CGROUP_ROOT` if set (for delegated subtrees)
/// - `/sys/fs/cgroup` otherwise
pub fn default_cgroup_root() -> PathBuf {
    std::env::var("MOCKER_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup"))
}
