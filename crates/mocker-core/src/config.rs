//! Sandbox configuration

use crate::isolation::{CgroupsConfig, IdMap, NamespaceConfig};
use crate::{MockerError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Hostname set inside the UTS namespace unless overridden
pub const DEFAULT_HOSTNAME: &str = "mocker";

/// Smallest stack handed to the cloned child. clone(2) without CLONE_VM still
/// needs its own stack region and the entry point runs on it until exec.
pub const MIN_STACK_SIZE: usize = 1024 * 1024;

/// Linux HOST_NAME_MAX
const MAX_HOSTNAME_LEN: usize = 64;

/// cgroup v2 resource ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// memory.max in bytes, `None` writes "max"
    pub memory_max: Option<u64>,

    /// First field of cpu.max, `None` writes "max"
    pub cpu_quota_us: Option<u64>,

    /// Second field of cpu.max
    pub cpu_period_us: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_max: Some(10_000_000), // 10MB
            cpu_quota_us: Some(10_000),   // 10% of one core
            cpu_period_us: 100_000,
        }
    }
}

impl ResourceLimits {
    /// No ceiling on either controller
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            memory_max: None,
            cpu_quota_us: None,
            cpu_period_us: 100_000,
        }
    }

    /// Contents for memory.max
    #[must_use]
    pub fn memory_max_value(&self) -> String {
        self.memory_max
            .map_or_else(|| "max".to_string(), |bytes| bytes.to_string())
    }

    /// Contents for cpu.max
    #[must_use]
    pub fn cpu_max_value(&self) -> String {
        match self.cpu_quota_us {
            Some(quota) => format!("{quota} {}", self.cpu_period_us),
            None => format!("max {}", self.cpu_period_us),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cpu_period_us == 0 {
            return Err(MockerError::Config("cpu period must be non-zero".into()));
        }
        if self.cpu_quota_us == Some(0) {
            return Err(MockerError::Config("cpu quota must be non-zero".into()));
        }
        if self.memory_max == Some(0) {
            return Err(MockerError::Config("memory limit must be non-zero".into()));
        }
        Ok(())
    }
}

/// Everything needed to launch one sandboxed command. Built once through
/// [`SandboxSpecBuilder`] and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    argv: Vec<CString>,
    rootfs: PathBuf,
    hostname: String,
    namespaces: NamespaceConfig,
    limits: ResourceLimits,
    uid_map: IdMap,
    gid_map: IdMap,
    stack_size: usize,
}

impl SandboxSpec {
    /// Start a builder for `command`; further arguments are added on the builder
    #[must_use]
    pub fn builder(command: impl Into<String>) -> SandboxSpecBuilder {
        SandboxSpecBuilder::new(command)
    }

    /// Program followed by its arguments, ready for execvp
    #[must_use]
    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    #[must_use]
    pub fn program(&self) -> &CString {
        &self.argv[0]
    }

    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub const fn namespaces(&self) -> &NamespaceConfig {
        &self.namespaces
    }

    #[must_use]
    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    #[must_use]
    pub const fn uid_map(&self) -> &IdMap {
        &self.uid_map
    }

    #[must_use]
    pub const fn gid_map(&self) -> &IdMap {
        &self.gid_map
    }

    #[must_use]
    pub const fn stack_size(&self) -> usize {
        self.stack_size
    }
}

/// Builder for SandboxSpec
#[derive(Debug, Clone)]
pub struct SandboxSpecBuilder {
    command: Vec<String>,
    rootfs: Option<PathBuf>,
    hostname: String,
    namespaces: NamespaceConfig,
    limits: ResourceLimits,
    uid_map: Option<IdMap>,
    gid_map: Option<IdMap>,
    stack_size: usize,
}

impl SandboxSpecBuilder {
    fn new(command: impl Into<String>) -> Self {
        Self {
            command: vec![command.into()],
            rootfs: None,
            hostname: DEFAULT_HOSTNAME.to_string(),
            namespaces: NamespaceConfig::default(),
            limits: ResourceLimits::default(),
            uid_map: None,
            gid_map: None,
            stack_size: MIN_STACK_SIZE,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.command.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.rootfs = Some(path.into());
        self
    }

    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    #[must_use]
    pub const fn namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.namespaces = namespaces;
        self
    }

    #[must_use]
    pub const fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub const fn memory_limit(mut self, bytes: u64) -> Self {
        self.limits.memory_max = Some(bytes);
        self
    }

    #[must_use]
    pub const fn cpu_quota(mut self, quota_us: u64, period_us: u64) -> Self {
        self.limits.cpu_quota_us = Some(quota_us);
        self.limits.cpu_period_us = period_us;
        self
    }

    #[must_use]
    pub fn uid_map(mut self, map: IdMap) -> Self {
        self.uid_map = Some(map);
        self
    }

    #[must_use]
    pub fn gid_map(mut self, map: IdMap) -> Self {
        self.gid_map = Some(map);
        self
    }

    #[must_use]
    pub const fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Validate and freeze the spec.
    ///
    /// The rootfs must already exist; id maps default to mapping container
    /// id 0 onto the caller's real uid/gid.
    pub fn build(self) -> Result<SandboxSpec> {
        if self.command.first().is_none_or(String::is_empty) {
            return Err(MockerError::Config("command must not be empty".into()));
        }

        let argv = self
            .command
            .into_iter()
            .map(|arg| {
                CString::new(arg)
                    .map_err(|e| MockerError::Config(format!("argument contains NUL byte: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let rootfs = self
            .rootfs
            .ok_or_else(|| MockerError::Config("rootfs path not set".into()))?;
        if !rootfs.is_dir() {
            return Err(MockerError::Config(format!(
                "rootfs {} does not exist or is not a directory",
                rootfs.display()
            )));
        }

        if self.hostname.is_empty() || self.hostname.len() > MAX_HOSTNAME_LEN {
            return Err(MockerError::Config(format!(
                "hostname must be 1-{MAX_HOSTNAME_LEN} bytes, got {}",
                self.hostname.len()
            )));
        }

        if self.stack_size < MIN_STACK_SIZE {
            return Err(MockerError::Config(format!(
                "stack size {} is below the {MIN_STACK_SIZE} byte minimum",
                self.stack_size
            )));
        }

        self.limits.validate()?;

        Ok(SandboxSpec {
            argv,
            rootfs,
            hostname: self.hostname,
            namespaces: self.namespaces,
            limits: self.limits,
            uid_map: self.uid_map.unwrap_or_else(IdMap::current_uid),
            gid_map: self.gid_map.unwrap_or_else(IdMap::current_gid),
            stack_size: self.stack_size,
        })
    }
}

/// On-disk launcher settings, loaded from JSON and overridden by CLI flags.
/// Every field is optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub hostname: String,
    pub namespaces: NamespaceConfig,
    pub limits: ResourceLimits,
    pub uid_map: Option<IdMap>,
    pub gid_map: Option<IdMap>,
    pub cgroup: CgroupsConfig,
    pub stack_size: usize,

    /// Copy this tree into the rootfs instead of installing busybox
    pub rootfs_template: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            namespaces: NamespaceConfig::default(),
            limits: ResourceLimits::default(),
            uid_map: None,
            gid_map: None,
            cgroup: CgroupsConfig::default(),
            stack_size: MIN_STACK_SIZE,
            rootfs_template: None,
        }
    }
}

impl LaunchConfig {
    /// Read a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MockerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| MockerError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Spec builder pre-populated from these settings
    #[must_use]
    pub fn spec_builder<I, S>(&self, command: impl Into<String>, args: I) -> SandboxSpecBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut builder = SandboxSpec::builder(command)
            .args(args)
            .hostname(self.hostname.clone())
            .namespaces(self.namespaces.clone())
            .limits(self.limits)
            .stack_size(self.stack_size);
        if let Some(map) = &self.uid_map {
            builder = builder.uid_map(map.clone());
        }
        if let Some(map) = &self.gid_map {
            builder = builder.gid_map(map.clone());
        }
        builder
    }
}

/// Applet binary used to populate a fresh rootfs
///
/// Returns:
/// - `$MOCKER_BUSYBOX` if set
/// - the first `busybox` on `$PATH` otherwise
pub fn default_busybox_path() -> Option<PathBuf> {
    std::env::var_os("MOCKER_BUSYBOX")
        .map(PathBuf::from)
        .or_else(|| which::which("busybox").ok())
}
