//! # mocker-core
//!
//! Minimal container launcher built on Linux namespaces and cgroup v2.
//!
//! This crate provides the pieces behind `mocker run`:
//! - A child cloned into new pid, mount, uts, user, net and ipc namespaces
//! - A one-shot start barrier so the child waits for its id maps and limits
//! - uid/gid map and setgroups writes for the user namespace
//! - cgroup v2 memory and CPU ceilings
//! - chroot into a throwaway rootfs with a private /proc
//! - Reaping, exit status propagation and teardown

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod barrier;
pub mod child;
pub mod config;
pub mod error;
pub mod isolation;
pub mod reaper;
pub mod result;
pub mod rootfs;
pub mod sandbox;

pub use config::{LaunchConfig, ResourceLimits, SandboxSpec, SandboxSpecBuilder};
pub use error::MockerError;
pub use isolation::{CgroupsConfig, CpuStat, IdMap, NamespaceConfig};
pub use result::{ExitOutcome, FAILURE_EXIT_CODE};
pub use rootfs::{Rootfs, RootfsProvisioner};
pub use sandbox::{Sandbox, SandboxState};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, MockerError>;
