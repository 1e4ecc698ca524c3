//! Linux isolation primitives
//!
//! This module contains the pieces the launcher stitches together:
//! - `clone` - clone(2) into new namespaces on a dedicated stack
//! - `namespace` - which namespace axes to isolate
//! - `idmap` - uid/gid maps and setgroups policy for the user namespace
//! - `cgroups` - cgroup v2 memory/CPU ceilings
//! - `mounts` - chroot and a namespace-scoped /proc

pub mod cgroups;
pub mod clone;
pub mod idmap;
pub mod mounts;
pub mod namespace;

pub use self::cgroups::{CgroupHandle, CgroupsConfig, CpuStat};
pub use self::idmap::{IdMap, IdMapEntry, IdMapWriter};
pub use self::namespace::NamespaceConfig;
