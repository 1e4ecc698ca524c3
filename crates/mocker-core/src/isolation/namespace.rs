//! Linux namespace isolation

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Namespace axes the sandboxed child is cloned into.
///
/// Network and IPC namespaces are created empty and left unconfigured: the
/// child gets a loopback-only network stack and private SysV IPC.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// uid/gid remapping, needed for unprivileged runs
    pub user: bool,
    /// The command becomes pid 1
    pub pid: bool,
    /// Private mount table for the chroot and /proc
    pub mount: bool,
    pub net: bool,
    pub ipc: bool,
    /// Own hostname
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            user: true,
            pid: true,
            mount: true,
            net: true,
            ipc: true,
            uts: true,
        }
    }
}

impl NamespaceConfig {
    /// Flags for clone(2), one CLONE_NEW* per enabled axis
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        [
            (self.user, CloneFlags::CLONE_NEWUSER),
            (self.pid, CloneFlags::CLONE_NEWPID),
            (self.mount, CloneFlags::CLONE_NEWNS),
            (self.net, CloneFlags::CLONE_NEWNET),
            (self.ipc, CloneFlags::CLONE_NEWIPC),
            (self.uts, CloneFlags::CLONE_NEWUTS),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .fold(CloneFlags::empty(), |flags, (_, flag)| flags | flag)
    }
}
