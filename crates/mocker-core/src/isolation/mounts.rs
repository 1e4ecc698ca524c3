//! Root change and namespace-scoped /proc

use crate::{MockerError, Result};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::Path;

/// Mount point for proc, relative to the sandbox root
pub const PROC_DIR: &str = "proc";

/// Stop mount events from propagating back to the host namespace.
/// Must run inside a fresh mount namespace.
pub fn make_root_private() -> Result<()> {
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| MockerError::ChildSetup(format!("make / private: {e}")))?;
    Ok(())
}

/// chroot into `new_root` and move to its `/`
pub fn change_root(new_root: &Path) -> Result<()> {
    tracing::debug!(root = %new_root.display(), "chroot");

    nix::unistd::chroot(new_root)
        .map_err(|e| MockerError::ChildSetup(format!("chroot {}: {e}", new_root.display())))?;
    std::env::set_current_dir("/")
        .map_err(|e| MockerError::ChildSetup(format!("chdir /: {e}")))?;
    Ok(())
}

/// Mount a fresh proc at `/proc` of the current root, creating the mount
/// point when the rootfs lacks one. Shows only the new PID namespace.
pub fn mount_proc() -> Result<()> {
    let target = Path::new("/").join(PROC_DIR);

    match std::fs::DirBuilder::new().mode(0o755).create(&target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(MockerError::ChildSetup(format!(
                "mkdir {}: {e}",
                target.display()
            )));
        }
    }

    nix::mount::mount(
        Some("proc"),
        &target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| MockerError::ChildSetup(format!("mount proc on {}: {e}", target.display())))?;

    Ok(())
}

/// Lazily detach `<root>/proc` and remove the mount point.
///
/// "Not mounted" is success: with a private mount namespace the mount dies
/// with the child and the host only sees the empty directory.
pub fn unmount_proc(root: &Path) -> Result<()> {
    let target = root.join(PROC_DIR);
    if !target.exists() {
        return Ok(());
    }

    if is_mount_point(root, &target)? {
        match nix::mount::umount2(&target, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL) => {
                tracing::debug!(path = %target.display(), "unmounted proc");
            }
            Err(e) => {
                return Err(MockerError::Cleanup(format!(
                    "umount {}: {e}",
                    target.display()
                )));
            }
        }
    }

    match std::fs::remove_dir(&target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MockerError::Cleanup(format!(
            "rmdir {}: {e}",
            target.display()
        ))),
    }
}

/// A mount point sits on a different device than its parent
fn is_mount_point(parent: &Path, target: &Path) -> Result<bool> {
    let dev = |path: &Path| {
        std::fs::symlink_metadata(path)
            .map(|meta| meta.dev())
            .map_err(|e| MockerError::Cleanup(format!("stat {}: {e}", path.display())))
    };
    Ok(dev(parent)? != dev(target)?)
}
