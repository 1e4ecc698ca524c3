//! Temporary root filesystem for a sandbox
//!
//! A fresh directory under the system temp dir holding `bin/` and an empty
//! `proc/` mount point. `bin/` is filled either from a statically linked
//! multi-applet binary (busybox) plus one symlink per applet, or by copying a
//! template tree. Everything is plain filesystem calls, no shell.

use crate::{MockerError, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Prefix of the temporary rootfs directory name
pub const ROOTFS_PREFIX: &str = "mocker";

/// Applets linked into `bin/` when provisioning from busybox
pub const APPLETS: &[&str] = &[
    "sh", "ash", "ls", "cat", "date", "echo", "env", "false", "free", "head", "hostname", "id",
    "kill", "mkdir", "mount", "ps", "pwd", "rm", "seq", "sleep", "tail", "top", "touch", "true",
    "umount", "uname", "wc", "yes",
];

#[derive(Debug, Clone)]
enum Source {
    Busybox(PathBuf),
    Template(PathBuf),
}

/// Builds ready-to-chroot directories
#[derive(Debug, Clone)]
pub struct RootfsProvisioner {
    source: Source,
    parent: PathBuf,
}

impl RootfsProvisioner {
    /// Populate `bin/` from a multi-applet binary
    #[must_use]
    pub fn busybox(binary: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::Busybox(binary.into()),
            parent: std::env::temp_dir(),
        }
    }

    /// Copy an existing tree as the rootfs
    #[must_use]
    pub fn template(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::Template(dir.into()),
            parent: std::env::temp_dir(),
        }
    }

    /// Busybox found through `MOCKER_BUSYBOX` or `PATH`
    pub fn from_env() -> Result<Self> {
        crate::config::default_busybox_path()
            .map(Self::busybox)
            .ok_or_else(|| {
                MockerError::Setup(
                    "no busybox found; set MOCKER_BUSYBOX to a statically linked busybox \
                     or pass a rootfs template"
                        .into(),
                )
            })
    }

    /// Create the temporary directory somewhere other than the system temp dir
    #[must_use]
    pub fn in_dir(mut self, parent: impl Into<PathBuf>) -> Self {
        self.parent = parent.into();
        self
    }

    pub fn provision(&self) -> Result<Rootfs> {
        let dir = tempfile::Builder::new()
            .prefix(ROOTFS_PREFIX)
            .tempdir_in(&self.parent)
            .map_err(|e| {
                MockerError::Setup(format!("create rootfs in {}: {e}", self.parent.display()))
            })?;

        match &self.source {
            Source::Busybox(binary) => install_busybox(binary, dir.path())?,
            Source::Template(template) => copy_tree(template, dir.path())?,
        }

        let proc = dir.path().join(crate::isolation::mounts::PROC_DIR);
        create_dir_all(&proc)?;

        tracing::info!(path = %dir.path().display(), "rootfs provisioned");
        Ok(Rootfs { dir })
    }
}

/// A provisioned root directory, removed on [`Rootfs::cleanup`] or drop
#[derive(Debug)]
pub struct Rootfs {
    dir: TempDir,
}

impl Rootfs {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the whole tree, reporting failures instead of swallowing them
    pub fn cleanup(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| MockerError::Cleanup(format!("remove {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "rootfs removed");
        Ok(())
    }
}

fn install_busybox(binary: &Path, root: &Path) -> Result<()> {
    if !binary.is_file() {
        return Err(MockerError::Setup(format!(
            "busybox binary {} not found",
            binary.display()
        )));
    }
    ensure_static(binary)?;

    let bin = root.join("bin");
    create_dir_all(&bin)?;

    let target = bin.join("busybox");
    fs::copy(binary, &target).map_err(|e| {
        MockerError::Setup(format!(
            "copy {} to {}: {e}",
            binary.display(),
            target.display()
        ))
    })?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
        .map_err(|e| MockerError::Setup(format!("chmod {}: {e}", target.display())))?;

    for applet in APPLETS {
        let link = bin.join(applet);
        symlink("busybox", &link)
            .map_err(|e| MockerError::Setup(format!("symlink {}: {e}", link.display())))?;
    }

    tracing::debug!(applets = APPLETS.len(), "installed busybox");
    Ok(())
}

/// The rootfs carries no loader or libc, so the binary must not request a
/// program interpreter.
fn ensure_static(binary: &Path) -> Result<()> {
    let bytes = fs::read(binary)
        .map_err(|e| MockerError::Setup(format!("read {}: {e}", binary.display())))?;
    let elf = goblin::elf::Elf::parse(&bytes).map_err(|e| {
        MockerError::Setup(format!("{} is not an ELF executable: {e}", binary.display()))
    })?;

    if let Some(interpreter) = elf.interpreter {
        return Err(MockerError::Setup(format!(
            "{} is dynamically linked (interpreter {interpreter}); \
             a statically linked busybox is required",
            binary.display()
        )));
    }
    Ok(())
}

/// Recursively copy `src` into `dst`, keeping symlinks as symlinks and
/// file modes as they are. Sockets, fifos and device nodes are skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)
        .map_err(|e| MockerError::Setup(format!("stat {}: {e}", src.display())))?;
    if !meta.is_dir() {
        return Err(MockerError::Setup(format!(
            "{} is not a directory",
            src.display()
        )));
    }

    create_dir_all(dst)?;
    fs::set_permissions(dst, meta.permissions())
        .map_err(|e| MockerError::Setup(format!("chmod {}: {e}", dst.display())))?;

    let entries =
        fs::read_dir(src).map_err(|e| MockerError::Setup(format!("read {}: {e}", src.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| MockerError::Setup(format!("read {}: {e}", src.display())))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let kind = entry
            .file_type()
            .map_err(|e| MockerError::Setup(format!("stat {}: {e}", from.display())))?;

        if kind.is_dir() {
            copy_tree(&from, &to)?;
        } else if kind.is_symlink() {
            let link = fs::read_link(&from)
                .map_err(|e| MockerError::Setup(format!("readlink {}: {e}", from.display())))?;
            symlink(&link, &to)
                .map_err(|e| MockerError::Setup(format!("symlink {}: {e}", to.display())))?;
        } else if kind.is_file() {
            fs::copy(&from, &to).map_err(|e| {
                MockerError::Setup(format!("copy {} to {}: {e}", from.display(), to.display()))
            })?;
        } else {
            tracing::warn!(path = %from.display(), "skipping special file");
        }
    }

    Ok(())
}

fn create_dir_all(path: &Path) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(MockerError::Setup(format!("mkdir {}: {e}", path.display()))),
    }
}
