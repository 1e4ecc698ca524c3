//! User namespace uid/gid mapping
//!
//! The parent writes `/proc/<pid>/uid_map`, `/proc/<pid>/setgroups` and
//! `/proc/<pid>/gid_map` for the still-blocked child. The kernel accepts each
//! map file exactly once and only as a single write(2), so the whole map is
//! rendered up front and written in one call.

use crate::{MockerError, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One `container_id host_id length` line of a map file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapEntry {
    pub container_id: u32,
    pub host_id: u32,
    pub length: u32,
}

/// Ordered set of mapping lines for one of uid_map/gid_map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdMap {
    entries: Vec<IdMapEntry>,
}

impl IdMap {
    /// Map `length` ids starting at `container_id` onto `host_id`
    #[must_use]
    pub fn single(container_id: u32, host_id: u32, length: u32) -> Self {
        Self {
            entries: vec![IdMapEntry {
                container_id,
                host_id,
                length,
            }],
        }
    }

    /// Container root onto the caller's real uid
    #[must_use]
    pub fn current_uid() -> Self {
        Self::single(0, nix::unistd::getuid().as_raw(), 1)
    }

    /// Container root group onto the caller's real gid
    #[must_use]
    pub fn current_gid() -> Self {
        Self::single(0, nix::unistd::getgid().as_raw(), 1)
    }

    #[must_use]
    pub fn entries(&self) -> &[IdMapEntry] {
        &self.entries
    }
}

/// Turn the comma-separated shorthand into the kernel's line format.
///
/// Every segment becomes exactly one newline-terminated line; empty segments
/// and surrounding whitespace are dropped.
#[must_use]
pub fn normalize_map(raw: &str) -> String {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .fold(String::new(), |mut out, segment| {
            out.push_str(segment);
            out.push('\n');
            out
        })
}

impl FromStr for IdMap {
    type Err = MockerError;

    fn from_str(raw: &str) -> Result<Self> {
        let entries = normalize_map(raw)
            .lines()
            .map(|line| {
                let fields = line
                    .split_whitespace()
                    .map(str::parse::<u32>)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| MockerError::Config(format!("invalid id map line {line:?}: {e}")))?;
                match fields.as_slice() {
                    &[container_id, host_id, length] if length > 0 => Ok(IdMapEntry {
                        container_id,
                        host_id,
                        length,
                    }),
                    _ => Err(MockerError::Config(format!(
                        "id map line {line:?} must be \"<container_id> <host_id> <length>\" with length > 0"
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        if entries.is_empty() {
            return Err(MockerError::Config("id map is empty".into()));
        }

        Ok(Self { entries })
    }
}

impl TryFrom<String> for IdMap {
    type Error = MockerError;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<IdMap> for String {
    fn from(map: IdMap) -> Self {
        map.to_string()
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{} {} {}", entry.container_id, entry.host_id, entry.length)?;
        }
        Ok(())
    }
}

/// Writes id maps for a child addressed by pid under a proc mount
#[derive(Debug, Clone)]
pub struct IdMapWriter {
    proc_root: PathBuf,
}

impl Default for IdMapWriter {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl IdMapWriter {
    /// Writer against a different proc root; tests point this at a temp dir
    #[must_use]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn target(&self, pid: Pid, file: &str) -> PathBuf {
        self.proc_root.join(pid.to_string()).join(file)
    }

    /// uid_map, then setgroups=deny, then gid_map.
    ///
    /// setgroups must be denied before gid_map is written or the kernel
    /// rejects the gid map for a user namespace created without CAP_SETGID.
    pub fn configure(&self, pid: Pid, uid_map: &IdMap, gid_map: &IdMap) -> Result<()> {
        self.write_uid_map(pid, uid_map)?;
        self.deny_setgroups(pid)?;
        self.write_gid_map(pid, gid_map)?;
        tracing::info!(%pid, "id mappings written");
        Ok(())
    }

    pub fn write_uid_map(&self, pid: Pid, map: &IdMap) -> Result<()> {
        write_map_file(&self.target(pid, "uid_map"), &map.to_string())
    }

    pub fn write_gid_map(&self, pid: Pid, map: &IdMap) -> Result<()> {
        write_map_file(&self.target(pid, "gid_map"), &map.to_string())
    }

    /// Write "deny" to setgroups. A missing file means a kernel older than
    /// 3.19 and is not an error.
    pub fn deny_setgroups(&self, pid: Pid) -> Result<()> {
        let path = self.target(pid, "setgroups");
        match write_map_file(&path, "deny") {
            Err(MockerError::Mapping(_)) if !path.exists() => {
                tracing::debug!(path = %path.display(), "setgroups control absent, skipping");
                Ok(())
            }
            other => other,
        }
    }
}

fn write_map_file(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            MockerError::Mapping(format!("open {}: no such file", path.display()))
        } else {
            MockerError::Mapping(format!("open {}: {e}", path.display()))
        }
    })?;

    let written = file
        .write(contents.as_bytes())
        .map_err(|e| MockerError::Mapping(format!("write {}: {e}", path.display())))?;
    if written != contents.len() {
        return Err(MockerError::Mapping(format!(
            "write {}: short write ({written} of {} bytes)",
            path.display(),
            contents.len()
        )));
    }

    tracing::debug!(path = %path.display(), contents = contents.trim_end(), "wrote id map control");
    Ok(())
}
