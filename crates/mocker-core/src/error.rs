//! Error types for mocker-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MockerError {
    /// Resource allocation before the child exists (rootfs, stack, barrier pipe, cgroup dir)
    #[error("setup error: {0}")]
    Setup(String),

    /// uid_map, gid_map or setgroups write failed
    #[error("id mapping error: {0}")]
    Mapping(String),

    /// clone(2) failed, usually missing privilege or kernel support
    #[error("launch error: {0}")]
    Launch(String),

    #[error("start barrier error: {0}")]
    Barrier(String),

    /// hostname, chroot or /proc setup inside the new namespaces
    #[error("child setup error: {0}")]
    ChildSetup(String),

    #[error("exec error: {0}")]
    Exec(String),

    /// Best-effort teardown; logged, never returned from a run
    #[error("cleanup error: {0}")]
    Cleanup(String),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_failure_class() {
        let cases = [
            (MockerError::Setup("mkdir /tmp/x".into()), "setup error: mkdir /tmp/x"),
            (MockerError::Mapping("write uid_map".into()), "id mapping error: write uid_map"),
            (MockerError::Launch("clone".into()), "launch error: clone"),
            (MockerError::Cleanup("rmdir".into()), "cleanup error: rmdir"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }
}
