//! clone(2) wrapper that starts the sandboxed child in new namespaces

use crate::config::SandboxSpec;
use crate::{MockerError, Result};
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Clone a child into the namespaces requested by `spec` and run `entry`
/// in it. Returns the host-visible pid as soon as the kernel has created the
/// process; the child's own setup is gated separately by the start barrier.
///
/// Without CLONE_VM the child runs on a private copy of `stack`, so the
/// parent's buffer can be dropped once this returns. The return value of
/// `entry` becomes the child's exit status.
pub fn launch<F>(spec: &SandboxSpec, entry: F) -> Result<Pid>
where
    F: FnMut() -> isize,
{
    let flags = spec.namespaces().to_clone_flags();
    let mut stack = vec![0u8; spec.stack_size()];

    tracing::debug!(?flags, stack_size = stack.len(), "cloning sandbox child");

    // SAFETY: no CLONE_VM/CLONE_FILES, so the child gets its own copy of the
    // address space and fd table; the callback only touches its own copies.
    let pid = unsafe {
        nix::sched::clone(
            Box::new(entry),
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as i32),
        )
    }
    .map_err(|e| MockerError::Launch(format!("clone with {}: {e}", describe(flags))))?;

    tracing::info!(%pid, "sandbox child created");
    Ok(pid)
}

fn describe(flags: CloneFlags) -> String {
    let names: Vec<_> = [
        (CloneFlags::CLONE_NEWUSER, "user"),
        (CloneFlags::CLONE_NEWPID, "pid"),
        (CloneFlags::CLONE_NEWNS, "mount"),
        (CloneFlags::CLONE_NEWNET, "net"),
        (CloneFlags::CLONE_NEWIPC, "ipc"),
        (CloneFlags::CLONE_NEWUTS, "uts"),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, name)| name)
    .collect();

    if names.is_empty() {
        "no namespaces".to_string()
    } else {
        format!("namespaces [{}]", names.join(", "))
    }
}
