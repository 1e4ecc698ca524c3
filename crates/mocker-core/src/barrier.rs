//! One-shot start barrier between the launcher and the sandboxed child
//!
//! A pipe carrying a single byte. The child blocks reading it before doing
//! anything observable; the parent writes it only once id maps and the cgroup
//! are in place. Both halves are consumed by use, so the signal can be sent
//! and received at most once.

use crate::{MockerError, Result};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

const START_SIGNAL: u8 = b'1';

/// Both ends of a fresh barrier pipe
#[derive(Debug)]
pub struct StartBarrier {
    tx: File,
    rx: File,
}

impl StartBarrier {
    /// Create the pipe. Both ends are close-on-exec so neither leaks into
    /// the sandboxed command.
    pub fn new() -> Result<Self> {
        let (rx, tx) = create_pipe()?;
        Ok(Self { tx, rx })
    }

    /// Split into the parent's sending half and the child's receiving half
    pub fn split(self) -> (BarrierSender, BarrierReceiver) {
        let sender_fd = self.tx.as_raw_fd();
        (
            BarrierSender { tx: self.tx },
            BarrierReceiver {
                rx: self.rx,
                sender_fd,
            },
        )
    }
}

/// Parent end of the barrier
#[derive(Debug)]
pub struct BarrierSender {
    tx: File,
}

impl BarrierSender {
    /// Release the child. Dropping the sender without calling this makes the
    /// child's wait fail instead.
    pub fn send(mut self) -> Result<()> {
        let written = loop {
            match self.tx.write(&[START_SIGNAL]) {
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                other => break other,
            }
        }
        .map_err(|e| MockerError::Barrier(format!("write start signal: {e}")))?;

        if written != 1 {
            return Err(MockerError::Barrier(format!(
                "short write on start barrier ({written} bytes)"
            )));
        }
        tracing::debug!("start barrier signaled");
        Ok(())
    }
}

/// Child end of the barrier
#[derive(Debug)]
pub struct BarrierReceiver {
    rx: File,
    /// Parent's write end as inherited across clone
    sender_fd: RawFd,
}

impl BarrierReceiver {
    /// Close the inherited copy of the parent's write end.
    ///
    /// Only call this in the cloned child, where the fd table is a private
    /// copy. Without it the child holds a writer itself and would never see
    /// end-of-file if the parent gives up.
    pub fn close_inherited_sender(&self) {
        // SAFETY: in the child the fd is a duplicate owned by nobody else;
        // the parent's File is never dropped there because the child execs
        // or exits.
        unsafe {
            libc::close(self.sender_fd);
        }
    }

    /// Block until the parent signals. End-of-file or any read error means
    /// the parent aborted setup.
    pub fn wait(mut self) -> Result<()> {
        read_signal(&mut self.rx)
    }
}

fn read_signal(rx: &mut File) -> Result<()> {
    let mut buf = [0u8; 1];
    let read = loop {
        match rx.read(&mut buf) {
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            other => break other,
        }
    }
    .map_err(|e| MockerError::Barrier(format!("read start signal: {e}")))?;

    if read != 1 {
        return Err(MockerError::Barrier(
            "start barrier closed before the parent signaled".into(),
        ));
    }
    Ok(())
}

/// Create a pipe (returns read end, write end)
fn create_pipe() -> Result<(File, File)> {
    let mut fds = [0i32; 2];

    // SAFETY: pipe2 syscall
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    if ret != 0 {
        return Err(MockerError::Setup(format!(
            "barrier pipe: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: We just created these file descriptors
    let read_end = unsafe { File::from_raw_fd(fds[0]) };
    let write_end = unsafe { File::from_raw_fd(fds[1]) };

    Ok((read_end, write_end))
}
