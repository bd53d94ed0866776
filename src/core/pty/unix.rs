//! Unix pseudo terminals through `portable-pty`

use std::io::{self, Read, Write};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::{LaunchCommand, Pty, PtyError, Result};
use crate::core::term::TerminalSize;

/// Raised by the master once every slave descriptor is closed
const EIO: i32 = 5;

/// How often a blocked read looks at the close flag
const READ_POLL_MS: i32 = 100;

/// Time the process group gets to exit after SIGHUP before SIGKILL
const HANGUP_GRACE: Duration = Duration::from_millis(100);

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows(),
        cols: size.columns(),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn other_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

pub struct UnixPty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    /// Shared with the reader so a pending read ends on close
    closed: Arc<AtomicBool>,
}

impl UnixPty {
    pub fn spawn(size: TerminalSize, launch: &LaunchCommand) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| PtyError::Creation(other_error(e)))?;

        let mut cmd = CommandBuilder::new(&launch.program);
        cmd.args(&launch.arguments);
        if let Some(cwd) = &launch.working_directory {
            cmd.cwd(cwd);
        }
        cmd.env_clear();
        for (name, value) in launch.environment.iter() {
            cmd.env(name, value);
        }
        if launch.environment.get("TERM").is_none() {
            cmd.env("TERM", "xterm");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::ProcessSpawn(other_error(e)))?;
        // Only the child keeps the slave open, so its exit ends our reads
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Creation(other_error(e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Creation(other_error(e)))?;

        // A descriptor of our own, so polling never races the master's drop
        let poll_fd = match pair.master.as_raw_fd() {
            Some(fd) => Some(
                unsafe { BorrowedFd::borrow_raw(fd) }
                    .try_clone_to_owned()
                    .map_err(PtyError::Creation)?,
            ),
            None => {
                tracing::warn!("Pty master has no descriptor; close relies on child exit");
                None
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let reader = MasterReader {
            inner: reader,
            poll_fd,
            closed: Arc::clone(&closed),
        };

        Ok(Self {
            master: pair.master,
            child,
            reader: Some(Box::new(reader)),
            writer: Some(writer),
            closed,
        })
    }

    /// Hang up the child's whole process group, then kill what is left.
    ///
    /// The child leads its own session and group, so background jobs that
    /// inherited the terminal go down with it.
    fn hang_up(&mut self) {
        let Some(pid) = self.child.process_id() else {
            return;
        };
        let group = Pid::from_raw(pid as i32);

        match killpg(group, Signal::SIGHUP) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return,
            Err(e) => tracing::warn!("SIGHUP to group {} failed: {}", group, e),
        }
        thread::sleep(HANGUP_GRACE);

        // Signal 0 only checks for survivors
        if killpg(group, None).is_ok() {
            tracing::debug!("Group {} survived SIGHUP, killing", group);
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                tracing::warn!("SIGKILL to group {} failed: {}", group, e);
            }
        }
    }
}

impl Pty for UnixPty {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        self.reader.take().ok_or(PtyError::AlreadyTaken("reader"))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>> {
        self.writer.take().ok_or(PtyError::AlreadyTaken("writer"))
    }

    fn resize(&mut self, size: TerminalSize) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        self.master
            .resize(pty_size(size))
            .map_err(|e| PtyError::Resize(other_error(e)))
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(None) = self.child.try_wait() {
            self.hang_up();
        }
        if let Err(e) = self.child.wait() {
            tracing::warn!("Failed to reap child: {}", e);
        }
    }
}

impl Drop for UnixPty {
    fn drop(&mut self) {
        self.close();
    }
}

/// Master side reader. Waits in short polls so that closing the pty ends
/// the read even while other processes still hold the slave, and reports
/// the hang-up after child exit as end of stream.
struct MasterReader {
    inner: Box<dyn Read + Send>,
    poll_fd: Option<OwnedFd>,
    closed: Arc<AtomicBool>,
}

impl MasterReader {
    /// Wait until the master is readable; false once the pty is closed
    fn wait_readable(&self) -> io::Result<bool> {
        let Some(fd) = &self.poll_fd else {
            return Ok(!self.closed.load(Ordering::SeqCst));
        };
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, READ_POLL_MS) {
                Ok(0) | Err(Errno::EINTR) => continue,
                // Readable, hung up or in error: the read reports which
                Ok(_) => return Ok(true),
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }
}

impl Read for MasterReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.wait_readable()? {
            return Ok(0);
        }
        match self.inner.read(buf) {
            Err(e) if e.raw_os_error() == Some(EIO) => Ok(0),
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use std::time::Instant;

    fn sh(script: &str) -> LaunchCommand {
        LaunchCommand {
            program: "/bin/sh".to_string(),
            arguments: vec!["-c".to_string(), script.to_string()],
            working_directory: None,
            environment: Environment::from_os(),
        }
    }

    fn read_until(reader: &mut dyn Read, needle: &str) -> String {
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&output).contains(needle) {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_close_ends_read_despite_background_job() {
        let mut pty = UnixPty::spawn(
            TerminalSize::new(80, 24),
            &sh("trap '' HUP; sleep 30 & echo started; sleep 30"),
        )
        .unwrap();
        let mut reader = pty.take_reader().unwrap();
        assert!(read_until(reader.as_mut(), "started").contains("started"));

        let pending = thread::spawn(move || {
            let mut buf = [0u8; 64];
            while let Ok(n) = reader.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
        });

        let started = Instant::now();
        pty.close();
        pending.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            pty.resize(TerminalSize::new(10, 10)),
            Err(PtyError::Closed)
        ));
    }
}
