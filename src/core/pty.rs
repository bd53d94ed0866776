//! Pseudo terminals
//!
//! A [`Pty`] connects a child process to the emulator: its output is read
//! from [`Pty::take_reader`], input goes to [`Pty::take_writer`]. Native
//! backends are ConPTY on Windows and `portable-pty` elsewhere; tests plug in
//! their own in-memory implementations.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use thiserror::Error;

use crate::config::Environment;
use crate::core::term::TerminalSize;

#[cfg(windows)]
mod conpty;
#[cfg(not(windows))]
mod unix;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to create pseudo terminal: {0}")]
    Creation(#[source] io::Error),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(#[source] io::Error),

    #[error("Failed to resize pseudo terminal: {0}")]
    Resize(#[source] io::Error),

    #[error("Pty {0} has already been taken")]
    AlreadyTaken(&'static str),

    #[error("Pseudo terminal is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// A pseudo terminal with a child attached
pub trait Pty: Send {
    /// Stream of child output. Available once.
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>>;

    /// Stream of child input. Available once.
    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>>;

    fn resize(&mut self, size: TerminalSize) -> Result<()>;

    /// Tear down the terminal. A read blocked on the reader returns once this
    /// has been called. Calling it again does nothing.
    fn close(&mut self);
}

/// A fully resolved command to run in a pty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: Environment,
}

impl LaunchCommand {
    /// Windows-style command line. The program is passed through untouched
    /// so that a profile command may carry its own switches.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.arguments {
            line.push(' ');
            line.push_str(&quote_argument(arg));
        }
        line
    }
}

fn quote_argument(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Spawn `launch` in a native pseudo terminal of the given size
pub fn spawn(size: TerminalSize, launch: &LaunchCommand) -> Result<Box<dyn Pty>> {
    tracing::info!("Spawning {} ({})", launch.command_line(), size);

    #[cfg(windows)]
    let pty = conpty::ConPty::spawn(size, launch)?;
    #[cfg(not(windows))]
    let pty = unix::UnixPty::spawn(size, launch)?;

    Ok(Box::new(pty))
}
