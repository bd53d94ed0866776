//! tterm: terminal emulator core.
//!
//! Decodes the output of a child process running in a pseudo terminal,
//! maintains the screen it describes and exposes that screen as formatted
//! lines for a front end to draw.

pub mod config;
pub mod core;

pub use crate::config::{Config, Environment, Profile};
pub use crate::core::session::{
    Session, SessionError, SessionEvent, SessionEventKind, SessionId, SessionManager,
    SessionState,
};
pub use crate::core::term::{ScreenBuffer, TerminalSize};
