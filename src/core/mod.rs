//! Core terminal emulation components.
//!
//! - **term**: escape-sequence decoder and the scroll-back screen buffer
//! - **pty**: pseudo terminal backends (ConPTY on Windows, `portable-pty`
//!   elsewhere)
//! - **session**: a pty and a screen buffer driven by a reader thread
//!
//! # Architecture
//!
//! ```text
//! SessionManager
//! └── Session
//!     ├── Pty (child process I/O)
//!     ├── reader thread: bytes -> OutputDecoder -> TerminalCode
//!     └── Arc<Mutex<ScreenBuffer>>
//!         ├── grid + cursor + attributes
//!         ├── history (bounded)
//!         └── view window + selection
//! ```

pub mod pty;
pub mod session;
pub mod term;
