//! tterm - a terminal emulator in the console
//!
//! Runs a shell behind a pseudo terminal and draws its screen with
//! crossterm. The emulation itself lives in the `tterm` library.
//!
//! # Mouse and keys
//!
//! | Input | Action |
//! |-------|--------|
//! | Left drag | Block selection |
//! | Right/middle click | Copy selection, or paste when nothing is selected |
//! | Wheel | Scroll history by 3 lines |
//! | Shift+PageUp/PageDown | Scroll history by a page |
//! | Escape with a selection | Clear the selection |
//! | Any other key | Clear selection, return to the live screen, send to the shell |
//!
//! # Sessions (Ctrl+B prefix)
//!
//! | Key | Action |
//! |-----|--------|
//! | c | New session |
//! | n / p | Next / previous session |
//! | 1-9 | Session by number |
//! | & | Close the current session |
//! | Ctrl+B | Send Ctrl+B to the shell |
//!
//! When a session ends the one before it is shown; tterm exits after the
//! last one.

mod ui;

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseButton, MouseEvent,
    MouseEventKind,
};
use crossterm::execute;
use crossterm::terminal::SetTitle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tterm::core::term::{Selection, TerminalPoint};
use tterm::{Config, Environment, Profile, Session, SessionEventKind, SessionManager, TerminalSize};

use crate::ui::{input, Palette, Renderer, Tabs};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lines scrolled per wheel notch
const WHEEL_LINES: i32 = 3;

/// Command line options
#[derive(Default)]
struct Options {
    /// Shell program overriding the configured profile
    shell: Option<String>,
}

fn print_version() {
    eprintln!("tterm {}", VERSION);
}

fn print_help() {
    eprintln!("tterm {} - a terminal emulator in the console", VERSION);
    eprintln!();
    eprintln!("Usage: tterm [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <PROGRAM>  Shell to run instead of the configured profile");
    eprintln!("  -v, --version          Show version");
    eprintln!("  -h, --help             Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.tterm/config.toml");
    eprintln!("Log file:      ~/.tterm/tterm.log (level from RUST_LOG)");
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing shell argument".to_string());
                }
                options.shell = Some(args[i].clone());
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Log to `~/.tterm/tterm.log`, or `tterm.log` when there is no home
fn init_logging(env: &Environment) {
    let log_path = tterm::config::data_dir(env)
        .map(|dir| dir.join("tterm.log"))
        .unwrap_or_else(|| PathBuf::from("tterm.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let options = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let env = Environment::from_os();
    init_logging(&env);
    info!("tterm {} starting...", VERSION);

    let config = Config::load(&env);
    let profile = match (&options.shell, &config.profile) {
        (Some(shell), _) => Profile::new(shell.clone()),
        (None, Some(profile)) => profile.clone(),
        (None, None) => Profile::default_for(&env),
    };

    let size = match Renderer::size() {
        Ok((columns, rows)) => TerminalSize::new(columns, rows),
        Err(e) => {
            warn!("Console size unavailable ({}), using {}", e, config.size());
            config.size()
        }
    };

    let mut app = App {
        manager: SessionManager::new(env.clone()),
        renderer: Renderer::new(Palette::tango()),
        tabs: Tabs::new(),
        profile,
        config,
        env,
        size,
        prefix_mode: false,
        dirty: true,
    };
    app.open_session()?;
    app.renderer.init()?;
    app.show_active()?;

    let result = app.run();

    app.manager.close_all();
    if let Err(e) = app.renderer.cleanup() {
        eprintln!("Failed to restore the console: {}", e);
    }

    if let Err(e) = &result {
        error!("Main loop failed: {:?}", e);
    }
    info!("tterm exiting");
    result
}

struct App {
    manager: SessionManager,
    renderer: Renderer,
    tabs: Tabs,
    /// Profile new sessions start from
    profile: Profile,
    config: Config,
    env: Environment,
    /// Console size every session is kept at
    size: TerminalSize,
    /// Ctrl+B was pressed; the next key is a session command
    prefix_mode: bool,
    /// The screen needs drawing
    dirty: bool,
}

impl App {
    fn run(&mut self) -> anyhow::Result<()> {
        loop {
            if !self.handle_session_events()? {
                return Ok(());
            }

            if self.dirty {
                if let Some(session) = self.tabs.active().and_then(|id| self.manager.get(id)) {
                    let buffer = session.lock_buffer();
                    self.renderer.render(&buffer)?;
                }
                self.dirty = false;
            }

            if event::poll(Duration::from_millis(10))? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_key(key)?,
                    Event::Mouse(mouse) => self.handle_mouse(mouse)?,
                    Event::Resize(columns, rows) => self.handle_resize(columns, rows)?,
                    _ => {}
                }
            }
        }
    }

    /// Start a session from the profile and show it
    fn open_session(&mut self) -> anyhow::Result<()> {
        let id = self.manager.create_session(self.size, &self.profile)?;
        info!("Session {} started: {}", id, self.profile.command);
        self.tabs.push(id);
        Ok(())
    }

    fn session(&self) -> Option<&Session> {
        self.manager.get(self.tabs.active()?)
    }

    fn session_mut(&mut self) -> Option<&mut Session> {
        self.manager.get_mut(self.tabs.active()?)
    }

    /// Bring the active session on screen at the current console size
    fn show_active(&mut self) -> anyhow::Result<()> {
        let size = self.size;
        if let Some(session) = self.session_mut() {
            if session.size() != size {
                session.resize(size)?;
            }
        }
        self.renderer.invalidate();
        self.dirty = true;
        self.update_title()
    }

    /// Console title: the active session's title and its place in the tabs
    fn update_title(&self) -> anyhow::Result<()> {
        let Some(session) = self.session() else {
            return Ok(());
        };
        let mut title = session.title();
        if title.is_empty() {
            title = "tterm".to_string();
        }
        if self.tabs.len() > 1 {
            title = format!("[{}/{}] {}", self.tabs.position() + 1, self.tabs.len(), title);
        }
        execute!(io::stdout(), SetTitle(title))?;
        Ok(())
    }

    /// Returns false once every session has finished
    fn handle_session_events(&mut self) -> anyhow::Result<bool> {
        for event in self.manager.poll_events() {
            let is_active = self.tabs.active() == Some(event.session);
            match event.kind {
                SessionEventKind::OutputReceived => self.dirty |= is_active,
                SessionEventKind::TitleChanged(_) => {
                    if is_active {
                        self.update_title()?;
                    }
                }
                SessionEventKind::Bell => {
                    if is_active {
                        let mut stdout = io::stdout();
                        stdout.write_all(b"\x07")?;
                        stdout.flush()?;
                    }
                }
                SessionEventKind::BufferSizeChanged(size) => {
                    debug!("Session {} buffer resized to {}", event.session, size);
                    if is_active {
                        self.renderer.invalidate();
                        self.dirty = true;
                    }
                }
                SessionEventKind::Finished(error) => {
                    match error {
                        Some(e) => warn!("Session {} ended with error: {}", event.session, e),
                        None => info!("Session {} ended", event.session),
                    }
                    if self.tabs.remove(event.session) {
                        match self.tabs.active() {
                            Some(id) => {
                                info!("Falling back to session {}", id);
                                self.show_active()?;
                            }
                            None => return Ok(false),
                        }
                    } else {
                        self.update_title()?;
                    }
                }
            }
        }
        Ok(!self.tabs.is_empty())
    }

    fn handle_key(&mut self, key: KeyEvent) -> anyhow::Result<()> {
        if self.prefix_mode {
            self.prefix_mode = false;
            return self.handle_prefix_key(key);
        }
        if key.code == KeyCode::Char('b') && key.modifiers == KeyModifiers::CONTROL {
            self.prefix_mode = true;
            return Ok(());
        }

        let Some(session) = self.tabs.active().and_then(|id| self.manager.get_mut(id)) else {
            return Ok(());
        };

        if key.modifiers.contains(KeyModifiers::SHIFT) {
            let direction = match key.code {
                KeyCode::PageUp => Some(-1),
                KeyCode::PageDown => Some(1),
                _ => None,
            };
            if let Some(direction) = direction {
                let mut buffer = session.lock_buffer();
                let page = i32::from(buffer.size().rows());
                buffer.scroll(direction * page);
                self.dirty = true;
                return Ok(());
            }
        }

        let had_selection = {
            let mut buffer = session.lock_buffer();
            let had_selection = buffer.selection().is_some();
            buffer.set_selection(None);
            buffer.scroll_to_bottom();
            had_selection
        };
        self.dirty = true;

        if key.code == KeyCode::Esc && had_selection {
            return Ok(());
        }
        if let Some(bytes) = input::encode(&key) {
            session.write_bytes(&bytes)?;
        }
        Ok(())
    }

    /// The key after Ctrl+B
    fn handle_prefix_key(&mut self, key: KeyEvent) -> anyhow::Result<()> {
        match key.code {
            KeyCode::Char('c') => {
                self.open_session()?;
                self.show_active()?;
            }
            KeyCode::Char('n') if self.tabs.len() > 1 => {
                self.tabs.next();
                self.show_active()?;
            }
            KeyCode::Char('p') if self.tabs.len() > 1 => {
                self.tabs.previous();
                self.show_active()?;
            }
            KeyCode::Char(digit @ '1'..='9') => {
                let index = digit as usize - '1' as usize;
                if self.tabs.select(index) {
                    self.show_active()?;
                }
            }
            // Finished arrives through the event channel and picks the fallback
            KeyCode::Char('&') => {
                if let Some(session) = self.session_mut() {
                    session.close();
                }
            }
            KeyCode::Char('b') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                if let Some(session) = self.session_mut() {
                    session.write_bytes(&[0x02])?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) -> anyhow::Result<()> {
        let Some(session) = self.session_mut() else {
            return Ok(());
        };

        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                let mut buffer = session.lock_buffer();
                let point = TerminalPoint::new(mouse.column, buffer.window_top() + i32::from(mouse.row));
                buffer.set_selection(Some(Selection::at(point)));
            }
            MouseEventKind::Drag(MouseButton::Left) => {
                let mut buffer = session.lock_buffer();
                let point = TerminalPoint::new(mouse.column, buffer.window_top() + i32::from(mouse.row));
                if let Some(selection) = buffer.selection() {
                    buffer.set_selection(Some(selection.extended_to(point)));
                }
            }
            MouseEventKind::Down(MouseButton::Right) | MouseEventKind::Down(MouseButton::Middle) => {
                let copied = {
                    let mut buffer = session.lock_buffer();
                    let text = buffer.copy_selection();
                    buffer.set_selection(None);
                    text
                };
                match copied {
                    Some(text) => copy_to_clipboard(text),
                    None => {
                        if let Some(text) = paste_from_clipboard() {
                            session.write(&text)?;
                        }
                    }
                }
            }
            MouseEventKind::ScrollUp => session.lock_buffer().scroll(-WHEEL_LINES),
            MouseEventKind::ScrollDown => session.lock_buffer().scroll(WHEEL_LINES),
            _ => return Ok(()),
        }

        self.dirty = true;
        Ok(())
    }

    fn handle_resize(&mut self, columns: u16, rows: u16) -> anyhow::Result<()> {
        self.size = TerminalSize::new(columns, rows);
        for &id in self.tabs.ids() {
            if let Some(session) = self.manager.get_mut(id) {
                if let Err(e) = session.resize(self.size) {
                    warn!("Failed to resize session {}: {}", id, e);
                }
            }
        }

        self.config.set_size(self.size);
        if let Err(e) = self.config.save(&self.env) {
            warn!("Failed to save config: {}", e);
        }
        Ok(())
    }
}

fn copy_to_clipboard(text: String) {
    match arboard::Clipboard::new() {
        Ok(mut clipboard) => {
            if let Err(e) = clipboard.set_text(text) {
                warn!("Clipboard copy failed: {}", e);
            }
        }
        Err(e) => warn!("Clipboard unavailable: {}", e),
    }
}

fn paste_from_clipboard() -> Option<String> {
    let mut clipboard = arboard::Clipboard::new().ok()?;
    clipboard.get_text().ok().filter(|text| !text.is_empty())
}
