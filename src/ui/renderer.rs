//! Terminal renderer using crossterm
//!
//! Draws a screen buffer's formatted lines to the console. A line is only
//! redrawn when its tag array or origin differs from what was drawn last.

use std::borrow::Cow;
use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute, queue,
    style::{Attribute, Color, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use unicode_width::UnicodeWidthChar;

use tterm::core::term::{CharAttributes, ColourId, RowOrigin, ScreenBuffer, TerminalTagArray};

const fn rgb(r: u8, g: u8, b: u8) -> Color {
    Color::Rgb { r, g, b }
}

/// Colours for palette and special ids
#[derive(Clone, Debug)]
pub struct Palette {
    pub colours: [Color; 16],
    pub default_foreground: Color,
    pub cursor: Color,
    pub selection: Color,
    /// Background of history and beyond-the-grid rows
    pub scrollback: Color,
}

impl Default for Palette {
    fn default() -> Self {
        Self::tango()
    }
}

impl Palette {
    pub fn tango() -> Self {
        Self {
            colours: [
                // dark
                rgb(0x2e, 0x34, 0x36),
                rgb(0xcc, 0x00, 0x00),
                rgb(0x4e, 0x9a, 0x06),
                rgb(0xc4, 0xa0, 0x00),
                rgb(0x34, 0x65, 0xa4),
                rgb(0x75, 0x50, 0x7b),
                rgb(0x06, 0x98, 0x9a),
                rgb(0xd3, 0xd7, 0xcf),
                // bright
                rgb(0x55, 0x57, 0x53),
                rgb(0xef, 0x29, 0x29),
                rgb(0x8a, 0xe2, 0x34),
                rgb(0xfc, 0xe9, 0x4f),
                rgb(0x72, 0x9f, 0xcf),
                rgb(0xad, 0x7f, 0xa8),
                rgb(0x34, 0xe2, 0xe2),
                rgb(0xee, 0xee, 0xec),
            ],
            default_foreground: rgb(204, 204, 204),
            cursor: rgb(204, 204, 204),
            selection: rgb(203, 203, 203),
            scrollback: rgb(24, 24, 24),
        }
    }

    /// Colour of a special id or a palette entry
    pub fn colour(&self, id: ColourId) -> Color {
        match id {
            ColourId::CURSOR => self.cursor,
            ColourId::SELECTION => self.selection,
            ColourId::HISTORIC | ColourId::FUTURISTIC => self.scrollback,
            ColourId(n) => self.colours[n as usize % 16],
        }
    }

    pub fn foreground(&self, attrs: &CharAttributes) -> Color {
        if !attrs.foreground.is_default() {
            return self.colour(attrs.foreground);
        }
        // Keep default text readable on the light highlight backgrounds
        if matches!(attrs.background, ColourId::CURSOR | ColourId::SELECTION) {
            self.colours[0]
        } else {
            self.default_foreground
        }
    }

    /// `None` leaves the console's own background
    pub fn background(&self, attrs: &CharAttributes, origin: RowOrigin) -> Option<Color> {
        if !attrs.background.is_default() {
            return Some(self.colour(attrs.background));
        }
        match origin {
            RowOrigin::Live => None,
            RowOrigin::History => Some(self.colour(ColourId::HISTORIC)),
            RowOrigin::Beyond => Some(self.colour(ColourId::FUTURISTIC)),
        }
    }
}

/// Make a tag's text occupy exactly one console column per cell
pub fn display_text(text: &str) -> Cow<'_, str> {
    if text.chars().all(|c| c.width() == Some(1)) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.chars()
            .map(|c| match c.width() {
                Some(1) => c,
                Some(0) | None => ' ',
                Some(_) => '?',
            })
            .collect(),
    )
}

/// Terminal renderer
pub struct Renderer {
    palette: Palette,
    /// What each console row currently shows
    drawn: Vec<Option<(TerminalTagArray, RowOrigin)>>,
    /// Whether the terminal has been initialized
    initialized: bool,
}

impl Renderer {
    pub fn new(palette: Palette) -> Self {
        Self {
            palette,
            drawn: Vec::new(),
            initialized: false,
        }
    }

    /// Initialize the terminal for rendering
    pub fn init(&mut self) -> io::Result<()> {
        // Disable Windows console Quick Edit mode to receive mouse events
        #[cfg(windows)]
        {
            use windows::Win32::System::Console::{
                GetConsoleMode, GetStdHandle, SetConsoleMode, CONSOLE_MODE,
                ENABLE_EXTENDED_FLAGS, ENABLE_MOUSE_INPUT, ENABLE_QUICK_EDIT_MODE,
                ENABLE_WINDOW_INPUT, STD_INPUT_HANDLE,
            };

            unsafe {
                if let Ok(handle) = GetStdHandle(STD_INPUT_HANDLE) {
                    let mut mode = CONSOLE_MODE(0);
                    if GetConsoleMode(handle, &mut mode).is_ok() {
                        let new_mode = CONSOLE_MODE(
                            (mode.0 & !ENABLE_QUICK_EDIT_MODE.0)
                                | ENABLE_EXTENDED_FLAGS.0
                                | ENABLE_MOUSE_INPUT.0
                                | ENABLE_WINDOW_INPUT.0,
                        );
                        if let Err(e) = SetConsoleMode(handle, new_mode) {
                            tracing::warn!("SetConsoleMode failed: {:?}", e);
                        }
                    }
                }
            }
        }

        terminal::enable_raw_mode()?;

        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            crossterm::event::EnableMouseCapture,
            DisableLineWrap,
            Hide,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;

        self.initialized = true;
        self.invalidate();
        Ok(())
    }

    /// Cleanup the terminal
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            EnableLineWrap,
            crossterm::event::DisableMouseCapture,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();

        terminal::disable_raw_mode()
    }

    /// Forget what is on screen; the next render redraws every line
    pub fn invalidate(&mut self) {
        self.drawn.clear();
    }

    /// Render the visible window of `buffer`
    pub fn render(&mut self, buffer: &ScreenBuffer) -> io::Result<()> {
        let rows = buffer.size().rows() as usize;
        if self.drawn.len() != rows {
            self.drawn = vec![None; rows];
        }

        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());

        // Begin synchronized update (reduces flicker)
        write!(out, "\x1b[?2026h")?;

        for y in 0..rows {
            let line = buffer.formatted_line(y);
            let origin = buffer.row_origin(y);
            if let Some((drawn, drawn_origin)) = &self.drawn[y] {
                if *drawn == line && *drawn_origin == origin {
                    continue;
                }
            }
            self.draw_line(&mut out, y as u16, &line, origin)?;
            self.drawn[y] = Some((line, origin));
        }

        if buffer.is_scrolled() {
            let indicator = format!("[{} lines up]", -buffer.window_top());
            let columns = buffer.size().columns() as usize;
            let x = columns.saturating_sub(indicator.len()) as u16;
            queue!(
                out,
                MoveTo(x, 0),
                SetAttribute(Attribute::Reset),
                SetForegroundColor(self.palette.colours[0]),
                SetBackgroundColor(self.palette.colours[3])
            )?;
            write!(out, "{}", indicator)?;
            // Row 0 is no longer what the diff thinks it is
            if let Some(first) = self.drawn.first_mut() {
                *first = None;
            }
        }

        queue!(out, ResetColor, SetAttribute(Attribute::Reset))?;
        write!(out, "\x1b[?2026l")?;
        out.flush()
    }

    fn draw_line<W: Write>(
        &self,
        out: &mut W,
        y: u16,
        line: &TerminalTagArray,
        origin: RowOrigin,
    ) -> io::Result<()> {
        queue!(out, MoveTo(0, y))?;

        for tag in line {
            self.apply_attrs(out, &tag.attrs, origin)?;
            write!(out, "{}", display_text(&tag.text))?;
        }

        // Clear whatever is left of the row in the row's background
        self.apply_attrs(out, &CharAttributes::default(), origin)?;
        write!(out, "\x1b[K")?;
        Ok(())
    }

    /// Apply cell attributes
    fn apply_attrs<W: Write>(
        &self,
        out: &mut W,
        attrs: &CharAttributes,
        origin: RowOrigin,
    ) -> io::Result<()> {
        queue!(out, SetAttribute(Attribute::Reset))?;
        if attrs.is_bold() {
            queue!(out, SetAttribute(Attribute::Bold))?;
        }
        queue!(out, SetForegroundColor(self.palette.foreground(attrs)))?;
        match self.palette.background(attrs, origin) {
            Some(colour) => queue!(out, SetBackgroundColor(colour)),
            None => queue!(out, SetBackgroundColor(Color::Reset)),
        }
    }

    /// Get terminal size
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
