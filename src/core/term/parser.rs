//! VT sequence parser
//!
//! Decodes a character stream into [`TerminalCode`]s. The parser keeps no
//! state between calls: when the input ends inside a sequence that could
//! still become valid, the sequence is left unconsumed and the caller feeds
//! it again, followed by more data, on the next call.

const ESC: char = '\x1b';
const BEL: char = '\x07';
/// String terminator (8-bit form)
const ST: char = '\u{9c}';

/// Longest CSI sequence (after `ESC [`) kept pending before it is dropped
const MAX_CSI_LEN: usize = 64;
/// Longest OSC payload kept pending before it is dropped
const MAX_OSC_LEN: usize = 4096;

/// A decoded terminal operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalCode {
    /// Run of printable characters
    Text(String),
    Bell,
    LineFeed,
    CarriageReturn,
    Backspace,
    Tab,
    ShiftOut,
    ShiftIn,
    SaveCursor,
    RestoreCursor,
    Reset,
    SetTitle(String),
    TabSet,
    /// 0-based target position
    CursorPosition { line: u16, column: u16 },
    /// 0-based target column
    CursorCharAbsolute(u16),
    CursorUp(u16),
    CursorDown(u16),
    CursorForward(u16),
    CursorBackward(u16),
    EraseInDisplay(u16),
    EraseInLine(u16),
    /// Raw SGR parameters, applied with [`CharAttributes::with_sgr`]
    ///
    /// [`CharAttributes::with_sgr`]: super::state::CharAttributes::with_sgr
    SetGraphicsMode(Vec<u16>),
    SetMode(u16),
    ResetMode(u16),
}

/// Read position over a slice of characters
#[derive(Debug)]
pub struct CharReader<'a> {
    buf: &'a [char],
    pos: usize,
}

impl<'a> CharReader<'a> {
    pub fn new(buf: &'a [char]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of characters consumed so far
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Unconsumed characters
    pub fn rest(&self) -> &'a [char] {
        &self.buf[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.buf.get(self.pos).copied()
    }

    fn read(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Progress {
    /// At least one character was consumed
    Advanced,
    /// Input ended inside a sequence; nothing should be consumed
    Incomplete,
}

/// Stateless ANSI/VT decoder
#[derive(Clone, Copy, Debug, Default)]
pub struct VtParser;

impl VtParser {
    pub fn new() -> Self {
        Self
    }

    /// Decode as much of `reader` as possible.
    ///
    /// On return the reader is positioned at the first character of an
    /// incomplete trailing sequence, or at the end of the input.
    pub fn parse(&self, reader: &mut CharReader<'_>) -> Vec<TerminalCode> {
        let mut codes = Vec::new();
        while !reader.is_empty() {
            let mark = reader.offset();
            if self.step(reader, &mut codes) == Progress::Incomplete {
                reader.seek(mark);
                break;
            }
        }
        codes
    }

    /// Convenience wrapper: decode a string, returning the codes and the
    /// number of characters consumed.
    pub fn parse_str(&self, input: &str) -> (Vec<TerminalCode>, usize) {
        let chars: Vec<char> = input.chars().collect();
        let mut reader = CharReader::new(&chars);
        let codes = self.parse(&mut reader);
        (codes, reader.offset())
    }

    fn step(&self, reader: &mut CharReader<'_>, codes: &mut Vec<TerminalCode>) -> Progress {
        let Some(c) = reader.read() else {
            return Progress::Incomplete;
        };

        match c {
            ESC => return self.escape(reader, codes),
            BEL => codes.push(TerminalCode::Bell),
            '\n' | '\x0b' | '\x0c' => codes.push(TerminalCode::LineFeed),
            '\r' => codes.push(TerminalCode::CarriageReturn),
            '\x08' => codes.push(TerminalCode::Backspace),
            '\t' => codes.push(TerminalCode::Tab),
            '\x0e' => codes.push(TerminalCode::ShiftOut),
            '\x0f' => codes.push(TerminalCode::ShiftIn),
            c if !c.is_control() => {
                let mut text = String::from(c);
                while let Some(next) = reader.peek() {
                    if next.is_control() {
                        break;
                    }
                    text.push(next);
                    reader.read();
                }
                codes.push(TerminalCode::Text(text));
            }
            _ => {
                // NUL, DEL, C1 and the remaining C0 controls
            }
        }
        Progress::Advanced
    }

    fn escape(&self, reader: &mut CharReader<'_>, codes: &mut Vec<TerminalCode>) -> Progress {
        let Some(c) = reader.peek() else {
            return Progress::Incomplete;
        };

        if c.is_control() {
            // Lone ESC; the control character is handled on its own
            return Progress::Advanced;
        }
        reader.read();

        match c {
            '[' => return self.csi(reader, codes),
            ']' => return self.osc(reader, codes),
            '7' => codes.push(TerminalCode::SaveCursor),
            '8' => codes.push(TerminalCode::RestoreCursor),
            'c' => codes.push(TerminalCode::Reset),
            'H' => codes.push(TerminalCode::TabSet),
            'D' => codes.push(TerminalCode::LineFeed),
            'E' => {
                codes.push(TerminalCode::CarriageReturn);
                codes.push(TerminalCode::LineFeed);
            }
            ' '..='/' => {
                // Intermediate bytes, e.g. charset designation ESC ( B
                loop {
                    match reader.peek() {
                        None => return Progress::Incomplete,
                        Some(' '..='/') => {
                            reader.read();
                        }
                        Some('0'..='~') => {
                            reader.read();
                            break;
                        }
                        Some(_) => break,
                    }
                }
                tracing::debug!("Ignored ESC sequence with intermediate {:?}", c);
            }
            _ => {
                tracing::debug!("Unknown ESC sequence: {:?}", c);
            }
        }
        Progress::Advanced
    }

    fn csi(&self, reader: &mut CharReader<'_>, codes: &mut Vec<TerminalCode>) -> Progress {
        let start = reader.offset();
        let mut marker = None;
        if let Some(m @ ('<'..='?')) = reader.peek() {
            marker = Some(m);
            reader.read();
        }

        let mut params: Vec<Option<u16>> = Vec::new();
        let mut current: Option<u16> = None;
        let mut has_intermediates = false;
        let mut malformed = false;

        loop {
            if reader.offset() - start > MAX_CSI_LEN {
                tracing::debug!("Dropped overlong CSI sequence");
                return Progress::Advanced;
            }

            let Some(c) = reader.peek() else {
                return Progress::Incomplete;
            };

            match c {
                '0'..='9' if !has_intermediates => {
                    reader.read();
                    let digit = c as u16 - '0' as u16;
                    current = Some(current.unwrap_or(0).saturating_mul(10).saturating_add(digit));
                }
                ';' | ':' if !has_intermediates => {
                    reader.read();
                    params.push(current.take());
                }
                '0'..='?' => {
                    // Parameter byte out of place
                    reader.read();
                    malformed = true;
                }
                ' '..='/' => {
                    reader.read();
                    has_intermediates = true;
                }
                '@'..='~' => {
                    reader.read();
                    if current.is_some() || !params.is_empty() {
                        params.push(current.take());
                    }
                    if malformed {
                        tracing::debug!("Dropped malformed CSI sequence ending in {:?}", c);
                    } else {
                        self.dispatch_csi(marker, has_intermediates, &params, c, codes);
                    }
                    return Progress::Advanced;
                }
                _ => {
                    // Control character or non-ASCII inside the sequence:
                    // abandon it and let the character be decoded normally
                    tracing::debug!("Aborted CSI sequence at {:?}", c);
                    return Progress::Advanced;
                }
            }
        }
    }

    fn dispatch_csi(
        &self,
        marker: Option<char>,
        has_intermediates: bool,
        params: &[Option<u16>],
        final_char: char,
        codes: &mut Vec<TerminalCode>,
    ) {
        let param = |i: usize, default: u16| params.get(i).copied().flatten().unwrap_or(default);
        let count = || param(0, 1).max(1);

        let code = match (marker, has_intermediates, final_char) {
            (None, false, 'H') | (None, false, 'f') => TerminalCode::CursorPosition {
                line: param(0, 1).max(1) - 1,
                column: param(1, 1).max(1) - 1,
            },
            (None, false, 'A') => TerminalCode::CursorUp(count()),
            (None, false, 'B') => TerminalCode::CursorDown(count()),
            (None, false, 'C') => TerminalCode::CursorForward(count()),
            (None, false, 'D') => TerminalCode::CursorBackward(count()),
            (None, false, 'G') => TerminalCode::CursorCharAbsolute(param(0, 1).max(1) - 1),
            (None, false, 'J') => TerminalCode::EraseInDisplay(param(0, 0)),
            (None, false, 'K') => TerminalCode::EraseInLine(param(0, 0)),
            (None, false, 'm') => {
                TerminalCode::SetGraphicsMode(params.iter().map(|p| p.unwrap_or(0)).collect())
            }
            (None, false, 's') => TerminalCode::SaveCursor,
            (None, false, 'u') => TerminalCode::RestoreCursor,
            (Some('?'), false, 'h') => {
                codes.extend(params.iter().map(|p| TerminalCode::SetMode(p.unwrap_or(0))));
                return;
            }
            (Some('?'), false, 'l') => {
                codes.extend(params.iter().map(|p| TerminalCode::ResetMode(p.unwrap_or(0))));
                return;
            }
            _ => {
                tracing::debug!(
                    "Unknown CSI: marker={:?}, params={:?}, final={:?}",
                    marker,
                    params,
                    final_char
                );
                return;
            }
        };
        codes.push(code);
    }

    fn osc(&self, reader: &mut CharReader<'_>, codes: &mut Vec<TerminalCode>) -> Progress {
        let mut body = String::new();

        loop {
            if body.len() > MAX_OSC_LEN {
                tracing::debug!("Dropped overlong OSC sequence");
                return Progress::Advanced;
            }

            let Some(c) = reader.read() else {
                return Progress::Incomplete;
            };

            match c {
                BEL | ST => break,
                ESC => match reader.peek() {
                    None => return Progress::Incomplete,
                    Some('\\') => {
                        reader.read();
                        break;
                    }
                    Some(_) => {
                        // Unterminated OSC; the ESC starts a new sequence
                        reader.seek(reader.offset() - 1);
                        break;
                    }
                },
                c => body.push(c),
            }
        }

        self.execute_osc(&body, codes);
        Progress::Advanced
    }

    fn execute_osc(&self, body: &str, codes: &mut Vec<TerminalCode>) {
        match body.split_once(';') {
            Some(("0", title)) | Some(("2", title)) => {
                codes.push(TerminalCode::SetTitle(title.to_string()));
            }
            _ => {
                tracing::debug!("Ignored OSC: {:?}", body);
            }
        }
    }
}
