//! Keyboard input encoding
//!
//! Turns console key presses into the byte strings a VT application reads
//! from its terminal. Cursor and F1-F4 keys use the SS3 form when no
//! modifier is held; cursor-key mode is not tracked.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

const ESC: u8 = 0x1b;

/// How a non-character key reaches the child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    /// Fixed bytes; Alt adds an ESC prefix
    Plain(&'static [u8]),
    /// `ESC O <final>`, or `ESC [ 1 ; <param> <final>` with modifiers
    Cursor(u8),
    /// `ESC [ <number> ~`, or `ESC [ <number> ; <param> ~` with modifiers
    Tilde(u8),
}

/// F1 to F12
const FUNCTION_KEYS: [Encoding; 12] = [
    Encoding::Cursor(b'P'),
    Encoding::Cursor(b'Q'),
    Encoding::Cursor(b'R'),
    Encoding::Cursor(b'S'),
    Encoding::Tilde(15),
    Encoding::Tilde(17),
    Encoding::Tilde(18),
    Encoding::Tilde(19),
    Encoding::Tilde(20),
    Encoding::Tilde(21),
    Encoding::Tilde(23),
    Encoding::Tilde(24),
];

/// Bytes for `key`, or `None` when the key sends nothing
pub fn encode(key: &KeyEvent) -> Option<Vec<u8>> {
    let mods = key.modifiers;
    let shift = mods.contains(KeyModifiers::SHIFT);

    let encoding = match key.code {
        KeyCode::Char(ch) => return Some(encode_char(ch, mods)),
        KeyCode::Enter => Encoding::Plain(b"\r"),
        KeyCode::Esc => Encoding::Plain(b"\x1b"),
        KeyCode::Backspace if shift => Encoding::Plain(b"\x08"),
        KeyCode::Backspace => Encoding::Plain(b"\x7f"),
        KeyCode::Tab if shift => Encoding::Plain(b"\x1b[Z"),
        KeyCode::BackTab => Encoding::Plain(b"\x1b[Z"),
        KeyCode::Tab => Encoding::Plain(b"\t"),
        KeyCode::Up => Encoding::Cursor(b'A'),
        KeyCode::Down => Encoding::Cursor(b'B'),
        KeyCode::Right => Encoding::Cursor(b'C'),
        KeyCode::Left => Encoding::Cursor(b'D'),
        KeyCode::Home => Encoding::Cursor(b'H'),
        KeyCode::End => Encoding::Cursor(b'F'),
        KeyCode::Insert => Encoding::Tilde(2),
        KeyCode::Delete => Encoding::Tilde(3),
        KeyCode::PageUp => Encoding::Tilde(5),
        KeyCode::PageDown => Encoding::Tilde(6),
        KeyCode::F(n) => *FUNCTION_KEYS.get(usize::from(n).checked_sub(1)?)?,
        _ => return None,
    };

    Some(match encoding {
        Encoding::Plain(bytes) => {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            if mods.contains(KeyModifiers::ALT) {
                out.push(ESC);
            }
            out.extend_from_slice(bytes);
            out
        }
        Encoding::Cursor(end) => match modifier_param(mods) {
            None => vec![ESC, b'O', end],
            Some(param) => format!("\x1b[1;{}{}", param, end as char).into_bytes(),
        },
        Encoding::Tilde(number) => match modifier_param(mods) {
            None => format!("\x1b[{}~", number).into_bytes(),
            Some(param) => format!("\x1b[{};{}~", number, param).into_bytes(),
        },
    })
}

/// xterm modifier parameter: one plus Shift 1, Alt 2 and Ctrl 4.
/// `None` without modifiers.
fn modifier_param(mods: KeyModifiers) -> Option<u8> {
    let bits = [
        (KeyModifiers::SHIFT, 1u8),
        (KeyModifiers::ALT, 2),
        (KeyModifiers::CONTROL, 4),
    ]
    .iter()
    .filter(|(modifier, _)| mods.contains(*modifier))
    .map(|(_, bit)| bit)
    .sum::<u8>();

    (bits != 0).then_some(bits + 1)
}

/// The C0 byte Ctrl turns `ch` into, following xterm
fn control_byte(ch: char) -> Option<u8> {
    match ch {
        ' ' | '`' | '2' => Some(0x00),
        'a'..='z' | '@'..='_' => Some(ch as u8 & 0x1f),
        '3'..='7' => Some(ch as u8 - b'3' + ESC),
        '/' => Some(0x1f),
        '~' => Some(0x1e),
        '8' | '?' => Some(0x7f),
        _ => None,
    }
}

fn encode_char(ch: char, mods: KeyModifiers) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    if mods.contains(KeyModifiers::ALT) {
        out.push(ESC);
    }

    let control = if mods.contains(KeyModifiers::CONTROL) {
        control_byte(ch)
    } else {
        None
    };
    match control {
        Some(byte) => out.push(byte),
        None => out.extend_from_slice(ch.encode_utf8(&mut [0; 4]).as_bytes()),
    }
    out
}
