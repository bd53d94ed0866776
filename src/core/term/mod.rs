//! Terminal emulation: escape-sequence decoding and the screen buffer.

pub mod buffer;
pub mod parser;
pub mod state;
pub mod tag;

pub use buffer::{BufferError, BufferEvent, HistoryLine, RowOrigin, ScreenBuffer, MAX_HISTORY};
pub use parser::{CharReader, TerminalCode, VtParser};
pub use state::{
    AttrFlags, Cell, CharAttributes, ColourId, Selection, SelectionMode, TerminalPoint,
    TerminalSize,
};
pub use tag::{TerminalTag, TerminalTagArray};
