//! Terminal value types
//!
//! Cells, attributes, colour ids, sizes, points and selections. All of these
//! are small `Copy` values with structural equality; the grid stores them by
//! value and replaces them wholesale.

use bitflags::bitflags;
use std::cmp::Ordering;
use std::fmt;

bitflags! {
    /// Rendition flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AttrFlags: u8 {
        const BOLD = 0b0000_0001;
    }
}

/// Colour identifier: 0..=15 index the 16-colour palette, 0 also meaning
/// "default". Ids above 15 are reserved for the presentation layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColourId(pub u8);

impl ColourId {
    pub const DEFAULT: Self = Self(0);
    /// Background of the cell under the cursor
    pub const CURSOR: Self = Self(16);
    /// Background of selected cells
    pub const SELECTION: Self = Self(17);
    /// Background of rows read back from history
    pub const HISTORIC: Self = Self(18);
    /// Background of rows past the end of the live grid
    pub const FUTURISTIC: Self = Self(19);

    /// Palette colour, wrapped into 0..=15
    pub const fn indexed(n: u8) -> Self {
        Self(n % 16)
    }

    pub const fn is_default(self) -> bool {
        self.0 == 0
    }

    pub const fn is_special(self) -> bool {
        self.0 > 15
    }
}

/// Character attributes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CharAttributes {
    pub flags: AttrFlags,
    pub background: ColourId,
    pub foreground: ColourId,
}

impl CharAttributes {
    pub fn is_bold(&self) -> bool {
        self.flags.contains(AttrFlags::BOLD)
    }

    pub fn with_background(mut self, background: ColourId) -> Self {
        self.background = background;
        self
    }

    pub fn with_foreground(mut self, foreground: ColourId) -> Self {
        self.foreground = foreground;
        self
    }

    /// Apply SGR parameters on top of these attributes.
    ///
    /// An empty parameter list behaves as a single `0` (reset). Extended
    /// colour selectors (38/48) are skipped together with their arguments
    /// since only the 16-colour palette is modelled.
    pub fn with_sgr(self, params: &[u16]) -> Self {
        if params.is_empty() {
            return Self::default();
        }

        let mut attrs = self;
        let mut iter = params.iter().copied();

        while let Some(param) = iter.next() {
            match param {
                0 => attrs = Self::default(),
                1 => attrs.flags |= AttrFlags::BOLD,
                22 => attrs.flags &= !AttrFlags::BOLD,
                30..=37 => attrs.foreground = ColourId::indexed((param - 30) as u8),
                39 => attrs.foreground = ColourId::DEFAULT,
                40..=47 => attrs.background = ColourId::indexed((param - 40) as u8),
                49 => attrs.background = ColourId::DEFAULT,
                90..=97 => attrs.foreground = ColourId::indexed((param - 90 + 8) as u8),
                100..=107 => attrs.background = ColourId::indexed((param - 100 + 8) as u8),
                38 | 48 => {
                    // 38;5;n or 38;2;r;g;b
                    match iter.next() {
                        Some(5) => {
                            iter.next();
                        }
                        Some(2) => {
                            iter.next();
                            iter.next();
                            iter.next();
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        attrs
    }
}

/// A single grid cell
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cell {
    pub ch: char,
    pub attrs: CharAttributes,
}

impl Cell {
    pub const fn new(ch: char, attrs: CharAttributes) -> Self {
        Self { ch, attrs }
    }

    /// Space with default attributes
    pub fn blank() -> Self {
        Self::new(' ', CharAttributes::default())
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::blank()
    }
}

/// Terminal size in columns and rows, both at least 1
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    columns: u16,
    rows: u16,
}

impl TerminalSize {
    pub fn new(columns: u16, rows: u16) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }

    pub fn columns(&self) -> u16 {
        self.columns
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    /// Number of cells in a grid of this size
    pub fn area(&self) -> usize {
        self.columns as usize * self.rows as usize
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}", self.columns, self.rows)
    }
}

/// Buffer coordinate. Row 0 is the top of the live grid; negative rows
/// address history, -1 being the most recently scrolled-off line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TerminalPoint {
    pub column: u16,
    pub row: i32,
}

impl TerminalPoint {
    pub const fn new(column: u16, row: i32) -> Self {
        Self { column, row }
    }
}

impl Ord for TerminalPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then(self.column.cmp(&other.column))
    }
}

impl PartialOrd for TerminalPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TerminalPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.column, self.row)
    }
}

/// Selection shape
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionMode {
    /// Rectangle spanned by the two corner points
    #[default]
    Block,
}

/// Text selection in buffer coordinates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub mode: SelectionMode,
    pub start: TerminalPoint,
    pub end: TerminalPoint,
}

impl Selection {
    pub fn new(mode: SelectionMode, start: TerminalPoint, end: TerminalPoint) -> Self {
        Self { mode, start, end }
    }

    /// Zero-size selection anchored at `point`
    pub fn at(point: TerminalPoint) -> Self {
        Self::new(SelectionMode::Block, point, point)
    }

    /// Same anchor, new end point
    pub fn extended_to(self, end: TerminalPoint) -> Self {
        Self { end, ..self }
    }

    /// Whether the end lies before the start (row first, then column)
    pub fn is_reversed(&self) -> bool {
        self.start > self.end
    }

    /// Top-left and bottom-right corners of the selected block
    pub fn min_max(&self) -> (TerminalPoint, TerminalPoint) {
        match self.mode {
            SelectionMode::Block => (
                TerminalPoint::new(
                    self.start.column.min(self.end.column),
                    self.start.row.min(self.end.row),
                ),
                TerminalPoint::new(
                    self.start.column.max(self.end.column),
                    self.start.row.max(self.end.row),
                ),
            ),
        }
    }

    pub fn contains(&self, column: u16, row: i32) -> bool {
        let (min, max) = self.min_max();
        column >= min.column && column <= max.column && row >= min.row && row <= max.row
    }
}
