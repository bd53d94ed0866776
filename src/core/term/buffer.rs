//! Screen buffer
//!
//! A fixed-size grid of cells with a cursor, current attributes, bounded
//! scroll-back history, a scrollable view window and an optional block
//! selection. Terminal codes are applied one at a time through
//! [`ScreenBuffer::apply`].

use std::collections::VecDeque;
use thiserror::Error;

use super::parser::TerminalCode;
use super::state::{Cell, CharAttributes, ColourId, Selection, TerminalSize};
use super::tag::{TerminalTag, TerminalTagArray};

/// Maximum number of lines kept in history
pub const MAX_HISTORY: usize = 1024;

/// Default distance between tab stops
const TAB_WIDTH: usize = 8;

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Range {column}+{length} overflows line length {width}")]
    RangeOverflow {
        column: u16,
        length: usize,
        width: usize,
    },

    #[error("Row {0} is outside the buffer and its history")]
    RowOutOfRange(i32),

    #[error("Empty text range")]
    EmptyRange,
}

/// Side effects of applying a code that the owner has to handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BufferEvent {
    Bell,
    TitleChanged(String),
}

/// Where a view row comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowOrigin {
    History,
    Live,
    /// Before the oldest history line or past the bottom of the grid
    Beyond,
}

/// One row captured when it scrolled off the top of the grid
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryLine {
    cells: Box<[Cell]>,
}

impl HistoryLine {
    fn from_cells(cells: &[Cell]) -> Self {
        Self {
            cells: cells.into(),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn columns(&self) -> usize {
        self.cells.len()
    }

    pub fn text(&self) -> String {
        self.cells.iter().map(|c| c.ch).collect()
    }
}

#[derive(Clone, Copy, Debug)]
struct SavedCursor {
    x: usize,
    y: usize,
    attrs: CharAttributes,
}

/// Screen buffer with scrollback
pub struct ScreenBuffer {
    size: TerminalSize,
    /// Row-major grid, always `rows * columns` long
    cells: Vec<Cell>,
    history: VecDeque<HistoryLine>,
    cursor_x: usize,
    cursor_y: usize,
    /// The last column has been written. Characters are dropped until the
    /// cursor moves; `cursor_x` stays on the last column meanwhile.
    at_edge: bool,
    /// Attributes given to newly typed characters
    pub current_attrs: CharAttributes,
    pub show_cursor: bool,
    /// Absolute row shown at the top of the view; 0 is the live grid
    window_top: i32,
    selection: Option<Selection>,
    tab_stops: Vec<bool>,
    saved_cursor: Option<SavedCursor>,
}

impl ScreenBuffer {
    pub fn new(size: TerminalSize) -> Self {
        Self {
            size,
            cells: vec![Cell::blank(); size.area()],
            history: VecDeque::with_capacity(MAX_HISTORY),
            cursor_x: 0,
            cursor_y: 0,
            at_edge: false,
            current_attrs: CharAttributes::default(),
            show_cursor: true,
            window_top: 0,
            selection: None,
            tab_stops: default_tab_stops(size.columns() as usize),
            saved_cursor: None,
        }
    }

    pub fn size(&self) -> TerminalSize {
        self.size
    }

    fn columns(&self) -> usize {
        self.size.columns() as usize
    }

    fn rows(&self) -> usize {
        self.size.rows() as usize
    }

    fn index(&self, x: usize, y: usize) -> usize {
        x + y * self.columns()
    }

    /// Reallocate the grid, keeping the rows that end at the cursor.
    ///
    /// Content that does not fit is dropped, not moved to history.
    pub fn resize(&mut self, new_size: TerminalSize) {
        if new_size == self.size {
            return;
        }

        let old_cols = self.columns();
        let old_rows = self.rows();
        let new_cols = new_size.columns() as usize;
        let new_rows = new_size.rows() as usize;

        let copy_cols = old_cols.min(new_cols);
        let src_top = (self.cursor_y + 1).saturating_sub(new_rows);
        let copy_rows = (old_rows - src_top).min(new_rows);

        let mut cells = vec![Cell::blank(); new_size.area()];
        for y in 0..copy_rows {
            let src = (src_top + y) * old_cols;
            let dst = y * new_cols;
            cells[dst..dst + copy_cols].copy_from_slice(&self.cells[src..src + copy_cols]);
        }

        self.cells = cells;
        self.size = new_size;
        self.cursor_y -= src_top;
        self.cursor_x = self.cursor_x.min(new_cols - 1);
        self.at_edge = false;
        self.tab_stops = default_tab_stops(new_cols);
        self.scroll_to_cursor();
    }

    // ---- cursor ----------------------------------------------------------

    pub fn cursor_x(&self) -> usize {
        self.cursor_x
    }

    pub fn cursor_y(&self) -> usize {
        self.cursor_y
    }

    /// Move the cursor, clamped to the grid
    pub fn set_cursor(&mut self, x: usize, y: usize) {
        self.cursor_x = x.min(self.columns() - 1);
        self.cursor_y = y.min(self.rows() - 1);
        self.at_edge = false;
        self.scroll_to_cursor();
    }

    /// Column relative moves start from; one past the grid at the edge
    fn logical_x(&self) -> usize {
        self.cursor_x + usize::from(self.at_edge)
    }

    pub fn set_cursor_x(&mut self, x: usize) {
        self.set_cursor(x, self.cursor_y);
    }

    /// Vertical moves keep a pending edge
    pub fn set_cursor_y(&mut self, y: usize) {
        let at_edge = self.at_edge;
        self.set_cursor(self.cursor_x, y);
        self.at_edge = at_edge;
    }

    fn save_cursor(&mut self) {
        self.saved_cursor = Some(SavedCursor {
            x: self.cursor_x,
            y: self.cursor_y,
            attrs: self.current_attrs,
        });
    }

    fn restore_cursor(&mut self) {
        if let Some(saved) = self.saved_cursor {
            self.current_attrs = saved.attrs;
            self.set_cursor(saved.x, saved.y);
        }
    }

    // ---- writing ---------------------------------------------------------

    pub fn clear(&mut self) {
        let (right, bottom) = (self.columns() as i32 - 1, self.rows() as i32 - 1);
        self.clear_block(0, 0, right, bottom);
    }

    /// Blank an inclusive rectangle with default attributes. Coordinates are
    /// clamped to the grid; an empty rectangle is a no-op.
    pub fn clear_block(&mut self, left: i32, top: i32, right: i32, bottom: i32) {
        let left = left.max(0);
        let top = top.max(0);
        let right = right.min(self.columns() as i32 - 1);
        let bottom = bottom.min(self.rows() as i32 - 1);

        if left <= right && top <= bottom {
            for y in top as usize..=bottom as usize {
                let start = self.index(left as usize, y);
                let end = self.index(right as usize, y);
                self.cells[start..=end].fill(Cell::blank());
            }
        }
        self.scroll_to_cursor();
    }

    /// Write one character at the cursor with the current attributes.
    ///
    /// There is no auto-wrap: once the last column is written, further
    /// characters are dropped until the cursor is moved.
    pub fn type_char(&mut self, c: char) {
        self.put_char(c);
        self.scroll_to_cursor();
    }

    pub fn type_str(&mut self, text: &str) {
        for c in text.chars() {
            self.put_char(c);
        }
        self.scroll_to_cursor();
    }

    fn put_char(&mut self, c: char) {
        let (x, y) = (self.cursor_x, self.cursor_y);
        if self.at_edge || x >= self.columns() || y >= self.rows() {
            return;
        }
        let index = self.index(x, y);
        self.cells[index] = Cell::new(c, self.current_attrs);
        if x + 1 < self.columns() {
            self.cursor_x = x + 1;
        } else {
            self.at_edge = true;
        }
    }

    /// Move the top row into history and every other row up by one. The
    /// bottom row keeps its previous contents.
    pub fn shift_up(&mut self) {
        let cols = self.columns();
        self.push_history(HistoryLine::from_cells(&self.cells[..cols]));
        self.cells.copy_within(cols.., 0);
    }

    fn push_history(&mut self, line: HistoryLine) {
        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(line);
        self.window_top = self.window_top.max(-(self.history.len() as i32));
    }

    fn line_feed(&mut self) {
        let last = self.rows() - 1;
        if self.cursor_y == last {
            self.shift_up();
            self.clear_block(0, last as i32, self.columns() as i32 - 1, last as i32);
        } else {
            self.set_cursor_y(self.cursor_y + 1);
        }
    }

    fn tab(&mut self) {
        let next = (self.logical_x() + 1..self.columns())
            .find(|&x| self.tab_stops[x])
            .unwrap_or(self.columns() - 1);
        self.set_cursor_x(next);
    }

    fn set_tab_stop(&mut self) {
        let x = self.cursor_x;
        if let Some(stop) = self.tab_stops.get_mut(x) {
            *stop = true;
        }
    }

    fn erase_in_line(&mut self, mode: u16) {
        let y = self.cursor_y as i32;
        let x = self.cursor_x as i32;
        let right = self.columns() as i32 - 1;
        match mode {
            0 => self.clear_block(x, y, right, y),
            1 => self.clear_block(0, y, x, y),
            2 => self.clear_block(0, y, right, y),
            _ => tracing::debug!("Unknown erase-in-line mode {}", mode),
        }
    }

    fn erase_in_display(&mut self, mode: u16) {
        let y = self.cursor_y as i32;
        let right = self.columns() as i32 - 1;
        let bottom = self.rows() as i32 - 1;
        match mode {
            0 => {
                self.erase_in_line(0);
                self.clear_block(0, y + 1, right, bottom);
            }
            1 => {
                self.clear_block(0, 0, right, y - 1);
                self.erase_in_line(1);
            }
            2 | 3 => {
                self.clear();
                self.set_cursor(0, 0);
            }
            _ => tracing::debug!("Unknown erase-in-display mode {}", mode),
        }
    }

    fn set_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            25 => self.show_cursor = enable,
            _ => tracing::debug!("Ignored mode {} = {}", mode, enable),
        }
    }

    /// Full reset. History is kept.
    fn reset(&mut self) {
        self.clear();
        self.current_attrs = CharAttributes::default();
        self.show_cursor = true;
        self.saved_cursor = None;
        self.tab_stops = default_tab_stops(self.columns());
        self.set_cursor(0, 0);
    }

    /// Apply one decoded terminal code.
    pub fn apply(&mut self, code: TerminalCode) -> Option<BufferEvent> {
        match code {
            TerminalCode::Text(text) => self.type_str(&text),
            TerminalCode::Bell => return Some(BufferEvent::Bell),
            TerminalCode::LineFeed => self.line_feed(),
            TerminalCode::CarriageReturn => self.set_cursor_x(0),
            TerminalCode::Backspace => self.set_cursor_x(self.logical_x().saturating_sub(1)),
            TerminalCode::Tab => self.tab(),
            TerminalCode::ShiftOut | TerminalCode::ShiftIn => {
                // Alternate character sets are not modelled
            }
            TerminalCode::SaveCursor => self.save_cursor(),
            TerminalCode::RestoreCursor => self.restore_cursor(),
            TerminalCode::Reset => self.reset(),
            TerminalCode::SetTitle(title) => return Some(BufferEvent::TitleChanged(title)),
            TerminalCode::TabSet => self.set_tab_stop(),
            TerminalCode::CursorPosition { line, column } => {
                self.set_cursor(column as usize, line as usize)
            }
            TerminalCode::CursorCharAbsolute(column) => self.set_cursor_x(column as usize),
            TerminalCode::CursorUp(n) => self.set_cursor_y(self.cursor_y.saturating_sub(n as usize)),
            TerminalCode::CursorDown(n) => self.set_cursor_y(self.cursor_y + n as usize),
            TerminalCode::CursorForward(n) => self.set_cursor_x(self.logical_x() + n as usize),
            TerminalCode::CursorBackward(n) => {
                self.set_cursor_x(self.logical_x().saturating_sub(n as usize))
            }
            TerminalCode::EraseInDisplay(mode) => self.erase_in_display(mode),
            TerminalCode::EraseInLine(mode) => self.erase_in_line(mode),
            TerminalCode::SetGraphicsMode(params) => {
                self.current_attrs = self.current_attrs.with_sgr(&params)
            }
            TerminalCode::SetMode(mode) => self.set_mode(mode, true),
            TerminalCode::ResetMode(mode) => self.set_mode(mode, false),
        }
        None
    }

    // ---- history and view ------------------------------------------------

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// History line by age, 0 being the oldest
    pub fn history_line(&self, index: usize) -> Option<&HistoryLine> {
        self.history.get(index)
    }

    pub fn window_top(&self) -> i32 {
        self.window_top
    }

    /// Move the view by `delta` rows (negative scrolls back into history)
    pub fn scroll(&mut self, delta: i32) {
        self.window_top = self
            .window_top
            .saturating_add(delta)
            .clamp(-(self.history.len() as i32), 0);
    }

    /// Pin the view back to the live grid
    pub fn scroll_to_bottom(&mut self) {
        self.window_top = 0;
    }

    pub fn is_scrolled(&self) -> bool {
        self.window_top != 0
    }

    /// Move the view just enough for the cursor row to be visible
    pub fn scroll_to_cursor(&mut self) {
        let cursor = self.cursor_y as i32;
        let rows = self.rows() as i32;
        if cursor < self.window_top {
            self.window_top = cursor;
        } else if cursor >= self.window_top + rows {
            self.window_top = cursor - rows + 1;
        }
        self.window_top = self.window_top.clamp(-(self.history.len() as i32), 0);
    }

    /// Cells of an absolute row: negative rows index history backwards
    fn row_cells(&self, row: i32) -> Option<&[Cell]> {
        if row < 0 {
            let index = self.history.len() as i32 + row;
            if index < 0 {
                return None;
            }
            self.history.get(index as usize).map(HistoryLine::cells)
        } else if (row as usize) < self.rows() {
            let start = self.index(0, row as usize);
            Some(&self.cells[start..start + self.columns()])
        } else {
            None
        }
    }

    /// Source of view row `y`
    pub fn row_origin(&self, y: usize) -> RowOrigin {
        let row = self.window_top + y as i32;
        match self.row_cells(row) {
            None => RowOrigin::Beyond,
            Some(_) if row < 0 => RowOrigin::History,
            Some(_) => RowOrigin::Live,
        }
    }

    // ---- reading ---------------------------------------------------------

    /// Stored attributes overlaid with cursor or selection highlight
    fn effective_attrs(&self, x: usize, row: i32, cell: &Cell) -> CharAttributes {
        if self.show_cursor && !self.at_edge && row == self.cursor_y as i32 && x == self.cursor_x {
            cell.attrs.with_background(ColourId::CURSOR)
        } else if self
            .selection
            .is_some_and(|sel| sel.contains(x as u16, row))
        {
            cell.attrs.with_background(ColourId::SELECTION)
        } else {
            cell.attrs
        }
    }

    /// Run-length encode view row `y` by effective attributes.
    ///
    /// Rows outside the grid and history produce an empty array.
    pub fn formatted_line(&self, y: usize) -> TerminalTagArray {
        let row = self.window_top + y as i32;
        let Some(cells) = self.row_cells(row) else {
            return TerminalTagArray::default();
        };
        let Some(first) = cells.first() else {
            return TerminalTagArray::default();
        };

        let mut tags = Vec::with_capacity(8);
        let mut text = String::from(first.ch);
        let mut tag_attrs = self.effective_attrs(0, row, first);

        for (x, cell) in cells.iter().enumerate().skip(1) {
            let attrs = self.effective_attrs(x, row, cell);
            if !can_continue_tag(tag_attrs, attrs, cell.ch) {
                tags.push(TerminalTag::new(std::mem::take(&mut text), tag_attrs));
                tag_attrs = attrs;
            }
            text.push(cell.ch);
        }
        tags.push(TerminalTag::new(text, tag_attrs));

        TerminalTagArray::new(tags)
    }

    /// Characters `column..column + length` of absolute row `row`
    pub fn line_text(&self, column: u16, row: i32, length: usize) -> Result<String, BufferError> {
        let cells = self.row_cells(row).ok_or(BufferError::RowOutOfRange(row))?;
        let start = column as usize;
        if start + length > cells.len() {
            return Err(BufferError::RangeOverflow {
                column,
                length,
                width: cells.len(),
            });
        }
        Ok(cells[start..start + length].iter().map(|c| c.ch).collect())
    }

    /// Text of an inclusive rectangle, one string per row
    pub fn text(&self, left: u16, top: i32, right: u16, bottom: i32) -> Result<Vec<String>, BufferError> {
        if right < left || bottom < top {
            return Err(BufferError::EmptyRange);
        }
        let width = (right - left) as usize + 1;
        (top..=bottom)
            .map(|row| self.line_text(left, row, width))
            .collect()
    }

    // ---- selection -------------------------------------------------------

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection;
    }

    /// Text under the selection, or `None` when nothing is selected.
    ///
    /// The selection comes from the user, so each row is cut to the width it
    /// actually has: history lines keep the width they scrolled off with, and
    /// rows that no longer exist read as empty.
    pub fn selection_text(&self) -> Option<Vec<String>> {
        let (min, max) = self.selection?.min_max();
        let rows = (min.row..=max.row)
            .map(|row| {
                let cells = self.row_cells(row).unwrap_or(&[]);
                let start = (min.column as usize).min(cells.len());
                let end = (max.column as usize + 1).min(cells.len());
                cells[start..end].iter().map(|c| c.ch).collect()
            })
            .collect();
        Some(rows)
    }

    /// Selection rows joined with the platform line ending, ready for the
    /// clipboard
    pub fn copy_selection(&self) -> Option<String> {
        self.selection_text().map(|rows| rows.join(LINE_ENDING))
    }
}

/// Whether a cell with `next` attributes extends a tag started with
/// `previous`. Foreground colour is invisible on a space, so spaces only need
/// a matching background.
fn can_continue_tag(previous: CharAttributes, next: CharAttributes, next_char: char) -> bool {
    if next_char == ' ' {
        previous.background == next.background
    } else {
        previous == next
    }
}

fn default_tab_stops(columns: usize) -> Vec<bool> {
    (0..columns).map(|x| x > 0 && x % TAB_WIDTH == 0).collect()
}
