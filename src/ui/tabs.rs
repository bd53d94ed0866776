//! Ordered list of open sessions with one of them shown

use tterm::SessionId;

/// Session tabs in creation order
#[derive(Debug, Default)]
pub struct Tabs {
    order: Vec<SessionId>,
    active: usize,
}

impl Tabs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a session and show it
    pub fn push(&mut self, id: SessionId) {
        self.order.push(id);
        self.active = self.order.len() - 1;
    }

    /// The session on screen
    pub fn active(&self) -> Option<SessionId> {
        self.order.get(self.active).copied()
    }

    /// Zero-based position of the session on screen
    pub fn position(&self) -> usize {
        self.active
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ids(&self) -> &[SessionId] {
        &self.order
    }

    /// Show the next session, wrapping around
    pub fn next(&mut self) {
        if !self.order.is_empty() {
            self.active = (self.active + 1) % self.order.len();
        }
    }

    /// Show the previous session, wrapping around
    pub fn previous(&mut self) {
        if !self.order.is_empty() {
            self.active = self.active.checked_sub(1).unwrap_or(self.order.len() - 1);
        }
    }

    /// Show the session at `index` (zero-based). Out of range is ignored.
    pub fn select(&mut self, index: usize) -> bool {
        if index < self.order.len() {
            self.active = index;
            true
        } else {
            false
        }
    }

    /// Forget a finished session.
    ///
    /// Removing the shown session falls back to the one before it (or the
    /// new first one). Removing another keeps the same session on screen.
    /// Returns true when the shown session changed.
    pub fn remove(&mut self, id: SessionId) -> bool {
        let Some(index) = self.order.iter().position(|&tab| tab == id) else {
            return false;
        };
        self.order.remove(index);

        if index < self.active {
            self.active -= 1;
            false
        } else if index == self.active {
            self.active = index.saturating_sub(1);
            true
        } else {
            false
        }
    }
}
