//! Formatted lines
//!
//! A formatted line is a run-length encoding of one visible row: consecutive
//! spans of text sharing the same effective attributes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::state::CharAttributes;

/// A span of text with uniform attributes
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TerminalTag {
    pub text: String,
    pub attrs: CharAttributes,
}

impl TerminalTag {
    pub fn new(text: impl Into<String>, attrs: CharAttributes) -> Self {
        Self {
            text: text.into(),
            attrs,
        }
    }

    /// Length in cells
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Immutable, cheaply clonable sequence of tags.
///
/// Equality short-circuits on a hash computed at construction, so comparing
/// the previous frame's line against the new one is cheap.
#[derive(Clone, Debug)]
pub struct TerminalTagArray {
    tags: Arc<[TerminalTag]>,
    hash: u64,
}

impl TerminalTagArray {
    pub fn new(tags: Vec<TerminalTag>) -> Self {
        let mut hasher = DefaultHasher::new();
        tags.hash(&mut hasher);
        Self {
            tags: tags.into(),
            hash: hasher.finish(),
        }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TerminalTag> {
        self.tags.iter()
    }

    pub fn as_slice(&self) -> &[TerminalTag] {
        &self.tags
    }

    /// Plain text of the whole line
    pub fn text(&self) -> String {
        self.tags.iter().map(|t| t.text.as_str()).collect()
    }
}

impl Default for TerminalTagArray {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PartialEq for TerminalTagArray {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && (Arc::ptr_eq(&self.tags, &other.tags) || self.tags == other.tags)
    }
}

impl Eq for TerminalTagArray {}

impl Hash for TerminalTagArray {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl<'a> IntoIterator for &'a TerminalTagArray {
    type Item = &'a TerminalTag;
    type IntoIter = std::slice::Iter<'a, TerminalTag>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::state::ColourId;

    #[test]
    fn test_structural_equality() {
        let red = CharAttributes::default().with_foreground(ColourId(1));
        let a = TerminalTagArray::new(vec![
            TerminalTag::new("red", red),
            TerminalTag::new("plain", CharAttributes::default()),
        ]);
        let b = TerminalTagArray::new(vec![
            TerminalTag::new("red", red),
            TerminalTag::new("plain", CharAttributes::default()),
        ]);
        let c = TerminalTagArray::new(vec![TerminalTag::new("redplain", red)]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.text(), c.text());
        assert_eq!(TerminalTagArray::default().len(), 0);
    }
}
