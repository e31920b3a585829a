//! Caret offset math for remote text patches.
//!
//! Offsets count characters (Unicode scalar values), never bytes, so a
//! caret never lands inside a multi-byte sequence.

/// Offset to restore after a region's text changed from `old_len` to
/// `new_len` characters: the old offset clamped to the new length.
#[must_use]
pub fn restore_offset(old_offset: usize, _old_len: usize, new_len: usize) -> usize {
    old_offset.min(new_len)
}

/// A selection range inside one editable region. `start == end` is a
/// collapsed caret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caret {
    pub start: usize,
    pub end: usize,
}

impl Caret {
    #[must_use]
    pub fn collapsed(offset: usize) -> Self {
        Self { start: offset, end: offset }
    }

    /// Equivalent range after the text length changed.
    #[must_use]
    pub fn restore(self, old_len: usize, new_len: usize) -> Self {
        Self {
            start: restore_offset(self.start, old_len, new_len),
            end: restore_offset(self.end, old_len, new_len),
        }
    }

    #[must_use]
    pub fn is_collapsed(self) -> bool {
        self.start == self.end
    }
}

/// Number of characters in `text`, the unit every caret offset uses.
#[must_use]
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
#[path = "caret_test.rs"]
mod tests;
