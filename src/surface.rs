//! Editor surface: the editable regions and user notifications a
//! [`SectionSync`](crate::sync::SectionSync) drives.
//!
//! The sync layer never touches a rendering environment directly. It reads
//! and writes section text, focus and caret through [`EditorSurface`], so
//! the caret-preserving patch logic runs the same against a terminal, a
//! GUI binding, or the headless [`MemorySurface`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::api::{HistoryEntry, Section};
use crate::caret::Caret;
use crate::history::HistoryRow;

/// Editable regions keyed by section id, plus blocking user notifications.
pub trait EditorSurface: Send + Sync {
    /// Replace every region with one per section, in order.
    fn render_sections(&self, sections: &[Section]);

    /// Live text of a region, or `None` when no region exists for `section_id`.
    fn section_text(&self, section_id: &str) -> Option<String>;

    /// Overwrite a region's text. Like a DOM text write, this drops any
    /// selection inside the region.
    fn replace_text(&self, section_id: &str, text: &str);

    /// Whether the region currently holds input focus.
    fn has_focus(&self, section_id: &str) -> bool;

    /// Selection inside the region, in character offsets.
    fn caret(&self, section_id: &str) -> Option<Caret>;

    fn set_caret(&self, section_id: &str, caret: Caret);

    fn render_history(&self, rows: &[HistoryRow]);

    /// Display one history entry's snapshot.
    fn show_snapshot(&self, entry: &HistoryEntry);

    /// User-facing failure notification.
    fn alert(&self, message: &str);

    /// Ask the user to confirm; `false` cancels the action.
    fn confirm(&self, message: &str) -> bool;
}

/// Headless surface holding everything in memory.
#[derive(Debug)]
pub struct MemorySurface {
    state: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    sections: Vec<Section>,
    focus: Option<String>,
    caret: Option<Caret>,
    history: Vec<HistoryRow>,
    snapshot: Option<HistoryEntry>,
    alerts: Vec<String>,
    prompts: Vec<String>,
    confirm_answer: bool,
    mutations: usize,
}

impl Default for MemorySurface {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                sections: Vec::new(),
                focus: None,
                caret: None,
                history: Vec::new(),
                snapshot: None,
                alerts: Vec::new(),
                prompts: Vec::new(),
                confirm_answer: true,
                mutations: 0,
            }),
        }
    }
}

impl MemorySurface {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every later `confirm` prompt with `answer`.
    pub fn set_confirm_answer(&self, answer: bool) {
        self.lock().confirm_answer = answer;
    }

    /// Give `section_id` focus with the caret at `caret`.
    pub fn focus(&self, section_id: &str, caret: Caret) {
        let mut state = self.lock();
        state.focus = Some(section_id.to_owned());
        state.caret = Some(caret);
    }

    pub fn blur(&self) {
        let mut state = self.lock();
        state.focus = None;
        state.caret = None;
    }

    #[must_use]
    pub fn sections(&self) -> Vec<Section> {
        self.lock().sections.clone()
    }

    #[must_use]
    pub fn history_rows(&self) -> Vec<HistoryRow> {
        self.lock().history.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<HistoryEntry> {
        self.lock().snapshot.clone()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<String> {
        self.lock().alerts.clone()
    }

    /// Messages passed to `confirm`, oldest first.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.lock().prompts.clone()
    }

    /// Number of text writes (renders and replacements) so far.
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EditorSurface for MemorySurface {
    fn render_sections(&self, sections: &[Section]) {
        let mut state = self.lock();
        state.sections = sections.to_vec();
        state.mutations += 1;
        if state.focus.as_ref().is_some_and(|focus| !sections.iter().any(|s| &s.id == focus)) {
            state.focus = None;
            state.caret = None;
        }
    }

    fn section_text(&self, section_id: &str) -> Option<String> {
        self.lock().sections.iter().find(|s| s.id == section_id).map(|s| s.text.clone())
    }

    fn replace_text(&self, section_id: &str, text: &str) {
        let mut state = self.lock();
        let Some(section) = state.sections.iter_mut().find(|s| s.id == section_id) else {
            return;
        };
        text.clone_into(&mut section.text);
        state.mutations += 1;
        if state.focus.as_deref() == Some(section_id) {
            state.caret = Some(Caret::collapsed(0));
        }
    }

    fn has_focus(&self, section_id: &str) -> bool {
        self.lock().focus.as_deref() == Some(section_id)
    }

    fn caret(&self, section_id: &str) -> Option<Caret> {
        let state = self.lock();
        if state.focus.as_deref() == Some(section_id) { state.caret } else { None }
    }

    fn set_caret(&self, section_id: &str, caret: Caret) {
        let mut state = self.lock();
        if state.focus.as_deref() == Some(section_id) {
            state.caret = Some(caret);
        }
    }

    fn render_history(&self, rows: &[HistoryRow]) {
        self.lock().history = rows.to_vec();
    }

    fn show_snapshot(&self, entry: &HistoryEntry) {
        self.lock().snapshot = Some(entry.clone());
    }

    fn alert(&self, message: &str) {
        self.lock().alerts.push(message.to_owned());
    }

    fn confirm(&self, message: &str) -> bool {
        let mut state = self.lock();
        state.prompts.push(message.to_owned());
        state.confirm_answer
    }
}

#[cfg(test)]
#[path = "surface_test.rs"]
mod tests;
