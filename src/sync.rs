//! Section sync: one controller per idea canvas.
//!
//! DESIGN
//! ======
//! Three inputs drive the editable sections:
//!
//! - local input: the surface already holds the new text; it is saved via
//!   REST (fire-and-forget), broadcast on `canvas:{id}` and fed to a
//!   per-section autosave throttle that appends a history entry and then
//!   broadcasts on `canvas:{id}:history`
//! - remote broadcasts on `canvas:{id}`: patched into the surface unless the
//!   text is already identical, keeping the caret of a focused section
//! - history broadcasts on `canvas:{id}:history`: reload the history list
//!
//! Surface writes for local and remote edits happen synchronously, before
//! any network call is issued. Concurrent edits from two clients are
//! last-broadcast-wins at each receiver.
//!
//! Bus callbacks hold only a `Weak` reference to the controller, so a
//! controller dropped without `teardown` is not kept alive by the bus.
//!
//! ERROR HANDLING
//! ==============
//! REST failures are logged and shown via `EditorSurface::alert`; the
//! surface is never rolled back because no optimistic copy exists.
//! Autosave failures are only logged.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use frames::{HistoryUpdate, SectionUpdate};
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::api::{ApiError, CanvasApi};
use crate::bus::Callback;
use crate::caret::char_len;
use crate::config::SyncConfig;
use crate::connection::Connection;
use crate::history;
use crate::surface::EditorSurface;
use crate::throttle::{FireFn, Throttle};

pub const LOAD_SECTIONS_FAILED: &str = "Failed to load sections";
pub const LOAD_HISTORY_FAILED: &str = "Failed to load history";
pub const SAVE_FAILED: &str = "Failed to save changes";
pub const LOAD_ENTRY_FAILED: &str = "Failed to load entry";
pub const REVERT_FAILED: &str = "Revert failed";
pub const REVERT_PROMPT: &str = "Revert to this version?";

/// Live controller for one idea. Call [`SectionSync::teardown`] when done.
pub struct SectionSync {
    inner: Arc<SyncInner>,
    on_edit: Callback,
    on_history: Callback,
}

struct SyncInner {
    idea_id: String,
    edit_channel: String,
    history_channel: String,
    api: Arc<dyn CanvasApi>,
    connection: Connection,
    surface: Arc<dyn EditorSurface>,
    autosave: Throttle<String>,
    saves: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SectionSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionSync")
            .field("idea_id", &self.inner.idea_id)
            .field("autosave", &self.inner.autosave)
            .finish_non_exhaustive()
    }
}

impl SectionSync {
    /// Subscribe to the idea's edit and history channels. Nothing is loaded
    /// until [`SectionSync::start`].
    #[must_use]
    pub fn attach(
        idea_id: &str,
        api: Arc<dyn CanvasApi>,
        connection: Connection,
        surface: Arc<dyn EditorSurface>,
        config: &SyncConfig,
    ) -> Self {
        let edit_channel = frames::canvas_channel(idea_id);
        let history_channel = frames::history_channel(idea_id);
        let autosave = Throttle::new(
            config.autosave_throttle,
            autosave_action(idea_id, &history_channel, Arc::clone(&api), connection.clone()),
        );

        let inner = Arc::new(SyncInner {
            idea_id: idea_id.to_owned(),
            edit_channel,
            history_channel,
            api,
            connection,
            surface,
            autosave,
            saves: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let on_edit: Callback = Arc::new(move |_: &str, payload: &Value| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_remote(payload);
            }
        });

        let weak: Weak<SyncInner> = Arc::downgrade(&inner);
        let on_history: Callback = Arc::new(move |_: &str, _: &Value| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    let _ = inner.load_history().await;
                });
            }
        });

        inner.connection.subscribe(&inner.edit_channel, Arc::clone(&on_edit));
        inner.connection.subscribe(&inner.history_channel, Arc::clone(&on_history));
        info!(idea_id, "section sync: attached");

        Self { inner, on_edit, on_history }
    }

    #[must_use]
    pub fn idea_id(&self) -> &str {
        &self.inner.idea_id
    }

    /// Load sections and history concurrently.
    pub async fn start(&self) {
        let _ = tokio::join!(self.inner.load_sections(), self.inner.load_history());
    }

    /// Fetch and render all sections. On failure the user is alerted and the
    /// surface keeps what it had.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] after it has been surfaced.
    pub async fn load_sections(&self) -> Result<(), ApiError> {
        self.inner.load_sections().await
    }

    /// Fetch and render the history list.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] after it has been surfaced.
    pub async fn load_history(&self) -> Result<(), ApiError> {
        self.inner.load_history().await
    }

    /// Write `text` into the section, then handle it as user input.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn edit_section(&self, section_id: &str, text: &str) {
        self.inner.surface.replace_text(section_id, text);
        self.handle_input(section_id);
    }

    /// The user changed `section_id`: save, broadcast, schedule autosave.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn handle_input(&self, section_id: &str) {
        self.inner.handle_input(section_id);
    }

    /// Show one history entry's snapshot.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] after it has been surfaced.
    pub async fn view_history(&self, entry_id: &str) -> Result<(), ApiError> {
        let inner = &self.inner;
        match inner.api.get_history_entry(&inner.idea_id, entry_id).await {
            Ok(entry) => {
                inner.surface.show_snapshot(&entry);
                Ok(())
            }
            Err(err) => {
                error!(idea_id = %inner.idea_id, entry_id, error = %err, "section sync: failed to load history entry");
                inner.surface.alert(LOAD_ENTRY_FAILED);
                Err(err)
            }
        }
    }

    /// Ask for confirmation, revert server-side, then reload sections.
    /// Returns `Ok(false)` when the user declined.
    ///
    /// # Errors
    ///
    /// Returns the revert's [`ApiError`] after it has been surfaced.
    pub async fn revert_history(&self, entry_id: &str) -> Result<bool, ApiError> {
        let inner = &self.inner;
        if !inner.surface.confirm(REVERT_PROMPT) {
            debug!(entry_id, "section sync: revert declined");
            return Ok(false);
        }
        if let Err(err) = inner.api.revert_history(&inner.idea_id, entry_id).await {
            error!(idea_id = %inner.idea_id, entry_id, error = %err, "section sync: revert failed");
            inner.surface.alert(REVERT_FAILED);
            return Err(err);
        }
        info!(idea_id = %inner.idea_id, entry_id, "section sync: reverted");
        let _ = inner.load_sections().await;
        Ok(true)
    }

    /// Wait for in-flight section saves, then run pending autosaves now
    /// instead of waiting out their windows.
    pub async fn flush(&self) {
        let saves = std::mem::take(&mut *self.inner.saves());
        for save in saves {
            let _ = save.await;
        }
        self.inner.autosave.flush().await;
    }

    /// Unsubscribe both channels. Pending autosave windows are left to run
    /// out, so the last edit still gets its history entry.
    pub fn teardown(self) {
        let inner = &self.inner;
        inner.connection.unsubscribe(&inner.edit_channel, &self.on_edit);
        inner.connection.unsubscribe(&inner.history_channel, &self.on_history);
        info!(
            idea_id = %inner.idea_id,
            pending_autosaves = inner.autosave.pending_len(),
            "section sync: torn down"
        );
    }
}

impl SyncInner {
    fn saves(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load_sections(&self) -> Result<(), ApiError> {
        match self.api.list_sections(&self.idea_id).await {
            Ok(sections) => {
                debug!(idea_id = %self.idea_id, count = sections.len(), "section sync: sections loaded");
                self.surface.render_sections(&sections);
                Ok(())
            }
            Err(err) => {
                error!(idea_id = %self.idea_id, error = %err, "section sync: failed to load sections");
                self.surface.alert(LOAD_SECTIONS_FAILED);
                Err(err)
            }
        }
    }

    async fn load_history(&self) -> Result<(), ApiError> {
        match self.api.list_history(&self.idea_id).await {
            Ok(entries) => {
                self.surface.render_history(&history::rows(&entries));
                Ok(())
            }
            Err(err) => {
                error!(idea_id = %self.idea_id, error = %err, "section sync: failed to load history");
                self.surface.alert(LOAD_HISTORY_FAILED);
                Err(err)
            }
        }
    }

    fn handle_input(self: &Arc<Self>, section_id: &str) {
        let Some(text) = self.surface.section_text(section_id) else {
            debug!(section_id, "section sync: input for unknown section ignored");
            return;
        };

        let inner = Arc::clone(self);
        let (section, saved) = (section_id.to_owned(), text.clone());
        let save = tokio::spawn(async move {
            if let Err(err) = inner.api.update_section(&inner.idea_id, &section, &saved).await {
                error!(idea_id = %inner.idea_id, section_id = %section, error = %err, "section sync: failed to save section");
                inner.surface.alert(SAVE_FAILED);
            }
        });
        {
            let mut saves = self.saves();
            saves.retain(|save| !save.is_finished());
            saves.push(save);
        }

        let update = SectionUpdate { section_id: section_id.to_owned(), new_text: text.clone() };
        match serde_json::to_value(&update) {
            Ok(payload) => {
                self.connection.send(&self.edit_channel, payload);
            }
            Err(err) => error!(error = %err, "section sync: failed to encode section update"),
        }

        self.autosave.call(section_id, text);
    }

    /// Patch a remote edit into the surface, keeping a focused caret in place.
    fn apply_remote(&self, payload: &Value) {
        let update = match SectionUpdate::deserialize(payload) {
            Ok(update) => update,
            Err(err) => {
                debug!(error = %err, "section sync: ignoring malformed section update");
                return;
            }
        };
        let Some(current) = self.surface.section_text(&update.section_id) else {
            return;
        };
        if current == update.new_text {
            return;
        }

        let caret = if self.surface.has_focus(&update.section_id) {
            self.surface.caret(&update.section_id)
        } else {
            None
        };
        self.surface.replace_text(&update.section_id, &update.new_text);
        if let Some(caret) = caret {
            let restored = caret.restore(char_len(&current), char_len(&update.new_text));
            self.surface.set_caret(&update.section_id, restored);
        }
    }
}

/// Autosave: append a history entry, then tell other clients about it.
fn autosave_action(idea_id: &str, history_channel: &str, api: Arc<dyn CanvasApi>, connection: Connection) -> FireFn<String> {
    let idea_id = idea_id.to_owned();
    let history_channel = history_channel.to_owned();
    Arc::new(move |section_id: String, text: String| {
        let (api, connection) = (Arc::clone(&api), connection.clone());
        let (idea_id, history_channel) = (idea_id.clone(), history_channel.clone());
        async move {
            match api.append_history(&idea_id, &section_id, &text).await {
                Ok(entry) => {
                    debug!(%idea_id, %section_id, "section sync: autosaved history entry");
                    match serde_json::to_value(HistoryUpdate { entry }) {
                        Ok(payload) => {
                            connection.send(&history_channel, payload);
                        }
                        Err(err) => error!(error = %err, "section sync: failed to encode history update"),
                    }
                }
                Err(err) => error!(%idea_id, %section_id, error = %err, "section sync: autosave failed"),
            }
        }
        .boxed()
    })
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
