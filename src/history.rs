//! History list rendering and view/revert dispatch.
//!
//! Rows keep server order. The view holds no state of its own: every
//! action goes straight to [`SectionSync`].

use time::OffsetDateTime;
use time::macros::format_description;

use crate::api::{ApiError, HistoryEntry};
use crate::sync::SectionSync;

/// One rendered history line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub id: String,
    /// `"{timestamp} by {author}"`, timestamp in UTC.
    pub label: String,
}

/// Per-row control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryAction {
    View(String),
    Revert(String),
}

impl HistoryAction {
    /// Build from a control name (`"view"` / `"revert"`) and entry id.
    #[must_use]
    pub fn parse(action: &str, entry_id: &str) -> Option<Self> {
        match action {
            "view" => Some(Self::View(entry_id.to_owned())),
            "revert" => Some(Self::Revert(entry_id.to_owned())),
            _ => None,
        }
    }

    #[must_use]
    pub fn entry_id(&self) -> &str {
        match self {
            Self::View(id) | Self::Revert(id) => id,
        }
    }

    /// Run the action against `sync`.
    ///
    /// # Errors
    ///
    /// Propagates the already-surfaced [`ApiError`] from the REST call.
    pub async fn dispatch(&self, sync: &SectionSync) -> Result<(), ApiError> {
        match self {
            Self::View(id) => sync.view_history(id).await,
            Self::Revert(id) => sync.revert_history(id).await.map(|_| ()),
        }
    }
}

/// Rows for `entries`, in the order given.
#[must_use]
pub fn rows(entries: &[HistoryEntry]) -> Vec<HistoryRow> {
    entries
        .iter()
        .map(|entry| HistoryRow { id: entry.id.clone(), label: label(entry) })
        .collect()
}

#[must_use]
pub fn label(entry: &HistoryEntry) -> String {
    format!("{} by {}", format_timestamp(entry.timestamp), entry.author)
}

/// `2024-01-31 18:04:05 UTC` for a millisecond Unix timestamp. Values
/// outside the supported range fall back to the raw number.
#[must_use]
pub fn format_timestamp(timestamp_ms: i64) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC");
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_ms) * 1_000_000)
        .ok()
        .and_then(|at| at.format(format).ok())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
