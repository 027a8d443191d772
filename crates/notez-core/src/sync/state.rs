//! Session state and its observable snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::conflict::ConflictState;
use super::listener::RealtimeStatus;
use crate::models::{NoteRecord, RecordId};

/// Local editor content against the last server-confirmed content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalEditState {
    pub live_content: String,
    /// Last content known to match the server (just loaded or just saved).
    pub baseline_content: String,
    pub last_saved_at: Option<DateTime<Utc>>,
}

impl LocalEditState {
    pub fn has_unsaved_changes(&self) -> bool {
        self.live_content != self.baseline_content
    }

    /// Replace both live and baseline content, as after a load.
    pub fn apply_baseline(&mut self, content: &str) {
        content.clone_into(&mut self.live_content);
        content.clone_into(&mut self.baseline_content);
    }

    /// Record a successful save of `content`. Edits made since the save was
    /// issued stay unsaved.
    pub fn mark_saved(&mut self, content: &str, saved_at: DateTime<Utc>) {
        content.clone_into(&mut self.baseline_content);
        self.last_saved_at = Some(saved_at);
    }
}

/// Raised when a foreign write to the active record is observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteUpdateFlag {
    pub pending: bool,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl RemoteUpdateFlag {
    /// Mark an update pending, keeping the newest known timestamp.
    pub fn raise(&mut self, remote_updated_at: Option<DateTime<Utc>>) {
        self.pending = true;
        if remote_updated_at > self.remote_updated_at {
            self.remote_updated_at = remote_updated_at;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Server-side facts about the active note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub has_attachment: bool,
}

impl From<&NoteRecord> for RecordSummary {
    fn from(record: &NoteRecord) -> Self {
        Self {
            id: record.id.clone(),
            version: record.version,
            updated_at: record.updated_at,
            has_attachment: record.has_attachment,
        }
    }
}

/// Read-only view of a note session, published after every handled event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// A note is loaded (or known not to exist yet) and editable.
    pub note_ready: bool,
    pub is_loading: bool,
    pub is_saving: bool,
    pub has_unsaved_changes: bool,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub remote_update_available: bool,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub conflict_state: ConflictState,
    /// Ambient error banner text.
    pub error: Option<String>,
    pub realtime: RealtimeStatus,
    /// `None` until the note exists on the server.
    pub record: Option<RecordSummary>,
    pub content: String,
}
