use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use notez_core::config::{ClientConfig, SyncConfig};
use notez_core::feed::SseChangeFeed;
use notez_core::store::HttpNoteStore;
use notez_core::sync::{ConflictState, RealtimeStatus};
use notez_core::{NoteKey, NoteRecord, NoteSession, SessionSnapshot};
use serde::Serialize;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct NoteOutput {
    pub id: String,
    pub title: String,
    pub content: String,
    pub version: i64,
    pub updated_at: String,
    pub has_attachment: bool,
}

pub fn note_to_output(title: &NoteKey, record: &NoteRecord) -> NoteOutput {
    NoteOutput {
        id: record.id.to_string(),
        title: title.as_str().to_string(),
        content: record.content.clone(),
        version: record.version,
        updated_at: record.updated_at.to_rfc3339(),
        has_attachment: record.has_attachment,
    }
}

pub fn resolve_client_config(api_url: Option<&str>) -> Result<ClientConfig, CliError> {
    match api_url {
        Some(url) => Ok(ClientConfig::new(url)?),
        None => Ok(ClientConfig::from_env()?),
    }
}

pub fn open_store(api_url: Option<&str>) -> Result<HttpNoteStore, CliError> {
    let config = resolve_client_config(api_url)?;
    Ok(HttpNoteStore::new(&config)?)
}

pub fn parse_title(title: &str) -> Result<NoteKey, CliError> {
    Ok(NoteKey::parse(title)?)
}

/// Spawn a session for `title` and wait until its first load settles.
pub async fn open_session(title: &str, api_url: Option<&str>) -> Result<NoteSession, CliError> {
    let client = resolve_client_config(api_url)?;
    let store = HttpNoteStore::new(&client)?;
    let feed = SseChangeFeed::new(&client)?;
    let session = NoteSession::spawn(Arc::new(store), Arc::new(feed), SyncConfig::from_env()?);

    session.load(title).await?;
    let snapshot = session
        .wait_for(|snapshot| snapshot.note_ready || snapshot.error.is_some())
        .await?;
    if let Some(message) = snapshot.error {
        session.close().await.ok();
        return Err(CliError::LoadFailed(message));
    }

    Ok(session)
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

pub const fn realtime_label(status: RealtimeStatus) -> &'static str {
    match status {
        RealtimeStatus::Idle => "offline",
        RealtimeStatus::Connecting => "connecting",
        RealtimeStatus::Live => "live",
        RealtimeStatus::Degraded => "unavailable (reload manually)",
    }
}

/// One-line status for a snapshot, e.g. `v3 | saved 2024-01-31 08:15:00 | live`.
pub fn status_line(snapshot: &SessionSnapshot) -> String {
    let mut parts = Vec::new();
    match &snapshot.record {
        Some(record) => parts.push(format!("v{}", record.version)),
        None => parts.push("new note".to_string()),
    }
    if snapshot.is_saving {
        parts.push("saving...".to_string());
    } else if snapshot.has_unsaved_changes {
        parts.push("unsaved changes".to_string());
    } else if let Some(saved_at) = snapshot.last_saved_at {
        parts.push(format!("saved {}", format_timestamp(saved_at)));
    }
    if snapshot.conflict_state.is_conflict() {
        parts.push("remote changes".to_string());
    }
    parts.push(realtime_label(snapshot.realtime).to_string());
    parts.join(" | ")
}

/// Notices worth printing when a session moves from `previous` to `current`.
pub fn transition_notices(previous: &SessionSnapshot, current: &SessionSnapshot) -> Vec<String> {
    let mut notices = Vec::new();

    if current.realtime != previous.realtime {
        notices.push(format!("Realtime: {}", realtime_label(current.realtime)));
    }

    if current.conflict_state != previous.conflict_state {
        match current.conflict_state {
            ConflictState::ConflictPendingDirty => notices.push(
                "Note was changed elsewhere. Use :theirs to load it or :mine to overwrite it."
                    .to_string(),
            ),
            ConflictState::ConflictPendingClean => {
                notices.push("Note was changed elsewhere. Reloading...".to_string());
            }
            ConflictState::Clean | ConflictState::Dirty => {}
        }
    }

    let previous_version = previous.record.as_ref().map(|record| record.version);
    if let Some(record) = &current.record {
        if previous_version.is_some_and(|version| version < record.version)
            && !current.is_saving
            && current.last_saved_at != Some(record.updated_at)
        {
            notices.push(format!(
                "Updated to v{} ({})",
                record.version,
                format_timestamp(record.updated_at)
            ));
        }
    }

    if current.error != previous.error {
        if let Some(message) = &current.error {
            notices.push(format!("Error: {message}"));
        }
    }

    notices
}
