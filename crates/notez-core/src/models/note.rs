//! Note model

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Minimum number of characters a note key must have.
pub const MIN_KEY_CHARS: usize = 3;

/// User-supplied title that maps to exactly one note server-side.
///
/// The key doubles as the encryption input on the server, so it is treated
/// as a secret: `Debug` is redacted and there is no `Display` impl.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NoteKey(String);

impl NoteKey {
    /// Validate a raw key. Keys shorter than [`MIN_KEY_CHARS`] are rejected.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.chars().count() < MIN_KEY_CHARS {
            return Err(Error::Validation(format!(
                "Title must be at least {MIN_KEY_CHARS} characters"
            )));
        }
        Ok(Self(raw))
    }

    /// Returns `true` when `raw` would pass [`NoteKey::parse`].
    pub fn is_valid(raw: &str) -> bool {
        raw.chars().count() >= MIN_KEY_CHARS
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NoteKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("NoteKey")
            .field(&"[REDACTED]")
            .finish()
    }
}

/// Server-assigned identifier of a note record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A note as stored on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    /// Server identifier
    pub id: RecordId,
    /// Decrypted note text
    pub content: String,
    /// Monotonic, server-assigned version
    pub version: i64,
    /// Last write timestamp (server clock)
    pub updated_at: DateTime<Utc>,
    /// Whether an image is attached
    pub has_attachment: bool,
}

/// A single entry from a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub record_id: RecordId,
    pub updated_at: DateTime<Utc>,
}

/// Parse a server timestamp.
///
/// Accepts RFC 3339 as well as the `2024-01-31 08:15:00.123Z` form some
/// backends emit (space separator, optional trailing `Z`).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = raw.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f")
        .map(|parsed| parsed.and_utc())
        .map_err(|error| Error::InvalidPayload(format!("invalid timestamp '{raw}': {error}")))
}
