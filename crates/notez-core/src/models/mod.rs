//! Data models for notez

pub mod key_strength;
mod note;

pub use key_strength::{is_common_phrase, KeyStrength};
pub use note::{parse_timestamp, ChangeNotification, NoteKey, NoteRecord, RecordId, MIN_KEY_CHARS};
