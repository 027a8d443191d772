//! notez-core - Core library for notez
//!
//! This crate contains the shared models, remote store clients, and the
//! client-side synchronization engine (debounced autosave, realtime change
//! listening, and optimistic-concurrency conflict resolution) used by every
//! notez front-end.

pub mod config;
pub mod error;
pub mod feed;
pub mod models;
pub mod store;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{ChangeNotification, NoteKey, NoteRecord, RecordId};
pub use sync::{NoteSession, SessionSnapshot};
