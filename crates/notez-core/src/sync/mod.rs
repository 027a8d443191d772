//! Client-side synchronization engine.
//!
//! A [`NoteSession`] owns the local edit state of one note at a time and
//! coordinates the debounced loader, the autosave controller, the realtime
//! listener and the conflict policy. Front-ends send actions and render
//! [`SessionSnapshot`]s.

mod autosave;
mod conflict;
mod listener;
mod loader;
mod schedule;
mod session;
mod state;

pub use autosave::AutosaveController;
pub use conflict::{
    check_manual_save, check_reload, ConflictState, ReloadConfirmation, RemoteDecision, SaveMode,
};
pub use listener::{classify, Classification, RealtimeStatus};
pub use loader::LoadPurpose;
pub use schedule::ScheduledTask;
pub use session::NoteSession;
pub use state::{LocalEditState, RecordSummary, RemoteUpdateFlag, SessionSnapshot};
