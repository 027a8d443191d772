//! Conflict resolution policy.
//!
//! The coordinator state is derived, never stored: it follows from whether
//! the editor holds unsaved changes and whether a remote update is pending.
//!
//! | unsaved | remote pending | state                  | behaviour                          |
//! |---------|----------------|------------------------|------------------------------------|
//! | no      | no             | `Clean`                | nothing to save                    |
//! | yes     | no             | `Dirty`                | autosave armed                     |
//! | no      | yes            | `ConflictPendingClean` | reload automatically               |
//! | yes     | yes            | `ConflictPendingDirty` | autosave off, user picks a side    |

use serde::Serialize;

use crate::error::{Error, Result};
use crate::store::UNCREATED_VERSION;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    #[default]
    Clean,
    Dirty,
    ConflictPendingClean,
    ConflictPendingDirty,
}

impl ConflictState {
    pub const fn derive(has_unsaved_changes: bool, remote_pending: bool) -> Self {
        match (has_unsaved_changes, remote_pending) {
            (false, false) => Self::Clean,
            (true, false) => Self::Dirty,
            (false, true) => Self::ConflictPendingClean,
            (true, true) => Self::ConflictPendingDirty,
        }
    }

    pub const fn is_conflict(self) -> bool {
        matches!(
            self,
            Self::ConflictPendingClean | Self::ConflictPendingDirty
        )
    }

    /// Autosave may persist edits only outside a conflict.
    pub const fn autosave_allowed(self) -> bool {
        !self.is_conflict()
    }

    /// What to do about a raised remote flag.
    pub const fn remote_decision(self) -> RemoteDecision {
        match self {
            Self::ConflictPendingClean => RemoteDecision::AutoReload,
            Self::ConflictPendingDirty => RemoteDecision::AwaitUser,
            Self::Clean | Self::Dirty => RemoteDecision::Nothing,
        }
    }
}

/// Reaction to the current conflict state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDecision {
    Nothing,
    /// Nothing local to lose: fetch the latest record and clear the flag.
    AutoReload,
    /// Show "use theirs" / "keep mine".
    AwaitUser,
}

/// Whether the caller accepted losing unsaved local edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadConfirmation {
    Unconfirmed,
    DiscardLocalChanges,
}

/// How a save treats the server's version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Submit the known version; rejected if the server moved on.
    Checked,
    /// Last-write-wins. Only reachable through "keep mine".
    Forced,
}

impl SaveMode {
    /// Expected version sent with the save. A note that does not exist yet is
    /// checked against [`UNCREATED_VERSION`].
    pub fn expected_version(self, known_version: Option<i64>) -> Option<i64> {
        match self {
            Self::Checked => Some(known_version.unwrap_or(UNCREATED_VERSION)),
            Self::Forced => None,
        }
    }
}

/// A version-checked manual save cannot succeed while a remote update is
/// unresolved.
pub fn check_manual_save(state: ConflictState) -> Result<()> {
    if state.is_conflict() {
        return Err(Error::ConflictPending);
    }
    Ok(())
}

/// A reload discards unsaved edits, so it needs confirmation when there are any.
pub fn check_reload(has_unsaved_changes: bool, confirmation: ReloadConfirmation) -> Result<()> {
    if has_unsaved_changes && matches!(confirmation, ReloadConfirmation::Unconfirmed) {
        return Err(Error::UnsavedChanges);
    }
    Ok(())
}
