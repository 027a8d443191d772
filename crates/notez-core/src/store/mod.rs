//! Remote note store collaborators.
//!
//! The sync engine only depends on the [`NoteStore`] contract: fetch by key,
//! and upsert with an optional expected version. Omitting the version forces
//! last-write-wins; an expected version of `0` asserts that no record exists
//! yet.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{NoteKey, NoteRecord};

pub(crate) use http::ensure_success;
pub use http::HttpNoteStore;
pub use memory::{MemoryNoteStore, StoreCall};

/// Maximum attachment size accepted for upload (10 MiB).
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

/// Expected version used for the first save of a note that does not exist yet.
pub const UNCREATED_VERSION: i64 = 0;

/// Trait for remote note storage operations
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Fetch the note for `key`. Fails with [`Error::NotFound`] if none exists yet.
    async fn fetch(&self, key: &NoteKey) -> Result<NoteRecord>;

    /// Upsert the note for `key`.
    ///
    /// With `Some(version)` the write is rejected with
    /// [`Error::VersionConflict`] unless the stored version equals `version`.
    /// With `None` the write unconditionally overwrites.
    async fn save(
        &self,
        key: &NoteKey,
        content: &str,
        expected_version: Option<i64>,
    ) -> Result<NoteRecord>;
}

/// Downloaded attachment bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Attachment to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    /// Builds an upload, guessing the content type from the file extension.
    pub fn from_file_name(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let content_type = mime_guess::from_path(&file_name)
            .first_raw()
            .unwrap_or("image/jpeg")
            .to_string();
        Self {
            file_name,
            content_type,
            bytes,
        }
    }

    /// Rejects empty and oversized uploads before any network call.
    pub fn validate(&self) -> Result<()> {
        if self.bytes.is_empty() {
            return Err(Error::Validation("Attachment is empty".to_string()));
        }
        if self.bytes.len() > MAX_ATTACHMENT_BYTES {
            #[allow(clippy::cast_precision_loss)]
            let megabytes = self.bytes.len() as f64 / (1024.0 * 1024.0);
            return Err(Error::Validation(format!(
                "Image size is {megabytes:.1}MB. Maximum size is 10MB."
            )));
        }
        Ok(())
    }
}

/// Server-side description of a stored attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    #[serde(default)]
    pub file_hash: Option<String>,
}

/// Trait for the single image attached to a note
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn fetch_attachment(&self, key: &NoteKey) -> Result<Attachment>;

    async fn upload_attachment(
        &self,
        key: &NoteKey,
        upload: AttachmentUpload,
    ) -> Result<AttachmentMetadata>;

    async fn delete_attachment(&self, key: &NoteKey) -> Result<()>;
}
