//! In-process note store.
//!
//! Mirrors the server contract (versions, `NotFound`, version checks) and
//! publishes a change notification for every write, so it doubles as the
//! change feed. Timestamps follow the tokio clock, which makes paused-time
//! tests deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    Attachment, AttachmentMetadata, AttachmentStore, AttachmentUpload, NoteStore,
    UNCREATED_VERSION,
};
use crate::error::{Error, Result};
use crate::feed::{ChangeFeed, ChangeStream};
use crate::models::{ChangeNotification, NoteKey, NoteRecord, RecordId};

const FEED_CAPACITY: usize = 64;

/// A call observed by [`MemoryNoteStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Fetch {
        key: String,
    },
    Save {
        key: String,
        content: String,
        expected_version: Option<i64>,
    },
}

#[derive(Debug, Clone)]
enum FeedMessage {
    Change(ChangeNotification),
    Disconnect,
}

#[derive(Debug, Default)]
struct State {
    notes: HashMap<String, NoteRecord>,
    attachments: HashMap<String, Attachment>,
    calls: Vec<StoreCall>,
    skew_ms: i64,
    fail_fetch: Option<Error>,
    fail_save: Option<Error>,
    failing_connects: u32,
    connects: usize,
    fetch_delay: Duration,
    fetch_reply_delay: Duration,
    save_delay: Duration,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    changes: broadcast::Sender<FeedMessage>,
    started: Instant,
    epoch: DateTime<Utc>,
}

/// Shared in-memory [`NoteStore`], [`AttachmentStore`] and [`ChangeFeed`].
///
/// Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryNoteStore {
    inner: Arc<Inner>,
}

impl Default for MemoryNoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
                started: Instant::now(),
                epoch: Utc::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn now_locked(&self, state: &State) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.inner.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.inner.epoch + elapsed + chrono::Duration::milliseconds(state.skew_ms)
    }

    /// Move the store clock forward without waiting.
    pub fn advance_clock(&self, by: chrono::Duration) {
        self.state().skew_ms += by.num_milliseconds();
    }

    /// The next fetch fails with `error`.
    pub fn fail_next_fetch(&self, error: Error) {
        self.state().fail_fetch = Some(error);
    }

    /// The next save fails with `error` without writing.
    pub fn fail_next_save(&self, error: Error) {
        self.state().fail_save = Some(error);
    }

    /// The next `count` feed connections fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    /// Latency before a fetch reads the store.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state().fetch_delay = delay;
    }

    /// Latency between a fetch reading the store and its response.
    pub fn set_fetch_reply_delay(&self, delay: Duration) {
        self.state().fetch_reply_delay = delay;
    }

    /// Latency between a save being applied (and published) and its response.
    pub fn set_save_delay(&self, delay: Duration) {
        self.state().save_delay = delay;
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    /// Content and expected version of every save, in call order.
    pub fn saves(&self) -> Vec<(String, Option<i64>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                StoreCall::Save {
                    content,
                    expected_version,
                    ..
                } => Some((content.clone(), *expected_version)),
                StoreCall::Fetch { .. } => None,
            })
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, StoreCall::Fetch { .. }))
            .count()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Stored record for a raw key.
    pub fn record(&self, key: &str) -> Option<NoteRecord> {
        self.state().notes.get(key).cloned()
    }

    /// Write as another client would: unconditional, published on the feed.
    pub fn remote_write(&self, key: &str, content: &str) -> NoteRecord {
        let record = {
            let mut state = self.state();
            self.write_locked(&mut state, key, content)
        };
        self.publish_change(ChangeNotification {
            record_id: record.id.clone(),
            updated_at: record.updated_at,
        });
        record
    }

    /// Deliver a notification to every open feed connection.
    pub fn publish_change(&self, notification: ChangeNotification) {
        // No subscribers is fine
        let _ = self.inner.changes.send(FeedMessage::Change(notification));
    }

    /// Drop every open feed connection with a transport error.
    pub fn disconnect_feeds(&self) {
        let _ = self.inner.changes.send(FeedMessage::Disconnect);
    }

    fn write_locked(&self, state: &mut State, key: &str, content: &str) -> NoteRecord {
        let updated_at = self.now_locked(state);
        let record = match state.notes.get(key) {
            Some(existing) => NoteRecord {
                content: content.to_string(),
                version: existing.version + 1,
                updated_at,
                ..existing.clone()
            },
            None => NoteRecord {
                id: RecordId::new(Uuid::now_v7().to_string()),
                content: content.to_string(),
                version: 1,
                updated_at,
                has_attachment: false,
            },
        };
        state.notes.insert(key.to_string(), record.clone());
        record
    }
}

#[async_trait]
impl NoteStore for MemoryNoteStore {
    async fn fetch(&self, key: &NoteKey) -> Result<NoteRecord> {
        let delay = {
            let mut state = self.state();
            state.calls.push(StoreCall::Fetch {
                key: key.as_str().to_string(),
            });
            state.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (result, reply_delay) = {
            let mut state = self.state();
            let result = match state.fail_fetch.take() {
                Some(error) => Err(error),
                None => state
                    .notes
                    .get(key.as_str())
                    .cloned()
                    .ok_or_else(|| Error::NotFound("Note not found".to_string())),
            };
            (result, state.fetch_reply_delay)
        };
        if !reply_delay.is_zero() {
            tokio::time::sleep(reply_delay).await;
        }
        result
    }

    async fn save(
        &self,
        key: &NoteKey,
        content: &str,
        expected_version: Option<i64>,
    ) -> Result<NoteRecord> {
        let (record, delay) = {
            let mut state = self.state();
            state.calls.push(StoreCall::Save {
                key: key.as_str().to_string(),
                content: content.to_string(),
                expected_version,
            });
            if let Some(error) = state.fail_save.take() {
                return Err(error);
            }

            if let Some(expected) = expected_version {
                let current = state
                    .notes
                    .get(key.as_str())
                    .map_or(UNCREATED_VERSION, |record| record.version);
                if current != expected {
                    return Err(Error::VersionConflict {
                        current_version: Some(current),
                    });
                }
            }

            let record = self.write_locked(&mut state, key.as_str(), content);
            (record, state.save_delay)
        };

        self.publish_change(ChangeNotification {
            record_id: record.id.clone(),
            updated_at: record.updated_at,
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(record)
    }
}

#[async_trait]
impl AttachmentStore for MemoryNoteStore {
    async fn fetch_attachment(&self, key: &NoteKey) -> Result<Attachment> {
        self.state()
            .attachments
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| Error::NotFound("No image found".to_string()))
    }

    async fn upload_attachment(
        &self,
        key: &NoteKey,
        upload: AttachmentUpload,
    ) -> Result<AttachmentMetadata> {
        upload.validate()?;
        let mut state = self.state();
        let Some(note) = state.notes.get_mut(key.as_str()) else {
            return Err(Error::NotFound("Note not found".to_string()));
        };
        note.has_attachment = true;

        let metadata = AttachmentMetadata {
            file_name: upload.file_name,
            file_size: upload.bytes.len() as u64,
            content_type: upload.content_type.clone(),
            file_hash: None,
        };
        state.attachments.insert(
            key.as_str().to_string(),
            Attachment {
                bytes: upload.bytes,
                content_type: Some(upload.content_type),
            },
        );
        Ok(metadata)
    }

    async fn delete_attachment(&self, key: &NoteKey) -> Result<()> {
        let mut state = self.state();
        if state.attachments.remove(key.as_str()).is_none() {
            return Err(Error::NotFound("No image found".to_string()));
        }
        if let Some(note) = state.notes.get_mut(key.as_str()) {
            note.has_attachment = false;
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryNoteStore {
    async fn connect(&self, record_id: &RecordId) -> Result<ChangeStream> {
        {
            let mut state = self.state();
            state.connects += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(Error::Network("feed unavailable".to_string()));
            }
        }
        tracing::debug!(record_id = %record_id, "Memory feed connected");

        let receiver = self.inner.changes.subscribe();
        let stream = stream::unfold(Some(receiver), |receiver| async move {
            let mut receiver = receiver?;
            loop {
                match receiver.recv().await {
                    Ok(FeedMessage::Change(notification)) => {
                        return Some((Ok(notification), Some(receiver)));
                    }
                    Ok(FeedMessage::Disconnect) => {
                        return Some((Err(Error::Network("feed disconnected".to_string())), None));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory feed subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
