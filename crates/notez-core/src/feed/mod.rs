//! Realtime change feeds.
//!
//! A [`ChangeFeed`] opens a stream of [`ChangeNotification`]s for one record.
//! Transports that cannot scope server-side deliver collection-wide events;
//! the listener always filters by record id, so both behave the same to the
//! sync engine. An `Err` item or the end of the stream means the transport
//! dropped and the caller decides whether to reconnect.

mod sse;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{parse_timestamp, ChangeNotification, RecordId};

pub use sse::{SseChangeFeed, SseDecoder, SseEvent};

/// Stream of change notifications from one connection.
pub type ChangeStream = BoxStream<'static, Result<ChangeNotification>>;

/// How a transport scopes its subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    /// Server delivers events for the subscribed record only.
    Record,
    /// Server delivers every event of the notes collection.
    Collection,
}

/// A source of change notifications
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a new connection for `record_id`.
    async fn connect(&self, record_id: &RecordId) -> Result<ChangeStream>;
}

/// Wire shapes of a change event.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChangePayload {
    Flat {
        #[serde(rename = "recordId")]
        record_id: String,
        #[serde(rename = "updatedAt")]
        updated_at: String,
    },
    Collection {
        #[serde(default)]
        action: Option<String>,
        record: RecordPayload,
    },
}

#[derive(Debug, Deserialize)]
struct RecordPayload {
    id: String,
    #[serde(default)]
    updated: Option<String>,
}

/// Parse one event payload into a notification.
///
/// Accepts the flat `{recordId, updatedAt}` form and the collection form
/// `{action, record: {id, updated}}`. Events without a server timestamp are
/// rejected: echo suppression and ordering both need the server clock.
pub fn parse_change_payload(data: &str) -> Result<ChangeNotification> {
    let payload: ChangePayload = serde_json::from_str(data)?;
    match payload {
        ChangePayload::Flat {
            record_id,
            updated_at,
        } => Ok(ChangeNotification {
            record_id: RecordId::new(record_id),
            updated_at: parse_timestamp(&updated_at)?,
        }),
        ChangePayload::Collection { action, record } => {
            let updated = record.updated.ok_or_else(|| {
                Error::InvalidPayload(format!(
                    "{} event for {} has no timestamp",
                    action.as_deref().unwrap_or("change"),
                    record.id
                ))
            })?;
            Ok(ChangeNotification {
                record_id: RecordId::new(record.id),
                updated_at: parse_timestamp(&updated)?,
            })
        }
    }
}
