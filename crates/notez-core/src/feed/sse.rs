//! Server-Sent-Events change feed.
//!
//! Connecting is a two step handshake: open `GET {realtime}/api/realtime`,
//! wait for the `PB_CONNECT` event carrying our client id, then register the
//! subscription topic with `POST {realtime}/api/realtime`. Every later event
//! on the open stream is a change payload for the subscribed topic.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header;
use serde::{Deserialize, Serialize};

use super::{parse_change_payload, ChangeFeed, ChangeStream, FeedScope};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::RecordId;
use crate::store::ensure_success;

const HANDSHAKE_EVENT: &str = "PB_CONNECT";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; partial lines are
/// buffered until their terminator arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk and return the events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line_buffer.push(byte);
                continue;
            }
            let raw = mem::take(&mut self.line_buffer);
            let line = String::from_utf8_lossy(&raw);
            let line: &str = &line;
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            id,
            data: mem::take(&mut self.data).join("\n"),
        })
    }
}

/// [`ChangeFeed`] over the realtime SSE endpoint.
#[derive(Debug, Clone)]
pub struct SseChangeFeed {
    realtime_url: String,
    scope: FeedScope,
    client: reqwest::Client,
}

impl SseChangeFeed {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| Error::Network(format!("Failed to construct HTTP client: {error}")))?;
        Ok(Self {
            realtime_url: config.realtime_url.clone(),
            scope: config.realtime_scope,
            client,
        })
    }

    /// Subscription topic for `record_id` under this feed's scope.
    pub fn topic(&self, record_id: &RecordId) -> String {
        match self.scope {
            FeedScope::Record => format!("notes/{record_id}"),
            FeedScope::Collection => "notes/*".to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/realtime", self.realtime_url)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakePayload {
    client_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeBody<'a> {
    client_id: &'a str,
    subscriptions: Vec<String>,
}

#[async_trait]
impl ChangeFeed for SseChangeFeed {
    async fn connect(&self, record_id: &RecordId) -> Result<ChangeStream> {
        let response = self
            .client
            .get(self.endpoint())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let mut bytes = Box::pin(response.bytes_stream());
        let mut decoder = SseDecoder::default();
        let mut pending = VecDeque::new();

        let client_id = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            await_handshake(&mut bytes, &mut decoder, &mut pending),
        )
        .await
        .map_err(|_| Error::Network("realtime handshake timed out".to_string()))??;

        let topic = self.topic(record_id);
        let response = self
            .client
            .post(self.endpoint())
            .json(&SubscribeBody {
                client_id: &client_id,
                subscriptions: vec![topic.clone()],
            })
            .send()
            .await?;
        ensure_success(response).await?;

        tracing::info!(record_id = %record_id, topic = %topic, "Realtime subscription registered");
        Ok(notification_stream(bytes, decoder, pending))
    }
}

async fn await_handshake<S, B, E>(
    bytes: &mut S,
    decoder: &mut SseDecoder,
    pending: &mut VecDeque<SseEvent>,
) -> Result<String>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    loop {
        let chunk = match bytes.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(error)) => return Err(Error::Network(error.to_string())),
            None => {
                return Err(Error::Network(
                    "realtime stream closed before handshake".to_string(),
                ))
            }
        };
        for event in decoder.push(chunk.as_ref()) {
            if event.event.as_deref() == Some(HANDSHAKE_EVENT) {
                let payload: HandshakePayload = serde_json::from_str(&event.data)?;
                return Ok(payload.client_id);
            }
            pending.push_back(event);
        }
    }
}

struct StreamState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    done: bool,
}

/// Turn a raw SSE byte stream into change notifications.
///
/// Malformed events are skipped. A transport error yields one `Err` and ends
/// the stream.
fn notification_stream<S, B, E>(
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
) -> ChangeStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let state = StreamState {
        bytes,
        decoder,
        pending,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            while let Some(event) = state.pending.pop_front() {
                if event.event.as_deref() == Some(HANDSHAKE_EVENT) {
                    continue;
                }
                match parse_change_payload(&event.data) {
                    Ok(notification) => return Some((Ok(notification), state)),
                    Err(error) => {
                        tracing::debug!(error = %error, "Skipping unrecognised realtime event");
                    }
                }
            }

            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(chunk.as_ref());
                    state.pending.extend(events);
                }
                Some(Err(error)) => {
                    state.done = true;
                    return Some((Err(Error::Network(error.to_string())), state));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
