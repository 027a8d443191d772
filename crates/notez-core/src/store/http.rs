//! HTTP client for the notes API.
//!
//! The note key travels in the `X-Passphrase` header; the server derives the
//! record and the encryption key from it.

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};

use super::{Attachment, AttachmentMetadata, AttachmentStore, AttachmentUpload, NoteStore};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{parse_timestamp, NoteKey, NoteRecord, RecordId};
use crate::util::compact_text;

const PASSPHRASE_HEADER: &str = "X-Passphrase";

/// [`NoteStore`] backed by the notes REST API.
#[derive(Debug, Clone)]
pub struct HttpNoteStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpNoteStore {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| Error::Network(format!("Failed to construct HTTP client: {error}")))?;
        Ok(Self {
            base_url: config.api_base_url.clone(),
            client,
        })
    }

    /// Returns the base URL this client was configured with.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn notes_url(&self) -> String {
        format!("{}/notes", self.base_url)
    }

    fn image_url(&self) -> String {
        format!("{}/notes/image", self.base_url)
    }
}

#[async_trait]
impl NoteStore for HttpNoteStore {
    async fn fetch(&self, key: &NoteKey) -> Result<NoteRecord> {
        let response = self
            .client
            .get(self.notes_url())
            .header(PASSPHRASE_HEADER, key.as_str())
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let payload: NoteResponse = read_json(response).await?;
        payload.try_into()
    }

    async fn save(
        &self,
        key: &NoteKey,
        content: &str,
        expected_version: Option<i64>,
    ) -> Result<NoteRecord> {
        let body = SaveNoteBody {
            message: content,
            version: expected_version,
        };
        let response = self
            .client
            .put(self.notes_url())
            .header(PASSPHRASE_HEADER, key.as_str())
            .header(header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let payload: NoteResponse = read_json(response).await?;
        tracing::debug!(
            record_id = %payload.id,
            version = payload.version,
            forced = expected_version.is_none(),
            "Note saved"
        );
        payload.try_into()
    }
}

#[async_trait]
impl AttachmentStore for HttpNoteStore {
    async fn fetch_attachment(&self, key: &NoteKey) -> Result<Attachment> {
        let response = self
            .client
            .get(self.image_url())
            .header(PASSPHRASE_HEADER, key.as_str())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound("No image found".to_string()));
        }
        let response = ensure_success(response).await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let bytes = response.bytes().await?;
        Ok(Attachment {
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    async fn upload_attachment(
        &self,
        key: &NoteKey,
        upload: AttachmentUpload,
    ) -> Result<AttachmentMetadata> {
        upload.validate()?;

        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(&upload.content_type)
            .map_err(|error| Error::Validation(format!("Invalid content type: {error}")))?;
        let form = reqwest::multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(self.image_url())
            .header(PASSPHRASE_HEADER, key.as_str())
            .multipart(form)
            .send()
            .await?;

        read_json(response).await
    }

    async fn delete_attachment(&self, key: &NoteKey) -> Result<()> {
        let response = self
            .client
            .delete(self.image_url())
            .header(PASSPHRASE_HEADER, key.as_str())
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SaveNoteBody<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteResponse {
    id: String,
    message: String,
    #[serde(default)]
    has_image: bool,
    version: i64,
    updated: String,
}

impl TryFrom<NoteResponse> for NoteRecord {
    type Error = Error;

    fn try_from(value: NoteResponse) -> Result<Self> {
        Ok(Self {
            id: RecordId::new(value.id),
            content: value.message,
            version: value.version,
            updated_at: parse_timestamp(&value.updated)?,
            has_attachment: value.has_image,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: Option<String>,
    current_version: Option<i64>,
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let response = ensure_success(response).await?;
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(Error::from)
}

pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
}

fn classify_failure(status: StatusCode, body: &str) -> Error {
    let parsed = serde_json::from_str::<ErrorResponse>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|payload| payload.error.clone())
        .map_or_else(|| compact_text(body), |message| compact_text(&message));

    match status {
        StatusCode::NOT_FOUND => Error::NotFound(if message.is_empty() {
            "Note not found".to_string()
        } else {
            message
        }),
        StatusCode::CONFLICT => Error::VersionConflict {
            current_version: parsed.and_then(|payload| payload.current_version),
        },
        _ => Error::Api {
            status: status.as_u16(),
            message: if message.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                message
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    use super::*;

    const NOTE_BODY: &str = r#"{
        "id": "rec123",
        "message": "hello",
        "hasImage": true,
        "version": 4,
        "created": "2024-05-01 10:00:00.000Z",
        "updated": "2024-05-01 10:20:30.250Z"
    }"#;

    /// Serves one canned response and hands back the raw request it received.
    async fn spawn_one_shot_server(status_line: &str, body: &str) -> (String, oneshot::Receiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let address = listener.local_addr().expect("local address");
        let body = body.to_string();
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let (request_tx, request_rx) = oneshot::channel();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let request = read_request(&mut socket).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = request_tx.send(request);
            }
        });

        (format!("http://{address}/api/secretnotes"), request_rx)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buffer = [0_u8; 4096];
        loop {
            let Ok(read) = socket.read(&mut buffer).await else {
                break;
            };
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&buffer[..read]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn store_for(base_url: &str) -> HttpNoteStore {
        let mut config = ClientConfig::new(base_url).expect("config");
        config.request_timeout = Duration::from_secs(5);
        HttpNoteStore::new(&config).expect("store")
    }

    #[tokio::test]
    async fn fetch_parses_note_and_sends_key_header() {
        let (url, request) = spawn_one_shot_server("200 OK", NOTE_BODY).await;
        let store = store_for(&url);
        let key = NoteKey::parse("abc").unwrap();

        let record = store.fetch(&key).await.expect("fetch should succeed");
        assert_eq!(record.id, RecordId::new("rec123"));
        assert_eq!(record.content, "hello");
        assert_eq!(record.version, 4);
        assert!(record.has_attachment);

        let request = request.await.expect("request captured").to_ascii_lowercase();
        assert!(request.starts_with("get /api/secretnotes/notes"));
        assert!(request.contains("x-passphrase: abc"));
    }

    #[tokio::test]
    async fn fetch_maps_404_to_not_found() {
        let (url, _request) =
            spawn_one_shot_server("404 Not Found", r#"{"error":"Note not found"}"#).await;
        let store = store_for(&url);
        let key = NoteKey::parse("abc").unwrap();

        let error = store.fetch(&key).await.expect_err("fetch should fail");
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn save_sends_expected_version() {
        let (url, request) = spawn_one_shot_server("200 OK", NOTE_BODY).await;
        let store = store_for(&url);
        let key = NoteKey::parse("abc").unwrap();

        store.save(&key, "hello", Some(3)).await.expect("save");

        let request = request.await.expect("request captured");
        assert!(request.starts_with("PUT /api/secretnotes/notes"));
        assert!(request.contains(r#""version":3"#));
        assert!(request.contains(r#""message":"hello""#));
    }

    #[tokio::test]
    async fn forced_save_omits_version() {
        let (url, request) = spawn_one_shot_server("200 OK", NOTE_BODY).await;
        let store = store_for(&url);
        let key = NoteKey::parse("abc").unwrap();

        store.save(&key, "hello", None).await.expect("save");

        let request = request.await.expect("request captured");
        assert!(!request.contains("\"version\""));
    }

    #[tokio::test]
    async fn save_maps_409_to_version_conflict() {
        let (url, _request) = spawn_one_shot_server(
            "409 Conflict",
            r#"{"error":"Version conflict","currentVersion":9}"#,
        )
        .await;
        let store = store_for(&url);
        let key = NoteKey::parse("abc").unwrap();

        let error = store.save(&key, "hello", Some(3)).await.unwrap_err();
        assert!(matches!(
            error,
            Error::VersionConflict {
                current_version: Some(9)
            }
        ));
    }

    #[tokio::test]
    async fn server_errors_surface_status() {
        let (url, _request) =
            spawn_one_shot_server("500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let store = store_for(&url);
        let key = NoteKey::parse("abc").unwrap();

        let error = store.fetch(&key).await.unwrap_err();
        match error {
            Error::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let store = store_for(&format!("http://{address}"));
        let key = NoteKey::parse("abc").unwrap();
        let error = store.fetch(&key).await.unwrap_err();
        assert!(matches!(error, Error::Network(_)));
    }

    #[tokio::test]
    async fn upload_rejects_oversized_before_network() {
        // Nothing listens on this port; validation must fail first.
        let store = store_for("http://127.0.0.1:9");
        let key = NoteKey::parse("abc").unwrap();
        let upload = AttachmentUpload {
            file_name: "big.jpg".into(),
            content_type: "image/jpeg".into(),
            bytes: vec![0; crate::store::MAX_ATTACHMENT_BYTES + 1],
        };
        let error = store.upload_attachment(&key, upload).await.unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
    }

    #[test]
    fn classify_failure_falls_back_to_body_text() {
        let error = classify_failure(StatusCode::BAD_GATEWAY, "  upstream timed out  ");
        match error {
            Error::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "upstream timed out");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
