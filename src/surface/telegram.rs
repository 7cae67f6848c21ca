//! Telegram Bot API delivery surface
//!
//! Talks to `{api_base}/bot{token}/{method}` with plain reqwest calls. Files
//! are streamed from disk into a multipart body, so a 2 GB document never
//! sits in memory.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::{ChatId, DeliverySurface, MediaKind, MessageRef, OutgoingFile, SendStrategy};
use crate::core::error::{Error, Result};

/// Public Bot API endpoint
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram truncates captions above this many characters
const MAX_CAPTION_CHARS: usize = 1024;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
    chat: ApiChat,
}

impl From<ApiMessage> for MessageRef {
    fn from(message: ApiMessage) -> Self {
        MessageRef {
            chat_id: message.chat.id,
            message_id: message.message_id,
        }
    }
}

/// What the call was about, for error mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Text,
    File,
}

/// Maps a Bot API failure onto the surface error contract
fn classify_failure(
    status: StatusCode,
    description: &str,
    retry_after: Option<u64>,
    call: CallKind,
) -> Error {
    let lowered = description.to_ascii_lowercase();

    if let Some(secs) = retry_after {
        return Error::RateLimited {
            retry_after: Duration::from_secs(secs),
            reason: format!("{status}: {description}"),
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Error::PlatformTransient(format!("{status}: {description}"));
    }
    if lowered.contains("message to edit not found")
        || lowered.contains("message to delete not found")
        || lowered.contains("message_id_invalid")
        || lowered.contains("message can't be deleted")
    {
        return Error::MessageGone;
    }
    match call {
        CallKind::File => Error::UploadRejected(format!("{status}: {description}")),
        CallKind::Text => Error::InvalidInput(format!("{status}: {description}")),
    }
}

fn method_for(strategy: SendStrategy, kind: MediaKind) -> (&'static str, &'static str) {
    match (strategy, kind) {
        (SendStrategy::InlineMedia, MediaKind::Video) => ("sendVideo", "video"),
        (SendStrategy::InlineMedia, MediaKind::Audio) => ("sendAudio", "audio"),
        _ => ("sendDocument", "document"),
    }
}

fn truncate_caption(caption: &str) -> String {
    caption.chars().take(MAX_CAPTION_CHARS).collect()
}

/// Delivery surface backed by the Telegram Bot HTTP API
#[derive(Clone)]
pub struct TelegramSurface {
    client: Client,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for TelegramSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSurface")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl TelegramSurface {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    /// Surface pointed at a self-hosted Bot API server (or a test double)
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|err| {
                log::warn!("Falling back to default HTTP client: {err}");
                Client::new()
            });
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        call: CallKind,
    ) -> Result<Option<T>> {
        let status = response.status();
        let body: ApiResponse<T> = response.json().await.map_err(|e| {
            Error::PlatformTransient(format!("unreadable Bot API response ({status}): {e}"))
        })?;

        if body.ok {
            return Ok(body.result);
        }

        let description = body.description.unwrap_or_default();
        let retry_after = body.parameters.and_then(|p| p.retry_after);
        Err(classify_failure(status, &description, retry_after, call))
    }

    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<Option<T>> {
        let response = self
            .client
            .post(self.endpoint(method))
            .timeout(Duration::from_secs(30))
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::PlatformTransient(format!("{method}: {e}")))?;
        Self::parse(response, CallKind::Text).await
    }
}

#[async_trait]
impl DeliverySurface for TelegramSurface {
    async fn send_status(&self, chat: ChatId, text: &str) -> Result<MessageRef> {
        let message: Option<ApiMessage> = self
            .call_json(
                "sendMessage",
                json!({ "chat_id": chat, "text": text, "disable_web_page_preview": true }),
            )
            .await?;
        message
            .map(MessageRef::from)
            .ok_or_else(|| Error::PlatformTransient("sendMessage returned no message".to_string()))
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()> {
        let result = self
            .call_json::<serde_json::Value>(
                "editMessageText",
                json!({
                    "chat_id": message.chat_id,
                    "message_id": message.message_id,
                    "text": text,
                    "disable_web_page_preview": true,
                }),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(Error::InvalidInput(reason)) if reason.contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutgoingFile,
        strategy: SendStrategy,
    ) -> Result<MessageRef> {
        let (method, field) = method_for(strategy, file.kind);

        let handle = tokio::fs::File::open(&file.path).await?;
        let counter = file.sent_bytes.clone();
        let stream = ReaderStream::new(handle).inspect_ok(move |chunk: &Bytes| {
            if let Some(ref sent) = counter {
                sent(chunk.len() as u64);
            }
        });

        let part = Part::stream_with_length(Body::wrap_stream(stream), file.size)
            .file_name(file.file_name.clone());
        let mut form = Form::new()
            .text("chat_id", chat.to_string())
            .part(field, part);
        if !file.caption.is_empty() {
            form = form.text("caption", truncate_caption(&file.caption));
        }
        if method == "sendVideo" {
            form = form.text("supports_streaming", "true");
        }

        log::debug!("{method} {} ({} bytes) to chat {chat}", file.file_name, file.size);
        let response = self
            .client
            .post(self.endpoint(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::PlatformTransient(format!("{method}: {e}")))?;

        let message: Option<ApiMessage> = Self::parse(response, CallKind::File).await?;
        message
            .map(MessageRef::from)
            .ok_or_else(|| Error::PlatformTransient(format!("{method} returned no message")))
    }

    async fn delete_message(&self, message: &MessageRef) -> Result<()> {
        self.call_json::<serde_json::Value>(
            "deleteMessage",
            json!({ "chat_id": message.chat_id, "message_id": message.message_id }),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_message(chat: i64, id: i64) -> serde_json::Value {
        json!({ "ok": true, "result": { "message_id": id, "chat": { "id": chat } } })
    }

    fn api_error(code: u16, description: &str) -> ResponseTemplate {
        ResponseTemplate::new(code).set_body_json(json!({
            "ok": false,
            "error_code": code,
            "description": description,
        }))
    }

    #[tokio::test]
    async fn test_send_status_returns_message_ref() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_string_contains("Resolving"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_message(42, 7)))
            .expect(1)
            .mount(&server)
            .await;

        let surface = TelegramSurface::with_api_base("TOKEN", server.uri());
        let message = surface.send_status(42, "Resolving...").await.unwrap();
        assert_eq!(
            message,
            MessageRef {
                chat_id: 42,
                message_id: 7
            }
        );
    }

    #[tokio::test]
    async fn test_edit_error_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/editMessageText"))
            .and(body_string_contains("\"message_id\":1"))
            .respond_with(api_error(400, "Bad Request: message is not modified"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/editMessageText"))
            .and(body_string_contains("\"message_id\":2"))
            .respond_with(api_error(400, "Bad Request: message to edit not found"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/editMessageText"))
            .and(body_string_contains("\"message_id\":3"))
            .respond_with(api_error(429, "Too Many Requests: retry after 5"))
            .mount(&server)
            .await;

        let surface = TelegramSurface::with_api_base("TOKEN", server.uri());
        let msg = |id| MessageRef {
            chat_id: 1,
            message_id: id,
        };

        assert!(surface.edit_message(&msg(1), "same").await.is_ok());
        assert!(matches!(
            surface.edit_message(&msg(2), "x").await,
            Err(Error::MessageGone)
        ));
        assert!(matches!(
            surface.edit_message(&msg(3), "x").await,
            Err(Error::PlatformTransient(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_after_is_carried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 12",
                "parameters": { "retry_after": 12 },
            })))
            .mount(&server)
            .await;

        let surface = TelegramSurface::with_api_base("TOKEN", server.uri());
        let err = surface.send_status(1, "hello").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[tokio::test]
    async fn test_delete_of_missing_message_is_gone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/deleteMessage"))
            .respond_with(api_error(400, "Bad Request: message to delete not found"))
            .mount(&server)
            .await;

        let surface = TelegramSurface::with_api_base("TOKEN", server.uri());
        let result = surface
            .delete_message(&MessageRef {
                chat_id: 1,
                message_id: 5,
            })
            .await;
        assert!(matches!(result, Err(Error::MessageGone)));
    }

    #[tokio::test]
    async fn test_send_video_streams_file_and_counts_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendVideo"))
            .and(body_string_contains("clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_message(9, 100)))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("clip.mp4");
        std::fs::write(&file_path, vec![b'v'; 20_000]).unwrap();

        let sent = Arc::new(AtomicU64::new(0));
        let sent_clone = Arc::clone(&sent);
        let file = OutgoingFile {
            path: file_path,
            file_name: "clip.mp4".to_string(),
            size: 20_000,
            kind: MediaKind::Video,
            caption: "Clip | 720p".to_string(),
            sent_bytes: Some(Arc::new(move |n| {
                sent_clone.fetch_add(n, Ordering::SeqCst);
            })),
        };

        let surface = TelegramSurface::with_api_base("TOKEN", server.uri());
        let message = surface
            .send_file(9, &file, SendStrategy::InlineMedia)
            .await
            .unwrap();

        assert_eq!(message.message_id, 100);
        assert_eq!(sent.load(Ordering::SeqCst), 20_000);
    }

    #[tokio::test]
    async fn test_rejected_file_maps_to_upload_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendDocument"))
            .respond_with(api_error(413, "Request Entity Too Large"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("doc.pdf");
        std::fs::write(&file_path, b"pdf").unwrap();
        let file = OutgoingFile {
            path: file_path,
            file_name: "doc.pdf".to_string(),
            size: 3,
            kind: MediaKind::Document,
            caption: String::new(),
            sent_bytes: None,
        };

        let surface = TelegramSurface::with_api_base("TOKEN", server.uri());
        let result = surface.send_file(1, &file, SendStrategy::Document).await;
        assert!(matches!(result, Err(Error::UploadRejected(_))));
    }

    #[test]
    fn test_method_selection() {
        assert_eq!(
            method_for(SendStrategy::InlineMedia, MediaKind::Video),
            ("sendVideo", "video")
        );
        assert_eq!(
            method_for(SendStrategy::InlineMedia, MediaKind::Audio),
            ("sendAudio", "audio")
        );
        assert_eq!(
            method_for(SendStrategy::Document, MediaKind::Video),
            ("sendDocument", "document")
        );
    }

    #[test]
    fn test_caption_is_truncated() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_caption(&long).chars().count(), MAX_CAPTION_CHARS);
    }
}
