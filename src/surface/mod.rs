//! Delivery surfaces
//!
//! The transfer pipeline talks to a chat platform through exactly four
//! operations: send a status message, edit it, send a file, delete a message.

pub mod memory;
pub mod telegram;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::Result;

/// Chat (or user) identifier on the delivery surface
pub type ChatId = i64;

/// Opaque reference to a message that exists on the delivery surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i64,
}

/// What kind of media a file is, as far as the surface cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// Guesses the kind from a file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "mp4" | "mkv" | "webm" | "avi" | "mov" | "m4v" | "wmv" | "flv" | "mpg" | "mpeg"
            | "ts" | "3gp" => MediaKind::Video,
            "mp3" | "m4a" | "aac" | "flac" | "ogg" | "opus" | "wav" => MediaKind::Audio,
            _ => MediaKind::Document,
        }
    }

    /// Guesses the kind from a file path
    pub fn from_path(path: &std::path::Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(MediaKind::Document)
    }
}

/// How a file is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendStrategy {
    /// As playable inline media (video/audio message)
    InlineMedia,
    /// As a generic file attachment
    Document,
}

/// Called with the number of bytes that just left the process
pub type ByteCounter = Arc<dyn Fn(u64) + Send + Sync>;

/// A local file to be sent
#[derive(Clone)]
pub struct OutgoingFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub kind: MediaKind,
    pub caption: String,
    /// Called as bytes leave the process
    pub sent_bytes: Option<ByteCounter>,
}

impl std::fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("path", &self.path)
            .field("file_name", &self.file_name)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The chat platform as seen by the transfer pipeline
///
/// Implementations report a deleted or unknown message as
/// [`Error::MessageGone`](crate::Error::MessageGone), temporary outages as
/// [`Error::PlatformTransient`](crate::Error::PlatformTransient), and a file
/// the platform will not accept as
/// [`Error::UploadRejected`](crate::Error::UploadRejected).
#[async_trait]
pub trait DeliverySurface: Send + Sync {
    /// Sends a new text message
    async fn send_status(&self, chat: ChatId, text: &str) -> Result<MessageRef>;

    /// Replaces the text of an existing message
    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()>;

    /// Sends a local file using the given strategy
    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutgoingFile,
        strategy: SendStrategy,
    ) -> Result<MessageRef>;

    /// Deletes a message
    async fn delete_message(&self, message: &MessageRef) -> Result<()>;
}
