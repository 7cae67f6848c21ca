//! Transfer requests, their lifecycle states, and how states read in chat

use chrono::{DateTime, Utc};
use indicatif::HumanBytes;
use serde::{Deserialize, Serialize};

use crate::core::error::FailureKind;
use crate::core::progress::Progress;
use crate::surface::{ChatId, MessageRef};

/// Dedup key: one live transfer per requester, item and variant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferKey {
    pub requester: ChatId,
    pub content_id: String,
    pub variant: String,
}

/// A user's request to receive one variant of one catalog item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Requesting user; also the chat the file is delivered to
    pub requester: ChatId,
    pub content_id: String,
    /// Quality or season/episode label, e.g. `720p` or `S01E03`
    pub variant: String,
    /// URL as the catalog lists it, before any rewrite
    pub source_url: String,
    pub title: String,
    /// Size the catalog claims, if it claims one
    pub size_hint: Option<u64>,
    /// Opaque catalog lines appended to the caption
    #[serde(default)]
    pub caption_extra: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

impl TransferRequest {
    pub fn new(
        requester: ChatId,
        content_id: impl Into<String>,
        variant: impl Into<String>,
        source_url: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            requester,
            content_id: content_id.into(),
            variant: variant.into(),
            source_url: source_url.into(),
            title: title.into(),
            size_hint: None,
            caption_extra: Vec::new(),
            requested_at: Utc::now(),
        }
    }

    pub fn with_size_hint(mut self, size_hint: Option<u64>) -> Self {
        self.size_hint = size_hint;
        self
    }

    pub fn with_caption_extra(mut self, lines: Vec<String>) -> Self {
        self.caption_extra = lines;
        self
    }

    pub fn key(&self) -> TransferKey {
        TransferKey {
            requester: self.requester,
            content_id: self.content_id.clone(),
            variant: self.variant.clone(),
        }
    }

    /// Caption attached to the delivered file
    pub fn caption(&self, size: u64) -> String {
        let mut caption = format!("{} | {}\n{}", self.title, self.variant, HumanBytes(size));
        for line in &self.caption_extra {
            caption.push('\n');
            caption.push_str(line);
        }
        caption
    }

    fn label(&self) -> String {
        format!("{} ({})", self.title, self.variant)
    }
}

/// Where a transfer is in its lifecycle
///
/// `Resolving -> Downloading | FallbackLink`, `Downloading -> Uploading |
/// Failed`, `Uploading -> Delivered | Failed`. The last three are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Resolving,
    Downloading(Progress),
    Uploading(Progress),
    Delivered {
        message: MessageRef,
        expires_at: DateTime<Utc>,
    },
    Failed {
        reason: FailureKind,
        raw_url: String,
    },
    /// The URL cannot be streamed; the user gets the link instead
    FallbackLink { raw_url: String },
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Delivered { .. }
                | TransferState::Failed { .. }
                | TransferState::FallbackLink { .. }
        )
    }

    /// Stage name for logs
    pub fn name(&self) -> &'static str {
        match self {
            TransferState::Resolving => "resolving",
            TransferState::Downloading(_) => "downloading",
            TransferState::Uploading(_) => "uploading",
            TransferState::Delivered { .. } => "delivered",
            TransferState::Failed { .. } => "failed",
            TransferState::FallbackLink { .. } => "fallback-link",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_advance_to(&self, next: &TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Resolving, Downloading(_) | FallbackLink { .. }) => true,
            (Downloading(_), Downloading(_) | Uploading(_) | Failed { .. }) => true,
            (Uploading(_), Uploading(_) | Delivered { .. } | Failed { .. }) => true,
            _ => false,
        }
    }
}

fn render_progress(verb: &str, request: &TransferRequest, progress: &Progress) -> String {
    let amount = match progress.total {
        Some(total) => format!("{} of {}", HumanBytes(progress.bytes), HumanBytes(total)),
        None => HumanBytes(progress.bytes).to_string(),
    };
    let percent = progress
        .percent()
        .map(|p| format!("{p}% | "))
        .unwrap_or_default();
    format!(
        "{verb} {}\n{percent}{amount} | {}/s",
        request.label(),
        HumanBytes(progress.bytes_per_sec as u64)
    )
}

/// Chat text for a transfer in `state`
pub fn render_state(request: &TransferRequest, state: &TransferState) -> String {
    match state {
        TransferState::Resolving => format!("Preparing {}...", request.label()),
        TransferState::Downloading(progress) => render_progress("Downloading", request, progress),
        TransferState::Uploading(progress) => render_progress("Uploading", request, progress),
        TransferState::Delivered { expires_at, .. } => format!(
            "Sent {}.\nIt will be removed at {} UTC, save it before then.",
            request.label(),
            expires_at.format("%H:%M")
        ),
        TransferState::Failed { reason, raw_url } => format!(
            "Could not send {}: {}.\nDownload it directly: {raw_url}",
            request.label(),
            reason.describe()
        ),
        TransferState::FallbackLink { raw_url } => format!(
            "{} cannot be sent in chat.\nDownload it directly: {raw_url}",
            request.label()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransferRequest {
        TransferRequest::new(7, "42", "720p", "https://pixeldrain.com/u/abc", "Big Movie")
    }

    #[test]
    fn test_key_identifies_requester_item_and_variant() {
        let a = request();
        let mut b = request();
        assert_eq!(a.key(), b.key());
        b.variant = "480p".to_string();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_state_machine_edges() {
        let downloading = TransferState::Downloading(Progress::start(None));
        let fallback = TransferState::FallbackLink {
            raw_url: "u".to_string(),
        };
        let failed = TransferState::Failed {
            reason: FailureKind::TooLarge,
            raw_url: "u".to_string(),
        };

        assert!(TransferState::Resolving.can_advance_to(&downloading));
        assert!(TransferState::Resolving.can_advance_to(&fallback));
        assert!(downloading.can_advance_to(&failed));
        assert!(!downloading.can_advance_to(&fallback));
        assert!(!failed.can_advance_to(&downloading));
        assert!(failed.is_terminal() && fallback.is_terminal());
        assert!(!downloading.is_terminal());
    }

    #[test]
    fn test_terminal_texts_carry_raw_url() {
        let request = request();
        let failed = render_state(
            &request,
            &TransferState::Failed {
                reason: FailureKind::TooLarge,
                raw_url: request.source_url.clone(),
            },
        );
        assert!(failed.contains("https://pixeldrain.com/u/abc"));
        assert!(failed.contains("too large"));

        let fallback = render_state(
            &request,
            &TransferState::FallbackLink {
                raw_url: request.source_url.clone(),
            },
        );
        assert!(fallback.contains("https://pixeldrain.com/u/abc"));
    }

    #[test]
    fn test_progress_text() {
        let text = render_state(
            &request(),
            &TransferState::Downloading(Progress {
                bytes: 512 * 1024,
                total: Some(1024 * 1024),
                bytes_per_sec: 1024.0,
            }),
        );
        assert!(text.starts_with("Downloading Big Movie (720p)"));
        assert!(text.contains("50%"));
        assert!(text.contains("512.00 KiB of 1.00 MiB"));
    }

    #[test]
    fn test_caption_includes_extra_lines() {
        let caption = request()
            .with_caption_extra(vec!["MKV | 2h 10m".to_string()])
            .caption(1024);
        assert_eq!(caption, "Big Movie | 720p\n1.00 KiB\nMKV | 2h 10m");
    }
}
