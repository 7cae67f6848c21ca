//! Content uploader
//!
//! Relays a local artifact to the delivery surface, trying inline media first
//! and falling back to a generic document.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::error::{Error, Result};
use crate::core::progress::{Progress, ProgressCallback, ProgressMeter, ThrottlePolicy};
use crate::surface::{
    ByteCounter, ChatId, DeliverySurface, MediaKind, MessageRef, OutgoingFile, SendStrategy,
};

/// Limits that decide which strategies are attempted
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Inline media is only attempted below this size
    pub inline_threshold: u64,
    /// Documents above this size are not attempted at all
    pub document_ceiling: u64,
    /// Hard limit for the whole upload, every strategy and retry included
    pub time_ceiling: Duration,
    /// Extra attempts of the same strategy after a transient platform error
    pub transient_retries: u32,
    /// Base delay for backoff between those attempts
    pub retry_base_delay: Duration,
    pub throttle: ThrottlePolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            inline_threshold: 200 * 1024 * 1024,
            document_ceiling: 2 * 1024 * 1024 * 1024,
            time_ceiling: Duration::from_secs(30 * 60),
            transient_retries: 2,
            retry_base_delay: Duration::from_secs(2),
            throttle: ThrottlePolicy::default(),
        }
    }
}

/// What to send and how to label it
#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub chat: ChatId,
    pub path: &'a Path,
    pub file_name: String,
    pub size: u64,
    pub kind: MediaKind,
    pub caption: String,
}

/// Strategies worth trying for a file, in order
pub fn plan_strategies(size: u64, kind: MediaKind, options: &UploadOptions) -> Vec<SendStrategy> {
    let mut plan = Vec::with_capacity(2);
    if kind != MediaKind::Document && size < options.inline_threshold {
        plan.push(SendStrategy::InlineMedia);
    }
    if size <= options.document_ceiling {
        plan.push(SendStrategy::Document);
    }
    plan
}

/// Sends local artifacts through a [`DeliverySurface`]
pub struct Uploader {
    surface: Arc<dyn DeliverySurface>,
    options: UploadOptions,
}

impl Uploader {
    pub fn new(surface: Arc<dyn DeliverySurface>, options: UploadOptions) -> Self {
        Self { surface, options }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Sends the file with the first strategy that succeeds.
    ///
    /// Fails with [`Error::UploadRejected`] when every planned strategy failed
    /// or none applied, and with [`Error::Timeout`] when the time ceiling ran
    /// out first.
    pub async fn upload(
        &self,
        request: UploadRequest<'_>,
        progress: Option<ProgressCallback>,
    ) -> Result<MessageRef> {
        let ceiling = self.options.time_ceiling;
        match tokio::time::timeout(ceiling, self.upload_in_order(&request, progress)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Upload of {} did not finish within {ceiling:?}", request.file_name);
                Err(Error::Timeout(ceiling))
            }
        }
    }

    async fn upload_in_order(
        &self,
        request: &UploadRequest<'_>,
        progress: Option<ProgressCallback>,
    ) -> Result<MessageRef> {
        let plan = plan_strategies(request.size, request.kind, &self.options);
        if plan.is_empty() {
            return Err(Error::UploadRejected(format!(
                "{} ({} bytes) is above every send limit",
                request.file_name, request.size
            )));
        }

        let mut failures = Vec::new();
        for strategy in plan {
            match self.attempt(request, strategy, progress.clone()).await {
                Ok(message) => {
                    log::info!("Sent {} as {strategy:?}", request.file_name);
                    return Ok(message);
                }
                Err(e) => {
                    log::warn!("{strategy:?} send of {} failed: {e}", request.file_name);
                    failures.push(format!("{strategy:?}: {e}"));
                }
            }
        }

        Err(Error::UploadRejected(failures.join("; ")))
    }

    /// One strategy, including its transient retries
    async fn attempt(
        &self,
        request: &UploadRequest<'_>,
        strategy: SendStrategy,
        progress: Option<ProgressCallback>,
    ) -> Result<MessageRef> {
        let mut retry = 0;
        loop {
            let file = self.outgoing(request, progress.clone());
            let sent = self.surface.send_file(request.chat, &file, strategy).await;

            match sent {
                Err(e) if e.is_transient() && retry < self.options.transient_retries => {
                    retry += 1;
                    let delay = e
                        .retry_after()
                        .unwrap_or(self.options.retry_base_delay * (1 << (retry - 1)));
                    log::warn!("Platform busy (attempt {retry}): {e}. Retrying in {delay:?}...");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Builds the outgoing file with a fresh meter, so a retried attempt
    /// starts again at zero
    fn outgoing(&self, request: &UploadRequest<'_>, progress: Option<ProgressCallback>) -> OutgoingFile {
        let sent_bytes = progress.map(|callback| {
            callback(Progress::start(Some(request.size)));
            let meter = Mutex::new(ProgressMeter::new(Some(request.size), self.options.throttle));
            Arc::new(move |n: u64| {
                let snapshot = meter.lock().record(n);
                if let Some(snapshot) = snapshot {
                    callback(snapshot);
                }
            }) as ByteCounter
        });

        OutgoingFile {
            path: request.path.to_path_buf(),
            file_name: request.file_name.clone(),
            size: request.size,
            kind: request.kind,
            caption: request.caption.clone(),
            sent_bytes,
        }
    }
}
