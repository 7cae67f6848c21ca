//! Transfer coordinator
//!
//! The single entry point of the pipeline. Every request runs as its own
//! tracked task that walks the transfer state machine to a terminal state,
//! whether or not anybody is still waiting for it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use crate::config::RelayConfig;
use crate::core::downloader::Downloader;
use crate::core::error::{FailureKind, Result};
use crate::core::expiry::ExpiryScheduler;
use crate::core::progress::Progress;
use crate::core::source::{artifact_filename, sanitize_component, SourceResolver, DEFAULT_EXTENSION};
use crate::core::status::{StatusReporter, StatusUpdater};
use crate::core::stream::DownloadOptions;
use crate::core::transfer::{render_state, TransferKey, TransferRequest, TransferState};
use crate::core::uploader::{UploadRequest, Uploader};
use crate::surface::{DeliverySurface, MediaKind};

/// Live transfers by key
///
/// Only [`Coordinator::begin_transfer`] inserts and only the task that owns
/// the key clears it. The lock is never held across an await.
#[derive(Default)]
pub struct TransferStore {
    live: Mutex<HashMap<TransferKey, watch::Receiver<TransferState>>>,
}

impl TransferStore {
    pub fn get(&self, key: &TransferKey) -> Option<watch::Receiver<TransferState>> {
        self.live.lock().get(key).cloned()
    }

    /// Inserts unless the key is live; returns the live entry otherwise
    pub fn insert(
        &self,
        key: TransferKey,
        state: watch::Receiver<TransferState>,
    ) -> std::result::Result<(), watch::Receiver<TransferState>> {
        let mut live = self.live.lock();
        if let Some(existing) = live.get(&key) {
            return Err(existing.clone());
        }
        live.insert(key, state);
        Ok(())
    }

    pub fn clear(&self, key: &TransferKey) {
        self.live.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A caller's view of one transfer
#[derive(Debug, Clone)]
pub struct TransferHandle {
    key: TransferKey,
    state: watch::Receiver<TransferState>,
    attached: bool,
}

impl TransferHandle {
    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    /// True when this call joined a transfer that was already running
    pub fn attached(&self) -> bool {
        self.attached
    }

    /// Latest published state
    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    /// Waits for the terminal state
    pub async fn wait(mut self) -> TransferState {
        let waited = match self.state.wait_for(TransferState::is_terminal).await {
            Ok(state) => Some(state.clone()),
            Err(_) => None,
        };
        // the task always publishes a terminal state before it ends
        waited.unwrap_or_else(|| self.state.borrow().clone())
    }
}

/// Owns a temp file for the lifetime of one transfer and removes it when
/// dropped, whichever way the transfer ends
pub struct ScopedArtifact {
    path: PathBuf,
}

impl ScopedArtifact {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed artifact {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove artifact {}: {e}", self.path.display()),
        }
    }
}

/// Publishes state changes to waiting handles and the status message
struct Publisher {
    state: watch::Sender<TransferState>,
    status: StatusUpdater,
    request: Arc<TransferRequest>,
}

impl Publisher {
    fn publish(&self, next: TransferState) {
        let (allowed, regressed) = {
            let current = self.state.borrow();
            let regressed = match (&*current, &next) {
                (TransferState::Downloading(a), TransferState::Downloading(b))
                | (TransferState::Uploading(a), TransferState::Uploading(b)) => b.bytes < a.bytes,
                _ => false,
            };
            (current.can_advance_to(&next), regressed)
        };
        // a retried upload restarts at zero; keep the reported count monotonic
        if regressed {
            return;
        }
        if !allowed {
            log::warn!(
                "Ignoring {} -> {} for {:?}",
                self.state.borrow().name(),
                next.name(),
                self.request.key()
            );
            return;
        }
        if !next.is_terminal() {
            self.status.update(render_state(&self.request, &next));
        }
        self.state.send_replace(next);
    }
}

struct Inner {
    resolver: SourceResolver,
    downloader: Downloader,
    uploader: Uploader,
    status: StatusReporter,
    expiry: ExpiryScheduler,
    store: TransferStore,
    tracker: TaskTracker,
    config: RelayConfig,
}

/// Runs transfer requests through resolve, download, upload and expiry
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Coordinator with the built-in host rules
    pub fn new(config: RelayConfig, surface: Arc<dyn DeliverySurface>) -> Result<Self> {
        Self::with_resolver(config, surface, SourceResolver::new())
    }

    /// Creates the temp directory and starts the sweeper
    pub fn with_resolver(
        config: RelayConfig,
        surface: Arc<dyn DeliverySurface>,
        resolver: SourceResolver,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.temp_dir)?;

        let expiry = ExpiryScheduler::new(
            Arc::clone(&surface),
            config.temp_dir.clone(),
            config.staleness_threshold,
        );
        expiry.spawn_sweeper(config.sweep_interval);

        log::info!("Coordinator ready, temp storage at {}", config.temp_dir.display());
        Ok(Self {
            inner: Arc::new(Inner {
                resolver,
                downloader: Downloader::new(),
                uploader: Uploader::new(Arc::clone(&surface), config.upload_options()),
                status: StatusReporter::new(surface, config.status_edit_interval),
                expiry,
                store: TransferStore::default(),
                tracker: TaskTracker::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn expiry(&self) -> &ExpiryScheduler {
        &self.inner.expiry
    }

    /// Number of transfers that have not reached a terminal state
    pub fn in_flight(&self) -> usize {
        self.inner.store.len()
    }

    /// Starts a transfer, or attaches to the live one with the same key
    pub fn begin_transfer(&self, request: TransferRequest) -> TransferHandle {
        let key = request.key();
        let (tx, rx) = watch::channel(TransferState::Resolving);

        if let Err(existing) = self.inner.store.insert(key.clone(), rx.clone()) {
            log::info!("Attaching to running transfer {key:?}");
            return TransferHandle {
                key,
                state: existing,
                attached: true,
            };
        }

        log::info!(
            "Transfer {:?} of {} requested by {}",
            request.variant,
            request.content_id,
            request.requester
        );
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(run_transfer(inner, request, tx));

        TransferHandle {
            key,
            state: rx,
            attached: false,
        }
    }

    /// Waits for every transfer to finish, then settles expiry
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.expiry.shutdown(self.inner.config.shutdown_policy).await;
    }
}

async fn run_transfer(inner: Arc<Inner>, request: TransferRequest, tx: watch::Sender<TransferState>) {
    let request = Arc::new(request);
    let key = request.key();

    let status = inner
        .status
        .open(request.requester, &render_state(&request, &TransferState::Resolving))
        .await;
    let publisher = Arc::new(Publisher {
        state: tx,
        status: status.updater(),
        request: Arc::clone(&request),
    });

    let outcome = AssertUnwindSafe(drive(&inner, &request, &publisher))
        .catch_unwind()
        .await;

    let terminal = match outcome {
        Ok(state) => state,
        Err(_) => {
            log::error!("Transfer {key:?} panicked");
            TransferState::Failed {
                reason: FailureKind::PlatformTransient,
                raw_url: request.source_url.clone(),
            }
        }
    };

    log::info!("Transfer {key:?} ended {}", terminal.name());
    status.finish(render_state(&request, &terminal)).await;
    // a panic may have left the state anywhere, terminal always lands
    publisher.state.send_replace(terminal);
    inner.store.clear(&key);
}

/// Walks one request to a terminal state
async fn drive(inner: &Inner, request: &TransferRequest, publisher: &Arc<Publisher>) -> TransferState {
    let raw_url = request.source_url.clone();
    let failed = |reason: FailureKind| TransferState::Failed {
        reason,
        raw_url: raw_url.clone(),
    };

    let resolved = inner.resolver.resolve(&raw_url);
    if !inner.resolver.classify_streamable(&resolved) {
        log::info!("{raw_url} is not streamable, offering the link");
        return TransferState::FallbackLink {
            raw_url: raw_url.clone(),
        };
    }

    publisher.publish(TransferState::Downloading(Progress::start(request.size_hint)));

    let ceiling = inner.config.size_ceiling;
    if let Some(hint) = request.size_hint.filter(|hint| *hint > ceiling) {
        log::info!("{raw_url} claims {hint} bytes, above the {ceiling} byte ceiling");
        return failed(FailureKind::TooLarge);
    }

    let artifact = ScopedArtifact::new(inner.config.temp_dir.join(artifact_filename(
        &request.title,
        &request.variant,
        &request.content_id,
        &resolved,
    )));

    let download_publisher = Arc::clone(publisher);
    let options = DownloadOptions {
        progress: Some(Arc::new(move |p: Progress| {
            download_publisher.publish(TransferState::Downloading(p))
        })),
        ..inner.config.download_options()
    };

    let size = match inner.downloader.download(&resolved, artifact.path(), &options).await {
        Ok(size) => size,
        Err(e) => return failed(e.kind()),
    };

    publisher.publish(TransferState::Uploading(Progress::start(Some(size))));

    let upload_publisher = Arc::clone(publisher);
    let upload = UploadRequest {
        chat: request.requester,
        path: artifact.path(),
        file_name: display_file_name(request, artifact.path()),
        size,
        kind: MediaKind::from_path(artifact.path()),
        caption: request.caption(size),
    };
    let sent = inner
        .uploader
        .upload(
            upload,
            Some(Arc::new(move |p: Progress| {
                upload_publisher.publish(TransferState::Uploading(p))
            })),
        )
        .await;

    match sent {
        Ok(message) => {
            let expires_at = inner.expiry.schedule_expiry(message, inner.config.expiry_ttl);
            TransferState::Delivered { message, expires_at }
        }
        Err(e) => failed(e.kind()),
    }
}

/// File name shown to the recipient, without the uniqueness suffix
fn display_file_name(request: &TransferRequest, artifact: &Path) -> String {
    let ext = artifact
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or(DEFAULT_EXTENSION);
    format!(
        "{}_{}.{ext}",
        sanitize_component(&request.title, 48),
        sanitize_component(&request.variant, 16)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_contract() {
        let store = TransferStore::default();
        let key = TransferKey {
            requester: 1,
            content_id: "9".to_string(),
            variant: "720p".to_string(),
        };
        let (_tx, rx) = watch::channel(TransferState::Resolving);

        assert!(store.get(&key).is_none());
        assert!(store.insert(key.clone(), rx.clone()).is_ok());
        assert!(store.insert(key.clone(), rx).is_err());
        assert!(store.get(&key).is_some());
        store.clear(&key);
        assert!(store.is_empty());
    }

    fn handle_for(state: watch::Receiver<TransferState>) -> TransferHandle {
        TransferHandle {
            key: TransferKey {
                requester: 1,
                content_id: "9".to_string(),
                variant: "720p".to_string(),
            },
            state,
            attached: false,
        }
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_state() {
        let (tx, rx) = watch::channel(TransferState::Resolving);
        let handle = handle_for(rx);
        let waiter = tokio::spawn(handle.wait());

        tx.send_replace(TransferState::FallbackLink {
            raw_url: "https://h/watch/1".to_string(),
        });
        let state = waiter.await.unwrap();
        assert_eq!(state.name(), "fallback-link");
    }

    #[tokio::test]
    async fn test_wait_after_sender_dropped_returns_last_state() {
        let (tx, rx) = watch::channel(TransferState::Resolving);
        drop(tx);
        let state = handle_for(rx).wait().await;
        assert_eq!(state, TransferState::Resolving);
    }

    #[test]
    fn test_scoped_artifact_removes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.mp4");
        std::fs::write(&path, b"bytes").unwrap();
        {
            let _artifact = ScopedArtifact::new(path.clone());
        }
        assert!(!path.exists());

        // never created is fine too
        drop(ScopedArtifact::new(dir.path().join("missing.mp4")));
    }

    #[test]
    fn test_display_file_name() {
        let request = TransferRequest::new(1, "9", "S01E02", "https://h/x.mkv", "Some Show: Part 1");
        assert_eq!(
            display_file_name(&request, Path::new("/tmp/Some_Show_Part_1_S01E02_9_1-abc.mkv")),
            "Some_Show_Part_1_S01E02.mkv"
        );
    }
}
