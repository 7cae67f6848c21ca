//! Expiry scheduler
//!
//! Delivered messages are deleted after their TTL, and stale files in the
//! scoped temp directory are swept by age. All background work runs on a
//! [`TaskTracker`] so shutdown can wait for it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::error::Error;
use crate::surface::{DeliverySurface, MessageRef};

/// What happens to pending deletions on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Delete everything that is still scheduled right away
    #[default]
    ExpireNow,
    /// Leave delivered content in place
    Abandon,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
}

/// Removes regular files in `dir` whose modification time is older than
/// `threshold` at `now`.
///
/// A missing directory is an empty sweep.
pub async fn sweep_dir(dir: &Path, threshold: Duration, now: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
        Err(e) => {
            log::warn!("Cannot sweep {}: {e}", dir.display());
            return report;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Sweep of {} stopped early: {e}", dir.display());
                break;
            }
        };

        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(_) => {
                report.failed += 1;
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();

        if age <= threshold {
            report.kept += 1;
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                log::info!("Swept stale file {} ({}s old)", entry.path().display(), age.as_secs());
                report.removed += 1;
            }
            // another path got there first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!("Could not sweep {}: {e}", entry.path().display());
                report.failed += 1;
            }
        }
    }

    report
}

/// Schedules deletions of delivered messages and sweeps temp storage
pub struct ExpiryScheduler {
    surface: Arc<dyn DeliverySurface>,
    temp_dir: PathBuf,
    staleness: Duration,
    tracker: TaskTracker,
    /// Fires pending deletions immediately
    expire_now: CancellationToken,
    /// Drops pending deletions
    abandon: CancellationToken,
    pending: Arc<AtomicUsize>,
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExpiryScheduler {
    pub fn new(surface: Arc<dyn DeliverySurface>, temp_dir: impl Into<PathBuf>, staleness: Duration) -> Self {
        Self {
            surface,
            temp_dir: temp_dir.into(),
            staleness,
            tracker: TaskTracker::new(),
            expire_now: CancellationToken::new(),
            abandon: CancellationToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deletes `message` once after `ttl`; returns when that will happen
    pub fn schedule_expiry(&self, message: MessageRef, ttl: Duration) -> DateTime<Utc> {
        let ttl_delta = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        let expires_at = Utc::now() + ttl_delta;

        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(Arc::clone(&self.pending));
        let surface = Arc::clone(&self.surface);
        let expire_now = self.expire_now.clone();
        let abandon = self.abandon.clone();

        self.tracker.spawn(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                _ = abandon.cancelled() => {
                    log::debug!("Abandoned expiry of {message:?}");
                    return;
                }
                _ = expire_now.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {}
            }

            match surface.delete_message(&message).await {
                Ok(()) => log::info!("Expired message {} in chat {}", message.message_id, message.chat_id),
                Err(Error::MessageGone) => log::debug!("Message {message:?} was already gone"),
                Err(e) => log::warn!("Could not expire message {message:?}: {e}"),
            }
        });

        expires_at
    }

    /// Deletions that have not run yet
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Sweeps the temp directory once
    pub async fn sweep(&self) -> SweepReport {
        let report = sweep_dir(&self.temp_dir, self.staleness, SystemTime::now()).await;
        if report.removed > 0 || report.failed > 0 {
            log::info!(
                "Sweep of {}: {} removed, {} kept, {} failed",
                self.temp_dir.display(),
                report.removed,
                report.kept,
                report.failed
            );
        }
        report
    }

    /// Sweeps now and then every `interval` until shutdown
    pub fn spawn_sweeper(&self, interval: Duration) {
        let temp_dir = self.temp_dir.clone();
        let staleness = self.staleness;
        let expire_now = self.expire_now.clone();
        let abandon = self.abandon.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = expire_now.cancelled() => break,
                    _ = abandon.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = sweep_dir(&temp_dir, staleness, SystemTime::now()).await;
                        log::debug!("Periodic sweep: {report:?}");
                    }
                }
            }
        });
    }

    /// Stops the sweeper, settles pending deletions per `policy`, and waits
    /// for every tracked task
    pub async fn shutdown(&self, policy: ShutdownPolicy) {
        log::info!("Expiry shutdown ({policy:?}) with {} pending deletions", self.pending());
        match policy {
            ShutdownPolicy::ExpireNow => self.expire_now.cancel(),
            ShutdownPolicy::Abandon => self.abandon.cancel(),
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}
