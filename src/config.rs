//! Runtime configuration for media-relay
//!
//! One flat struct with working defaults. The CLI fills it from flags and
//! `MEDIA_RELAY_*` environment variables; library users build it directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{Error, Result};
use crate::core::expiry::ShutdownPolicy;
use crate::core::progress::ThrottlePolicy;
use crate::core::stream::DownloadOptions;
use crate::core::uploader::UploadOptions;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Limits, intervals and storage location for the transfer pipeline
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Scoped temp storage; created on startup, swept by age
    pub temp_dir: PathBuf,
    /// Downloads larger than this fail with `TooLarge`
    pub size_ceiling: u64,
    pub download_time_ceiling: Duration,
    /// Bounds the whole upload, fallback strategy and retries included
    pub upload_time_ceiling: Duration,
    /// Inline media is only attempted below this size
    pub inline_threshold: u64,
    pub document_ceiling: u64,
    /// How long delivered content stays in the chat
    pub expiry_ttl: Duration,
    pub sweep_interval: Duration,
    /// Temp files older than this are removed by the sweeper
    pub staleness_threshold: Duration,
    pub progress_step_percent: u8,
    pub progress_interval: Duration,
    /// Minimum time between two edits of one status message
    pub status_edit_interval: Duration,
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    /// Re-sends of the initial download request after network errors
    pub retry_attempts: u32,
    /// Re-sends of one upload strategy after transient platform errors
    pub upload_retries: u32,
    pub shutdown_policy: ShutdownPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("media-relay"),
            size_ceiling: 2 * GIB,
            download_time_ceiling: Duration::from_secs(30 * 60),
            upload_time_ceiling: Duration::from_secs(30 * 60),
            inline_threshold: 200 * MIB,
            document_ceiling: 2 * GIB,
            expiry_ttl: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(10 * 60),
            staleness_threshold: Duration::from_secs(90 * 60),
            progress_step_percent: 10,
            progress_interval: Duration::from_secs(5),
            status_edit_interval: Duration::from_secs(3),
            buffer_size: 64 * 1024,
            idle_timeout: Duration::from_secs(60),
            retry_attempts: 2,
            upload_retries: 2,
            shutdown_policy: ShutdownPolicy::ExpireNow,
        }
    }
}

impl RelayConfig {
    /// Rejects combinations that would break cleanup guarantees
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidInput("buffer size must be positive".to_string()));
        }
        let longest_transfer = self.download_time_ceiling.saturating_add(self.upload_time_ceiling);
        if self.staleness_threshold <= longest_transfer {
            return Err(Error::InvalidInput(format!(
                "staleness threshold {:?} must exceed the longest transfer ({longest_transfer:?})",
                self.staleness_threshold
            )));
        }
        if self.progress_step_percent == 0 || self.progress_step_percent > 100 {
            return Err(Error::InvalidInput(format!(
                "progress step must be 1-100%, got {}",
                self.progress_step_percent
            )));
        }
        Ok(())
    }

    pub fn throttle(&self) -> ThrottlePolicy {
        ThrottlePolicy {
            min_step_percent: self.progress_step_percent,
            min_interval: self.progress_interval,
        }
    }

    /// Download limits without a progress callback
    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            progress: None,
            buffer_size: self.buffer_size,
            size_ceiling: self.size_ceiling,
            time_ceiling: self.download_time_ceiling,
            idle_timeout: self.idle_timeout,
            retry_attempts: self.retry_attempts,
            throttle: self.throttle(),
            ..Default::default()
        }
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            inline_threshold: self.inline_threshold,
            document_ceiling: self.document_ceiling,
            time_ceiling: self.upload_time_ceiling,
            transient_retries: self.upload_retries,
            throttle: self.throttle(),
            ..Default::default()
        }
    }
}
