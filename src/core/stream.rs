//! Streaming primitives for media-relay
//!
//! Provides the AsyncRead view over an HTTP body and the knobs that bound a
//! single download.

use std::time::Duration;

use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::core::progress::{ProgressCallback, ThrottlePolicy};

/// Limits and callbacks for one download
#[derive(Clone)]
pub struct DownloadOptions {
    /// Optional progress callback, invoked only when the throttle allows
    pub progress: Option<ProgressCallback>,

    /// Chunk size for streaming reads
    pub buffer_size: usize,

    /// Hard limit on bytes written to disk
    pub size_ceiling: u64,

    /// Hard wall-clock limit for the whole download
    pub time_ceiling: Duration,

    /// A read that stalls longer than this is treated as a lost connection
    pub idle_timeout: Duration,

    /// Attempts to re-send the initial request after a network error
    pub retry_attempts: u32,

    /// Base delay for exponential backoff between attempts
    pub retry_base_delay: Duration,

    /// When progress may be reported
    pub throttle: ThrottlePolicy,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            progress: None,
            buffer_size: 64 * 1024, // 64KB
            size_ceiling: 2 * 1024 * 1024 * 1024,
            time_ceiling: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(60),
            retry_attempts: 2,
            retry_base_delay: Duration::from_millis(500),
            throttle: ThrottlePolicy::default(),
        }
    }
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("progress", &self.progress.is_some())
            .field("buffer_size", &self.buffer_size)
            .field("size_ceiling", &self.size_ceiling)
            .field("time_ceiling", &self.time_ceiling)
            .field("idle_timeout", &self.idle_timeout)
            .field("retry_attempts", &self.retry_attempts)
            .finish()
    }
}

/// Reads the body of a host response as a byte stream
pub fn create_http_stream(response: reqwest::Response) -> impl AsyncRead + Send + Unpin {
    StreamReader::new(response.bytes_stream().map_err(std::io::Error::other))
}
