//! Core download functionality for media-relay
//!
//! Streams a host response straight to a file in scoped temp storage while
//! enforcing the size and time ceilings. Nothing is buffered beyond one chunk.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, ClientBuilder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::{Error, Result};
use crate::core::progress::ProgressMeter;
use crate::core::stream::{create_http_stream, DownloadOptions};

/// Global HTTP client for content hosts
///
/// No overall request timeout: large bodies legitimately take minutes, the
/// time ceiling of each download bounds them instead.
static GLOBAL_CLIENT: Lazy<Client> = Lazy::new(|| {
    ClientBuilder::new()
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(8)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(format!("media-relay/{}", env!("MEDIA_RELAY_VERSION")))
        .build()
        .unwrap_or_else(|err| {
            log::warn!("Falling back to default HTTP client: {err}");
            Client::new()
        })
});

/// Shared client for content hosts
pub fn shared_client() -> Client {
    GLOBAL_CLIENT.clone()
}

/// Execute an operation with retry logic for network errors
async fn retry_on_network_error<F, Fut, T>(options: &DownloadOptions, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(Error::NetworkError(msg)) if attempt < options.retry_attempts => {
                attempt += 1;
                let delay = options.retry_base_delay * (1 << (attempt - 1)); // Exponential backoff
                log::warn!("Network error (attempt {attempt}): {msg}. Retrying in {delay:?}...");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reads the declared body length, if the host sent a usable one
fn declared_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Rejects a declared size above the ceiling; unknown sizes pass
pub fn check_declared_size(declared: Option<u64>, ceiling: u64) -> Result<()> {
    match declared {
        Some(size) if size > ceiling => Err(Error::TooLarge { size, ceiling }),
        _ => Ok(()),
    }
}

/// Copies `reader` into `writer` chunk by chunk, enforcing the size ceiling
/// against the running total and reporting throttled progress.
///
/// Returns the number of bytes written.
pub async fn copy_with_ceiling<R, W>(
    reader: &mut R,
    writer: &mut W,
    declared: Option<u64>,
    options: &DownloadOptions,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; options.buffer_size.max(1)];
    let mut meter = ProgressMeter::new(declared, options.throttle);

    if let Some(ref progress) = options.progress {
        progress(meter.snapshot());
    }

    loop {
        let bytes_read = tokio::time::timeout(options.idle_timeout, reader.read(&mut buffer))
            .await
            .map_err(|_| {
                Error::NetworkError(format!("no data received for {:?}", options.idle_timeout))
            })?
            .map_err(|e| Error::NetworkError(format!("Stream read error: {e}")))?;

        if bytes_read == 0 {
            break;
        }

        let total = meter.bytes() + bytes_read as u64;
        if total > options.size_ceiling {
            return Err(Error::TooLarge {
                size: total,
                ceiling: options.size_ceiling,
            });
        }

        writer.write_all(&buffer[..bytes_read]).await?;

        if let Some(snapshot) = meter.record(bytes_read as u64) {
            if let Some(ref progress) = options.progress {
                progress(snapshot);
            }
        }
    }

    if let Some(expected) = declared {
        if meter.bytes() < expected {
            return Err(Error::NetworkError(format!(
                "connection closed after {} of {expected} bytes",
                meter.bytes()
            )));
        }
    }

    writer.flush().await?;
    Ok(meter.bytes())
}

/// Removes a partially written file; a missing file is fine
async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove partial file {}: {e}", path.display()),
    }
}

/// Streaming downloader for untrusted content hosts
#[derive(Clone)]
pub struct Downloader {
    client: Client,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    /// Create a downloader on the shared client
    pub fn new() -> Self {
        Self {
            client: shared_client(),
        }
    }

    /// Create a downloader with a custom client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Downloads `url` into `dest`, which must not exist yet.
    ///
    /// On any failure the partial file is removed before returning.
    pub async fn download(&self, url: &str, dest: &Path, options: &DownloadOptions) -> Result<u64> {
        let mut created = false;
        let outcome = tokio::time::timeout(
            options.time_ceiling,
            self.download_to_file(url, dest, options, &mut created),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(options.time_ceiling)),
        };

        match result {
            Ok(bytes) => {
                log::info!("Downloaded {bytes} bytes from {url}");
                Ok(bytes)
            }
            Err(e) => {
                if created {
                    remove_partial(dest).await;
                }
                log::warn!("Download of {url} failed: {e}");
                Err(e)
            }
        }
    }

    async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        options: &DownloadOptions,
        created: &mut bool,
    ) -> Result<u64> {
        let client = &self.client;

        let response = retry_on_network_error(options, || async {
            let response = client.get(url).send().await?;
            Ok(response)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(status, url));
        }

        let declared = declared_length(&response);
        check_declared_size(declared, options.size_ceiling)?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .await?;
        *created = true;

        let mut stream = create_http_stream(response);
        copy_with_ceiling(&mut stream, &mut file, declared, options).await
    }
}
