//! # media-relay
//!
//! Relays media files from unreliable third-party hosts into a chat session.
//!
//! ## Features
//!
//! - **Host rules**: share links of known hosts are rewritten to direct downloads
//! - **Bounded streaming**: size and time ceilings, nothing buffered beyond one chunk
//! - **Ordered delivery**: inline media first, generic document as fallback
//! - **Guaranteed cleanup**: temp files are scoped, delivered messages expire
//! - **One transfer per key**: repeated requests attach to the running transfer
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use media_relay::{Coordinator, RelayConfig, TransferRequest, TelegramSurface};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let surface = Arc::new(TelegramSurface::new("123:token"));
//!     let coordinator = Coordinator::new(RelayConfig::default(), surface)?;
//!
//!     let request = TransferRequest::new(
//!         4242,
//!         "12",
//!         "720p",
//!         "https://pixeldrain.com/u/abc123",
//!         "Big Movie",
//!     );
//!     let state = coordinator.begin_transfer(request).wait().await;
//!     println!("{state:?}");
//!
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Plain downloads
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = media_relay::download_with_progress(
//!     "https://pixeldrain.com/u/abc123",
//!     "movie.mp4",
//!     |progress| eprintln!("{} bytes", progress.bytes),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

pub mod catalog;
pub mod config;
pub mod core;
pub mod surface;

pub use crate::catalog::{CatalogClient, MediaItem, Variant};
pub use crate::config::RelayConfig;
pub use crate::core::coordinator::{Coordinator, TransferHandle};
pub use crate::core::error::{Error, FailureKind, Result};
pub use crate::core::expiry::{ExpiryScheduler, ShutdownPolicy, SweepReport};
pub use crate::core::progress::{Progress, ProgressCallback};
pub use crate::core::source::{HostRule, SourceResolver};
pub use crate::core::stream::DownloadOptions;
pub use crate::core::transfer::{render_state, TransferKey, TransferRequest, TransferState};
pub use crate::surface::memory::MemorySurface;
pub use crate::surface::telegram::TelegramSurface;
pub use crate::surface::{DeliverySurface, MessageRef};

/// Rewrites a share link into a direct download URL with the built-in rules
///
/// # Examples
/// ```rust
/// assert_eq!(
///     media_relay::resolve("https://pixeldrain.com/u/abc123"),
///     "https://pixeldrain.com/api/file/abc123?download"
/// );
/// ```
pub fn resolve(url: &str) -> String {
    SourceResolver::new().resolve(url)
}

/// Whether a single GET on `url` is expected to return the file
pub fn is_streamable(url: &str) -> bool {
    SourceResolver::new().classify_streamable(url)
}

/// Resolves `url` and downloads it to `dest`, which must not exist yet
pub async fn download_with_options<P: AsRef<Path>>(
    url: &str,
    dest: P,
    options: DownloadOptions,
) -> Result<u64> {
    let downloader = core::Downloader::new();
    downloader
        .download(&resolve(url), dest.as_ref(), &options)
        .await
}

/// Download with default limits and a progress callback
///
/// The callback only fires when the progress advanced by 10 points or
/// 5 seconds passed.
pub async fn download_with_progress<P, F>(url: &str, dest: P, progress: F) -> Result<u64>
where
    P: AsRef<Path>,
    F: Fn(Progress) + Send + Sync + 'static,
{
    let options = DownloadOptions {
        progress: Some(Arc::new(progress)),
        ..Default::default()
    };
    download_with_options(url, dest, options).await
}
