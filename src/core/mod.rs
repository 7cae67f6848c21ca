//! Core library modules for media-relay
//!
//! The transfer pipeline: resolve, download, upload, report, expire.

pub mod coordinator;
pub mod downloader;
pub mod error;
pub mod expiry;
pub mod progress;
pub mod source;
pub mod status;
pub mod stream;
pub mod transfer;
pub mod uploader;

// Re-export main types for internal use
pub use coordinator::{Coordinator, TransferHandle};
pub use downloader::Downloader;
pub use source::SourceResolver;
