//! # clip-dl
//!
//! Backend library for short-form social-video downloaders.
//!
//! ## Design Philosophy
//!
//! clip-dl is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Source-agnostic** - Live link resolution and persisted metadata
//!   files feed the same pipeline
//! - **Deterministic selection** - The same metadata and policy always
//!   pick the same variants
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use clip_dl::{Config, FfmpegMuxer, MetadataSource, SelectionPolicy, Session};
//! use std::sync::Arc;
//!
//! # struct MyProvider;
//! # #[async_trait::async_trait]
//! # impl clip_dl::MetadataProvider for MyProvider {
//! #     async fn resolve(&self, _url: &str) -> clip_dl::Result<clip_dl::MetadataDocument> {
//! #         unimplemented!()
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let provider = Arc::new(MyProvider);
//!     let muxer = Arc::new(FfmpegMuxer::discover(&config.tools)?);
//!
//!     let session = Session::new(config, provider, muxer)?;
//!
//!     // Subscribe to events
//!     let mut events = session.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = session
//!         .run(
//!             MetadataSource::Live("https://v.example/share/abc".to_string()),
//!             &SelectionPolicy::default(),
//!         )
//!         .await?;
//!     println!("{} succeeded, {} failed", summary.succeeded(), summary.failed());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Segmented HTTP downloader
pub mod downloader;
/// Error types
pub mod error;
/// Merge coordination and the external muxer
pub mod merge;
/// Metadata model and providers
pub mod metadata;
/// Retry logic with exponential backoff
pub mod retry;
/// Variant selection and deduplication
pub mod selector;
/// Session orchestration
pub mod session;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, MergeConfig, RetryConfig, ToolsConfig};
pub use downloader::{Progress, SegmentedDownloader};
pub use error::{DownloadError, Error, MergeError, Result, SelectionError};
pub use merge::{FfmpegMuxer, MergeOutcome, Muxer, merge_if_needed};
pub use metadata::{MediaKind, MetadataDocument, MetadataProvider, MetadataSource, Variant};
pub use retry::{IsRetryable, retry_with_backoff};
pub use selector::{DedupStrategy, SelectionPolicy, select};
pub use session::Session;
pub use types::{Event, SessionSummary, VariantOutcome};
