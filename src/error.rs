//! Error types for clip-dl
//!
//! This module provides the error handling for the library, including:
//! - Domain-specific error types (Selection, Download, Merge)
//! - Metadata resolution and persistence errors
//! - Context information (segment ranges, attempt counts, file paths)

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for clip-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for clip-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Metadata could not be obtained for a URL (invalid link, geo-block,
    /// removed content, rate-limited). Fatal for that URL.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Selection policy yielded zero or too many candidates
    #[error("selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Segmented download failed
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Audio/video merge failed
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    /// Persisted metadata file is unreadable or schema-invalid
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "save_dir")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,
}

/// Selection-related errors
///
/// Produced by [`crate::selector::select`] when the policy cannot narrow the
/// candidate list to a usable result. The caller decides whether `Ambiguous`
/// is fatal or resolved by defaulting to the highest-quality candidate.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// No variant survives the filter/target steps of the policy
    #[error("no variant matches the selection policy")]
    NotFound,

    /// Caller requested exactly one variant but multiple equally-ranked
    /// candidates remain and no policy resolves the tie
    #[error("selection is ambiguous: {candidates} candidates for label \"{label}\"")]
    Ambiguous {
        /// The resolution label that still holds multiple candidates
        label: String,
        /// How many candidates share that label
        candidates: usize,
    },
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The size probe request failed before any segment was scheduled
    #[error("probe failed for {url}: {reason}")]
    ProbeFailed {
        /// The URL that was probed
        url: String,
        /// Why the probe failed
        reason: String,
    },

    /// A single segment exhausted its retry budget
    #[error("segment {index} [{start}, {end}) failed after {attempts} attempts: {reason}")]
    SegmentExhausted {
        /// Zero-based segment index
        index: usize,
        /// Inclusive start byte of the segment
        start: u64,
        /// Exclusive end byte of the segment
        end: u64,
        /// Number of attempts made before giving up
        attempts: u32,
        /// The last error observed for this segment
        reason: String,
    },

    /// One or more segments of a task exhausted their retries
    #[error("{failed} of {total} segments failed: {first_error}")]
    SegmentsFailed {
        /// Number of segments that failed
        failed: usize,
        /// Total number of segments in the task
        total: usize,
        /// The first segment error observed, for attribution
        first_error: String,
    },

    /// The remote answered with a non-retryable HTTP status
    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus {
        /// The HTTP status code
        status: u16,
        /// The URL that produced it
        url: String,
    },

    /// The completed file does not match the probed total size
    #[error("expected {expected} bytes but wrote {written}")]
    SizeMismatch {
        /// Size reported by the probe
        expected: u64,
        /// Bytes actually written
        written: u64,
    },
}

/// Merge-related errors
#[derive(Debug, Error)]
pub enum MergeError {
    /// The external muxer exited non-zero or produced no usable output
    #[error("muxer failed: {reason}")]
    ToolFailure {
        /// Exit status and/or captured stderr from the muxer
        reason: String,
    },

    /// No muxer binary could be found (explicit path missing and PATH search failed)
    #[error("muxer binary not found")]
    MuxerNotFound,

    /// Moving the single-stream file to its final destination failed
    #[error("failed to move {source_path} to {dest_path}: {reason}")]
    MoveFailed {
        /// The source path of the file being moved
        source_path: PathBuf,
        /// The destination path where the file should land
        dest_path: PathBuf,
        /// The reason the move failed
        reason: String,
    },
}
