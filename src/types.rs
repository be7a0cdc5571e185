//! Shared session types — events, per-variant outcomes, and the summary

use crate::merge::MergeOutcome;
use std::path::PathBuf;

/// Events emitted by a [`Session`](crate::session::Session) over its
/// broadcast channel
///
/// Observation is optional; a session runs identically with zero
/// subscribers (lagging receivers just miss events).
#[derive(Clone, Debug)]
pub enum Event {
    /// Metadata was resolved into a document
    MetadataResolved {
        /// Post title
        title: String,
        /// Number of candidate variants
        variants: usize,
    },
    /// A variant's download began
    VariantStarted {
        /// The variant's opaque identifier
        variant_id: String,
        /// The variant's resolution label
        label: String,
    },
    /// Byte-level progress for a variant's current transfer
    ///
    /// Emitted periodically while a transfer runs and once when it
    /// finishes, so even fast transfers surface their byte count.
    DownloadProgress {
        /// The variant's opaque identifier
        variant_id: String,
        /// Aggregate bytes completed so far
        completed: u64,
        /// Total bytes expected, or 0 when unknown
        total: u64,
    },
    /// A variant finished end to end (download plus merge)
    VariantCompleted {
        /// The variant's opaque identifier
        variant_id: String,
        /// Final artifact paths
        outputs: Vec<PathBuf>,
    },
    /// A variant failed; siblings are unaffected
    VariantFailed {
        /// The variant's opaque identifier
        variant_id: String,
        /// Error description
        error: String,
    },
    /// The whole session finished
    SessionCompleted {
        /// Variants that produced an artifact
        succeeded: usize,
        /// Variants that failed
        failed: usize,
    },
}

/// The result of one variant's download+merge pipeline
#[derive(Clone, Debug)]
pub struct VariantOutcome {
    /// The variant's opaque identifier
    pub variant_id: String,
    /// The variant's resolution label
    pub label: String,
    /// Final artifact paths on success, error text on failure
    pub result: std::result::Result<Vec<PathBuf>, String>,
}

impl VariantOutcome {
    /// Whether this variant produced its artifact(s)
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub(crate) fn from_merge(variant_id: String, label: String, outcome: &MergeOutcome) -> Self {
        let outputs = match outcome {
            MergeOutcome::Moved(path) | MergeOutcome::Merged(path) => vec![path.clone()],
            MergeOutcome::Skipped { video, audio } => {
                let mut paths = vec![video.clone()];
                paths.extend(audio.clone());
                paths
            }
        };
        Self {
            variant_id,
            label,
            result: Ok(outputs),
        }
    }
}

/// Aggregate result of one session run
///
/// Always returned when the pipeline gets past selection, even if every
/// variant failed; per-variant errors live in the outcomes.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    /// Title of the post this session processed
    pub title: String,
    /// One outcome per selected variant, in selection order
    pub outcomes: Vec<VariantOutcome>,
}

impl SessionSummary {
    /// Number of variants that produced artifacts
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    /// Number of variants that failed
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// True when every selected variant succeeded
    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }
}
