//! Metadata model — candidate stream variants and the documents that own them
//!
//! A [`MetadataDocument`] is produced either by a live [`MetadataProvider`]
//! (short-link resolution is an opaque collaborator) or by loading a
//! persisted JSON file. Both paths yield the same type, so everything
//! downstream of the selector is source-agnostic.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Kind of media a variant carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video-only track (requires a paired audio track for playback)
    Video,
    /// Audio-only track
    Audio,
    /// Combined audio+video stream, playable as-is
    Muxed,
}

/// A single candidate media stream
///
/// Immutable once created. `id` is the site's opaque resolution/gear
/// identifier; `label` is the human-facing resolution name (e.g. "1080p")
/// and is the identity used for grouping and deduplication. Unknown
/// bitrate or size is `None` — the remote frequently omits both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Opaque per-site identifier for this stream (gear name, quality id)
    pub id: String,

    /// Human-readable resolution label, e.g. "720p", "1080p"
    pub label: String,

    /// Bitrate in bits per second, if the site reported one
    #[serde(default)]
    pub bitrate_bps: Option<u64>,

    /// Size in bytes, if the site reported one
    #[serde(default)]
    pub size_bytes: Option<u64>,

    /// Fetchable location of the stream bytes
    pub url: String,

    /// Whether this is a video, audio, or muxed stream
    pub media_kind: MediaKind,
}

/// A resolved post: title plus the ordered candidate variants
///
/// Read-only after creation. For sites that split tracks (Bilibili DASH),
/// `audio_variants` holds the separate audio candidates; for sites that
/// serve muxed streams (Douyin) it is empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataDocument {
    /// Title of the post, used for output file naming
    pub title: String,

    /// Candidate video (or muxed) streams in the order the site listed them
    pub variants: Vec<Variant>,

    /// Separate audio candidates, empty when the site serves muxed streams
    #[serde(default)]
    pub audio_variants: Vec<Variant>,

    /// When this document was resolved
    #[serde(default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl MetadataDocument {
    /// Create a new document resolved at the current instant
    pub fn new(title: impl Into<String>, variants: Vec<Variant>, audio_variants: Vec<Variant>) -> Self {
        Self {
            title: title.into(),
            variants,
            audio_variants,
            fetched_at: Utc::now(),
        }
    }

    /// The best separate audio track, by highest bitrate
    ///
    /// Returns `None` when the site serves muxed streams. Candidates with
    /// unknown bitrate rank below any candidate with a known one; ties keep
    /// the first-encountered candidate.
    pub fn best_audio(&self) -> Option<&Variant> {
        let mut best: Option<&Variant> = None;
        for candidate in &self.audio_variants {
            match best {
                None => best = Some(candidate),
                Some(current)
                    if candidate.bitrate_bps.unwrap_or(0) > current.bitrate_bps.unwrap_or(0) =>
                {
                    best = Some(candidate)
                }
                _ => {}
            }
        }
        best
    }

    /// Persist this document as pretty-printed JSON
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!(path = %path.display(), "Metadata document saved");
        Ok(())
    }

    /// Load a previously persisted document
    ///
    /// Schema mismatches surface as [`Error::MalformedMetadata`], never a
    /// panic — a stale or hand-edited file must not crash the session.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let doc: Self = serde_json::from_slice(&bytes).map_err(|e| {
            Error::MalformedMetadata(format!("{}: {}", path.display(), e))
        })?;
        tracing::debug!(
            path = %path.display(),
            variants = doc.variants.len(),
            "Metadata document loaded"
        );
        Ok(doc)
    }
}

/// Where a session obtains its metadata document
///
/// Live resolution and loading a persisted file are interchangeable: both
/// produce a [`MetadataDocument`] before anything downstream runs.
#[derive(Clone, Debug)]
pub enum MetadataSource {
    /// Resolve a short link or URL through the metadata provider
    Live(String),
    /// Load a previously saved metadata JSON file
    Persisted(std::path::PathBuf),
}

impl MetadataSource {
    /// Resolve this source into a document
    pub async fn resolve(&self, provider: &dyn MetadataProvider) -> Result<MetadataDocument> {
        match self {
            MetadataSource::Live(url) => provider.resolve(url).await,
            MetadataSource::Persisted(path) => MetadataDocument::load(path).await,
        }
    }
}

/// Abstraction over short-link resolution, enabling testability
///
/// The production implementation scrapes or calls the remote site; the
/// library treats it as opaque and tolerates partial documents (absent
/// bitrate or size on any variant).
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Resolve a short link or page URL into a metadata document
    ///
    /// Fails with [`Error::Resolution`] for invalid links, geo-blocks,
    /// removed content, or rate limiting.
    async fn resolve(&self, url: &str) -> Result<MetadataDocument>;
}
