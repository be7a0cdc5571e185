//! Merge coordination — turning downloaded tracks into one playable file
//!
//! A variant that arrived as a single muxed stream just needs a move into
//! place. Split audio/video tracks are combined by an external muxer
//! (ffmpeg) invoked as a subprocess with stream-copy arguments. The
//! `no_merge` mode skips the muxer entirely and leaves the raw tracks
//! where they are — a first-class outcome, not a fallback.

use crate::config::{MergeConfig, ToolsConfig};
use crate::error::{Error, MergeError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Combines one video track and one audio track into a single output file
///
/// The production implementation shells out to ffmpeg; tests substitute
/// in-process fakes.
#[async_trait]
pub trait Muxer: Send + Sync {
    /// Mux `video` and `audio` into `output`
    ///
    /// # Errors
    ///
    /// [`MergeError::ToolFailure`] when the tool exits non-zero or cannot
    /// be executed.
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()>;
}

/// ffmpeg-based [`Muxer`] using an external binary
///
/// Streams are copied, not re-encoded (`-c copy`), so muxing is I/O bound
/// and fast.
#[derive(Debug)]
pub struct FfmpegMuxer {
    binary_path: PathBuf,
}

impl FfmpegMuxer {
    /// Create a muxer with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find ffmpeg in PATH
    pub fn from_path() -> Option<Self> {
        which::which("ffmpeg").ok().map(Self::new)
    }

    /// Locate the muxer per the tools configuration
    ///
    /// An explicit `ffmpeg_path` wins; otherwise PATH is searched when
    /// `search_path` is enabled.
    ///
    /// # Errors
    ///
    /// [`MergeError::MuxerNotFound`] when no binary can be located.
    pub fn discover(tools: &ToolsConfig) -> Result<Self> {
        if let Some(path) = &tools.ffmpeg_path {
            return Ok(Self::new(path.clone()));
        }
        if tools.search_path {
            if let Some(muxer) = Self::from_path() {
                return Ok(muxer);
            }
        }
        Err(Error::Merge(MergeError::MuxerNotFound))
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        let result = Command::new(&self.binary_path)
            .arg("-y")
            .arg("-i")
            .arg(video)
            .arg("-i")
            .arg(audio)
            .arg("-c")
            .arg("copy")
            .arg(output)
            .output()
            .await
            .map_err(|e| {
                Error::Merge(MergeError::ToolFailure {
                    reason: format!("failed to execute ffmpeg: {e}"),
                })
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            // Keep the tail of stderr; ffmpeg front-loads banner noise
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::Merge(MergeError::ToolFailure {
                reason: format!("ffmpeg exited with {}: {tail}", result.status),
            }));
        }
        Ok(())
    }
}

/// What the merge step produced
#[derive(Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Single muxed stream, moved to its final destination
    Moved(PathBuf),
    /// Separate tracks combined by the muxer into the destination
    Merged(PathBuf),
    /// `no_merge` mode: intermediates retained in place, muxer never invoked
    Skipped {
        /// The downloaded video (or muxed) track, left where it was
        video: PathBuf,
        /// The downloaded audio track, if any
        audio: Option<PathBuf>,
    },
}

/// Finalize a downloaded variant
///
/// No audio track means the video file is already playable and is simply
/// moved to `output`. With an audio track the muxer combines both; on
/// success the intermediates are deleted unless the config keeps them
/// (deletion failures are logged, never fatal — the merged output already
/// exists). A muxer run that reports success but leaves no usable output
/// file is still [`MergeError::ToolFailure`].
pub async fn merge_if_needed(
    muxer: &dyn Muxer,
    video: &Path,
    audio: Option<&Path>,
    output: &Path,
    config: &MergeConfig,
) -> Result<MergeOutcome> {
    if config.no_merge {
        tracing::info!(
            video = %video.display(),
            audio = ?audio.map(|p| p.display().to_string()),
            "Merge skipped (no-merge mode), intermediates retained"
        );
        return Ok(MergeOutcome::Skipped {
            video: video.to_path_buf(),
            audio: audio.map(Path::to_path_buf),
        });
    }

    let Some(audio) = audio else {
        move_file(video, output).await?;
        tracing::debug!(output = %output.display(), "Single stream moved into place");
        return Ok(MergeOutcome::Moved(output.to_path_buf()));
    };

    muxer.mux(video, audio, output).await?;

    let usable = tokio::fs::metadata(output)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false);
    if !usable {
        return Err(Error::Merge(MergeError::ToolFailure {
            reason: format!(
                "muxer reported success but produced no output at {}",
                output.display()
            ),
        }));
    }

    if !config.keep_intermediates {
        for intermediate in [video, audio] {
            if let Err(e) = tokio::fs::remove_file(intermediate).await {
                tracing::warn!(
                    path = %intermediate.display(),
                    error = %e,
                    "Failed to delete intermediate file after merge"
                );
            }
        }
    }

    tracing::debug!(output = %output.display(), "Tracks merged");
    Ok(MergeOutcome::Merged(output.to_path_buf()))
}

/// Move a file, falling back to copy+remove when rename crosses filesystems
async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, dest).await.map_err(|e| {
        Error::Merge(MergeError::MoveFailed {
            source_path: source.to_path_buf(),
            dest_path: dest.to_path_buf(),
            reason: e.to_string(),
        })
    })?;
    if let Err(e) = tokio::fs::remove_file(source).await {
        tracing::warn!(
            path = %source.display(),
            error = %e,
            "Failed to remove source after copy-based move"
        );
    }
    Ok(())
}
