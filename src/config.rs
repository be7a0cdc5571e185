//! Configuration types for clip-dl

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Download behavior configuration (directories, concurrency, timeouts)
///
/// Groups settings related to how streams are fetched and stored.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Final output directory (default: "./downloads")
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,

    /// Temporary directory for in-progress and intermediate files (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Number of concurrent range segments per download task (default: 8)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum number of variants downloaded simultaneously when the
    /// selection keeps several (default: 2)
    ///
    /// Total simultaneous connections are bounded by
    /// `concurrency * max_simultaneous_variants` so an outer fan-out never
    /// overwhelms the remote host.
    #[serde(default = "default_max_simultaneous_variants")]
    pub max_simultaneous_variants: usize,

    /// Timeout for establishing a connection, per HTTP attempt (default: 15 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Total timeout per HTTP attempt, connect plus read (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Interval between [`DownloadProgress`](crate::Event::DownloadProgress)
    /// events while a transfer runs (default: 1 second)
    #[serde(default = "default_progress_interval", with = "duration_serde")]
    pub progress_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            temp_dir: default_temp_dir(),
            concurrency: default_concurrency(),
            max_simultaneous_variants: default_max_simultaneous_variants(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            progress_interval: default_progress_interval(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per segment, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// External muxer binary configuration
///
/// Groups settings for locating and invoking the external audio/video muxer.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to the ffmpeg executable (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Whether to search PATH for the muxer if no explicit path is set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            search_path: true,
        }
    }
}

/// Merge behavior configuration
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Skip muxer invocation entirely and keep both intermediate tracks
    /// in place (default: false)
    ///
    /// This is a first-class mode, not a fallback: callers that want raw
    /// tracks set it deliberately.
    #[serde(default)]
    pub no_merge: bool,

    /// Keep the intermediate video/audio files after a successful merge
    /// (default: false)
    #[serde(default)]
    pub keep_intermediates: bool,
}

/// Main configuration for a [`Session`](crate::session::Session)
///
/// Fields are organized into logical sub-configs:
/// - [`download`](DownloadConfig) — directories, concurrency, timeouts
/// - [`retry`](RetryConfig) — backoff behavior for transient segment failures
/// - [`tools`](ToolsConfig) — muxer binary discovery
/// - [`merge`](MergeConfig) — merge vs. keep-intermediates behavior
///
/// Sub-config fields are flattened for serialization, so the JSON/TOML
/// format stays flat (no nesting). There is no process-wide mutable state:
/// a `Config` is constructed explicitly and passed into the session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Retry behavior for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// External muxer binary settings
    #[serde(flatten)]
    pub tools: ToolsConfig,

    /// Merge behavior settings
    #[serde(flatten)]
    pub merge: MergeConfig,
}

// Convenience accessors — delegate to the sub-config structs so call sites
// can use `config.save_dir()` without spelling out the nesting.
impl Config {
    /// Final output directory
    pub fn save_dir(&self) -> &PathBuf {
        &self.download.save_dir
    }

    /// Temporary directory for intermediate files
    pub fn temp_dir(&self) -> &PathBuf {
        &self.download.temp_dir
    }

    /// Validate the configuration, returning a [`crate::Error::Config`]
    /// describing the first invalid setting found.
    pub fn validate(&self) -> crate::Result<()> {
        if self.download.concurrency == 0 {
            return Err(crate::Error::Config {
                message: "concurrency must be at least 1".to_string(),
                key: Some("concurrency".to_string()),
            });
        }
        if self.download.max_simultaneous_variants == 0 {
            return Err(crate::Error::Config {
                message: "max_simultaneous_variants must be at least 1".to_string(),
                key: Some("max_simultaneous_variants".to_string()),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config {
                message: "max_attempts must be at least 1".to_string(),
                key: Some("retry.max_attempts".to_string()),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(crate::Error::Config {
                message: "backoff_multiplier must be >= 1.0".to_string(),
                key: Some("retry.backoff_multiplier".to_string()),
            });
        }
        Ok(())
    }
}

// Default value functions for serde

fn default_save_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_concurrency() -> usize {
    8
}

fn default_max_simultaneous_variants() -> usize {
    2
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (seconds as u64)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
