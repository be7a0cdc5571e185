//! Session orchestration — one invocation end to end
//!
//! A [`Session`] wires the pipeline together: resolve a metadata source
//! into a document, select variants, download each selected variant (plus
//! its paired audio track when the site splits streams), and merge into
//! final artifacts. Variant failures are isolated; the summary reports
//! every outcome and the session only errors out for pipeline-level
//! failures (resolution, selection, cancellation).

use crate::config::Config;
use crate::downloader::{Progress, SegmentedDownloader};
use crate::error::{Error, Result, SelectionError};
use crate::merge::{Muxer, merge_if_needed};
use crate::metadata::{MediaKind, MetadataDocument, MetadataProvider, MetadataSource, Variant};
use crate::selector::{DedupStrategy, SelectionPolicy, select};
use crate::types::{Event, SessionSummary, VariantOutcome};
use crate::utils::{filename_from_url, format_bytes, sanitize_title};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

/// Orchestrates resolve → select → download → merge for one invocation
///
/// Total simultaneous connections stay bounded by
/// `concurrency * max_simultaneous_variants`: the downloader caps segments
/// per variant and an outer semaphore caps variants in flight.
pub struct Session {
    config: Config,
    provider: Arc<dyn MetadataProvider>,
    muxer: Arc<dyn Muxer>,
    downloader: SegmentedDownloader,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session
    ///
    /// Validates the configuration and builds the HTTP client with the
    /// configured per-attempt timeouts.
    pub fn new(
        config: Config,
        provider: Arc<dyn MetadataProvider>,
        muxer: Arc<dyn Muxer>,
    ) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.download.connect_timeout)
            .timeout(config.download.request_timeout)
            .build()?;
        let downloader = SegmentedDownloader::new(
            client,
            config.download.concurrency,
            config.retry.clone(),
        );
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            config,
            provider,
            muxer,
            downloader,
            events,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Token that cancels this session when fired
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline for one metadata source
    ///
    /// Returns a [`SessionSummary`] whenever selection succeeds, even if
    /// every variant afterwards fails; per-variant errors live in the
    /// summary's outcomes.
    ///
    /// # Errors
    ///
    /// Resolution failures, selection failures that defaulting cannot fix,
    /// and [`Error::Cancelled`] abort the whole run.
    pub async fn run(
        &self,
        source: MetadataSource,
        policy: &SelectionPolicy,
    ) -> Result<SessionSummary> {
        let document = source.resolve(self.provider.as_ref()).await?;
        let _ = self.events.send(Event::MetadataResolved {
            title: document.title.clone(),
            variants: document.variants.len(),
        });

        let selected = resolve_selection(&document, policy)?;
        let title_stem = sanitize_title(&document.title);

        tokio::fs::create_dir_all(self.config.save_dir()).await?;
        tokio::fs::create_dir_all(self.config.temp_dir()).await?;

        if matches!(source, MetadataSource::Live(_)) {
            self.persist_document(&document, &title_stem).await;
        }

        // Sites that split tracks pair every selected video with the best
        // audio candidate; muxed streams need no pairing
        let audio = document.best_audio().cloned();
        let single = selected.len() == 1;
        let semaphore = Arc::new(Semaphore::new(self.config.download.max_simultaneous_variants));

        let mut handles = Vec::with_capacity(selected.len());
        for variant in selected {
            let downloader = self.downloader.clone();
            let muxer = Arc::clone(&self.muxer);
            let config = self.config.clone();
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            let title_stem = title_stem.clone();
            let audio = audio
                .as_ref()
                .filter(|_| variant.media_kind == MediaKind::Video)
                .cloned();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return VariantOutcome {
                            variant_id: variant.id.clone(),
                            label: variant.label.clone(),
                            result: Err("session closed".to_string()),
                        };
                    }
                };
                run_variant(
                    downloader, muxer, config, events, cancel, title_stem, variant, audio, single,
                )
                .await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Variant worker panicked");
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let summary = SessionSummary {
            title: document.title,
            outcomes,
        };
        let _ = self.events.send(Event::SessionCompleted {
            succeeded: summary.succeeded(),
            failed: summary.failed(),
        });
        tracing::info!(
            title = %summary.title,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "Session complete"
        );
        Ok(summary)
    }

    /// Best-effort persistence of a live-resolved document, so a later run
    /// can replay selection without touching the remote
    async fn persist_document(&self, document: &MetadataDocument, title_stem: &str) {
        let path = self
            .config
            .save_dir()
            .join(format!("{title_stem}.metadata.json"));
        if let Err(e) = document.save(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist metadata document");
        }
    }
}

/// Apply the selection policy, defaulting an ambiguous result to the
/// highest-bitrate candidate
///
/// Library callers of [`select`] get [`SelectionError::Ambiguous`]; the
/// session is the place where "just give me the best one" is the right
/// interpretation, so it retries with a bitrate tiebreaker and a warning.
fn resolve_selection(document: &MetadataDocument, policy: &SelectionPolicy) -> Result<Vec<Variant>> {
    match select(&document.variants, policy) {
        Ok(selected) => Ok(selected),
        Err(SelectionError::Ambiguous { label, candidates }) => {
            tracing::warn!(
                label = %label,
                candidates = candidates,
                "Selection ambiguous, defaulting to the highest-bitrate candidate"
            );
            let tiebreak = SelectionPolicy {
                dedup: DedupStrategy::HighestBitrate,
                ..policy.clone()
            };
            select(&document.variants, &tiebreak).map_err(Error::from)
        }
        Err(e) => Err(Error::from(e)),
    }
}

/// One variant's pipeline: download video, download paired audio, merge
#[allow(clippy::too_many_arguments)]
async fn run_variant(
    downloader: SegmentedDownloader,
    muxer: Arc<dyn Muxer>,
    config: Config,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
    title_stem: String,
    variant: Variant,
    audio: Option<Variant>,
    single: bool,
) -> VariantOutcome {
    let _ = events.send(Event::VariantStarted {
        variant_id: variant.id.clone(),
        label: variant.label.clone(),
    });

    let result = variant_pipeline(
        &downloader,
        muxer.as_ref(),
        &config,
        &events,
        &cancel,
        &title_stem,
        &variant,
        audio.as_ref(),
        single,
    )
    .await;

    match result {
        Ok(outcome) => {
            let outcome =
                VariantOutcome::from_merge(variant.id.clone(), variant.label.clone(), &outcome);
            if let Ok(outputs) = &outcome.result {
                let _ = events.send(Event::VariantCompleted {
                    variant_id: variant.id.clone(),
                    outputs: outputs.clone(),
                });
            }
            outcome
        }
        Err(e) => {
            tracing::warn!(
                variant = %variant.id,
                label = %variant.label,
                error = %e,
                "Variant failed"
            );
            let _ = events.send(Event::VariantFailed {
                variant_id: variant.id.clone(),
                error: e.to_string(),
            });
            VariantOutcome {
                variant_id: variant.id,
                label: variant.label,
                result: Err(e.to_string()),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn variant_pipeline(
    downloader: &SegmentedDownloader,
    muxer: &dyn Muxer,
    config: &Config,
    events: &broadcast::Sender<Event>,
    cancel: &CancellationToken,
    title_stem: &str,
    variant: &Variant,
    audio: Option<&Variant>,
    single: bool,
) -> Result<crate::merge::MergeOutcome> {
    let stem = variant_stem(title_stem, &variant.label, single);
    let extension = output_extension(&variant.url, audio.is_some());
    let video_tmp = config.temp_dir().join(format!("{stem}.video.part"));
    let output = config.save_dir().join(format!("{stem}.{extension}"));
    let interval = config.download.progress_interval;

    observed_download(
        downloader,
        events,
        &variant.id,
        interval,
        &variant.url,
        &video_tmp,
        cancel,
    )
    .await?;

    let audio_tmp: Option<PathBuf> = match audio {
        Some(audio_variant) => {
            let path = config.temp_dir().join(format!("{stem}.audio.part"));
            observed_download(
                downloader,
                events,
                &variant.id,
                interval,
                &audio_variant.url,
                &path,
                cancel,
            )
            .await?;
            Some(path)
        }
        None => None,
    };

    merge_if_needed(
        muxer,
        &video_tmp,
        audio_tmp.as_deref(),
        &output,
        &config.merge,
    )
    .await
}

/// File stem for one variant's artifacts
///
/// A lone selection keeps the bare title; multiple selections append the
/// label, run through the same sanitizer as the title since labels come
/// from site metadata too.
fn variant_stem(title_stem: &str, label: &str, single: bool) -> String {
    if single {
        title_stem.to_string()
    } else {
        format!("{title_stem}_{}", sanitize_title(label))
    }
}

/// Extension for a variant's final artifact
///
/// Split tracks always mux into an mp4 container. A muxed stream keeps the
/// extension its URL advertises, when it looks like one.
fn output_extension(url: &str, has_audio: bool) -> String {
    if has_audio {
        return "mp4".to_string();
    }
    filename_from_url(url)
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| "mp4".to_string())
}

/// Run one transfer while publishing its byte-level progress
///
/// A reporter task ticks on the configured interval for the duration of the
/// transfer; a final snapshot goes out on success so even transfers faster
/// than one interval surface their byte count.
async fn observed_download(
    downloader: &SegmentedDownloader,
    events: &broadcast::Sender<Event>,
    variant_id: &str,
    interval: Duration,
    url: &str,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let progress = Progress::new();
    let reporter = tokio::spawn({
        let events = events.clone();
        let progress = Arc::clone(&progress);
        let variant_id = variant_id.to_string();
        async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = events.send(Event::DownloadProgress {
                    variant_id: variant_id.clone(),
                    completed: progress.completed(),
                    total: progress.total(),
                });
            }
        }
    });

    let result = downloader
        .download(url, dest, Arc::clone(&progress), cancel.clone())
        .await;
    reporter.abort();

    if result.is_ok() {
        let _ = events.send(Event::DownloadProgress {
            variant_id: variant_id.to_string(),
            completed: progress.completed(),
            total: progress.total(),
        });
        tracing::debug!(
            variant = variant_id,
            size = %format_bytes(progress.completed()),
            "Transfer complete"
        );
    }
    result
}
