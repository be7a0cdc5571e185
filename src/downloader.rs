//! Segmented HTTP downloader
//!
//! Downloads one stream URL into one destination file by splitting the byte
//! range `[0, total)` into `concurrency` contiguous half-open segments and
//! fetching them in parallel with `Range` requests. Segments write to
//! disjoint offsets of a pre-sized file via positional writes, so no locking
//! is needed and the result is byte-identical to a sequential fetch.
//!
//! A size probe runs first. When the remote has no usable partial-content
//! support (no `Content-Range`, or 416 on the probe) the downloader falls
//! back to a single sequential stream transparently; callers cannot tell
//! the difference apart from concurrency.

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error, Result};
use crate::retry::retry_with_backoff;
use crate::utils::{extract_filename, format_bytes};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(unix)]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(windows)]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        written += n;
    }
    Ok(())
}

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(not(any(unix, windows)))]
fn write_all_at(_file: &std::fs::File, _buf: &[u8], _offset: u64) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "positional writes not supported on this platform",
    ))
}

/// A half-open byte range `[start, end)` owned by one worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Segment {
    /// Zero-based index within the task
    pub index: usize,
    /// Inclusive start byte
    pub start: u64,
    /// Exclusive end byte
    pub end: u64,
}

impl Segment {
    fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Partition `[0, total)` into up to `count` contiguous near-equal segments.
///
/// The last segment absorbs the remainder. When the file is smaller than
/// the requested count, fewer (non-empty) segments are produced.
pub(crate) fn partition(total: u64, count: usize) -> Vec<Segment> {
    // Compare in u64: on 32-bit targets `total as usize` would truncate
    // sizes past 4 GiB
    let count = (count as u64).min(total).max(1);
    let base = total / count;
    let mut segments = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * base;
        let end = if i == count - 1 { total } else { start + base };
        if start < end {
            segments.push(Segment {
                index: i as usize,
                start,
                end,
            });
        }
    }
    segments
}

/// Shared progress counters for one download task
///
/// `completed` is the aggregate bytes written across all segments; it only
/// counts bytes from attempts that have not been rolled back, so observers
/// see a consistent figure even through retries. `total` is set once the
/// probe learns the size (it stays 0 when the remote never reports one).
#[derive(Debug, Default)]
pub struct Progress {
    completed: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    /// Create a fresh progress handle
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bytes written so far
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Total bytes expected, or 0 when unknown
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Outcome of the size probe
#[derive(Debug)]
struct ProbeResult {
    /// Total stream size in bytes, when the remote reported one
    total: Option<u64>,
    /// Whether the remote honors `Range` requests
    accepts_ranges: bool,
}

/// Parse the total out of a `Content-Range` header ("bytes 0-0/12345")
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Downloads a single URL into a single file using parallel range segments
#[derive(Clone)]
pub struct SegmentedDownloader {
    client: reqwest::Client,
    concurrency: usize,
    retry: RetryConfig,
}

impl SegmentedDownloader {
    /// Create a downloader
    ///
    /// The client carries the per-attempt timeouts; `concurrency` is the
    /// number of parallel range segments per task.
    pub fn new(client: reqwest::Client, concurrency: usize, retry: RetryConfig) -> Self {
        Self {
            client,
            concurrency,
            retry,
        }
    }

    /// Download `url` into `dest`
    ///
    /// Probes the size, partitions the range, runs one worker per segment
    /// with bounded retries, and verifies the byte count at the end.
    /// Returns the number of bytes written. A failed task may leave a
    /// partial file at `dest` for diagnostics; it is never a valid result.
    ///
    /// # Errors
    ///
    /// [`DownloadError::SegmentsFailed`] when any segment exhausts its
    /// retries, [`DownloadError::HttpStatus`] for non-retryable statuses,
    /// [`Error::Cancelled`] when the token fires.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Arc<Progress>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let probe = self.probe(url).await?;
        tracing::debug!(
            url = url,
            total = ?probe.total,
            accepts_ranges = probe.accepts_ranges,
            "Probe complete"
        );

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest)?;

        match probe {
            ProbeResult {
                total: Some(total),
                accepts_ranges: true,
            } if total > 0 => {
                progress.total.store(total, Ordering::Relaxed);
                self.download_segmented(url, file, total, progress, cancel)
                    .await
            }
            ProbeResult { total, .. } => {
                tracing::info!(
                    url = url,
                    "Partial content unsupported, falling back to a single stream"
                );
                if let Some(total) = total {
                    progress.total.store(total, Ordering::Relaxed);
                }
                self.download_single_stream(url, file, total, progress, cancel)
                    .await
            }
        }
    }

    /// Probe the stream size with a one-byte ranged GET
    ///
    /// 206 with a parseable `Content-Range` means ranges are usable; 200
    /// means the remote ignored the range header; 416 means the probe range
    /// itself was rejected and the task falls back to a single stream.
    async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let response = retry_with_backoff(&self.retry, || async {
            let response = self
                .client
                .get(url)
                .header(RANGE, "bytes=0-0")
                .send()
                .await?;
            let status = response.status();
            if status.is_server_error() {
                return Err(Error::Download(DownloadError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                }));
            }
            Ok(response)
        })
        .await
        .map_err(|e| match e {
            Error::Download(d) => Error::Download(d),
            other => Error::Download(DownloadError::ProbeFailed {
                url: url.to_string(),
                reason: other.to_string(),
            }),
        })?;

        if let Some(name) = extract_filename(response.headers(), url) {
            tracing::debug!(url = url, filename = %name, "Remote filename");
        }

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total);
                Ok(ProbeResult {
                    total,
                    accepts_ranges: total.is_some(),
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(ProbeResult {
                total: None,
                accepts_ranges: false,
            }),
            s if s.is_success() => Ok(ProbeResult {
                total: response.content_length(),
                accepts_ranges: false,
            }),
            s => Err(Error::Download(DownloadError::HttpStatus {
                status: s.as_u16(),
                url: url.to_string(),
            })),
        }
    }

    async fn download_segmented(
        &self,
        url: &str,
        file: std::fs::File,
        total: u64,
        progress: Arc<Progress>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        file.set_len(total)?;
        let file = Arc::new(file);
        let segments = partition(total, self.concurrency);
        let segment_count = segments.len();
        // Set by the first segment that exhausts its retries so siblings
        // stop scheduling new attempts
        let task_failed = Arc::new(AtomicBool::new(false));

        tracing::debug!(
            url = url,
            total = total,
            segments = segment_count,
            "Starting segmented download"
        );

        let mut handles = Vec::with_capacity(segment_count);
        for segment in segments {
            let client = self.client.clone();
            let url = url.to_string();
            let file = Arc::clone(&file);
            let progress = Arc::clone(&progress);
            let retry = self.retry.clone();
            let cancel = cancel.clone();
            let task_failed = Arc::clone(&task_failed);

            handles.push(tokio::spawn(async move {
                run_segment(client, url, segment, file, progress, retry, cancel, task_failed).await
            }));
        }

        let mut failed = 0usize;
        let mut first_error: Option<DownloadError> = None;
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    failed += 1;
                    first_error.get_or_insert(DownloadError::SegmentsFailed {
                        failed: 1,
                        total: segment_count,
                        first_error: format!("worker panicked: {join_error}"),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(first_error) = first_error {
            return Err(Error::Download(DownloadError::SegmentsFailed {
                failed,
                total: segment_count,
                first_error: first_error.to_string(),
            }));
        }

        file.sync_all()?;
        let written = progress.completed();
        if written != total {
            return Err(Error::Download(DownloadError::SizeMismatch {
                expected: total,
                written,
            }));
        }
        tracing::debug!(url = url, size = %format_bytes(total), "Segmented download complete");
        Ok(total)
    }

    /// Sequential fallback for remotes without partial-content support
    ///
    /// Same retry budget and cancellation behavior as a segment; each
    /// attempt restarts from byte zero (the remote cannot resume).
    async fn download_single_stream(
        &self,
        url: &str,
        file: std::fs::File,
        expected_total: Option<u64>,
        progress: Arc<Progress>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let result = retry_with_backoff(&self.retry, || async {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut attempt_written = 0u64;
            // The token covers the whole attempt, so a cancel fires even
            // while the request itself is still pending
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = fetch_whole_stream(
                    &self.client,
                    url,
                    &file,
                    &progress,
                    &mut attempt_written,
                ) => result,
            };
            if result.is_err() {
                progress
                    .completed
                    .fetch_sub(attempt_written, Ordering::Relaxed);
            }
            result
        })
        .await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let written = result?;

        file.sync_all()?;
        if let Some(expected) = expected_total {
            if written != expected {
                return Err(Error::Download(DownloadError::SizeMismatch {
                    expected,
                    written,
                }));
            }
        }
        Ok(written)
    }
}

/// A single whole-file fetch attempt for the sequential fallback
async fn fetch_whole_stream(
    client: &reqwest::Client,
    url: &str,
    file: &std::fs::File,
    progress: &Progress,
    attempt_written: &mut u64,
) -> Result<u64> {
    let mut response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Download(DownloadError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }));
    }

    // A retried attempt starts over, so the file shrinks back to zero first
    file.set_len(0)?;
    let mut offset = 0u64;
    while let Some(chunk) = response.chunk().await? {
        write_all_at(file, &chunk, offset)?;
        offset += chunk.len() as u64;
        *attempt_written += chunk.len() as u64;
        progress
            .completed
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    Ok(offset)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// A server that honors `Range: bytes=a-b` requests with 206 responses,
    /// optionally failing the first `fail_first` data requests with 500.
    struct RangedServer {
        body: Vec<u8>,
        fail_first: AtomicU32,
    }

    impl RangedServer {
        fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                fail_first: AtomicU32::new(0),
            }
        }

        fn failing_first(body: Vec<u8>, failures: u32) -> Self {
            Self {
                body,
                fail_first: AtomicU32::new(failures),
            }
        }
    }

    fn parse_range(value: &str) -> Option<(u64, u64)> {
        let spec = value.strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }

    impl Respond for RangedServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let total = self.body.len() as u64;
            let range = request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range);

            let Some((start, end)) = range else {
                return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
            };

            // The one-byte probe always succeeds; only data requests fail
            let is_probe = start == 0 && end == 0;
            if !is_probe {
                let remaining = self.fail_first.load(Ordering::SeqCst);
                if remaining > 0
                    && self
                        .fail_first
                        .compare_exchange(
                            remaining,
                            remaining - 1,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                {
                    return ResponseTemplate::new(500);
                }
            }

            if start >= total {
                return ResponseTemplate::new(416);
            }
            let end = end.min(total - 1);
            let slice = self.body[start as usize..=end as usize].to_vec();
            ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {start}-{end}/{total}").as_str(),
                )
                .set_body_bytes(slice)
        }
    }

    /// A server that ignores `Range` entirely and always serves the whole body
    struct PlainServer {
        body: Vec<u8>,
    }

    impl Respond for PlainServer {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            ResponseTemplate::new(200).set_body_bytes(self.body.clone())
        }
    }

    /// A server that rejects every ranged request with 416 but serves plain GETs
    struct RangeRejectingServer {
        body: Vec<u8>,
    }

    impl Respond for RangeRejectingServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            if request.headers.get("range").is_some() {
                ResponseTemplate::new(416)
            } else {
                ResponseTemplate::new(200).set_body_bytes(self.body.clone())
            }
        }
    }

    fn test_body(len: usize) -> Vec<u8> {
        // Position-dependent pattern so any misplaced write is caught
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn downloader(concurrency: usize) -> SegmentedDownloader {
        SegmentedDownloader::new(reqwest::Client::new(), concurrency, fast_retry())
    }

    async fn mount(responder: impl Respond + 'static) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream.mp4"))
            .respond_with(responder)
            .mount(&server)
            .await;
        server
    }

    // -----------------------------------------------------------------------
    // Partitioning
    // -----------------------------------------------------------------------

    #[test]
    fn partition_covers_the_full_range_without_gaps() {
        let segments = partition(1_000_003, 4);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments.last().unwrap().end, 1_000_003);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "segments must be contiguous");
        }
    }

    #[test]
    fn partition_last_segment_absorbs_remainder() {
        let segments = partition(10, 3);
        assert_eq!(
            segments
                .iter()
                .map(|s| (s.start, s.end))
                .collect::<Vec<_>>(),
            vec![(0, 3), (3, 6), (6, 10)]
        );
    }

    #[test]
    fn partition_never_produces_empty_segments() {
        let segments = partition(2, 8);
        assert_eq!(segments.len(), 2);
        for s in &segments {
            assert!(s.start < s.end);
        }
    }

    #[test]
    fn partition_handles_totals_past_four_gib() {
        // The count comparison must happen in u64 so 32-bit targets do not
        // truncate the total
        let total = 5 * 1024 * 1024 * 1024u64;
        let segments = partition(total, 4);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments.last().unwrap().end, total);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn partition_single_segment() {
        let segments = partition(100, 1);
        assert_eq!(segments, vec![Segment { index: 0, start: 0, end: 100 }]);
    }

    #[test]
    fn content_range_total_parses() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    // -----------------------------------------------------------------------
    // Segmented downloads
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn segmented_download_is_byte_identical() {
        let body = test_body(1_000_000);
        let server = mount(RangedServer::new(body.clone())).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");
        let progress = Progress::new();

        let written = downloader(4)
            .download(
                &format!("{}/stream.mp4", server.uri()),
                &dest,
                Arc::clone(&progress),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(written, 1_000_000);
        assert_eq!(progress.completed(), 1_000_000);
        assert_eq!(progress.total(), 1_000_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn transient_segment_failures_are_retried_to_success() {
        let body = test_body(50_000);
        let server = mount(RangedServer::failing_first(body.clone(), 2)).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");

        let written = downloader(4)
            .download(
                &format!("{}/stream.mp4", server.uri()),
                &dest,
                Progress::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(written, 50_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_whole_task() {
        let body = test_body(10_000);
        // More failures than any retry budget can absorb
        let server = mount(RangedServer::failing_first(body, 1_000)).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");

        let err = downloader(2)
            .download(
                &format!("{}/stream.mp4", server.uri()),
                &dest,
                Progress::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::Download(DownloadError::SegmentsFailed { failed, total, .. }) => {
                assert!(failed >= 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected SegmentsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn not_found_fails_immediately_without_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");

        let err = downloader(4)
            .download(
                &format!("{}/stream.mp4", server.uri()),
                &dest,
                Progress::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::Download(DownloadError::HttpStatus { status, .. }) => {
                assert_eq!(status, 404)
            }
            other => panic!("expected HttpStatus(404), got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Single-stream fallback
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn range_ignoring_server_falls_back_to_single_stream() {
        let body = test_body(80_000);
        let server = mount(PlainServer { body: body.clone() }).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");
        let progress = Progress::new();

        let written = downloader(4)
            .download(
                &format!("{}/stream.mp4", server.uri()),
                &dest,
                Arc::clone(&progress),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(written, 80_000);
        assert_eq!(progress.completed(), 80_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn probe_416_falls_back_to_single_stream() {
        let body = test_body(30_000);
        let server = mount(RangeRejectingServer { body: body.clone() }).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");

        let written = downloader(4)
            .download(
                &format!("{}/stream.mp4", server.uri()),
                &dest,
                Progress::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(written, 30_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pre_cancelled_token_aborts_the_task() {
        let body = test_body(100_000);
        let server = mount(RangedServer::new(body)).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = downloader(4)
            .download(
                &format!("{}/stream.mp4", server.uri()),
                &dest,
                Progress::new(),
                cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled), "got {err:?}");
    }

    /// Probe requests answer instantly; data requests stall for `delay`
    /// before serving their slice.
    struct StallingServer {
        body: Vec<u8>,
        delay: Duration,
    }

    impl Respond for StallingServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let total = self.body.len() as u64;
            let range = request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range);
            let Some((start, end)) = range else {
                return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
            };
            let end = end.min(total - 1);
            let slice = self.body[start as usize..=end as usize].to_vec();
            let template = ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {start}-{end}/{total}").as_str(),
                )
                .set_body_bytes(slice);
            if start == 0 && end == 0 {
                template
            } else {
                template.set_delay(self.delay)
            }
        }
    }

    #[tokio::test]
    async fn cancelling_mid_transfer_aborts_promptly() {
        let body = test_body(400_000);
        let server = mount(StallingServer {
            body,
            delay: Duration::from_secs(10),
        })
        .await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.mp4");

        let cancel = CancellationToken::new();
        let url = format!("{}/stream.mp4", server.uri());
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                downloader(4)
                    .download(&url, &dest, Progress::new(), cancel)
                    .await
            })
        };

        // Let the workers get stuck waiting on the stalled data responses
        tokio::time::sleep(Duration::from_millis(200)).await;
        let fired = std::time::Instant::now();
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got {err:?}");
        assert!(
            fired.elapsed() < Duration::from_secs(5),
            "cancellation waited out the stalled responses"
        );
    }
}

/// One worker: fetch a segment with bounded retries, writing to its
/// disjoint slice of the shared file.
///
/// Returns `Ok(())` both on success and when the attempt loop was aborted
/// by cancellation or a sibling failure; only a genuine retry exhaustion
/// on this segment produces an error, so the caller can attribute the
/// whole-task failure precisely.
#[allow(clippy::too_many_arguments)]
async fn run_segment(
    client: reqwest::Client,
    url: String,
    segment: Segment,
    file: Arc<std::fs::File>,
    progress: Arc<Progress>,
    retry: RetryConfig,
    cancel: CancellationToken,
    task_failed: Arc<AtomicBool>,
) -> std::result::Result<(), DownloadError> {
    let attempts = AtomicU32::new(0);
    let result = retry_with_backoff(&retry, || {
        attempts.fetch_add(1, Ordering::Relaxed);
        let client = client.clone();
        let url = url.clone();
        let file = Arc::clone(&file);
        let progress = Arc::clone(&progress);
        let cancel = cancel.clone();
        let task_failed = Arc::clone(&task_failed);
        async move {
            if cancel.is_cancelled() || task_failed.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let mut attempt_written = 0u64;
            // The token covers the whole attempt, so a cancel fires even
            // while the request itself is still pending
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = fetch_segment_once(
                    &client,
                    &url,
                    segment,
                    &file,
                    &progress,
                    &mut attempt_written,
                ) => result,
            };
            if result.is_err() {
                // Roll back this attempt's contribution so observers never
                // see double-counted bytes across retries
                progress
                    .completed
                    .fetch_sub(attempt_written, Ordering::Relaxed);
            }
            result
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        // Aborted by the token or a sibling's failure, not this segment's fault
        Err(Error::Cancelled) => Ok(()),
        Err(e) => {
            task_failed.store(true, Ordering::SeqCst);
            Err(DownloadError::SegmentExhausted {
                index: segment.index,
                start: segment.start,
                end: segment.end,
                attempts: attempts.load(Ordering::Relaxed),
                reason: e.to_string(),
            })
        }
    }
}

/// A single fetch attempt for one segment
async fn fetch_segment_once(
    client: &reqwest::Client,
    url: &str,
    segment: Segment,
    file: &std::fs::File,
    progress: &Progress,
    attempt_written: &mut u64,
) -> Result<()> {
    let range = format!("bytes={}-{}", segment.start, segment.end - 1);
    let mut response = client.get(url).header(RANGE, range).send().await?;
    let status = response.status();
    if status != StatusCode::PARTIAL_CONTENT {
        return Err(Error::Download(DownloadError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }));
    }

    let mut offset = segment.start;
    while let Some(chunk) = response.chunk().await? {
        if offset + chunk.len() as u64 > segment.end {
            return Err(Error::Download(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: format!("{url} (server sent more bytes than requested)"),
            }));
        }
        write_all_at(file, &chunk, offset)?;
        offset += chunk.len() as u64;
        *attempt_written += chunk.len() as u64;
        progress
            .completed
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }

    if offset != segment.end {
        // Truncated body is a transient fault, map it to a retryable kind
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            format!(
                "segment {} body truncated at byte {offset} of {}",
                segment.index, segment.end
            ),
        )));
    }
    tracing::trace!(
        segment = segment.index,
        bytes = segment.len(),
        "Segment complete"
    );
    Ok(())
}
