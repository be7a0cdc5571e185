//! End-to-end pipeline tests: mock provider + mock HTTP server + fake muxer

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use clip_dl::{
    Config, Event, MediaKind, MergeConfig, MetadataDocument, MetadataProvider, MetadataSource,
    Muxer, Result, SelectionPolicy, Session, Variant,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::assert_ok;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves any path with 206 ranged responses out of a fixed body per path.
struct RangedFileServer {
    files: Vec<(String, Vec<u8>)>,
}

impl Respond for RangedFileServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path().to_string();
        let Some((_, body)) = self.files.iter().find(|(p, _)| *p == path) else {
            return ResponseTemplate::new(404);
        };
        let total = body.len() as u64;

        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(s, e)| Some((s.parse::<u64>().ok()?, e.parse::<u64>().ok()?)));

        match range {
            Some((start, end)) if start < total => {
                let end = end.min(total - 1);
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {start}-{end}/{total}").as_str(),
                    )
                    .set_body_bytes(body[start as usize..=end as usize].to_vec())
            }
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(body.clone()),
        }
    }
}

/// Provider that hands back a pre-built document for any URL.
struct FixedProvider {
    document: MetadataDocument,
}

#[async_trait]
impl MetadataProvider for FixedProvider {
    async fn resolve(&self, _url: &str) -> Result<MetadataDocument> {
        Ok(self.document.clone())
    }
}

/// Muxer that concatenates video then audio bytes into the output.
struct ConcatMuxer;

#[async_trait]
impl Muxer for ConcatMuxer {
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        let mut merged = tokio::fs::read(video).await?;
        merged.extend(tokio::fs::read(audio).await?);
        tokio::fs::write(output, merged).await?;
        Ok(())
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

fn variant(id: &str, label: &str, bitrate: u64, url: String, kind: MediaKind) -> Variant {
    Variant {
        id: id.to_string(),
        label: label.to_string(),
        bitrate_bps: Some(bitrate),
        size_bytes: None,
        url,
        media_kind: kind,
    }
}

fn test_config(dirs: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.save_dir = dirs.path().join("downloads");
    config.download.temp_dir = dirs.path().join("temp");
    config.download.concurrency = 4;
    config.retry.initial_delay = std::time::Duration::from_millis(10);
    config.retry.max_delay = std::time::Duration::from_millis(50);
    config.retry.jitter = false;
    config
}

async fn serve(files: Vec<(String, Vec<u8>)>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(RangedFileServer { files })
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn split_tracks_download_and_merge_end_to_end() {
    let video_bytes = pattern(200_000, 1);
    let audio_bytes = pattern(40_000, 7);
    let server = serve(vec![
        ("/video/1080.m4s".to_string(), video_bytes.clone()),
        ("/audio/best.m4s".to_string(), audio_bytes.clone()),
    ])
    .await;

    let document = MetadataDocument::new(
        "dance clip #fyp #dance",
        vec![variant(
            "v1080",
            "1080p",
            1_200_000,
            format!("{}/video/1080.m4s", server.uri()),
            MediaKind::Video,
        )],
        vec![variant(
            "a128",
            "audio",
            128_000,
            format!("{}/audio/best.m4s", server.uri()),
            MediaKind::Audio,
        )],
    );

    let dirs = TempDir::new().unwrap();
    let config = test_config(&dirs);
    let session = Session::new(
        config.clone(),
        Arc::new(FixedProvider { document }),
        Arc::new(ConcatMuxer),
    )
    .unwrap();

    let summary = session
        .run(
            MetadataSource::Live("https://v.example/share/x".into()),
            &SelectionPolicy::default(),
        )
        .await
        .unwrap();

    assert!(summary.is_complete());
    assert_eq!(summary.succeeded(), 1);

    // Hashtags stripped from the output name, both tracks merged in order
    let output = config.download.save_dir.join("dance clip.mp4");
    let merged = std::fs::read(&output).unwrap();
    let mut expected = video_bytes;
    expected.extend(audio_bytes);
    assert_eq!(merged, expected);

    // Intermediates cleaned up after the merge
    let leftovers: Vec<_> = std::fs::read_dir(&config.download.temp_dir)
        .unwrap()
        .collect();
    assert!(leftovers.is_empty(), "temp dir should be empty: {leftovers:?}");

    // Live resolution persists the document for later replay
    assert!(
        config
            .download
            .save_dir
            .join("dance clip.metadata.json")
            .exists()
    );
}

#[tokio::test]
async fn progress_events_surface_byte_counts() {
    let body = pattern(120_000, 4);
    let server = serve(vec![("/clip.mp4".to_string(), body)]).await;

    let document = MetadataDocument::new(
        "observed",
        vec![variant(
            "v720",
            "720p",
            800_000,
            format!("{}/clip.mp4", server.uri()),
            MediaKind::Muxed,
        )],
        vec![],
    );

    let dirs = TempDir::new().unwrap();
    let mut config = test_config(&dirs);
    config.download.progress_interval = std::time::Duration::from_millis(25);
    let session = Session::new(
        config,
        Arc::new(FixedProvider { document }),
        Arc::new(ConcatMuxer),
    )
    .unwrap();

    let mut events = session.subscribe();
    let summary = session
        .run(
            MetadataSource::Live("https://v.example/share/x".into()),
            &SelectionPolicy::default(),
        )
        .await
        .unwrap();
    assert!(summary.is_complete());

    let mut last_progress = None;
    while let Ok(event) = events.try_recv() {
        if let Event::DownloadProgress {
            variant_id,
            completed,
            total,
        } = event
        {
            assert_eq!(variant_id, "v720");
            last_progress = Some((completed, total));
        }
    }

    // The transfer always reports at least its completion snapshot
    let (completed, total) = last_progress.expect("no progress events received");
    assert_eq!(completed, 120_000);
    assert_eq!(total, 120_000);
}

#[tokio::test]
async fn one_failing_variant_does_not_abort_siblings() {
    let good_bytes = pattern(60_000, 3);
    let server = serve(vec![("/video/720.mp4".to_string(), good_bytes.clone())]).await;

    let document = MetadataDocument::new(
        "two variants",
        vec![
            variant(
                "v720",
                "720p",
                800_000,
                format!("{}/video/720.mp4", server.uri()),
                MediaKind::Muxed,
            ),
            variant(
                "v1080",
                "1080p",
                1_200_000,
                format!("{}/video/missing.mp4", server.uri()),
                MediaKind::Muxed,
            ),
        ],
        vec![],
    );

    let dirs = TempDir::new().unwrap();
    let config = test_config(&dirs);
    let session = Session::new(
        config.clone(),
        Arc::new(FixedProvider { document }),
        Arc::new(ConcatMuxer),
    )
    .unwrap();

    let summary = session
        .run(
            MetadataSource::Live("https://v.example/share/x".into()),
            &SelectionPolicy {
                select_all: true,
                ..SelectionPolicy::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.failed(), 1);

    let good = summary.outcomes.iter().find(|o| o.label == "720p").unwrap();
    assert!(good.succeeded());
    assert_eq!(
        std::fs::read(config.download.save_dir.join("two variants_720p.mp4")).unwrap(),
        good_bytes
    );

    let bad = summary.outcomes.iter().find(|o| o.label == "1080p").unwrap();
    assert!(!bad.succeeded());
    assert!(
        bad.result.as_ref().unwrap_err().contains("404"),
        "failure should carry the status: {:?}",
        bad.result
    );
}

#[tokio::test]
async fn persisted_document_replays_like_a_live_one() {
    let body = pattern(30_000, 9);
    let server = serve(vec![("/clip.mp4".to_string(), body.clone())]).await;

    let document = MetadataDocument::new(
        "replayable",
        vec![variant(
            "v720",
            "720p",
            800_000,
            format!("{}/clip.mp4", server.uri()),
            MediaKind::Muxed,
        )],
        vec![],
    );

    let dirs = TempDir::new().unwrap();
    let meta_path = dirs.path().join("saved.metadata.json");
    document.save(&meta_path).await.unwrap();

    let config = test_config(&dirs);
    let session = Session::new(
        config.clone(),
        // Provider must never be consulted for a persisted source
        Arc::new(FixedProvider {
            document: MetadataDocument::new("wrong", vec![], vec![]),
        }),
        Arc::new(ConcatMuxer),
    )
    .unwrap();

    let summary = assert_ok!(
        session
            .run(
                MetadataSource::Persisted(meta_path),
                &SelectionPolicy::default(),
            )
            .await
    );

    assert!(summary.is_complete());
    assert_eq!(summary.title, "replayable");
    assert_eq!(
        std::fs::read(config.download.save_dir.join("replayable.mp4")).unwrap(),
        body
    );
}

#[tokio::test]
async fn no_merge_mode_keeps_raw_tracks() {
    let video_bytes = pattern(20_000, 2);
    let audio_bytes = pattern(8_000, 5);
    let server = serve(vec![
        ("/v.m4s".to_string(), video_bytes.clone()),
        ("/a.m4s".to_string(), audio_bytes.clone()),
    ])
    .await;

    let document = MetadataDocument::new(
        "raw tracks",
        vec![variant(
            "v",
            "720p",
            800_000,
            format!("{}/v.m4s", server.uri()),
            MediaKind::Video,
        )],
        vec![variant(
            "a",
            "audio",
            128_000,
            format!("{}/a.m4s", server.uri()),
            MediaKind::Audio,
        )],
    );

    let dirs = TempDir::new().unwrap();
    let mut config = test_config(&dirs);
    config.merge = MergeConfig {
        no_merge: true,
        keep_intermediates: false,
    };
    let session = Session::new(
        config.clone(),
        Arc::new(FixedProvider { document }),
        Arc::new(ConcatMuxer),
    )
    .unwrap();

    let summary = session
        .run(
            MetadataSource::Live("https://v.example/share/x".into()),
            &SelectionPolicy::default(),
        )
        .await
        .unwrap();

    assert!(summary.is_complete());
    let outputs: Vec<PathBuf> = summary.outcomes[0].result.clone().unwrap();
    assert_eq!(outputs.len(), 2, "both raw tracks should be reported");
    assert_eq!(std::fs::read(&outputs[0]).unwrap(), video_bytes);
    assert_eq!(std::fs::read(&outputs[1]).unwrap(), audio_bytes);
    assert!(
        !config.download.save_dir.join("raw tracks.mp4").exists(),
        "no merged output in no-merge mode"
    );
}
