//! Watch page extraction against recorded fixtures
//!
//! A fixture-backed downloader stands in for the network. Each test gets its
//! own signature decryptor so the player download can be counted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tubesync_core::extractor::{
    Downloader, SignatureDecryptor, StreamExtractor, StreamInfo, StreamKind, StreamType, YoutubeStreamExtractor,
};
use tubesync_core::TubeSyncError;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const PAGE_URL: &str = "https://youtu.be/jZViOEv90dI?t=1m30s";
const WATCH_URL: &str = "https://www.youtube.com/watch?v=jZViOEv90dI";
const PLAYER_URL: &str = "https://www.youtube.com/yts/player.js";
const MANIFEST_URL: &str = "https://manifest.googlevideo.com/api/manifest/dash/signature/ACBD/expire/1500000000";

fn fixture(name: &str) -> String {
    let path = format!("{}/test_fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("missing fixture {}: {}", path, e))
}

struct FixtureDownloader {
    pages: HashMap<String, String>,
    hits: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl FixtureDownloader {
    fn new(pages: &[(&str, String)]) -> Arc<Self> {
        Arc::new(Self {
            pages: pages.iter().map(|(url, body)| (url.to_string(), body.clone())).collect(),
            hits: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
        })
    }

    fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Downloader for FixtureDownloader {
    async fn download(&self, url: &str) -> tubesync_core::Result<String> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.hits.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| TubeSyncError::http(404, Some(url.to_string())))
    }
}

fn watch_site() -> Arc<FixtureDownloader> {
    FixtureDownloader::new(&[
        (WATCH_URL, fixture("watch.html")),
        (PLAYER_URL, fixture("player.js")),
        (MANIFEST_URL, fixture("manifest.mpd")),
    ])
}

async fn extract(downloader: Arc<FixtureDownloader>) -> tubesync_core::Result<StreamInfo> {
    let extractor =
        YoutubeStreamExtractor::fetch_with_decryptor(PAGE_URL, downloader, Arc::new(SignatureDecryptor::new())).await?;
    StreamInfo::extract(&extractor).await
}

#[tokio::test]
async fn test_watch_page_extraction() -> TestResult {
    let downloader = watch_site();
    let info = extract(Arc::clone(&downloader)).await?;

    let errors: Vec<_> = info.errors.iter().map(|e| format!("{}: {}", e.field, e.message)).collect();
    assert!(errors.is_empty(), "unexpected field errors: {:?}", errors);

    assert_eq!(info.id, "jZViOEv90dI");
    assert_eq!(info.page_url, PAGE_URL);
    assert_eq!(info.stream_type, StreamType::VideoStream);
    assert_eq!(info.title, "Building a Download Engine");
    assert_eq!(info.age_limit, 0);

    assert_eq!(info.uploader.as_deref(), Some("Henning"));
    assert_eq!(info.duration, Some(247));
    assert_eq!(info.view_count, Some(1024));
    assert_eq!(info.upload_date.as_deref(), Some("2017-03-02"));
    assert_eq!(info.start_position, Some(90));
    assert_eq!(info.average_rating.as_deref(), Some("4.9"));
    assert_eq!(info.like_count, Some(1234));
    assert_eq!(info.dislike_count, Some(56));
    assert_eq!(
        info.thumbnail_url.as_deref(),
        Some("https://i.ytimg.com/vi/jZViOEv90dI/maxresdefault.jpg")
    );
    assert_eq!(
        info.uploader_thumbnail_url.as_deref(),
        Some("https://yt3.ggpht.com/-example/photo.jpg")
    );
    assert!(info.description.as_deref().unwrap_or_default().contains("<b>resumable</b>"));

    assert_eq!(info.next_video.as_ref().map(|v| v.id.as_str()), Some("AAAAAAAAAAA"));
    let related: Vec<_> = info.related_videos.iter().map(|v| v.id.as_str()).collect();
    assert_eq!(related, vec!["BBBBBBBBBBB", "CCCCCCCCCCC"]);
    assert_eq!(info.related_videos[1].view_count, 42);
    Ok(())
}

#[tokio::test]
async fn test_signatures_applied_to_stream_urls() -> TestResult {
    let downloader = watch_site();
    let info = extract(Arc::clone(&downloader)).await?;

    let video: Vec<_> = info.video_streams.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(
        video,
        vec![
            "https://r4.googlevideo.com/videoplayback?itag=22&id=x&signature=S22",
            "https://r4.googlevideo.com/videoplayback?itag=18&signature=acbd",
        ]
    );
    assert_eq!(info.video_streams[0].resolution(), Some("720p"));
    assert!(info.video_streams.iter().all(|s| s.kind == StreamKind::Video));

    assert_eq!(info.video_only_streams.len(), 1);
    assert_eq!(
        info.video_only_streams[0].url,
        "https://r4.googlevideo.com/videoplayback?itag=137&signature=ACBD"
    );
    assert_eq!(info.video_only_streams[0].resolution(), Some("1080p"));

    assert_eq!(info.dash_mpd_url.as_deref(), Some(MANIFEST_URL));
    let audio: Vec<_> = info.audio_streams.iter().map(|s| s.url.as_str()).collect();
    assert!(audio.contains(&"https://r4.googlevideo.com/videoplayback?itag=140"));
    assert!(audio.contains(&"https://r4.googlevideo.com/videoplayback?itag=140&source=dash"));
    assert!(!audio.iter().any(|u| u.contains("itag=137")));

    // one player download serves every encrypted signature
    assert_eq!(downloader.hits(PLAYER_URL), 1);
    assert_eq!(downloader.hits(MANIFEST_URL), 1);
    Ok(())
}

#[tokio::test]
async fn test_unusable_video_entries_fail_video_streams() -> TestResult {
    let original = r#""url_encoded_fmt_stream_map":"itag=22&url=https%3A%2F%2Fr4.googlevideo.com%2Fvideoplayback%3Fitag%3D22%26id%3Dx&quality=hd720&sig=S22,itag=18&url=https%3A%2F%2Fr4.googlevideo.com%2Fvideoplayback%3Fitag%3D18&quality=medium&s=abcdef""#;
    // unknown itag, no itag at all, known itag without url
    let unusable = r#""url_encoded_fmt_stream_map":"itag=999&url=https%3A%2F%2Fr4.googlevideo.com%2Funknown,quality=broken,itag=22&quality=hd720""#;
    let page = fixture("watch.html");
    assert!(page.contains(original));
    let downloader = FixtureDownloader::new(&[
        (WATCH_URL, page.replace(original, unusable)),
        (PLAYER_URL, fixture("player.js")),
        (MANIFEST_URL, fixture("manifest.mpd")),
    ]);

    let extractor = YoutubeStreamExtractor::fetch_with_decryptor(
        WATCH_URL,
        downloader.clone(),
        Arc::new(SignatureDecryptor::new()),
    )
    .await?;
    let error = extractor.video_streams().await.unwrap_err();
    assert!(error.is_parsing_error());

    // the aggregator keeps going with the audio streams
    let info = StreamInfo::extract(&extractor).await?;
    assert!(info.video_streams.is_empty());
    assert!(!info.audio_streams.is_empty());
    let failure = info.errors.iter().find(|e| e.field == "video streams").expect("video streams error recorded");
    assert!(failure.error.is_parsing_error());
    Ok(())
}

#[tokio::test]
async fn test_blocked_content_reported() -> TestResult {
    let downloader = FixtureDownloader::new(&[(WATCH_URL, fixture("blocked.html"))]);
    let result = YoutubeStreamExtractor::fetch_with_decryptor(
        WATCH_URL,
        downloader.clone(),
        Arc::new(SignatureDecryptor::new()),
    )
    .await;

    match result {
        Err(TubeSyncError::ContentBlocked(reason)) => assert_eq!(reason, "GEMA"),
        other => panic!("expected a blocked content error, got {:?}", other.map(|e| e.player_url().to_string())),
    }
    assert_eq!(downloader.total.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_broken_player_keeps_plain_signatures() -> TestResult {
    let downloader = FixtureDownloader::new(&[
        (WATCH_URL, fixture("watch.html")),
        (PLAYER_URL, "var nothing = 1;".to_string()),
    ]);
    let extractor = YoutubeStreamExtractor::fetch_with_decryptor(
        WATCH_URL,
        downloader.clone(),
        Arc::new(SignatureDecryptor::new()),
    )
    .await?;
    assert_eq!(extractor.player_url(), PLAYER_URL);

    // the itag 18 entry needs decryption and is dropped, itag 22 survives
    let video = extractor.video_streams().await?;
    assert_eq!(video.len(), 1);
    assert!(video[0].url.ends_with("&signature=S22"));

    // nothing survives in the video-only list, so its decryption error surfaces
    let error = extractor.video_only_streams().await.unwrap_err();
    assert!(error.is_decryption_error());

    let info = StreamInfo::extract(&extractor).await?;
    assert!(info.has_errors());
    assert!(info.errors.iter().any(|e| e.error.is_decryption_error()));
    Ok(())
}

#[tokio::test]
async fn test_age_restricted_page_uses_video_info() -> TestResult {
    let video_info_url =
        "https://www.youtube.com/get_video_info?video_id=jZViOEv90dI&el=info&ps=default&eurl=&gl=US&hl=en";
    let downloader = FixtureDownloader::new(&[
        (WATCH_URL, fixture("watch_age.html")),
        (video_info_url, fixture("video_info.txt")),
        ("https://www.youtube.com/embed/jZViOEv90dI", fixture("embed.html")),
        (PLAYER_URL, fixture("player.js")),
    ]);
    let extractor = YoutubeStreamExtractor::fetch_with_decryptor(
        WATCH_URL,
        downloader.clone(),
        Arc::new(SignatureDecryptor::new()),
    )
    .await?;

    assert!(extractor.is_age_restricted());
    assert_eq!(extractor.player_url(), PLAYER_URL);
    assert_eq!(extractor.age_limit()?, 18);
    assert_eq!(extractor.title()?, "Restricted Talk");
    assert_eq!(extractor.duration()?, 61);
    assert_eq!(extractor.dash_mpd_url().await?, None);

    let info = StreamInfo::extract(&extractor).await?;
    let video: Vec<_> = info.video_streams.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(
        video,
        vec![
            "https://r4.googlevideo.com/videoplayback?itag=22&signature=AGE",
            "https://r4.googlevideo.com/videoplayback?itag=18&signature=acbd",
        ]
    );
    assert_eq!(info.audio_streams.len(), 1);
    assert_eq!(info.view_count, Some(77));
    assert_eq!(info.uploader.as_deref(), Some("Henning"));
    assert_eq!(downloader.hits(video_info_url), 1);
    Ok(())
}
