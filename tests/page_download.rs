//! Retry behaviour of the reqwest page downloader

mod common;

use common::{Reply, TestServer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tubesync_core::extractor::{ClientConfig, Downloader, HttpDownloader};
use tubesync_core::TubeSyncError;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn downloader(attempts: u32) -> HttpDownloader {
    let config = ClientConfig::default()
        .with_attempts(attempts)
        .with_backoff(Duration::from_millis(10));
    HttpDownloader::with_config(config).unwrap()
}

#[tokio::test]
async fn test_server_errors_are_retried() -> TestResult {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let server = TestServer::start(move |_| match counter.fetch_add(1, Ordering::SeqCst) {
        0 => Reply::new(500),
        1 => Reply::new(429),
        _ => Reply::new(200).body("<html>watch</html>"),
    })
    .await;

    let body = downloader(3).download(&server.url("/watch")).await?;
    assert_eq!(body, "<html>watch</html>");
    assert_eq!(server.count("GET", "/watch"), 3);

    let request = &server.requests()[0];
    assert_eq!(request.header("accept-language"), Some("en"));
    assert!(request.header("user-agent").unwrap_or_default().starts_with("Mozilla/5.0"));
    Ok(())
}

#[tokio::test]
async fn test_client_errors_fail_immediately() -> TestResult {
    let server = TestServer::start(|_| Reply::new(404)).await;

    match downloader(3).download(&server.url("/gone")).await {
        Err(TubeSyncError::HttpStatus { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected a 404, got {:?}", other),
    }
    assert_eq!(server.count("GET", "/gone"), 1);
    Ok(())
}

#[tokio::test]
async fn test_last_error_returned_when_attempts_run_out() -> TestResult {
    let server = TestServer::start(|_| Reply::new(503)).await;

    match downloader(2).download(&server.url("/busy")).await {
        Err(TubeSyncError::HttpStatus { status, .. }) => assert_eq!(status, 503),
        other => panic!("expected a 503, got {:?}", other),
    }
    assert_eq!(server.count("GET", "/busy"), 2);
    Ok(())
}
