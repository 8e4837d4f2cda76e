// TubeSync - Video Stream Extraction and Download Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! HLS media playlists with refreshable segment URLs
//!
//! Signed segment URLs expire. [`RefreshableHlsSource`] keeps an ordered map
//! from each segment's query-less base URL to its current signed URL. When a
//! segment request is rejected with 403 the playlist is fetched again and the
//! map is updated positionally, then the request is retried once.

use crate::error::{Result, TubeSyncError};
use crate::extractor::client::Downloader;
use async_trait::async_trait;
use m3u8_rs::Playlist;
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Segment URLs of a media playlist, resolved against `playlist_url`
pub fn segment_urls(playlist: &[u8], playlist_url: &str) -> Result<Vec<String>> {
    let media = match m3u8_rs::parse_playlist(playlist) {
        Ok((_, Playlist::MediaPlaylist(media))) => media,
        Ok((_, Playlist::MasterPlaylist(_))) => {
            return Err(TubeSyncError::manifest("expected a media playlist, got a master playlist"))
        }
        Err(e) => return Err(TubeSyncError::manifest(format!("failed to parse playlist: {:?}", e))),
    };

    let base = Url::parse(playlist_url).ok();
    media
        .segments
        .iter()
        .map(|segment| match &base {
            Some(base) if !segment.uri.starts_with("http") => base
                .join(&segment.uri)
                .map(|u| u.to_string())
                .map_err(TubeSyncError::from),
            _ => Ok(segment.uri.clone()),
        })
        .collect()
}

/// Stable per-segment key: the URL without its query
pub fn base_key(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

/// Produces the URL of the current signed playlist
#[async_trait]
pub trait PlaylistRefresher: Send + Sync {
    async fn latest_playlist_url(&self) -> Result<String>;
}

/// Segment source that swaps expired signed URLs for fresh ones
pub struct RefreshableHlsSource {
    downloader: Arc<dyn Downloader>,
    refresher: Arc<dyn PlaylistRefresher>,
    chunks: Vec<(String, String)>,
    is_error: bool,
}

impl RefreshableHlsSource {
    pub fn new(downloader: Arc<dyn Downloader>, refresher: Arc<dyn PlaylistRefresher>) -> Self {
        Self {
            downloader,
            refresher,
            chunks: Vec::new(),
            is_error: false,
        }
    }

    /// Current signed URLs in playlist order
    pub fn segments(&self) -> Vec<&str> {
        self.chunks.iter().map(|(_, url)| url.as_str()).collect()
    }

    /// Fetch the latest playlist and fold its segments into the chunk map
    pub async fn refresh(&mut self) -> Result<()> {
        let playlist_url = self.refresher.latest_playlist_url().await?;
        let body = self.downloader.download(&playlist_url).await?;
        let fresh = segment_urls(body.as_bytes(), &playlist_url)?;
        self.apply(fresh)
    }

    fn apply(&mut self, fresh: Vec<String>) -> Result<()> {
        if !self.chunks.is_empty() {
            if self.chunks.len() != fresh.len() {
                return Err(TubeSyncError::PlaylistRefresh(format!(
                    "segment count changed from {} to {}",
                    self.chunks.len(),
                    fresh.len()
                )));
            }
            for ((_, current), url) in self.chunks.iter_mut().zip(fresh.iter()) {
                *current = url.clone();
            }
        }

        // keys that already exist keep their position
        for url in fresh {
            let key = base_key(&url).to_string();
            match self.chunks.iter_mut().find(|(k, _)| *k == key) {
                Some((_, current)) => *current = url,
                None => self.chunks.push((key, url)),
            }
        }
        debug!(segments = self.chunks.len(), "hls chunk map updated");
        Ok(())
    }

    /// Current signed URL for a segment URL, keyed by its base
    pub fn resolve(&self, url: &str) -> Result<String> {
        let key = base_key(url);
        self.chunks
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, current)| current.clone())
            .ok_or_else(|| TubeSyncError::PlaylistRefresh(format!("no segment mapped for {}", key)))
    }

    /// Open a segment, refreshing the playlist once on a 403
    pub async fn open(&mut self, client: &Client, url: &str) -> Result<Response> {
        let mut target = match self.resolve(url) {
            Ok(current) => current,
            Err(_) => url.to_string(),
        };

        loop {
            let response = client.get(&target).send().await?;
            let status = response.status();

            if status == StatusCode::FORBIDDEN && !self.is_error {
                warn!(segment = base_key(url), "segment rejected, refreshing playlist");
                self.refresh().await?;
                self.is_error = true;
                target = self.resolve(url)?;
                continue;
            }

            if !status.is_success() {
                return Err(TubeSyncError::http(status.as_u16(), Some(target)));
            }

            if self.is_error {
                info!(segment = base_key(url), "segment recovered after playlist refresh");
            }
            self.is_error = false;
            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:10.0,\nseg0.ts?sig=aaa\n#EXTINF:10.0,\nseg1.ts?sig=aaa\n#EXTINF:5.0,\nhttps://cdn.example.com/seg2.ts?sig=aaa\n#EXT-X-ENDLIST\n";

    struct Pages {
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Downloader for Pages {
        async fn download(&self, _url: &str) -> Result<String> {
            let mut bodies = self.bodies.lock().unwrap();
            Ok(bodies.remove(0))
        }
    }

    struct Fixed;

    #[async_trait]
    impl PlaylistRefresher for Fixed {
        async fn latest_playlist_url(&self) -> Result<String> {
            Ok("https://cdn.example.com/list/index.m3u8?token=1".to_string())
        }
    }

    fn source(bodies: Vec<String>) -> RefreshableHlsSource {
        RefreshableHlsSource::new(
            Arc::new(Pages {
                bodies: Mutex::new(bodies),
            }),
            Arc::new(Fixed),
        )
    }

    #[test]
    fn test_segment_urls_resolve_relative() {
        let urls = segment_urls(PLAYLIST.as_bytes(), "https://cdn.example.com/list/index.m3u8").unwrap();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example.com/list/seg0.ts?sig=aaa",
                "https://cdn.example.com/list/seg1.ts?sig=aaa",
                "https://cdn.example.com/seg2.ts?sig=aaa",
            ]
        );
    }

    #[test]
    fn test_base_key() {
        assert_eq!(base_key("https://a/b.ts?x=1&y=2"), "https://a/b.ts");
        assert_eq!(base_key("https://a/b.ts"), "https://a/b.ts");
    }

    #[tokio::test]
    async fn test_refresh_remaps_positionally() {
        let mut src = source(vec![PLAYLIST.to_string(), PLAYLIST.replace("sig=aaa", "sig=bbb")]);
        src.refresh().await.unwrap();
        assert_eq!(
            src.resolve("https://cdn.example.com/list/seg1.ts?sig=old").unwrap(),
            "https://cdn.example.com/list/seg1.ts?sig=aaa"
        );

        src.refresh().await.unwrap();
        assert_eq!(src.segments().len(), 3);
        assert_eq!(
            src.resolve("https://cdn.example.com/list/seg1.ts").unwrap(),
            "https://cdn.example.com/list/seg1.ts?sig=bbb"
        );
    }

    #[tokio::test]
    async fn test_refresh_fails_on_size_mismatch() {
        let shorter = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nseg0.ts?sig=ccc\n#EXT-X-ENDLIST\n";
        let mut src = source(vec![PLAYLIST.to_string(), shorter.to_string()]);
        src.refresh().await.unwrap();

        let err = src.refresh().await.unwrap_err();
        assert!(matches!(err, TubeSyncError::PlaylistRefresh(_)));
    }

    #[tokio::test]
    async fn test_unknown_segment_is_an_error() {
        let mut src = source(vec![PLAYLIST.to_string()]);
        src.refresh().await.unwrap();
        assert!(src.resolve("https://elsewhere.example.com/seg9.ts").is_err());
    }
}
