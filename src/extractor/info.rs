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


//! Metadata assembly
//!
//! [`StreamInfo::extract`] drives an extractor through three phases:
//!
//! 1. **Required** - service id, page url, stream type, id, title, age limit.
//!    Any failure aborts and nothing is returned.
//! 2. **Streams** - manifest url, audio streams, audio streams from the DASH
//!    manifest, video streams, video-only streams. Each failure is recorded.
//!    The phase fails only if there is no audio, no video and no manifest.
//! 3. **Optional** - everything else, each failure recorded independently.
//!
//! Recorded failures end up in [`StreamInfo::errors`] so callers can show
//! partial results with a warning.

use crate::error::{Result, TubeSyncError};
use crate::extractor::stream::{dedup, StreamDescriptor};
use crate::extractor::StreamExtractor;
use crate::manifest::dash;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    None,
    VideoStream,
    AudioStream,
    LiveStream,
}

/// Linked video (next/related), a subset of `StreamInfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPreview {
    pub service_id: i32,
    pub url: String,
    pub id: String,
    pub title: String,
    pub uploader: String,
    pub view_count: u64,
    /// Seconds
    pub duration: u64,
    pub thumbnail_url: String,
}

/// A field that could not be resolved
#[derive(Debug, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
    #[serde(skip)]
    pub error: TubeSyncError,
}

/// Render-ready metadata for one video
#[derive(Debug, Serialize)]
pub struct StreamInfo {
    // required
    pub service_id: i32,
    pub id: String,
    pub page_url: String,
    pub stream_type: StreamType,
    pub title: String,
    pub age_limit: u32,

    // streams
    pub dash_mpd_url: Option<String>,
    pub audio_streams: Vec<StreamDescriptor>,
    pub video_streams: Vec<StreamDescriptor>,
    pub video_only_streams: Vec<StreamDescriptor>,

    // optional
    pub thumbnail_url: Option<String>,
    pub duration: Option<u64>,
    pub uploader: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
    pub uploader_thumbnail_url: Option<String>,
    pub start_position: Option<u64>,
    pub average_rating: Option<String>,
    pub like_count: Option<i64>,
    pub dislike_count: Option<i64>,
    pub next_video: Option<StreamPreview>,
    pub related_videos: Vec<StreamPreview>,

    pub errors: Vec<FieldError>,
}

impl StreamInfo {
    /// Run all three phases against `extractor`
    pub async fn extract(extractor: &dyn StreamExtractor) -> Result<StreamInfo> {
        let mut info = Self::extract_required(extractor)?;
        info.extract_streams(extractor).await?;
        info.extract_optional(extractor);
        debug!(id = %info.id, errors = info.errors.len(), "stream info assembled");
        Ok(info)
    }

    fn extract_required(extractor: &dyn StreamExtractor) -> Result<StreamInfo> {
        let service_id = extractor.service_id();
        let page_url = extractor.page_url().to_string();
        let stream_type = extractor.stream_type()?;
        let id = extractor.id()?;
        let title = extractor.title()?;
        let age_limit = extractor.age_limit()?;

        if stream_type == StreamType::None || page_url.is_empty() || id.is_empty() {
            return Err(TubeSyncError::parsing(
                "Some important stream information was not given",
            ));
        }

        Ok(StreamInfo {
            service_id,
            id,
            page_url,
            stream_type,
            title,
            age_limit,
            dash_mpd_url: None,
            audio_streams: Vec::new(),
            video_streams: Vec::new(),
            video_only_streams: Vec::new(),
            thumbnail_url: None,
            duration: None,
            uploader: None,
            description: None,
            view_count: None,
            upload_date: None,
            uploader_thumbnail_url: None,
            start_position: None,
            average_rating: None,
            like_count: None,
            dislike_count: None,
            next_video: None,
            related_videos: Vec::new(),
            errors: Vec::new(),
        })
    }

    async fn extract_streams(&mut self, extractor: &dyn StreamExtractor) -> Result<()> {
        match extractor.dash_mpd_url().await {
            Ok(url) => self.dash_mpd_url = url.filter(|u| !u.is_empty()),
            Err(e) => self.record("dash manifest url", e),
        }

        match extractor.audio_streams().await {
            Ok(streams) => self.audio_streams = streams,
            Err(e) => self.record("audio streams", e),
        }

        if let Some(manifest_url) = self.dash_mpd_url.clone() {
            match dash::audio_streams(extractor.downloader(), &manifest_url).await {
                Ok(streams) => self.audio_streams.extend(streams),
                Err(e) => self.record("dash audio streams", e),
            }
        }

        match extractor.video_streams().await {
            Ok(streams) => self.video_streams = streams,
            Err(e) => self.record("video streams", e),
        }

        match extractor.video_only_streams().await {
            Ok(streams) => self.video_only_streams = streams,
            Err(e) => self.record("video only streams", e),
        }

        self.audio_streams = dedup(std::mem::take(&mut self.audio_streams));
        self.video_streams = dedup(std::mem::take(&mut self.video_streams));
        self.video_only_streams = dedup(std::mem::take(&mut self.video_only_streams));

        // video-only streams are not playable on their own
        if self.video_streams.is_empty() && self.audio_streams.is_empty() && self.dash_mpd_url.is_none() {
            return Err(TubeSyncError::parsing(
                "Could not get any stream. See error variable to get further details.",
            ));
        }
        Ok(())
    }

    fn extract_optional(&mut self, extractor: &dyn StreamExtractor) {
        self.thumbnail_url = self.optional("thumbnail url", extractor.thumbnail_url());
        self.duration = self.optional("duration", extractor.duration());
        self.uploader = self.optional("uploader", extractor.uploader());
        self.description = self.optional("description", extractor.description());
        self.view_count = self.optional("view count", extractor.view_count());
        self.upload_date = self.optional("upload date", extractor.upload_date());
        self.uploader_thumbnail_url =
            self.optional("uploader thumbnail url", extractor.uploader_thumbnail_url());
        self.start_position = self.optional("start position", extractor.start_position());
        self.average_rating = self.optional("average rating", extractor.average_rating());
        self.like_count = self.optional("like count", extractor.like_count());
        self.dislike_count = self.optional("dislike count", extractor.dislike_count());
        self.next_video = self.optional("next video", extractor.next_video());
        self.related_videos = self
            .optional("related videos", extractor.related_videos())
            .unwrap_or_default();
    }

    fn optional<T>(&mut self, field: &'static str, value: Result<T>) -> Option<T> {
        match value {
            Ok(v) => Some(v),
            Err(e) => {
                self.record(field, e);
                None
            }
        }
    }

    fn record(&mut self, field: &'static str, error: TubeSyncError) {
        if error.is_decryption_error() {
            warn!(target: "tubesync::decryption", field, error = %error, "signature decryption failed");
        } else {
            debug!(field, error = %error, "field unavailable");
        }
        self.errors.push(FieldError {
            field,
            message: error.to_string(),
            error,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::client::Downloader;
    use crate::extractor::format::MediaFormat;
    use async_trait::async_trait;

    struct NoDownloads;

    #[async_trait]
    impl Downloader for NoDownloads {
        async fn download(&self, url: &str) -> Result<String> {
            Err(TubeSyncError::http(404, Some(url.to_string())))
        }
    }

    /// Extractor with canned answers; `None` fields fail
    struct Canned {
        title: Option<&'static str>,
        audio: Option<Vec<StreamDescriptor>>,
        video: Option<Vec<StreamDescriptor>>,
        downloader: NoDownloads,
    }

    fn miss<T>(what: &str) -> Result<T> {
        Err(TubeSyncError::parsing(format!("no {}", what)))
    }

    #[async_trait]
    impl StreamExtractor for Canned {
        fn service_id(&self) -> i32 {
            0
        }
        fn page_url(&self) -> &str {
            "https://www.youtube.com/watch?v=jZViOEv90dI"
        }
        fn downloader(&self) -> &dyn Downloader {
            &self.downloader
        }
        fn id(&self) -> Result<String> {
            Ok("jZViOEv90dI".into())
        }
        fn stream_type(&self) -> Result<StreamType> {
            Ok(StreamType::VideoStream)
        }
        fn title(&self) -> Result<String> {
            self.title.map(String::from).ok_or_else(|| TubeSyncError::parsing("no title"))
        }
        fn age_limit(&self) -> Result<u32> {
            Ok(0)
        }
        async fn dash_mpd_url(&self) -> Result<Option<String>> {
            Ok(None)
        }
        async fn audio_streams(&self) -> Result<Vec<StreamDescriptor>> {
            self.audio.clone().ok_or_else(|| TubeSyncError::parsing("no audio"))
        }
        async fn video_streams(&self) -> Result<Vec<StreamDescriptor>> {
            self.video.clone().ok_or_else(|| TubeSyncError::parsing("no video"))
        }
        async fn video_only_streams(&self) -> Result<Vec<StreamDescriptor>> {
            Ok(Vec::new())
        }
        fn thumbnail_url(&self) -> Result<String> {
            Ok("https://i.ytimg.com/t.jpg".into())
        }
        fn duration(&self) -> Result<u64> {
            Ok(10)
        }
        fn uploader(&self) -> Result<String> {
            miss("uploader")
        }
        fn description(&self) -> Result<String> {
            miss("description")
        }
        fn view_count(&self) -> Result<u64> {
            Ok(3)
        }
        fn upload_date(&self) -> Result<String> {
            Ok("2016-01-01".into())
        }
        fn uploader_thumbnail_url(&self) -> Result<String> {
            miss("uploader thumbnail")
        }
        fn start_position(&self) -> Result<u64> {
            Ok(0)
        }
        fn average_rating(&self) -> Result<String> {
            Ok("4.5".into())
        }
        fn like_count(&self) -> Result<i64> {
            Ok(1)
        }
        fn dislike_count(&self) -> Result<i64> {
            Ok(0)
        }
        fn next_video(&self) -> Result<StreamPreview> {
            miss("next video")
        }
        fn related_videos(&self) -> Result<Vec<StreamPreview>> {
            Ok(Vec::new())
        }
    }

    fn video() -> Vec<StreamDescriptor> {
        vec![
            StreamDescriptor::video("https://v/1?sig=a", MediaFormat::Mpeg4, "720p"),
            StreamDescriptor::video("https://v/1?sig=b", MediaFormat::Mpeg4, "720p"),
        ]
    }

    #[tokio::test]
    async fn test_optional_failures_are_collected() {
        let extractor = Canned {
            title: Some("Title"),
            audio: Some(Vec::new()),
            video: Some(video()),
            downloader: NoDownloads,
        };
        let info = StreamInfo::extract(&extractor).await.unwrap();
        assert_eq!(info.title, "Title");
        assert_eq!(info.video_streams.len(), 1, "equal-stats duplicates removed");
        assert_eq!(info.duration, Some(10));
        let fields: Vec<&str> = info.errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["uploader", "description", "uploader thumbnail url", "next video"]);
    }

    #[tokio::test]
    async fn test_required_failure_aborts() {
        let extractor = Canned {
            title: None,
            audio: Some(Vec::new()),
            video: Some(video()),
            downloader: NoDownloads,
        };
        assert!(StreamInfo::extract(&extractor).await.is_err());
    }

    #[tokio::test]
    async fn test_no_playable_stream_fails() {
        let extractor = Canned {
            title: Some("Title"),
            audio: None,
            video: None,
            downloader: NoDownloads,
        };
        let err = StreamInfo::extract(&extractor).await.unwrap_err();
        assert!(err.to_string().contains("Could not get any stream"));
    }

    #[tokio::test]
    async fn test_audio_only_is_enough() {
        let extractor = Canned {
            title: Some("Title"),
            audio: Some(vec![StreamDescriptor::audio("https://a/1", MediaFormat::M4a, 0, 0)]),
            video: None,
            downloader: NoDownloads,
        };
        let info = StreamInfo::extract(&extractor).await.unwrap();
        assert_eq!(info.audio_streams.len(), 1);
        assert_eq!(info.errors[0].field, "video streams");
    }
}
