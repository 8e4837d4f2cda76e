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


//! Stream extraction pipeline
//!
//! # Modules
//! - `parser` - pattern matching and parameter-map helpers
//! - `format` - itag and container registry
//! - `stream` - stream descriptors and de-duplication
//! - `url_handler` - content URL to video id
//! - `client` - page downloader
//! - `signature` - signature transform derivation and evaluation
//! - `youtube` - watch page extractor
//! - `info` - metadata assembly

pub mod client;
pub mod format;
pub mod info;
pub mod parser;
pub mod signature;
pub mod stream;
pub mod url_handler;
pub mod youtube;

pub use client::{ClientConfig, Downloader, HttpDownloader};
pub use format::{ItagItem, ItagType, MediaFormat};
pub use info::{FieldError, StreamInfo, StreamPreview, StreamType};
pub use signature::{SignatureDecryptor, SignatureProgram};
pub use stream::{Quality, StreamDescriptor, StreamKind, SubtitleDescriptor};
pub use youtube::YoutubeStreamExtractor;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Per-service extractor, one instance per page
///
/// Stream accessors are async because signed URLs may need the signature
/// transform, which is downloaded on first use.
#[async_trait]
pub trait StreamExtractor: Send + Sync {
    fn service_id(&self) -> i32;
    fn page_url(&self) -> &str;
    fn downloader(&self) -> &dyn Downloader;

    fn id(&self) -> Result<String>;
    fn stream_type(&self) -> Result<StreamType>;
    fn title(&self) -> Result<String>;
    fn age_limit(&self) -> Result<u32>;

    /// `Ok(None)` when the page offers no manifest
    async fn dash_mpd_url(&self) -> Result<Option<String>>;
    async fn audio_streams(&self) -> Result<Vec<StreamDescriptor>>;
    async fn video_streams(&self) -> Result<Vec<StreamDescriptor>>;
    async fn video_only_streams(&self) -> Result<Vec<StreamDescriptor>>;

    fn thumbnail_url(&self) -> Result<String>;
    /// Seconds
    fn duration(&self) -> Result<u64>;
    fn uploader(&self) -> Result<String>;
    fn description(&self) -> Result<String>;
    fn view_count(&self) -> Result<u64>;
    fn upload_date(&self) -> Result<String>;
    fn uploader_thumbnail_url(&self) -> Result<String>;
    fn start_position(&self) -> Result<u64>;
    fn average_rating(&self) -> Result<String>;
    /// -1 when ratings are disabled
    fn like_count(&self) -> Result<i64>;
    fn dislike_count(&self) -> Result<i64>;
    fn next_video(&self) -> Result<StreamPreview>;
    fn related_videos(&self) -> Result<Vec<StreamPreview>>;
}

/// Fetch a page and assemble its metadata
pub async fn extract_stream_info(url: &str, downloader: Arc<dyn Downloader>) -> Result<StreamInfo> {
    let extractor = YoutubeStreamExtractor::fetch(url, downloader).await?;
    StreamInfo::extract(&extractor).await
}
