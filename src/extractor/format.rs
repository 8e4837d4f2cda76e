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


//! Format registry
//!
//! Two static tables: container formats (`MediaFormat`) and the itag table that
//! maps the site's numeric format ids to a kind, a container and a quality.
//! Lookups of unknown ids return `None`; callers skip those streams.

use serde::{Deserialize, Serialize};

/// Container/codec family of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaFormat {
    Mpeg4,
    V3gpp,
    Webm,
    M4a,
    Webma,
    Vtt,
    Ttml,
    Srt,
}

const ALL_FORMATS: [MediaFormat; 8] = [
    MediaFormat::Mpeg4,
    MediaFormat::V3gpp,
    MediaFormat::Webm,
    MediaFormat::M4a,
    MediaFormat::Webma,
    MediaFormat::Vtt,
    MediaFormat::Ttml,
    MediaFormat::Srt,
];

impl MediaFormat {
    /// Stable numeric id, also used in persisted recovery info
    pub fn id(&self) -> i32 {
        match self {
            Self::Mpeg4 => 0x0,
            Self::V3gpp => 0x1,
            Self::Webm => 0x2,
            Self::M4a => 0x3,
            Self::Webma => 0x4,
            Self::Vtt => 0x100,
            Self::Ttml => 0x101,
            Self::Srt => 0x102,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Mpeg4 => "MPEG-4",
            Self::V3gpp => "3GPP",
            Self::Webm | Self::Webma => "WebM",
            Self::M4a => "m4a",
            Self::Vtt => "WebVTT",
            Self::Ttml => "Timed Text Markup Language",
            Self::Srt => "SubRip file format",
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Mpeg4 => "mp4",
            Self::V3gpp => "3gp",
            Self::Webm | Self::Webma => "webm",
            Self::M4a => "m4a",
            Self::Vtt => "vtt",
            Self::Ttml => "ttml",
            Self::Srt => "srt",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Mpeg4 => "video/mp4",
            Self::V3gpp => "video/3gpp",
            Self::Webm => "video/webm",
            Self::M4a => "audio/mp4",
            Self::Webma => "audio/webm",
            Self::Vtt => "text/vtt",
            Self::Ttml => "application/ttml+xml",
            Self::Srt => "text/srt",
        }
    }

    /// Registry lookup by numeric id
    pub fn lookup(id: i32) -> Option<MediaFormat> {
        ALL_FORMATS.iter().copied().find(|f| f.id() == id)
    }

    /// First format with this MIME type
    pub fn from_mime_type(mime: &str) -> Option<MediaFormat> {
        let mime = mime.split(';').next().unwrap_or(mime).trim();
        ALL_FORMATS
            .iter()
            .copied()
            .find(|f| f.mime_type().eq_ignore_ascii_case(mime))
    }

    pub fn from_suffix(suffix: &str) -> Option<MediaFormat> {
        ALL_FORMATS
            .iter()
            .copied()
            .find(|f| f.suffix().eq_ignore_ascii_case(suffix))
    }
}

/// What an itag carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItagType {
    Audio,
    Video,
    VideoOnly,
}

/// One entry of the itag table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItagItem {
    pub id: u32,
    pub itag_type: ItagType,
    pub format: MediaFormat,
    /// Set for video and video-only entries
    pub resolution: Option<&'static str>,
    pub fps: u32,
    /// Audio entries only; 0 when the site does not publish it
    pub bitrate: u32,
    pub sampling_rate: u32,
}

impl ItagItem {
    const fn video(id: u32, itag_type: ItagType, format: MediaFormat, resolution: &'static str, fps: u32) -> Self {
        Self {
            id,
            itag_type,
            format,
            resolution: Some(resolution),
            fps,
            bitrate: 0,
            sampling_rate: 0,
        }
    }

    const fn audio(id: u32, format: MediaFormat, bitrate: u32, sampling_rate: u32) -> Self {
        Self {
            id,
            itag_type: ItagType::Audio,
            format,
            resolution: None,
            fps: 0,
            bitrate,
            sampling_rate,
        }
    }
}

static ITAG_TABLE: [ItagItem; 21] = [
    // video streams with sound
    ItagItem::video(17, ItagType::Video, MediaFormat::V3gpp, "144p", 12),
    ItagItem::video(18, ItagType::Video, MediaFormat::Mpeg4, "360p", 24),
    ItagItem::video(22, ItagType::Video, MediaFormat::Mpeg4, "720p", 24),
    ItagItem::video(36, ItagType::Video, MediaFormat::V3gpp, "240p", 24),
    ItagItem::video(37, ItagType::Video, MediaFormat::Mpeg4, "1080p", 24),
    ItagItem::video(38, ItagType::Video, MediaFormat::Mpeg4, "1080p", 24),
    ItagItem::video(43, ItagType::Video, MediaFormat::Webm, "360p", 24),
    ItagItem::video(44, ItagType::Video, MediaFormat::Webm, "480p", 24),
    ItagItem::video(45, ItagType::Video, MediaFormat::Webm, "720p", 24),
    ItagItem::video(46, ItagType::Video, MediaFormat::Webm, "1080p", 24),
    // audio, bitrate and sampling rate unpublished
    ItagItem::audio(249, MediaFormat::Webma, 0, 0),
    ItagItem::audio(250, MediaFormat::Webma, 0, 0),
    ItagItem::audio(171, MediaFormat::Webma, 0, 0),
    ItagItem::audio(140, MediaFormat::M4a, 0, 0),
    ItagItem::audio(251, MediaFormat::Webma, 0, 0),
    // adaptive video without sound
    ItagItem::video(160, ItagType::VideoOnly, MediaFormat::Mpeg4, "144p", 24),
    ItagItem::video(133, ItagType::VideoOnly, MediaFormat::Mpeg4, "240p", 24),
    ItagItem::video(134, ItagType::VideoOnly, MediaFormat::Mpeg4, "360p", 24),
    ItagItem::video(135, ItagType::VideoOnly, MediaFormat::Mpeg4, "480p", 24),
    ItagItem::video(136, ItagType::VideoOnly, MediaFormat::Mpeg4, "720p", 24),
    ItagItem::video(137, ItagType::VideoOnly, MediaFormat::Mpeg4, "1080p", 24),
];

/// Registry lookup by itag
pub fn itag_item(itag: u32) -> Option<&'static ItagItem> {
    ITAG_TABLE.iter().find(|item| item.id == itag)
}

pub fn is_itag_supported(itag: u32) -> bool {
    itag_item(itag).is_some()
}
