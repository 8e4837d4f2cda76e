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


//! Stream descriptors
//!
//! Two equalities: `equal_stats` compares format and quality only (signed URLs
//! rotate between requests), `==` also compares the URL.

use crate::extractor::format::MediaFormat;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Audio,
    Video,
    VideoOnly,
}

/// Bitrate for audio, resolution label for video
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quality {
    Bitrate(u32),
    Resolution(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub url: String,
    pub format: MediaFormat,
    pub quality: Quality,
    pub sampling_rate: Option<u32>,
}

impl StreamDescriptor {
    pub fn audio<S: Into<String>>(url: S, format: MediaFormat, bitrate: u32, sampling_rate: u32) -> Self {
        Self {
            kind: StreamKind::Audio,
            url: url.into(),
            format,
            quality: Quality::Bitrate(bitrate),
            sampling_rate: Some(sampling_rate),
        }
    }

    pub fn video<S: Into<String>, R: Into<String>>(url: S, format: MediaFormat, resolution: R) -> Self {
        Self {
            kind: StreamKind::Video,
            url: url.into(),
            format,
            quality: Quality::Resolution(resolution.into()),
            sampling_rate: None,
        }
    }

    pub fn video_only<S: Into<String>, R: Into<String>>(url: S, format: MediaFormat, resolution: R) -> Self {
        Self {
            kind: StreamKind::VideoOnly,
            ..Self::video(url, format, resolution)
        }
    }

    /// Same kind, format and quality metrics; URL ignored
    pub fn equal_stats(&self, other: &StreamDescriptor) -> bool {
        self.kind == other.kind
            && self.format == other.format
            && self.quality == other.quality
            && self.sampling_rate == other.sampling_rate
    }

    pub fn bitrate(&self) -> Option<u32> {
        match self.quality {
            Quality::Bitrate(b) => Some(b),
            Quality::Resolution(_) => None,
        }
    }

    pub fn resolution(&self) -> Option<&str> {
        match &self.quality {
            Quality::Resolution(r) => Some(r),
            Quality::Bitrate(_) => None,
        }
    }
}

/// Subtitle track, only used when re-resolving subtitle missions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleDescriptor {
    pub url: String,
    pub format: MediaFormat,
    pub language_tag: String,
    pub auto_generated: bool,
}

/// Drop `equal_stats` duplicates, keeping the first of each
pub fn dedup(streams: Vec<StreamDescriptor>) -> Vec<StreamDescriptor> {
    let mut unique: Vec<StreamDescriptor> = Vec::with_capacity(streams.len());
    for stream in streams {
        if !unique.iter().any(|kept| kept.equal_stats(&stream)) {
            unique.push(stream);
        }
    }
    unique
}
