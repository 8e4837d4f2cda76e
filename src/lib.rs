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


//! TubeSync core
//!
//! Stream extraction for video pages (metadata, stream lists, signature
//! decryption, DASH/HLS manifests) and a multi-threaded, resumable download
//! engine with URL recovery and persistent scheduling.

pub mod config;
pub mod download;
pub mod error;
pub mod extractor;
pub mod logging;
pub mod manifest;
pub mod storage;

pub use config::{DownloadConfig, LogConfig, MemorySettings, SettingsProvider};
pub use download::{DownloadManager, DownloadMission, MissionMessage, MissionRequest, NetworkState};
pub use error::{Result, TubeSyncError};
pub use extractor::{extract_stream_info, StreamInfo};
