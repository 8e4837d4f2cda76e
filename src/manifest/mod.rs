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


//! Manifest parsers
//!
//! - `dash` - audio representations of a DASH MPD document
//! - `hls` - segment lists of HLS media playlists, with expiry refresh

pub mod dash;
pub mod hls;

pub use dash::{audio_streams, parse_audio_streams};
pub use hls::{segment_urls, PlaylistRefresher, RefreshableHlsSource};
