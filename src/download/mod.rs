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


//! Chunked, resumable download engine
//!
//! A [`DownloadMission`] downloads one or more resources into a single file
//! with several workers, survives restarts through its metadata file, and
//! re-resolves expired stream URLs. The [`DownloadManager`] schedules
//! missions under the network and queue policy.

pub mod codes;
pub mod connection;
mod initializer;
pub mod manager;
pub mod mission;
pub mod postprocessing;
pub mod progress;
pub mod recover;
mod worker;

pub use codes::{describe, error_code_for, keeps_enqueued};
pub use manager::{
    generate_unique_name, AnyMission, DownloadManager, MissionCheck, MissionItem, MissionIterator, NetworkState,
};
pub use mission::{
    DownloadMission, MissionContext, MissionEvent, MissionMessage, MissionRecoveryInfo, MissionRequest,
    MissionState, RecoverySelector, BLOCK_SIZE,
};
pub use postprocessing::{Postprocessing, PostprocessingSpec, TtmlConverter};
pub use progress::{format_bytes, MissionProgress, MissionStatus};
pub use recover::{ExtractorResolver, ResolvedStreams, StreamResolver};
