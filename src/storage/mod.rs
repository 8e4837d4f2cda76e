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


//! Persistent storage
//!
//! Pending missions live as one JSON metadata file each (see
//! `download::mission`). Finished missions are kept in SQLite:
//! - `database` - connection pool and pragmas
//! - `migrations` - runtime schema migrations
//! - `finished` - the finished mission store

pub mod database;
pub mod finished;
pub mod migrations;

pub use database::Database;
pub use finished::{FinishedMission, FinishedMissionStore};
