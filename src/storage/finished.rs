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


//! Store of completed downloads

use crate::error::{Result, TubeSyncError};
use crate::storage::Database;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::path::PathBuf;
use tracing::{debug, info};

/// A download that reached the finished state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedMission {
    /// Creation time of the mission, milliseconds since the epoch
    pub timestamp: i64,
    pub path: PathBuf,
    /// First source URL of the mission
    pub url: String,
    pub bytes_downloaded: i64,
    pub kind: char,
}

impl FinishedMission {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// SQLite-backed list of finished missions
#[derive(Debug, Clone)]
pub struct FinishedMissionStore {
    db: Database,
}

impl FinishedMissionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn add(&self, mission: &FinishedMission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO finished_missions (path, url, bytes_downloaded, timestamp, kind)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(mission.path.to_string_lossy().into_owned())
        .bind(&mission.url)
        .bind(mission.bytes_downloaded)
        .bind(mission.timestamp)
        .bind(mission.kind.to_string())
        .execute(self.db.pool())
        .await?;

        debug!(path = %mission.path.display(), "finished mission stored");
        Ok(())
    }

    /// All finished missions, newest first. Entries whose file is gone are purged.
    pub async fn load(&self) -> Result<Vec<FinishedMission>> {
        let rows = sqlx::query(
            "SELECT path, url, bytes_downloaded, timestamp, kind FROM finished_missions ORDER BY timestamp DESC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut missions = Vec::with_capacity(rows.len());
        for row in rows {
            let mission = Self::row_to_mission(row)?;
            if mission.path.is_file() {
                missions.push(mission);
            } else {
                info!(path = %mission.path.display(), "purging finished mission without file");
                self.delete(&mission).await?;
            }
        }
        Ok(missions)
    }

    /// Returns false when no row matched
    pub async fn delete(&self, mission: &FinishedMission) -> Result<bool> {
        let result = sqlx::query("DELETE FROM finished_missions WHERE timestamp = ? AND path = ?")
            .bind(mission.timestamp)
            .bind(mission.path.to_string_lossy().into_owned())
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every row and hand the freed pages back
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM finished_missions")
            .execute(self.db.pool())
            .await?;
        self.db.reclaim().await?;
        Ok(result.rows_affected())
    }

    /// Rewrite the row with the same timestamp
    pub async fn update(&self, mission: &FinishedMission) -> Result<()> {
        let result = sqlx::query(
            "UPDATE finished_missions SET path = ?, url = ?, bytes_downloaded = ?, kind = ? WHERE timestamp = ?",
        )
        .bind(mission.path.to_string_lossy().into_owned())
        .bind(&mission.url)
        .bind(mission.bytes_downloaded)
        .bind(mission.kind.to_string())
        .bind(mission.timestamp)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(TubeSyncError::RecordNotFound(format!(
                "Finished mission not found: {}",
                mission.timestamp
            )));
        }
        Ok(())
    }

    fn row_to_mission(row: sqlx::sqlite::SqliteRow) -> Result<FinishedMission> {
        let path: String = row.try_get("path")?;
        let kind: String = row.try_get("kind")?;

        Ok(FinishedMission {
            timestamp: row.try_get("timestamp")?,
            path: PathBuf::from(path),
            url: row.try_get("url")?,
            bytes_downloaded: row.try_get("bytes_downloaded")?,
            kind: kind.chars().next().unwrap_or('?'),
        })
    }
}
