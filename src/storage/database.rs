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


//! SQLite store behind the finished-missions list
//!
//! The host application picks the file, usually next to the pending
//! directory. Tests use [`Database::new_in_memory`].
//!
//! Connections run in WAL mode with normal synchronous writes, and pages
//! freed by forgotten missions are reclaimed incrementally.

use crate::error::{Result, TubeSyncError};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous},
    ConnectOptions,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    /// `None` for in-memory databases
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file and bring its schema up to date
    ///
    /// Missing parent directories are created.
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let path = database_path.as_ref().to_path_buf();

        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TubeSyncError::PathCreation(format!("{}: {}", parent.display(), e))
                })?;
            }
            _ => {}
        }

        let options = tuned(SqliteConnectOptions::new().filename(&path).create_if_missing(true));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(BUSY_TIMEOUT)
            .connect_with(options)
            .await?;

        Self::open(pool, Some(path)).await
    }

    /// Private database for tests
    pub async fn new_in_memory() -> Result<Self> {
        let options = tuned(SqliteConnectOptions::from_str("sqlite::memory:")?);
        // every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::open(pool, None).await
    }

    async fn open(pool: SqlitePool, path: Option<PathBuf>) -> Result<Self> {
        // only takes effect before the first table exists
        sqlx::query("PRAGMA auto_vacuum = INCREMENTAL").execute(&pool).await?;

        let db = Self { pool, path };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply pending schema migrations. Runs automatically on open.
    pub async fn migrate(&self) -> Result<()> {
        crate::storage::migrations::run_migrations(&self.pool)
            .await
            .map_err(|e| TubeSyncError::DatabaseError(format!("migration failed: {}", e)))
    }

    /// Give free pages back to the filesystem
    pub async fn reclaim(&self) -> Result<()> {
        sqlx::query("PRAGMA incremental_vacuum").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Wait for active connections and close the pool
    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn tuned(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .disable_statement_logging()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::new_in_memory().await.unwrap();
        assert!(db.path().is_none());

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert!(tables.contains(&"_migrations".to_string()));
        assert!(tables.contains(&"finished_missions".to_string()));
        db.reclaim().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("downloads.db");

        let db = Database::new(&path).await.unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        db.close().await.unwrap();

        // recorded migrations are not applied twice
        let db = Database::new(&path).await.unwrap();
        let applied: Vec<i64> = sqlx::query_scalar("SELECT id FROM _migrations ORDER BY id")
            .fetch_all(db.pool())
            .await
            .unwrap();
        assert_eq!(applied, crate::storage::migrations::versions());
    }
}
