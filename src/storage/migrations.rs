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


//! Schema migrations
//!
//! The schema is applied at runtime so no database is needed at build time.
//! Each step runs in its own transaction and is recorded in `_migrations`.

use crate::error::Result;
use sqlx::{Executor, SqlitePool};
use tracing::debug;

struct Migration {
    id: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Applied steps are never edited.
const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "finished_missions",
        // `kind` is the one-letter mission kind
        sql: r#"
CREATE TABLE IF NOT EXISTS finished_missions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    url TEXT NOT NULL,
    bytes_downloaded INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    kind TEXT NOT NULL,
    UNIQUE(timestamp, path)
);
CREATE INDEX IF NOT EXISTS idx_finished_missions_timestamp ON finished_missions(timestamp);
"#,
    },
    Migration {
        id: 2,
        name: "finished_missions_path_index",
        // lookups by output file when checking for conflicts
        sql: "CREATE INDEX IF NOT EXISTS idx_finished_missions_path ON finished_missions(path);",
    },
];

/// Ids of every known migration, in order
pub fn versions() -> Vec<i64> {
    MIGRATIONS.iter().map(|m| m.id).collect()
}

/// Bring the schema up to date
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT id FROM _migrations")
        .fetch_all(pool)
        .await?;

    for migration in MIGRATIONS.iter().filter(|m| !applied.contains(&m.id)) {
        let mut tx = pool.begin().await?;
        (&mut *tx).execute(migration.sql).await?;
        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(migration.id)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(id = migration.id, name = migration.name, "applied migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_increasing() {
        let ids = versions();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_rerun_is_a_no_op() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);

        let indexes: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'finished_missions' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert!(indexes.contains(&"idx_finished_missions_path".to_string()));
    }
}
