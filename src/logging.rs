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


//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level. With a log directory configured,
//! output goes to a daily-rolling file through a non-blocking writer.

use crate::config::LogConfig;
use crate::error::{Result, TubeSyncError};
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_FILE_NAME: &str = "tubesync.log";

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let default_level = config.level.clone().unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| TubeSyncError::PathCreation(format!("{}: {}", dir.display(), e)))?;

            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            let subscriber = Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        None => {
            let subscriber = Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };

    result.map_err(|e| TubeSyncError::ConfigurationError(e.to_string()))?;
    let _ = INITIALIZED.set(());
    Ok(())
}
