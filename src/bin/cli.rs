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


use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tubesync_core::config::{JsonFileSettings, LogConfig};
use tubesync_core::download::{
    format_bytes, generate_unique_name, DownloadManager, ExtractorResolver, MissionMessage, MissionRequest, StreamResolver,
};
use tubesync_core::extractor::{extract_stream_info, Downloader, HttpDownloader};
use tubesync_core::storage::Database;
use tubesync_core::{logging, DownloadConfig};

#[derive(Parser)]
#[command(name = "tubesync-cli")]
#[command(about = "TubeSync CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// Directory for the pending missions, finished store and settings
    #[arg(long, global = true, default_value = ".tubesync")]
    data_dir: PathBuf,

    /// Log filter, e.g. `debug` or `tubesync_core=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract stream information and print it as JSON
    Info {
        /// Video page URL
        url: String,
    },
    /// Download one or more resources into a single file
    Download {
        /// Resource URLs, downloaded back to back
        #[arg(required = true)]
        urls: Vec<String>,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        /// Output file name
        #[arg(short, long)]
        name: String,
        /// Worker count (0 uses the configured default)
        #[arg(short, long, default_value_t = 0)]
        threads: u32,
        /// Kind tag: a, v, s or ?
        #[arg(short, long, default_value_t = '?')]
        kind: char,
        /// Page the URLs came from, used to recover expired URLs
        #[arg(long)]
        source: Option<String>,
    },
    /// List pending missions
    Pending,
    /// List finished missions
    Finished,
}

async fn open_manager(data_dir: &Path, resolver: Option<Arc<dyn StreamResolver>>) -> anyhow::Result<Arc<DownloadManager>> {
    std::fs::create_dir_all(data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    let settings = JsonFileSettings::load(data_dir.join("settings.json"))?;
    let mut config = DownloadConfig::from_settings(&settings);
    config.pending_dir = data_dir.join("pending");

    let database = Database::new(data_dir.join("tubesync.db")).await?;
    Ok(DownloadManager::new(config, database, resolver).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level.clone(),
        directory: None,
    })?;

    match cli.command {
        Commands::Info { url } => {
            let downloader: Arc<dyn Downloader> = Arc::new(HttpDownloader::new()?);
            let info = extract_stream_info(&url, downloader).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Download {
            urls,
            dir,
            name,
            threads,
            kind,
            source,
        } => {
            let downloader: Arc<dyn Downloader> = Arc::new(HttpDownloader::new()?);
            let resolver: Arc<dyn StreamResolver> = Arc::new(ExtractorResolver::new(downloader));
            let manager = open_manager(&cli.data_dir, Some(resolver)).await?;

            std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            let name = if dir.join(&name).exists() {
                generate_unique_name(&dir, &name)?
            } else {
                name
            };

            let mut events = manager.subscribe();
            let count = urls.len();
            let mission = manager
                .start_mission(MissionRequest {
                    urls,
                    storage: dir.join(&name),
                    kind,
                    threads,
                    source,
                    postprocessing: None,
                    near_length: 0,
                    recovery: vec![None; count],
                })
                .await?;

            println!("Downloading {}", mission.storage().display());
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => bail!("scheduler stopped"),
                };
                if !Arc::ptr_eq(&event.mission, &mission) {
                    continue;
                }
                match event.message {
                    MissionMessage::Progress(progress) => println!("{}", progress.display_string()),
                    MissionMessage::Finished => {
                        println!("Finished: {}", mission.storage().display());
                        break;
                    }
                    MissionMessage::Error(code) => {
                        bail!("download failed: {}", tubesync_core::download::describe(code))
                    }
                    _ => {}
                }
            }
        }
        Commands::Pending => {
            let manager = open_manager(&cli.data_dir, None).await?;
            for mission in manager.pending_missions().await {
                let state = mission.snapshot().await;
                println!(
                    "{}  {}  {} of {}  {}",
                    state.timestamp,
                    state.storage.display(),
                    format_bytes(state.done.max(0) as u64),
                    format_bytes(state.total_length().max(0) as u64),
                    if state.err_code >= 0 {
                        tubesync_core::download::describe(state.err_code)
                    } else if state.enqueued {
                        "queued".to_string()
                    } else {
                        "paused".to_string()
                    }
                );
            }
        }
        Commands::Finished => {
            let manager = open_manager(&cli.data_dir, None).await?;
            for mission in manager.finished_missions().await {
                println!(
                    "{}  {}  {}  {}",
                    mission.timestamp,
                    mission.path.display(),
                    format_bytes(mission.bytes_downloaded.max(0) as u64),
                    mission.url
                );
            }
        }
    }

    Ok(())
}
