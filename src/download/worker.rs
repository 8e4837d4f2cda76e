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


//! Download workers
//!
//! Block workers claim blocks until none are left and write each one at its
//! own offset. The fallback worker streams the whole resource sequentially for
//! servers that ignore ranges or hide the length.

use crate::download::codes::ERROR_HTTP_FORBIDDEN;
use crate::download::connection::{self, ByteRange};
use crate::download::mission::{retry_delay, BlockClaim, DownloadMission};
use crate::error::{Result, TubeSyncError};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What the worker loop should do after a failed attempt
enum Outcome {
    Retry,
    Stop,
}

/// Route an error: recovery, retry with backoff or mission failure
async fn handle_error(
    mission: &Arc<DownloadMission>,
    error: TubeSyncError,
    attempt: &mut u32,
    token: &CancellationToken,
) -> Outcome {
    if token.is_cancelled() || matches!(error, TubeSyncError::Cancelled) {
        return Outcome::Stop;
    }
    if error.triggers_recovery() {
        if mission.begin_recovery() {
            mission.spawn_recovery(ERROR_HTTP_FORBIDDEN).await;
        }
        return Outcome::Stop;
    }
    if error.is_retryable() && *attempt < mission.ctx.max_retry() {
        *attempt += 1;
        warn!(mission = %mission.name(), attempt = *attempt, error = %error, "download interrupted, retrying");
        tokio::select! {
            _ = tokio::time::sleep(retry_delay(*attempt)) => return Outcome::Retry,
            _ = token.cancelled() => return Outcome::Stop,
        }
    }
    mission.fail(&error).await;
    Outcome::Stop
}

async fn open_output(mission: &DownloadMission) -> Result<File> {
    Ok(tokio::fs::OpenOptions::new().write(true).open(mission.storage()).await?)
}

pub(crate) async fn run_blocks(mission: Arc<DownloadMission>, worker_id: usize, token: CancellationToken) {
    debug!(mission = %mission.name(), worker_id, "block worker started");
    let mut file = match open_output(&mission).await {
        Ok(file) => file,
        Err(e) => {
            mission.fail(&e).await;
            return;
        }
    };

    while !token.is_cancelled() {
        let Some(claim) = mission.claim().await else {
            mission.worker_finished(token).await;
            return;
        };

        let mut attempt = 0;
        loop {
            match download_block(&mission, &mut file, &claim, &token).await {
                Ok(()) => {
                    mission.release(claim.index, true).await;
                    break;
                }
                Err(e) => match handle_error(&mission, e, &mut attempt, &token).await {
                    Outcome::Retry => continue,
                    Outcome::Stop => {
                        mission.release(claim.index, false).await;
                        return;
                    }
                },
            }
        }
    }
}

async fn download_block(
    mission: &Arc<DownloadMission>,
    file: &mut File,
    claim: &BlockClaim,
    token: &CancellationToken,
) -> Result<()> {
    loop {
        let done = mission.block_done(claim.index).await;
        let mut position = claim.start + done;
        if position > claim.end {
            return Ok(());
        }

        let range = ByteRange::between(position as u64, claim.end as u64);
        let response = connection::open(&mission.ctx.client, mission.ctx.read_timeout, &claim.url, false, Some(range), None, token).await?;
        let mut response = connection::establish(response)?;

        if response.status().as_u16() == 416 {
            if done > 0 {
                // the server forgot the partial range; start the block over
                warn!(mission = %mission.name(), block = claim.index, "range rejected, restarting block");
                mission.record_progress(Some(claim.index), -done).await?;
                continue;
            }
            return Err(TubeSyncError::RangeNotSatisfiable);
        }
        if !connection::is_partial(&response) {
            return Err(TubeSyncError::http(response.status().as_u16(), Some(claim.url.clone())));
        }

        file.seek(SeekFrom::Start((claim.file_offset + position) as u64)).await?;
        while position <= claim.end {
            let Some(chunk) = connection::next_chunk(&mut response, mission.ctx.read_timeout, token).await? else {
                break;
            };
            let len = chunk.len().min((claim.end + 1 - position) as usize);
            file.write_all(&chunk[..len]).await?;
            position += len as i64;
            mission.record_progress(Some(claim.index), len as i64).await?;
        }
        file.flush().await?;

        if position <= claim.end {
            return Err(TubeSyncError::network_error("connection closed before the block ended", true));
        }
        return Ok(());
    }
}

pub(crate) async fn run_fallback(mission: Arc<DownloadMission>, token: CancellationToken) {
    debug!(mission = %mission.name(), "sequential worker started");
    let mut attempt = 0;
    loop {
        match download_sequential(&mission, &token).await {
            Ok(()) => {
                mission.worker_finished(token).await;
                return;
            }
            Err(e) => match handle_error(&mission, e, &mut attempt, &token).await {
                Outcome::Retry => continue,
                Outcome::Stop => return,
            },
        }
    }
}

async fn download_sequential(mission: &Arc<DownloadMission>, token: &CancellationToken) -> Result<()> {
    let claim = mission.fallback_claim().await.ok_or(TubeSyncError::ResourceGone)?;
    let mut resume = claim.resume;
    if claim.unknown_length && resume > 0 {
        mission.record_progress(None, -resume).await?;
        resume = 0;
    }

    let range = (resume > 0).then(|| ByteRange::from(resume as u64));
    let response = connection::open(&mission.ctx.client, mission.ctx.read_timeout, &claim.url, false, range, None, token).await?;
    let mut response = connection::establish(response)?;
    if response.status().as_u16() == 416 {
        return Err(TubeSyncError::RangeNotSatisfiable);
    }
    if resume > 0 && !connection::is_partial(&response) {
        debug!(mission = %mission.name(), "server ignored the range, starting over");
        mission.record_progress(None, -resume).await?;
        resume = 0;
    }

    let mut file = open_output(mission).await?;
    file.seek(SeekFrom::Start((claim.file_offset + resume) as u64)).await?;
    while let Some(chunk) = connection::next_chunk(&mut response, mission.ctx.read_timeout, token).await? {
        file.write_all(&chunk).await?;
        mission.record_progress(None, chunk.len() as i64).await?;
    }
    file.flush().await?;
    Ok(())
}
