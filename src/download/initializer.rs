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


//! Resource initialization
//!
//! Queries the current resource with HEAD requests to learn its length,
//! validator and range support, then builds the block table and pre-sizes the
//! output file. The first resource of a mission also queries every other URL
//! to estimate the final size.

use crate::download::codes::{ERROR_HTTP_FORBIDDEN, ERROR_HTTP_NO_CONTENT, ERROR_NOTHING};
use crate::download::connection::{self, ByteRange};
use crate::download::mission::{retry_delay, DownloadMission, MissionContext, BLOCK_SIZE};
use crate::error::{Result, TubeSyncError};
use reqwest::Response;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reserved head space when no resource length is known
const RESERVE_SPACE_DEFAULT: i64 = 5 * 1024 * 1024;
const RESERVE_SPACE_MAXIMUM: i64 = 150 * 1024 * 1024;

pub(crate) async fn run(mission: Arc<DownloadMission>, token: CancellationToken) {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            result = initialize(&mission, &token) => result,
            _ = token.cancelled() => Err(TubeSyncError::Cancelled),
        };

        match result {
            Ok(()) => {
                mission.relaunch(token).await;
                return;
            }
            Err(_) if token.is_cancelled() => return,
            Err(TubeSyncError::Cancelled) => return,
            Err(e) if e.triggers_recovery() => {
                if mission.begin_recovery() {
                    mission.spawn_recovery(ERROR_HTTP_FORBIDDEN).await;
                }
                return;
            }
            Err(e) if e.is_storage_error() || matches!(e, TubeSyncError::MissionFailed { .. }) => {
                mission.fail(&e).await;
                return;
            }
            Err(e) => {
                attempt += 1;
                if attempt > mission.ctx.max_retry() {
                    mission.fail(&e).await;
                    return;
                }
                warn!(mission = %mission.name(), attempt, error = %e, "initialization failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay(attempt)) => {}
                    _ = token.cancelled() => return,
                }
            }
        }
    }
}

async fn head(
    ctx: &MissionContext,
    url: &str,
    range: Option<ByteRange>,
    token: &CancellationToken,
) -> Result<Response> {
    let response = connection::open(&ctx.client, ctx.read_timeout, url, true, range, None, token).await?;
    if response.status().as_u16() == 204 {
        return Err(no_content());
    }
    connection::establish(response)
}

fn no_content() -> TubeSyncError {
    TubeSyncError::MissionFailed {
        code: ERROR_HTTP_NO_CONTENT,
        message: "the server returned no content".to_string(),
    }
}

async fn initialize(mission: &Arc<DownloadMission>, token: &CancellationToken) -> Result<()> {
    let (urls, current, thread_count, reserve_space) = {
        let mut inner = mission.inner.lock().await;
        if inner.state.current > 0 {
            inner.state.reset(false, ERROR_NOTHING);
        }
        let state = &inner.state;
        (
            state.urls.clone(),
            state.current,
            state.thread_count,
            state.algorithm().map(|a| a.reserve_space()).unwrap_or(false),
        )
    };
    let ctx = &mission.ctx;
    let url = urls
        .get(current)
        .cloned()
        .flatten()
        .ok_or(TubeSyncError::ResourceGone)?;

    let mut near_length = 0;
    let mut lowest = i64::MAX;
    let (length, condition) = if current == 0 {
        let mut first = (-1, None);
        for (i, candidate) in urls.iter().enumerate() {
            let Some(candidate) = candidate else { continue };
            let response = head(ctx, candidate, None, token).await?;
            let length = connection::content_length(&response);
            if i == 0 {
                first = (length, connection::validation_condition(&response));
            }
            if length > 0 {
                near_length += length;
                lowest = lowest.min(length);
            }
        }
        first
    } else {
        let response = head(ctx, &url, None, token).await?;
        (connection::content_length(&response), connection::validation_condition(&response))
    };

    if length == 0 {
        return Err(no_content());
    }

    let blocks = if length < 0 {
        Vec::new()
    } else {
        let tail = ByteRange::between((length - 10).max(0) as u64, length as u64);
        let response = head(ctx, &url, Some(tail), token).await?;
        if connection::is_partial(&response) && thread_count > 1 {
            let count = (length + BLOCK_SIZE - 1) / BLOCK_SIZE;
            vec![0; count as usize]
        } else {
            debug!(mission = %mission.name(), "range requests unsupported, downloading sequentially");
            Vec::new()
        }
    };

    let mut inner = mission.inner.lock().await;
    if inner.state.current != current {
        return Err(TubeSyncError::InvalidState("mission moved during initialization".to_string()));
    }
    let state = &mut inner.state;

    if current == 0 {
        if near_length > 0 {
            state.near_length = near_length;
        }
        if reserve_space {
            state.offsets[0] = if lowest == i64::MAX || lowest < 1 {
                RESERVE_SPACE_DEFAULT
            } else {
                lowest.min(RESERVE_SPACE_MAXIMUM)
            };
        }
    }

    if length < 0 {
        state.unknown_length = true;
        state.length = 0;
    } else {
        state.unknown_length = false;
        state.length = length;
    }

    let file = tokio::fs::OpenOptions::new().write(true).open(&state.storage).await?;
    file.set_len((state.offsets[current] + state.length) as u64).await?;

    if let Some(Some(recovery)) = state.recovery.get_mut(current) {
        recovery.validate_condition = condition;
    }
    state.fallback_resume_offset = 0;
    state.done = state.offsets[current] - state.offsets[0];

    info!(
        mission = %mission.name(),
        current,
        length = state.length,
        blocks = blocks.len(),
        "resource initialized"
    );
    state.blocks = Some(blocks);
    mission.write_state(&inner.state).await
}
