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


//! Stream URL recovery
//!
//! Signed stream URLs expire. When a server answers 403, or a mission has no
//! URL for its current resource, the source page is resolved again and the
//! stream matching the mission's recovery info is selected. The new URL is
//! validated with `If-Range` against the stored `ETag`/`Last-Modified`; a
//! changed resource drops the progress of the current segment.

use crate::download::codes::{ERROR_NOTHING, ERROR_RESOURCE_GONE};
use crate::download::connection::{self, ByteRange};
use crate::download::mission::{
    join_tasks, retry_delay, DownloadMission, MissionContext, MissionRecoveryInfo, RecoverySelector, JOIN_TIMEOUT,
};
use crate::error::{Result, TubeSyncError};
use crate::extractor::client::Downloader;
use crate::extractor::stream::{StreamDescriptor, SubtitleDescriptor};
use crate::extractor::extract_stream_info;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fresh stream lists for a content page
#[derive(Debug, Clone, Default)]
pub struct ResolvedStreams {
    pub audio: Vec<StreamDescriptor>,
    pub video: Vec<StreamDescriptor>,
    pub video_only: Vec<StreamDescriptor>,
    pub subtitles: Vec<SubtitleDescriptor>,
}

impl ResolvedStreams {
    /// URL of the stream matching `info`, if it still exists
    pub fn select(&self, info: &MissionRecoveryInfo) -> Option<String> {
        match &info.selector {
            RecoverySelector::Audio { bitrate } => self
                .audio
                .iter()
                .find(|s| s.bitrate() == Some(*bitrate) && s.format == info.format)
                .map(|s| s.url.clone()),
            RecoverySelector::Video { resolution, video_only } => {
                let streams = if *video_only { &self.video_only } else { &self.video };
                streams
                    .iter()
                    .find(|s| s.resolution() == Some(resolution.as_str()) && s.format == info.format)
                    .map(|s| s.url.clone())
            }
            RecoverySelector::Subtitle { language, auto_generated } => self
                .subtitles
                .iter()
                .find(|s| {
                    &s.language_tag == language && s.auto_generated == *auto_generated && s.format == info.format
                })
                .map(|s| s.url.clone()),
        }
    }
}

/// Re-resolves a content page into stream lists
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, source: &str) -> Result<ResolvedStreams>;
}

/// Resolver backed by the stream extractor
pub struct ExtractorResolver {
    downloader: Arc<dyn Downloader>,
}

impl ExtractorResolver {
    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self { downloader }
    }
}

#[async_trait]
impl StreamResolver for ExtractorResolver {
    async fn resolve(&self, source: &str) -> Result<ResolvedStreams> {
        let info = extract_stream_info(source, Arc::clone(&self.downloader)).await?;
        Ok(ResolvedStreams {
            audio: info.audio_streams,
            video: info.video_streams,
            video_only: info.video_only_streams,
            subtitles: Vec::new(),
        })
    }
}

struct Target {
    source: String,
    info: MissionRecoveryInfo,
    length: i64,
    unknown_length: bool,
}

pub(crate) async fn run(
    mission: Arc<DownloadMission>,
    trigger: i32,
    workers: Vec<JoinHandle<()>>,
    token: CancellationToken,
) {
    if !join_tasks(workers, JOIN_TIMEOUT).await {
        warn!(mission = %mission.name(), "workers aborted before recovery");
    }

    let (target, current) = {
        let inner = mission.inner.lock().await;
        let state = &inner.state;
        let info = state.recovery.get(state.current).cloned().flatten();
        let target = match (&state.source, info) {
            (Some(source), Some(info)) => Some(Target {
                source: source.clone(),
                info,
                length: state.length,
                unknown_length: state.unknown_length,
            }),
            _ => None,
        };
        (target, state.current)
    };

    let (Some(resolver), Some(target)) = (mission.ctx.resolver.clone(), target) else {
        mission.end_recovery();
        mission
            .notify_error(trigger, Some("the stream can not be recovered".to_string()))
            .await;
        return;
    };

    info!(mission = %mission.name(), trigger, "resolving stream again");
    let mut attempt = 0;
    let recovered = loop {
        let result = tokio::select! {
            result = recover_url(&mission.ctx, resolver.as_ref(), &target, &token) => result,
            _ = token.cancelled() => Err(TubeSyncError::Cancelled),
        };

        match result {
            Ok(recovered) => break recovered,
            Err(_) if token.is_cancelled() => {
                mission.end_recovery();
                return;
            }
            Err(TubeSyncError::Cancelled) => {
                mission.end_recovery();
                return;
            }
            Err(e) => {
                attempt += 1;
                if attempt > mission.ctx.max_retry() {
                    mission.end_recovery();
                    mission.fail(&e).await;
                    return;
                }
                warn!(mission = %mission.name(), attempt, error = %e, "recovery failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay(attempt)) => {}
                    _ = token.cancelled() => {
                        mission.end_recovery();
                        return;
                    }
                }
            }
        }
    };

    let Some((url, stale)) = recovered else {
        {
            let mut inner = mission.inner.lock().await;
            if let Some(slot) = inner.state.urls.get_mut(current) {
                *slot = None;
            }
        }
        mission.end_recovery();
        mission
            .notify_error(ERROR_RESOURCE_GONE, Some("the stream is no longer offered".to_string()))
            .await;
        return;
    };

    {
        let mut inner = mission.inner.lock().await;
        if let Some(slot) = inner.state.urls.get_mut(current) {
            *slot = Some(url);
        }
        if stale {
            warn!(mission = %mission.name(), current, "resource changed, discarding its progress");
            inner.state.reset(false, ERROR_NOTHING);
        }
        if let Err(e) = mission.write_state(&inner.state).await {
            warn!(mission = %mission.name(), error = %e, "failed to persist mission");
        }
    }
    mission.end_recovery();
    info!(mission = %mission.name(), stale, "stream recovered");

    if !mission.is_running() || token.is_cancelled() {
        return;
    }
    mission.relaunch(token).await;
}

/// New URL and whether the resource behind it differs from the old one
async fn recover_url(
    ctx: &MissionContext,
    resolver: &dyn StreamResolver,
    target: &Target,
    token: &CancellationToken,
) -> Result<Option<(String, bool)>> {
    let streams = resolver.resolve(&target.source).await?;
    let Some(url) = streams.select(&target.info) else {
        return Ok(None);
    };
    let stale = is_stale(ctx, &url, target, token).await?;
    Ok(Some((url, stale)))
}

async fn is_stale(ctx: &MissionContext, url: &str, target: &Target, token: &CancellationToken) -> Result<bool> {
    let Some(condition) = target.info.validate_condition.as_deref() else {
        return Ok(false);
    };
    if target.unknown_length || target.length < 1 {
        return Ok(false);
    }

    let range = ByteRange::between((target.length - 10).max(0) as u64, target.length as u64);
    let response = connection::open(&ctx.client, ctx.read_timeout, url, true, Some(range), Some(condition), token).await?;
    match response.status().as_u16() {
        200 | 413 => Ok(true),
        206 => {
            let total = connection::total_length(&response);
            Ok(total >= 0 && total != target.length)
        }
        code => Err(TubeSyncError::http(code, Some(url.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::format::MediaFormat;

    fn streams() -> ResolvedStreams {
        ResolvedStreams {
            audio: vec![
                StreamDescriptor::audio("https://a/128", MediaFormat::M4a, 128_000, 44100),
                StreamDescriptor::audio("https://a/160", MediaFormat::Webma, 160_000, 48000),
            ],
            video: vec![StreamDescriptor::video("https://v/360", MediaFormat::Mpeg4, "360p")],
            video_only: vec![StreamDescriptor::video_only("https://vo/720", MediaFormat::Mpeg4, "720p")],
            subtitles: vec![SubtitleDescriptor {
                url: "https://s/en".to_string(),
                format: MediaFormat::Ttml,
                language_tag: "en".to_string(),
                auto_generated: false,
            }],
        }
    }

    #[test]
    fn test_select_audio_by_bitrate_and_format() {
        let info = MissionRecoveryInfo {
            selector: RecoverySelector::Audio { bitrate: 160_000 },
            format: MediaFormat::Webma,
            validate_condition: None,
        };
        assert_eq!(streams().select(&info).as_deref(), Some("https://a/160"));

        let wrong_format = MissionRecoveryInfo {
            format: MediaFormat::M4a,
            ..info
        };
        assert_eq!(streams().select(&wrong_format), None);
    }

    #[test]
    fn test_select_video_respects_video_only_flag() {
        let muxed = MissionRecoveryInfo {
            selector: RecoverySelector::Video {
                resolution: "720p".to_string(),
                video_only: false,
            },
            format: MediaFormat::Mpeg4,
            validate_condition: None,
        };
        assert_eq!(streams().select(&muxed), None);

        let video_only = MissionRecoveryInfo {
            selector: RecoverySelector::Video {
                resolution: "720p".to_string(),
                video_only: true,
            },
            ..muxed
        };
        assert_eq!(streams().select(&video_only).as_deref(), Some("https://vo/720"));
    }

    #[test]
    fn test_select_subtitle() {
        let info = MissionRecoveryInfo {
            selector: RecoverySelector::Subtitle {
                language: "en".to_string(),
                auto_generated: false,
            },
            format: MediaFormat::Ttml,
            validate_condition: None,
        };
        assert_eq!(streams().select(&info).as_deref(), Some("https://s/en"));

        let auto = MissionRecoveryInfo {
            selector: RecoverySelector::Subtitle {
                language: "en".to_string(),
                auto_generated: true,
            },
            ..info
        };
        assert_eq!(streams().select(&auto), None);
    }
}
