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


//! Download mission state machine
//!
//! A mission downloads one or more resources (`urls`) back to back into a
//! single output file. Each resource is split into `BLOCK_SIZE` blocks that
//! workers claim from a shared table; servers without range support get a
//! single sequential worker instead.
//!
//! # Persistence
//! [`MissionState`] holds only the durable fields and is written as JSON to
//! the mission's metadata file while the state lock is held, so the file is
//! always a consistent snapshot. Tasks, tokens and claim flags are rebuilt
//! from it on load.
//!
//! # Block table
//! `blocks[i]` is the number of bytes already written for block `i`, or `-1`
//! once the block is complete. `blocks` is `None` until the initializer ran,
//! and empty in sequential mode.

use crate::config::{DownloadConfig, MAX_THREAD_COUNT};
use crate::download::codes::*;
use crate::download::connection;
use crate::download::postprocessing::{self, Postprocessing, PostprocessingSpec, PS_DONE, PS_HOLD, PS_READY, PS_RUNNING};
use crate::download::progress::{MissionProgress, MissionStatus, ProgressReporter};
use crate::download::recover::{self, StreamResolver};
use crate::download::{initializer, worker};
use crate::error::{Result, TubeSyncError};
use crate::extractor::format::MediaFormat;
use crate::extractor::stream::{StreamDescriptor, StreamKind, SubtitleDescriptor};
use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Unit of concurrent claim, download and retry
pub const BLOCK_SIZE: i64 = 512 * 1024;

/// Bound on waiting for tasks to stop
pub(crate) const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Selection criteria used to find a stream again after its URL expired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoverySelector {
    Audio { bitrate: u32 },
    Video { resolution: String, video_only: bool },
    Subtitle { language: String, auto_generated: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionRecoveryInfo {
    pub selector: RecoverySelector,
    pub format: MediaFormat,
    /// `ETag` or `Last-Modified` of the resource, set by the initializer
    #[serde(default)]
    pub validate_condition: Option<String>,
}

impl MissionRecoveryInfo {
    pub fn from_stream(stream: &StreamDescriptor) -> Self {
        let selector = match stream.kind {
            StreamKind::Audio => RecoverySelector::Audio {
                bitrate: stream.bitrate().unwrap_or(0),
            },
            StreamKind::Video | StreamKind::VideoOnly => RecoverySelector::Video {
                resolution: stream.resolution().unwrap_or_default().to_string(),
                video_only: stream.kind == StreamKind::VideoOnly,
            },
        };
        Self {
            selector,
            format: stream.format,
            validate_condition: None,
        }
    }

    pub fn from_subtitle(subtitle: &SubtitleDescriptor) -> Self {
        Self {
            selector: RecoverySelector::Subtitle {
                language: subtitle.language_tag.clone(),
                auto_generated: subtitle.auto_generated,
            },
            format: subtitle.format,
            validate_condition: None,
        }
    }

    /// One-letter kind tag: `a`, `v` or `s`
    pub fn kind(&self) -> char {
        match self.selector {
            RecoverySelector::Audio { .. } => 'a',
            RecoverySelector::Video { .. } => 'v',
            RecoverySelector::Subtitle { .. } => 's',
        }
    }
}

/// Everything needed to create a mission
#[derive(Debug, Clone)]
pub struct MissionRequest {
    pub urls: Vec<String>,
    /// Output file
    pub storage: PathBuf,
    /// `a` audio, `v` video, `s` subtitle, `?` generic
    pub kind: char,
    pub threads: u32,
    /// Content page the URLs were resolved from, needed for recovery
    pub source: Option<String>,
    pub postprocessing: Option<PostprocessingSpec>,
    /// Approximate final size, used until real lengths are known
    pub near_length: i64,
    /// One entry per URL
    pub recovery: Vec<Option<MissionRecoveryInfo>>,
}

/// Durable mission fields, serialized to the metadata file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionState {
    pub timestamp: i64,
    pub kind: char,
    pub storage: PathBuf,
    pub source: Option<String>,
    pub urls: Vec<Option<String>>,
    /// Byte offset of each resource in the output file
    pub offsets: Vec<i64>,
    pub current: usize,
    /// Length of the current resource
    pub length: i64,
    pub near_length: i64,
    /// Bytes written across all resources
    pub done: i64,
    pub blocks: Option<Vec<i64>>,
    pub thread_count: u32,
    pub unknown_length: bool,
    pub fallback_resume_offset: i64,
    pub err_code: i32,
    pub err_message: Option<String>,
    pub enqueued: bool,
    pub recovery: Vec<Option<MissionRecoveryInfo>>,
    pub postprocessing: Option<PostprocessingSpec>,
    pub ps_state: u8,
}

impl MissionState {
    fn new(request: MissionRequest, timestamp: i64) -> Self {
        let count = request.urls.len();
        let mut recovery = request.recovery;
        recovery.resize(count, None);

        Self {
            timestamp,
            kind: request.kind,
            storage: request.storage,
            source: request.source,
            urls: request.urls.into_iter().map(Some).collect(),
            offsets: vec![0; count],
            current: 0,
            length: 0,
            near_length: request.near_length,
            done: 0,
            blocks: None,
            thread_count: request.threads.clamp(1, MAX_THREAD_COUNT),
            unknown_length: false,
            fallback_resume_offset: 0,
            err_code: ERROR_NOTHING,
            err_message: None,
            enqueued: true,
            recovery,
            postprocessing: request.postprocessing,
            ps_state: PS_READY,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.blocks.is_some()
    }

    pub(crate) fn algorithm(&self) -> Option<Arc<dyn Postprocessing>> {
        self.postprocessing
            .as_ref()
            .and_then(|spec| postprocessing::algorithm(&spec.algorithm))
    }

    pub fn is_finished(&self) -> bool {
        self.current >= self.urls.len() && (self.postprocessing.is_none() || self.ps_state == PS_DONE)
    }

    pub fn is_ps_running(&self) -> bool {
        matches!(self.ps_state, PS_RUNNING | PS_HOLD)
    }

    /// Post-processing failed after it started modifying the output file
    pub fn is_ps_failed(&self) -> bool {
        matches!(self.err_code, ERROR_POSTPROCESSING | ERROR_POSTPROCESSING_STOPPED)
            && self.algorithm().map(|a| a.works_on_same_file()).unwrap_or(false)
    }

    pub fn is_corrupt(&self) -> bool {
        self.is_ps_failed() || self.err_code == ERROR_POSTPROCESSING_HOLD || self.is_finished()
    }

    pub fn has_invalid_storage(&self) -> bool {
        self.err_code == ERROR_PROGRESS_LOST || !self.storage.is_file()
    }

    /// Best known size of the whole output
    pub fn total_length(&self) -> i64 {
        if self.is_ps_running() || self.urls.is_empty() {
            return self.length.max(self.near_length);
        }
        let index = self.current.min(self.urls.len() - 1);
        let calculated = self.offsets[index] + self.length - self.offsets[0];
        calculated.max(self.near_length)
    }

    /// Size of block `index` of the current resource
    pub fn block_len(&self, index: usize) -> i64 {
        (self.length - index as i64 * BLOCK_SIZE).min(BLOCK_SIZE).max(0)
    }

    /// Bytes accounted for by the block table; equals `done` at every lock release
    pub fn accounted_done(&self) -> i64 {
        if self.current >= self.urls.len() {
            return self.done;
        }
        let base = self.offsets[self.current] - self.offsets[0];
        match &self.blocks {
            Some(blocks) if !blocks.is_empty() => {
                base + blocks
                    .iter()
                    .enumerate()
                    .map(|(i, b)| if *b < 0 { self.block_len(i) } else { *b })
                    .sum::<i64>()
            }
            _ => base + self.fallback_resume_offset,
        }
    }

    /// Drop progress of the current resource. `rollback` restarts from the first.
    pub fn reset(&mut self, rollback: bool, code: i32) {
        self.length = 0;
        self.err_code = code;
        self.err_message = None;
        self.unknown_length = false;
        self.fallback_resume_offset = 0;
        self.blocks = None;
        if rollback {
            self.current = 0;
        }
        self.done = match self.offsets.get(self.current) {
            Some(offset) => offset - self.offsets[0],
            None => 0,
        };
    }

    pub fn name(&self) -> String {
        self.storage
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Notification kinds published by missions
#[derive(Debug, Clone)]
pub enum MissionMessage {
    Progress(MissionProgress),
    Running,
    Paused,
    Finished,
    Error(i32),
    Deleted,
}

#[derive(Debug, Clone)]
pub struct MissionEvent {
    pub mission: Arc<DownloadMission>,
    pub message: MissionMessage,
}

/// Shared by all missions of one scheduler
pub struct MissionContext {
    pub(crate) client: Client,
    pub(crate) read_timeout: Duration,
    max_retry: AtomicU32,
    pub(crate) resolver: Option<Arc<dyn StreamResolver>>,
    events: mpsc::UnboundedSender<MissionEvent>,
}

impl MissionContext {
    pub fn new(
        config: &DownloadConfig,
        resolver: Option<Arc<dyn StreamResolver>>,
        events: mpsc::UnboundedSender<MissionEvent>,
    ) -> Result<Self> {
        Ok(Self {
            client: connection::build_client(config)?,
            read_timeout: config.read_timeout,
            max_retry: AtomicU32::new(config.max_retry),
            resolver,
            events,
        })
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry.load(Ordering::Relaxed)
    }

    pub fn set_max_retry(&self, attempts: u32) {
        self.max_retry.store(attempts, Ordering::Relaxed);
    }
}

/// A block handed to one worker
#[derive(Debug, Clone)]
pub(crate) struct BlockClaim {
    pub index: usize,
    /// First byte of the block within the resource
    pub start: i64,
    /// Last byte, inclusive
    pub end: i64,
    pub url: String,
    /// Where the resource starts in the output file
    pub file_offset: i64,
}

/// Sequential download parameters
#[derive(Debug, Clone)]
pub(crate) struct FallbackClaim {
    pub url: String,
    pub file_offset: i64,
    pub resume: i64,
    pub unknown_length: bool,
}

pub(crate) struct MissionInner {
    pub(crate) state: MissionState,
    acquired: Vec<bool>,
    threads: usize,
    next_persist: i64,
}

#[derive(Default)]
struct MissionTasks {
    workers: Vec<JoinHandle<()>>,
    /// Initializer, recovery or post-processing
    control: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

pub struct DownloadMission {
    metadata: PathBuf,
    storage: PathBuf,
    timestamp: i64,
    kind: char,
    pub(crate) inner: Mutex<MissionInner>,
    tasks: Mutex<MissionTasks>,
    running: AtomicBool,
    recovering: AtomicBool,
    finish_count: AtomicUsize,
    progress: std::sync::Mutex<ProgressReporter>,
    pub(crate) ctx: Arc<MissionContext>,
}

impl fmt::Debug for DownloadMission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadMission")
            .field("metadata", &self.metadata)
            .field("storage", &self.storage)
            .field("running", &self.is_running())
            .finish()
    }
}

impl DownloadMission {
    /// Create a mission and write its metadata file under `pending_dir`
    pub async fn create(request: MissionRequest, pending_dir: &Path, ctx: Arc<MissionContext>) -> Result<Arc<Self>> {
        if request.urls.is_empty() {
            return Err(TubeSyncError::invalid_input("a mission needs at least one URL"));
        }
        tokio::fs::create_dir_all(pending_dir)
            .await
            .map_err(|e| TubeSyncError::PathCreation(format!("{}: {}", pending_dir.display(), e)))?;

        let mut timestamp = chrono::Utc::now().timestamp_millis();
        let mut metadata = pending_dir.join(timestamp.to_string());
        while tokio::fs::try_exists(&metadata).await? {
            timestamp += 1;
            metadata = pending_dir.join(timestamp.to_string());
        }

        let mission = Self::from_state(metadata, MissionState::new(request, timestamp), ctx);
        mission.persist().await?;
        debug!(mission = %mission.name(), "mission created");
        Ok(mission)
    }

    /// Rebuild a mission from its metadata file
    pub async fn load(metadata: &Path, ctx: Arc<MissionContext>) -> Result<Arc<Self>> {
        let text = tokio::fs::read_to_string(metadata).await?;
        let state: MissionState = serde_json::from_str(&text)?;
        Ok(Self::from_state(metadata.to_path_buf(), state, ctx))
    }

    fn from_state(metadata: PathBuf, state: MissionState, ctx: Arc<MissionContext>) -> Arc<Self> {
        let mut reporter = ProgressReporter::new(state.name(), state.urls.len());
        let (done, length, resource) = progress_totals(&state);
        reporter.observe(done, length, resource);
        if state.is_finished() {
            reporter.set_status(MissionStatus::Finished);
        } else if state.err_code != ERROR_NOTHING {
            reporter.set_status(MissionStatus::Errored);
        }

        Arc::new(Self {
            storage: state.storage.clone(),
            timestamp: state.timestamp,
            kind: state.kind,
            metadata,
            inner: Mutex::new(MissionInner {
                state,
                acquired: Vec::new(),
                threads: 0,
                next_persist: 0,
            }),
            tasks: Mutex::new(MissionTasks::default()),
            running: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            finish_count: AtomicUsize::new(0),
            progress: std::sync::Mutex::new(reporter),
            ctx,
        })
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn kind(&self) -> char {
        self.kind
    }

    pub fn name(&self) -> String {
        self.storage
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Copy of the durable state
    pub async fn snapshot(&self) -> MissionState {
        self.inner.lock().await.state.clone()
    }

    pub fn progress(&self) -> Option<MissionProgress> {
        self.progress.lock().ok().map(|p| p.snapshot())
    }

    pub async fn set_enqueued(&self, enqueued: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state.enqueued = enqueued;
        self.write_state(&inner.state).await
    }

    /// Write the metadata file
    pub async fn persist(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        self.write_state(&inner.state).await
    }

    pub(crate) async fn write_state(&self, state: &MissionState) -> Result<()> {
        let json = serde_json::to_vec(state)?;
        tokio::fs::write(&self.metadata, json).await?;
        Ok(())
    }

    pub async fn delete_metadata(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.metadata).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn notify(self: &Arc<Self>, message: MissionMessage) {
        let _ = self.ctx.events.send(MissionEvent {
            mission: Arc::clone(self),
            message,
        });
    }

    fn set_status(&self, status: MissionStatus) {
        if let Ok(mut reporter) = self.progress.lock() {
            reporter.set_status(status);
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start or resume the mission
    ///
    /// Tasks of a previous run are joined first. A task that does not stop
    /// within the join timeout is aborted and the mission fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let handles = {
            let mut tasks = self.tasks.lock().await;
            take_handles(&mut tasks)
        };
        if !join_tasks(handles, JOIN_TIMEOUT).await {
            let message = "previous workers did not stop in time".to_string();
            self.notify_error(ERROR_UNKNOWN_EXCEPTION, Some(message.clone())).await;
            return Err(TubeSyncError::Timeout(message));
        }

        Arc::clone(self).launch(None).await;
        Ok(())
    }

    /// Spawn whatever the current state needs next. `parent` is the token of
    /// the task asking for the relaunch; a cancelled parent means a pause won.
    pub(crate) fn launch(self: Arc<Self>, parent: Option<CancellationToken>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().await;
            if parent.as_ref().map(|p| p.is_cancelled()).unwrap_or(false) {
                return;
            }
            if self.running.swap(true, Ordering::SeqCst) {
                return;
            }

            let mut inner = self.inner.lock().await;
            if inner.state.is_finished() || inner.state.urls.is_empty() {
                self.running.store(false, Ordering::SeqCst);
                return;
            }
            inner.state.err_code = ERROR_NOTHING;
            inner.state.err_message = None;

            let token = CancellationToken::new();
            tasks.cancel = token.clone();

            if inner.state.has_invalid_storage() {
                drop(inner);
                drop(tasks);
                let message = format!("output file missing: {}", self.storage.display());
                self.notify_error(ERROR_FILE_CREATION, Some(message)).await;
                return;
            }

            if inner.state.current >= inner.state.urls.len() {
                drop(inner);
                drop(tasks);
                self.advance(token).await;
                return;
            }

            info!(mission = %self.name(), current = inner.state.current, "mission running");
            self.set_status(MissionStatus::Running);
            self.notify(MissionMessage::Running);
            self.finish_count.store(0, Ordering::SeqCst);

            let current = inner.state.current;
            if inner.state.urls[current].is_none() {
                self.recovering.store(true, Ordering::SeqCst);
                tasks.control = Some(tokio::spawn(recover::run(
                    Arc::clone(&self),
                    ERROR_RESOURCE_GONE,
                    Vec::new(),
                    token,
                )));
                return;
            }

            let blocks = match inner.state.blocks.clone() {
                Some(blocks) => blocks,
                None => {
                    self.set_status(MissionStatus::Initializing);
                    tasks.control = Some(tokio::spawn(initializer::run(Arc::clone(&self), token)));
                    return;
                }
            };

            inner.acquired = vec![false; blocks.len()];
            inner.next_persist = inner.state.done + BLOCK_SIZE;

            if blocks.is_empty() {
                inner.threads = 1;
                tasks.workers = vec![tokio::spawn(worker::run_fallback(Arc::clone(&self), token))];
                return;
            }

            let remaining = blocks.iter().filter(|b| **b >= 0).count();
            if remaining == 0 {
                drop(inner);
                drop(tasks);
                self.advance(token).await;
                return;
            }

            let threads = (inner.state.thread_count as usize).min(remaining).max(1);
            inner.threads = threads;
            debug!(mission = %self.name(), threads, remaining, "spawning block workers");
            tasks.workers = (0..threads)
                .map(|id| tokio::spawn(worker::run_blocks(Arc::clone(&self), id, token.clone())))
                .collect();
        })
    }

    /// Move past a completed resource: next resource, post-processing or done
    async fn advance(self: &Arc<Self>, token: CancellationToken) {
        let mut tasks = self.tasks.lock().await;
        let mut inner = self.inner.lock().await;
        let state = &mut inner.state;

        if state.current < state.urls.len() {
            state.current += 1;
            if state.current < state.urls.len() {
                let current = state.current;
                state.offsets[current] = state.offsets[current - 1] + state.length;
                state.blocks = None;
                if let Err(e) = self.write_state(&inner.state).await {
                    warn!(mission = %self.name(), error = %e, "failed to persist mission");
                }
                if token.is_cancelled() || !self.is_running() {
                    return;
                }
                info!(mission = %self.name(), current, "resource complete, initializing next");
                self.set_status(MissionStatus::Initializing);
                tasks.control = Some(tokio::spawn(initializer::run(Arc::clone(self), token)));
                return;
            }
        }

        if inner.state.postprocessing.is_some() && inner.state.ps_state == PS_READY {
            if let Err(e) = self.write_state(&inner.state).await {
                warn!(mission = %self.name(), error = %e, "failed to persist mission");
            }
            if token.is_cancelled() || !self.is_running() {
                return;
            }
            tasks.control = Some(tokio::spawn(postprocessing::run(Arc::clone(self), token)));
            return;
        }

        drop(inner);
        drop(tasks);
        self.finish().await;
    }

    pub(crate) async fn finish(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.enqueued = false;
            inner.state.err_code = ERROR_NOTHING;
            let done = inner.state.done.max(0) as u64;
            let resource = inner.state.current.saturating_sub(1);
            if let Ok(mut reporter) = self.progress.lock() {
                reporter.observe(done, Some(done), resource);
            }
        }
        self.running.store(false, Ordering::SeqCst);

        if let Err(e) = self.delete_metadata().await {
            warn!(mission = %self.name(), error = %e, "failed to delete metadata");
        }
        info!(mission = %self.name(), "mission finished");
        self.set_status(MissionStatus::Finished);
        self.notify(MissionMessage::Finished);
    }

    /// Pause and wait for every task to stop
    pub async fn pause(self: &Arc<Self>) -> Result<()> {
        self.pause_with(Some(JOIN_TIMEOUT)).await
    }

    /// Pause without waiting for tasks
    pub async fn pause_now(self: &Arc<Self>) {
        let _ = self.pause_with(None).await;
    }

    /// Tasks still alive after `join_limit` are aborted and the mission fails
    pub(crate) async fn pause_with(self: &Arc<Self>, join_limit: Option<Duration>) -> Result<()> {
        if self.inner.lock().await.state.is_ps_running() {
            return Ok(());
        }

        let was_running = self.running.swap(false, Ordering::SeqCst);
        let handles = {
            let mut tasks = self.tasks.lock().await;
            tasks.cancel.cancel();
            take_handles(&mut tasks)
        };

        let joined = match join_limit {
            Some(limit) => join_tasks(handles, limit).await,
            None => true,
        };
        self.recovering.store(false, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock().await;
            if !inner.state.is_initialized() && inner.state.current < inner.state.urls.len() {
                // an interrupted initializer leaves nothing worth keeping
                inner.state.reset(false, ERROR_NOTHING);
            }
            self.write_state(&inner.state).await?;
        }

        if !joined {
            let message = "workers did not stop in time".to_string();
            self.notify_error(ERROR_UNKNOWN_EXCEPTION, Some(message.clone())).await;
            return Err(TubeSyncError::Timeout(message));
        }

        if was_running {
            info!(mission = %self.name(), "mission paused");
            self.set_status(MissionStatus::Paused);
            self.notify(MissionMessage::Paused);
        }
        Ok(())
    }

    /// Record a failure, stop the tasks and tell the scheduler
    pub(crate) async fn notify_error(self: &Arc<Self>, code: i32, message: Option<String>) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.err_code = code;
            inner.state.err_message = message.clone();
            if !keeps_enqueued(code) {
                inner.state.enqueued = false;
            }
            if let Err(e) = self.write_state(&inner.state).await {
                warn!(mission = %self.name(), error = %e, "failed to persist mission");
            }
        }

        error!(
            mission = %self.name(),
            code,
            message = message.as_deref().unwrap_or(""),
            "mission failed: {}",
            describe(code)
        );
        self.running.store(false, Ordering::SeqCst);
        self.tasks.lock().await.cancel.cancel();
        self.set_status(MissionStatus::Errored);
        self.notify(MissionMessage::Error(code));
    }

    pub(crate) async fn fail(self: &Arc<Self>, error: &TubeSyncError) {
        self.notify_error(error_code_for(error), Some(error.to_string())).await;
    }

    // ========================================================================
    // Block table
    // ========================================================================

    /// Claim the first block that is neither complete nor held by a worker
    pub(crate) async fn claim(&self) -> Option<BlockClaim> {
        let mut inner = self.inner.lock().await;
        let MissionInner { state, acquired, .. } = &mut *inner;
        let blocks = state.blocks.as_ref()?;
        let url = state.urls.get(state.current)?.clone()?;

        let index = (0..blocks.len()).find(|i| !acquired[*i] && blocks[*i] >= 0)?;
        acquired[index] = true;

        let start = index as i64 * BLOCK_SIZE;
        Some(BlockClaim {
            index,
            start,
            end: start + state.block_len(index) - 1,
            url,
            file_offset: state.offsets[state.current],
        })
    }

    /// Give a block back, marking it complete or keeping its partial progress
    pub(crate) async fn release(&self, index: usize, completed: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(flag) = inner.acquired.get_mut(index) {
            *flag = false;
        }
        if completed {
            if let Some(block) = inner.state.blocks.as_mut().and_then(|b| b.get_mut(index)) {
                *block = -1;
            }
        }
    }

    /// Bytes already written for a block
    pub(crate) async fn block_done(&self, index: usize) -> i64 {
        let inner = self.inner.lock().await;
        inner
            .state
            .blocks
            .as_ref()
            .and_then(|b| b.get(index).copied())
            .unwrap_or(0)
            .max(0)
    }

    pub(crate) async fn fallback_claim(&self) -> Option<FallbackClaim> {
        let inner = self.inner.lock().await;
        let state = &inner.state;
        Some(FallbackClaim {
            url: state.urls.get(state.current)?.clone()?,
            file_offset: state.offsets[state.current],
            resume: state.fallback_resume_offset,
            unknown_length: state.unknown_length,
        })
    }

    /// Account `delta` bytes for a block (or the sequential stream when `None`).
    /// Negative deltas discard progress.
    pub(crate) async fn record_progress(self: &Arc<Self>, block: Option<usize>, delta: i64) -> Result<()> {
        let (done, total, resource) = {
            let mut inner = self.inner.lock().await;
            let state = &mut inner.state;

            if state.unknown_length {
                state.length += delta;
            }
            match block {
                Some(index) => {
                    if let Some(b) = state.blocks.as_mut().and_then(|b| b.get_mut(index)) {
                        *b += delta;
                    }
                }
                None => state.fallback_resume_offset += delta,
            }
            state.done += delta;

            let done = state.done;
            if done > inner.next_persist || delta < 0 {
                inner.next_persist = done + BLOCK_SIZE;
                self.write_state(&inner.state).await?;
            }
            progress_totals(&inner.state)
        };

        let publish = match self.progress.lock() {
            Ok(mut reporter) => reporter.observe(done, total, resource),
            Err(_) => false,
        };
        if publish {
            if let Some(snapshot) = self.progress() {
                self.notify(MissionMessage::Progress(snapshot));
            }
        }
        Ok(())
    }

    /// Called by a worker that ran out of blocks; the last one advances the mission
    pub(crate) async fn worker_finished(self: &Arc<Self>, token: CancellationToken) {
        let count = self.finish_count.fetch_add(1, Ordering::SeqCst) + 1;
        let threads = self.inner.lock().await.threads;
        if count < threads {
            return;
        }
        self.advance(token).await;
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// True for exactly one caller until the recovery ends
    pub(crate) fn begin_recovery(&self) -> bool {
        self.recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_recovery(&self) {
        self.recovering.store(false, Ordering::SeqCst);
    }

    /// Stop the workers and hand the mission to a recovery task
    pub(crate) async fn spawn_recovery(self: &Arc<Self>, code: i32) {
        let mut tasks = self.tasks.lock().await;
        if !self.is_running() || tasks.cancel.is_cancelled() {
            self.end_recovery();
            return;
        }
        tasks.cancel.cancel();
        let workers = std::mem::take(&mut tasks.workers);
        let token = CancellationToken::new();
        tasks.cancel = token.clone();

        warn!(mission = %self.name(), code, "stream URL rejected, recovering");
        tasks.control = Some(tokio::spawn(recover::run(Arc::clone(self), code, workers, token)));
    }

    /// Relaunch after the initializer or a recovery finished
    pub(crate) async fn relaunch(self: &Arc<Self>, token: CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        Arc::clone(self).launch(Some(token)).await;
    }

    // ========================================================================
    // Post-processing
    // ========================================================================

    pub(crate) async fn set_ps_state(&self, ps_state: u8) {
        let mut inner = self.inner.lock().await;
        inner.state.ps_state = ps_state;
        if let Err(e) = self.write_state(&inner.state).await {
            warn!(mission = %self.name(), error = %e, "failed to persist mission");
        }
        if ps_state == PS_RUNNING || ps_state == PS_HOLD {
            self.set_status(MissionStatus::PostProcessing);
        }
    }

    /// Resume after a post-processing failure. Without `recover` the step is skipped.
    pub async fn ps_continue(self: &Arc<Self>, recover: bool) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.err_code = ERROR_NOTHING;
            inner.state.err_message = None;
            inner.state.ps_state = if recover { PS_READY } else { PS_DONE };
        }
        self.running.store(false, Ordering::SeqCst);

        if recover {
            Arc::clone(self).launch(None).await;
        } else {
            self.running.store(true, Ordering::SeqCst);
            self.finish().await;
        }
    }

    /// Apply `update` to the state and persist it
    pub(crate) async fn update_state<F: FnOnce(&mut MissionState)>(&self, update: F) -> Result<()> {
        let mut inner = self.inner.lock().await;
        update(&mut inner.state);
        self.write_state(&inner.state).await
    }
}

/// Bytes done, announced length and resource index for the progress reporter
fn progress_totals(state: &MissionState) -> (u64, Option<u64>, usize) {
    let length = if state.unknown_length {
        None
    } else {
        Some(state.total_length().max(0) as u64)
    };
    let resource = state.current.min(state.urls.len().saturating_sub(1));
    (state.done.max(0) as u64, length, resource)
}

fn take_handles(tasks: &mut MissionTasks) -> Vec<JoinHandle<()>> {
    let mut handles = std::mem::take(&mut tasks.workers);
    if let Some(control) = tasks.control.take() {
        handles.push(control);
    }
    handles
}

/// Wait for tasks up to `limit`; stragglers are aborted and false is returned
pub(crate) async fn join_tasks(handles: Vec<JoinHandle<()>>, limit: Duration) -> bool {
    if handles.is_empty() {
        return true;
    }
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    match tokio::time::timeout(limit, futures_util::future::join_all(handles)).await {
        Ok(_) => true,
        Err(_) => {
            for abort in aborts {
                abort.abort();
            }
            false
        }
    }
}

/// Exponential backoff between attempts: 1s, 2s, 4s...
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(2_u64.pow(attempt.saturating_sub(1).min(5)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (Arc<MissionContext>, mpsc::UnboundedReceiver<MissionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let ctx = MissionContext::new(&DownloadConfig::default(), None, sender).unwrap();
        (Arc::new(ctx), receiver)
    }

    fn request(storage: PathBuf) -> MissionRequest {
        MissionRequest {
            urls: vec!["http://127.0.0.1:9/video".to_string()],
            storage,
            kind: 'v',
            threads: 4,
            source: None,
            postprocessing: None,
            near_length: 0,
            recovery: Vec::new(),
        }
    }

    async fn mission_with_length(dir: &Path, length: i64) -> Arc<DownloadMission> {
        let (ctx, _events) = context();
        let storage = dir.join("out.mp4");
        std::fs::write(&storage, b"").unwrap();
        let mission = DownloadMission::create(request(storage), &dir.join("pending"), ctx)
            .await
            .unwrap();
        mission
            .update_state(|s| {
                s.length = length;
                s.blocks = Some(vec![0; ((length + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize]);
            })
            .await
            .unwrap();
        mission.inner.lock().await.acquired = vec![false; ((length + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize];
        mission
    }

    #[tokio::test]
    async fn test_create_persists_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _events) = context();
        let mission = DownloadMission::create(request(dir.path().join("a.mp4")), dir.path(), Arc::clone(&ctx))
            .await
            .unwrap();
        assert!(mission.metadata_path().is_file());
        assert_eq!(mission.name(), "a.mp4");

        let loaded = DownloadMission::load(mission.metadata_path(), ctx).await.unwrap();
        let state = loaded.snapshot().await;
        assert_eq!(state.timestamp, mission.timestamp());
        assert_eq!(state.urls.len(), 1);
        assert_eq!(state.recovery.len(), 1);
        assert!(state.enqueued);
        assert!(!state.is_initialized());
        assert_eq!(state.err_code, ERROR_NOTHING);
    }

    #[tokio::test]
    async fn test_metadata_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _events) = context();
        let first = DownloadMission::create(request(dir.path().join("a")), dir.path(), Arc::clone(&ctx))
            .await
            .unwrap();
        let second = DownloadMission::create(request(dir.path().join("b")), dir.path(), ctx)
            .await
            .unwrap();
        assert_ne!(first.metadata_path(), second.metadata_path());
    }

    #[tokio::test]
    async fn test_claims_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let length = 3 * BLOCK_SIZE - 100;
        let mission = mission_with_length(dir.path(), length).await;

        let a = mission.claim().await.unwrap();
        let b = mission.claim().await.unwrap();
        let c = mission.claim().await.unwrap();
        assert_eq!((a.index, b.index, c.index), (0, 1, 2));
        assert_eq!(a.end, BLOCK_SIZE - 1);
        assert_eq!(c.end, length - 1);
        assert!(mission.claim().await.is_none());

        mission.release(1, false).await;
        assert_eq!(mission.claim().await.unwrap().index, 1);

        mission.release(0, true).await;
        assert!(mission.claim().await.is_none());
        assert_eq!(mission.snapshot().await.blocks.unwrap()[0], -1);
    }

    #[tokio::test]
    async fn test_progress_accounting_matches_block_table() {
        let dir = tempfile::tempdir().unwrap();
        let mission = mission_with_length(dir.path(), 2 * BLOCK_SIZE).await;

        mission.record_progress(Some(0), 1000).await.unwrap();
        mission.record_progress(Some(1), 500).await.unwrap();
        let state = mission.snapshot().await;
        assert_eq!(state.done, 1500);
        assert_eq!(state.accounted_done(), state.done);

        // a restarted block gives its bytes back
        mission.record_progress(Some(1), -500).await.unwrap();
        mission.record_progress(Some(0), BLOCK_SIZE - 1000).await.unwrap();
        mission.release(0, true).await;

        let state = mission.snapshot().await;
        assert_eq!(state.done, BLOCK_SIZE);
        assert_eq!(state.accounted_done(), state.done);
        assert_eq!(state.blocks.as_deref(), Some(&[-1, 0][..]));
    }

    #[tokio::test]
    async fn test_unknown_length_grows_with_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mission = mission_with_length(dir.path(), 0).await;
        mission
            .update_state(|s| {
                s.unknown_length = true;
                s.blocks = Some(Vec::new());
            })
            .await
            .unwrap();

        mission.record_progress(None, 4096).await.unwrap();
        let state = mission.snapshot().await;
        assert_eq!(state.length, 4096);
        assert_eq!(state.fallback_resume_offset, 4096);
        assert_eq!(state.accounted_done(), 4096);

        mission.record_progress(None, -4096).await.unwrap();
        assert_eq!(mission.snapshot().await.length, 0);
    }

    #[tokio::test]
    async fn test_pause_of_idle_mission_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let mission = mission_with_length(dir.path(), BLOCK_SIZE).await;
        mission.record_progress(Some(0), 10).await.unwrap();

        mission.pause().await.unwrap();
        assert!(!mission.is_running());

        let persisted: MissionState =
            serde_json::from_str(&std::fs::read_to_string(mission.metadata_path()).unwrap()).unwrap();
        assert_eq!(persisted.done, 10);
        assert_eq!(persisted.blocks, Some(vec![10]));
    }

    #[tokio::test]
    async fn test_pause_fails_when_a_task_outlives_the_join_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut events) = context();
        let storage = dir.path().join("stuck.mp4");
        std::fs::write(&storage, b"").unwrap();
        let mission = DownloadMission::create(request(storage), &dir.path().join("pending"), ctx)
            .await
            .unwrap();
        mission.running.store(true, Ordering::SeqCst);

        // never looks at the cancellation token
        let stuck = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(3600)).await });
        mission.tasks.lock().await.workers.push(stuck);

        let result = mission.pause_with(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(TubeSyncError::Timeout(_))));
        assert!(!mission.is_running());

        let event = events.try_recv().unwrap();
        assert!(Arc::ptr_eq(&event.mission, &mission));
        assert!(matches!(event.message, MissionMessage::Error(code) if code == ERROR_UNKNOWN_EXCEPTION));
        assert!(events.try_recv().is_err(), "no pause event after a failed join");
        assert_eq!(mission.snapshot().await.err_code, ERROR_UNKNOWN_EXCEPTION);
    }

    #[test]
    fn test_state_predicates() {
        let mut state = MissionState::new(request(PathBuf::from("/nonexistent/out")), 1);
        state.urls.push(Some("http://host/second".to_string()));
        state.offsets.push(0);
        assert!(!state.is_finished());
        assert!(state.has_invalid_storage());

        state.length = 300;
        state.current = 1;
        state.offsets[1] = 1000;
        assert_eq!(state.total_length(), 1300);

        state.near_length = 5000;
        assert_eq!(state.total_length(), 5000);

        state.reset(false, ERROR_NOTHING);
        assert_eq!(state.done, 1000);
        state.reset(true, ERROR_PROGRESS_LOST);
        assert_eq!(state.current, 0);
        assert_eq!(state.done, 0);
        assert_eq!(state.err_code, ERROR_PROGRESS_LOST);

        state.current = 2;
        assert!(state.is_finished());
        state.postprocessing = Some(PostprocessingSpec::new(postprocessing::ALGORITHM_TTML, Vec::new()));
        assert!(!state.is_finished());
        state.ps_state = PS_HOLD;
        assert!(state.is_ps_running());
        state.ps_state = PS_READY;
        state.err_code = ERROR_POSTPROCESSING;
        assert!(state.is_ps_failed());
        assert!(state.is_corrupt());
    }

    #[test]
    fn test_retry_delay_backoff() {
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(2), Duration::from_secs(2));
        assert_eq!(retry_delay(3), Duration::from_secs(4));
    }
}
