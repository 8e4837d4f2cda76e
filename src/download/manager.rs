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


//! Download scheduler
//!
//! Owns pending missions (one metadata file each under the pending directory)
//! and finished missions (SQLite store). Applies the network and queue policy
//! before anything is started, and re-broadcasts every mission event to
//! subscribers.
//!
//! # Policy
//! - nothing starts while the network is unavailable
//! - with `pause_on_metered_network`, running missions pause on a metered
//!   network and resume when an unmetered one returns
//! - with `queue_limit`, at most one mission runs at a time

use crate::config::{DownloadConfig, MAX_THREAD_COUNT};
use crate::download::codes::{ERROR_POSTPROCESSING_STOPPED, ERROR_PROGRESS_LOST};
use crate::download::mission::{DownloadMission, MissionContext, MissionEvent, MissionMessage, MissionRequest};
use crate::download::postprocessing::PS_READY;
use crate::download::recover::StreamResolver;
use crate::error::{Result, TubeSyncError};
use crate::storage::{Database, FinishedMission, FinishedMissionStore};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Connectivity as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unavailable,
    Metered,
    Unmetered,
}

/// Where a file name is already in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionCheck {
    None,
    Finished,
    Pending,
    PendingRunning,
}

#[derive(Debug, Clone)]
pub enum AnyMission {
    Pending(Arc<DownloadMission>),
    Finished(FinishedMission),
}

#[derive(Debug)]
struct Policy {
    network: NetworkState,
    pause_on_metered: bool,
    queue_limit: bool,
}

impl Policy {
    fn can_download(&self) -> bool {
        match self.network {
            NetworkState::Unavailable => false,
            NetworkState::Metered => !self.pause_on_metered,
            NetworkState::Unmetered => true,
        }
    }

    fn is_metered(&self) -> bool {
        self.pause_on_metered && self.network == NetworkState::Metered
    }
}

pub struct DownloadManager {
    ctx: Arc<MissionContext>,
    pending_dir: PathBuf,
    default_threads: u32,
    policy: Mutex<Policy>,
    pending: RwLock<Vec<Arc<DownloadMission>>>,
    finished: RwLock<Vec<FinishedMission>>,
    store: FinishedMissionStore,
    events: broadcast::Sender<MissionEvent>,
    control: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Load both stores and start the event loop. Nothing is started until
    /// `run_missions` or a connectivity change asks for it.
    pub async fn new(
        config: DownloadConfig,
        database: Database,
        resolver: Option<Arc<dyn StreamResolver>>,
    ) -> Result<Arc<Self>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let ctx = Arc::new(MissionContext::new(&config, resolver, sender)?);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = Arc::new(Self {
            ctx,
            pending_dir: config.pending_dir.clone(),
            default_threads: config.default_threads,
            policy: Mutex::new(Policy {
                network: NetworkState::Unmetered,
                pause_on_metered: config.pause_on_metered_network,
                queue_limit: config.queue_limit,
            }),
            pending: RwLock::new(Vec::new()),
            finished: RwLock::new(Vec::new()),
            store: FinishedMissionStore::new(database),
            events,
            control: std::sync::Mutex::new(None),
        });

        manager.load_pending().await?;
        *manager.finished.write().await = manager.store.load().await?;

        let handle = tokio::spawn(control_loop(Arc::downgrade(&manager), receiver));
        if let Ok(mut control) = manager.control.lock() {
            *control = Some(handle);
        }
        Ok(manager)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.events.subscribe()
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    pub fn default_threads(&self) -> u32 {
        self.default_threads
    }

    async fn load_pending(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.pending_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.pending_dir)
                    .await
                    .map_err(|e| TubeSyncError::PathCreation(format!("{}: {}", self.pending_dir.display(), e)))?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut loaded = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let mission = match DownloadMission::load(&path, Arc::clone(&self.ctx)).await {
                Ok(mission) => mission,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable mission");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
            };

            let state = mission.snapshot().await;
            if state.is_finished() {
                debug!(mission = %mission.name(), "discarding finished leftover");
                mission.delete_metadata().await?;
                continue;
            }

            if state.is_ps_running() {
                mission
                    .update_state(|s| {
                        s.ps_state = PS_READY;
                        s.err_code = ERROR_POSTPROCESSING_STOPPED;
                    })
                    .await?;
            } else if state.storage.exists() && !state.storage.is_file() {
                warn!(mission = %mission.name(), "output path is not a file, discarding mission");
                mission.delete_metadata().await?;
                continue;
            } else if !state.storage.exists() && state.is_initialized() {
                warn!(mission = %mission.name(), "output file vanished, progress lost");
                mission.update_state(|s| s.reset(true, ERROR_PROGRESS_LOST)).await?;
            }

            loaded.push(mission);
        }

        loaded.sort_by_key(|m| m.timestamp());
        info!(count = loaded.len(), "pending missions loaded");
        *self.pending.write().await = loaded;
        Ok(())
    }

    // ========================================================================
    // Mission lifecycle
    // ========================================================================

    /// Create the output file and a pending mission, starting it if policy allows
    pub async fn start_mission(&self, mut request: MissionRequest) -> Result<Arc<DownloadMission>> {
        if request.threads == 0 {
            request.threads = self.default_threads;
        }
        request.threads = request.threads.clamp(1, MAX_THREAD_COUNT);

        if let Some(parent) = request.storage.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TubeSyncError::PathCreation(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::File::create(&request.storage).await?;

        let mission = DownloadMission::create(request, &self.pending_dir, Arc::clone(&self.ctx)).await?;
        info!(mission = %mission.name(), "mission added");
        self.pending.write().await.push(Arc::clone(&mission));

        if self.can_start().await {
            mission.start().await?;
        }
        Ok(mission)
    }

    /// Pause and dequeue
    pub async fn pause_mission(&self, mission: &Arc<DownloadMission>) -> Result<()> {
        mission.set_enqueued(false).await?;
        mission.pause().await
    }

    /// Enqueue again and start when policy allows
    pub async fn resume_mission(&self, mission: &Arc<DownloadMission>) -> Result<()> {
        mission.set_enqueued(true).await?;
        if !mission.is_running() && self.can_start().await {
            mission.start().await?;
        }
        Ok(())
    }

    /// Stop a pending mission and remove its metadata and output
    pub async fn delete_mission(&self, mission: &Arc<DownloadMission>) -> Result<()> {
        mission.pause().await?;
        self.pending.write().await.retain(|m| !Arc::ptr_eq(m, mission));
        mission.delete_metadata().await?;
        remove_if_exists(mission.storage()).await?;
        info!(mission = %mission.name(), "mission deleted");
        mission.notify(MissionMessage::Deleted);
        Ok(())
    }

    /// Drop a finished entry, optionally with its file
    pub async fn forget_finished(&self, mission: &FinishedMission, delete_file: bool) -> Result<()> {
        self.store.delete(mission).await?;
        self.finished
            .write()
            .await
            .retain(|m| !(m.timestamp == mission.timestamp && m.path == mission.path));
        if delete_file {
            remove_if_exists(&mission.path).await?;
        }
        Ok(())
    }

    /// Forget every finished mission, keeping the files
    pub async fn forget_finished_downloads(&self) -> Result<()> {
        self.finished.write().await.clear();
        let removed = self.store.clear().await?;
        debug!(removed, "finished missions forgotten");
        Ok(())
    }

    async fn set_finished(&self, mission: &Arc<DownloadMission>) -> Result<()> {
        self.pending.write().await.retain(|m| !Arc::ptr_eq(m, mission));
        let state = mission.snapshot().await;
        let entry = FinishedMission {
            timestamp: state.timestamp,
            path: state.storage.clone(),
            url: state
                .source
                .clone()
                .or_else(|| state.urls.iter().flatten().next().cloned())
                .unwrap_or_default(),
            bytes_downloaded: state.done,
            kind: state.kind,
        };
        self.store.add(&entry).await?;
        self.finished.write().await.insert(0, entry);
        Ok(())
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    async fn can_start(&self) -> bool {
        let policy = self.policy.lock().await;
        if !policy.can_download() {
            return false;
        }
        !policy.queue_limit || self.running_missions_count().await == 0
    }

    /// Start enqueued missions the policy allows; true when something runs
    pub async fn run_missions(&self) -> Result<bool> {
        self.run_missions_except(None).await
    }

    async fn run_missions_except(&self, skip: Option<&Arc<DownloadMission>>) -> Result<bool> {
        let policy = self.policy.lock().await;
        let pending = self.pending.read().await.clone();
        if pending.is_empty() || !policy.can_download() {
            return Ok(false);
        }
        if policy.queue_limit && pending.iter().any(|m| m.is_running()) {
            return Ok(true);
        }

        let mut started = false;
        for mission in &pending {
            if skip.map(|s| Arc::ptr_eq(s, mission)).unwrap_or(false) || mission.is_running() {
                continue;
            }
            let state = mission.snapshot().await;
            if !state.enqueued || state.is_finished() {
                continue;
            }
            debug!(mission = %mission.name(), "scheduler starting mission");
            mission.start().await?;
            started = true;
            if policy.queue_limit {
                break;
            }
        }
        Ok(started)
    }

    /// Start every pending mission that can run, ignoring the enqueued flag
    pub async fn start_all_missions(&self) -> Result<()> {
        let pending = self.pending.read().await.clone();
        for mission in &pending {
            if mission.is_running() {
                continue;
            }
            let state = mission.snapshot().await;
            if state.is_ps_failed() || state.is_finished() {
                continue;
            }
            mission.set_enqueued(true).await?;
            mission.start().await?;
        }
        Ok(())
    }

    /// Pause every running mission. `force` skips waiting for workers.
    pub async fn pause_all_missions(&self, force: bool) -> Result<()> {
        let pending = self.pending.read().await.clone();
        for mission in &pending {
            if !mission.is_running() {
                continue;
            }
            let state = mission.snapshot().await;
            if state.is_ps_running() || state.is_finished() {
                continue;
            }
            if force {
                mission.pause_now().await;
            } else {
                mission.pause().await?;
            }
        }
        Ok(())
    }

    /// React to a connectivity change reported by the host
    pub async fn handle_connectivity_state(&self, network: NetworkState) -> Result<()> {
        let mut policy = self.policy.lock().await;
        if policy.network == network {
            return Ok(());
        }
        info!(?network, "network state changed");
        policy.network = network;
        if network == NetworkState::Unavailable {
            return Ok(());
        }

        let metered = policy.is_metered();
        let pending = self.pending.read().await.clone();
        for mission in &pending {
            let state = mission.snapshot().await;
            if state.is_corrupt() || state.is_ps_running() {
                continue;
            }
            if mission.is_running() && metered {
                mission.pause().await?;
            } else if !mission.is_running() && !metered && state.enqueued {
                mission.start().await?;
                if policy.queue_limit {
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn set_queue_limit(&self, enable: bool) {
        self.policy.lock().await.queue_limit = enable;
    }

    pub async fn set_pause_on_metered_network(&self, enable: bool) {
        self.policy.lock().await.pause_on_metered = enable;
    }

    /// Applies to running missions as well
    pub fn update_maximum_attempts(&self, attempts: u32) {
        self.ctx.set_max_retry(attempts);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn pending_missions(&self) -> Vec<Arc<DownloadMission>> {
        self.pending.read().await.clone()
    }

    pub async fn finished_missions(&self) -> Vec<FinishedMission> {
        self.finished.read().await.clone()
    }

    pub async fn running_missions_count(&self) -> usize {
        self.pending.read().await.iter().filter(|m| m.is_running()).count()
    }

    /// Whether `location/name` is taken by a pending or finished mission
    pub async fn check_for_running_mission(&self, location: &Path, name: &str) -> MissionCheck {
        match self.get_any_mission(location, name).await {
            Some(AnyMission::Pending(mission)) if mission.is_running() => MissionCheck::PendingRunning,
            Some(AnyMission::Pending(_)) => MissionCheck::Pending,
            Some(AnyMission::Finished(_)) => MissionCheck::Finished,
            None => MissionCheck::None,
        }
    }

    pub async fn get_any_mission(&self, location: &Path, name: &str) -> Option<AnyMission> {
        let target = location.join(name);
        if let Some(mission) = self.pending.read().await.iter().find(|m| m.storage() == target) {
            return Some(AnyMission::Pending(Arc::clone(mission)));
        }
        self.finished
            .read()
            .await
            .iter()
            .find(|m| m.path == target)
            .cloned()
            .map(AnyMission::Finished)
    }

    /// Diff-friendly view of both lists
    pub async fn iterator(self: &Arc<Self>) -> MissionIterator {
        MissionIterator::new(Arc::clone(self)).await
    }

    async fn handle_event(&self, event: &MissionEvent) {
        let result = match event.message {
            MissionMessage::Finished => match self.set_finished(&event.mission).await {
                Ok(()) => self.run_missions().await.map(|_| ()),
                Err(e) => Err(e),
            },
            MissionMessage::Error(_) => self.run_missions_except(Some(&event.mission)).await.map(|_| ()),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(mission = %event.mission.name(), error = %e, "scheduler failed to react to mission event");
        }
        let _ = self.events.send(event.clone());
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        if let Ok(mut control) = self.control.lock() {
            if let Some(handle) = control.take() {
                handle.abort();
            }
        }
    }
}

/// Serializes mission notifications on one task
async fn control_loop(manager: Weak<DownloadManager>, mut receiver: mpsc::UnboundedReceiver<MissionEvent>) {
    while let Some(event) = receiver.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_event(&event).await;
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 && dot < name.len() - 1 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    }
}

/// First `name (n).ext` not present in `location`
pub fn generate_unique_name(location: &Path, name: &str) -> Result<String> {
    if !location.is_dir() {
        return Err(TubeSyncError::invalid_input(format!(
            "location is not a directory: {}",
            location.display()
        )));
    }
    let (stem, extension) = split_name(name);
    for index in 0..1000 {
        let candidate = if extension.is_empty() {
            format!("{} ({})", stem, index)
        } else {
            format!("{} ({}).{}", stem, index, extension)
        };
        if !location.join(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(TubeSyncError::InvalidState("too many existing files".to_string()))
}

/// Entry of a [`MissionIterator`] snapshot
#[derive(Debug, Clone)]
pub enum MissionItem {
    PendingHeader,
    FinishedHeader,
    Pending(Arc<DownloadMission>),
    Finished(FinishedMission),
}

impl MissionItem {
    /// Identity: the same mission object, or the same finished record
    pub fn same_item(&self, other: &MissionItem) -> bool {
        match (self, other) {
            (MissionItem::PendingHeader, MissionItem::PendingHeader) => true,
            (MissionItem::FinishedHeader, MissionItem::FinishedHeader) => true,
            (MissionItem::Pending(a), MissionItem::Pending(b)) => Arc::ptr_eq(a, b),
            (MissionItem::Finished(a), MissionItem::Finished(b)) => a.timestamp == b.timestamp && a.path == b.path,
            _ => false,
        }
    }

    /// Same output file; progress counters are ignored
    pub fn same_content(&self, other: &MissionItem) -> bool {
        match (self.storage(), other.storage()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.same_item(other),
            _ => false,
        }
    }

    pub fn storage(&self) -> Option<&Path> {
        match self {
            MissionItem::Pending(m) => Some(m.storage()),
            MissionItem::Finished(m) => Some(&m.path),
            _ => None,
        }
    }

    pub fn is_header(&self) -> bool {
        matches!(self, MissionItem::PendingHeader | MissionItem::FinishedHeader)
    }
}

/// Old/new snapshots of both mission lists for incremental list updates
///
/// `start` takes a new snapshot, the `*_same` methods compare positions of the
/// old and new one, and `end` makes the new snapshot the old one.
pub struct MissionIterator {
    manager: Arc<DownloadManager>,
    snapshot: Vec<MissionItem>,
    current: Option<Vec<MissionItem>>,
    hidden: Vec<MissionItem>,
    has_finished: bool,
}

impl MissionIterator {
    async fn new(manager: Arc<DownloadManager>) -> Self {
        let mut iterator = Self {
            manager,
            snapshot: Vec::new(),
            current: None,
            hidden: Vec::new(),
            has_finished: false,
        };
        iterator.snapshot = iterator.special_items().await;
        iterator
    }

    async fn special_items(&mut self) -> Vec<MissionItem> {
        let hidden = &self.hidden;
        let is_hidden = |item: &MissionItem| hidden.iter().any(|h| h.same_item(item));

        let pending: Vec<MissionItem> = self
            .manager
            .pending
            .read()
            .await
            .iter()
            .map(|m| MissionItem::Pending(Arc::clone(m)))
            .filter(|item| !is_hidden(item))
            .collect();
        let finished: Vec<MissionItem> = self
            .manager
            .finished
            .read()
            .await
            .iter()
            .map(|m| MissionItem::Finished(m.clone()))
            .filter(|item| !is_hidden(item))
            .collect();

        let mut list = Vec::with_capacity(pending.len() + finished.len() + 2);
        if !pending.is_empty() {
            list.push(MissionItem::PendingHeader);
            list.extend(pending);
        }
        self.has_finished = !finished.is_empty();
        if self.has_finished {
            list.push(MissionItem::FinishedHeader);
            list.extend(finished);
        }
        list
    }

    pub fn item(&self, position: usize) -> Option<&MissionItem> {
        self.snapshot.get(position)
    }

    pub async fn start(&mut self) {
        self.current = Some(self.special_items().await);
    }

    pub fn end(&mut self) {
        if let Some(current) = self.current.take() {
            self.snapshot = current;
        }
    }

    pub fn hide(&mut self, item: MissionItem) {
        self.hidden.push(item);
    }

    pub fn unhide(&mut self, item: &MissionItem) {
        self.hidden.retain(|h| !h.same_item(item));
    }

    pub fn has_finished_missions(&self) -> bool {
        self.has_finished
    }

    /// `(any running, any paused)` among visible, usable pending missions
    pub async fn has_valid_pending_missions(&self) -> (bool, bool) {
        let mut running = false;
        let mut paused = false;
        let pending = self.manager.pending.read().await.clone();
        for mission in &pending {
            let item = MissionItem::Pending(Arc::clone(mission));
            if self.hidden.iter().any(|h| h.same_item(&item)) {
                continue;
            }
            let state = mission.snapshot().await;
            if state.is_ps_failed() || state.is_finished() {
                continue;
            }
            if mission.is_running() {
                running = true;
            } else {
                paused = true;
            }
        }
        (running, paused)
    }

    pub fn old_len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn new_len(&self) -> usize {
        self.current.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    pub fn are_items_same(&self, old: usize, new: usize) -> bool {
        match (self.snapshot.get(old), self.current.as_ref().and_then(|c| c.get(new))) {
            (Some(a), Some(b)) => a.same_item(b),
            _ => false,
        }
    }

    pub fn are_contents_same(&self, old: usize, new: usize) -> bool {
        match (self.snapshot.get(old), self.current.as_ref().and_then(|c| c.get(new))) {
            (Some(a), Some(b)) => a.same_content(b),
            _ => false,
        }
    }
}
