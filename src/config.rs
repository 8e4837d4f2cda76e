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


//! Configuration for the download engine
//!
//! Settings come from an external key-value provider (the host application owns
//! where they are stored). `DownloadConfig::from_settings` reads the keys the
//! engine understands and falls back to defaults for anything missing.
//!
//! # Keys
//! - `max_retry` - attempts before a mission gives up on initialization/recovery
//! - `pause_on_metered_network` - pause running missions on cellular data
//! - `queue_limit` - run at most one mission at a time
//! - `default_threads` - worker count for new missions
//! - `connect_timeout_secs`, `read_timeout_secs`, `user_agent`

use crate::error::{Result, TubeSyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

pub const KEY_MAX_RETRY: &str = "max_retry";
pub const KEY_PAUSE_ON_METERED: &str = "pause_on_metered_network";
pub const KEY_QUEUE_LIMIT: &str = "queue_limit";
pub const KEY_DEFAULT_THREADS: &str = "default_threads";
pub const KEY_CONNECT_TIMEOUT: &str = "connect_timeout_secs";
pub const KEY_READ_TIMEOUT: &str = "read_timeout_secs";
pub const KEY_USER_AGENT: &str = "user_agent";

/// Upper bound for per-mission worker count
pub const MAX_THREAD_COUNT: u32 = 32;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:68.0) Gecko/20100101 Firefox/68.0";

/// External key-value settings source
pub trait SettingsProvider: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_string(key).and_then(|v| match v.trim() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        })
    }

    fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_string(key).and_then(|v| v.trim().parse().ok())
    }
}

/// In-memory settings, mostly for embedding and tests
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<K: Into<String>, V: ToString>(&self, key: K, value: V) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.into(), value.to_string());
        }
    }
}

impl SettingsProvider for MemorySettings {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }
}

/// Settings stored as a flat JSON object on disk
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: HashMap<String, serde_json::Value>,
}

impl JsonFileSettings {
    /// Load settings from `path`. A missing file yields empty settings.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                TubeSyncError::ConfigurationError(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsProvider for JsonFileSettings {
    fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Download engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum initialization/recovery attempts per mission
    pub max_retry: u32,

    /// Pause running missions when the network becomes metered
    pub pause_on_metered_network: bool,

    /// Only one mission runs at a time
    pub queue_limit: bool,

    /// Worker count for new missions
    pub default_threads: u32,

    /// Connect timeout for every HTTP operation
    pub connect_timeout: Duration,

    /// Read timeout for every HTTP operation
    pub read_timeout: Duration,

    pub user_agent: String,

    /// Directory holding one metadata file per pending mission
    pub pending_dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            pause_on_metered_network: true,
            queue_limit: false,
            default_threads: 3,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            pending_dir: PathBuf::from("pending_downloads"),
        }
    }
}

impl DownloadConfig {
    pub fn builder() -> DownloadConfigBuilder {
        DownloadConfigBuilder::new()
    }

    /// Read configuration from a settings provider, keeping defaults for absent keys
    pub fn from_settings(settings: &dyn SettingsProvider) -> Self {
        let mut config = Self::default();
        if let Some(v) = settings.get_u32(KEY_MAX_RETRY) {
            config.max_retry = v;
        }
        if let Some(v) = settings.get_bool(KEY_PAUSE_ON_METERED) {
            config.pause_on_metered_network = v;
        }
        if let Some(v) = settings.get_bool(KEY_QUEUE_LIMIT) {
            config.queue_limit = v;
        }
        if let Some(v) = settings.get_u32(KEY_DEFAULT_THREADS) {
            config.default_threads = v.clamp(1, MAX_THREAD_COUNT);
        }
        if let Some(v) = settings.get_u32(KEY_CONNECT_TIMEOUT) {
            config.connect_timeout = Duration::from_secs(v as u64);
        }
        if let Some(v) = settings.get_u32(KEY_READ_TIMEOUT) {
            config.read_timeout = Duration::from_secs(v as u64);
        }
        if let Some(v) = settings.get_string(KEY_USER_AGENT) {
            config.user_agent = v;
        }
        config
    }
}

/// Builder for DownloadConfig
#[derive(Debug)]
pub struct DownloadConfigBuilder {
    config: DownloadConfig,
}

impl DownloadConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DownloadConfig::default(),
        }
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.config.max_retry = max_retry;
        self
    }

    pub fn pause_on_metered_network(mut self, enable: bool) -> Self {
        self.config.pause_on_metered_network = enable;
        self
    }

    pub fn queue_limit(mut self, enable: bool) -> Self {
        self.config.queue_limit = enable;
        self
    }

    pub fn default_threads(mut self, threads: u32) -> Self {
        self.config.default_threads = threads.clamp(1, MAX_THREAD_COUNT);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn pending_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.pending_dir = dir.into();
        self
    }

    pub fn build(self) -> DownloadConfig {
        self.config
    }
}

impl Default for DownloadConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `tubesync_core=debug`
    pub level: Option<String>,
    /// Write daily-rolling log files here instead of stderr
    pub directory: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_settings_empty() {
        let settings = MemorySettings::new();
        let config = DownloadConfig::from_settings(&settings);
        assert_eq!(config.max_retry, 3);
        assert!(config.pause_on_metered_network);
        assert!(!config.queue_limit);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_settings_override_defaults() {
        let settings = MemorySettings::new();
        settings.set(KEY_MAX_RETRY, 7);
        settings.set(KEY_QUEUE_LIMIT, "true");
        settings.set(KEY_PAUSE_ON_METERED, "0");
        settings.set(KEY_DEFAULT_THREADS, 99);

        let config = DownloadConfig::from_settings(&settings);
        assert_eq!(config.max_retry, 7);
        assert!(config.queue_limit);
        assert!(!config.pause_on_metered_network);
        assert_eq!(config.default_threads, MAX_THREAD_COUNT);
    }

    #[test]
    fn test_json_file_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"max_retry": 5, "queue_limit": true, "user_agent": "ua"}"#).unwrap();

        let settings = JsonFileSettings::load(&path).unwrap();
        let config = DownloadConfig::from_settings(&settings);
        assert_eq!(config.max_retry, 5);
        assert!(config.queue_limit);
        assert_eq!(config.user_agent, "ua");

        let missing = JsonFileSettings::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(missing.get_string(KEY_MAX_RETRY), None);
    }
}
