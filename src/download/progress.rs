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


//! Progress reporting for running missions
//!
//! Workers account bytes into the mission state; the reporter turns those
//! totals into snapshots with a smoothed speed. Snapshots are throttled so a
//! fast connection does not flood the event channel.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Smallest gap between two published snapshots
const PUBLISH_INTERVAL: Duration = Duration::from_millis(200);

/// Samples older than this do not count toward the speed
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Lifecycle of a mission as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionStatus {
    /// Created or paused, waiting to be started
    Pending,
    /// Probing the resource before workers start
    Initializing,
    Running,
    Paused,
    PostProcessing,
    Finished,
    /// Stopped with an error code
    Errored,
}

/// Point-in-time view of a mission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionProgress {
    pub name: String,
    pub status: MissionStatus,

    /// Bytes written across every resource
    pub done: u64,
    /// `None` while the server has not announced a length
    pub length: Option<u64>,

    /// Zero-based index of the resource being downloaded
    pub resource: usize,
    pub resources: usize,

    /// Bytes per second
    pub speed: f64,
}

impl MissionProgress {
    fn new(name: String, resources: usize) -> Self {
        Self {
            name,
            status: MissionStatus::Pending,
            done: 0,
            length: None,
            resource: 0,
            resources,
            speed: 0.0,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self.length {
            Some(length) if length > 0 => Some((self.done as f64 * 100.0 / length as f64).min(100.0)),
            _ => None,
        }
    }

    /// Time left at the current speed
    pub fn eta(&self) -> Option<Duration> {
        let length = self.length?;
        if self.speed <= 0.0 {
            return None;
        }
        let left = length.saturating_sub(self.done) as f64;
        Some(Duration::from_secs_f64(left / self.speed))
    }

    /// One-line summary, e.g. `clip.mp4 [2/2]: 41.50% of 12.00 MB at 1.25 MB/s, 8s left`
    pub fn display_string(&self) -> String {
        let label = if self.resources > 1 {
            format!("{} [{}/{}]", self.name, (self.resource + 1).min(self.resources), self.resources)
        } else {
            self.name.clone()
        };

        match self.status {
            MissionStatus::Pending => format!("{}: queued", label),
            MissionStatus::Initializing => format!("{}: connecting", label),
            MissionStatus::Paused => format!("{}: paused at {}", label, format_bytes(self.done)),
            MissionStatus::PostProcessing => format!("{}: post-processing", label),
            MissionStatus::Finished => format!("{}: done, {}", label, format_bytes(self.done)),
            MissionStatus::Errored => format!("{}: failed", label),
            MissionStatus::Running => match (self.percent(), self.length) {
                (Some(percent), Some(length)) => {
                    let eta = match self.eta() {
                        Some(eta) => format!(", {} left", format_duration(eta)),
                        None => String::new(),
                    };
                    format!(
                        "{}: {:.2}% of {} at {}{}",
                        label,
                        percent,
                        format_bytes(length),
                        format_speed(self.speed),
                        eta
                    )
                }
                _ => format!("{}: {} at {}", label, format_bytes(self.done), format_speed(self.speed)),
            },
        }
    }
}

/// Binary-unit size, e.g. `1.50 MB`
pub fn format_bytes(bytes: u64) -> String {
    scaled(bytes as f64, "")
}

pub fn format_speed(bytes_per_second: f64) -> String {
    scaled(bytes_per_second, "/s")
}

fn scaled(value: f64, suffix: &str) -> String {
    const UNITS: [&str; 3] = ["kB", "MB", "GB"];
    if value < 1024.0 {
        return format!("{:.0} B{}", value, suffix);
    }
    let mut value = value / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}{}", value, UNITS[unit], suffix)
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {}s", m, s),
        (h, m, _) => format!("{}h {}m", h, m),
    }
}

/// Sliding-window average of byte positions
#[derive(Debug)]
struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
    span: Duration,
}

impl SpeedWindow {
    fn new(span: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            span,
        }
    }

    fn push(&mut self, at: Instant, position: u64) {
        // discarded progress makes older samples meaningless
        if matches!(self.samples.back(), Some(&(_, last)) if position < last) {
            self.samples.clear();
        }
        self.samples.push_back((at, position));
        while matches!(self.samples.front(), Some(&(t, _)) if at.duration_since(t) > self.span) {
            self.samples.pop_front();
        }
    }

    fn speed(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(t0, p0)), Some(&(t1, p1))) => {
                let elapsed = t1.duration_since(t0).as_secs_f64();
                if elapsed > 0.0 {
                    (p1 - p0) as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Keeps the latest snapshot of one mission and decides when to publish it
#[derive(Debug)]
pub struct ProgressReporter {
    current: MissionProgress,
    window: SpeedWindow,
    published: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(name: String, resources: usize) -> Self {
        Self {
            current: MissionProgress::new(name, resources),
            window: SpeedWindow::new(SPEED_WINDOW),
            published: None,
        }
    }

    /// Take new totals from the mission state
    ///
    /// Returns true when enough time passed since the last published snapshot.
    pub fn observe(&mut self, done: u64, length: Option<u64>, resource: usize) -> bool {
        self.observe_at(Instant::now(), done, length, resource)
    }

    fn observe_at(&mut self, now: Instant, done: u64, length: Option<u64>, resource: usize) -> bool {
        self.window.push(now, done);
        self.current.done = done;
        self.current.length = length;
        self.current.resource = resource;
        self.current.speed = self.window.speed();

        match self.published {
            Some(last) if now.duration_since(last) < PUBLISH_INTERVAL => false,
            _ => {
                self.published = Some(now);
                true
            }
        }
    }

    pub fn set_status(&mut self, status: MissionStatus) {
        if status != MissionStatus::Running {
            self.window.clear();
            self.current.speed = 0.0;
        }
        self.current.status = status;
    }

    pub fn snapshot(&self) -> MissionProgress {
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_use_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 kB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_speed(3.0 * 1024.0 * 1024.0 * 1024.0), "3.00 GB/s");
    }

    #[test]
    fn test_speed_window() {
        let start = Instant::now();
        let mut window = SpeedWindow::new(SPEED_WINDOW);
        window.push(start, 0);
        window.push(start + Duration::from_secs(2), 4096);
        assert_eq!(window.speed(), 2048.0);

        // old samples fall out of the window
        window.push(start + Duration::from_secs(11), 8192);
        assert_eq!(window.speed(), 4096.0 / 9.0);

        window.push(start + Duration::from_secs(12), 100);
        assert_eq!(window.speed(), 0.0);
    }

    #[test]
    fn test_unknown_length_has_no_percent() {
        let mut reporter = ProgressReporter::new("live.ts".to_string(), 1);
        reporter.set_status(MissionStatus::Running);
        reporter.observe(2048, None, 0);

        let progress = reporter.snapshot();
        assert_eq!(progress.percent(), None);
        assert_eq!(progress.eta(), None);
        assert!(progress.display_string().starts_with("live.ts: 2.00 kB at"));
    }

    #[test]
    fn test_snapshot_names_current_resource() {
        let start = Instant::now();
        let mut reporter = ProgressReporter::new("clip.mp4".to_string(), 2);
        reporter.set_status(MissionStatus::Running);
        reporter.observe_at(start, 0, Some(4 * 1024 * 1024), 1);
        reporter.observe_at(start + Duration::from_secs(1), 1024 * 1024, Some(4 * 1024 * 1024), 1);

        let progress = reporter.snapshot();
        assert_eq!(progress.percent(), Some(25.0));
        assert_eq!(progress.eta(), Some(Duration::from_secs(3)));
        assert_eq!(
            progress.display_string(),
            "clip.mp4 [2/2]: 25.00% of 4.00 MB at 1.00 MB/s, 3s left"
        );
    }

    #[test]
    fn test_publishing_is_throttled() {
        let start = Instant::now();
        let mut reporter = ProgressReporter::new("a.m4a".to_string(), 1);
        assert!(reporter.observe_at(start, 10, Some(100), 0));
        assert!(!reporter.observe_at(start + Duration::from_millis(50), 20, Some(100), 0));
        assert!(reporter.observe_at(start + Duration::from_millis(250), 30, Some(100), 0));
        assert_eq!(reporter.snapshot().done, 30);
    }
}
