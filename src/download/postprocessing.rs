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


//! Post-processing of finished downloads
//!
//! Algorithms are looked up by name and run once every resource of a mission
//! is complete. Only one post-processing job runs at a time; others wait in
//! the hold state.

use crate::download::codes::ERROR_POSTPROCESSING;
use crate::download::mission::DownloadMission;
use crate::error::{Result, TubeSyncError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const PS_READY: u8 = 0;
pub const PS_RUNNING: u8 = 1;
pub const PS_DONE: u8 = 2;
pub const PS_HOLD: u8 = 3;

pub const ALGORITHM_TTML: &str = "ttml";

static PS_PERMITS: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(1));

/// Algorithm name plus its arguments, stored with the mission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostprocessingSpec {
    pub algorithm: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PostprocessingSpec {
    pub fn new<S: Into<String>>(algorithm: S, args: Vec<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            args,
        }
    }
}

/// Output file and where each downloaded resource starts in it
#[derive(Debug, Clone)]
pub struct PostprocessingInput {
    pub path: PathBuf,
    pub offsets: Vec<i64>,
}

#[async_trait]
pub trait Postprocessing: Send + Sync {
    fn name(&self) -> &'static str;

    /// Leave room at the head of the file for the result
    fn reserve_space(&self) -> bool;

    /// Rewrites the download in place; a failure leaves it unusable
    fn works_on_same_file(&self) -> bool;

    async fn run(&self, input: &PostprocessingInput, args: &[String]) -> Result<()>;
}

/// Look up an algorithm by the name stored in mission metadata
///
/// Only subtitle conversion ships. Muxers and other algorithms plug in here by
/// implementing [`Postprocessing`] and adding a name to this match.
pub fn algorithm(name: &str) -> Option<Arc<dyn Postprocessing>> {
    match name {
        ALGORITHM_TTML => Some(Arc::new(TtmlConverter)),
        _ => None,
    }
}

pub(crate) async fn run(mission: Arc<DownloadMission>, token: CancellationToken) {
    let permit = match PS_PERMITS.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            info!(mission = %mission.name(), "post-processing queued");
            mission.set_ps_state(PS_HOLD).await;
            tokio::select! {
                permit = PS_PERMITS.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = token.cancelled() => return,
            }
        }
    };

    mission.set_ps_state(PS_RUNNING).await;
    let (spec, input) = {
        let inner = mission.inner.lock().await;
        (
            inner.state.postprocessing.clone(),
            PostprocessingInput {
                path: inner.state.storage.clone(),
                offsets: inner.state.offsets.clone(),
            },
        )
    };
    let Some(spec) = spec else {
        drop(permit);
        mission.set_ps_state(PS_DONE).await;
        mission.finish().await;
        return;
    };

    let result = match algorithm(&spec.algorithm) {
        Some(algorithm) => {
            info!(mission = %mission.name(), algorithm = algorithm.name(), "post-processing");
            algorithm.run(&input, &spec.args).await
        }
        None => Err(TubeSyncError::PostProcessing {
            algorithm: spec.algorithm.clone(),
            message: "unknown algorithm".to_string(),
        }),
    };
    drop(permit);

    match result {
        Ok(()) => {
            mission.set_ps_state(PS_DONE).await;
            mission.finish().await;
        }
        Err(e) => {
            warn!(mission = %mission.name(), error = %e, "post-processing failed");
            mission.set_ps_state(PS_READY).await;
            mission.notify_error(ERROR_POSTPROCESSING, Some(e.to_string())).await;
        }
    }
}

/// Converts a TTML subtitle download to SubRip in place
///
/// `args[0] == "true"` drops frames without text. `args[1] == "true"` drops a
/// frame repeating the previous frame's text, which auto-generated captions do.
#[derive(Debug, Default)]
pub struct TtmlConverter;

#[async_trait]
impl Postprocessing for TtmlConverter {
    fn name(&self) -> &'static str {
        ALGORITHM_TTML
    }

    fn reserve_space(&self) -> bool {
        false
    }

    fn works_on_same_file(&self) -> bool {
        true
    }

    async fn run(&self, input: &PostprocessingInput, args: &[String]) -> Result<()> {
        let ignore_empty = args.first().map(|a| a == "true").unwrap_or(false);
        let skip_repeated = args.get(1).map(|a| a == "true").unwrap_or(false);
        let start = input.offsets.first().copied().unwrap_or(0).max(0) as u64;

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&input.path)
            .await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut source = String::new();
        file.read_to_string(&mut source).await?;

        let srt = ttml_to_srt(&source, ignore_empty, skip_repeated).map_err(|e| TubeSyncError::PostProcessing {
            algorithm: ALGORITHM_TTML.to_string(),
            message: e.to_string(),
        })?;

        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(srt.as_bytes()).await?;
        file.set_len(srt.len() as u64).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Frame {
    begin: u64,
    end: u64,
    text: String,
}

/// Convert a TTML document to SubRip text
pub fn ttml_to_srt(ttml: &str, ignore_empty: bool, skip_repeated: bool) -> Result<String> {
    let frames = parse_frames(ttml)?;

    let mut out = String::new();
    let mut index = 0;
    let mut previous: Option<&str> = None;
    for frame in &frames {
        let text = frame.text.trim();
        if ignore_empty && text.is_empty() {
            continue;
        }
        if skip_repeated && previous == Some(text) {
            continue;
        }
        previous = Some(text);
        index += 1;
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            index,
            srt_time(frame.begin),
            srt_time(frame.end),
            text
        );
    }
    Ok(out)
}

fn parse_frames(ttml: &str) -> Result<Vec<Frame>> {
    let mut reader = Reader::from_str(ttml);
    reader.config_mut().trim_text(true);

    let mut frames = Vec::new();
    let mut current: Option<Frame> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"tt" => saw_root = true,
                b"p" => current = Some(frame(e)?),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"br" => {
                    if let Some(frame) = current.as_mut() {
                        frame.text.push('\n');
                    }
                }
                b"p" => frames.push(frame(e)?),
                _ => {}
            },
            Ok(Event::Text(ref t)) => {
                if let Some(frame) = current.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| TubeSyncError::parsing(format!("bad subtitle text: {}", e)))?;
                    frame.text.push_str(&text);
                }
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"p" => {
                if let Some(frame) = current.take() {
                    frames.push(frame);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(TubeSyncError::parsing(format!(
                    "TTML error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(TubeSyncError::parsing("document has no tt root"));
    }
    Ok(frames)
}

fn frame(element: &BytesStart) -> Result<Frame> {
    let mut begin = None;
    let mut end = None;
    for attr in element.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        match attr.key.local_name().as_ref() {
            b"begin" => begin = Some(parse_time(&value)?),
            b"end" => end = Some(parse_time(&value)?),
            _ => {}
        }
    }
    let begin = begin.ok_or_else(|| TubeSyncError::parsing("subtitle frame without begin"))?;
    Ok(Frame {
        begin,
        end: end.unwrap_or(begin),
        text: String::new(),
    })
}

/// Milliseconds from `HH:MM:SS.fff`, `12.5s` or `1500ms`
fn parse_time(value: &str) -> Result<u64> {
    let bad = || TubeSyncError::parsing(format!("bad subtitle time: {}", value));
    let value = value.trim();

    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse::<f64>().map(|v| v.round() as u64).map_err(|_| bad());
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.parse::<f64>().map(|v| (v * 1000.0).round() as u64).map_err(|_| bad());
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return Err(bad());
    }
    let hours: u64 = parts[0].parse().map_err(|_| bad())?;
    let minutes: u64 = parts[1].parse().map_err(|_| bad())?;
    let seconds: f64 = parts[2].parse().map_err(|_| bad())?;
    Ok((hours * 3600 + minutes * 60) * 1000 + (seconds * 1000.0).round() as u64)
}

fn srt_time(ms: u64) -> String {
    format!(
        "{:02}:{:02}:{:02},{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<tt xmlns="http://www.w3.org/ns/ttml" xml:lang="en">
  <body>
    <div>
      <p begin="00:00:01.000" end="00:00:03.500">Hello<br/>world</p>
      <p begin="00:00:04.000" end="00:00:05.000"></p>
      <p begin="5.25s" end="6100ms">Fish &amp; chips</p>
      <p begin="00:01:02.003" end="01:00:00.000">Fish &amp; chips</p>
    </div>
  </body>
</tt>"#;

    #[test]
    fn test_srt_output() {
        let srt = ttml_to_srt(TTML, false, false).unwrap();
        assert!(srt.starts_with("1\n00:00:01,000 --> 00:00:03,500\nHello\nworld\n\n"));
        assert!(srt.contains("2\n00:00:04,000 --> 00:00:05,000\n\n\n"));
        assert!(srt.contains("3\n00:00:05,250 --> 00:00:06,100\nFish & chips\n\n"));
        assert!(srt.contains("4\n00:01:02,003 --> 01:00:00,000\nFish & chips\n\n"));
    }

    #[test]
    fn test_ignore_empty_and_repeated_frames() {
        let srt = ttml_to_srt(TTML, true, true).unwrap();
        assert_eq!(
            srt,
            "1\n00:00:01,000 --> 00:00:03,500\nHello\nworld\n\n2\n00:00:05,250 --> 00:00:06,100\nFish & chips\n\n"
        );
    }

    #[test]
    fn test_rejects_non_ttml() {
        assert!(ttml_to_srt("<html><body/></html>", false, false).is_err());
        assert!(parse_time("soon").is_err());
    }

    #[tokio::test]
    async fn test_converter_rewrites_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.srt");
        std::fs::write(&path, TTML).unwrap();

        let input = PostprocessingInput {
            path: path.clone(),
            offsets: vec![0],
        };
        TtmlConverter.run(&input, &["true".to_string()]).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("1\n00:00:01,000"));
        assert!(!written.contains("<tt"));
    }

    #[test]
    fn test_registry() {
        assert!(algorithm(ALGORITHM_TTML).is_some());
        assert!(algorithm("mp4-muxer").is_none());
        let ttml = algorithm(ALGORITHM_TTML).unwrap();
        assert!(ttml.works_on_same_file());
        assert!(!ttml.reserve_space());
    }
}
