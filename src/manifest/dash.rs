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


//! DASH manifest audio extraction
//!
//! Walks `AdaptationSet`/`Representation` elements and turns every audio
//! representation with a `BaseURL` into a stream descriptor. The MIME type may
//! sit on either element; the representation wins.

use crate::error::{Result, TubeSyncError};
use crate::extractor::client::Downloader;
use crate::extractor::format::MediaFormat;
use crate::extractor::stream::StreamDescriptor;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

#[derive(Debug, Default)]
struct Representation {
    mime_type: Option<String>,
    bandwidth: u32,
    sampling_rate: u32,
    base_url: String,
}

/// Fetch a manifest and extract its audio streams
pub async fn audio_streams(downloader: &dyn Downloader, manifest_url: &str) -> Result<Vec<StreamDescriptor>> {
    let xml = downloader.download(manifest_url).await?;
    let streams = parse_audio_streams(&xml)?;
    debug!(manifest_url, count = streams.len(), "parsed dash manifest");
    Ok(streams)
}

/// Audio streams of a DASH manifest document
pub fn parse_audio_streams(xml: &str) -> Result<Vec<StreamDescriptor>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut streams = Vec::new();
    let mut adaptation_mime: Option<String> = None;
    let mut current: Option<Representation> = None;
    let mut in_base_url = false;
    let mut saw_mpd = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"MPD" => saw_mpd = true,
                b"AdaptationSet" => adaptation_mime = attribute(e, "mimeType"),
                b"Representation" => current = Some(representation(e)),
                b"BaseURL" if current.is_some() => in_base_url = true,
                _ => {}
            },
            // a self-closing representation has no BaseURL and is skipped
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"MPD" {
                    saw_mpd = true;
                }
            }
            Ok(Event::Text(ref t)) if in_base_url => {
                let text = t
                    .unescape()
                    .map_err(|e| TubeSyncError::manifest(format!("bad BaseURL text: {}", e)))?;
                if let Some(rep) = current.as_mut() {
                    rep.base_url.push_str(text.trim());
                }
            }
            Ok(Event::CData(ref t)) if in_base_url => {
                if let Some(rep) = current.as_mut() {
                    rep.base_url.push_str(String::from_utf8_lossy(t.as_ref()).trim());
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"BaseURL" => in_base_url = false,
                b"Representation" => {
                    if let Some(rep) = current.take() {
                        if let Some(stream) = audio_stream(rep, adaptation_mime.as_deref()) {
                            streams.push(stream);
                        }
                    }
                }
                b"AdaptationSet" => adaptation_mime = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(TubeSyncError::manifest(format!(
                    "XML error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    if !saw_mpd {
        return Err(TubeSyncError::manifest("document has no MPD root"));
    }
    Ok(streams)
}

fn attribute(element: &BytesStart, name: &str) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name.as_bytes())
        .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
}

fn representation(element: &BytesStart) -> Representation {
    Representation {
        mime_type: attribute(element, "mimeType"),
        bandwidth: attribute(element, "bandwidth")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        sampling_rate: attribute(element, "audioSamplingRate")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        base_url: String::new(),
    }
}

fn audio_stream(rep: Representation, adaptation_mime: Option<&str>) -> Option<StreamDescriptor> {
    let mime = rep.mime_type.as_deref().or(adaptation_mime)?;
    if !mime.starts_with("audio") || rep.base_url.is_empty() {
        return None;
    }
    let format = MediaFormat::from_mime_type(mime)?;
    Some(StreamDescriptor::audio(
        rep.base_url,
        format,
        rep.bandwidth,
        rep.sampling_rate,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:DASH:schema:MPD:2011" type="static" mediaPresentationDuration="PT247S">
  <Period>
    <AdaptationSet id="0" mimeType="audio/mp4" subsegmentAlignment="true">
      <Representation id="140" codecs="mp4a.40.2" audioSamplingRate="44100" bandwidth="130000">
        <AudioChannelConfiguration schemeIdUri="urn:mpeg:dash:23003:3:audio_channel_configuration:2011" value="2"/>
        <BaseURL>https://r1.example.com/videoplayback?itag=140&amp;sig=A</BaseURL>
      </Representation>
    </AdaptationSet>
    <AdaptationSet id="1" mimeType="audio/webm">
      <Representation id="251" codecs="opus" audioSamplingRate="48000" bandwidth="160000">
        <BaseURL>https://r1.example.com/videoplayback?itag=251</BaseURL>
      </Representation>
      <Representation id="999" bandwidth="1"/>
    </AdaptationSet>
    <AdaptationSet id="2" mimeType="video/mp4">
      <Representation id="137" bandwidth="4000000" width="1920" height="1080">
        <BaseURL>https://r1.example.com/videoplayback?itag=137</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn test_audio_representations_extracted() {
        let streams = parse_audio_streams(MANIFEST).unwrap();
        assert_eq!(streams.len(), 2);

        assert_eq!(streams[0].format, MediaFormat::M4a);
        assert_eq!(streams[0].url, "https://r1.example.com/videoplayback?itag=140&sig=A");
        assert_eq!(streams[0].bitrate(), Some(130000));
        assert_eq!(streams[0].sampling_rate, Some(44100));

        assert_eq!(streams[1].format, MediaFormat::Webma);
        assert_eq!(streams[1].sampling_rate, Some(48000));
    }

    #[test]
    fn test_not_a_manifest() {
        assert!(parse_audio_streams("<html><body/></html>").is_err());
    }
}
