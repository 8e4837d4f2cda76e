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


//! Content URL to video id conversion
//!
//! Accepted shapes:
//! - `youtube.com/watch?v=ID`, `watch_popup?v=ID`, `m.youtube.com/watch?v=ID`
//! - `youtu.be/ID`
//! - `youtube.com/embed/ID`, `youtube-nocookie.com/embed/ID`, `youtube.com/v/ID`
//! - `youtube.com/attribution_link?u=<encoded watch path>`
//! - `vnd.youtube://<any of the above>` and `vnd.youtube:ID`
//!
//! Hosts and schemes are matched case-insensitively. Ids are 11 characters of
//! `[A-Za-z0-9_-]`; anything following the id is ignored.

use crate::error::{Result, TubeSyncError};
use crate::extractor::parser::query_param;
use regex::Regex;
use url::Url;

const ID_LENGTH: usize = 11;

lazy_static::lazy_static! {
    static ref ID_PREFIX: Regex = Regex::new(r"^[A-Za-z0-9_-]+").unwrap();
}

/// Extract the canonical video id from a content URL
pub fn video_id(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let lower = trimmed.to_ascii_lowercase();

    if lower.contains("doubleclick.net") || lower.contains("googleads") {
        return Err(TubeSyncError::FoundAd(trimmed.to_string()));
    }

    if lower.starts_with("vnd.youtube:") {
        let rest = &trimmed["vnd.youtube:".len()..];
        return match rest.strip_prefix("//") {
            Some(address) => video_id(&format!("https://{}", address)),
            None => validate_id(rest, trimmed),
        };
    }

    let parsed = Url::parse(trimmed)
        .map_err(|_| TubeSyncError::parsing(format!("invalid url: {}", trimmed)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TubeSyncError::parsing(format!("url has no host: {}", trimmed)))?
        .to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let host = host.strip_prefix("m.").unwrap_or(host);

    match host {
        "youtu.be" => {
            let segment = parsed.path().trim_start_matches('/');
            validate_id(segment, trimmed)
        }
        "youtube.com" | "youtube-nocookie.com" => {
            let path = parsed.path();
            if path == "/watch" || path == "/watch_popup" {
                let v = query_param(trimmed, "v")
                    .ok_or_else(|| TubeSyncError::parsing(format!("no video id in {}", trimmed)))?;
                validate_id(&v, trimmed)
            } else if let Some(rest) = path
                .strip_prefix("/embed/")
                .or_else(|| path.strip_prefix("/v/"))
            {
                validate_id(rest, trimmed)
            } else if path == "/attribution_link" {
                let target = query_param(trimmed, "u")
                    .ok_or_else(|| TubeSyncError::parsing(format!("no target in {}", trimmed)))?;
                video_id(&format!("https://www.youtube.com{}", target))
            } else {
                Err(TubeSyncError::parsing(format!("no video id in {}", trimmed)))
            }
        }
        _ => Err(TubeSyncError::UnsupportedUrl(trimmed.to_string())),
    }
}

fn validate_id(candidate: &str, url: &str) -> Result<String> {
    let id = ID_PREFIX
        .find(candidate)
        .map(|m| m.as_str())
        .unwrap_or_default();
    if id.len() == ID_LENGTH {
        Ok(id.to_string())
    } else {
        Err(TubeSyncError::parsing(format!("invalid video id in {}", url)))
    }
}

/// Whether `url` is a content URL this handler understands
pub fn accepts_url(url: &str) -> bool {
    video_id(url).is_ok()
}

/// Canonical watch page URL for a content URL
pub fn clean_url(url: &str) -> Result<String> {
    Ok(watch_url(&video_id(url)?))
}

pub fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

pub fn embed_url(id: &str) -> String {
    format!("https://www.youtube.com/embed/{}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AD_URL: &str = "https://googleads.g.doubleclick.net/aclk?sa=l&ai=C-2IPgeVTWPf4&num=1&ctype=21&video_id=dMO_IXYPZew&adurl=http://www.youtube.com/watch%3Fv%3DdMO_IXYPZew";

    #[test]
    fn test_ids_from_known_shapes() {
        let cases = [
            ("https://www.youtube.com/watch?v=jZViOEv90dI", "jZViOEv90dI"),
            ("https://www.youtube.com/watch?v=W-fFHeTX70Q", "W-fFHeTX70Q"),
            ("https://www.youtube.com/watch?v=jZViOEv90dI?t=100", "jZViOEv90dI"),
            ("https://WWW.YouTube.com/watch?v=jZViOEv90dI?t=100", "jZViOEv90dI"),
            ("HTTPS://www.youtube.com/watch?v=jZViOEv90dI?t=100", "jZViOEv90dI"),
            ("https://youtu.be/jZViOEv90dI?t=9s", "jZViOEv90dI"),
            ("HTTPS://Youtu.be/jZViOEv90dI?t=9s", "jZViOEv90dI"),
            ("http://www.youtube.com/watch_popup?v=uEJuoEs1UxY", "uEJuoEs1UxY"),
            ("http://www.Youtube.com/watch_popup?v=uEJuoEs1UxY", "uEJuoEs1UxY"),
            ("https://www.youtube.com/embed/jZViOEv90dI", "jZViOEv90dI"),
            ("https://www.youtube-nocookie.com/embed/jZViOEv90dI", "jZViOEv90dI"),
            ("http://youtube.com/watch?v=jZViOEv90dI", "jZViOEv90dI"),
            ("https://youtu.be/7_WWz2DSnT8", "7_WWz2DSnT8"),
            ("https://m.youtube.com/watch?v=oy6NvWeVruY", "oy6NvWeVruY"),
            (
                "http://www.youtube.com/attribution_link?a=JdfC0C9V6ZI&u=%2Fwatch%3Fv%3DEhxJLojIE_o%26feature%3Dshare",
                "EhxJLojIE_o",
            ),
            ("vnd.youtube://www.youtube.com/watch?v=jZViOEv90dI", "jZViOEv90dI"),
            ("vnd.youtube:jZViOEv90dI", "jZViOEv90dI"),
        ];
        for (url, id) in cases {
            assert_eq!(video_id(url).unwrap(), id, "{}", url);
            assert!(accepts_url(url));
        }
    }

    #[test]
    fn test_invalid_urls_are_parsing_errors() {
        for url in [
            "https://www.youtube.com/watch?v=jZViOEv90d",
            "https://www.youtube.com/watchjZViOEv90dI",
            "https://www.youtube.com/",
        ] {
            let err = video_id(url).unwrap_err();
            assert!(err.is_parsing_error(), "{}: {:?}", url, err);
        }
    }

    #[test]
    fn test_ad_url_rejected() {
        assert!(matches!(video_id(AD_URL), Err(TubeSyncError::FoundAd(_))));
    }

    #[test]
    fn test_clean_url() {
        assert_eq!(
            clean_url("https://youtu.be/jZViOEv90dI?t=9s").unwrap(),
            "https://www.youtube.com/watch?v=jZViOEv90dI"
        );
    }
}
