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


//! Text helpers shared by the extractors
//!
//! `match_group1` is strict: no match is an error, never an empty string.
//! Callers decide whether a miss means "optional field absent" or a real
//! page-structure failure.

use crate::error::{Result, TubeSyncError};
use regex::Regex;
use std::collections::HashMap;

/// First capture group of `pattern` in `input`
pub fn match_group1(pattern: &str, input: &str) -> Result<String> {
    let re = Regex::new(pattern)?;
    match_group1_re(&re, input)
}

/// Same as `match_group1` with a precompiled expression
pub fn match_group1_re(re: &Regex, input: &str) -> Result<String> {
    re.captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| TubeSyncError::regex_miss(re.as_str()))
}

/// Decode an `a=1&b=2` parameter string. Later duplicates win.
pub fn parse_map(input: &str) -> HashMap<String, String> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((decode_component(key), decode_component(value)))
        })
        .collect()
}

/// Form-style decoding: `+` is a space, malformed escapes are kept verbatim
pub fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Unescape the HTML entities and `\uXXXX` escapes that show up in stream maps
pub fn unescape_entities(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref UNICODE_ESCAPE: Regex = Regex::new(r"\\u([0-9a-fA-F]{4})").unwrap();
        static ref NUMERIC_ENTITY: Regex = Regex::new(r"&#(x?[0-9a-fA-F]+);").unwrap();
    }

    let unicode = UNICODE_ESCAPE.replace_all(input, |caps: &regex::Captures| {
        u32::from_str_radix(&caps[1], 16)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });

    let numeric = NUMERIC_ENTITY.replace_all(&unicode, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });

    numeric
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parse `h:mm:ss`, `m:ss` or `ss` into seconds
pub fn parse_duration_string(input: &str) -> Result<u64> {
    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 4 {
        return Err(TubeSyncError::parsing(format!("invalid duration '{}'", input)));
    }

    // days, hours, minutes, seconds from the right
    let multipliers = [1u64, 60, 3600, 86400];
    let mut total = 0u64;
    for (i, part) in parts.iter().rev().enumerate() {
        let value: u64 = part
            .trim()
            .parse()
            .map_err(|_| TubeSyncError::parsing(format!("invalid duration '{}'", input)))?;
        total += value * multipliers[i];
    }
    Ok(total)
}

/// Strip everything but ASCII digits
pub fn digits_only(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Query parameter of a URL, decoded
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.splitn(2, '?').nth(1)?;
    let query = query.split('#').next().unwrap_or(query);
    parse_map(query).remove(name)
}
