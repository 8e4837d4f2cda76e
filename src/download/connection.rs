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


//! HTTP plumbing for missions
//!
//! Every request carries the configured user agent, `Accept: */*` and a
//! connect timeout. Waiting for response headers and for each body chunk is
//! bounded by the read timeout, and both are raced against the mission's
//! cancellation token.

use crate::config::DownloadConfig;
use crate::error::{Result, TubeSyncError};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, Method, Response, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Build the client shared by every mission of a manager
pub fn build_client(config: &DownloadConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

    Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(|e| TubeSyncError::ConfigurationError(format!("Failed to create HTTP client: {}", e)))
}

/// Byte range for a request. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn between(start: u64, end: u64) -> Self {
        Self { start, end: Some(end) }
    }

    fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Send a request. `if_range` makes the range conditional on a validator.
///
/// Fails with [`TubeSyncError::Timeout`] when no response headers arrive
/// within `read_timeout`.
pub async fn open(
    client: &Client,
    read_timeout: Duration,
    url: &str,
    head: bool,
    range: Option<ByteRange>,
    if_range: Option<&str>,
    token: &CancellationToken,
) -> Result<Response> {
    let method = if head { Method::HEAD } else { Method::GET };
    let mut request = client.request(method, url);
    if let Some(range) = range {
        request = request.header(RANGE, range.header_value());
    }
    if let Some(condition) = if_range {
        request = request.header(IF_RANGE, condition);
    }

    trace!(url, ?range, head, "opening connection");
    tokio::select! {
        response = tokio::time::timeout(read_timeout, request.send()) => match response {
            Ok(response) => Ok(response?),
            Err(_) => Err(TubeSyncError::Timeout(format!("no response for {}s", read_timeout.as_secs()))),
        },
        _ = token.cancelled() => Err(TubeSyncError::Cancelled),
    }
}

/// Reject statuses a download cannot use. 416 is left to the caller.
pub fn establish(response: Response) -> Result<Response> {
    let status = response.status();
    match status.as_u16() {
        204 | 205 | 207 => Err(TubeSyncError::http(status.as_u16(), Some(response.url().to_string()))),
        416 => Ok(response),
        _ if status.is_success() => Ok(response),
        code => Err(TubeSyncError::http(code, Some(response.url().to_string()))),
    }
}

/// Total resource size from `Content-Range`, else `Content-Length`, else -1
pub fn content_length(response: &Response) -> i64 {
    let total = total_length(response);
    if total >= 0 {
        return total;
    }
    // content_length() is the body size, which is zero for HEAD
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(-1)
}

/// Total from `Content-Range: bytes a-b/total`, -1 when absent or `*`
pub fn total_length(response: &Response) -> i64 {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse().ok())
        .unwrap_or(-1)
}

/// `ETag`, else `Last-Modified`
pub fn validation_condition(response: &Response) -> Option<String> {
    [ETAG, LAST_MODIFIED].into_iter().find_map(|name| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    })
}

pub fn is_partial(response: &Response) -> bool {
    response.status() == StatusCode::PARTIAL_CONTENT
}

/// Next body chunk, `None` at end of body
pub async fn next_chunk(
    response: &mut Response,
    read_timeout: Duration,
    token: &CancellationToken,
) -> Result<Option<Vec<u8>>> {
    tokio::select! {
        chunk = tokio::time::timeout(read_timeout, response.chunk()) => match chunk {
            Ok(chunk) => chunk
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .map_err(|e| TubeSyncError::network_error(format!("read failed: {}", e), true)),
            Err(_) => Err(TubeSyncError::Timeout(format!("no data for {}s", read_timeout.as_secs()))),
        },
        _ = token.cancelled() => Err(TubeSyncError::Cancelled),
    }
}
