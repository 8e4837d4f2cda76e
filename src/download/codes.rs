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


//! Mission error codes
//!
//! Codes are persisted in mission metadata and shown to the user, so the
//! numbers are stable. HTTP failures store the status code itself.

use crate::error::{TubeSyncError, ENOSPC};

pub const ERROR_NOTHING: i32 = -1;
pub const ERROR_PATH_CREATION: i32 = 1000;
pub const ERROR_FILE_CREATION: i32 = 1001;
pub const ERROR_UNKNOWN_EXCEPTION: i32 = 1002;
pub const ERROR_PERMISSION_DENIED: i32 = 1003;
pub const ERROR_SSL_EXCEPTION: i32 = 1004;
pub const ERROR_UNKNOWN_HOST: i32 = 1005;
pub const ERROR_CONNECT_HOST: i32 = 1006;
pub const ERROR_POSTPROCESSING: i32 = 1007;
pub const ERROR_POSTPROCESSING_STOPPED: i32 = 1008;
pub const ERROR_POSTPROCESSING_HOLD: i32 = 1009;
pub const ERROR_INSUFFICIENT_STORAGE: i32 = 1010;
pub const ERROR_PROGRESS_LOST: i32 = 1011;
pub const ERROR_TIMEOUT: i32 = 1012;
pub const ERROR_RESOURCE_GONE: i32 = 1013;
pub const ERROR_HTTP_NO_CONTENT: i32 = 204;
pub const ERROR_HTTP_FORBIDDEN: i32 = 403;

/// Classify an error into a mission error code
pub fn error_code_for(error: &TubeSyncError) -> i32 {
    match error {
        TubeSyncError::HttpStatus { status, .. } => *status as i32,
        TubeSyncError::RangeNotSatisfiable => 416,
        TubeSyncError::ResourceGone => ERROR_RESOURCE_GONE,
        TubeSyncError::MissionFailed { code, .. } => *code,
        TubeSyncError::PostProcessing { .. } => ERROR_POSTPROCESSING,
        TubeSyncError::Timeout(_) => ERROR_TIMEOUT,
        TubeSyncError::NetworkError { .. } => ERROR_CONNECT_HOST,
        TubeSyncError::FileNotFound(_) => ERROR_FILE_CREATION,
        TubeSyncError::PermissionDenied(_) => ERROR_PERMISSION_DENIED,
        TubeSyncError::InsufficientStorage(_) => ERROR_INSUFFICIENT_STORAGE,
        TubeSyncError::PathCreation(_) => ERROR_PATH_CREATION,
        TubeSyncError::IoError(e) => io_error_code(e),
        TubeSyncError::ReqwestError(e) => reqwest_error_code(e),
        _ => ERROR_UNKNOWN_EXCEPTION,
    }
}

fn io_error_code(error: &std::io::Error) -> i32 {
    if error.raw_os_error() == Some(ENOSPC) {
        return ERROR_INSUFFICIENT_STORAGE;
    }
    match error.kind() {
        std::io::ErrorKind::NotFound => ERROR_FILE_CREATION,
        std::io::ErrorKind::PermissionDenied => ERROR_PERMISSION_DENIED,
        std::io::ErrorKind::TimedOut => ERROR_TIMEOUT,
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => ERROR_CONNECT_HOST,
        _ => ERROR_UNKNOWN_EXCEPTION,
    }
}

fn reqwest_error_code(error: &reqwest::Error) -> i32 {
    if let Some(status) = error.status() {
        return status.as_u16() as i32;
    }

    let chain = source_chain(error).to_lowercase();
    if chain.contains("dns error") || chain.contains("failed to lookup address") {
        ERROR_UNKNOWN_HOST
    } else if chain.contains("certificate") || chain.contains("tls") || chain.contains("handshake") {
        ERROR_SSL_EXCEPTION
    } else if error.is_timeout() {
        ERROR_TIMEOUT
    } else if error.is_connect() {
        ERROR_CONNECT_HOST
    } else {
        ERROR_UNKNOWN_EXCEPTION
    }
}

fn source_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// Codes the scheduler retries on its own; everything else dequeues the mission
pub fn keeps_enqueued(code: i32) -> bool {
    matches!(
        code,
        ERROR_SSL_EXCEPTION | ERROR_UNKNOWN_HOST | ERROR_CONNECT_HOST | ERROR_TIMEOUT
    ) || (500..600).contains(&code)
}

/// Short description for display
pub fn describe(code: i32) -> String {
    match code {
        ERROR_NOTHING => "no error".to_string(),
        ERROR_PATH_CREATION => "cannot create the download directory".to_string(),
        ERROR_FILE_CREATION => "cannot create the output file".to_string(),
        ERROR_PERMISSION_DENIED => "permission denied".to_string(),
        ERROR_SSL_EXCEPTION => "secure connection failed".to_string(),
        ERROR_UNKNOWN_HOST => "unknown host".to_string(),
        ERROR_CONNECT_HOST => "cannot connect to the server".to_string(),
        ERROR_POSTPROCESSING => "post-processing failed".to_string(),
        ERROR_POSTPROCESSING_STOPPED => "post-processing was interrupted".to_string(),
        ERROR_POSTPROCESSING_HOLD => "post-processing is on hold".to_string(),
        ERROR_INSUFFICIENT_STORAGE => "not enough free space".to_string(),
        ERROR_PROGRESS_LOST => "the output file is gone, progress lost".to_string(),
        ERROR_TIMEOUT => "connection timed out".to_string(),
        ERROR_RESOURCE_GONE => "the resource is no longer available".to_string(),
        ERROR_HTTP_NO_CONTENT => "the server returned no content".to_string(),
        ERROR_HTTP_FORBIDDEN => "access forbidden".to_string(),
        ERROR_UNKNOWN_EXCEPTION => "unknown error".to_string(),
        status => format!("HTTP {}", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_for_errors() {
        assert_eq!(error_code_for(&TubeSyncError::http(503, None)), 503);
        assert_eq!(error_code_for(&TubeSyncError::Timeout("read".into())), ERROR_TIMEOUT);
        assert_eq!(
            error_code_for(&TubeSyncError::from(std::io::Error::from_raw_os_error(ENOSPC))),
            ERROR_INSUFFICIENT_STORAGE
        );
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(error_code_for(&TubeSyncError::from(denied)), ERROR_PERMISSION_DENIED);
        assert_eq!(error_code_for(&TubeSyncError::internal("boom")), ERROR_UNKNOWN_EXCEPTION);
    }

    #[test]
    fn test_enqueue_policy() {
        assert!(keeps_enqueued(ERROR_TIMEOUT));
        assert!(keeps_enqueued(ERROR_UNKNOWN_HOST));
        assert!(keeps_enqueued(502));
        assert!(!keeps_enqueued(404));
        assert!(!keeps_enqueued(ERROR_PERMISSION_DENIED));
        assert!(!keeps_enqueued(ERROR_INSUFFICIENT_STORAGE));
    }
}
