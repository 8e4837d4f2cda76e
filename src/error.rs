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


//! Error types for TubeSync
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by domain (extraction, decryption, download, storage, etc.)
//! so callers can decide between falling back, retrying, or asking the user.
//!
//! ## Categories
//!
//! ### Extraction
//! - `Parsing` - the page no longer matches the expected structure
//! - `RegexMiss` - a pattern had no match (usually an optional field being absent)
//! - `ContentNotAvailable` / `ContentBlocked` - the page explicitly says the
//!   content is gone or licensed away from this region
//! - `LiveStream`, `FoundAd`, `UnsupportedUrl`
//!
//! ### Signature decryption
//! - `Decryption` - the player script changed shape. Logged separately since it
//!   means every stream URL will be unusable until the transform is updated.
//!
//! ### Download
//! - `NetworkError`, `Timeout` - transport failures, always retryable
//! - `HttpStatus` - unexpected status codes, classified by range
//! - `ResourceGone` - the signed URL expired and could not be recovered
//!
//! ### Storage
//! - `PermissionDenied`, `InsufficientStorage`, `PathCreation` - fatal to a
//!   mission, the user has to pick another location

use thiserror::Error;

/// Result type alias using our TubeSyncError type
pub type Result<T> = std::result::Result<T, TubeSyncError>;

/// Main error type for TubeSync
#[derive(Error, Debug)]
pub enum TubeSyncError {
    // ===== Extraction Errors =====

    /// Page structure did not match what the extractor expects
    #[error("Parsing failed: {message}")]
    Parsing { message: String },

    /// A required pattern had no match in the input
    #[error("Pattern not found: {pattern}")]
    RegexMiss { pattern: String },

    /// The page reports the content as removed, private or otherwise unavailable
    #[error("Content not available: {0}")]
    ContentNotAvailable(String),

    /// Content blocked by a regional licensing agreement
    #[error("Content blocked by licensing: {0}")]
    ContentBlocked(String),

    /// Live broadcasts have no downloadable stream map
    #[error("Live streams are not supported")]
    LiveStream,

    /// URL points at an advertisement redirect
    #[error("Advertisement URL: {0}")]
    FoundAd(String),

    /// URL does not belong to a supported service
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    // ===== Signature Decryption Errors =====

    /// Could not derive or run the signature transform
    #[error("Signature decryption failed at {stage}: {message}")]
    Decryption { stage: String, message: String },

    // ===== Manifest Errors =====

    /// DASH manifest or HLS playlist could not be parsed
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Refreshed HLS playlist could not be reconciled with the previous one
    #[error("Playlist refresh failed: {0}")]
    PlaylistRefresh(String),

    // ===== Download Errors =====

    /// Network error during a request
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether the error is transient and retryable
        is_transient: bool,
    },

    /// Server answered with a status the caller cannot handle
    #[error("Unexpected HTTP status {status}")]
    HttpStatus {
        status: u16,
        url: Option<String>,
    },

    /// Requested range was rejected by the server
    #[error("Range not satisfiable")]
    RangeNotSatisfiable,

    /// Stream URL expired and no fresh one could be resolved
    #[error("Resource is gone")]
    ResourceGone,

    /// A mission stopped with a sticky error code
    #[error("Mission failed with code {code}: {message}")]
    MissionFailed { code: i32, message: String },

    /// Post-processing step failed
    #[error("Post-processing '{algorithm}' failed: {message}")]
    PostProcessing { algorithm: String, message: String },

    /// Operation was cancelled by the user
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ===== File Errors =====

    /// File not found at path
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Permission denied for file operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No space left on the output device
    #[error("Insufficient storage: {0}")]
    InsufficientStorage(String),

    /// Output or metadata directory could not be created
    #[error("Could not create path: {0}")]
    PathCreation(String),

    // ===== Database Errors =====

    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Record not found in database
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ===== Configuration Errors =====

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Invalid input parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state for requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// SQLx database error
    #[error("SQL error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid regular expression
    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    // ===== General Errors =====

    /// Internal error (unexpected state, should not happen)
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TubeSyncError {
    /// Create a Parsing error with a message
    pub fn parsing<S: Into<String>>(message: S) -> Self {
        TubeSyncError::Parsing {
            message: message.into(),
        }
    }

    /// Create a RegexMiss error for a pattern
    pub fn regex_miss<S: Into<String>>(pattern: S) -> Self {
        TubeSyncError::RegexMiss {
            pattern: pattern.into(),
        }
    }

    /// Create a Decryption error for a derivation stage
    pub fn decryption<S: Into<String>, M: Into<String>>(stage: S, message: M) -> Self {
        TubeSyncError::Decryption {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        TubeSyncError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create an HttpStatus error
    pub fn http(status: u16, url: Option<String>) -> Self {
        TubeSyncError::HttpStatus { status, url }
    }

    /// Create a Manifest error
    pub fn manifest<S: Into<String>>(message: S) -> Self {
        TubeSyncError::Manifest(message.into())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        TubeSyncError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        TubeSyncError::InternalError(message.into())
    }

    /// Page structure errors, including absent pattern matches
    pub fn is_parsing_error(&self) -> bool {
        matches!(
            self,
            TubeSyncError::Parsing { .. }
                | TubeSyncError::RegexMiss { .. }
                | TubeSyncError::SerdeJsonError(_)
        )
    }

    /// Content deliberately withheld by the site
    pub fn is_content_unavailable(&self) -> bool {
        matches!(
            self,
            TubeSyncError::ContentNotAvailable(_)
                | TubeSyncError::ContentBlocked(_)
                | TubeSyncError::LiveStream
        )
    }

    /// Signature transform could not be derived or executed
    pub fn is_decryption_error(&self) -> bool {
        matches!(self, TubeSyncError::Decryption { .. })
    }

    /// Timeouts, DNS and connection failures
    pub fn is_transport_error(&self) -> bool {
        match self {
            TubeSyncError::NetworkError { is_transient, .. } => *is_transient,
            TubeSyncError::Timeout(_) => true,
            TubeSyncError::ReqwestError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Permission, disk space and path errors
    pub fn is_storage_error(&self) -> bool {
        match self {
            TubeSyncError::PermissionDenied(_)
            | TubeSyncError::InsufficientStorage(_)
            | TubeSyncError::PathCreation(_)
            | TubeSyncError::FileNotFound(_) => true,
            TubeSyncError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
            ) || e.raw_os_error() == Some(ENOSPC),
            _ => false,
        }
    }

    /// Check if error is retryable without user interaction
    ///
    /// Returns `true` for transport failures and 5xx server errors.
    pub fn is_retryable(&self) -> bool {
        if self.is_transport_error() {
            return true;
        }
        match self {
            TubeSyncError::HttpStatus { status, .. } => (500..=599).contains(status),
            TubeSyncError::ReqwestError(e) => e
                .status()
                .map(|s| s.is_server_error())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// HTTP statuses that mean the signed URL has expired
    pub fn triggers_recovery(&self) -> bool {
        matches!(self, TubeSyncError::HttpStatus { status: 403, .. })
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            TubeSyncError::ContentBlocked(reason) => {
                format!("This video is not available in your country: {}", reason)
            }
            TubeSyncError::ContentNotAvailable(reason) => {
                format!("This video is unavailable: {}", reason)
            }
            TubeSyncError::Decryption { .. } => {
                "The site changed its player. Stream URLs cannot be unlocked until TubeSync is updated.".to_string()
            }
            TubeSyncError::PermissionDenied(path) => {
                format!("Cannot write to '{}'. Please choose another download location.", path)
            }
            TubeSyncError::InsufficientStorage(_) => {
                "Not enough free space. Free some storage or choose another location.".to_string()
            }
            TubeSyncError::ResourceGone => {
                "The download link expired and a new one could not be found.".to_string()
            }
            TubeSyncError::LiveStream => "Live streams cannot be downloaded.".to_string(),
            _ => self.to_string(),
        }
    }
}

/// errno for "no space left on device"
pub(crate) const ENOSPC: i32 = 28;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(TubeSyncError::regex_miss("x").is_parsing_error());
        assert!(TubeSyncError::ContentBlocked("GEMA".into()).is_content_unavailable());
        assert!(!TubeSyncError::ContentBlocked("GEMA".into()).is_parsing_error());
        assert!(TubeSyncError::decryption("function name", "missing").is_decryption_error());
        assert!(TubeSyncError::http(503, None).is_retryable());
        assert!(!TubeSyncError::http(404, None).is_retryable());
        assert!(TubeSyncError::http(403, None).triggers_recovery());
        assert!(TubeSyncError::network_error("reset", true).is_retryable());
    }

    #[test]
    fn test_storage_errors() {
        let io = std::io::Error::from_raw_os_error(ENOSPC);
        assert!(TubeSyncError::IoError(io).is_storage_error());
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(TubeSyncError::from(denied).is_storage_error());
    }
}
