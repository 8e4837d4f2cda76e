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


//! Page downloads for the extractors
//!
//! Extractors only ever ask for the body of a URL as text, so they depend on
//! the [`Downloader`] trait. [`HttpDownloader`] is the reqwest implementation.
//! Watch pages set consent cookies, so its client keeps a cookie store.
//!
//! Connection failures, 5xx and 429 replies are retried with exponential
//! backoff (1s, 2s, 4s by default). Any other status fails immediately.

use crate::error::{Result, TubeSyncError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:68.0) Gecko/20100101 Firefox/68.0";

/// Fetches text resources for the extractors
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` and return the body as text
    async fn download(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Total tries per page, at least 1
    pub attempts: u32,
    /// Delay before the first retry, doubled for each further one
    pub backoff: Duration,
    pub user_agent: String,
    pub cookies: bool,
    /// Sent as `Accept-Language` so localized pages parse the same way
    pub language: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            attempts: 3,
            backoff: Duration::from_secs(1),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookies: true,
            language: Some("en".to_string()),
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.connect_timeout = self.connect_timeout.min(timeout);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_language(mut self, language: Option<&str>) -> Self {
        self.language = language.map(str::to_string);
        self
    }

    pub fn without_cookies(mut self) -> Self {
        self.cookies = false;
        self
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let agent = HeaderValue::from_str(&self.user_agent)
            .map_err(|e| TubeSyncError::invalid_input(format!("user agent: {}", e)))?;
        headers.insert(USER_AGENT, agent);

        if let Some(language) = &self.language {
            let language = HeaderValue::from_str(language)
                .map_err(|e| TubeSyncError::invalid_input(format!("language: {}", e)))?;
            headers.insert(ACCEPT_LANGUAGE, language);
        }
        Ok(headers)
    }
}

/// Result of a single request
enum Attempt {
    Body(String),
    Retry(TubeSyncError),
    Fail(TubeSyncError),
}

/// reqwest-backed [`Downloader`]
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
    config: ClientConfig,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .default_headers(config.default_headers()?)
            .cookie_store(config.cookies)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn attempt(&self, url: &str) -> Attempt {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                let transient = e.is_timeout() || e.is_connect() || e.is_request();
                let error = TubeSyncError::network_error(format!("request failed: {}", e), transient);
                return if transient { Attempt::Retry(error) } else { Attempt::Fail(error) };
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.text().await {
                Ok(body) => Attempt::Body(body),
                Err(e) => Attempt::Retry(TubeSyncError::network_error(format!("read failed: {}", e), true)),
            };
        }

        let error = TubeSyncError::http(status.as_u16(), Some(url.to_string()));
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Attempt::Retry(error)
        } else {
            Attempt::Fail(error)
        }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<String> {
        let mut attempt = 1;
        loop {
            match self.attempt(url).await {
                Attempt::Body(body) => {
                    debug!(url, attempt, bytes = body.len(), "downloaded page");
                    return Ok(body);
                }
                Attempt::Fail(error) => return Err(error),
                Attempt::Retry(error) if attempt >= self.config.attempts => return Err(error),
                Attempt::Retry(error) => {
                    let delay = self.config.backoff * 2_u32.pow(attempt - 1);
                    warn!(url, attempt, error = %error, delay_ms = delay.as_millis() as u64, "page download failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
