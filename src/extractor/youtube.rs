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


//! YouTube watch page extractor
//!
//! # Sources
//! Every field has an ordered list of strategies, tried until one succeeds:
//! - **Player config** - the `ytplayer.config = {...};` JSON embedded in the
//!   page. Its `args` object carries title, author, length and the encoded
//!   stream maps.
//! - **Video info** - for age-restricted pages the player config is missing;
//!   the same keys come from the `get_video_info` parameter map instead.
//! - **HTML** - `<meta>` tags and a few well-known elements of the watch page.
//!
//! # Unavailable pages
//! When the player config is missing, the `h1#unavailable-message` element
//! decides what happened:
//! - contains `GEMA` → [`TubeSyncError::ContentBlocked`]
//! - any other text → [`TubeSyncError::ContentNotAvailable`]
//! - element absent → [`TubeSyncError::Parsing`] (layout changed, not a block)
//!
//! # Concurrency
//! `scraper::Html` is not `Send`, so the page is parsed once into a
//! [`PageSnapshot`] of plain strings right after download and the DOM is
//! dropped before any further await.

use crate::error::{Result, TubeSyncError};
use crate::extractor::client::Downloader;
use crate::extractor::format::{itag_item, ItagType};
use crate::extractor::info::{StreamPreview, StreamType};
use crate::extractor::parser::{
    digits_only, match_group1, match_group1_re, parse_duration_string, parse_map, unescape_entities,
};
use crate::extractor::signature::SignatureDecryptor;
use crate::extractor::stream::StreamDescriptor;
use crate::extractor::url_handler;
use crate::extractor::StreamExtractor;
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Service id of the YouTube extractor
pub const SERVICE_ID: i32 = 0;

const BASE_URL: &str = "https://www.youtube.com";
const GET_VIDEO_INFO_URL: &str =
    "https://www.youtube.com/get_video_info?video_id=%%video_id%%$$el_type$$&ps=default&eurl=&gl=US&hl=en";
const EL_INFO: &str = "el=info";
const AGE_RESTRICTION_MARKER: &str = "<meta property=\"og:restrictions:age";
const GEMA: &str = "GEMA";

lazy_static::lazy_static! {
    static ref PLAYER_CONFIG: Regex = Regex::new(r"ytplayer.config\s*=\s*(\{.*?\});").unwrap();
    static ref EMBED_ASSETS: Regex = Regex::new(r#""assets":.+?"js":\s*("[^"]+")"#).unwrap();
    static ref TIMESTAMP: Regex = Regex::new(r"((#|&|\?)t=\d{0,3}h?\d{0,3}m?\d{1,3}s?)").unwrap();
    static ref DASH_SIGNATURE: Regex = Regex::new(r"/s/([a-fA-F0-9\.]+)").unwrap();
}

/// Where player arguments come from
#[derive(Debug, Clone)]
enum PlayerSource {
    /// `args` of the embedded player config
    Args(Map<String, Value>),
    /// `get_video_info` response, for age-restricted videos
    VideoInfo(HashMap<String, String>),
}

impl PlayerSource {
    fn field(&self, key: &str) -> Option<String> {
        match self {
            PlayerSource::Args(args) => match args.get(key)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            },
            PlayerSource::VideoInfo(map) => map.get(key).cloned(),
        }
    }

    fn require(&self, key: &str) -> Result<String> {
        self.field(key)
            .ok_or_else(|| TubeSyncError::parsing(format!("player arguments have no '{}'", key)))
    }
}

/// Plain-data view of the watch page DOM
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub meta_title: Option<String>,
    pub description_html: Option<String>,
    pub uploader: Option<String>,
    pub view_count: Option<String>,
    pub upload_date: Option<String>,
    pub thumbnail_url: Option<String>,
    pub uploader_thumbnail_url: Option<String>,
    pub age_restriction: Option<String>,
    pub unavailable_message: Option<String>,
    /// Outer `None`: no button. Inner `None`: button without a counter.
    pub like_text: Option<Option<String>>,
    pub dislike_text: Option<Option<String>>,
    pub next_video: std::result::Result<StreamPreview, String>,
    pub related_videos: std::result::Result<Vec<StreamPreview>, String>,
}

impl PageSnapshot {
    /// Parse the page once and keep only what the accessors need
    pub fn parse(page: &str, page_url: &str) -> Result<Self> {
        let base = Url::parse(page_url)?;
        let doc = Html::parse_document(page);

        let meta = |css: &str| -> Result<Option<String>> {
            Ok(doc
                .select(&selector(css)?)
                .next()
                .and_then(|e| e.value().attr("content"))
                .map(str::to_string))
        };

        let meta_title = meta("meta[name=title]")?;
        let view_count = meta("meta[itemprop=interactionCount]")?;
        let upload_date = meta("meta[itemprop=datePublished]")?;
        let age_restriction = meta("meta[property=\"og:restrictions:age\"]")?;

        let description_html = doc
            .select(&selector("p#eow-description")?)
            .next()
            .map(|e| e.inner_html());
        let uploader = doc
            .select(&selector("div.yt-user-info")?)
            .next()
            .map(element_text);
        let thumbnail_url = doc
            .select(&selector("link[itemprop=\"thumbnailUrl\"]")?)
            .next()
            .and_then(|e| e.value().attr("href"))
            .and_then(|href| absolute(&base, href));
        let uploader_thumbnail_url = match doc.select(&selector("a[class*=\"yt-user-photo\"]")?).next() {
            Some(photo) => photo
                .select(&selector("img")?)
                .next()
                .and_then(|img| img.value().attr("data-thumb"))
                .and_then(|src| absolute(&base, src)),
            None => None,
        };
        let unavailable_message = doc
            .select(&selector("h1#unavailable-message")?)
            .next()
            .map(element_text);

        let like_text = button_counter(&doc, "button.like-button-renderer-like-button")?;
        let dislike_text = button_counter(&doc, "button.like-button-renderer-dislike-button")?;

        let next_video = match doc.select(&selector("div.watch-sidebar-section")?).next() {
            Some(section) => match section.select(&selector("li")?).next() {
                Some(li) => preview_from_item(li, &base).map_err(|e| e.to_string()),
                None => Err("sidebar section has no items".to_string()),
            },
            None => Err("no sidebar section".to_string()),
        };

        let related_videos = match doc.select(&selector("ul#watch-related")?).next() {
            Some(list) => {
                let content_link = selector("a[class*=\"content-link\"]")?;
                list.children()
                    .filter_map(ElementRef::wrap)
                    .filter(|li| li.select(&content_link).next().is_some())
                    .map(|li| preview_from_item(li, &base))
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| e.to_string())
            }
            None => Err("no related list".to_string()),
        };

        Ok(Self {
            meta_title,
            description_html,
            uploader,
            view_count,
            upload_date,
            thumbnail_url,
            uploader_thumbnail_url,
            age_restriction,
            unavailable_message,
            like_text,
            dislike_text,
            next_video,
            related_videos,
        })
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| TubeSyncError::internal(format!("bad selector {}: {:?}", css, e)))
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn absolute(base: &Url, href: &str) -> Option<String> {
    if href.is_empty() {
        return None;
    }
    base.join(href).ok().map(|u| u.to_string())
}

fn button_counter(doc: &Html, css: &str) -> Result<Option<Option<String>>> {
    let content = selector("span.yt-uix-button-content")?;
    Ok(doc
        .select(&selector(css)?)
        .next()
        .map(|button| button.select(&content).next().map(element_text)))
}

/// Preview of a linked video from one related-list item
fn preview_from_item(li: ElementRef, base: &Url) -> Result<StreamPreview> {
    let link = li
        .select(&selector("a.content-link")?)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| absolute(base, href))
        .ok_or_else(|| TubeSyncError::parsing("preview has no link"))?;
    let id = match_group1(r"v=([0-9a-zA-Z_-]*)", &link)?;

    let title = li
        .select(&selector("span.title")?)
        .next()
        .map(element_text)
        .ok_or_else(|| TubeSyncError::parsing("preview has no title"))?;

    // some items have no view count
    let view_count = li
        .select(&selector("span.view-count")?)
        .next()
        .and_then(|e| digits_only(&element_text(e)).parse::<u64>().ok())
        .unwrap_or(0);

    let uploader = li
        .select(&selector("span.g-hovercard")?)
        .next()
        .map(element_text)
        .ok_or_else(|| TubeSyncError::parsing("preview has no uploader"))?;

    let duration_text = li
        .select(&selector("span.video-time")?)
        .next()
        .map(element_text)
        .ok_or_else(|| TubeSyncError::parsing("preview has no duration"))?;
    let duration = parse_duration_string(&duration_text)?;

    let img = li
        .select(&selector("img")?)
        .next()
        .ok_or_else(|| TubeSyncError::parsing("preview has no thumbnail"))?;
    let mut thumbnail_url = img
        .value()
        .attr("src")
        .and_then(|src| absolute(base, src))
        .unwrap_or_default();
    // gif placeholders carry the real image in data-thumb
    if thumbnail_url.contains(".gif") {
        thumbnail_url = img.value().attr("data-thumb").unwrap_or_default().to_string();
    }
    if thumbnail_url.starts_with("//") {
        thumbnail_url = format!("https:{}", thumbnail_url);
    }

    Ok(StreamPreview {
        service_id: SERVICE_ID,
        url: link,
        id,
        title,
        uploader,
        view_count,
        duration,
        thumbnail_url,
    })
}

type Strategy<T> = fn(&YoutubeStreamExtractor) -> Result<T>;

/// Extractor for one watch page
pub struct YoutubeStreamExtractor {
    page_url: String,
    video_id: String,
    page: PageSnapshot,
    source: PlayerSource,
    player_url: String,
    age_restricted: bool,
    downloader: Arc<dyn Downloader>,
    decryptor: Arc<SignatureDecryptor>,
}

impl std::fmt::Debug for YoutubeStreamExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoutubeStreamExtractor")
            .field("page_url", &self.page_url)
            .field("video_id", &self.video_id)
            .field("player_url", &self.player_url)
            .field("age_restricted", &self.age_restricted)
            .finish()
    }
}

impl YoutubeStreamExtractor {
    /// Download and parse the watch page with the process-wide decryptor
    pub async fn fetch(page_url: &str, downloader: Arc<dyn Downloader>) -> Result<Self> {
        Self::fetch_with_decryptor(page_url, downloader, SignatureDecryptor::global()).await
    }

    pub async fn fetch_with_decryptor(
        page_url: &str,
        downloader: Arc<dyn Downloader>,
        decryptor: Arc<SignatureDecryptor>,
    ) -> Result<Self> {
        let video_id = url_handler::video_id(page_url)?;
        let clean_url = url_handler::watch_url(&video_id);
        debug!(%clean_url, "fetching watch page");

        let page_content = downloader.download(&clean_url).await?;
        let page = PageSnapshot::parse(&page_content, &clean_url)?;

        let (source, player_url, age_restricted) = if page_content.contains(AGE_RESTRICTION_MARKER) {
            info!(%video_id, "age restricted video, using video info");
            let info_url = GET_VIDEO_INFO_URL
                .replace("%%video_id%%", &video_id)
                .replace("$$el_type$$", &format!("&{}", EL_INFO));
            let info_page = downloader.download(&info_url).await?;
            let player_url = player_url_from_embed(downloader.as_ref(), &video_id).await?;
            (PlayerSource::VideoInfo(parse_map(&info_page)), player_url, true)
        } else {
            let config = player_config(&page_content, &page)?;
            let args = player_args(&config)?;
            let player_url = player_url_from_config(&config)?;
            (PlayerSource::Args(args), player_url, false)
        };

        Ok(Self {
            page_url: page_url.to_string(),
            video_id,
            page,
            source,
            player_url,
            age_restricted,
            downloader,
            decryptor,
        })
    }

    pub fn player_url(&self) -> &str {
        &self.player_url
    }

    pub fn is_age_restricted(&self) -> bool {
        self.age_restricted
    }

    pub fn snapshot(&self) -> &PageSnapshot {
        &self.page
    }

    fn first_success<T>(&self, field: &str, strategies: &[Strategy<T>]) -> Result<T> {
        let mut last_error = None;
        for strategy in strategies {
            match strategy(self) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(field, error = %e, "strategy failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(TubeSyncError::parsing(format!(
            "failed permanently to load {}: {}",
            field,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn page_field(value: &Option<String>, name: &str) -> Result<String> {
        value
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| TubeSyncError::parsing(format!("page has no {}", name)))
    }

    /// Streams of one kind from an encoded stream map
    ///
    /// Entries with unknown itags or missing fields are dropped. An entry whose
    /// signature cannot be decrypted is dropped too, but if nothing survives the
    /// decryption error is returned.
    async fn streams_from_map(&self, map_key: &str, wanted: ItagType) -> Result<Vec<StreamDescriptor>> {
        let encoded = self.source.require(map_key)?;
        let mut streams = Vec::new();
        let mut decryption_error = None;

        for entry in encoded.split(',').filter(|e| !e.trim().is_empty()) {
            let tags = parse_map(&unescape_entities(entry));
            let itag = match tags.get("itag").and_then(|i| i.parse::<u32>().ok()) {
                Some(itag) => itag,
                None => {
                    warn!(map_key, "stream entry without itag");
                    continue;
                }
            };
            let item = match itag_item(itag) {
                Some(item) if item.itag_type == wanted => item,
                _ => continue,
            };
            let mut url = match tags.get("url") {
                Some(url) if !url.is_empty() => url.clone(),
                _ => {
                    warn!(itag, "stream entry without url");
                    continue;
                }
            };

            if let Some(encrypted) = tags.get("s") {
                match self
                    .decryptor
                    .decrypt(&self.player_url, self.downloader.as_ref(), encrypted)
                    .await
                {
                    Ok(signature) => url = format!("{}&signature={}", url, signature),
                    Err(e) => {
                        warn!(itag, error = %e, "could not decrypt stream signature");
                        decryption_error.get_or_insert(e);
                        continue;
                    }
                }
            } else if let Some(signature) = tags.get("sig") {
                url = format!("{}&signature={}", url, signature);
            }

            let stream = match wanted {
                ItagType::Audio => StreamDescriptor::audio(url, item.format, item.bitrate, item.sampling_rate),
                ItagType::Video => StreamDescriptor::video(url, item.format, item.resolution.unwrap_or_default()),
                ItagType::VideoOnly => {
                    StreamDescriptor::video_only(url, item.format, item.resolution.unwrap_or_default())
                }
            };
            streams.push(stream);
        }

        match decryption_error {
            Some(e) if streams.is_empty() => Err(e),
            _ => Ok(streams),
        }
    }

    // ----- strategies -----

    fn title_from_player(&self) -> Result<String> {
        self.source.require("title")
    }

    fn title_from_meta(&self) -> Result<String> {
        Self::page_field(&self.page.meta_title, "title meta")
    }

    fn uploader_from_player(&self) -> Result<String> {
        self.source.require("author")
    }

    fn uploader_from_html(&self) -> Result<String> {
        Self::page_field(&self.page.uploader, "uploader")
    }

    fn duration_from_player(&self) -> Result<u64> {
        self.source
            .require("length_seconds")?
            .trim()
            .parse()
            .map_err(|_| TubeSyncError::parsing("length_seconds is not a number"))
    }

    fn thumbnail_from_html(&self) -> Result<String> {
        Self::page_field(&self.page.thumbnail_url, "thumbnail link")
    }

    fn thumbnail_from_player(&self) -> Result<String> {
        self.source.require("thumbnail_url")
    }

    fn like_counter(value: &Option<Option<String>>, name: &str) -> Result<i64> {
        match value {
            None => Err(TubeSyncError::parsing(format!("no {} button", name))),
            // counter hidden: ratings are disabled
            Some(None) => Ok(-1),
            Some(Some(text)) => digits_only(text).parse::<i64>().map_err(|_| {
                TubeSyncError::parsing(format!("failed to parse {} count \"{}\"", name, text))
            }),
        }
    }
}

/// `ytplayer.config` JSON, or the reason it is missing
fn player_config(page_content: &str, page: &PageSnapshot) -> Result<Value> {
    match match_group1_re(&PLAYER_CONFIG, page_content) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| TubeSyncError::parsing(format!("Could not parse yt player config: {}", e))),
        Err(_) => Err(unavailable_reason(page)),
    }
}

/// Classify a page without player config
fn unavailable_reason(page: &PageSnapshot) -> TubeSyncError {
    match &page.unavailable_message {
        Some(message) if message.contains(GEMA) => {
            warn!("content blocked by GEMA");
            TubeSyncError::ContentBlocked(GEMA.to_string())
        }
        Some(message) => TubeSyncError::ContentNotAvailable(message.clone()),
        None => TubeSyncError::parsing("player config missing and no unavailable message"),
    }
}

fn player_args(config: &Value) -> Result<Map<String, Value>> {
    let args = config
        .get("args")
        .and_then(Value::as_object)
        .ok_or_else(|| TubeSyncError::parsing("Could not parse yt player config: no args"))?;

    let is_live = args.get("ps").and_then(Value::as_str) == Some("live");
    let stream_map = args
        .get("url_encoded_fmt_stream_map")
        .ok_or_else(|| TubeSyncError::parsing("player args have no stream map"))?;
    if is_live || stream_map.as_str().map(str::is_empty).unwrap_or(true) {
        return Err(TubeSyncError::LiveStream);
    }
    Ok(args.clone())
}

fn player_url_from_config(config: &Value) -> Result<String> {
    let js = config
        .get("assets")
        .and_then(|assets| assets.get("js"))
        .and_then(Value::as_str)
        .ok_or_else(|| TubeSyncError::parsing("Could not load decryption code: no player url"))?;
    Ok(normalize_player_url(js))
}

async fn player_url_from_embed(downloader: &dyn Downloader, video_id: &str) -> Result<String> {
    let embed_page = downloader.download(&url_handler::embed_url(video_id)).await?;
    let raw = EMBED_ASSETS
        .captures_iter(&embed_page)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace(['\\', '"'], ""))
        .ok_or_else(|| TubeSyncError::parsing("embed page has no player url"))?;
    Ok(normalize_player_url(&raw))
}

fn normalize_player_url(raw: &str) -> String {
    if raw.starts_with("//") {
        format!("https:{}", raw)
    } else if raw.starts_with('/') {
        format!("{}{}", BASE_URL, raw)
    } else {
        raw.to_string()
    }
}

/// Offset in seconds from a `t=` parameter, 0 when absent
pub fn parse_start_position(page_url: &str) -> Result<u64> {
    let stamp = match match_group1_re(&TIMESTAMP, page_url) {
        Ok(stamp) => stamp,
        Err(_) => return Ok(0),
    };

    let unit = |pattern: &str| -> u64 {
        match_group1(pattern, &stamp)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };
    let hours = unit(r"(\d{1,3})h");
    let minutes = unit(r"(\d{1,3})m");
    let seconds = unit(r"(\d{1,3})s");

    if hours == 0 && minutes == 0 && seconds == 0 {
        // unlabelled seconds
        return match_group1(r"t=(\d{1,3})", &stamp)?
            .parse()
            .map_err(|_| TubeSyncError::parsing("Could not get timestamp"));
    }
    Ok(seconds + 60 * minutes + 3600 * hours)
}

#[async_trait]
impl StreamExtractor for YoutubeStreamExtractor {
    fn service_id(&self) -> i32 {
        SERVICE_ID
    }

    fn page_url(&self) -> &str {
        &self.page_url
    }

    fn downloader(&self) -> &dyn Downloader {
        self.downloader.as_ref()
    }

    fn id(&self) -> Result<String> {
        Ok(self.video_id.clone())
    }

    fn stream_type(&self) -> Result<StreamType> {
        Ok(StreamType::VideoStream)
    }

    fn title(&self) -> Result<String> {
        self.first_success("title", &[Self::title_from_player, Self::title_from_meta])
    }

    fn age_limit(&self) -> Result<u32> {
        if !self.age_restricted {
            return Ok(0);
        }
        self.page
            .age_restriction
            .as_deref()
            .and_then(|v| v.replace('+', "").trim().parse().ok())
            .ok_or_else(|| TubeSyncError::parsing("Could not get age restriction"))
    }

    async fn dash_mpd_url(&self) -> Result<Option<String>> {
        let manifest_url = match self.source.field("dashmpd") {
            Some(url) if !url.is_empty() => url,
            _ => return Ok(None),
        };
        if manifest_url.contains("/signature/") {
            return Ok(Some(manifest_url));
        }
        match match_group1_re(&DASH_SIGNATURE, &manifest_url) {
            Ok(encrypted) => {
                let decrypted = self
                    .decryptor
                    .decrypt(&self.player_url, self.downloader.as_ref(), &encrypted)
                    .await?;
                Ok(Some(manifest_url.replace(
                    &format!("/s/{}", encrypted),
                    &format!("/signature/{}", decrypted),
                )))
            }
            Err(_) => Ok(Some(manifest_url)),
        }
    }

    async fn audio_streams(&self) -> Result<Vec<StreamDescriptor>> {
        self.streams_from_map("adaptive_fmts", ItagType::Audio)
            .await
            .map_err(|e| wrap_stream_error("Could not get audio streams", e))
    }

    async fn video_streams(&self) -> Result<Vec<StreamDescriptor>> {
        let streams = self
            .streams_from_map("url_encoded_fmt_stream_map", ItagType::Video)
            .await
            .map_err(|e| wrap_stream_error("Failed to get video streams", e))?;
        if streams.is_empty() {
            return Err(TubeSyncError::parsing("Failed to get any video stream"));
        }
        Ok(streams)
    }

    async fn video_only_streams(&self) -> Result<Vec<StreamDescriptor>> {
        self.streams_from_map("adaptive_fmts", ItagType::VideoOnly)
            .await
            .map_err(|e| wrap_stream_error("Could not get video only streams", e))
    }

    fn thumbnail_url(&self) -> Result<String> {
        self.first_success(
            "thumbnail url",
            &[Self::thumbnail_from_html, Self::thumbnail_from_player],
        )
    }

    fn duration(&self) -> Result<u64> {
        self.first_success("duration", &[Self::duration_from_player])
    }

    fn uploader(&self) -> Result<String> {
        self.first_success(
            "uploader",
            &[Self::uploader_from_player, Self::uploader_from_html],
        )
    }

    fn description(&self) -> Result<String> {
        self.page
            .description_html
            .clone()
            .ok_or_else(|| TubeSyncError::parsing("failed to load description"))
    }

    fn view_count(&self) -> Result<u64> {
        Self::page_field(&self.page.view_count, "view count")?
            .trim()
            .parse()
            .map_err(|_| TubeSyncError::parsing("failed to get number of views"))
    }

    fn upload_date(&self) -> Result<String> {
        Self::page_field(&self.page.upload_date, "upload date")
    }

    fn uploader_thumbnail_url(&self) -> Result<String> {
        Self::page_field(&self.page.uploader_thumbnail_url, "uploader thumbnail")
    }

    fn start_position(&self) -> Result<u64> {
        parse_start_position(&self.page_url)
    }

    fn average_rating(&self) -> Result<String> {
        self.source.require("avg_rating")
    }

    fn like_count(&self) -> Result<i64> {
        Self::like_counter(&self.page.like_text, "like")
    }

    fn dislike_count(&self) -> Result<i64> {
        Self::like_counter(&self.page.dislike_text, "dislike")
    }

    fn next_video(&self) -> Result<StreamPreview> {
        self.page
            .next_video
            .clone()
            .map_err(|e| TubeSyncError::parsing(format!("Could not get next video: {}", e)))
    }

    fn related_videos(&self) -> Result<Vec<StreamPreview>> {
        self.page
            .related_videos
            .clone()
            .map_err(|e| TubeSyncError::parsing(format!("Could not get related videos: {}", e)))
    }
}

/// Keep decryption errors distinct, wrap everything else as parsing
fn wrap_stream_error(context: &str, error: TubeSyncError) -> TubeSyncError {
    if error.is_decryption_error() {
        error
    } else {
        TubeSyncError::parsing(format!("{}: {}", context, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "https://www.youtube.com/watch?v=jZViOEv90dI";

    #[test]
    fn test_unavailable_reason_classification() {
        let blocked = PageSnapshot::parse(
            r#"<html><body><h1 id="unavailable-message">This video contains content from GEMA</h1></body></html>"#,
            PAGE_URL,
        )
        .unwrap();
        assert!(matches!(unavailable_reason(&blocked), TubeSyncError::ContentBlocked(_)));

        let removed = PageSnapshot::parse(
            r#"<html><body><h1 id="unavailable-message">This video has been removed</h1></body></html>"#,
            PAGE_URL,
        )
        .unwrap();
        assert!(matches!(unavailable_reason(&removed), TubeSyncError::ContentNotAvailable(_)));

        let broken = PageSnapshot::parse("<html><body></body></html>", PAGE_URL).unwrap();
        assert!(unavailable_reason(&broken).is_parsing_error());
    }

    #[test]
    fn test_live_stream_detected() {
        let live: Value = serde_json::json!({"args": {"ps": "live", "url_encoded_fmt_stream_map": "x"}});
        assert!(matches!(player_args(&live), Err(TubeSyncError::LiveStream)));

        let empty: Value = serde_json::json!({"args": {"url_encoded_fmt_stream_map": ""}});
        assert!(matches!(player_args(&empty), Err(TubeSyncError::LiveStream)));

        let ok: Value = serde_json::json!({"args": {"url_encoded_fmt_stream_map": "itag=22"}});
        assert!(player_args(&ok).is_ok());
    }

    #[test]
    fn test_player_url_normalization() {
        assert_eq!(normalize_player_url("//s.ytimg.com/p.js"), "https://s.ytimg.com/p.js");
        assert_eq!(normalize_player_url("/yts/p.js"), "https://www.youtube.com/yts/p.js");
    }

    #[test]
    fn test_start_position() {
        assert_eq!(parse_start_position(PAGE_URL).unwrap(), 0);
        assert_eq!(parse_start_position("https://youtu.be/jZViOEv90dI?t=9s").unwrap(), 9);
        assert_eq!(parse_start_position("https://youtu.be/jZViOEv90dI?t=1h2m3s").unwrap(), 3723);
        assert_eq!(parse_start_position("https://www.youtube.com/watch?v=x&t=100").unwrap(), 100);
    }

    #[test]
    fn test_like_counter() {
        assert_eq!(YoutubeStreamExtractor::like_counter(&Some(Some("1,234".into())), "like").unwrap(), 1234);
        assert_eq!(YoutubeStreamExtractor::like_counter(&Some(None), "like").unwrap(), -1);
        assert!(YoutubeStreamExtractor::like_counter(&None, "like").is_err());
        assert!(YoutubeStreamExtractor::like_counter(&Some(Some("n/a".into())), "like").is_err());
    }

    #[test]
    fn test_related_previews() {
        let html = r#"<html><body>
            <div class="watch-sidebar-section"><ul><li class="video-list-item">
              <a class="content-link" href="/watch?v=AAAAAAAAAAA"><span class="title">Next one</span>
              <span class="g-hovercard">Someone</span><span class="view-count">1.234 views</span></a>
              <span class="video-time">3:05</span><img src="//i.ytimg.com/a.gif" data-thumb="//i.ytimg.com/a.jpg">
            </li></ul></div>
            <ul id="watch-related">
              <li><a class="content-link" href="/watch?v=BBBBBBBBBBB"><span class="title">Related</span>
              <span class="g-hovercard">Other</span></a><span class="video-time">1:00:00</span>
              <img src="https://i.ytimg.com/b.jpg"></li>
              <li><a class="playlist-link" href="/playlist?list=X">A playlist</a></li>
            </ul></body></html>"#;
        let page = PageSnapshot::parse(html, PAGE_URL).unwrap();

        let next = page.next_video.unwrap();
        assert_eq!(next.id, "AAAAAAAAAAA");
        assert_eq!(next.url, "https://www.youtube.com/watch?v=AAAAAAAAAAA");
        assert_eq!(next.view_count, 1234);
        assert_eq!(next.duration, 185);
        assert_eq!(next.thumbnail_url, "https://i.ytimg.com/a.jpg");

        let related = page.related_videos.unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].uploader, "Other");
        assert_eq!(related[0].view_count, 0);
        assert_eq!(related[0].duration, 3600);
    }
}
