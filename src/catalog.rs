//! Catalog metadata client
//!
//! Read-only access to the catalog service and the rules for turning a
//! catalog item plus a user's choice into a [`TransferRequest`].

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::core::error::{Error, Result};
use crate::core::transfer::TransferRequest;
use crate::surface::ChatId;

/// Episode qualities in order of preference
pub const EPISODE_QUALITY_ORDER: &[&str] = &["720p", "480p", "360p"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Movie,
    Tv,
    #[serde(other)]
    Other,
}

/// Accepts `"12"` as well as `12`
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn required_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_string(deserializer)?.ok_or_else(|| serde::de::Error::custom("missing media id"))
}

/// One catalog entry. Fields the pipeline does not interpret are kept in
/// `extra` for captions.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaItem {
    #[serde(deserialize_with = "required_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub video_links: BTreeMap<String, String>,
    #[serde(default)]
    pub seasons: BTreeMap<String, Season>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub format: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub duration: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Season {
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Episode {
    #[serde(deserialize_with = "required_id")]
    pub episode_number: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default)]
    pub video_720p: Option<String>,
    #[serde(default)]
    pub video_480p: Option<String>,
    #[serde(default)]
    pub video_360p: Option<String>,
    #[serde(default)]
    pub video_links: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub format: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub duration: Option<String>,
}

impl Episode {
    /// Best available quality and its URL
    pub fn best_quality(&self) -> Option<(&'static str, &str)> {
        let direct = [
            ("720p", &self.video_720p),
            ("480p", &self.video_480p),
            ("360p", &self.video_360p),
        ];
        direct
            .into_iter()
            .find_map(|(quality, url)| {
                url.as_deref()
                    .filter(|url| !url.is_empty())
                    .map(|url| (quality, url))
            })
            .or_else(|| {
                EPISODE_QUALITY_ORDER.iter().find_map(|quality| {
                    self.video_links
                        .get(*quality)
                        .filter(|url| !url.is_empty())
                        .map(|url| (*quality, url.as_str()))
                })
            })
    }
}

/// A concrete, downloadable choice for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    /// Dedup label, e.g. `720p` or `S01E02`
    pub label: String,
    pub quality: String,
    pub url: String,
    pub size_hint: Option<u64>,
    /// Lines for the caption
    pub details: Vec<String>,
}

/// Parses sizes like `1.4 GB`, `700MB` or `512 KiB`; units are binary
pub fn parse_size_hint(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "bytes" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        _ => return None,
    };
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64).round() as u64)
}

/// Closest known label by edit distance
fn suggest<'a>(wanted: &str, known: impl Iterator<Item = &'a String>) -> Option<&'a String> {
    let wanted = wanted.to_ascii_lowercase();
    known
        .map(|label| (strsim::levenshtein(&wanted, &label.to_ascii_lowercase()), label))
        .filter(|(distance, _)| *distance <= 3)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, label)| label)
}

fn detail_line(size: &Option<String>, format: &Option<String>, duration: &Option<String>) -> Option<String> {
    let parts: Vec<&str> = [size, format, duration]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .filter(|part| !part.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join(" | "))
}

impl MediaItem {
    /// Movie variant by quality label
    pub fn movie_variant(&self, label: &str) -> Result<Variant> {
        match self.video_links.get(label).filter(|url| !url.is_empty()) {
            Some(url) => Ok(Variant {
                label: label.to_string(),
                quality: label.to_string(),
                url: url.clone(),
                size_hint: self.size.as_deref().and_then(parse_size_hint),
                details: detail_line(&self.size, &self.format, &self.duration)
                    .into_iter()
                    .collect(),
            }),
            None => {
                let hint = match suggest(label, self.video_links.keys()) {
                    Some(close) => format!("; did you mean {close}?"),
                    None if self.video_links.is_empty() => "; no qualities are listed".to_string(),
                    None => format!(
                        "; available: {}",
                        self.video_links.keys().cloned().collect::<Vec<_>>().join(", ")
                    ),
                };
                Err(Error::InvalidInput(format!(
                    "{} has no {label} link{hint}",
                    self.title
                )))
            }
        }
    }

    /// Episode variant with the best available quality
    pub fn episode_variant(&self, season: u32, episode: u32) -> Result<Variant> {
        let season_data = self
            .seasons
            .get(&format!("season_{season}"))
            .ok_or_else(|| Error::InvalidInput(format!("{} has no season {season}", self.title)))?;
        let found = season_data
            .episodes
            .iter()
            .find(|ep| ep.episode_number.trim() == episode.to_string())
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} has no episode S{season}E{episode}", self.title))
            })?;
        let (quality, url) = found.best_quality().ok_or_else(|| {
            Error::InvalidInput(format!("S{season}E{episode} of {} has no link", self.title))
        })?;

        let mut details = Vec::new();
        if let Some(title) = found.title.as_deref().filter(|t| !t.is_empty()) {
            details.push(title.to_string());
        }
        details.extend(detail_line(&found.size, &found.format, &found.duration));

        Ok(Variant {
            label: format!("S{season:02}E{episode:02}"),
            quality: quality.to_string(),
            url: url.to_string(),
            size_hint: found.size.as_deref().and_then(parse_size_hint),
            details,
        })
    }

    /// Request delivering `variant` of this item to `requester`
    pub fn transfer_request(&self, variant: Variant, requester: ChatId) -> TransferRequest {
        let mut caption_extra = variant.details;
        if variant.quality != variant.label {
            caption_extra.insert(0, format!("Quality: {}", variant.quality));
        }
        TransferRequest::new(requester, &self.id, variant.label, variant.url, &self.title)
            .with_size_hint(variant.size_hint)
            .with_caption_extra(caption_extra)
    }
}

/// HTTP client for the catalog service
#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(format!("media-relay/{}", env!("MEDIA_RELAY_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                log::warn!("Falling back to default HTTP client: {err}");
                Client::new()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        log::debug!("GET {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::CatalogUnavailable(format!("{url}: {e}")))?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::CatalogUnavailable(format!("{url} answered {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| Error::CatalogUnavailable(format!("malformed response from {url}: {e}")))
    }

    /// Every item in the catalog
    pub async fn list(&self) -> Result<Vec<MediaItem>> {
        self.fetch(format!("{}/media", self.base_url)).await
    }

    /// One item by id
    pub async fn get(&self, id: &str) -> Result<MediaItem> {
        self.fetch(format!("{}/media/{id}", self.base_url)).await
    }
}
