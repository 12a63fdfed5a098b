use super::{Catalog, RecordingMetadata, Recommendations, RemotePlaylist};
use crate::error::RemoteError;
use crate::models::{identifier_from_url, RemoteTrackRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BASE: &str = "https://api.listenbrainz.org/1";
pub const USER_AGENT_VALUE: &str = concat!("ListenBrainzPlaylistSync/", env!("CARGO_PKG_VERSION"));
const RECOMMENDATION_COUNT: u32 = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// ListenBrainz API client.
///
/// Every response passes through the rate-limit check before it is
/// classified, so a nearly exhausted quota throttles the caller even when
/// the request itself failed. Retryable failures (reset connections, 429)
/// are re-issued up to `max_retries` times.
pub struct ListenBrainzClient {
    client: Client,
    base: String,
    max_retries: u32,
    retry_backoff: Duration,
    rate_limit_threshold: i64,
}

#[derive(Debug, Deserialize)]
struct LbzError {
    code: i64,
    error: String,
}

#[derive(Debug, Deserialize, Default)]
struct PlaylistResponse {
    #[serde(default)]
    playlists: Vec<OverallPlaylist>,
    #[serde(default)]
    playlist: Option<LbzPlaylist>,
}

#[derive(Debug, Deserialize)]
struct OverallPlaylist {
    playlist: LbzPlaylist,
}

#[derive(Debug, Deserialize, Default)]
struct LbzPlaylist {
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    extension: PlaylistExtension,
    #[serde(default)]
    track: Vec<LbzTrack>,
}

#[derive(Debug, Deserialize, Default)]
struct PlaylistExtension {
    #[serde(rename = "https://musicbrainz.org/doc/jspf#playlist", default)]
    jspf: PlaylistJspf,
}

#[derive(Debug, Deserialize, Default)]
struct PlaylistJspf {
    #[serde(default)]
    additional_metadata: AdditionalMetadata,
}

#[derive(Debug, Deserialize, Default)]
struct AdditionalMetadata {
    #[serde(default)]
    algorithm_metadata: AlgorithmMetadata,
}

#[derive(Debug, Deserialize, Default)]
struct AlgorithmMetadata {
    #[serde(default)]
    source_patch: String,
}

#[derive(Debug, Deserialize, Default)]
struct LbzTrack {
    #[serde(default)]
    creator: String,
    #[serde(default)]
    title: String,
    #[serde(default, deserialize_with = "one_or_many")]
    identifier: Vec<String>,
    #[serde(default)]
    extension: TrackExtension,
}

#[derive(Debug, Deserialize, Default)]
struct TrackExtension {
    #[serde(rename = "https://musicbrainz.org/doc/jspf#track", default)]
    jspf: TrackJspf,
}

#[derive(Debug, Deserialize, Default)]
struct TrackJspf {
    #[serde(default)]
    additional_metadata: TrackMetadata,
}

#[derive(Debug, Deserialize, Default)]
struct TrackMetadata {
    #[serde(default)]
    artists: Vec<ArtistRef>,
}

#[derive(Debug, Deserialize)]
struct ArtistRef {
    artist_mbid: String,
}

#[derive(Debug, Deserialize)]
struct RecommendationResponse {
    payload: RecommendationPayload,
}

#[derive(Debug, Deserialize)]
struct RecommendationPayload {
    #[serde(default)]
    last_updated: i64,
    #[serde(default)]
    mbids: Vec<RecordingMbid>,
}

#[derive(Debug, Deserialize)]
struct RecordingMbid {
    recording_mbid: String,
}

#[derive(Debug, Serialize)]
struct RecordingLookup<'a> {
    recording_mbids: &'a [String],
    inc: &'static str,
}

#[derive(Debug, Deserialize)]
struct MetadataLookup {
    #[serde(default)]
    artist: ArtistCredit,
    recording: RecordingName,
}

#[derive(Debug, Deserialize, Default)]
struct ArtistCredit {
    #[serde(default)]
    artists: Vec<ArtistRef>,
}

#[derive(Debug, Deserialize)]
struct RecordingName {
    name: String,
}

/// JSPF allows `identifier` to be a single string or a list.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl From<LbzPlaylist> for RemotePlaylist {
    fn from(p: LbzPlaylist) -> Self {
        let tracks = p
            .track
            .into_iter()
            .filter_map(|t| {
                let mbid = match t.identifier.first() {
                    Some(url) => identifier_from_url(url).to_string(),
                    None => {
                        warn!("Track `{}` has no identifier; skipping", t.title);
                        return None;
                    }
                };
                Some(RemoteTrackRef {
                    title: t.title,
                    mbid,
                    artist_mbids: t
                        .extension
                        .jspf
                        .additional_metadata
                        .artists
                        .into_iter()
                        .map(|a| a.artist_mbid)
                        .collect(),
                    creator: t.creator,
                })
            })
            .collect();
        RemotePlaylist {
            id: identifier_from_url(&p.identifier).to_string(),
            identifier: p.identifier,
            title: p.title,
            date: p.date,
            source_patch: p.extension.jspf.additional_metadata.algorithm_metadata.source_patch,
            tracks,
        }
    }
}

impl ListenBrainzClient {
    pub fn new(base: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            rate_limit_threshold: 5,
        }
    }

    /// Retry budget for retryable failures; back-off doubles per attempt.
    pub fn with_retry_policy(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_rate_limit_threshold(mut self, threshold: i64) -> Self {
        self.rate_limit_threshold = threshold;
        self
    }

    fn base(&self) -> &str {
        &self.base
    }

    fn authorize(req: RequestBuilder, token: &str) -> RequestBuilder {
        let req = req.header(ACCEPT, "application/json").header(USER_AGENT, USER_AGENT_VALUE);
        if token.is_empty() {
            req
        } else {
            req.header(AUTHORIZATION, format!("Token {}", token))
        }
    }

    /// Sleep for the server-reported reset interval when the remaining quota is low.
    /// Returns the delay that was applied.
    pub async fn process_rate_limit(&self, headers: &HeaderMap) -> Option<Duration> {
        let remaining = headers.get("x-ratelimit-remaining").and_then(|v| v.to_str().ok())?;
        let reset_in = headers.get("x-ratelimit-reset-in").and_then(|v| v.to_str().ok())?;
        trace!("ListenBrainz ratelimit check: remaining={}, reset in={}s", remaining, reset_in);

        let remaining: i64 = match remaining.trim().parse() {
            Ok(n) => n,
            Err(_) => {
                warn!("Rate limit remaining is not a valid number: {}", remaining);
                return None;
            }
        };
        let reset_in: u64 = match reset_in.trim().parse() {
            Ok(n) => n,
            Err(_) => {
                warn!("Rate limit reset-in is not a valid number: {}", reset_in);
                return None;
            }
        };

        if remaining <= self.rate_limit_threshold {
            warn!("Approaching rate limit, delaying further processing for {} seconds", reset_in);
            let delay = Duration::from_secs(reset_in);
            tokio::time::sleep(delay).await;
            return Some(delay);
        }
        None
    }

    /// Send once and classify the outcome.
    async fn send_once(&self, req: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let resp = req.send().await.map_err(RemoteError::from_transport)?;
        self.process_rate_limit(resp.headers()).await;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RemoteError::RateLimited);
        }
        let body = resp.bytes().await.map_err(RemoteError::from_transport)?;
        match serde_json::from_slice::<LbzError>(&body) {
            Ok(err) => Err(RemoteError::Remote { code: err.code, message: err.error }),
            Err(e) => Err(RemoteError::decode(format!("{} (HTTP {})", e, status))),
        }
    }

    /// Issue a request built by `build`, re-issuing retryable failures.
    async fn send_with_retry<F>(&self, what: &str, build: F) -> Result<reqwest::Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            match self.send_once(build()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let wait = self.retry_backoff * (1u32 << attempt.min(6));
                    warn!("{} failed (attempt {}): {}. Retrying in {:?}", what, attempt, e, wait);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// GET and decode. A 204 yields `None`.
    async fn get_json<T: DeserializeOwned>(&self, url: &str, token: &str) -> Result<Option<T>, RemoteError> {
        debug!("GET {}", url);
        let resp = self
            .send_with_retry(url, || Self::authorize(self.client.get(url), token))
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = resp.bytes().await.map_err(RemoteError::from_transport)?;
        let parsed = serde_json::from_slice(&body).map_err(RemoteError::decode)?;
        Ok(Some(parsed))
    }
}

#[async_trait]
impl Catalog for ListenBrainzClient {
    async fn created_for_playlists(&self, lbz_username: &str, token: &str) -> Result<Vec<RemotePlaylist>, RemoteError> {
        let url = format!(
            "{}/user/{}/playlists/createdfor",
            self.base(),
            urlencoding::encode(lbz_username)
        );
        let result = self.get_json::<PlaylistResponse>(&url, token).await?;
        Ok(result
            .unwrap_or_default()
            .playlists
            .into_iter()
            .map(|p| RemotePlaylist::from(p.playlist))
            .collect())
    }

    async fn playlist(&self, id: &str, token: &str) -> Result<RemotePlaylist, RemoteError> {
        let url = format!("{}/playlist/{}", self.base(), urlencoding::encode(id));
        let result = self.get_json::<PlaylistResponse>(&url, token).await?;
        result
            .and_then(|r| r.playlist)
            .map(RemotePlaylist::from)
            .ok_or_else(|| RemoteError::Domain(format!("Nothing parsed for playlist {}", id)))
    }

    async fn recommendations(&self, lbz_username: &str, token: &str) -> Result<Recommendations, RemoteError> {
        let url = format!(
            "{}/cf/recommendation/user/{}/recording?count={}",
            self.base(),
            urlencoding::encode(lbz_username),
            RECOMMENDATION_COUNT
        );
        let result = self.get_json::<RecommendationResponse>(&url, token).await?;
        let payload = match result {
            Some(r) if !r.payload.mbids.is_empty() => r.payload,
            _ => {
                return Err(RemoteError::Domain(format!(
                    "No recommendations found for user {}",
                    lbz_username
                )))
            }
        };
        Ok(Recommendations {
            mbids: payload.mbids.into_iter().map(|m| m.recording_mbid).collect(),
            last_updated: payload.last_updated,
        })
    }

    async fn lookup_recordings(&self, mbids: &[String], token: &str) -> Result<HashMap<String, RecordingMetadata>, RemoteError> {
        let url = format!("{}/metadata/recording", self.base());
        let body = RecordingLookup { recording_mbids: mbids, inc: "artist" };
        debug!("POST {} ({} recordings)", url, mbids.len());
        let resp = self
            .send_with_retry(&url, || Self::authorize(self.client.post(&url), token).json(&body))
            .await?;
        let bytes = resp.bytes().await.map_err(RemoteError::from_transport)?;
        let raw: HashMap<String, MetadataLookup> = serde_json::from_slice(&bytes).map_err(RemoteError::decode)?;
        Ok(raw
            .into_iter()
            .map(|(mbid, m)| {
                let artist_mbids = m.artist.artists.into_iter().map(|a| a.artist_mbid).collect();
                (mbid, RecordingMetadata { name: m.recording.name, artist_mbids })
            })
            .collect())
    }
}
