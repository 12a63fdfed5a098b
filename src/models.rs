use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Set of user ratings (0-5) a track may carry to be accepted into a playlist.
/// Never empty: anything that parses to no valid rating means "accept all".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<u8>", into = "Vec<u8>")]
pub struct RatingFilter(BTreeSet<u8>);

impl RatingFilter {
    pub const MAX_RATING: u8 = 5;

    pub fn all() -> Self {
        Self((0..=Self::MAX_RATING).collect())
    }

    /// Parse configured rating strings. Duplicates collapse; unparseable or
    /// out-of-range entries are dropped silently.
    pub fn parse<S: AsRef<str>>(ratings: Option<&[S]>) -> Self {
        let set: BTreeSet<u8> = ratings
            .unwrap_or(&[])
            .iter()
            .filter_map(|r| r.as_ref().trim().parse::<i64>().ok())
            .filter(|r| (0..=Self::MAX_RATING as i64).contains(r))
            .map(|r| r as u8)
            .collect();
        Self::from_set(set)
    }

    fn from_set(set: BTreeSet<u8>) -> Self {
        if set.is_empty() {
            Self::all()
        } else {
            Self(set)
        }
    }

    pub fn allows(&self, rating: u8) -> bool {
        self.0.contains(&rating)
    }

    pub fn values(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }
}

impl Default for RatingFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl From<Vec<u8>> for RatingFilter {
    fn from(v: Vec<u8>) -> Self {
        Self::from_set(v.into_iter().filter(|r| *r <= Self::MAX_RATING).collect())
    }
}

impl From<RatingFilter> for Vec<u8> {
    fn from(f: RatingFilter) -> Self {
        f.0.into_iter().collect()
    }
}

/// Take the final path segment of a URL-shaped identifier
/// (`https://musicbrainz.org/recording/<mbid>` -> `<mbid>`).
pub fn identifier_from_url(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// A track as described by the remote catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackRef {
    pub title: String,
    pub mbid: String,
    pub artist_mbids: Vec<String>,
    /// Display credit, only used for diagnostics.
    pub creator: String,
}

impl RemoteTrackRef {
    pub fn label(&self) -> String {
        if self.creator.is_empty() {
            self.title.clone()
        } else {
            format!("{} by {}", self.title, self.creator)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalArtist {
    pub id: String,
    pub name: String,
}

/// A song held by the local library. Read-only from this crate's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalTrack {
    pub id: String,
    pub title: String,
    pub rating: u8,
    pub played: Option<DateTime<Utc>>,
    pub artists: Vec<LocalArtist>,
}

impl LocalTrack {
    pub fn artist_ids(&self) -> impl Iterator<Item = &str> {
        self.artists.iter().map(|a| a.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalPlaylist {
    pub id: String,
    pub name: String,
    pub comment: String,
    pub song_count: u32,
    pub changed: Option<DateTime<Utc>>,
}

/// Free-text library search, with the desired result count per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub query: String,
    pub artist_count: u32,
    pub album_count: u32,
    pub song_count: u32,
}

impl SearchQuery {
    pub fn songs(query: &str, count: u32) -> Self {
        Self { query: query.to_string(), artist_count: 0, album_count: 0, song_count: count }
    }

    pub fn artist(query: &str) -> Self {
        Self { query: query.to_string(), artist_count: 1, album_count: 0, song_count: 0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub artists: Vec<LocalArtist>,
    pub songs: Vec<LocalTrack>,
}

/// One configured mapping from a ListenBrainz source patch to a local playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(alias = "source_patch")]
    pub source_patch: String,
    #[serde(alias = "playlist_name")]
    pub playlist_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateParams {
    pub name: String,
    /// Recency window in days.
    pub track_age: u32,
    /// Per-artist cap; 0 means unlimited.
    #[serde(default)]
    pub artist_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportParams {
    pub name: String,
    pub lbz_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchParams {
    pub sources: Vec<Source>,
}

/// Work item payload. Exactly one variant is ever populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "jobType", rename_all = "kebab-case")]
pub enum JobPayload {
    FetchPatches { patch: PatchParams },
    GenerateJams { generate: GenerateParams },
    ImportPlaylist { import: ImportParams },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::FetchPatches { .. } => "fetch-patches",
            JobPayload::GenerateJams { .. } => "generate-jams",
            JobPayload::ImportPlaylist { .. } => "import-playlist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub username: String,
    pub lbz_username: String,
    pub lbz_token: String,
    pub ratings: RatingFilter,
    pub fallback: u32,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl Job {
    /// Build a job sharing this one's user identity, credentials and filters.
    pub fn with_payload(&self, payload: JobPayload) -> Job {
        Job {
            username: self.username.clone(),
            lbz_username: self.lbz_username.clone(),
            lbz_token: self.lbz_token.clone(),
            ratings: self.ratings.clone(),
            fallback: self.fallback,
            payload,
        }
    }

    /// Name of the local playlist this job writes, if it writes exactly one.
    pub fn destination(&self) -> Option<&str> {
        match &self.payload {
            JobPayload::FetchPatches { .. } => None,
            JobPayload::GenerateJams { generate } => Some(&generate.name),
            JobPayload::ImportPlaylist { import } => Some(&import.name),
        }
    }

    /// Whether running `other` would redo this job's work: same user and job
    /// type, and the same destination or, for fetches, the same set of patches.
    pub fn duplicates(&self, other: &Job) -> bool {
        if self.username != other.username {
            return false;
        }
        match (&self.payload, &other.payload) {
            (JobPayload::FetchPatches { patch: a }, JobPayload::FetchPatches { patch: b }) => {
                fn patches(p: &PatchParams) -> std::collections::BTreeSet<&str> {
                    p.sources.iter().map(|s| s.source_patch.as_str()).collect()
                }
                patches(a) == patches(b)
            }
            (JobPayload::GenerateJams { .. }, JobPayload::GenerateJams { .. })
            | (JobPayload::ImportPlaylist { .. }, JobPayload::ImportPlaylist { .. }) => {
                self.destination() == other.destination()
            }
            _ => false,
        }
    }
}

/// A job together with the offset (seconds) at which it should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub delay_secs: u64,
    pub job: Job,
}

/// Result of resolving and filtering one remote track list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationOutcome {
    /// Local ids, deduplicated, in source order.
    pub track_ids: Vec<String>,
    pub missing: Vec<String>,
    pub excluded: Vec<String>,
    /// Generation only: tracks skipped for being played within the recency window.
    pub recent: usize,
}

impl ReconciliationOutcome {
    pub fn push_track_id(&mut self, id: &str) {
        if !self.track_ids.iter().any(|t| t == id) {
            self.track_ids.push(id.to_string());
        }
    }
}

/// What a dispatched job produced.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Jobs discovered while running, with offsets relative to now.
    pub chained: Vec<ScheduledJob>,
    /// Present when the job resolved tracks; absent for fetch-patches.
    pub reconciliation: Option<ReconciliationOutcome>,
    /// Whether the destination playlist was written.
    pub written: bool,
    /// Per-item failures that did not stop the job.
    pub errors: Vec<anyhow::Error>,
}
