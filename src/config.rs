use crate::models::{GenerateParams, RatingFilter, Source};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

pub const MIN_FALLBACK_COUNT: u32 = 1;
pub const MAX_FALLBACK_COUNT: u32 = 500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub users: Vec<UserConfig>,

    /// Songs requested per title search when falling back from an MBID miss.
    #[serde(default = "default_fallback_count")]
    pub fallback_count: u32,

    #[serde(default)]
    pub listenbrainz: ListenBrainzConfig,
    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    // Scheduling
    #[serde(default = "default_sync_interval")]
    pub sync_interval_sec: u64,
    #[serde(default = "default_worker_interval")]
    pub worker_interval_sec: u64,
    #[serde(default = "default_check_on_startup")]
    pub check_on_startup: bool,
    #[serde(default = "default_stale_after")]
    pub stale_after_sec: i64,

    #[serde(default = "default_max_retries")]
    pub max_retries_on_error: u32,
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenBrainzConfig {
    #[serde(default = "default_lbz_base")]
    pub base_url: String,
}

impl Default for ListenBrainzConfig {
    fn default() -> Self {
        Self { base_url: default_lbz_base() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LibraryConfig {
    #[serde(default = "default_library_base")]
    pub base_url: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self { base_url: default_library_base() }
    }
}

/// One direct import of a ListenBrainz playlist by id.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PlaylistImport {
    pub name: String,
    pub lbz_id: String,
    /// Create when missing, but never refresh.
    #[serde(default)]
    pub one_time: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct UserConfig {
    /// Local library user.
    #[serde(default)]
    pub username: String,
    /// Local library password, used for Subsonic token auth.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub lbz_username: String,
    #[serde(default)]
    pub lbz_token: String,
    #[serde(default)]
    pub ratings: Option<Vec<String>>,

    #[serde(default)]
    pub generate_playlist: bool,
    #[serde(default)]
    pub generated_playlist: String,
    #[serde(default)]
    pub generated_playlist_track_age: u32,
    #[serde(default)]
    pub generated_playlist_artist_limit: u32,

    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub playlists: Vec<PlaylistImport>,
}

impl UserConfig {
    pub fn rating_filter(&self) -> RatingFilter {
        RatingFilter::parse(self.ratings.as_deref())
    }

    /// Generation settings, when generation is enabled and named.
    pub fn generate_params(&self) -> Option<GenerateParams> {
        if !self.generate_playlist || self.generated_playlist.is_empty() {
            return None;
        }
        Some(GenerateParams {
            name: self.generated_playlist.clone(),
            track_age: self.generated_playlist_track_age,
            artist_limit: self.generated_playlist_artist_limit,
        })
    }
}

fn default_fallback_count() -> u32 { 15 }
fn default_lbz_base() -> String { "https://api.listenbrainz.org/1".into() }
fn default_library_base() -> String { "http://localhost:4533".into() }
fn default_log_dir() -> PathBuf { "/var/log/lbz-sync".into() }
fn default_db_path() -> PathBuf { "/var/lib/lbz-sync/queue.db".into() }
fn default_sync_interval() -> u64 { 86_400 }
fn default_worker_interval() -> u64 { 10 }
fn default_check_on_startup() -> bool { true }
fn default_stale_after() -> i64 { 3 * 3600 }
fn default_max_retries() -> u32 { 3 }
fn default_rate_limit_threshold() -> i64 { 5 }

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg = Self::from_toml(&s)?;
        Ok(cfg)
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            return Err(anyhow!("missing required 'users' configuration"));
        }

        for user in &self.users {
            if user.username.is_empty() || user.lbz_username.is_empty() {
                return Err(anyhow!("user must have a library username and ListenBrainz username"));
            }

            let mut names: HashSet<&str> = HashSet::new();
            let destinations = user
                .sources
                .iter()
                .map(|s| s.playlist_name.as_str())
                .chain(user.generate_params().is_some().then_some(user.generated_playlist.as_str()))
                .chain(user.playlists.iter().map(|p| p.name.as_str()));
            for name in destinations {
                if !names.insert(name) {
                    return Err(anyhow!("duplicate playlist name found: {}", name));
                }
            }
        }

        if !(MIN_FALLBACK_COUNT..=MAX_FALLBACK_COUNT).contains(&self.fallback_count) {
            return Err(anyhow!(
                "fallback_count must be between {} and {} (inclusive)",
                MIN_FALLBACK_COUNT,
                MAX_FALLBACK_COUNT
            ));
        }

        url::Url::parse(&self.listenbrainz.base_url)
            .with_context(|| format!("invalid listenbrainz.base_url {}", self.listenbrainz.base_url))?;
        url::Url::parse(&self.library.base_url)
            .with_context(|| format!("invalid library.base_url {}", self.library.base_url))?;
        Ok(())
    }
}
