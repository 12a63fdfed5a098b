use super::{LibrarySearch, PlaylistStore, PlaylistTarget};
use crate::config::Config;
use crate::models::{LocalArtist, LocalPlaylist, LocalTrack, SearchQuery, SearchResults};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use rand::Rng;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const API_VERSION: &str = "1.16.1";
const CLIENT_ID: &str = "lbz-sync";

/// (Open)Subsonic library backend (Navidrome, Gonic, ...).
///
/// Requests authenticate as the library user the job runs for, using the
/// salted token scheme (`t = md5(password + salt)`).
pub struct SubsonicLibrary {
    client: Client,
    base: String,
    passwords: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "subsonic-response")]
    response: SubsonicResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsonicResponse {
    status: String,
    #[serde(default)]
    error: Option<SubsonicError>,
    #[serde(default)]
    search_result3: Option<SearchResult3>,
    #[serde(default)]
    playlists: Option<Playlists>,
    #[serde(default)]
    playlist: Option<Playlist>,
}

#[derive(Debug, Deserialize)]
struct SubsonicError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize, Default)]
struct SearchResult3 {
    #[serde(default)]
    artist: Vec<Artist>,
    #[serde(default)]
    song: Vec<Song>,
}

#[derive(Debug, Deserialize)]
struct Artist {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Song {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    user_rating: Option<u8>,
    #[serde(default)]
    played: Option<String>,
    /// OpenSubsonic multi-artist credit.
    #[serde(default)]
    artists: Vec<Artist>,
    #[serde(default)]
    artist_id: Option<String>,
    #[serde(default)]
    artist: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Playlists {
    #[serde(default)]
    playlist: Vec<Playlist>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Playlist {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    song_count: u32,
    #[serde(default)]
    changed: Option<String>,
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

impl From<Song> for LocalTrack {
    fn from(s: Song) -> Self {
        let artists = if !s.artists.is_empty() {
            s.artists.into_iter().map(|a| LocalArtist { id: a.id, name: a.name }).collect()
        } else if let Some(id) = s.artist_id {
            vec![LocalArtist { id, name: s.artist.unwrap_or_default() }]
        } else {
            Vec::new()
        };
        LocalTrack {
            id: s.id,
            title: s.title,
            rating: s.user_rating.unwrap_or(0),
            played: s.played.as_deref().and_then(parse_timestamp),
            artists,
        }
    }
}

impl From<Playlist> for LocalPlaylist {
    fn from(p: Playlist) -> Self {
        LocalPlaylist { id: p.id, name: p.name, comment: p.comment, song_count: p.song_count, changed: p.changed.as_deref().and_then(parse_timestamp) }
    }
}

impl SubsonicLibrary {
    pub fn new(base: &str, passwords: HashMap<String, String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, base: base.trim_end_matches('/').to_string(), passwords }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let passwords = cfg
            .users
            .iter()
            .map(|u| (u.username.clone(), u.password.clone()))
            .collect();
        Self::new(&cfg.library.base_url, passwords)
    }

    fn make_salt() -> String {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn auth_params(&self, user: &str) -> Result<Vec<(String, String)>> {
        let password = self
            .passwords
            .get(user)
            .ok_or_else(|| anyhow!("no library credentials configured for user {}", user))?;
        let salt = Self::make_salt();
        let token = format!("{:x}", md5::compute(format!("{}{}", password, salt)));
        Ok(vec![
            ("u".to_string(), user.to_string()),
            ("t".to_string(), token),
            ("s".to_string(), salt),
            ("f".to_string(), "json".to_string()),
            ("v".to_string(), API_VERSION.to_string()),
            ("c".to_string(), CLIENT_ID.to_string()),
        ])
    }

    /// Call one endpoint as `user`. Repeated keys in `params` are sent as repeated query parameters.
    async fn call(&self, method: &str, user: &str, params: &[(String, String)]) -> Result<SubsonicResponse> {
        let mut query = self.auth_params(user)?;
        query.extend(params.iter().cloned());
        let url = format!("{}/rest/{}", self.base, method);
        debug!("Subsonic {} for user {}", method, user);

        let resp = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .query(&query)
            .send()
            .await
            .with_context(|| format!("subsonic {} request for {}", method, user))?;
        let status = resp.status();
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            return Err(anyhow!("subsonic {} failed: {} => {}", method, status, txt));
        }
        let envelope: Envelope = resp
            .json()
            .await
            .with_context(|| format!("decoding subsonic {} response for {}", method, user))?;
        let response = envelope.response;
        if response.status != "ok" {
            let (code, message) = response
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or((0, String::new()));
            return Err(anyhow!("Subsonic status is not ok: ({}) {}", code, message));
        }
        Ok(response)
    }
}

#[async_trait]
impl LibrarySearch for SubsonicLibrary {
    async fn search(&self, user: &str, query: &SearchQuery) -> Result<SearchResults> {
        let params = vec![
            ("artistCount".to_string(), query.artist_count.to_string()),
            ("albumCount".to_string(), query.album_count.to_string()),
            ("songCount".to_string(), query.song_count.to_string()),
            ("query".to_string(), query.query.clone()),
        ];
        let resp = self.call("search3", user, &params).await?;
        let result = resp.search_result3.unwrap_or_default();
        Ok(SearchResults {
            artists: result.artist.into_iter().map(|a| LocalArtist { id: a.id, name: a.name }).collect(),
            songs: result.song.into_iter().map(LocalTrack::from).collect(),
        })
    }
}

#[async_trait]
impl PlaylistStore for SubsonicLibrary {
    async fn list_playlists(&self, user: &str) -> Result<Vec<LocalPlaylist>> {
        let params = vec![("username".to_string(), user.to_string())];
        let resp = self.call("getPlaylists", user, &params).await?;
        Ok(resp
            .playlists
            .unwrap_or_default()
            .playlist
            .into_iter()
            .map(LocalPlaylist::from)
            .collect())
    }

    async fn create_playlist(&self, user: &str, target: &PlaylistTarget, song_ids: &[String]) -> Result<Option<LocalPlaylist>> {
        let mut params: Vec<(String, String)> = song_ids.iter().map(|id| ("songId".to_string(), id.clone())).collect();
        match target {
            PlaylistTarget::Existing(id) => params.push(("playlistId".to_string(), id.clone())),
            PlaylistTarget::New(name) => params.push(("name".to_string(), name.clone())),
        }
        let resp = self.call("createPlaylist", user, &params).await?;
        Ok(resp.playlist.map(LocalPlaylist::from))
    }

    async fn update_comment(&self, user: &str, playlist_id: &str, comment: &str) -> Result<()> {
        let params = vec![
            ("playlistId".to_string(), playlist_id.to_string()),
            ("comment".to_string(), comment.to_string()),
        ];
        self.call("updatePlaylist", user, &params).await?;
        Ok(())
    }
}
