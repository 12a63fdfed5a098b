use super::{Catalog, LibrarySearch, PlaylistStore, PlaylistTarget, RecordingMetadata, Recommendations, RemotePlaylist};
use crate::error::RemoteError;
use crate::models::{LocalArtist, LocalPlaylist, LocalTrack, SearchQuery, SearchResults};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

/// In-memory catalog used in tests. Unknown lookups yield domain errors.
#[derive(Default)]
pub struct MockCatalog {
    pub created_for: Vec<RemotePlaylist>,
    pub playlists: HashMap<String, RemotePlaylist>,
    pub recommendations: Option<Recommendations>,
    pub metadata: HashMap<String, RecordingMetadata>,
}

#[async_trait]
impl Catalog for MockCatalog {
    async fn created_for_playlists(&self, lbz_username: &str, _token: &str) -> Result<Vec<RemotePlaylist>, RemoteError> {
        info!("MockCatalog: created_for_playlists {}", lbz_username);
        Ok(self.created_for.clone())
    }

    async fn playlist(&self, id: &str, _token: &str) -> Result<RemotePlaylist, RemoteError> {
        self.playlists
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::Domain(format!("Nothing parsed for playlist {}", id)))
    }

    async fn recommendations(&self, lbz_username: &str, _token: &str) -> Result<Recommendations, RemoteError> {
        self.recommendations
            .clone()
            .filter(|r| !r.mbids.is_empty())
            .ok_or_else(|| RemoteError::Domain(format!("No recommendations found for user {}", lbz_username)))
    }

    async fn lookup_recordings(&self, mbids: &[String], _token: &str) -> Result<HashMap<String, RecordingMetadata>, RemoteError> {
        Ok(mbids
            .iter()
            .filter_map(|m| self.metadata.get(m).map(|md| (m.clone(), md.clone())))
            .collect())
    }
}

/// Every call a `MockLibrary` received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryCall {
    Search { user: String, query: SearchQuery },
    ListPlaylists { user: String },
    CreatePlaylist { user: String, target: PlaylistTarget, song_ids: Vec<String> },
    UpdateComment { user: String, playlist_id: String, comment: String },
}

/// In-memory library. Songs are found by id (MBID lookups are keyed
/// separately) or by title; artists by MBID.
#[derive(Default)]
pub struct MockLibrary {
    /// Recording MBID -> song.
    pub songs_by_mbid: HashMap<String, LocalTrack>,
    /// Songs searchable by title.
    pub songs: Vec<LocalTrack>,
    /// Artist MBID -> local artist.
    pub artists_by_mbid: HashMap<String, LocalArtist>,
    pub playlists: Mutex<Vec<LocalPlaylist>>,
    pub calls: Mutex<Vec<LibraryCall>>,
    /// Make every playlist write fail.
    pub fail_writes: bool,
}

impl MockLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<LibraryCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn search_calls(&self) -> Vec<SearchQuery> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                LibraryCall::Search { query, .. } => Some(query),
                _ => None,
            })
            .collect()
    }

    pub fn write_calls(&self) -> Vec<LibraryCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, LibraryCall::CreatePlaylist { .. } | LibraryCall::UpdateComment { .. }))
            .collect()
    }

    fn record(&self, call: LibraryCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl LibrarySearch for MockLibrary {
    async fn search(&self, user: &str, query: &SearchQuery) -> Result<SearchResults> {
        self.record(LibraryCall::Search { user: user.to_string(), query: query.clone() });
        let mut results = SearchResults::default();
        if query.artist_count > 0 {
            if let Some(a) = self.artists_by_mbid.get(&query.query) {
                results.artists.push(a.clone());
            }
        }
        if query.song_count > 0 {
            if let Some(s) = self.songs_by_mbid.get(&query.query) {
                results.songs.push(s.clone());
            } else {
                results.songs = self
                    .songs
                    .iter()
                    .filter(|s| s.title.contains(&query.query))
                    .take(query.song_count as usize)
                    .cloned()
                    .collect();
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl PlaylistStore for MockLibrary {
    async fn list_playlists(&self, user: &str) -> Result<Vec<LocalPlaylist>> {
        self.record(LibraryCall::ListPlaylists { user: user.to_string() });
        Ok(self.playlists.lock().map_err(|_| anyhow!("poisoned"))?.clone())
    }

    async fn create_playlist(&self, user: &str, target: &PlaylistTarget, song_ids: &[String]) -> Result<Option<LocalPlaylist>> {
        self.record(LibraryCall::CreatePlaylist {
            user: user.to_string(),
            target: target.clone(),
            song_ids: song_ids.to_vec(),
        });
        if self.fail_writes {
            return Err(anyhow!("mock write failure"));
        }
        let mut playlists = self.playlists.lock().map_err(|_| anyhow!("poisoned"))?;
        let stored = match target {
            PlaylistTarget::Existing(id) => {
                let p = playlists
                    .iter_mut()
                    .find(|p| &p.id == id)
                    .ok_or_else(|| anyhow!("no playlist {}", id))?;
                p.song_count = song_ids.len() as u32;
                p.clone()
            }
            PlaylistTarget::New(name) => {
                let p = LocalPlaylist {
                    id: format!("mock-playlist-{}", playlists.len() + 1),
                    name: name.clone(),
                    comment: String::new(),
                    song_count: song_ids.len() as u32,
                    changed: Some(chrono::Utc::now()),
                };
                playlists.push(p.clone());
                p
            }
        };
        Ok(Some(stored))
    }

    async fn update_comment(&self, user: &str, playlist_id: &str, comment: &str) -> Result<()> {
        self.record(LibraryCall::UpdateComment {
            user: user.to_string(),
            playlist_id: playlist_id.to_string(),
            comment: comment.to_string(),
        });
        if self.fail_writes {
            return Err(anyhow!("mock write failure"));
        }
        let mut playlists = self.playlists.lock().map_err(|_| anyhow!("poisoned"))?;
        if let Some(p) = playlists.iter_mut().find(|p| p.id == playlist_id) {
            p.comment = comment.to_string();
        }
        Ok(())
    }
}
