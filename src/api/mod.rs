pub mod listenbrainz;
pub mod mock;
pub mod subsonic;

use crate::error::RemoteError;
use crate::models::{LocalPlaylist, RemoteTrackRef, SearchQuery, SearchResults};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Summary of one playlist generated for a user on the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePlaylist {
    /// Bare playlist id (last segment of the identifier URL).
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub date: Option<DateTime<Utc>>,
    /// Algorithm/source patch that produced the playlist.
    pub source_patch: String,
    pub tracks: Vec<RemoteTrackRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recommendations {
    /// Recording MBIDs in feed order.
    pub mbids: Vec<String>,
    pub last_updated: i64,
}

/// Title and artist MBIDs for one recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingMetadata {
    pub name: String,
    pub artist_mbids: Vec<String>,
}

/// Remote recommendation catalog.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    async fn created_for_playlists(&self, lbz_username: &str, token: &str) -> Result<Vec<RemotePlaylist>, RemoteError>;

    async fn playlist(&self, id: &str, token: &str) -> Result<RemotePlaylist, RemoteError>;

    async fn recommendations(&self, lbz_username: &str, token: &str) -> Result<Recommendations, RemoteError>;

    /// Batch lookup keyed by recording MBID. Unknown MBIDs are simply absent.
    async fn lookup_recordings(&self, mbids: &[String], token: &str) -> Result<HashMap<String, RecordingMetadata>, RemoteError>;
}

/// The local library's text search.
#[async_trait::async_trait]
pub trait LibrarySearch: Send + Sync {
    async fn search(&self, user: &str, query: &SearchQuery) -> Result<SearchResults>;
}

/// Upsert target: an existing playlist id, or a name to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistTarget {
    Existing(String),
    New(String),
}

/// Playlist operations on the local library.
#[async_trait::async_trait]
pub trait PlaylistStore: Send + Sync {
    async fn list_playlists(&self, user: &str) -> Result<Vec<LocalPlaylist>>;

    /// Create or replace a playlist's songs. Returns the stored playlist when the backend reports it.
    async fn create_playlist(&self, user: &str, target: &PlaylistTarget, song_ids: &[String]) -> Result<Option<LocalPlaylist>>;

    async fn update_comment(&self, user: &str, playlist_id: &str, comment: &str) -> Result<()>;
}

/// Find a playlist by exact name.
pub fn find_playlist<'a>(playlists: &'a [LocalPlaylist], name: &str) -> Option<&'a LocalPlaylist> {
    playlists.iter().find(|p| p.name == name)
}
