//! Mapping of remotely described tracks onto songs in the local library.

use crate::api::LibrarySearch;
use crate::models::{LocalTrack, SearchQuery};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Artist MBID -> local artist id for the duration of one synchronization run.
/// An empty id records a confirmed miss. Entries are written once and never
/// changed; create a fresh cache per run and never share it between runs.
#[derive(Debug, Default)]
pub struct ArtistIdentityCache {
    ids: HashMap<String, String>,
}

impl ArtistIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mbid: &str) -> Option<&str> {
        self.ids.get(mbid).map(String::as_str)
    }

    fn remember(&mut self, mbid: &str, id: String) -> &str {
        self.ids.entry(mbid.to_string()).or_insert(id)
    }
}

/// Two-stage lookup: MBID first, then exact title + exact artist set.
pub struct TrackResolver<'a> {
    library: &'a dyn LibrarySearch,
    cache: &'a mut ArtistIdentityCache,
    user: &'a str,
    fallback_count: u32,
}

impl<'a> TrackResolver<'a> {
    pub fn new(library: &'a dyn LibrarySearch, cache: &'a mut ArtistIdentityCache, user: &'a str, fallback_count: u32) -> Self {
        Self { library, cache, user, fallback_count }
    }

    /// Resolve one track. Library errors are treated as misses so one bad
    /// lookup does not abort the surrounding playlist.
    pub async fn resolve(&mut self, title: &str, mbid: &str, artist_mbids: &[String]) -> Option<LocalTrack> {
        match self.try_resolve(title, mbid, artist_mbids).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Lookup of `{}` ({}) for user {} failed: {:#}", title, mbid, self.user, e);
                None
            }
        }
    }

    async fn try_resolve(&mut self, title: &str, mbid: &str, artist_mbids: &[String]) -> Result<Option<LocalTrack>> {
        let by_mbid = self.library.search(self.user, &SearchQuery::songs(mbid, 1)).await?;
        if let Some(song) = by_mbid.songs.into_iter().next() {
            return Ok(Some(song));
        }
        debug!("Could not find track by MBID: {}", mbid);

        let mut artist_ids: HashSet<String> = HashSet::new();
        for artist_mbid in artist_mbids {
            let id = self.artist_id(artist_mbid).await?;
            if id.is_empty() {
                return Ok(None);
            }
            artist_ids.insert(id);
        }

        let candidates = self
            .library
            .search(self.user, &SearchQuery::songs(title, self.fallback_count))
            .await?;
        let found = candidates.songs.into_iter().find(|song| {
            song.title == title
                && song.artists.len() == artist_ids.len()
                && song.artist_ids().all(|id| artist_ids.contains(id))
        });
        if found.is_none() {
            debug!("Could not find song by matching title and artist mbids: {}, {:?}", title, artist_mbids);
        }
        Ok(found)
    }

    /// Cached artist lookup; one library search per distinct MBID per run.
    async fn artist_id(&mut self, mbid: &str) -> Result<String> {
        if let Some(id) = self.cache.get(mbid) {
            return Ok(id.to_string());
        }
        let resp = self.library.search(self.user, &SearchQuery::artist(mbid)).await?;
        let id = match resp.artists.into_iter().next() {
            Some(artist) => {
                debug!("Artist found by mbid: {}", artist.name);
                artist.id
            }
            None => {
                debug!("Artist not found by mbid: {}", mbid);
                String::new()
            }
        };
        Ok(self.cache.remember(mbid, id).to_string())
    }
}
