//! Candidate selection for generated playlists.
//!
//! Resolved tracks fall into exactly one bucket, checked in this order:
//! rating-excluded, never played (deferred), played within the recency
//! window, eligible. Deferred tracks backfill a short eligible list, and the
//! result is trimmed to `TARGET_SIZE` with an optional per-artist cap.

use crate::api::RecordingMetadata;
use crate::models::{LocalTrack, RatingFilter, ReconciliationOutcome};
use crate::resolver::TrackResolver;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{trace, warn};

pub const TARGET_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionParams {
    /// Recency window in days.
    pub track_age_days: u32,
    /// Maximum tracks per artist; 0 disables the cap.
    pub artist_limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    RatingExcluded,
    NeverPlayed,
    Recent,
    Eligible,
}

pub fn classify(track: &LocalTrack, ratings: &RatingFilter, track_age_days: u32, now: DateTime<Utc>) -> Bucket {
    if !ratings.allows(track.rating) {
        return Bucket::RatingExcluded;
    }
    let played = match track.played {
        Some(p) => p,
        None => return Bucket::NeverPlayed,
    };
    let hours_since = (now - played).num_seconds() as f64 / 3600.0;
    if hours_since < f64::from(track_age_days) * 24.0 {
        Bucket::Recent
    } else {
        Bucket::Eligible
    }
}

/// Resolved tracks sorted into buckets, in feed order.
#[derive(Debug, Default)]
pub struct CandidatePool {
    pub eligible: Vec<LocalTrack>,
    pub never_played: Vec<LocalTrack>,
    pub missing: Vec<String>,
    pub excluded: Vec<String>,
    pub recent: usize,
}

impl CandidatePool {
    pub fn add(&mut self, label: &str, track: LocalTrack, ratings: &RatingFilter, track_age_days: u32, now: DateTime<Utc>) {
        match classify(&track, ratings, track_age_days, now) {
            Bucket::RatingExcluded => self.excluded.push(label.to_string()),
            Bucket::NeverPlayed => self.never_played.push(track),
            Bucket::Recent => {
                trace!("Excluding track `{}` for being played recently", track.title);
                self.recent += 1;
            }
            Bucket::Eligible => self.eligible.push(track),
        }
    }

    pub fn add_missing(&mut self, label: &str) {
        self.missing.push(label.to_string());
    }

    /// Eligible tracks topped up from never-played ones, up to the target size.
    pub fn backfilled(&self) -> Vec<&LocalTrack> {
        let mut pool: Vec<&LocalTrack> = self.eligible.iter().collect();
        if pool.len() < TARGET_SIZE {
            let shortfall = TARGET_SIZE - pool.len();
            pool.extend(self.never_played.iter().take(shortfall));
        }
        pool
    }

    pub fn into_outcome(self, artist_limit: u32) -> ReconciliationOutcome {
        let track_ids = trim(&self.backfilled(), artist_limit);
        ReconciliationOutcome { track_ids, missing: self.missing, excluded: self.excluded, recent: self.recent }
    }
}

/// Take up to `TARGET_SIZE` ids in order. With a cap, a track is skipped when
/// any of its artists has already reached the cap; skipped tracks are never
/// reconsidered.
pub fn trim(pool: &[&LocalTrack], artist_limit: u32) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut credits: HashMap<&str, u32> = HashMap::new();

    for track in pool {
        if ids.len() == TARGET_SIZE {
            break;
        }
        if seen.contains(track.id.as_str()) {
            continue;
        }
        if artist_limit > 0 {
            let capped = track
                .artist_ids()
                .any(|a| credits.get(a).copied().unwrap_or(0) >= artist_limit);
            if capped {
                continue;
            }
            for a in track.artist_ids() {
                *credits.entry(a).or_insert(0) += 1;
            }
        }
        seen.insert(track.id.as_str());
        ids.push(track.id.clone());
    }
    ids
}

/// Resolve the recommendation feed in order and select the playlist.
pub async fn select_candidates(
    resolver: &mut TrackResolver<'_>,
    mbids: &[String],
    metadata: &HashMap<String, RecordingMetadata>,
    ratings: &RatingFilter,
    params: SelectionParams,
    now: DateTime<Utc>,
) -> ReconciliationOutcome {
    let mut pool = CandidatePool::default();
    for mbid in mbids {
        let recording = match metadata.get(mbid) {
            Some(r) => r,
            None => {
                warn!("Track with mbid {} not found in metadata lookup. Skipping", mbid);
                continue;
            }
        };
        match resolver.resolve(&recording.name, mbid, &recording.artist_mbids).await {
            Some(track) => pool.add(&recording.name, track, ratings, params.track_age_days, now),
            None => pool.add_missing(&recording.name),
        }
    }
    pool.into_outcome(params.artist_limit)
}
