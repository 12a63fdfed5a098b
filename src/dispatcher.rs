//! Job execution and batch construction.
//!
//! A job either fetches the "created for" playlists and chains one import per
//! configured source, generates a recommendations playlist, or imports a
//! single ListenBrainz playlist. Jobs never schedule anything themselves:
//! discovered follow-up work is returned in `DispatchOutcome::chained` with an
//! offset, and the caller persists it.

use crate::api::{find_playlist, Catalog, LibrarySearch, PlaylistStore};
use crate::config::{Config, UserConfig, MAX_FALLBACK_COUNT, MIN_FALLBACK_COUNT};
use crate::error::join_errors;
use crate::models::{
    DispatchOutcome, GenerateParams, ImportParams, Job, JobPayload, PatchParams, ReconciliationOutcome,
    ScheduledJob, Source,
};
use crate::reconcile::reconcile_playlist;
use crate::resolver::{ArtistIdentityCache, TrackResolver};
use crate::selection::{select_candidates, SelectionParams};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{error, info, warn};

/// Nominal time one remote-facing unit of work is expected to take, in seconds.
pub const JOB_DURATION: u64 = 30;

impl Job {
    /// Expected run time of this job, used to space out a batch.
    pub fn duration_secs(&self) -> u64 {
        match &self.payload {
            JobPayload::FetchPatches { patch } => JOB_DURATION * (1 + patch.sources.len() as u64),
            _ => JOB_DURATION,
        }
    }
}

/// Runs jobs against a catalog and a local library.
pub struct Dispatcher<'a> {
    catalog: &'a dyn Catalog,
    search: &'a dyn LibrarySearch,
    store: &'a dyn PlaylistStore,
    now: Option<DateTime<Utc>>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(catalog: &'a dyn Catalog, search: &'a dyn LibrarySearch, store: &'a dyn PlaylistStore) -> Self {
        Self { catalog, search, store, now: None }
    }

    /// Pin the clock used for recency checks and comments.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Run one job. `cache` holds artist lookups for this run only.
    pub async fn dispatch(&self, job: &Job, cache: &mut ArtistIdentityCache) -> Result<DispatchOutcome> {
        match &job.payload {
            JobPayload::FetchPatches { patch } => self.fetch_sources(job, patch).await,
            JobPayload::GenerateJams { generate } => self.generate(job, generate, cache).await,
            JobPayload::ImportPlaylist { import } => self.import(job, import, cache).await,
        }
    }

    async fn fetch_sources(&self, job: &Job, patch: &PatchParams) -> Result<DispatchOutcome> {
        let playlists = self
            .catalog
            .created_for_playlists(&job.lbz_username, &job.lbz_token)
            .await
            .map_err(|e| {
                error!("Failed to fetch playlists for user {}: {}", job.username, e);
                anyhow::Error::new(e).context(format!("Failed to fetch playlists for user {}", job.username))
            })?;

        let mut outcome = DispatchOutcome::default();
        for (idx, source) in patch.sources.iter().enumerate() {
            let found = playlists.iter().find(|p| p.source_patch == source.source_patch);
            let playlist = match found {
                Some(p) => p,
                None => {
                    let err = anyhow!(
                        "No playlist for ListenBrainz user `{}` found with algorithm/source patch `{}`",
                        job.lbz_username,
                        source.source_patch
                    );
                    error!("{}", err);
                    outcome.errors.push(err);
                    continue;
                }
            };

            outcome.chained.push(ScheduledJob {
                delay_secs: JOB_DURATION * (idx as u64 + 1),
                job: job.with_payload(JobPayload::ImportPlaylist {
                    import: ImportParams { name: source.playlist_name.clone(), lbz_id: playlist.id.clone() },
                }),
            });
        }
        info!(
            "Queued {} of {} source imports for user {}",
            outcome.chained.len(),
            patch.sources.len(),
            job.username
        );
        Ok(outcome)
    }

    async fn generate(&self, job: &Job, params: &GenerateParams, cache: &mut ArtistIdentityCache) -> Result<DispatchOutcome> {
        info!("Generating playlist `{}` for user {}", params.name, job.username);
        let now = self.now();

        let recommendations = self
            .catalog
            .recommendations(&job.lbz_username, &job.lbz_token)
            .await
            .map_err(|e| {
                error!("Unable to fetch recommendations for user {}: {}", job.username, e);
                anyhow::Error::new(e)
            })?;
        let mbids = &recommendations.mbids;

        let metadata = self.catalog.lookup_recordings(mbids, &job.lbz_token).await.map_err(|e| {
            error!("Unable to lookup {} recordings for user {}: {}", mbids.len(), job.username, e);
            anyhow::Error::new(e)
        })?;

        let mut resolver = TrackResolver::new(self.search, cache, &job.username, job.fallback);
        let selection = SelectionParams { track_age_days: params.track_age, artist_limit: params.artist_limit };
        let outcome = select_candidates(&mut resolver, mbids, &metadata, &job.ratings, selection, now).await;

        let comment = generate_comment(now, mbids.len(), recommendations.last_updated, &outcome);
        reconcile_playlist(self.store, &job.username, &params.name, &comment, &outcome.track_ids)
            .await
            .map_err(|e| {
                error!("Unable to import playlist `{}` for user {}: {:#}", params.name, job.username, e);
                e
            })?;
        info!("Successfully generated playlist `{}` for user {}", params.name, job.username);

        Ok(DispatchOutcome { reconciliation: Some(outcome), written: true, ..Default::default() })
    }

    async fn import(&self, job: &Job, params: &ImportParams, cache: &mut ArtistIdentityCache) -> Result<DispatchOutcome> {
        let playlist = self.catalog.playlist(&params.lbz_id, &job.lbz_token).await.map_err(|e| {
            error!("Unable to import playlist {}: {}", params.lbz_id, e);
            anyhow::Error::new(e)
        })?;
        info!("Importing playlist `{}`", playlist.title);

        let mut outcome = ReconciliationOutcome::default();
        let mut resolver = TrackResolver::new(self.search, cache, &job.username, job.fallback);
        for track in &playlist.tracks {
            match resolver.resolve(&track.title, &track.mbid, &track.artist_mbids).await {
                Some(song) if job.ratings.allows(song.rating) => outcome.push_track_id(&song.id),
                Some(_) => outcome.excluded.push(track.label()),
                None => outcome.missing.push(track.label()),
            }
        }

        if outcome.track_ids.is_empty() {
            warn!("No matching files found for playlist {}. Refusing to create/update", params.name);
            return Ok(DispatchOutcome { reconciliation: Some(outcome), ..Default::default() });
        }

        let date = playlist.date.map(|d| d.to_rfc3339()).unwrap_or_default();
        let comment = import_comment(&playlist.identifier, &date, &outcome);
        reconcile_playlist(self.store, &job.username, &params.name, &comment, &outcome.track_ids)
            .await
            .map_err(|e| {
                error!("Failed to import playlist `{}` for user {}: {:#}", params.name, job.username, e);
                e
            })?;
        info!("Successfully processed playlist `{}` for user {}", params.name, job.username);

        Ok(DispatchOutcome { reconciliation: Some(outcome), written: true, ..Default::default() })
    }
}

/// Fold a dispatch result into a single error, counting partial failures.
pub fn outcome_error(result: Result<DispatchOutcome>) -> (Option<DispatchOutcome>, Option<anyhow::Error>) {
    match result {
        Ok(mut outcome) => {
            let err = join_errors(std::mem::take(&mut outcome.errors));
            (Some(outcome), err)
        }
        Err(e) => (None, Some(e)),
    }
}

pub fn generate_comment(now: DateTime<Utc>, recommendations: usize, last_updated: i64, outcome: &ReconciliationOutcome) -> String {
    let recs_updated = Utc
        .timestamp_opt(last_updated, 0)
        .single()
        .map(|d| d.to_rfc2822())
        .unwrap_or_default();
    format!(
        "Jams generated on {} with {} recommendations generated on {}.\nExcluded by rating rules: {}\nTracks not found in library: {}\nExcluded for being recent: {}",
        now.to_rfc2822(),
        recommendations,
        recs_updated,
        outcome.excluded.join(", "),
        outcome.missing.join(", "),
        outcome.recent
    )
}

pub fn import_comment(identifier: &str, date: &str, outcome: &ReconciliationOutcome) -> String {
    let mut comment = format!("Imported from playlist {}\nUpdated on: {}", identifier, date);
    if !outcome.missing.is_empty() {
        comment.push_str(&format!(
            "\nTracks not matched by track MBID or track name + artist MBIDs: {}",
            outcome.missing.join(", ")
        ));
    }
    if !outcome.excluded.is_empty() {
        comment.push_str(&format!("\nTracks excluded by rating rule: {}", outcome.excluded.join(", ")));
    }
    comment
}

/// Which destinations a batch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Every configured destination; one-time imports only while missing.
    Full,
    /// Only destinations that are missing or older than the staleness threshold.
    MissingOrStale,
}

/// Jobs for one batch, plus what triggered them.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub jobs: Vec<ScheduledJob>,
    pub missing: Vec<String>,
    pub stale: Vec<String>,
    /// Users whose playlists could not be listed; their destinations were skipped.
    pub errors: Vec<anyhow::Error>,
}

enum Freshness {
    Missing,
    Stale,
    Fresh,
}

fn freshness(store_playlists: &[crate::models::LocalPlaylist], name: &str, now: DateTime<Utc>, stale_after: Duration) -> Freshness {
    match find_playlist(store_playlists, name) {
        None => Freshness::Missing,
        Some(p) => match p.changed {
            Some(changed) if now - changed <= stale_after => Freshness::Fresh,
            _ => Freshness::Stale,
        },
    }
}

fn user_job(cfg: &Config, user: &UserConfig, payload: JobPayload) -> Job {
    Job {
        username: user.username.clone(),
        lbz_username: user.lbz_username.clone(),
        lbz_token: user.lbz_token.clone(),
        ratings: user.rating_filter(),
        fallback: cfg.fallback_count,
        payload,
    }
}

/// Build the jobs for every configured user, spaced so they run back to back.
pub async fn build_batch(cfg: &Config, store: &dyn PlaylistStore, mode: BatchMode, now: DateTime<Utc>) -> BatchReport {
    let stale_after = Duration::seconds(cfg.stale_after_sec);
    let mut report = BatchReport::default();
    let mut jobs: Vec<Job> = Vec::new();

    for user in &cfg.users {
        let playlists = match store.list_playlists(&user.username).await {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to fetch playlists for user {}: {:#}", user.username, e);
                report.errors.push(e.context(format!("Failed to fetch playlists for user {}", user.username)));
                continue;
            }
        };
        let label = |name: &str| format!("User: `{}`, Source: `{}`", user.username, name);

        // Records the reason and returns whether the destination needs a run.
        let wanted = |name: &str, refreshable: bool, report: &mut BatchReport| -> bool {
            match freshness(&playlists, name, now, stale_after) {
                Freshness::Missing => {
                    report.missing.push(label(name));
                    true
                }
                Freshness::Stale if refreshable => {
                    if mode == BatchMode::MissingOrStale {
                        report.stale.push(label(name));
                    }
                    true
                }
                Freshness::Fresh if refreshable => mode == BatchMode::Full,
                _ => false,
            }
        };

        let sources: Vec<Source> = user
            .sources
            .iter()
            .filter(|s| wanted(&s.playlist_name, true, &mut report))
            .cloned()
            .collect();
        if !sources.is_empty() {
            jobs.push(user_job(cfg, user, JobPayload::FetchPatches { patch: PatchParams { sources } }));
        }

        if let Some(generate) = user.generate_params() {
            if wanted(&generate.name, true, &mut report) {
                jobs.push(user_job(cfg, user, JobPayload::GenerateJams { generate }));
            }
        }

        for item in &user.playlists {
            if wanted(&item.name, !item.one_time, &mut report) {
                jobs.push(user_job(
                    cfg,
                    user,
                    JobPayload::ImportPlaylist {
                        import: ImportParams { name: item.name.clone(), lbz_id: item.lbz_id.clone() },
                    },
                ));
            }
        }
    }

    report.jobs = space_jobs(jobs);
    report
}

/// Assign offsets: the first job at 1s, each next one after the previous job's duration.
pub fn space_jobs(jobs: Vec<Job>) -> Vec<ScheduledJob> {
    let mut delay = 1;
    jobs.into_iter()
        .map(|job| {
            let scheduled = ScheduledJob { delay_secs: delay, job };
            delay += scheduled.job.duration_secs();
            scheduled
        })
        .collect()
}

/// Convenience for callers that only need the error of a failed batch.
pub fn batch_error(report: &mut BatchReport) -> Option<anyhow::Error> {
    join_errors(std::mem::take(&mut report.errors)).map(|e| e.context("Initial fetch incomplete"))
}

/// Validate a job read back from storage before it is dispatched.
pub fn check_job(job: &Job) -> Result<()> {
    if job.username.is_empty() {
        return Err(anyhow!("{} job without a library user", job.payload.kind()));
    }
    match &job.payload {
        _ if !(MIN_FALLBACK_COUNT..=MAX_FALLBACK_COUNT).contains(&job.fallback) => Err(anyhow!(
            "fallback must be between {} and {}, got {}",
            MIN_FALLBACK_COUNT,
            MAX_FALLBACK_COUNT,
            job.fallback
        )),
        JobPayload::FetchPatches { patch } if patch.sources.is_empty() => {
            Err(anyhow!("attempting to dispatch patch fetch without sources"))
        }
        JobPayload::ImportPlaylist { import } if import.lbz_id.is_empty() => {
            Err(anyhow!("attempting to call import job without a playlist id"))
        }
        _ => Ok(()),
    }
    .with_context(|| format!("Invalid job for user {}", job.username))
}
