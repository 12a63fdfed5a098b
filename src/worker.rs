use crate::api::listenbrainz::ListenBrainzClient;
use crate::api::subsonic::SubsonicLibrary;
use crate::api::{Catalog, LibrarySearch, PlaylistStore};
use crate::config::Config;
use crate::db;
use crate::dispatcher::{batch_error, build_batch, check_job, outcome_error, BatchMode, Dispatcher};
use crate::error::join_errors;
use crate::models::ScheduledJob;
use crate::resolver::ArtistIdentityCache;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Totals for one pass over the due jobs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub processed: usize,
    pub failed: usize,
    pub chained: usize,
    pub written: usize,
}

/// Production clients built from the config.
pub fn clients(cfg: &Config) -> (ListenBrainzClient, SubsonicLibrary) {
    let catalog = ListenBrainzClient::new(&cfg.listenbrainz.base_url)
        .with_retry_policy(cfg.max_retries_on_error, Duration::from_secs(1))
        .with_rate_limit_threshold(cfg.rate_limit_threshold);
    (catalog, SubsonicLibrary::from_config(cfg))
}

/// Run a closure against a fresh connection on the blocking pool.
async fn with_db<T, F>(db_path: PathBuf, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || -> Result<T> {
        let mut conn = db::open_or_create(&db_path)?;
        f(&mut conn)
    })
    .await?
}

/// Build a batch and queue it. Destinations that already have a job waiting
/// are not queued twice. Returns the number of jobs queued.
pub async fn enqueue_batch(cfg: &Config, store: &dyn PlaylistStore, mode: BatchMode) -> Result<usize> {
    let run_id = Uuid::new_v4();
    let now = Utc::now();
    let mut report = build_batch(cfg, store, mode, now).await;

    if mode == BatchMode::MissingOrStale {
        if report.jobs.is_empty() {
            log::info!("[{}] No missing/outdated playlists, not fetching", run_id);
        } else {
            log::info!(
                "[{}] Missing or outdated playlists, fetching on initial sync. Missing: {:?}, Outdated: {:?}",
                run_id,
                report.missing,
                report.stale
            );
        }
    }

    let jobs = std::mem::take(&mut report.jobs);
    let queued = with_db(cfg.db_path.clone(), move |conn| -> Result<usize> {
        let fresh: Vec<ScheduledJob> = jobs
            .into_iter()
            .filter(|s| match db::is_already_queued(&*conn, &s.job) {
                Ok(pending) => !pending,
                Err(e) => {
                    log::warn!("Could not check queue for {}: {:#}", s.job.username, e);
                    true
                }
            })
            .collect();
        db::enqueue_jobs(conn, now.timestamp(), &fresh)
    })
    .await
    .context("queueing batch")?;
    log::info!("[{}] Queued {} job(s) ({:?} batch)", run_id, queued, mode);

    match batch_error(&mut report) {
        Some(e) => Err(e),
        None => Ok(queued),
    }
}

/// Dispatch every job that is due, oldest first. Each job gets its own
/// artist cache, chained jobs are queued relative to when their parent
/// finished, and the job row is removed whatever the outcome.
pub async fn run_due_jobs_once(
    cfg: &Config,
    catalog: &dyn Catalog,
    search: &dyn LibrarySearch,
    store: &dyn PlaylistStore,
) -> Result<WorkerSummary> {
    let run_id = Uuid::new_v4();
    let now_ts = Utc::now().timestamp();
    let due = with_db(cfg.db_path.clone(), move |conn| db::fetch_due_jobs(conn, now_ts))
        .await
        .context("fetching due jobs")?;

    let mut summary = WorkerSummary::default();
    if due.is_empty() {
        log::debug!("[{}] No due jobs", run_id);
        return Ok(summary);
    }

    let dispatcher = Dispatcher::new(catalog, search, store);
    for queued in due {
        summary.processed += 1;
        let id = queued.id;
        let job = match queued.job.and_then(|job| check_job(&job).map(|_| job)) {
            Ok(job) => job,
            Err(e) => {
                log::error!("[{}] Dropping job {}: {:#}", run_id, id, e);
                summary.failed += 1;
                remove_job(cfg, id).await?;
                continue;
            }
        };
        let destination = job.destination().unwrap_or("-").to_string();
        log::info!(
            "[{}] Running {} job {} for user {} ({}), {}s after due",
            run_id,
            job.payload.kind(),
            id,
            job.username,
            destination,
            (now_ts - queued.due_at).max(0)
        );

        let mut cache = ArtistIdentityCache::new();
        let (outcome, mut err) = outcome_error(dispatcher.dispatch(&job, &mut cache).await);

        if let Some(outcome) = outcome {
            if outcome.written {
                summary.written += 1;
            }
            if !outcome.chained.is_empty() {
                let chained = outcome.chained;
                let count = chained.len();
                let base = Utc::now().timestamp();
                match with_db(cfg.db_path.clone(), move |conn| db::enqueue_jobs(conn, base, &chained)).await {
                    Ok(_) => summary.chained += count,
                    Err(e) => {
                        let e = e.context(format!("queueing {} chained job(s)", count));
                        err = join_errors(err.into_iter().chain(std::iter::once(e)).collect());
                    }
                }
            }
        }
        if let Some(e) = err {
            summary.failed += 1;
            log::error!(
                "[{}] {} job for user {} ({}) failed: {:#}",
                run_id,
                job.payload.kind(),
                job.username,
                destination,
                e
            );
        }

        remove_job(cfg, id).await?;
    }

    log::info!(
        "[{}] Processed {} job(s): {} failed, {} playlist(s) written, {} chained",
        run_id,
        summary.processed,
        summary.failed,
        summary.written,
        summary.chained
    );
    Ok(summary)
}

async fn remove_job(cfg: &Config, id: i64) -> Result<()> {
    with_db(cfg.db_path.clone(), move |conn| db::delete_job(conn, id))
        .await
        .with_context(|| format!("removing job {}", id))
}

/// Long-running mode: optional startup check, then the periodic full batch
/// and the queue poll until interrupted.
pub async fn run_daemon(cfg: &Config) -> Result<()> {
    let (catalog, library) = clients(cfg);

    if cfg.check_on_startup {
        if let Err(e) = enqueue_batch(cfg, &library, BatchMode::MissingOrStale).await {
            log::error!("Initial fetch failed: {:#}", e);
        }
    }

    let mut sync_tick = tokio::time::interval(Duration::from_secs(cfg.sync_interval_sec.max(1)));
    let mut worker_tick = tokio::time::interval(Duration::from_secs(cfg.worker_interval_sec.max(1)));
    // The first tick fires immediately; the startup check already covered it.
    sync_tick.tick().await;

    loop {
        tokio::select! {
            _ = sync_tick.tick() => {
                if let Err(e) = enqueue_batch(cfg, &library, BatchMode::Full).await {
                    log::error!("Periodic sync incomplete: {:#}", e);
                }
            }
            _ = worker_tick.tick() => {
                if let Err(e) = run_due_jobs_once(cfg, &catalog, &library, &library).await {
                    log::error!("Worker pass failed: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                return Ok(());
            }
        }
    }
}
