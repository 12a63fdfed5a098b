use crate::models::{Job, ScheduledJob};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;

const SCHEMA: &str = include_str!("../db/schema.sql");

/// A job row read back from the queue. `job` is an error when the stored
/// payload no longer parses, so the row can still be dropped by id.
#[derive(Debug)]
pub struct QueuedJob {
    pub id: i64,
    /// Unix seconds.
    pub due_at: i64,
    pub job: Result<Job>,
}

pub fn open_or_create(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating DB directory {}", parent.display()))?;
        }
    }
    let conn = Connection::open(path).with_context(|| format!("opening DB at {}", path.display()))?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Queue a job to run `delay_secs` after `now_ts`.
pub fn enqueue_job(conn: &Connection, now_ts: i64, scheduled: &ScheduledJob) -> Result<i64> {
    let payload = serde_json::to_string(&scheduled.job).context("serializing job")?;
    conn.execute(
        "INSERT INTO job_queue (due_at, job_type, username, payload_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            now_ts + scheduled.delay_secs as i64,
            scheduled.job.payload.kind(),
            scheduled.job.username,
            payload,
            Utc::now().timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Queue a whole batch in one transaction.
pub fn enqueue_jobs(conn: &mut Connection, now_ts: i64, jobs: &[ScheduledJob]) -> Result<usize> {
    let tx = conn.transaction()?;
    for scheduled in jobs {
        enqueue_job(&tx, now_ts, scheduled)?;
    }
    tx.commit()?;
    Ok(jobs.len())
}

/// Jobs due at or before `now_ts`, oldest first.
pub fn fetch_due_jobs(conn: &Connection, now_ts: i64) -> Result<Vec<QueuedJob>> {
    let mut stmt = conn.prepare(
        "SELECT id, due_at, payload_json FROM job_queue WHERE due_at <= ?1 ORDER BY due_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![now_ts], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?))
    })?;
    let mut v = Vec::new();
    for r in rows {
        let (id, due_at, payload) = r?;
        let job = serde_json::from_str::<Job>(&payload).with_context(|| format!("parsing queued job {}", id));
        v.push(QueuedJob { id, due_at, job });
    }
    Ok(v)
}

/// Every queued job regardless of due time, for status output.
pub fn list_jobs(conn: &Connection) -> Result<Vec<(i64, i64, String, String)>> {
    let mut stmt = conn.prepare("SELECT id, due_at, job_type, username FROM job_queue ORDER BY due_at ASC, id ASC")?;
    let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?;
    let mut v = Vec::new();
    for r in rows {
        v.push(r?);
    }
    Ok(v)
}

pub fn delete_job(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM job_queue WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn count_jobs(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM job_queue", [], |r| r.get(0))?)
}

/// Remove every queued job. Returns the number of rows removed.
pub fn clear_jobs(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction()?;
    let removed = tx.execute("DELETE FROM job_queue", [])?;
    tx.commit()?;
    Ok(removed)
}

/// Whether a job doing the same work for the same user is already waiting.
pub fn is_already_queued(conn: &Connection, job: &Job) -> Result<bool> {
    let mut stmt = conn.prepare("SELECT payload_json FROM job_queue WHERE username = ?1 AND job_type = ?2")?;
    let rows = stmt.query_map(params![job.username, job.payload.kind()], |r| r.get::<_, String>(0))?;
    for r in rows {
        if let Ok(queued) = serde_json::from_str::<Job>(&r?) {
            if queued.duplicates(job) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
