use chrono::Utc;
use tempfile::tempdir;

use listenbrainz_playlist_sync::api::mock::{LibraryCall, MockCatalog, MockLibrary};
use listenbrainz_playlist_sync::api::RemotePlaylist;
use listenbrainz_playlist_sync::config::Config;
use listenbrainz_playlist_sync::db;
use listenbrainz_playlist_sync::dispatcher::BatchMode;
use listenbrainz_playlist_sync::models::{
    ImportParams, Job, JobPayload, LocalTrack, PatchParams, RatingFilter, RemoteTrackRef, ScheduledJob,
};
use listenbrainz_playlist_sync::worker::{enqueue_batch, run_due_jobs_once};

fn config(dir: &std::path::Path) -> Config {
    let mut cfg = Config::from_toml(
        r#"
        [[users]]
        username = "alice"
        lbz_username = "lbz-alice"
        sources = [{ source_patch = "daily-jams", playlist_name = "Daily" },
                   { source_patch = "weekly-exploration", playlist_name = "Weekly" }]
        "#,
    )
    .unwrap();
    cfg.db_path = dir.join("queue.db");
    cfg
}

fn job(payload: JobPayload) -> Job {
    Job {
        username: "alice".into(),
        lbz_username: "lbz-alice".into(),
        lbz_token: String::new(),
        ratings: RatingFilter::all(),
        fallback: 15,
        payload,
    }
}

fn remote(id: &str, patch: &str, tracks: Vec<RemoteTrackRef>) -> RemotePlaylist {
    RemotePlaylist {
        id: id.into(),
        identifier: format!("https://listenbrainz.org/playlist/{}", id),
        title: id.into(),
        date: None,
        source_patch: patch.into(),
        tracks,
    }
}

/// Queue a job that is already due.
fn enqueue_due(cfg: &Config, job: Job) {
    let conn = db::open_or_create(&cfg.db_path).unwrap();
    db::enqueue_job(&conn, Utc::now().timestamp() - 120, &ScheduledJob { delay_secs: 0, job }).unwrap();
}

#[tokio::test]
async fn fetch_job_chains_imports_and_is_removed() {
    let td = tempdir().unwrap();
    let cfg = config(td.path());
    enqueue_due(
        &cfg,
        job(JobPayload::FetchPatches {
            patch: PatchParams { sources: cfg.users[0].sources.clone() },
        }),
    );
    let catalog = MockCatalog { created_for: vec![remote("pl-1", "daily-jams", vec![])], ..Default::default() };
    let lib = MockLibrary::new();

    let summary = run_due_jobs_once(&cfg, &catalog, &lib, &lib).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1, "unmatched source is a partial failure");
    assert_eq!(summary.chained, 1);

    let conn = db::open_or_create(&cfg.db_path).unwrap();
    let queued = db::list_jobs(&conn).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].2, "import-playlist");
    assert!(queued[0].1 >= Utc::now().timestamp() + 25, "chained import is offset from now");
}

#[tokio::test]
async fn import_job_writes_playlist() {
    let td = tempdir().unwrap();
    let cfg = config(td.path());
    enqueue_due(
        &cfg,
        job(JobPayload::ImportPlaylist { import: ImportParams { name: "Daily".into(), lbz_id: "pl-1".into() } }),
    );
    let mut catalog = MockCatalog::default();
    catalog.playlists.insert(
        "pl-1".into(),
        remote(
            "pl-1",
            "daily-jams",
            vec![RemoteTrackRef { title: "Song".into(), mbid: "m1".into(), artist_mbids: vec![], creator: "Band".into() }],
        ),
    );
    let mut lib = MockLibrary::new();
    lib.songs_by_mbid.insert("m1".into(), LocalTrack { id: "s1".into(), title: "Song".into(), ..Default::default() });

    let summary = run_due_jobs_once(&cfg, &catalog, &lib, &lib).await.unwrap();
    assert_eq!(summary.written, 1);
    assert_eq!(summary.failed, 0);
    assert!(lib.write_calls().iter().any(|c| matches!(
        c,
        LibraryCall::CreatePlaylist { song_ids, .. } if song_ids == &vec!["s1".to_string()]
    )));
    let conn = db::open_or_create(&cfg.db_path).unwrap();
    assert_eq!(db::count_jobs(&conn).unwrap(), 0);
}

#[tokio::test]
async fn failed_job_is_dropped_not_retried() {
    let td = tempdir().unwrap();
    let cfg = config(td.path());
    enqueue_due(
        &cfg,
        job(JobPayload::ImportPlaylist { import: ImportParams { name: "Daily".into(), lbz_id: "gone".into() } }),
    );
    let catalog = MockCatalog::default();
    let lib = MockLibrary::new();

    let summary = run_due_jobs_once(&cfg, &catalog, &lib, &lib).await.unwrap();
    assert_eq!(summary.failed, 1);
    let conn = db::open_or_create(&cfg.db_path).unwrap();
    assert_eq!(db::count_jobs(&conn).unwrap(), 0);
}

#[tokio::test]
async fn unreadable_payload_is_dropped() {
    let td = tempdir().unwrap();
    let cfg = config(td.path());
    {
        let conn = db::open_or_create(&cfg.db_path).unwrap();
        conn.execute(
            "INSERT INTO job_queue (due_at, job_type, username, payload_json, created_at) VALUES (0, 'import-playlist', 'alice', '{not json', 0)",
            [],
        )
        .unwrap();
    }
    let catalog = MockCatalog::default();
    let lib = MockLibrary::new();

    let summary = run_due_jobs_once(&cfg, &catalog, &lib, &lib).await.unwrap();
    assert_eq!((summary.processed, summary.failed), (1, 1));
    let conn = db::open_or_create(&cfg.db_path).unwrap();
    assert_eq!(db::count_jobs(&conn).unwrap(), 0);
}

#[tokio::test]
async fn destinations_already_waiting_are_not_queued_twice() {
    let td = tempdir().unwrap();
    let mut cfg = Config::from_toml(
        r#"
        [[users]]
        username = "alice"
        lbz_username = "lbz-alice"
        sources = [{ source_patch = "daily-jams", playlist_name = "Daily" }]
        playlists = [{ name = "Mix", lbz_id = "pl-8" }]
        "#,
    )
    .unwrap();
    cfg.db_path = td.path().join("queue.db");
    let lib = MockLibrary::new();

    assert_eq!(enqueue_batch(&cfg, &lib, BatchMode::Full).await.unwrap(), 2);
    assert_eq!(enqueue_batch(&cfg, &lib, BatchMode::Full).await.unwrap(), 0);

    let conn = db::open_or_create(&cfg.db_path).unwrap();
    let kinds: Vec<String> = db::list_jobs(&conn).unwrap().into_iter().map(|j| j.2).collect();
    assert_eq!(kinds.iter().filter(|k| *k == "import-playlist").count(), 1);
    assert_eq!(kinds.iter().filter(|k| *k == "fetch-patches").count(), 1);
}

#[tokio::test]
async fn chained_queue_failure_still_removes_the_parent() {
    let td = tempdir().unwrap();
    let cfg = config(td.path());
    enqueue_due(
        &cfg,
        job(JobPayload::FetchPatches {
            patch: PatchParams { sources: cfg.users[0].sources.clone() },
        }),
    );
    {
        let conn = db::open_or_create(&cfg.db_path).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_inserts BEFORE INSERT ON job_queue BEGIN SELECT RAISE(ABORT, 'queue is read-only'); END;",
        )
        .unwrap();
    }
    let catalog = MockCatalog {
        created_for: vec![remote("pl-1", "daily-jams", vec![]), remote("pl-2", "weekly-exploration", vec![])],
        ..Default::default()
    };
    let lib = MockLibrary::new();

    let summary = run_due_jobs_once(&cfg, &catalog, &lib, &lib).await.unwrap();
    assert_eq!((summary.processed, summary.failed, summary.chained), (1, 1, 0));
    let conn = db::open_or_create(&cfg.db_path).unwrap();
    assert_eq!(db::count_jobs(&conn).unwrap(), 0);
}

#[tokio::test]
async fn nothing_due_is_a_no_op() {
    let td = tempdir().unwrap();
    let cfg = config(td.path());
    let catalog = MockCatalog::default();
    let lib = MockLibrary::new();
    let summary = run_due_jobs_once(&cfg, &catalog, &lib, &lib).await.unwrap();
    assert_eq!(summary.processed, 0);
}
