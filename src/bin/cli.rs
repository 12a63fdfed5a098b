use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use listenbrainz_playlist_sync as lib;
use lib::config::Config;
use lib::dispatcher::BatchMode;
use std::path::{Path, PathBuf};
use tracing::subscriber as tracing_subscriber_global;
use tracing_appender::rolling::RollingFileAppender;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "lbz-sync", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: startup check, periodic sync and the job worker (long-running)
    Run,
    /// Queue a full sync of every configured playlist now
    Sync,
    /// Queue jobs only for missing or outdated playlists
    Check,
    /// Run due jobs once (one-shot)
    Worker,
    /// Show the queued jobs
    QueueStatus,
    /// Remove every queued job
    QueueClear,
    /// Validate config file and exit
    ConfigValidate,
}

fn init_logging(cfg: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    // Bridge `log` records from the HTTP clients and worker into tracing.
    let _ = LogTracer::init();
    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&cfg.log_dir, "lbz-sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Honor RUST_LOG if set, otherwise default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().with_writer(non_blocking);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer);

    tracing_subscriber_global::set_global_default(subscriber).context("setting global tracing subscriber")?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Explicit --config wins; otherwise the system-wide file, then the local one.
    let resolved_config_path: PathBuf = match &cli.config {
        Some(p) => p.clone(),
        None => {
            let etc_path = Path::new("/etc/lbz-sync/config.toml");
            if etc_path.exists() {
                etc_path.to_path_buf()
            } else {
                PathBuf::from("config/example-config.toml")
            }
        }
    };

    if let Commands::ConfigValidate = cli.command {
        match Config::from_path(&resolved_config_path) {
            Ok(cfg) => println!("OK ({} user(s))", cfg.users.len()),
            Err(e) => {
                eprintln!("Config validation failed: {:#}", e);
                std::process::exit(2);
            }
        }
        return Ok(());
    }

    let cfg = Config::from_path(&resolved_config_path)
        .with_context(|| format!("loading config from {}", resolved_config_path.display()))?;
    let _guard = init_logging(&cfg)?;

    match cli.command {
        Commands::Run => {
            lib::worker::run_daemon(&cfg).await.context("running daemon")?;
        }
        Commands::Sync | Commands::Check => {
            let mode = if matches!(cli.command, Commands::Sync) { BatchMode::Full } else { BatchMode::MissingOrStale };
            let (_, library) = lib::worker::clients(&cfg);
            let queued = lib::worker::enqueue_batch(&cfg, &library, mode).await.context("queueing batch")?;
            println!("Queued {} job(s).", queued);
        }
        Commands::Worker => {
            let (catalog, library) = lib::worker::clients(&cfg);
            let summary = lib::worker::run_due_jobs_once(&cfg, &catalog, &library, &library)
                .await
                .context("running worker")?;
            println!(
                "Processed {} job(s): {} failed, {} playlist(s) written, {} chained.",
                summary.processed, summary.failed, summary.written, summary.chained
            );
        }
        Commands::QueueStatus => match lib::db::open_or_create(&cfg.db_path).and_then(|conn| lib::db::list_jobs(&conn)) {
            Ok(jobs) => {
                println!("Queue contains {} job(s):", jobs.len());
                for (id, due_at, job_type, username) in jobs {
                    let due = Utc
                        .timestamp_opt(due_at, 0)
                        .single()
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_else(|| due_at.to_string());
                    println!("- id: {} | type: {} | user: {} | due: {}", id, job_type, username, due);
                }
            }
            Err(e) => {
                eprintln!("Failed to read job queue: {:#}", e);
                std::process::exit(1);
            }
        },
        Commands::QueueClear => match lib::db::open_or_create(&cfg.db_path) {
            Ok(mut conn) => match lib::db::clear_jobs(&mut conn) {
                Ok(removed) => println!("Cleared {} job(s) from the queue.", removed),
                Err(e) => {
                    eprintln!("Failed to clear queue: {:#}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Failed to open DB: {:#}", e);
                std::process::exit(1);
            }
        },
        Commands::ConfigValidate => {}
    }

    Ok(())
}
