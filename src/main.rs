use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod appliance;
mod clock;
mod config;
mod console;
mod diagnostics;
mod error;
mod exporter;
mod frame;
mod record;
mod recorder;
mod sampler;
mod storage;

use appliance::{Appliance, Command};
use clock::SystemClock;
use config::AppConfig;
use diagnostics::{DiskMonitor, SysinfoProbe};
use exporter::{ExportJob, ExportOutcome, ExportWorker};

#[derive(Parser, Debug)]
#[command(
    name = "rgb-point-logger",
    about = "Samples RGB values at fixed pixel points and logs them per session"
)]
struct Args {
    /// TOML config file; the built-in defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the appliance loop (default)
    Run {
        /// Start a recording session immediately
        #[arg(long)]
        record: bool,
        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<f64>,
        /// Ignore stdin commands
        #[arg(long)]
        no_console: bool,
    },

    /// Copy sessions to removable storage
    Export {
        /// Override export.removable_root
        #[arg(long)]
        dest: Option<PathBuf>,
        /// Also export sessions that were never closed
        #[arg(long)]
        include_unclosed: bool,
        /// Session ids; all sessions when empty
        sessions: Vec<String>,
    },

    /// List recorded sessions
    Sessions,

    /// Summarize one session's record file
    Inspect { session: String },

    /// Show free space on the storage target
    Disk,

    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let cfg = match path {
        Some(p) => AppConfig::load_from(p)?,
        None => AppConfig::load_default()?,
    };
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let command = args.command.unwrap_or(Cmd::Run {
        record: false,
        duration_secs: None,
        no_console: false,
    });
    match command {
        Cmd::Run {
            record,
            duration_secs,
            no_console,
        } => run(config, record, duration_secs, no_console).await,
        Cmd::Export {
            dest,
            include_unclosed,
            sessions,
        } => export(config, dest, include_unclosed, sessions).await,
        Cmd::Sessions => list(&config),
        Cmd::Inspect { session } => inspect(&config, &session),
        Cmd::Disk => disk(&config),
        Cmd::Config => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn run(
    config: AppConfig,
    record: bool,
    duration_secs: Option<f64>,
    no_console: bool,
) -> Result<()> {
    let duration = duration_secs
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("invalid --duration-secs")?;
    let config = Arc::new(config);
    info!("starting rgb-point-logger");
    info!(
        "capture {} from {:?}, {} points, data root {}",
        console::preview_label(
            config.capture.width,
            config.capture.height,
            config.capture.preview_max_width
        ),
        config.capture.source,
        config.points.len(),
        config.logging.data_root.display()
    );

    let source = appliance::open_source(&config)?;
    let (appliance, status_rx) = Appliance::new(
        config.clone(),
        Arc::new(SystemClock),
        source,
        Box::new(SysinfoProbe),
    );

    let (tx, rx) = mpsc::channel(16);
    if record {
        tx.send(Command::Start).await?;
    }
    let stdin_handle = if no_console {
        None
    } else {
        println!("{}", console::HELP);
        Some(console::spawn_stdin_reader(tx.clone()))
    };
    drop(tx);
    let status_handle = console::spawn_status_logger(status_rx, Duration::from_secs(1));

    let shutdown = async move {
        match duration {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(duration) => info!("run duration elapsed"),
                }
            }
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("cannot listen for ctrl-c: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    let result = appliance.run(rx, shutdown).await;

    status_handle.abort();
    if let Some(h) = stdin_handle {
        h.abort();
    }
    match &result {
        Ok(()) => info!("stopped cleanly"),
        Err(e) => tracing::error!("stopped: {:#}", e),
    }
    result
}

async fn export(
    config: AppConfig,
    dest: Option<PathBuf>,
    include_unclosed: bool,
    ids: Vec<String>,
) -> Result<()> {
    let data_root = &config.logging.data_root;
    let sessions: Vec<PathBuf> = if ids.is_empty() {
        let mut out = Vec::new();
        for dir in storage::list_sessions(data_root)? {
            let closed = storage::read_metadata(&dir)
                .map(|m| m.end_time.is_some())
                .unwrap_or(false);
            if closed || include_unclosed {
                out.push(dir);
            } else {
                tracing::warn!(
                    "skipping {}: session was never closed (may still be recording)",
                    dir.display()
                );
            }
        }
        out
    } else {
        exporter::resolve_sessions(data_root, &ids, !include_unclosed)?
    };

    let mut export_cfg = config.export.clone();
    if let Some(dest) = dest {
        export_cfg.removable_root = dest;
    }
    let job = ExportJob::to_removable(sessions, &export_cfg, chrono::Local::now().date_naive());
    let worker = ExportWorker::new();
    match worker.submit(job, None).await?.wait().await? {
        ExportOutcome::Done { count, destination } => {
            println!("exported {} sessions to {}", count, destination.display());
            Ok(())
        }
        ExportOutcome::Failed { message, copied } => {
            bail!("export failed after {} sessions: {}", copied, message)
        }
    }
}

fn list(config: &AppConfig) -> Result<()> {
    let sessions = storage::list_sessions(&config.logging.data_root)?;
    if sessions.is_empty() {
        println!("no sessions under {}", config.logging.data_root.display());
    }
    for dir in sessions {
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match storage::read_metadata(&dir) {
            Ok(meta) => println!(
                "{}  rows={} images={} {}",
                id,
                meta.rows_written,
                meta.images_written,
                meta.end_time.as_deref().map(|_| "closed").unwrap_or("open")
            ),
            Err(_) => println!("{}  (no metadata)", id),
        }
    }
    Ok(())
}

fn inspect(config: &AppConfig, session: &str) -> Result<()> {
    if !storage::is_valid_session_id(session) {
        bail!("{:?} is not a session id", session);
    }
    let dir = config.logging.data_root.join(session);
    let record_file = dir.join(storage::record_file_name(session));
    let summary = record::summarize(&record_file)
        .with_context(|| format!("reading {}", record_file.display()))?;

    println!("session      {}", session);
    if let Ok(meta) = storage::read_metadata(&dir) {
        println!("started      {}", meta.start_time);
        println!("ended        {}", meta.end_time.as_deref().unwrap_or("-"));
        let ids: Vec<&str> = meta.settings.points.iter().map(|p| p.id.as_str()).collect();
        println!("points       {}", ids.join(", "));
    }
    println!("rows         {}", summary.rows);
    println!("ticks        {}", summary.ticks);
    println!("out of frame {}", summary.out_of_bounds);
    println!("images       {}", summary.images);
    if let (Some(first), Some(last)) = (&summary.first, &summary.last) {
        println!("span         {} .. {}", first, last);
    }
    if summary.truncated {
        println!("note         last line was incomplete and ignored");
    }
    println!("sha256       {}", storage::file_checksum(&record_file)?);
    Ok(())
}

fn disk(config: &AppConfig) -> Result<()> {
    let mut monitor = DiskMonitor::new(
        config.disk_path(),
        config.disk.update_interval(),
        config.disk.low_space_warn_bytes,
        Box::new(SysinfoProbe),
        Arc::new(SystemClock),
    );
    let status = monitor.check(true);
    println!("{} ({})", status, config.disk_path().display());
    if matches!(status, diagnostics::DiskStatus::Error { .. }) {
        bail!("disk check failed");
    }
    Ok(())
}
