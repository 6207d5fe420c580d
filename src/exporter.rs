//! Background copy of finished sessions to removable storage.
//!
//! At most one job runs at a time; a request while one is running is turned
//! away, not queued. Progress flows one way over a channel so the sampling
//! loop never waits on the copy.

use crate::config::ExportConfig;
use crate::error::ExportError;
use crate::storage::{file_checksum, is_valid_session_id, read_metadata, record_file_name};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub const MANIFEST_FILE: &str = "export_manifest.json";

#[derive(Debug, Clone)]
pub struct ExportJob {
    pub source_sessions: Vec<PathBuf>,
    pub destination_root: PathBuf,
}

impl ExportJob {
    /// Targets `<removable_root>/<namespace>/<YYYY-MM-DD>/`.
    pub fn to_removable(
        source_sessions: Vec<PathBuf>,
        cfg: &ExportConfig,
        date: NaiveDate,
    ) -> Self {
        ExportJob {
            source_sessions,
            destination_root: cfg
                .removable_root
                .join(&cfg.namespace)
                .join(date.format("%Y-%m-%d").to_string()),
        }
    }
}

/// Maps session ids to their directories under `data_root`. Each id must name
/// a single directory entry. With `require_closed`, a session whose metadata
/// carries no end time is refused since it may still be written to.
pub fn resolve_sessions(
    data_root: &Path,
    ids: &[String],
    require_closed: bool,
) -> Result<Vec<PathBuf>, ExportError> {
    ids.iter()
        .map(|id| {
            if !is_valid_session_id(id) {
                return Err(ExportError::InvalidSessionId(id.clone()));
            }
            let dir = data_root.join(id);
            if !dir.is_dir() {
                return Err(ExportError::MissingSource(dir));
            }
            if require_closed {
                let closed = read_metadata(&dir)
                    .map(|m| m.end_time.is_some())
                    .unwrap_or(false);
                if !closed {
                    return Err(ExportError::Unclosed(id.clone()));
                }
            }
            Ok(dir)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportState {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExportOutcome {
    Done { count: usize, destination: PathBuf },
    Failed { message: String, copied: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExportEvent {
    SessionStarted { index: usize, total: usize, session: String },
    Finished(ExportOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportStatus {
    pub state: ExportState,
    pub message: String,
    pub sessions_done: usize,
    pub sessions_total: usize,
}

/// Written into every exported session directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub export_id: String,
    pub timestamp_utc: u128,
    pub num_files: usize,
    pub total_bytes: u64,
    pub record_sha256: Option<String>,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub bytes: u64,
}

/// Receives the progress of one submitted job.
pub struct ExportHandle {
    pub events: mpsc::UnboundedReceiver<ExportEvent>,
}

impl ExportHandle {
    /// Drains progress until the terminal outcome.
    pub async fn wait(mut self) -> Result<ExportOutcome, ExportError> {
        while let Some(ev) = self.events.recv().await {
            if let ExportEvent::Finished(outcome) = ev {
                return Ok(outcome);
            }
        }
        Err(ExportError::Aborted("export task dropped its channel".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownWait {
    Idle,
    Finished,
    TimedOut,
}

#[derive(Clone)]
pub struct ExportWorker {
    status: Arc<Mutex<ExportStatus>>,
    task: Arc<Mutex<Option<JoinHandle<ExportOutcome>>>>,
}

impl Default for ExportWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportWorker {
    pub fn new() -> Self {
        ExportWorker {
            status: Arc::new(Mutex::new(ExportStatus {
                state: ExportState::Pending,
                message: String::new(),
                sessions_done: 0,
                sessions_total: 0,
            })),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn get_status(&self) -> ExportStatus {
        self.status.lock().await.clone()
    }

    /// Starts a job in the background. Rejected with `Busy` while another job
    /// runs, and with `SessionOpen` if it names the session being recorded.
    pub async fn submit(
        &self,
        job: ExportJob,
        open_session: Option<&Path>,
    ) -> Result<ExportHandle, ExportError> {
        let mut status = self.status.lock().await;
        if status.state == ExportState::Running {
            tracing::warn!("export rejected: another export is running");
            return Err(ExportError::Busy);
        }
        if job.source_sessions.is_empty() {
            return Err(ExportError::Empty);
        }
        for src in &job.source_sessions {
            if open_session.is_some_and(|open| open == src.as_path()) {
                return Err(ExportError::SessionOpen(session_name(src)));
            }
            if !src.is_dir() {
                return Err(ExportError::MissingSource(src.clone()));
            }
        }

        *status = ExportStatus {
            state: ExportState::Running,
            message: format!(
                "exporting {} sessions to {}",
                job.source_sessions.len(),
                job.destination_root.display()
            ),
            sessions_done: 0,
            sessions_total: job.source_sessions.len(),
        };
        tracing::info!("{}", status.message);
        drop(status);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_job(job, tx, self.status.clone()));
        *self.task.lock().await = Some(handle);
        Ok(ExportHandle { events: rx })
    }

    /// Waits up to `grace` for a running job. A job still running afterwards
    /// is abandoned and may leave a partially written destination.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownWait {
        let Some(mut handle) = self.task.lock().await.take() else {
            return ShutdownWait::Idle;
        };
        if handle.is_finished() {
            return ShutdownWait::Idle;
        }
        tracing::info!("waiting up to {:?} for export to finish", grace);
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(outcome)) => {
                tracing::info!("export finished during shutdown: {:?}", outcome);
                ShutdownWait::Finished
            }
            Ok(Err(e)) => {
                tracing::error!("export task failed during shutdown: {}", e);
                ShutdownWait::Finished
            }
            Err(_) => {
                tracing::warn!(
                    "export did not finish within {:?}; destination may be partial",
                    grace
                );
                handle.abort();
                ShutdownWait::TimedOut
            }
        }
    }
}

async fn run_job(
    job: ExportJob,
    tx: mpsc::UnboundedSender<ExportEvent>,
    status: Arc<Mutex<ExportStatus>>,
) -> ExportOutcome {
    let total = job.source_sessions.len();
    let mut copied = 0;
    let mut failure = None;

    for (index, src) in job.source_sessions.iter().enumerate() {
        let name = session_name(src);
        // the receiver may have gone away; the job keeps going regardless
        let _ = tx.send(ExportEvent::SessionStarted {
            index,
            total,
            session: name.clone(),
        });
        status.lock().await.message = format!("copying {} ({}/{})", name, index + 1, total);
        tracing::info!("export: copying {} ({}/{})", name, index + 1, total);

        let src = src.clone();
        let root = job.destination_root.clone();
        let result = tokio::task::spawn_blocking(move || replace_session(&src, &root))
            .await
            .unwrap_or_else(|e| Err(ExportError::Aborted(e.to_string())));

        match result {
            Ok(manifest) => {
                copied += 1;
                status.lock().await.sessions_done = copied;
                tracing::debug!("export: {} done, {} files", name, manifest.num_files);
            }
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }

    let outcome = match failure {
        None => ExportOutcome::Done {
            count: copied,
            destination: job.destination_root.clone(),
        },
        Some(message) => ExportOutcome::Failed { message, copied },
    };
    {
        let mut st = status.lock().await;
        match &outcome {
            ExportOutcome::Done { count, destination } => {
                st.state = ExportState::Done;
                st.message = format!("exported {} sessions to {}", count, destination.display());
                tracing::info!("{}", st.message);
            }
            ExportOutcome::Failed { message, .. } => {
                st.state = ExportState::Failed;
                st.message = format!("export failed: {}", message);
                tracing::error!("{}", st.message);
            }
        }
    }
    let _ = tx.send(ExportEvent::Finished(outcome.clone()));
    outcome
}

fn session_name(src: &Path) -> String {
    src.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| src.display().to_string())
}

/// Copies `src` to `<root>/<name>`, deleting any previous copy first, then
/// writes the export manifest into the copy.
fn replace_session(src: &Path, root: &Path) -> Result<ExportManifest, ExportError> {
    let copy_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ExportError::Copy { path, source }
    };

    let name = session_name(src);
    let dest = root.join(&name);
    fs::create_dir_all(root).map_err(copy_err(root))?;
    if dest.exists() {
        tracing::info!("export: replacing existing {}", dest.display());
        fs::remove_dir_all(&dest).map_err(copy_err(&dest))?;
    }

    let mut files = Vec::new();
    copy_dir_recursive(src, &dest, Path::new(""), &mut files)?;

    let record = dest.join(record_file_name(&name));
    let record_sha256 = if record.is_file() {
        Some(file_checksum(&record).map_err(|e| ExportError::Copy {
            path: record.clone(),
            source: std::io::Error::other(e.to_string()),
        })?)
    } else {
        None
    };

    let manifest = ExportManifest {
        export_id: name,
        timestamp_utc: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default(),
        num_files: files.len(),
        total_bytes: files.iter().map(|f| f.bytes).sum(),
        record_sha256,
        files,
    };
    let manifest_path = dest.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&manifest).map_err(|e| ExportError::Copy {
        path: manifest_path.clone(),
        source: e.into(),
    })?;
    fs::write(&manifest_path, json).map_err(copy_err(&manifest_path))?;
    Ok(manifest)
}

fn copy_dir_recursive(
    src: &Path,
    dest: &Path,
    rel: &Path,
    files: &mut Vec<ManifestEntry>,
) -> Result<(), ExportError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ExportError::Copy { path, source }
    };

    fs::create_dir_all(dest).map_err(io_err(dest))?;
    let mut entries = fs::read_dir(src)
        .map_err(io_err(src))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(src))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let rel = rel.join(entry.file_name());
        if from.is_dir() {
            copy_dir_recursive(&from, &to, &rel, files)?;
        } else {
            let bytes = fs::copy(&from, &to).map_err(io_err(&from))?;
            files.push(ManifestEntry {
                path: rel.to_string_lossy().into_owned(),
                bytes,
            });
        }
    }
    Ok(())
}
