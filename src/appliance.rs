//! The cooperative tick loop.
//!
//! Each tick pulls one frame, refreshes the live readout, lets the scheduler
//! decide what to persist and polls the (self-throttling) disk monitor.
//! Exports run on their own task and only report back through events.

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::diagnostics::{DiskMonitor, DiskStatus, SpaceProbe};
use crate::error::{StorageError, TickError};
use crate::exporter::{
    resolve_sessions, ExportEvent, ExportJob, ExportOutcome, ExportState, ExportStatus,
    ExportWorker, ShutdownWait,
};
use crate::frame::FrameSource;
use crate::recorder::{RecorderStats, SamplingScheduler, StartOutcome};
use crate::sampler::{self, PointReading};
use crate::storage::list_sessions;
use anyhow::{bail, Result};
use serde::Serialize;
use std::future::Future;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Session ids to export; empty means every finished session.
    Export(Vec<String>),
    Status,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplianceState {
    Ready,
    Recording,
    Exporting,
}

/// Snapshot published after every tick and command.
#[derive(Debug, Clone, Serialize)]
pub struct ApplianceStatus {
    pub state: ApplianceState,
    pub recording: bool,
    pub exporting: bool,
    pub session_id: Option<String>,
    pub readout: Vec<PointReading>,
    pub disk: DiskStatus,
    /// Bytes per second drawn from the storage target, once two probes exist.
    pub disk_rate: Option<f64>,
    pub export: Option<ExportStatus>,
    pub stats: RecorderStats,
    pub frames: u64,
    pub frame_errors: u64,
    pub message: String,
}

impl ApplianceStatus {
    fn initial() -> Self {
        ApplianceStatus {
            state: ApplianceState::Ready,
            recording: false,
            exporting: false,
            session_id: None,
            readout: Vec::new(),
            disk: DiskStatus::Unknown,
            disk_rate: None,
            export: None,
            stats: RecorderStats::default(),
            frames: 0,
            frame_errors: 0,
            message: String::new(),
        }
    }
}

pub struct Appliance {
    config: Arc<AppConfig>,
    clock: Arc<dyn Clock>,
    source: Box<dyn FrameSource>,
    scheduler: SamplingScheduler,
    disk: DiskMonitor,
    exporter: ExportWorker,
    export_events: Option<mpsc::UnboundedReceiver<ExportEvent>>,
    export_status: Option<ExportStatus>,
    status_tx: watch::Sender<ApplianceStatus>,
    readout: Vec<PointReading>,
    frames: u64,
    frame_errors: u64,
    consecutive_frame_errors: u32,
    message: String,
}

impl Appliance {
    pub fn new(
        config: Arc<AppConfig>,
        clock: Arc<dyn Clock>,
        source: Box<dyn FrameSource>,
        probe: Box<dyn SpaceProbe>,
    ) -> (Self, watch::Receiver<ApplianceStatus>) {
        let (status_tx, status_rx) = watch::channel(ApplianceStatus::initial());
        let disk = DiskMonitor::new(
            config.disk_path(),
            config.disk.update_interval(),
            config.disk.low_space_warn_bytes,
            probe,
            clock.clone(),
        );
        let appliance = Appliance {
            scheduler: SamplingScheduler::new(config.clone(), clock.clone()),
            config,
            clock,
            source,
            disk,
            exporter: ExportWorker::new(),
            export_events: None,
            export_status: None,
            status_tx,
            readout: Vec::new(),
            frames: 0,
            frame_errors: 0,
            consecutive_frame_errors: 0,
            message: "ready".into(),
        };
        (appliance, status_rx)
    }

    /// One pass of the loop. Acquisition failures abort the tick before any
    /// sampling; storage failures are reported but leave the session open.
    pub fn tick(&mut self) -> Result<(), TickError> {
        let result = self.sample_frame();
        self.disk.check(false);
        self.drain_export_events();
        self.publish();
        result
    }

    fn sample_frame(&mut self) -> Result<(), TickError> {
        let frame = match self.source.capture() {
            Ok(frame) => {
                self.consecutive_frame_errors = 0;
                frame
            }
            Err(e) => {
                self.frame_errors += 1;
                self.consecutive_frame_errors += 1;
                return Err(e.into());
            }
        };
        self.frames += 1;
        self.readout = sampler::sample(&frame, &self.config.points);
        if let Err(e) = self.scheduler.on_tick(&frame) {
            self.message = format!("write failed: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Start => {
                if let Err(e) = self.start_recording() {
                    tracing::error!("start failed: {}", e);
                }
            }
            Command::Stop => match self.scheduler.stop() {
                Ok(Some(info)) => {
                    self.message = format!("stopped, saved to {}", info.dir.display())
                }
                Ok(None) => self.message = "not recording".into(),
                Err(e) => {
                    tracing::error!("stop: closing record file failed: {}", e);
                    self.message = format!("stopped with error: {}", e);
                }
            },
            Command::Export(ids) => self.start_export(ids).await,
            Command::Status => {
                let status = self.status_tx.borrow().clone();
                tracing::info!("{}", crate::console::format_status(&status));
            }
            Command::Quit => return ControlFlow::Break(()),
        }
        self.publish();
        ControlFlow::Continue(())
    }

    fn start_recording(&mut self) -> Result<(), StorageError> {
        match self.scheduler.start() {
            Ok(StartOutcome::Started(info)) => {
                self.message = format!("recording to {}", info.dir.display());
                self.disk.check(true);
                Ok(())
            }
            Ok(StartOutcome::AlreadyRunning(info)) => {
                self.message = format!("already recording session {}", info.id);
                Ok(())
            }
            Err(e) => {
                self.message = format!("cannot start recording: {}", e);
                Err(e)
            }
        }
    }

    async fn start_export(&mut self, ids: Vec<String>) {
        let data_root = self.scheduler.data_root();
        let open = self.scheduler.session_dir().map(|p| p.to_path_buf());
        let sessions: Vec<PathBuf> = if ids.is_empty() {
            match list_sessions(&data_root) {
                Ok(all) => all.into_iter().filter(|p| Some(p) != open.as_ref()).collect(),
                Err(e) => {
                    self.message = format!("export failed: cannot list sessions: {}", e);
                    return;
                }
            }
        } else {
            match resolve_sessions(&data_root, &ids, false) {
                Ok(dirs) => dirs,
                Err(e) => {
                    tracing::warn!("export request rejected: {}", e);
                    self.message = format!("export rejected: {}", e);
                    return;
                }
            }
        };

        let today = self.clock.wall().date_naive();
        let job = ExportJob::to_removable(sessions, &self.config.export, today);
        match self.exporter.submit(job, open.as_deref()).await {
            Ok(handle) => {
                self.export_events = Some(handle.events);
                self.export_status = Some(self.exporter.get_status().await);
                self.message = "export started".into();
            }
            Err(e) => {
                tracing::warn!("export request rejected: {}", e);
                self.message = format!("export rejected: {}", e);
            }
        }
    }

    fn drain_export_events(&mut self) {
        let Some(rx) = self.export_events.as_mut() else {
            return;
        };
        let mut finished = false;
        loop {
            match rx.try_recv() {
                Ok(ExportEvent::SessionStarted { index, total, session }) => {
                    self.message = format!("exporting {} ({}/{})", session, index + 1, total);
                    if let Some(st) = self.export_status.as_mut() {
                        st.sessions_done = index;
                        st.message = self.message.clone();
                    }
                }
                Ok(ExportEvent::Finished(outcome)) => {
                    let (state, message, done) = match &outcome {
                        ExportOutcome::Done { count, destination } => (
                            ExportState::Done,
                            format!("exported {} sessions to {}", count, destination.display()),
                            *count,
                        ),
                        ExportOutcome::Failed { message, copied } => {
                            (ExportState::Failed, format!("export failed: {}", message), *copied)
                        }
                    };
                    if let Some(st) = self.export_status.as_mut() {
                        st.state = state;
                        st.sessions_done = done;
                        st.message = message.clone();
                    }
                    self.message = message;
                    finished = true;
                    break;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    finished = true;
                    break;
                }
            }
        }
        if finished {
            self.export_events = None;
        }
    }

    fn publish(&self) {
        let recording = self.scheduler.is_running();
        let exporting = self.export_events.is_some();
        let state = if recording {
            ApplianceState::Recording
        } else if exporting {
            ApplianceState::Exporting
        } else {
            ApplianceState::Ready
        };
        let status = ApplianceStatus {
            state,
            recording,
            exporting,
            session_id: self.scheduler.session().map(|s| s.id.clone()),
            readout: self.readout.clone(),
            disk: self.disk.status().clone(),
            disk_rate: self.disk.consumption_rate(),
            export: self.export_status.clone(),
            stats: self.scheduler.stats().clone(),
            frames: self.frames,
            frame_errors: self.frame_errors,
            message: self.message.clone(),
        };
        self.status_tx.send_replace(status);
    }

    /// Runs until `Quit`, the shutdown future resolves, or the frame source
    /// fails too many times in a row. Always ends with the shutdown sequence.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;
        self.disk.check(true);
        tracing::info!(
            "tick loop started: {} every {:?}",
            self.source.describe(),
            self.config.tick_interval()
        );

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick() {
                        Ok(()) => {}
                        Err(TickError::Acquisition(e)) => {
                            if self.consecutive_frame_errors == 1 {
                                tracing::warn!("frame acquisition failed: {}", e);
                            }
                            let limit = self.config.max_consecutive_frame_errors;
                            if self.consecutive_frame_errors >= limit {
                                break Err(anyhow::anyhow!(
                                    "frame source failed {} times in a row: {}",
                                    self.consecutive_frame_errors,
                                    e
                                ));
                            }
                        }
                        // already logged by the scheduler; the next due tick retries
                        Err(TickError::Storage(_)) => {}
                    }
                }
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await.is_break() {
                            tracing::info!("quit requested");
                            break Ok(());
                        }
                    }
                    None => commands_open = false,
                },
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Releases resources in order, logging each failure instead of hiding it.
    pub async fn shutdown(&mut self) {
        match self.scheduler.stop() {
            Ok(Some(info)) => tracing::info!("shutdown: session {} closed", info.id),
            Ok(None) => {}
            Err(e) => tracing::error!("shutdown: closing record file failed: {}", e),
        }

        let grace = self.config.export.shutdown_grace();
        match self.exporter.shutdown(grace).await {
            ShutdownWait::TimedOut => {
                tracing::warn!("shutdown: export abandoned after {:?}", grace)
            }
            ShutdownWait::Finished => tracing::info!("shutdown: export completed"),
            ShutdownWait::Idle => {}
        }
        self.drain_export_events();
        self.message = "stopped".into();
        self.publish();
        tracing::info!("shutdown complete");
    }
}

/// Builds the frame source named in the config.
pub fn open_source(config: &AppConfig) -> Result<Box<dyn FrameSource>> {
    use crate::config::SourceKind;
    use crate::frame::{StillImageSource, SyntheticSource};

    let cap = &config.capture;
    Ok(match cap.source {
        SourceKind::Synthetic => {
            Box::new(SyntheticSource::new(cap.width, cap.height, cap.pixel_format))
        }
        SourceKind::Still => {
            let Some(path) = &cap.still_image else {
                bail!("capture.still_image is not set");
            };
            Box::new(StillImageSource::open(path)?)
        }
    })
}
