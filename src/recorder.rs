//! Sampling scheduler.
//!
//! Two independent timers are evaluated on every tick: one for value samples
//! (cheap point lookups) and one for full-frame snapshots (expensive encode).
//! Deciding what is due is a pure function of the timers and `now`; executing
//! the decision is the only part that touches storage.

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::StorageError;
use crate::frame::Frame;
use crate::record::SampleRow;
use crate::sampler;
use crate::storage::{SessionInfo, SessionSettings, SessionStore, IMAGE_DIR};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a tick should do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub capture_image: bool,
    pub record: bool,
}

impl TickPlan {
    pub fn is_idle(&self) -> bool {
        !self.capture_image && !self.record
    }
}

/// Due times for both cadences, on the monotonic clock. `None` means the
/// next due time lies beyond what `Instant` can represent.
#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub next_record_due: Option<Instant>,
    pub next_image_due: Option<Instant>,
    pub record_interval: Duration,
    pub image_interval: Duration,
    pub save_image: bool,
}

impl Timers {
    /// Both timers due immediately.
    pub fn starting_at(
        now: Instant,
        record_interval: Duration,
        image_interval: Duration,
        save_image: bool,
    ) -> Self {
        Timers {
            next_record_due: Some(now),
            next_image_due: Some(now),
            record_interval,
            image_interval,
            save_image,
        }
    }

    pub fn plan(&self, now: Instant) -> TickPlan {
        let due = |at: Option<Instant>| at.is_some_and(|at| now >= at);
        TickPlan {
            capture_image: self.save_image && due(self.next_image_due),
            record: due(self.next_record_due),
        }
    }

    /// Reschedules whatever the plan performed. Next due times count from
    /// `now`, so a slow tick loop lowers the rate instead of bursting.
    pub fn advance(&mut self, plan: TickPlan, now: Instant) {
        if plan.capture_image {
            self.next_image_due = now.checked_add(self.image_interval);
        }
        if plan.record {
            self.next_record_due = now.checked_add(self.record_interval);
        }
    }
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(SessionInfo),
    AlreadyRunning(SessionInfo),
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub plan: TickPlan,
    pub rows_written: usize,
    /// Session-relative path of an image captured on this tick.
    pub image_path: Option<String>,
}

/// Counters over the scheduler's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecorderStats {
    pub sessions: u64,
    pub record_ticks: u64,
    pub rows: u64,
    pub images: u64,
    pub write_failures: u64,
    pub image_failures: u64,
}

/// Points and encoding settings are read from the store, which froze them
/// when the session was opened.
struct ActiveSession {
    store: SessionStore,
    timers: Timers,
    current_image_path: String,
    last_stamp: Option<DateTime<Local>>,
}

pub struct SamplingScheduler {
    config: Arc<AppConfig>,
    clock: Arc<dyn Clock>,
    session: Option<ActiveSession>,
    stats: RecorderStats,
}

impl SamplingScheduler {
    pub fn new(config: Arc<AppConfig>, clock: Arc<dyn Clock>) -> Self {
        SamplingScheduler {
            config,
            clock,
            session: None,
            stats: RecorderStats::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref().map(|s| s.store.info())
    }

    pub fn session_dir(&self) -> Option<&Path> {
        self.session().map(|s| s.dir.as_path())
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    pub fn data_root(&self) -> PathBuf {
        self.config.logging.data_root.clone()
    }

    /// Opens a brand-new session and arms both timers for the next tick.
    /// A second call while running is a no-op.
    pub fn start(&mut self) -> Result<StartOutcome, StorageError> {
        if let Some(active) = &self.session {
            tracing::debug!("start ignored, session {} already open", active.store.info().id);
            return Ok(StartOutcome::AlreadyRunning(active.store.info().clone()));
        }

        let logging = &self.config.logging;
        let settings = SessionSettings {
            record_interval_secs: logging.record_interval_secs,
            image_interval_secs: logging.image_interval_secs,
            save_image: logging.save_image,
            image_format: logging.image_format,
            jpeg_quality: logging.jpeg_quality,
            points: self.config.points.clone(),
        };
        let store = SessionStore::open(&logging.data_root, self.clock.wall(), settings)?;
        let info = store.info().clone();

        self.session = Some(ActiveSession {
            store,
            timers: Timers::starting_at(
                self.clock.monotonic(),
                logging.record_interval(),
                logging.image_interval(),
                logging.save_image,
            ),
            current_image_path: String::new(),
            last_stamp: None,
        });
        self.stats.sessions += 1;
        tracing::info!("recording started: session {}", info.id);
        Ok(StartOutcome::Started(info))
    }

    /// Stops recording and closes the record file. Recording is stopped even
    /// when closing fails; the error is returned for the caller to report.
    pub fn stop(&mut self) -> Result<Option<SessionInfo>, StorageError> {
        let Some(mut active) = self.session.take() else {
            return Ok(None);
        };
        let info = active.store.info().clone();
        active.store.close(self.clock.wall())?;
        tracing::info!("recording stopped: session {}", info.id);
        Ok(Some(info))
    }

    /// What the next tick would do at `now`. Idle when not running.
    pub fn plan(&self, now: Instant) -> TickPlan {
        self.session
            .as_ref()
            .map(|s| s.timers.plan(now))
            .unwrap_or_default()
    }

    /// Evaluates both timers against the clock and performs whatever is due.
    ///
    /// An image failure does not prevent the record step of the same tick;
    /// the first storage error of the tick is returned after both ran. Timers
    /// advance either way, so a failing disk is retried on the next due time.
    pub fn on_tick(&mut self, frame: &Frame) -> Result<TickReport, StorageError> {
        let Some(active) = self.session.as_mut() else {
            return Ok(TickReport::default());
        };
        let now = self.clock.monotonic();
        let plan = active.timers.plan(now);
        let mut report = TickReport {
            plan,
            ..Default::default()
        };
        if plan.is_idle() {
            return Ok(report);
        }
        active.timers.advance(plan, now);

        // Rows never go backwards in time, even if the wall clock does.
        let mut stamp = self.clock.wall();
        if let Some(last) = active.last_stamp {
            if stamp < last {
                let behind = (last - stamp).num_milliseconds();
                tracing::warn!("wall clock stepped back by {} ms", behind);
                stamp = last;
            }
        }
        active.last_stamp = Some(stamp);
        let unix_ms = stamp.timestamp_millis();

        let mut first_err = None;

        if plan.capture_image {
            let settings = active.store.settings();
            let (format, quality) = (settings.image_format, settings.jpeg_quality);
            match active.store.save_image(frame, &unix_ms.to_string(), format, quality) {
                Ok(path) => {
                    active.current_image_path = session_relative(&path);
                    report.image_path = Some(active.current_image_path.clone());
                    self.stats.images += 1;
                }
                Err(e) => {
                    tracing::warn!("image capture failed: {}", e);
                    self.stats.image_failures += 1;
                    first_err = Some(e);
                }
            }
        }

        if plan.record {
            let timestamp_iso = stamp.format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
            let readings = sampler::sample(frame, &active.store.settings().points);
            let written = readings.iter().try_for_each(|reading| {
                active.store.append_row(&SampleRow {
                    timestamp_iso: timestamp_iso.clone(),
                    unix_ms,
                    image_path: active.current_image_path.clone(),
                    point_id: reading.point.id.clone(),
                    x: reading.point.x,
                    y: reading.point.y,
                    rgb: reading.rgb,
                })
            });
            match written.and_then(|()| active.store.flush()) {
                Ok(()) => {
                    report.rows_written = readings.len();
                    self.stats.record_ticks += 1;
                    self.stats.rows += readings.len() as u64;
                }
                Err(e) => {
                    tracing::error!("record write failed: {}", e);
                    self.stats.write_failures += 1;
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

fn session_relative(image: &Path) -> String {
    match image.file_name() {
        Some(name) => format!("{}/{}", IMAGE_DIR, name.to_string_lossy()),
        None => image.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::frame::PixelFormat;
    use crate::record::read_records;
    use crate::sampler::Rgb;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn config(root: &Path, record_secs: f64, image_secs: f64, save_image: bool) -> Arc<AppConfig> {
        let toml = format!(
            r#"
            [capture]
            width = 100
            height = 100

            [logging]
            data_root = {:?}
            record_interval_secs = {:?}
            image_interval_secs = {:?}
            save_image = {}
            image_format = "png"

            [[points]]
            id = "p1"
            x = 10
            y = 10

            [[points]]
            id = "oob"
            x = 9999
            y = 9999
            "#,
            root.display().to_string(),
            record_secs,
            image_secs,
            save_image
        );
        Arc::new(AppConfig::from_toml(&toml).unwrap())
    }

    fn clock() -> ManualClock {
        ManualClock::new(Local.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap())
    }

    fn scheduler(
        root: &Path,
        record_secs: f64,
        image_secs: f64,
        save_image: bool,
        clock: &ManualClock,
    ) -> SamplingScheduler {
        let cfg = config(root, record_secs, image_secs, save_image);
        SamplingScheduler::new(cfg, Arc::new(clock.clone()))
    }

    fn scenario_frame() -> Frame {
        let mut frame = Frame::filled(100, 100, PixelFormat::Bgr, [0, 0, 0]);
        frame.set_native_pixel(10, 10, [10, 50, 200]);
        frame
    }

    fn record_file(s: &SamplingScheduler) -> PathBuf {
        s.session().unwrap().record_file.clone()
    }

    #[test]
    fn test_idle_when_not_running() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, true, &clock);
        let report = s.on_tick(&scenario_frame()).unwrap();
        assert!(report.plan.is_idle());
        assert_eq!(std::fs::read_dir(tmpdir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_first_tick_records_and_captures() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, true, &clock);
        s.start().unwrap();

        let report = s.on_tick(&scenario_frame()).unwrap();
        assert_eq!(report.plan, TickPlan { capture_image: true, record: true });
        assert_eq!(report.rows_written, 2);
        let image = report.image_path.unwrap();
        assert!(image.starts_with("images/") && image.ends_with(".png"));
        assert!(s.session_dir().unwrap().join(&image).is_file());
    }

    #[test]
    fn test_concrete_scenario_rows() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, false, &clock);
        s.start().unwrap();
        s.on_tick(&scenario_frame()).unwrap();

        let (rows, _) = read_records(&record_file(&s)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            (rows[0].point_id.as_str(), rows[0].x, rows[0].y),
            ("p1", 10, 10)
        );
        assert_eq!(rows[0].rgb, Some(Rgb { r: 200, g: 50, b: 10 }));
        assert_eq!(
            (rows[1].point_id.as_str(), rows[1].x, rows[1].y),
            ("oob", 9999, 9999)
        );
        assert_eq!(rows[1].rgb, None);
        assert_eq!(rows[0].image_path, "");

        let text = std::fs::read_to_string(record_file(&s)).unwrap();
        let last = text.lines().last().unwrap();
        assert!(last.ends_with(",,,"), "{}", last);
        assert!(last.starts_with("2026-10-19T09:00:00.000,"));
    }

    #[test]
    fn test_rows_of_one_tick_share_stamp_and_image() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 3.0, true, &clock);
        s.start().unwrap();
        for _ in 0..7 {
            s.on_tick(&scenario_frame()).unwrap();
            clock.advance(Duration::from_millis(1000));
        }

        let (rows, _) = read_records(&record_file(&s)).unwrap();
        assert_eq!(rows.len(), 14);
        for pair in rows.chunks(2) {
            assert_eq!(pair[0].timestamp_iso, pair[1].timestamp_iso);
            assert_eq!(pair[0].unix_ms, pair[1].unix_ms);
            assert_eq!(pair[0].image_path, pair[1].image_path);
            assert_eq!(
                (pair[0].point_id.as_str(), pair[1].point_id.as_str()),
                ("p1", "oob")
            );
        }
        // images at t=0,3,6; ticks in between reuse the latest path
        assert_eq!(rows[2].image_path, rows[0].image_path);
        assert_ne!(rows[6].image_path, rows[4].image_path);
        assert!(rows.windows(2).all(|w| w[0].unix_ms <= w[1].unix_ms));
    }

    #[test]
    fn test_start_is_idempotent() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, true, &clock);
        let first = s.start().unwrap();
        clock.advance(Duration::from_secs(2));
        let second = s.start().unwrap();

        let (StartOutcome::Started(a), StartOutcome::AlreadyRunning(b)) = (first, second) else {
            panic!("unexpected start outcomes");
        };
        assert_eq!(a.id, b.id);
        assert_eq!(std::fs::read_dir(tmpdir.path()).unwrap().count(), 1);
        assert_eq!(s.stats().sessions, 1);
    }

    #[test]
    fn test_restart_creates_new_session() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, false, &clock);
        s.start().unwrap();
        s.on_tick(&scenario_frame()).unwrap();
        let first = s.stop().unwrap().unwrap();
        assert!(!s.is_running());
        assert!(s.stop().unwrap().is_none());

        s.start().unwrap();
        let second = s.session().unwrap().clone();
        assert_ne!(first.id, second.id);
        assert_eq!(second.id, format!("{}_2", first.id));
        let (rows, _) = read_records(&second.record_file).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_rates_are_independent() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, true, &clock);
        s.start().unwrap();

        let frame = scenario_frame();
        let tick = Duration::from_millis(40);
        let total = Duration::from_secs(60);
        let mut elapsed = Duration::ZERO;
        let (mut records, mut images) = (0i64, 0i64);
        while elapsed < total {
            let report = s.on_tick(&frame).unwrap();
            records += report.plan.record as i64;
            images += report.image_path.is_some() as i64;
            clock.advance(tick);
            elapsed += tick;
        }
        assert!((records - 60).abs() <= 1, "records = {}", records);
        assert!((images - 12).abs() <= 1, "images = {}", images);

        let image_dir = &s.session().unwrap().image_dir;
        let image_files = std::fs::read_dir(image_dir).unwrap().count() as i64;
        assert_eq!(image_files, images);
    }

    #[test]
    fn test_slow_ticks_do_not_backfill() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 2.0, true, &clock);
        s.start().unwrap();
        s.on_tick(&scenario_frame()).unwrap();

        clock.advance(Duration::from_secs(10));
        let report = s.on_tick(&scenario_frame()).unwrap();
        assert_eq!(report.plan, TickPlan { capture_image: true, record: true });

        clock.advance(Duration::from_millis(500));
        assert!(s.plan(clock.monotonic()).is_idle());
        let report = s.on_tick(&scenario_frame()).unwrap();
        assert!(report.plan.is_idle());

        clock.advance(Duration::from_millis(500));
        assert_eq!(s.plan(clock.monotonic()), TickPlan { capture_image: false, record: true });
    }

    #[test]
    fn test_timers_plan_is_pure() {
        let t0 = Instant::now();
        let mut timers =
            Timers::starting_at(t0, Duration::from_secs(1), Duration::from_secs(4), true);
        let plan = timers.plan(t0);
        assert_eq!(plan, timers.plan(t0));
        timers.advance(plan, t0);
        assert!(timers.plan(t0 + Duration::from_millis(999)).is_idle());
        assert_eq!(
            timers.plan(t0 + Duration::from_secs(4)),
            TickPlan { capture_image: true, record: true }
        );

        let no_images =
            Timers::starting_at(t0, Duration::from_secs(1), Duration::from_secs(1), false);
        assert!(!no_images.plan(t0).capture_image);
    }

    #[test]
    fn test_wall_clock_step_back_is_clamped() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, false, &clock);
        s.start().unwrap();
        clock.advance(Duration::from_secs(5));
        s.on_tick(&scenario_frame()).unwrap();
        clock.advance(Duration::from_secs(1));
        clock.set_wall(Local.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap());
        s.on_tick(&scenario_frame()).unwrap();

        let (rows, _) = read_records(&record_file(&s)).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2].unix_ms, rows[0].unix_ms);
    }

    #[test]
    fn test_start_fails_on_unwritable_root() {
        let tmpdir = TempDir::new().unwrap();
        let blocker = tmpdir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut s = scheduler(&blocker, 1.0, 5.0, false, &clock());
        assert!(matches!(s.start(), Err(StorageError::CreateSession { .. })));
        assert!(!s.is_running());
    }

    #[test]
    fn test_stop_closes_record_file() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, false, &clock);
        s.start().unwrap();
        s.on_tick(&scenario_frame()).unwrap();
        let info = s.stop().unwrap().unwrap();

        let meta = crate::storage::read_metadata(&info.dir).unwrap();
        assert_eq!(meta.rows_written, 2);
        assert!(meta.end_time.is_some());
        assert_eq!(s.stats().rows, 2);
        assert_eq!(s.stats().record_ticks, 1);
    }

    #[test]
    fn test_step_back_keeps_earlier_image() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 1.0, true, &clock);
        s.start().unwrap();
        let a = s.on_tick(&scenario_frame()).unwrap().image_path.unwrap();
        clock.advance(Duration::from_secs(1));
        clock.set_wall(Local.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap());
        let b = s.on_tick(&scenario_frame()).unwrap().image_path.unwrap();

        assert_ne!(a, b);
        let dir = s.session_dir().unwrap().to_path_buf();
        assert!(dir.join(&a).is_file());
        assert!(dir.join(&b).is_file());
        let image_dir = &s.session().unwrap().image_dir;
        assert_eq!(std::fs::read_dir(image_dir).unwrap().count(), 2);
        assert_eq!(s.stats().images, 2);

        let (rows, _) = read_records(&record_file(&s)).unwrap();
        assert_eq!(rows[0].image_path, a);
        assert_eq!(rows[2].image_path, b);
    }

    #[test]
    fn test_write_failure_keeps_session_open() {
        let tmpdir = TempDir::new().unwrap();
        let clock = clock();
        let mut s = scheduler(tmpdir.path(), 1.0, 5.0, false, &clock);
        s.start().unwrap();
        s.on_tick(&scenario_frame()).unwrap();

        let writer = s.session.as_mut().unwrap().store.detach_writer().unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(matches!(s.on_tick(&scenario_frame()), Err(StorageError::Closed)));
        assert!(s.is_running());
        assert_eq!(s.stats().write_failures, 1);

        // the failed tick still consumed its due time
        clock.advance(Duration::from_millis(500));
        assert!(s.plan(clock.monotonic()).is_idle());

        s.session.as_mut().unwrap().store.attach_writer(writer);
        clock.advance(Duration::from_millis(500));
        let report = s.on_tick(&scenario_frame()).unwrap();
        assert_eq!(report.rows_written, 2);

        let (rows, _) = read_records(&record_file(&s)).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(s.stats().rows, 4);
        let info = s.stop().unwrap().unwrap();
        assert_eq!(crate::storage::read_metadata(&info.dir).unwrap().rows_written, 4);
    }

    #[test]
    fn test_unrepresentable_due_time_disables_timer() {
        let t0 = Instant::now();
        let mut timers = Timers::starting_at(t0, Duration::MAX, Duration::from_secs(1), true);
        let plan = timers.plan(t0);
        assert!(plan.record);
        timers.advance(plan, t0);
        assert!(timers.next_record_due.is_none());
        assert!(!timers.plan(t0 + Duration::from_secs(3600)).record);
        assert!(timers.plan(t0 + Duration::from_secs(1)).capture_image);
    }
}
