use crate::clock::Clock;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::Disks;

const HISTORY_LEN: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

/// Advisory storage status. Never used to gate writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DiskStatus {
    Unknown,
    Ok {
        free_bytes: u64,
        total_bytes: u64,
        low_space: bool,
    },
    Error {
        message: String,
    },
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskStatus::Unknown => write!(f, "disk: -"),
            DiskStatus::Ok {
                free_bytes,
                total_bytes,
                low_space,
            } => {
                let (free, total) = (format_bytes(*free_bytes), format_bytes(*total_bytes));
                write!(f, "disk: {} free / {}", free, total)?;
                if *low_space {
                    write!(f, " (LOW)")?;
                }
                Ok(())
            }
            DiskStatus::Error { message } => write!(f, "disk: unavailable ({})", message),
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Reads free/total space for the filesystem holding a path.
pub trait SpaceProbe: Send {
    fn probe(&self, path: &Path) -> Result<DiskSpace, String>;
}

/// Picks the mounted disk with the longest mount point containing the path.
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl SpaceProbe for SysinfoProbe {
    fn probe(&self, path: &Path) -> Result<DiskSpace, String> {
        let target = path.canonicalize().map_err(|e| format!("{}: {}", path.display(), e))?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| DiskSpace { free_bytes: d.available_space(), total_bytes: d.total_space() })
            .ok_or_else(|| format!("no mounted filesystem holds {}", target.display()))
    }
}

/// Throttled free-space monitor for the storage target.
pub struct DiskMonitor {
    path: PathBuf,
    interval: Duration,
    low_space_bytes: u64,
    probe: Box<dyn SpaceProbe>,
    clock: Arc<dyn Clock>,
    last_check: Option<Instant>,
    status: DiskStatus,
    history: VecDeque<(Instant, u64)>,
}

impl DiskMonitor {
    pub fn new(
        path: PathBuf,
        interval: Duration,
        low_space_bytes: u64,
        probe: Box<dyn SpaceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        DiskMonitor {
            path,
            interval,
            low_space_bytes,
            probe,
            clock,
            last_check: None,
            status: DiskStatus::Unknown,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Returns the cached status unless `force` is set or the update interval
    /// has elapsed since the last probe. Probe failures become `Error`.
    pub fn check(&mut self, force: bool) -> DiskStatus {
        let now = self.clock.monotonic();
        let due = match self.last_check {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if !(force || due) {
            return self.status.clone();
        }
        self.last_check = Some(now);

        let next = match self.probe.probe(&self.path) {
            Ok(space) => {
                self.history.push_back((now, space.free_bytes));
                if self.history.len() > HISTORY_LEN {
                    self.history.pop_front();
                }
                DiskStatus::Ok {
                    free_bytes: space.free_bytes,
                    total_bytes: space.total_bytes,
                    low_space: space.free_bytes < self.low_space_bytes,
                }
            }
            Err(message) => DiskStatus::Error { message },
        };
        self.log_transition(&next);
        self.status = next;
        self.status.clone()
    }

    pub fn status(&self) -> &DiskStatus {
        &self.status
    }

    /// Free-space consumption in bytes per second over the retained history.
    pub fn consumption_rate(&self) -> Option<f64> {
        let (t0, free0) = *self.history.front()?;
        let (t1, free1) = *self.history.back()?;
        let secs = t1.duration_since(t0).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some((free0 as f64 - free1 as f64) / secs)
    }

    fn log_transition(&self, next: &DiskStatus) {
        let was_low = matches!(self.status, DiskStatus::Ok { low_space: true, .. });
        let was_error = matches!(self.status, DiskStatus::Error { .. });
        match next {
            DiskStatus::Ok { low_space: true, free_bytes, .. } if !was_low => {
                tracing::warn!(
                    "storage {} is low: {} free",
                    self.path.display(),
                    format_bytes(*free_bytes)
                );
            }
            DiskStatus::Ok { low_space: false, .. } if was_low || was_error => {
                tracing::info!("storage {} ok", self.path.display());
            }
            DiskStatus::Error { message } if !was_error => {
                tracing::warn!("disk check failed: {}", message);
            }
            _ => {}
        }
    }
}
