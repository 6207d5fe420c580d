use chrono::{DateTime, Local};
use std::time::Instant;
#[cfg(test)]
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Wall-clock and monotonic time. Due times are always computed on the
/// monotonic side; wall time only stamps rows, images and session ids.
pub trait Clock: Send + Sync {
    fn wall(&self) -> DateTime<Local>;
    fn monotonic(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Both readings advance together.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualInner>>,
}

#[cfg(test)]
#[derive(Debug)]
struct ManualInner {
    wall: DateTime<Local>,
    mono: Instant,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        ManualClock {
            inner: Arc::new(Mutex::new(ManualInner { wall: start, mono: Instant::now() })),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.lock();
        inner.mono += by;
        inner.wall += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    /// Step only the wall clock, e.g. an NTP correction.
    pub fn set_wall(&self, wall: DateTime<Local>) {
        self.lock().wall = wall;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn wall(&self) -> DateTime<Local> {
        self.lock().wall
    }

    fn monotonic(&self) -> Instant {
        self.lock().mono
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_sides() {
        let start = Local::now();
        let clock = ManualClock::new(start);
        let m0 = clock.monotonic();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.monotonic() - m0, Duration::from_millis(1500));
        assert_eq!((clock.wall() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(Local::now());
        let other = clock.clone();
        let m0 = other.monotonic();
        clock.advance(Duration::from_secs(2));
        assert_eq!(other.monotonic() - m0, Duration::from_secs(2));
    }
}
