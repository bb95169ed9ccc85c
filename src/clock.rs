//! Injectable wall-clock source.
//!
//! Timestamps order replicated writes across peers, so the engine never
//! reads the OS clock directly: every component takes a [`TimeSource`]
//! and tests drive a [`ManualTime`] instead of sleeping.

use std::sync::Mutex;

use time::OffsetDateTime;

pub trait TimeSource: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// System clock, nudged forward so consecutive readings are strictly
/// increasing even when the OS clock stands still or steps backward.
pub struct SystemTime {
    last: Mutex<OffsetDateTime>,
}

impl SystemTime {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(OffsetDateTime::now_utc()),
        }
    }
}

impl Default for SystemTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTime {
    fn now(&self) -> OffsetDateTime {
        let mut last = self.last.lock().expect("clock lock poisoned");
        let mut now = OffsetDateTime::now_utc();
        if now <= *last {
            now = *last + time::Duration::nanoseconds(1);
        }
        *last = now;
        now
    }
}

/// Test clock: time moves only when `advance` is called.
pub struct ManualTime {
    now: Mutex<OffsetDateTime>,
}

impl ManualTime {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now = to;
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().expect("clock lock poisoned")
    }
}
