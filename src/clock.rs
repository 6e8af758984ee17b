//! Wall-clock capability, injected so the BETA governor and analyzer don't read
//! `Instant::now()`/`Utc::now()` directly (spec design note: "inject a clock
//! capability for determinism in tests").

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only advances when told to, for deterministic unit tests of the
/// BETA governor's timeout arithmetic.
pub struct MockClock {
    inner: Mutex<(Instant, DateTime<Utc>)>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((Instant::now(), Utc::now())),
        }
    }

    pub fn advance(&self, dur: std::time::Duration) {
        let mut guard = self.inner.lock().unwrap();
        guard.0 += dur;
        guard.1 += chrono::Duration::from_std(dur).unwrap_or_default();
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap().0
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().1
    }
}

pub type SharedClock = Arc<dyn Clock>;
