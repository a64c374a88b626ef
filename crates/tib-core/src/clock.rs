//! Injected time source. All policy logic reads `Clock::now()` instead of
//! calling `Utc::now()` directly, so decisions are deterministic and
//! testable.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic tests.
#[cfg(any(test, feature = "testkit"))]
#[derive(Debug)]
pub struct FakeClock(parking_lot::Mutex<DateTime<Utc>>);

#[cfg(any(test, feature = "testkit"))]
impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(parking_lot::Mutex::new(start))
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.0.lock() = t;
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut guard = self.0.lock();
        *guard = *guard + d;
    }
}

#[cfg(any(test, feature = "testkit"))]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}
