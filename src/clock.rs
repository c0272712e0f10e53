use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::types::TimeStamp;

/// Source of transition and ledger timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::new()
    }
}

/// A clock that only moves when told to. Used to replay billing periods deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(start: TimeStamp<Utc>) -> Self {
        Self {
            now: Mutex::new(start.to_datetime_utc()),
        }
    }
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
    pub fn set(&self, to: TimeStamp<Utc>) {
        *self.now.lock() = to.to_datetime_utc();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::from(*self.now.lock())
    }
}
