//! Injectable wall clock so bucket boundaries and idle timeouts can be
//! crossed deterministically in tests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::time_utils::unix_ms_from_datetime;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    fn now_unix_ms(&self) -> u64 {
        unix_ms_from_datetime(self.now())
    }
}

/// Reads the operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, value: DateTime<Utc>) {
        *lock_clock(&self.now) = value;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = lock_clock(&self.now);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock_clock(&self.now)
    }
}

fn lock_clock(mutex: &Mutex<DateTime<Utc>>) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Clock, ManualClock};

    #[test]
    fn unit_manual_clock_clones_share_the_same_instant() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("start");
        let clock = ManualClock::new(start);
        let observer = clock.clone();
        clock.advance(Duration::minutes(61));
        assert_eq!(
            observer.now(),
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 0).single().expect("after")
        );
        assert_eq!(observer.now_unix_ms(), 1_772_359_260_000);
    }
}
