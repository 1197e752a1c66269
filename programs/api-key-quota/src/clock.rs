use chrono::{DateTime, Utc};

#[cfg(any(test, feature = "test-util"))]
pub use manual::ManualClock;

/// Source of "now" for window arithmetic.
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

#[cfg(any(test, feature = "test-util"))]
mod manual {
    use std::sync::atomic::{AtomicI64, Ordering};

    use chrono::{DateTime, Duration, Utc};

    use super::Clock;

    /// A clock that only moves when told to. Microsecond resolution.
    #[derive(Debug)]
    pub struct ManualClock {
        micros: AtomicI64,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                micros: AtomicI64::new(start.timestamp_micros()),
            }
        }

        pub fn set(&self, at: DateTime<Utc>) {
            self.micros.store(at.timestamp_micros(), Ordering::SeqCst);
        }

        pub fn advance(&self, by: Duration) {
            let step = by.num_microseconds().unwrap_or(i64::MAX);
            self.micros.fetch_add(step, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            let micros = self.micros.load(Ordering::SeqCst);
            DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MAX_UTC)
        }
    }
}
