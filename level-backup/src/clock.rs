//! Wall-clock source for backup timestamps.
//!
//! Cooldowns use the monotonic `tokio::time::Instant`; archive names need a
//! UTC wall-clock reading, which tests replace with a deterministic clock.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex;

    /// Returns `start`, then advances by `step` on every reading.
    pub struct SteppingClock {
        next: Mutex<DateTime<Utc>>,
        step: Duration,
    }

    impl SteppingClock {
        pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
            Self {
                next: Mutex::new(start),
                step,
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut next = self.next.lock().unwrap();
            let current = *next;
            *next = current + self.step;
            current
        }
    }

    /// Wall clock that follows tokio time, so paused tests can jump days ahead.
    pub struct TokioClock {
        base: DateTime<Utc>,
        origin: tokio::time::Instant,
    }

    impl TokioClock {
        pub fn new(base: DateTime<Utc>) -> Self {
            Self {
                base,
                origin: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + Duration::from_std(self.origin.elapsed()).unwrap()
        }
    }
}
