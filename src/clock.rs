use chrono::{DateTime, Utc};

/// Wall-clock source for scheduling decisions.
///
/// Production code uses [`SystemClock`]; tests substitute a virtual clock so
/// alignment and cadence can be exercised without real waiting.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
