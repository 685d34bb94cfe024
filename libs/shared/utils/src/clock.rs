use chrono::{DateTime, Utc};

/// Injectable time source. Deadline math and the expiry sweepers read time
/// through this trait so tests can drive them without wall-clock waiting.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
