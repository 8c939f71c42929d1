use chrono::{DateTime, Local, Utc};

/// Source of wall-clock time.
///
/// The engine reads the clock directly; rollback is not detected.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Current time in the device's local timezone
    fn now_local(&self) -> DateTime<Local> {
        self.now().with_timezone(&Local)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
