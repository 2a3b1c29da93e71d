use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Time source shared by the session store and the cookie codec.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Clock that only moves when told to. Used to simulate elapsed time.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self { Self { now: Mutex::new(start) } }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) { *self.now.lock() = to; }
}

impl Default for ManualClock {
    fn default() -> Self { Self::new(Utc::now()) }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *self.now.lock() }
}
