use std::{sync::{Arc, Mutex}, time::{Duration, Instant}};

/// Provides the current time to a looper. Useful for testing.
pub trait Now {
    fn now(&self) -> Instant;
}

/// A time source that only moves when it is advanced.
///
/// Clones share a single instant, so a test can keep one clone and hand
/// another to the looper under test.
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<Mutex<Instant>>);

// ===== impl ManualClock =====

impl Default for ManualClock {
    fn default() -> ManualClock {
        ManualClock(Arc::new(Mutex::new(Instant::now())))
    }
}

impl ManualClock {
    pub fn advance(&self, d: Duration) {
        *self.0.lock().expect("clock lock") += d;
    }
}

impl Now for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock().expect("clock lock")
    }
}

// ===== impl Now =====

/// Default source of time.
impl Now for () {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
