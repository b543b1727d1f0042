use time::OffsetDateTime;

/// Source of wall-clock time for every interval computation in the hub.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Hand-driven clock for tests. Clones share the same instant, so a test can
/// keep one handle and move time under a manager that owns another.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: std::sync::Arc<std::sync::Mutex<OffsetDateTime>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn at(start: OffsetDateTime) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}
