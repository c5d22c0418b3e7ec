#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tandem_contracts::TimestampNs;

pub trait Clock: Send + Sync {
    fn now(&self) -> TimestampNs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampNs {
        TimestampNs::now()
    }
}

/// Test clock; only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start: TimestampNs) -> Self {
        Self {
            now_ns: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, t: TimestampNs) {
        self.now_ns.store(t.0, Ordering::SeqCst);
    }

    pub fn advance(&self, d: Duration) {
        let next = self.now().saturating_add(d);
        self.set(next);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimestampNs {
        TimestampNs(self.now_ns.load(Ordering::SeqCst))
    }
}
