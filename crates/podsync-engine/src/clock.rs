//! Clock abstraction
//!
//! Quota windows and resume deadlines are wall-clock instants. Routing
//! every read of "now" and every wait for a deadline through [`Clock`]
//! lets tests drive time explicitly with [`ManualClock`].

use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// Source of wall-clock time
#[async_trait::async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Waits until `deadline` has passed
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// The real clock, backed by `chrono::Utc` and tokio timers
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(wait) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// A clock that only moves when told to
///
/// `sleep_until` jumps straight to the deadline, so code waiting on a
/// quota window finishes immediately while still observing the correct
/// time afterwards.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Sets the clock to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

#[async_trait::async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            if deadline > *now {
                *now = deadline;
            }
        }
        tokio::task::yield_now().await;
    }
}
