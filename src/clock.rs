//! Clock abstraction and abortable single-shot waits.
//!
//! The pacing controller never sleeps directly. It creates a [`ClockEntry`]
//! for the target time, registers it where a flush can find it, and waits on
//! it. `unschedule()` wakes the waiter immediately with `SyncStatus::Cancelled`.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::SyncStatus;

/// A monotonic time source shared by every channel of a capture source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current clock time. An `Err` makes the waiting channel fail with
    /// `ClockError`.
    fn time(&self) -> Result<Duration, String>;
}

/// Monotonic clock counting from its creation.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn time(&self) -> Result<Duration, String> {
        Ok(self.epoch.elapsed())
    }
}

#[derive(Debug, Default)]
struct EntryState {
    unscheduled: bool,
}

/// Single-shot wait for one target clock time.
#[derive(Debug)]
pub struct ClockEntry {
    deadline: Duration,
    state: Mutex<EntryState>,
    wake: Condvar,
}

impl ClockEntry {
    pub fn new(deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            deadline,
            state: Mutex::new(EntryState::default()),
            wake: Condvar::new(),
        })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Block until the deadline is reached on `clock` or the entry is
    /// unscheduled. Returns `Early` when the deadline had already passed on
    /// entry.
    pub fn wait(&self, clock: &dyn Clock) -> SyncStatus {
        let mut state = self.state.lock();
        let mut first = true;
        loop {
            if state.unscheduled {
                return SyncStatus::Cancelled;
            }
            let now = match clock.time() {
                Ok(now) => now,
                Err(err) => return SyncStatus::ClockError(err),
            };
            if now >= self.deadline {
                return if first && now > self.deadline {
                    SyncStatus::Early
                } else {
                    SyncStatus::OnTime
                };
            }
            first = false;
            let remaining = self.deadline - now;
            self.wake.wait_for(&mut state, remaining);
        }
    }

    /// Wake the waiter, if any. A later `wait()` returns `Cancelled` at once.
    pub fn unschedule(&self) {
        let mut state = self.state.lock();
        state.unscheduled = true;
        self.wake.notify_all();
    }

    pub fn is_unscheduled(&self) -> bool {
        self.state.lock().unscheduled
    }
}
