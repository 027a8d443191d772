//! Cancellable one-shot timers.

use std::future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// A timer that can be armed, re-armed, cancelled and fires at most once per
/// arming.
///
/// The owner polls [`ScheduledTask::elapsed`] from its event loop and calls
/// [`ScheduledTask::fire`] when it resolves.
#[derive(Debug, Default)]
pub struct ScheduledTask {
    deadline: Option<Instant>,
}

impl ScheduledTask {
    /// Arm the timer `delay` from now, replacing any earlier deadline.
    pub fn arm(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    /// Disarm. Returns `true` if the timer was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; never resolves while disarmed.
    pub async fn elapsed(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => future::pending().await,
        }
    }

    /// Consume a due deadline. Returns `false` if the timer was cancelled or
    /// re-armed to a later deadline in the meantime.
    pub fn fire(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
