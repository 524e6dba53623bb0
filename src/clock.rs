//! Shared run clock for timestamping readings.
//!
//! Every device stamps its readings with seconds elapsed since a common
//! reference instant, so traces from different instruments line up on one
//! time axis. The reference is an explicit shared value injected at
//! construction, not a hidden static: `reset()` swaps the epoch in place
//! and every holder observes the new reference on its next call.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Cloneable handle to the rig-wide reference start time.
#[derive(Clone, Debug)]
pub struct RunClock {
    epoch: Arc<RwLock<Instant>>,
}

impl RunClock {
    /// Starts a new clock with the current instant as its epoch.
    pub fn new() -> Self {
        Self {
            epoch: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Seconds elapsed since the shared epoch.
    pub fn elapsed_secs(&self) -> f64 {
        match self.epoch.read() {
            Ok(epoch) => epoch.elapsed().as_secs_f64(),
            // A poisoned lock means a writer panicked mid-swap; the stored
            // instant is still valid, so read through the poison.
            Err(poisoned) => poisoned.into_inner().elapsed().as_secs_f64(),
        }
    }

    /// Moves the epoch to now. Visible to all clones of this clock.
    pub fn reset(&self) {
        let now = Instant::now();
        match self.epoch.write() {
            Ok(mut epoch) => *epoch = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    /// Current wall-clock time, for human-readable reading stamps.
    pub fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_elapsed_is_monotonic() {
        let clock = RunClock::new();
        let a = clock.elapsed_secs();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.elapsed_secs();
        assert!(b > a);
    }

    #[test]
    fn test_reset_visible_to_all_clones() {
        let clock = RunClock::new();
        let other = clock.clone();
        std::thread::sleep(Duration::from_millis(20));
        clock.reset();
        // The clone sees the fresh epoch, not its construction time.
        assert!(other.elapsed_secs() < 0.015);
    }
}
