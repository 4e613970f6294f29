//! # Flush Timer
//!
//! Single-slot debounce timer. Each map subscription owns exactly one;
//! re-arming cancels the previously armed timer, so a burst of relevant
//! events collapses into one flush after the quiescence window.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A debounce timer with at most one armed instance at a time
#[derive(Debug)]
pub struct FlushTimer {
    delay: Duration,
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl FlushTimer {
    /// Create an unarmed timer
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            slot: Mutex::new(None),
        }
    }

    /// Arm the timer, replacing any previously armed instance. `fire`
    /// runs once after the delay unless the timer is re-armed or
    /// cancelled first.
    pub fn arm<F>(&self, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        });

        if let Ok(mut slot) = self.slot.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// Cancel the armed timer, if any
    pub fn cancel(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// Whether a timer instance is currently armed and pending
    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
