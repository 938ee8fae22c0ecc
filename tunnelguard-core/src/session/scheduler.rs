//! Single-slot delayed reconnect
//!
//! Scheduling always cancels the pending attempt first, so at most one
//! reconnect is ever outstanding. Every arm gets a new generation number;
//! a fire is only honoured when its generation is still the armed one, which
//! makes cancellation race-free against a timer that already fired and whose
//! message is queued behind the cancel.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Owner of the pending reconnect timer
#[derive(Debug)]
pub struct ReconnectScheduler {
    delay: Duration,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    scheduled_total: u64,
}

impl ReconnectScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: 0,
            pending: None,
            scheduled_total: 0,
        }
    }

    /// Arm the timer, replacing any pending attempt
    ///
    /// `on_fire` runs on the runtime after the delay with the generation the
    /// timer was armed with; hand it to [`Self::take_fire`] on the owning side.
    #[tracing::instrument(skip(self, on_fire), fields(delay_ms = self.delay.as_millis() as u64))]
    pub fn schedule<F>(&mut self, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        self.scheduled_total += 1;

        let generation = self.generation;
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation);
        }));
        debug!(generation, "Reconnect scheduled");
        generation
    }

    /// Cancel the pending attempt, returns whether one was pending
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                handle.abort();
                // Invalidate a fire that is already on its way
                self.generation += 1;
                debug!(generation = self.generation, "Pending reconnect cancelled");
                true
            }
            None => false,
        }
    }

    /// Claim a fire; false when it was cancelled or superseded
    pub fn take_fire(&mut self, generation: u64) -> bool {
        if self.pending.is_some() && generation == self.generation {
            self.pending = None;
            true
        } else {
            debug!(generation, current = self.generation, "Ignoring stale reconnect fire");
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of times the timer was armed since creation
    pub fn scheduled_total(&self) -> u64 {
        self.scheduled_total
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
