//! One-shot session duration limit
//!
//! Arming replaces the previous limit. Expiry is only honoured for the
//! generation that is still armed, so a limit cancelled by `disconnect` or
//! `dispose` never tears down a later session.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SessionLimit {
    generation: u64,
    deadline: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

impl SessionLimit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the limit `after` from now; `on_expire` gets the armed generation
    #[tracing::instrument(skip(self, on_expire), fields(limit_secs = after.as_secs()))]
    pub fn arm<F>(&mut self, after: Duration, on_expire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.generation += 1;

        let generation = self.generation;
        let deadline = Instant::now() + after;
        self.deadline = Some(deadline);
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_expire(generation);
        }));
        debug!(generation, "Session limit armed");
        generation
    }

    /// Disarm the limit, returns whether one was armed
    pub fn cancel(&mut self) -> bool {
        self.deadline = None;
        match self.pending.take() {
            Some(handle) => {
                handle.abort();
                self.generation += 1;
                debug!(generation = self.generation, "Session limit cancelled");
                true
            }
            None => false,
        }
    }

    /// Claim an expiry; false when it was cancelled or re-armed since
    pub fn take_expiry(&mut self, generation: u64) -> bool {
        if self.pending.is_some() && generation == self.generation {
            self.pending = None;
            self.deadline = None;
            true
        } else {
            debug!(generation, current = self.generation, "Ignoring stale session limit");
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Time left before the limit expires
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for SessionLimit {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
