//! Periodic poll for tunnels we did not start
//!
//! The monitor only produces ticks. The owner answers each tick by querying
//! the live status and force-disconnecting when the tunnel is live but not
//! app-initiated, so the check is serialized with every other transition.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Repeating timer bound to one controller initialization
#[derive(Debug)]
pub struct ConnectionMonitor {
    interval: Duration,
    generation: u64,
    ticker: Option<JoinHandle<()>>,
}

impl ConnectionMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            generation: 0,
            ticker: None,
        }
    }

    /// Start ticking, stopping a previous ticker first
    ///
    /// `on_tick` returns false when nobody is listening anymore, which ends
    /// the ticker task.
    #[tracing::instrument(
        skip(self, on_tick),
        fields(interval_ms = self.interval.as_millis() as u64)
    )]
    pub fn start<F>(&mut self, on_tick: F) -> u64
    where
        F: Fn(u64) -> bool + Send + 'static,
    {
        self.stop();
        self.generation += 1;

        let generation = self.generation;
        let period = self.interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // Consume first immediate tick

            loop {
                timer.tick().await;
                if !on_tick(generation) {
                    debug!(generation, "Connection monitor receiver gone");
                    break;
                }
            }
        }));
        debug!(generation, "Connection monitor started");
        generation
    }

    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            self.generation += 1;
            debug!("Connection monitor stopped");
        }
    }

    /// Whether a tick belongs to the running ticker
    pub fn accepts(&self, generation: u64) -> bool {
        self.ticker.is_some() && generation == self.generation
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_some()
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ConnectionMonitor::new(Duration::from_secs(2));
        let generation = monitor.start(move |g| tx.send(g).is_ok());

        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(generation));
        }
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert!(monitor.accepts(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_rejects_old_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ConnectionMonitor::new(Duration::from_secs(2));
        let tx_first = tx.clone();
        let first = monitor.start(move |g| tx_first.send(g).is_ok());
        let second = monitor.start(move |g| tx.send(g).is_ok());

        assert!(!monitor.accepts(first));
        assert_eq!(rx.recv().await, Some(second));

        // Only the second ticker is alive
        tokio::time::sleep(Duration::from_secs(5)).await;
        while let Ok(g) = rx.try_recv() {
            assert_eq!(g, second);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ConnectionMonitor::new(Duration::from_secs(2));
        let generation = monitor.start(move |g| tx.send(g).is_ok());
        monitor.stop();

        assert!(!monitor.is_active());
        assert!(!monitor.accepts(generation));
        // Sender was dropped with the aborted task
        assert_eq!(rx.recv().await, None);
    }
}
