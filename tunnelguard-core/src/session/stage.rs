//! Stage notification sink with at most one subscriber

use crate::tunnel::Stage;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct StageSink {
    subscriber: Option<mpsc::UnboundedSender<Stage>>,
}

impl StageSink {
    /// Install a subscriber, replacing the previous one
    pub fn replace(&mut self, subscriber: mpsc::UnboundedSender<Stage>) {
        if self.subscriber.replace(subscriber).is_some() {
            debug!("Replaced stage subscriber");
        }
    }

    pub fn clear(&mut self) {
        self.subscriber = None;
    }

    /// Deliver a stage; a dropped receiver silently unsubscribes
    pub fn emit(&mut self, stage: Stage) {
        if let Some(subscriber) = &self.subscriber {
            if subscriber.send(stage).is_err() {
                debug!(%stage, "Stage subscriber went away");
                self.subscriber = None;
            }
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscriber_is_noop() {
        let mut sink = StageSink::default();
        sink.emit(Stage::Connected);
        assert!(!sink.has_subscriber());
    }

    #[test]
    fn test_replace_only_notifies_latest() {
        let mut sink = StageSink::default();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        sink.replace(first_tx);
        sink.replace(second_tx);
        sink.emit(Stage::Connecting);

        assert_eq!(second_rx.try_recv(), Ok(Stage::Connecting));
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_unsubscribes() {
        let mut sink = StageSink::default();
        let (tx, rx) = mpsc::unbounded_channel();
        sink.replace(tx);
        drop(rx);

        sink.emit(Stage::Disconnected);
        assert!(!sink.has_subscriber());
    }
}
