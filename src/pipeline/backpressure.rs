use super::channel::{Payload, Sender};
use crate::config::types::BackpressureStrategy;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Channel full under the drop strategy; the payload was discarded.
    Dropped,
    /// Every receiver is gone.
    Closed,
}

/// Publishes to a bounded channel according to the configured strategy.
///
/// `Block` waits for capacity. `Drop` discards the message when the channel
/// is full, leaving its job pending for a later sweep.
#[derive(Clone)]
pub struct Publisher {
    sender: Sender,
    strategy: BackpressureStrategy,
}

impl Publisher {
    pub fn new(sender: Sender, strategy: BackpressureStrategy) -> Self {
        Self { sender, strategy }
    }

    pub fn strategy(&self) -> BackpressureStrategy {
        self.strategy
    }

    pub async fn publish(&self, payload: Payload) -> PublishOutcome {
        match self.strategy {
            BackpressureStrategy::Block => match self.sender.send(payload).await {
                Ok(()) => PublishOutcome::Sent,
                Err(_) => PublishOutcome::Closed,
            },
            BackpressureStrategy::Drop => match self.sender.try_send(payload) {
                Ok(()) => PublishOutcome::Sent,
                Err(TrySendError::Full(_)) => PublishOutcome::Dropped,
                Err(TrySendError::Closed(_)) => PublishOutcome::Closed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::create_channel;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drop_strategy_discards_when_full() {
        let (tx, mut rx) = create_channel(1);
        let publisher = Publisher::new(tx, BackpressureStrategy::Drop);

        assert_eq!(publisher.publish(vec![1]).await, PublishOutcome::Sent);
        assert_eq!(publisher.publish(vec![2]).await, PublishOutcome::Dropped);
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(publisher.publish(vec![3]).await, PublishOutcome::Sent);
    }

    #[tokio::test]
    async fn test_block_strategy_waits_for_capacity() {
        let (tx, mut rx) = create_channel(1);
        let publisher = Publisher::new(tx, BackpressureStrategy::Block);
        publisher.publish(vec![1]).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), publisher.publish(vec![2])).await;
        assert!(blocked.is_err());

        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(publisher.publish(vec![3]).await, PublishOutcome::Sent);
    }

    #[tokio::test]
    async fn test_closed_channel_is_reported() {
        for strategy in [BackpressureStrategy::Block, BackpressureStrategy::Drop] {
            let (tx, rx) = create_channel(4);
            drop(rx);
            let publisher = Publisher::new(tx, strategy);
            assert_eq!(publisher.publish(vec![1]).await, PublishOutcome::Closed);
        }
    }
}
