//! In-process node event feed.
//!
//! `ChannelEventSource` fans node notifications out to every subscriber.
//! Embedders feed it from whatever transport their node exposes, or let
//! [`NodePoller`](crate::NodePoller) fill it; the indexer only sees the
//! `EventSource` trait.

use async_trait::async_trait;
use futures::stream;
use tokio::sync::broadcast;

use utxoindex_core::node::{EventSource, NodeEvent, NodeEventStream};
use utxoindex_core::IndexerError;

#[derive(Clone)]
pub struct ChannelEventSource {
    tx: broadcast::Sender<NodeEvent>,
}

impl ChannelEventSource {
    /// `capacity` events are buffered per subscriber before the oldest are
    /// dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: NodeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn raw_tx(&self, raw: Vec<u8>) -> usize {
        self.publish(NodeEvent::RawTx(raw))
    }

    pub fn hash_block(&self, hash: impl Into<String>) -> usize {
        self.publish(NodeEvent::HashBlock(hash.into()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChannelEventSource {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn subscribe(&self) -> Result<NodeEventStream, IndexerError> {
        let rx = self.tx.subscribe();
        let events = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped transactions are recovered by the mempool sync.
                        tracing::warn!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let source = ChannelEventSource::new(16);
        let mut events = source.subscribe().await.unwrap();
        assert_eq!(source.subscriber_count(), 1);

        source.raw_tx(vec![1, 2, 3]);
        source.hash_block("00ab");

        assert_eq!(events.next().await, Some(NodeEvent::RawTx(vec![1, 2, 3])));
        assert_eq!(events.next().await, Some(NodeEvent::HashBlock("00ab".into())));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_harmless() {
        let source = ChannelEventSource::new(4);
        assert_eq!(source.hash_block("00ab"), 0);
    }

    #[tokio::test]
    async fn stream_ends_when_source_is_dropped() {
        let source = ChannelEventSource::new(4);
        let mut events = source.subscribe().await.unwrap();
        source.hash_block("00ab");
        drop(source);
        assert_eq!(events.next().await, Some(NodeEvent::HashBlock("00ab".into())));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_newest() {
        let source = ChannelEventSource::new(2);
        let mut events = source.subscribe().await.unwrap();
        for i in 0..4u8 {
            source.raw_tx(vec![i]);
        }
        assert_eq!(events.next().await, Some(NodeEvent::RawTx(vec![2])));
        assert_eq!(events.next().await, Some(NodeEvent::RawTx(vec![3])));
    }
}
