//! In-process pub/sub hub.
//!
//! PUBLISH delivers to subscribers registered on this node's hub and
//! reports how many received the message. The cluster layer sums these
//! counts across nodes.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Messages buffered per channel before slow subscribers start missing
/// them.
const CHANNEL_CAPACITY: usize = 256;

/// A message published to a channel.
#[derive(Debug, Clone)]
pub struct PubMessage {
    pub channel: Arc<[u8]>,
    pub data: Bytes,
}

/// Channel name → broadcast sender.
#[derive(Debug, Default)]
pub struct PubSub {
    channels: DashMap<Bytes, broadcast::Sender<PubMessage>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to an exact channel.
    pub fn subscribe(&self, channel: &[u8]) -> broadcast::Receiver<PubMessage> {
        self.channels
            .entry(Bytes::copy_from_slice(channel))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publishes to a channel. Returns the number of receivers. Channels
    /// whose receivers have all gone are dropped.
    pub fn publish(&self, channel: &[u8], data: Bytes) -> usize {
        let Some(tx) = self.channels.get(channel) else {
            return 0;
        };
        let msg = PubMessage {
            channel: Arc::from(channel),
            data,
        };
        match tx.send(msg) {
            Ok(n) => n,
            Err(_) => {
                drop(tx);
                self.channels
                    .remove_if(channel, |_, tx| tx.receiver_count() == 0);
                0
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let hub = PubSub::new();
        let mut rx1 = hub.subscribe(b"news");
        let mut rx2 = hub.subscribe(b"news");

        assert_eq!(hub.publish(b"news", Bytes::from_static(b"hi")), 2);
        assert_eq!(rx1.recv().await.unwrap().data, Bytes::from_static(b"hi"));
        let msg = rx2.recv().await.unwrap();
        assert_eq!(&msg.channel[..], b"news");
    }

    #[test]
    fn publish_without_subscribers() {
        let hub = PubSub::new();
        assert_eq!(hub.publish(b"void", Bytes::new()), 0);
    }

    #[test]
    fn dead_channels_are_dropped() {
        let hub = PubSub::new();
        drop(hub.subscribe(b"c"));
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.publish(b"c", Bytes::new()), 0);
        assert_eq!(hub.channel_count(), 0);
    }
}
