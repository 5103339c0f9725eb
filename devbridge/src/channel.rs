//! Named multicast channel carrying JSON text.
//!
//! Every subscriber sees every message posted after it subscribed,
//! including its own, in posting order. Requests and responses share the
//! channel; each side filters out what it does not handle.
//!
//! Delivery is lossless: each subscriber has its own unbounded queue, so a
//! slow consumer delays only itself and never misses a message.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::tracing::prelude::*;

/// Channel name used when none is configured.
pub const DEFAULT_CHANNEL_NAME: &str = "device-bridge";

/// Receiving end of a subscription. Yields `None` once every
/// `MessageChannel` handle is gone.
pub type Subscription = mpsc::UnboundedReceiver<String>;

#[derive(Debug, Clone)]
pub struct MessageChannel {
    name: String,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>,
}

impl MessageChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a message to every current subscriber.
    ///
    /// Returns the number of subscribers that received it. Subscribers whose
    /// receiver was dropped are forgotten. Posting with no subscribers is
    /// not an error; the message is dropped.
    pub fn post(&self, message: impl Into<String>) -> usize {
        let message = message.into();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        if subscribers.is_empty() {
            trace!(channel = %self.name, "Message posted with no subscribers");
        }
        subscribers.len()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_message() {
        let channel = MessageChannel::default();
        let mut a = channel.subscribe();
        let mut b = channel.clone().subscribe();

        assert_eq!(channel.post("hello"), 2);
        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
    }

    #[test]
    fn test_post_without_subscribers() {
        let channel = MessageChannel::new("bench");
        assert_eq!(channel.name(), "bench");
        assert_eq!(channel.post("dropped"), 0);
    }

    #[test]
    fn test_dropped_subscriber_is_forgotten() {
        let channel = MessageChannel::default();
        let _kept = channel.subscribe();
        drop(channel.subscribe());

        assert_eq!(channel.post("x"), 1);
    }

    #[tokio::test]
    async fn test_burst_is_not_dropped() {
        let channel = MessageChannel::default();
        let mut slow = channel.subscribe();

        for i in 0..5000 {
            channel.post(i.to_string());
        }

        for i in 0..5000 {
            assert_eq!(slow.recv().await.unwrap(), i.to_string());
        }
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscription_ends_with_channel() {
        let channel = MessageChannel::default();
        let mut rx = channel.subscribe();
        channel.post("last");
        drop(channel);

        assert_eq!(rx.recv().await.as_deref(), Some("last"));
        assert_eq!(rx.recv().await, None);
    }
}
