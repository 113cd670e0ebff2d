//! Channel transports.
//!
//! A [`ChannelTransport`] opens a live stream of [`ChannelMessage`]s for
//! one channel. Dropping the stream closes the underlying subscription.
//! [`InProcessTransport`] reads from a local [`EventBus`]; the WebSocket
//! transport lives in [`crate::ws`].

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;

use crate::bus::EventBus;
use crate::message::{ChannelMessage, ChannelName, ReplayPosition};

/// Stream of messages (or delivery failures) for one subscription.
pub type MessageStream = BoxStream<'static, Result<ChannelMessage, TransportError>>;

/// Delivery and connection failures reported by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the subscription.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection failed while delivering messages.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// The receiver fell behind and `skipped` messages were lost.
    /// The subscription itself stays usable.
    #[error("Subscription lagged, {skipped} messages were dropped")]
    Lagged { skipped: u64 },

    /// The remote end (or the local bus) closed the channel.
    #[error("Channel closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// Whether the subscription can no longer deliver messages.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Lagged { .. })
    }
}

/// Opens live subscriptions to a broadcast channel.
#[async_trait::async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open a subscription on `channel`, starting at `replay`.
    async fn open(
        &self,
        channel: &ChannelName,
        replay: ReplayPosition,
    ) -> Result<MessageStream, TransportError>;
}

/// Transport reading from an in-process [`EventBus`].
#[derive(Clone)]
pub struct InProcessTransport {
    bus: Arc<EventBus>,
}

impl InProcessTransport {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

#[async_trait::async_trait]
impl ChannelTransport for InProcessTransport {
    async fn open(
        &self,
        channel: &ChannelName,
        replay: ReplayPosition,
    ) -> Result<MessageStream, TransportError> {
        let subscription = self.bus.subscribe(channel, replay);
        let backlog = stream::iter(subscription.backlog.into_iter().map(Ok));

        let wanted = channel.clone();
        let live = stream::unfold(subscription.receiver, move |mut receiver| {
            let wanted = wanted.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) if message.channel == wanted => {
                            return Some((Ok(message), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            return Some((Err(TransportError::Lagged { skipped }), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        tracing::debug!(channel = %channel, replay = %replay, "Opened in-process subscription");
        Ok(backlog.chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_replays_backlog_then_live_messages() {
        let bus = Arc::new(EventBus::default());
        let channel = ChannelName::default();
        bus.publish(&channel, serde_json::json!({"n": 1}));

        let transport = InProcessTransport::new(Arc::clone(&bus));
        let mut stream = transport.open(&channel, ReplayPosition::All).await.unwrap();

        bus.publish(&ChannelName::new("/event/Other"), serde_json::json!({"n": 2}));
        bus.publish(&channel, serde_json::json!({"n": 3}));

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload["n"], 1);
        assert_eq!(second.payload["n"], 3);
    }

    #[tokio::test]
    async fn lagged_receiver_reports_non_fatal_error() {
        let bus = Arc::new(EventBus::new(2, 0));
        let channel = ChannelName::default();
        let transport = InProcessTransport::new(Arc::clone(&bus));
        let mut stream = transport.open(&channel, ReplayPosition::Latest).await.unwrap();

        for n in 0..5 {
            bus.publish(&channel, serde_json::json!({ "n": n }));
        }

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Lagged { .. }));
        assert!(!err.is_fatal());
        assert!(stream.next().await.unwrap().is_ok());
    }
}
