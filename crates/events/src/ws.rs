//! WebSocket channel transport.
//!
//! [`WsTransport`] connects to a streaming endpoint, sends a
//! `subscribe` frame naming the channel and replay position, and then
//! forwards every text frame for that channel. A background reader task
//! owns the socket; when the returned stream is dropped the task sends
//! an `unsubscribe` frame and closes the connection.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::message::{parse_message, ChannelName, ReplayPosition};
use crate::transport::{ChannelTransport, MessageStream, TransportError};

/// Frames buffered between the reader task and the consumer.
const MESSAGE_BUFFER: usize = 256;

/// Upper bound on connecting and sending the subscribe frame.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Outgoing subscription control frame.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlRequest<'a> {
    r#type: &'static str,
    channel: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    replay_id: Option<i64>,
    client_id: &'a str,
}

/// Incoming frame that is not a channel message (acks, heartbeats).
#[derive(Debug, Deserialize)]
struct ControlFrame {
    r#type: String,
}

/// Transport for a remote streaming endpoint.
pub struct WsTransport {
    ws_url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    /// * `ws_url` - WebSocket endpoint, e.g. `ws://host:8080/events`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Give up on an endpoint that has not completed the handshake and
    /// accepted the subscribe frame within `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Handshake and send the subscribe frame.
    async fn connect(
        &self,
        channel: &ChannelName,
        replay: ReplayPosition,
        client_id: &str,
    ) -> Result<WsStream, TransportError> {
        let url = format!("{}?clientId={}", self.ws_url, client_id);

        let (mut ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            TransportError::Connection(format!("Failed to connect to {}: {e}", self.ws_url))
        })?;

        let subscribe = control_frame("subscribe", channel, Some(replay), client_id);
        ws_stream
            .send(Message::Text(subscribe))
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to send subscribe: {e}")))?;

        Ok(ws_stream)
    }
}

#[async_trait::async_trait]
impl ChannelTransport for WsTransport {
    /// Connect, subscribe, and start the reader task.
    ///
    /// A unique `clientId` (UUID v4) is appended to the URL so the
    /// server can address the connection.
    async fn open(
        &self,
        channel: &ChannelName,
        replay: ReplayPosition,
    ) -> Result<MessageStream, TransportError> {
        let client_id = uuid::Uuid::new_v4().to_string();

        let ws_stream = tokio::time::timeout(
            self.connect_timeout,
            self.connect(channel, replay, &client_id),
        )
        .await
        .map_err(|_| {
            TransportError::Connection(format!(
                "Timed out connecting to {} after {:?}",
                self.ws_url, self.connect_timeout
            ))
        })??;

        tracing::info!(
            client_id = %client_id,
            channel = %channel,
            replay = %replay,
            "Subscribed to {}",
            self.ws_url,
        );

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        tokio::spawn(run_reader(ws_stream, channel.clone(), client_id, tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

fn control_frame(
    kind: &'static str,
    channel: &ChannelName,
    replay: Option<ReplayPosition>,
    client_id: &str,
) -> String {
    let request = ControlRequest {
        r#type: kind,
        channel: channel.as_str(),
        replay_id: replay.map(ReplayPosition::as_replay_id),
        client_id,
    };
    serde_json::to_string(&request).unwrap_or_default()
}

/// Read frames until the socket fails, the server closes it, or the
/// consumer drops its end of the stream.
async fn run_reader(
    mut ws_stream: WsStream,
    channel: ChannelName,
    client_id: String,
    tx: mpsc::Sender<Result<crate::message::ChannelMessage, TransportError>>,
) {
    loop {
        tokio::select! {
            _ = tx.closed() => {
                close_gracefully(&mut ws_stream, &channel, &client_id).await;
                return;
            }
            frame = ws_stream.next() => {
                let outcome = match frame {
                    Some(Ok(Message::Text(text))) => {
                        match parse_message(&text, &channel) {
                            Ok(message) if message.channel == channel => Some(Ok(message)),
                            Ok(message) => {
                                tracing::trace!(
                                    channel = %message.channel,
                                    "Ignoring message for another channel",
                                );
                                None
                            }
                            Err(e) => {
                                log_unparsed_frame(&text, &e);
                                None
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::trace!(client_id = %client_id, "Ignoring binary frame");
                        None
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                        None
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(client_id = %client_id, ?frame, "Server closed WebSocket");
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "server closed the connection".to_string());
                        let _ = tx.send(Err(TransportError::Closed(reason))).await;
                        return;
                    }
                    Some(Ok(Message::Frame(_))) => None,
                    Some(Err(e)) => {
                        tracing::error!(client_id = %client_id, error = %e, "WebSocket receive error");
                        let _ = tx.send(Err(TransportError::Delivery(e.to_string()))).await;
                        return;
                    }
                    None => {
                        let _ = tx
                            .send(Err(TransportError::Closed("stream exhausted".to_string())))
                            .await;
                        return;
                    }
                };

                if let Some(item) = outcome {
                    if tx.send(item).await.is_err() {
                        close_gracefully(&mut ws_stream, &channel, &client_id).await;
                        return;
                    }
                }
            }
        }
    }
}

fn log_unparsed_frame(text: &str, error: &serde_json::Error) {
    match serde_json::from_str::<ControlFrame>(text) {
        Ok(control) => tracing::debug!(kind = %control.r#type, "Control frame received"),
        Err(_) => tracing::warn!(
            error = %error,
            raw_message = %text,
            "Failed to parse channel frame",
        ),
    }
}

async fn close_gracefully(ws_stream: &mut WsStream, channel: &ChannelName, client_id: &str) {
    let unsubscribe = control_frame("unsubscribe", channel, None, client_id);
    if let Err(e) = ws_stream.send(Message::Text(unsubscribe)).await {
        tracing::debug!(error = %e, "Failed to send unsubscribe frame");
    }
    if let Err(e) = ws_stream.close(None).await {
        tracing::debug!(error = %e, "Failed to close WebSocket");
    }
    tracing::info!(client_id = %client_id, channel = %channel, "WebSocket subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn next_text(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> serde_json::Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Expected text frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn subscribes_and_forwards_channel_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let subscribe = next_text(&mut ws).await;
            assert_eq!(subscribe["type"], "subscribe");
            assert_eq!(subscribe["channel"], "/event/BatchJobComplete__e");
            assert_eq!(subscribe["replayId"], -1);

            ws.send(Message::Text(r#"{"type":"subscribed"}"#.into())).await.unwrap();
            ws.send(Message::Text(
                r#"{"channel":"/event/Other","data":{"payload":{"jobId":"X"}}}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                r#"{"data":{"event":{"replayId":5},"payload":{"jobId":"J1"}}}"#.into(),
            ))
            .await
            .unwrap();

            let unsubscribe = next_text(&mut ws).await;
            assert_eq!(unsubscribe["type"], "unsubscribe");
        });

        let transport = WsTransport::new(format!("ws://{addr}/events"));
        let mut stream = transport
            .open(&ChannelName::default(), ReplayPosition::Latest)
            .await
            .unwrap();

        let message = stream.next().await.unwrap().unwrap();
        assert_eq!(message.payload["jobId"], "J1");
        assert_eq!(message.replay_id, Some(5));

        drop(stream);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_close_is_reported_as_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = next_text(&mut ws).await;
            ws.close(None).await.unwrap();
        });

        let transport = WsTransport::new(format!("ws://{addr}/events"));
        let mut stream = transport
            .open(&ChannelName::default(), ReplayPosition::Latest)
            .await
            .unwrap();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WsTransport::new(format!("ws://{addr}/events"));
        let result = transport
            .open(&ChannelName::default(), ReplayPosition::Latest)
            .await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept the TCP connection but never answer the handshake.
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(tcp);
        });

        let transport = WsTransport::new(format!("ws://{addr}/events"))
            .with_connect_timeout(Duration::from_millis(100));
        let result = transport
            .open(&ChannelName::default(), ReplayPosition::Latest)
            .await;

        assert!(matches!(result, Err(TransportError::Connection(ref m)) if m.contains("Timed out")));
        server.abort();
    }
}
