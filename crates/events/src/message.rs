//! Broadcast channel message types and parser.
//!
//! Messages arrive as JSON with the shape
//! `{"channel": "...", "data": {"event": {"replayId": 7}, "payload": {...}}}`.
//! Both `channel` and `data.event` are optional on the wire; a frame
//! without a channel is attributed to the channel it was received on.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Channel carrying batch job completion events.
pub const DEFAULT_COMPLETION_CHANNEL: &str = "/event/BatchJobComplete__e";

/// Wire value for "only events published after subscribing".
pub const REPLAY_LATEST: i64 = -1;

/// Wire value for "every event the channel still retains".
pub const REPLAY_ALL: i64 = -2;

// ---------------------------------------------------------------------------
// ChannelName
// ---------------------------------------------------------------------------

/// Name of a broadcast channel, e.g. `/event/BatchJobComplete__e`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ChannelName {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_CHANNEL)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ReplayPosition
// ---------------------------------------------------------------------------

/// Where a new subscription starts reading the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayPosition {
    /// Only events published from now on (`-1`).
    #[default]
    Latest,
    /// Every event the channel still retains (`-2`).
    All,
    /// Events with a replay id strictly greater than the given one.
    After(i64),
}

impl ReplayPosition {
    pub fn from_replay_id(id: i64) -> Self {
        match id {
            REPLAY_ALL => Self::All,
            id if id < 0 => Self::Latest,
            id => Self::After(id),
        }
    }

    pub fn as_replay_id(self) -> i64 {
        match self {
            Self::Latest => REPLAY_LATEST,
            Self::All => REPLAY_ALL,
            Self::After(id) => id,
        }
    }
}

/// Error returned when a replay position string cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("Invalid replay position '{0}': expected 'latest', 'all' or a replay id")]
pub struct ParseReplayError(String);

impl FromStr for ReplayPosition {
    type Err = ParseReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "all" => Ok(Self::All),
            other => other
                .parse::<i64>()
                .map(Self::from_replay_id)
                .map_err(|_| ParseReplayError(s.to_string())),
        }
    }
}

impl fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_replay_id())
    }
}

// ---------------------------------------------------------------------------
// ChannelMessage
// ---------------------------------------------------------------------------

/// One message delivered on a broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: ChannelName,
    /// Position of the message in the channel's retained log, when the
    /// transport reports one.
    pub replay_id: Option<i64>,
    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl ChannelMessage {
    pub fn new(channel: ChannelName, payload: serde_json::Value) -> Self {
        Self {
            channel,
            replay_id: None,
            payload,
        }
    }

    pub fn with_replay_id(mut self, replay_id: i64) -> Self {
        self.replay_id = Some(replay_id);
        self
    }

    /// Serialize to the wire shape accepted by [`parse_message`].
    pub fn to_json(&self) -> String {
        let wire = WireMessageRef {
            channel: Some(self.channel.as_str()),
            data: WireDataRef {
                event: self.replay_id.map(|replay_id| WireEventMeta { replay_id }),
                payload: &self.payload,
            },
        };
        // Serializing borrowed strings and a `Value` cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct WireMessageRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    data: WireDataRef<'a>,
}

#[derive(Serialize)]
struct WireDataRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<WireEventMeta>,
    payload: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct WireMessage {
    channel: Option<String>,
    data: WireData,
}

#[derive(Deserialize)]
struct WireData {
    event: Option<WireEventMeta>,
    payload: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct WireEventMeta {
    #[serde(rename = "replayId")]
    replay_id: i64,
}

/// Parse a raw channel frame.
///
/// `received_on` is used when the frame does not name its channel.
/// Returns `Err` for malformed JSON or a missing `data.payload`.
pub fn parse_message(
    text: &str,
    received_on: &ChannelName,
) -> Result<ChannelMessage, serde_json::Error> {
    let wire: WireMessage = serde_json::from_str(text)?;
    Ok(ChannelMessage {
        channel: wire
            .channel
            .map(ChannelName::new)
            .unwrap_or_else(|| received_on.clone()),
        replay_id: wire.data.event.map(|e| e.replay_id),
        payload: wire.data.payload,
    })
}

// ---------------------------------------------------------------------------
// CompletionEvent
// ---------------------------------------------------------------------------

/// Payload of a batch job completion message.
///
/// Accepts both the plain field names and the platform event field
/// names (`BatchJobId__c`, `BatchJobResult__c`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompletionEvent {
    #[serde(rename = "jobId", alias = "BatchJobId__c")]
    pub job_id: String,
    /// Either a JSON-encoded string or an embedded JSON value.
    #[serde(
        rename = "resultPayloadJson",
        alias = "BatchJobResult__c",
        alias = "resultPayload",
        default
    )]
    pub result_payload: serde_json::Value,
}

impl CompletionEvent {
    /// Extract the completion payload from a channel message.
    pub fn from_message(message: &ChannelMessage) -> Result<Self, serde_json::Error> {
        Self::deserialize(&message.payload)
    }

    /// Decode the result payload into `T`.
    ///
    /// String payloads are parsed as JSON text; anything else is
    /// converted directly.
    pub fn decode_result<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.result_payload {
            serde_json::Value::String(text) => serde_json::from_str(text),
            other => T::deserialize(other),
        }
    }
}
