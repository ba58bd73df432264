//! Pusher-style wire frames exchanged with the realtime server.
//!
//! Every frame is a JSON text message shaped `{"event": .., "channel"?: ..,
//! "data"?: ..}`. The server frequently encodes `data` as a JSON string, so
//! payload decoding accepts both an embedded object and a string holding one.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_ERROR: &str = "pusher:error";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";

/// Frames the client writes to the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundFrame {
    #[serde(rename = "pusher:subscribe")]
    Subscribe {
        channel: String,
        auth: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_data: Option<String>,
    },
    #[serde(rename = "pusher:unsubscribe")]
    Unsubscribe { channel: String },
    #[serde(rename = "pusher:ping")]
    Ping,
    #[serde(rename = "pusher:pong")]
    Pong,
}

impl OutboundFrame {
    pub fn to_text(&self) -> String {
        // Serializing plain strings into a map cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    /// Seconds of silence the server tolerates before it expects a ping.
    pub activity_timeout: Option<u64>,
}

/// A decoded inbound frame, one variant per event the client reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    ConnectionEstablished(ConnectionEstablished),
    Ping,
    Pong,
    SubscriptionSucceeded {
        channel: Option<String>,
    },
    ServerError {
        code: Option<u16>,
        message: String,
    },
    MessageSent {
        channel: Option<String>,
        message: DecodedMessage,
    },
    Unrecognized {
        event: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAuthor {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// Application message carried by a `message.sent` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedMessage {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "message", alias = "text", alias = "body")]
    pub text: String,
    pub user: MessageAuthor,
    #[serde(
        rename = "message_group_id",
        alias = "group_id",
        alias = "thread_id",
        deserialize_with = "id_string"
    )]
    pub thread_id: String,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawConnectionPayload {
    socket_id: String,
    #[serde(default)]
    activity_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawErrorPayload {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// Turns raw socket text into [`InboundEvent`]s. The application event name
/// is configurable because backends broadcast under either an alias
/// (`message.sent`) or the event's class name.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    message_event: String,
}

impl FrameDecoder {
    pub fn new(message_event: impl Into<String>) -> Self {
        Self {
            message_event: message_event.into(),
        }
    }

    pub fn decode(&self, text: &str) -> Result<InboundEvent, ProtocolError> {
        let frame: RawFrame = serde_json::from_str(text).map_err(ProtocolError::MalformedFrame)?;
        match frame.event.as_str() {
            EVENT_CONNECTION_ESTABLISHED => {
                decode_connection(frame.data).map(InboundEvent::ConnectionEstablished)
            }
            EVENT_PING => Ok(InboundEvent::Ping),
            EVENT_PONG => Ok(InboundEvent::Pong),
            EVENT_SUBSCRIPTION_SUCCEEDED => Ok(InboundEvent::SubscriptionSucceeded {
                channel: frame.channel,
            }),
            EVENT_ERROR => Ok(decode_error(frame.data)),
            event if event == self.message_event => {
                let message = decode_message(event, frame.data)?;
                Ok(InboundEvent::MessageSent {
                    channel: frame.channel,
                    message,
                })
            }
            _ => Ok(InboundEvent::Unrecognized { event: frame.event }),
        }
    }
}

/// Unwraps `data` when the server sent it as a JSON-encoded string.
fn unwrap_payload(data: Value) -> Result<Value, serde_json::Error> {
    match data {
        Value::String(text) => serde_json::from_str(&text),
        other => Ok(other),
    }
}

fn decode_connection(data: Option<Value>) -> Result<ConnectionEstablished, ProtocolError> {
    let data = data.ok_or_else(|| {
        ProtocolError::MalformedConnectionPayload("missing data".to_string())
    })?;
    let payload = unwrap_payload(data)
        .and_then(serde_json::from_value::<RawConnectionPayload>)
        .map_err(|err| ProtocolError::MalformedConnectionPayload(err.to_string()))?;
    if payload.socket_id.trim().is_empty() {
        return Err(ProtocolError::MalformedConnectionPayload(
            "empty socket_id".to_string(),
        ));
    }
    Ok(ConnectionEstablished {
        socket_id: payload.socket_id,
        activity_timeout: payload.activity_timeout,
    })
}

fn decode_error(data: Option<Value>) -> InboundEvent {
    let raw = data.unwrap_or(Value::Null);
    let payload = unwrap_payload(raw.clone())
        .ok()
        .and_then(|value| serde_json::from_value::<RawErrorPayload>(value).ok())
        .unwrap_or_default();
    InboundEvent::ServerError {
        code: payload.code,
        message: payload.message.unwrap_or_else(|| raw.to_string()),
    }
}

fn decode_message(event: &str, data: Option<Value>) -> Result<DecodedMessage, ProtocolError> {
    let malformed = |reason: String| ProtocolError::MalformedMessagePayload {
        event: event.to_string(),
        reason,
    };
    let data = data.ok_or_else(|| malformed("missing data".to_string()))?;
    let payload = unwrap_payload(data).map_err(|err| malformed(err.to_string()))?;
    // Broadcast events usually wrap the model as `{"message": {...}}`.
    let wrapped = payload
        .get("message")
        .filter(|inner| inner.is_object())
        .cloned();
    let body = wrapped.unwrap_or(payload);
    serde_json::from_value(body).map_err(|err| malformed(err.to_string()))
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}
