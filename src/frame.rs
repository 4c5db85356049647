//! # Frame Classification
//!
//! Classifies raw inbound WebSocket messages into typed frames before dispatch.
//! Binary payloads are always audio; text payloads must be JSON objects to be
//! treated as control messages. Anything else is tagged `Malformed` and handed
//! back to the caller as data - classification itself never fails.
//!
//! ## Frame Lifecycle:
//! A frame is ephemeral: it lives for exactly one read-dispatch cycle and is
//! consumed by the session that classified it. Ownership of the payload bytes
//! transfers from the transport read buffer into the frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One raw inbound message as delivered by the transport, tagged with the
/// wire-level message kind.
#[derive(Debug, Clone)]
pub enum InboundPayload {
    /// Binary WebSocket message (opaque audio data).
    Binary(Vec<u8>),
    /// Text WebSocket message (expected to be a JSON object).
    Text(String),
}

/// One classified unit of inbound data.
///
/// ## Variants:
/// - **Audio**: binary payload, opaque at this layer
/// - **Control**: decoded JSON object from a text payload
/// - **Malformed**: text payload that failed structured decoding; carries the
///   raw bytes and a human-readable reason so the caller can log and discard
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Audio {
        data: Vec<u8>,
        /// Optional ordering hint supplied by a higher layer (unused by the
        /// classifier itself).
        sequence_hint: Option<u64>,
    },
    Control(Value),
    Malformed {
        raw: Vec<u8>,
        reason: String,
    },
}

/// Classify one inbound message into a [`Frame`].
///
/// ## Contract:
/// - Binary input yields `Audio` unconditionally; the payload is opaque here.
/// - Text input yields `Control` only for valid JSON **objects**. Invalid JSON
///   and valid-but-non-object JSON (numbers, arrays, strings) yield
///   `Malformed` with the reason recorded.
/// - Pure function of its input; no side effects, never panics.
pub fn classify(payload: InboundPayload) -> Frame {
    match payload {
        InboundPayload::Binary(data) => Frame::Audio {
            data,
            sequence_hint: None,
        },
        InboundPayload::Text(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Frame::Control(Value::Object(map)),
            Ok(other) => Frame::Malformed {
                raw: text.into_bytes(),
                reason: format!(
                    "control message must be a JSON object, got {}",
                    json_type_name(&other)
                ),
            },
            Err(err) => Frame::Malformed {
                raw: text.into_bytes(),
                reason: format!("invalid JSON: {}", err),
            },
        },
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The closed set of control messages the relay recognizes.
///
/// ## Protocol:
/// - `{"type":"ping"}` - heartbeat probe, replied to with `pong`
/// - `{"type":"configure", ...opts}` - update the session's declared audio
///   format, replied to with `ack` or `error`
/// - `{"type":"close"}` - client-initiated graceful close
///
/// Unrecognized `type` values parse to `None` and are logged and ignored by
/// the dispatcher rather than treated as an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Ping,
    Configure(ConfigureOptions),
    Close,
}

/// Options carried by a `configure` control message. All fields are optional;
/// absent fields leave the session's current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigureOptions {
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bit_depth: Option<u8>,
}

impl ControlMessage {
    /// Parse a decoded control value into a recognized message.
    ///
    /// ## Returns:
    /// - **Some(message)**: the `type` field named a recognized message kind
    /// - **None**: missing or unrecognized `type` (caller logs and ignores)
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.get("type").and_then(Value::as_str)? {
            "ping" => Some(ControlMessage::Ping),
            "close" => Some(ControlMessage::Close),
            "configure" => {
                // Unknown or mistyped option fields fall back to defaults so a
                // sloppy configure doesn't kill the session.
                let opts = serde_json::from_value(value.clone()).unwrap_or_default();
                Some(ControlMessage::Configure(opts))
            }
            _ => None,
        }
    }
}

/// Control replies sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlReply {
    /// Reply to a `ping`.
    #[serde(rename = "pong")]
    Pong,

    /// A `configure` request was applied.
    #[serde(rename = "ack")]
    Ack,

    /// A `configure` request was rejected.
    #[serde(rename = "error")]
    Error { reason: String },
}

/// One frame waiting in a session's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Binary audio payload (pipeline output).
    Audio(Vec<u8>),
    /// JSON control reply.
    Control(ControlReply),
}

impl OutboundFrame {
    /// Serialize a control reply for the wire. Audio frames are sent as raw
    /// binary and never pass through here.
    pub fn control_json(reply: &ControlReply) -> String {
        // ControlReply contains only strings, so serialization cannot fail.
        serde_json::to_string(reply).unwrap_or_default()
    }
}
