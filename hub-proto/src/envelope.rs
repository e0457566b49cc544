//! The outer wire frame and the closed set of inbound message shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_code::ErrorCode;

/// Error payload carried inside an outbound [`Frame`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// The single shape every WebSocket text frame takes, in both directions.
///
/// `op_id` threads a client-chosen correlation id through to the ack/error
/// reply for a request; server-initiated events (chat fan-out, presence,
/// call signaling) omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Frame {
    /// Builds a successful acknowledgement reply to a request carrying `op_id`.
    #[must_use]
    pub fn ack(op_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            r#type: "ack".to_string(),
            op_id: Some(op_id.into()),
            data,
            error: None,
        }
    }

    /// Builds an error reply to a request carrying `op_id`.
    #[must_use]
    pub fn error(op_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            r#type: "error".to_string(),
            op_id,
            data: None,
            error: Some(ErrorPayload {
                code,
                message: message.into(),
                details: None,
            }),
        }
    }

    /// Builds an error reply with structured `details`.
    #[must_use]
    pub fn error_with_details(
        op_id: Option<String>,
        code: ErrorCode,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            r#type: "error".to_string(),
            op_id,
            data: None,
            error: Some(ErrorPayload {
                code,
                message: message.into(),
                details: Some(details),
            }),
        }
    }

    /// Builds a server-initiated event frame (no `op_id`).
    #[must_use]
    pub fn event(r#type: impl Into<String>, data: Value) -> Self {
        Self {
            r#type: r#type.into(),
            op_id: None,
            data: Some(data),
            error: None,
        }
    }
}

/// Errors raised while decoding a raw WebSocket text frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
    #[error("message type {type_name} carried no data payload")]
    MissingData { type_name: String },
}

/// The closed set of requests and events a client may send inbound.
///
/// Each variant's payload is decoded lazily from [`Frame::data`] only after
/// [`decode_inbound`] has resolved `type`, so an unrecognized discriminant
/// never pays the cost of (and can never fail on) deserializing a payload
/// shape it doesn't understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InboundMessage {
    AuthRefresh {
        token: String,
    },
    ChatSend {
        scope: String,
        body: String,
        #[serde(default)]
        attachments: Vec<String>,
        #[serde(default)]
        parent_id: Option<String>,
    },
    ChatEdit {
        message_id: String,
        new_body: String,
    },
    ChatDelete {
        message_id: String,
        #[serde(default)]
        mode: DeleteMode,
    },
    ChatRedact {
        message_id: String,
        mask: String,
    },
    ChatTyping {
        scope: String,
        typing: bool,
    },
    ChatRead {
        room: String,
        message_id: String,
    },
    ChatReaction {
        message_id: String,
        scope: String,
        reaction: String,
        action: ReactionAction,
    },
    RoomJoin {
        room: String,
    },
    RoomLeave {
        room: String,
    },
    PresencePing,
    PresenceSet {
        status: crate::presence::PresenceStatus,
    },
    CallOffer {
        target_id: String,
        #[serde(default)]
        call_type: Option<String>,
        #[serde(default)]
        sdp: Option<String>,
    },
    CallAnswer {
        target_id: String,
        #[serde(default)]
        sdp: Option<String>,
    },
    CallIce {
        target_id: String,
        #[serde(default)]
        candidate: Option<Value>,
    },
    CallEnd {
        target_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    #[default]
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// Decodes a raw WebSocket text payload into a [`Frame`].
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Serializes a [`Frame`] to the text that goes on the wire.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Resolves a frame's `type` discriminant and lazily decodes its `data` into
/// the matching [`InboundMessage`] variant.
///
/// `type` strings are dotted (`chat.send`, `room.join`, ...); this is the
/// single place that maps wire names to variants, so adding a message type
/// means adding one arm here and one variant above.
pub fn decode_inbound(frame: &Frame) -> Result<InboundMessage, CodecError> {
    let data = |type_name: &str| -> Result<Value, CodecError> {
        frame.data.clone().ok_or_else(|| CodecError::MissingData {
            type_name: type_name.to_string(),
        })
    };
    let tagged = |type_name: &str, kind: &str| -> Result<Value, CodecError> {
        let mut value = data(type_name)?;
        if let Value::Object(ref mut map) = value {
            map.insert("kind".to_string(), Value::String(kind.to_string()));
        }
        Ok(value)
    };

    let value = match frame.r#type.as_str() {
        "auth.refresh" => tagged("auth.refresh", "AuthRefresh")?,
        "chat.send" => tagged("chat.send", "ChatSend")?,
        "chat.edit" => tagged("chat.edit", "ChatEdit")?,
        "chat.delete" => tagged("chat.delete", "ChatDelete")?,
        "chat.redact" => tagged("chat.redact", "ChatRedact")?,
        "chat.typing" => tagged("chat.typing", "ChatTyping")?,
        "chat.read" => tagged("chat.read", "ChatRead")?,
        "chat.reaction" => tagged("chat.reaction", "ChatReaction")?,
        "room.join" => tagged("room.join", "RoomJoin")?,
        "room.leave" => tagged("room.leave", "RoomLeave")?,
        "presence.ping" => Value::Object(
            [("kind".to_string(), Value::String("PresencePing".to_string()))]
                .into_iter()
                .collect(),
        ),
        "presence.set" => tagged("presence.set", "PresenceSet")?,
        "call.offer" => tagged("call.offer", "CallOffer")?,
        "call.answer" => tagged("call.answer", "CallAnswer")?,
        "call.ice" => tagged("call.ice", "CallIce")?,
        "call.end" => tagged("call.end", "CallEnd")?,
        other => return Err(CodecError::UnknownType(other.to_string())),
    };

    Ok(serde_json::from_value(value)?)
}
