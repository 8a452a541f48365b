//! JSON event protocol spoken over the relay's WebSocket.
//!
//! Every frame is a UTF-8 text frame holding exactly one event:
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ {"event": "<kebab-case name>", "data": <event payload>}  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound names also accept the legacy socket.io names used by older
//! web clients (`add-user`, `send-msg`, `offer`, `answer`,
//! `mark-notifications-read`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque, stable identifier of a logical user.
///
/// Issued by the identity provider; the relay never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A chat message addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSend {
    pub to: UserId,
    pub from: UserId,
    #[serde(alias = "msg")]
    pub message: String,
}

/// WebRTC session offer. The SDP body is relayed untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOffer {
    pub to: UserId,
    pub from: UserId,
    pub offer: Value,
}

/// WebRTC session answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub to: UserId,
    pub from: UserId,
    pub answer: Value,
}

/// ICE reachability candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub to: UserId,
    pub from: UserId,
    pub candidate: Value,
}

/// Record of a message a user missed while offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingNotification {
    pub from: UserId,
    pub message: String,
}

impl PendingNotification {
    pub fn new(from: UserId, message: impl Into<String>) -> Self {
        Self {
            from,
            message: message.into(),
        }
    }
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Bind this connection to a user.
    #[serde(alias = "add-user")]
    Join(UserId),
    #[serde(alias = "send-msg")]
    MessageSend(MessageSend),
    #[serde(alias = "offer")]
    CallOffer(CallOffer),
    #[serde(alias = "answer")]
    CallAnswer(CallAnswer),
    IceCandidate(IceCandidate),
    /// Discard the user's pending notifications.
    #[serde(alias = "mark-notifications-read")]
    MarkRead(UserId),
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::MessageSend(_) => "message-send",
            Self::CallOffer(_) => "call-offer",
            Self::CallAnswer(_) => "call-answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::MarkRead(_) => "mark-read",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

/// Events the relay pushes to a live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Primary delivery of a chat message.
    MessageReceived { message: String },
    /// Lightweight "you have mail" signal that follows a live delivery.
    NewMessageNotification { from: UserId, message: String },
    /// Everything buffered while the user was offline, oldest first.
    PendingNotifications(Vec<PendingNotification>),
    CallOffer(CallOffer),
    CallAnswer(CallAnswer),
    IceCandidate(IceCandidate),
}

impl ServerEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageReceived { .. } => "message-received",
            Self::NewMessageNotification { .. } => "new-message-notification",
            Self::PendingNotifications(_) => "pending-notifications",
            Self::CallOffer(_) => "call-offer",
            Self::CallAnswer(_) => "call-answer",
            Self::IceCandidate(_) => "ice-candidate",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A binary or otherwise non-text frame arrived where an event was expected.
    UnexpectedFrame,
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame => write!(f, "Unexpected frame type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
