//! Core wire types for the delta synchronization protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Message type discriminator.
///
/// System-typed messages (join/leave/propose/reject/noop) carry their
/// payload in the top-level `data` field so the server can inspect it;
/// `contents` on those messages is always null.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "op")]
    Operation,
    #[serde(rename = "noop")]
    NoOp,
    #[serde(rename = "join")]
    ClientJoin,
    #[serde(rename = "leave")]
    ClientLeave,
    #[serde(rename = "propose")]
    Propose,
    #[serde(rename = "reject")]
    Reject,
    #[serde(rename = "summarize")]
    Summarize,
}

impl MessageType {
    /// Whether the server inspects this message's payload.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            MessageType::ClientJoin
                | MessageType::ClientLeave
                | MessageType::Propose
                | MessageType::Reject
                | MessageType::NoOp
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Operation => "op",
            MessageType::NoOp => "noop",
            MessageType::ClientJoin => "join",
            MessageType::ClientLeave => "leave",
            MessageType::Propose => "propose",
            MessageType::Reject => "reject",
            MessageType::Summarize => "summarize",
        };
        write!(f, "{s}")
    }
}

/// Timing breadcrumb stamped onto messages as they cross services.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub service: String,
    pub action: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A message sequenced by the server into the authoritative stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    pub client_id: Option<String>,
    pub client_sequence_number: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub traces: Vec<Trace>,
}

/// Out-of-band content attachment, keyed by `(client_id, client_sequence_number)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMessage {
    pub client_id: String,
    pub client_sequence_number: u64,
    pub contents: Value,
}

/// A client-originated message awaiting server sequencing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub client_sequence_number: u64,
    pub reference_sequence_number: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub contents: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub traces: Vec<Trace>,
}

/// Out-of-band signal; no ordering relation to the op stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub client_id: Option<String>,
    /// JSON-encoded payload; parsed by the signal pipeline.
    pub content: String,
}

/// A signal whose content has been parsed for the handler.
#[derive(Clone, Debug)]
pub struct ParsedSignal {
    pub client_id: Option<String>,
    pub content: Value,
}

/// Connection mode requested by or granted to a client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Read,
    #[default]
    Write,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Read => write!(f, "read"),
            ConnectionMode::Write => write!(f, "write"),
        }
    }
}

/// Client identity handed to the stream factory on connect.
///
/// `mode` is the system mode: the mode the reconnect ladder restarts at
/// after an ordinary disconnect (a nack always forces `Write`).
#[derive(Clone, Debug)]
pub struct ClientDetails {
    pub client_id_hint: Option<String>,
    pub mode: ConnectionMode,
    pub details: Value,
}

impl ClientDetails {
    pub fn new(mode: ConnectionMode) -> Self {
        Self {
            client_id_hint: None,
            mode,
            details: Value::Null,
        }
    }
}

/// Details of an established realtime connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: String,
    /// Granted mode; absent means the server granted `write`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConnectionMode>,
    #[serde(default)]
    pub service_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    #[serde(default)]
    pub initial_messages: Vec<SequencedMessage>,
    #[serde(default)]
    pub initial_contents: Vec<ContentMessage>,
    #[serde(default)]
    pub initial_signals: Vec<SignalMessage>,
    pub version: String,
    #[serde(default)]
    pub claims: Value,
    /// Server epoch delivered with the join response, when the service
    /// supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
}
