use chrono::Utc;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Current wall-clock time as epoch seconds, the unit used by the envelope `timestamp`.
pub fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// Client to Server messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive, emitted when the inbound side has been idle
    Heartbeat { data: HeartbeatData },
    /// Load message emitted by the pressure phase
    TestMessage { data: TestPayload },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatData {
    pub client_id: String,
}

/// Body of a pressure-phase message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestPayload {
    pub client_id: String,
    pub timestamp: i64,
    pub payload: String,
}

impl TestPayload {
    /// Build a payload of `size` filler bytes for `client_id`
    pub fn filler(client_id: &str, size: usize) -> Self {
        Self {
            client_id: client_id.to_string(),
            timestamp: epoch_seconds(),
            payload: "A".repeat(size),
        }
    }
}

/// Route key carried at the top level of every client envelope.
///
/// The field name is deployment specific (`activation_code` by default),
/// so it is serialized as a single-entry map and flattened into the envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteKey {
    pub field: String,
    pub value: String,
}

impl Serialize for RouteKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.field, &self.value)?;
        map.end()
    }
}

/// Full outbound envelope:
/// `{"type": ..., "<route-key-field>": ..., "data": {...}, "timestamp": <epoch secs>}`
#[derive(Debug, Clone, Serialize)]
pub struct ClientEnvelope {
    #[serde(flatten)]
    pub message: ClientMessage,
    #[serde(flatten)]
    pub route: RouteKey,
    pub timestamp: i64,
}

impl ClientEnvelope {
    pub fn new(message: ClientMessage, route: RouteKey) -> Self {
        Self {
            message,
            route,
            timestamp: epoch_seconds(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Notification types the server pushes to group members unprompted
pub const NOTIFICATION_TYPES: &[&str] = &[
    "incoming_update",
    "account_status_change",
    "account_status_updated",
    "stats_update",
    "group_stats_update",
    "sync_result",
    "incoming_received",
    "customer_sync_received",
    "follow_up_sync_received",
];

/// Server to Client messages
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Handshake accepted, sent once after upgrade
    AuthSuccess { data: Value },
    /// Response to a heartbeat
    HeartbeatAck { status: Option<String> },
    /// Server-side error report (e.g. unknown message type)
    Error { message: String },
    /// Known push notification; the payload is kept opaque
    Notification { kind: String, data: Value },
    /// Well-formed envelope with a type this harness does not know
    Unknown { kind: String },
}

/// Loose shape every inbound frame must satisfy before being classified
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Outcome of decoding one inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    /// Not JSON, or JSON without a string `type`
    Malformed(String),
}

impl ServerMessage {
    /// Classify an inbound text frame. Never fails: undecodable input is
    /// reported as [`Inbound::Malformed`].
    pub fn decode(text: &str) -> Inbound {
        let raw: RawEnvelope = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => return Inbound::Malformed(e.to_string()),
        };

        let msg = match raw.kind.as_str() {
            "auth_success" | "connected" => ServerMessage::AuthSuccess { data: raw.data },
            "heartbeat_ack" => ServerMessage::HeartbeatAck {
                status: raw
                    .data
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            },
            "error" => ServerMessage::Error {
                message: raw.error.unwrap_or_default(),
            },
            kind if NOTIFICATION_TYPES.contains(&kind) => ServerMessage::Notification {
                kind: raw.kind,
                data: raw.data,
            },
            _ => ServerMessage::Unknown { kind: raw.kind },
        };
        Inbound::Message(msg)
    }

    /// Get the message type name for metrics and logs
    pub fn message_type(&self) -> &str {
        match self {
            ServerMessage::AuthSuccess { .. } => "auth_success",
            ServerMessage::HeartbeatAck { .. } => "heartbeat_ack",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Notification { kind, .. } => kind,
            ServerMessage::Unknown { kind } => kind,
        }
    }
}

impl ClientMessage {
    /// Get the message type name for metrics and logs
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Heartbeat { .. } => "heartbeat",
            ClientMessage::TestMessage { .. } => "test_message",
        }
    }
}
