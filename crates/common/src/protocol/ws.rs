// WebSocket message types for the tandem-realtime.v1 protocol.
//
// Every frame is one JSON text message: externally tagged by `type`, carrying a
// unique `id` used for deduplication and acknowledgment correlation, with the
// type-specific body under `payload`. The contract is frozen in
// contracts/ws-protocol.json at the workspace root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    DocumentOperation, DocumentSnapshot, NotificationEvent, PresenceUpdate, RealtimeEvent, RoomId,
};

/// Version string the client offers in `hello`.
pub const CURRENT_PROTOCOL_VERSION: &str = "tandem-realtime.v1";

/// Versions the hub accepts.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["tandem-realtime.v1"];

/// Client -> Server: first frame on the socket. Anything else first is
/// rejected with `HELLO_REQUIRED`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub protocol_version: String,
    pub user_id: Uuid,
    pub display_name: String,
    /// Opaque auth token; compared by the hub, never interpreted here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Server -> Client: handshake acknowledgement. The client adopts the
/// advertised heartbeat interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloAckPayload {
    pub session_id: Uuid,
    pub server_time: DateTime<Utc>,
    pub heartbeat_interval_ms: u64,
    pub max_frame_bytes: u32,
}

/// Bidirectional: room membership change. Clients omit `user_id`; the hub
/// fills it from the session when rebroadcasting to the room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomPayload {
    pub room: RoomId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

/// Client -> Server: periodic liveness ping, answered with an ack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub sent_at: DateTime<Utc>,
}

/// Document-level failure embedded in an ack so it stays correlated to the
/// message that caused it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Server -> Client: outcome of a client frame, correlated by `acked_id`.
///
/// `conflict: true` marks an operation accepted through the transform path;
/// the authoritative snapshot rides along for reconciliation. `duplicate:
/// true` marks a redelivered id whose stored outcome was re-sent without
/// re-applying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    pub acked_id: Uuid,
    pub applied: bool,
    #[serde(default)]
    pub conflict: bool,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl AckPayload {
    pub fn applied(acked_id: Uuid) -> AckPayload {
        AckPayload {
            acked_id,
            applied: true,
            conflict: false,
            duplicate: false,
            server_version: None,
            document: None,
            error: None,
        }
    }

    pub fn rejected(
        acked_id: Uuid,
        code: &str,
        message: impl Into<String>,
        retryable: bool,
    ) -> AckPayload {
        AckPayload {
            acked_id,
            applied: false,
            conflict: false,
            duplicate: false,
            server_version: None,
            document: None,
            error: Some(AckError {
                code: code.to_string(),
                message: message.into(),
                retryable,
            }),
        }
    }
}

/// Server -> Client: connection-scoped protocol failure with no message to
/// acknowledge (handshake rejection, undecodable frame, idle timeout).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// All message types in the tandem-realtime.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Client -> Server: initial handshake.
    Hello { id: Uuid, payload: HelloPayload },

    /// Server -> Client: handshake acknowledgement.
    HelloAck { id: Uuid, payload: HelloAckPayload },

    /// Bidirectional: a position-addressed document edit. Server copies carry
    /// the assigned `server_version`.
    Operation { id: Uuid, payload: DocumentOperation },

    /// Bidirectional: partial presence update (client) or full merged entry
    /// (server broadcast). Fire-and-forget; never acknowledged.
    Presence { id: Uuid, payload: PresenceUpdate },

    /// Bidirectional: join a room.
    Join { id: Uuid, payload: RoomPayload },

    /// Bidirectional: leave a room.
    Leave { id: Uuid, payload: RoomPayload },

    /// Client -> Server: liveness ping.
    Heartbeat { id: Uuid, payload: HeartbeatPayload },

    /// Bidirectional: a domain-change fact record.
    Event { id: Uuid, payload: RealtimeEvent },

    /// Bidirectional: a user-directed notification fact.
    Notification { id: Uuid, payload: NotificationEvent },

    /// Server -> Client: outcome for a client frame.
    Ack { id: Uuid, payload: AckPayload },

    /// Server -> Client: connection-scoped error.
    Error { id: Uuid, payload: ErrorPayload },
}

impl Envelope {
    /// The envelope's own message id (not the inner fact id).
    pub fn id(&self) -> Uuid {
        match self {
            Envelope::Hello { id, .. }
            | Envelope::HelloAck { id, .. }
            | Envelope::Operation { id, .. }
            | Envelope::Presence { id, .. }
            | Envelope::Join { id, .. }
            | Envelope::Leave { id, .. }
            | Envelope::Heartbeat { id, .. }
            | Envelope::Event { id, .. }
            | Envelope::Notification { id, .. }
            | Envelope::Ack { id, .. }
            | Envelope::Error { id, .. } => *id,
        }
    }

    /// The wire discriminator, for logging and contract tests.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::HelloAck { .. } => "hello_ack",
            Envelope::Operation { .. } => "operation",
            Envelope::Presence { .. } => "presence",
            Envelope::Join { .. } => "join",
            Envelope::Leave { .. } => "leave",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::Event { .. } => "event",
            Envelope::Notification { .. } => "notification",
            Envelope::Ack { .. } => "ack",
            Envelope::Error { .. } => "error",
        }
    }

    pub fn hello(payload: HelloPayload) -> Envelope {
        Envelope::Hello { id: Uuid::new_v4(), payload }
    }

    pub fn hello_ack(payload: HelloAckPayload) -> Envelope {
        Envelope::HelloAck { id: Uuid::new_v4(), payload }
    }

    pub fn operation(payload: DocumentOperation) -> Envelope {
        Envelope::Operation { id: Uuid::new_v4(), payload }
    }

    pub fn presence(payload: PresenceUpdate) -> Envelope {
        Envelope::Presence { id: Uuid::new_v4(), payload }
    }

    pub fn join(payload: RoomPayload) -> Envelope {
        Envelope::Join { id: Uuid::new_v4(), payload }
    }

    pub fn leave(payload: RoomPayload) -> Envelope {
        Envelope::Leave { id: Uuid::new_v4(), payload }
    }

    pub fn heartbeat(payload: HeartbeatPayload) -> Envelope {
        Envelope::Heartbeat { id: Uuid::new_v4(), payload }
    }

    pub fn event(payload: RealtimeEvent) -> Envelope {
        Envelope::Event { id: Uuid::new_v4(), payload }
    }

    pub fn notification(payload: NotificationEvent) -> Envelope {
        Envelope::Notification { id: Uuid::new_v4(), payload }
    }

    pub fn ack(payload: AckPayload) -> Envelope {
        Envelope::Ack { id: Uuid::new_v4(), payload }
    }

    pub fn error(payload: ErrorPayload) -> Envelope {
        Envelope::Error { id: Uuid::new_v4(), payload }
    }
}
