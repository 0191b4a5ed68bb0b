// Core domain types shared across all Tandem crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Kind of shared entity a document or room is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Project,
    Comment,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Task => "task",
            EntityType::Project => "project",
            EntityType::Comment => "comment",
        }
    }

    pub fn parse(s: &str) -> Option<EntityType> {
        match s {
            "task" => Some(EntityType::Task),
            "project" => Some(EntityType::Project),
            "comment" => Some(EntityType::Comment),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broadcast group keyed by entity identity, formatted `{entity_type}:{entity_id}`
/// (e.g. `task:abc123`). Used by room membership, presence `current_room`, and
/// event fan-out routing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(entity_type: EntityType, entity_id: &str) -> RoomId {
        RoomId(format!("{entity_type}:{entity_id}"))
    }

    /// Accepts a pre-formatted room string without validating the entity type.
    pub fn from_raw(raw: impl Into<String>) -> RoomId {
        RoomId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the room back into `(entity_type, entity_id)`; `None` when the
    /// string does not follow the room convention.
    pub fn parse(&self) -> Option<(EntityType, &str)> {
        let (kind, entity_id) = self.0.split_once(':')?;
        Some((EntityType::parse(kind)?, entity_id))
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Presence availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// Positional hint for where a user is focused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub document_id: Uuid,
    /// Char offset into the document content.
    pub offset: usize,
}

/// A user's current presence state as held by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_room: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    pub last_seen_at: DateTime<Utc>,
}

/// Partial presence update; absent fields leave the stored entry untouched
/// (last-write-wins per field). Broadcasts from the hub carry every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_room: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl From<PresenceEntry> for PresenceUpdate {
    fn from(entry: PresenceEntry) -> PresenceUpdate {
        PresenceUpdate {
            user_id: entry.user_id,
            display_name: Some(entry.display_name),
            status: Some(entry.status),
            current_room: entry.current_room,
            cursor: entry.cursor,
            last_seen_at: Some(entry.last_seen_at),
        }
    }
}

/// What a document operation does to content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Delete,
    Replace,
    /// Whole-field replacement; position/length are ignored.
    Modify,
}

/// A position-addressed edit against a collaborative document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentOperation {
    /// Unique per operation; survives transformation unchanged.
    pub id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub kind: OperationKind,
    /// Char offset into content; clamped to the content end on application.
    pub position: usize,
    /// Inserted/replacement content (insert, replace, modify).
    #[serde(default)]
    pub payload: String,
    /// Chars removed (delete, replace).
    #[serde(default)]
    pub length: usize,
    /// Version the author believed was current when the op was authored.
    pub base_version: i64,
    /// Assigned exactly once on acceptance; strictly increasing per document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
}

/// Read-only copy of a document's current state. Mutation happens only through
/// the engine's apply path; snapshots are detached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub content: String,
    pub version: i64,
    pub last_modified_at: DateTime<Utc>,
    pub last_modified_by: Uuid,
    /// Membership only, not ownership. Sorted for stable output.
    pub collaborators: Vec<Uuid>,
}

impl DocumentSnapshot {
    pub fn room(&self) -> RoomId {
        RoomId::new(self.entity_type, &self.entity_id)
    }
}

/// Category of a realtime fact record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    /// Ephemeral; never appended to event history and expires on its own.
    Typing,
    /// History projection of a user-directed notification.
    Notification,
}

/// Immutable fact record describing an entity change. The id makes redelivery
/// idempotent on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub id: Uuid,
    pub kind: EventType,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// The acting user.
    pub user_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RealtimeEvent {
    pub fn room(&self) -> RoomId {
        RoomId::new(self.entity_type, &self.entity_id)
    }
}

/// A user-directed notification fact. Delivery channels (push/email) live
/// outside this core; the router only fans out and records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn room(&self) -> RoomId {
        RoomId::new(self.entity_type, &self.entity_id)
    }

    /// Projection into the per-entity event history.
    pub fn to_event(&self) -> RealtimeEvent {
        RealtimeEvent {
            id: self.id,
            kind: EventType::Notification,
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            user_id: self.sender_id,
            occurred_at: self.created_at,
            data: json!({
                "recipient_id": self.recipient_id,
                "title": self.title,
                "body": self.body,
            }),
        }
    }
}
