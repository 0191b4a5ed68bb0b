// Presence aggregation (status, rooms, cursors). Pure state and queries;
// broadcasting what changed is the caller's job.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tandem_common::types::{EntityType, PresenceEntry, PresenceStatus, PresenceUpdate, RoomId};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default liveness window in milliseconds.
const DEFAULT_LIVENESS_MS: u64 = 45_000;

/// Tracks the last known presence entry per user.
///
/// Updates are partial: fields absent from an update leave the stored
/// value untouched (last-write-wins per field).
#[derive(Debug, Clone)]
pub struct PresenceStore {
    entries: Arc<RwLock<HashMap<Uuid, PresenceEntry>>>,
    liveness: Duration,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            liveness: Duration::milliseconds(DEFAULT_LIVENESS_MS as i64),
        }
    }

    pub fn with_liveness_ms(mut self, liveness_ms: u64) -> Self {
        self.liveness = Duration::milliseconds(liveness_ms as i64);
        self
    }

    /// Merges a partial update into the stored entry, creating it if
    /// absent. Returns the merged entry for broadcast.
    pub async fn upsert(&self, update: PresenceUpdate) -> PresenceEntry {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(update.user_id).or_insert_with(|| PresenceEntry {
            user_id: update.user_id,
            display_name: String::new(),
            status: PresenceStatus::Online,
            current_room: None,
            cursor: None,
            last_seen_at: Utc::now(),
        });

        if let Some(display_name) = update.display_name {
            entry.display_name = display_name;
        }
        if let Some(status) = update.status {
            entry.status = status;
        }
        if let Some(current_room) = update.current_room {
            entry.current_room = Some(current_room);
        }
        if let Some(cursor) = update.cursor {
            entry.cursor = Some(cursor);
        }
        // Any update is evidence of liveness.
        entry.last_seen_at = update.last_seen_at.unwrap_or_else(Utc::now);

        entry.clone()
    }

    /// Refreshes `last_seen_at` without touching anything else. Used for
    /// heartbeat traffic. No-op for unknown users.
    pub async fn touch(&self, user_id: Uuid) {
        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get_mut(&user_id) {
            entry.last_seen_at = Utc::now();
        }
    }

    /// Clears `current_room` when it matches `room`, so room queries stop
    /// listing users who left. Returns the updated entry, `None` when the
    /// user is unknown or placed elsewhere.
    pub async fn clear_room(&self, user_id: Uuid, room: &RoomId) -> Option<PresenceEntry> {
        let mut guard = self.entries.write().await;
        let entry = guard.get_mut(&user_id)?;
        if entry.current_room.as_ref() != Some(room) {
            return None;
        }
        entry.current_room = None;
        entry.last_seen_at = Utc::now();
        Some(entry.clone())
    }

    /// Flips a user to offline, keeping the entry for later queries.
    /// Returns the updated entry for broadcast, `None` if unknown.
    pub async fn mark_offline(&self, user_id: Uuid) -> Option<PresenceEntry> {
        let mut guard = self.entries.write().await;
        let entry = guard.get_mut(&user_id)?;
        entry.status = PresenceStatus::Offline;
        entry.last_seen_at = Utc::now();
        Some(entry.clone())
    }

    /// Drops a user's entry entirely. Returns the removed entry.
    pub async fn remove(&self, user_id: Uuid) -> Option<PresenceEntry> {
        self.entries.write().await.remove(&user_id)
    }

    pub async fn get(&self, user_id: Uuid) -> Option<PresenceEntry> {
        self.entries.read().await.get(&user_id).cloned()
    }

    /// All entries currently placed in `room`, sorted by user id for
    /// stable output.
    pub async fn users_in_room(&self, room: &RoomId) -> Vec<PresenceEntry> {
        let guard = self.entries.read().await;
        let mut users: Vec<PresenceEntry> =
            guard.values().filter(|entry| entry.current_room.as_ref() == Some(room)).cloned().collect();
        users.sort_by_key(|entry| entry.user_id);
        users
    }

    /// Presence entries placed in the room for one entity.
    pub async fn collaborators_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Vec<PresenceEntry> {
        self.users_in_room(&RoomId::new(entity_type, entity_id)).await
    }

    /// Whether the user is non-offline and was seen within the liveness
    /// window.
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        let guard = self.entries.read().await;
        guard.get(&user_id).is_some_and(|entry| {
            entry.status != PresenceStatus::Offline
                && Utc::now().signed_duration_since(entry.last_seen_at) <= self.liveness
        })
    }

    /// Flips every entry whose `last_seen_at` fell out of the liveness
    /// window to offline. Returns the swept entries so the caller can
    /// broadcast the status change.
    pub async fn sweep_stale(&self) -> Vec<PresenceEntry> {
        let now = Utc::now();
        let mut guard = self.entries.write().await;
        let mut swept = Vec::new();
        for entry in guard.values_mut() {
            if entry.status != PresenceStatus::Offline
                && now.signed_duration_since(entry.last_seen_at) > self.liveness
            {
                entry.status = PresenceStatus::Offline;
                swept.push(entry.clone());
            }
        }
        swept
    }

    #[cfg(test)]
    pub(crate) async fn set_last_seen_for_tests(
        &self,
        user_id: Uuid,
        last_seen_at: chrono::DateTime<Utc>,
    ) {
        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get_mut(&user_id) {
            entry.last_seen_at = last_seen_at;
        }
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}
