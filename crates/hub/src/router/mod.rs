// Realtime event routing: bounded per-entity history for late joiners
// plus best-effort fan-out to room members. Reliability lives at the
// edges (sender queueing, receiver dedup), not here.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_common::protocol::ws::Envelope;
use tandem_common::types::{EventType, NotificationEvent, RealtimeEvent, RoomId};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::ws::SessionRegistry;

/// Default number of events retained per entity.
const DEFAULT_HISTORY_CAP: usize = 256;
/// Default typing indicator lifetime in milliseconds.
const DEFAULT_TYPING_TTL_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct EventRouter {
    /// Per-entity event history, oldest first.
    history: Arc<RwLock<HashMap<String, VecDeque<RealtimeEvent>>>>,
    /// Last typing signal per (room, user). Entries expire by TTL.
    typing: Arc<RwLock<HashMap<(RoomId, Uuid), Instant>>>,
    history_cap: usize,
    typing_ttl: Duration,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            history: Arc::new(RwLock::new(HashMap::new())),
            typing: Arc::new(RwLock::new(HashMap::new())),
            history_cap: DEFAULT_HISTORY_CAP,
            typing_ttl: Duration::from_millis(DEFAULT_TYPING_TTL_MS),
        }
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    pub fn with_typing_ttl(mut self, ttl: Duration) -> Self {
        self.typing_ttl = ttl;
        self
    }

    /// Records the event and fans it out to every session in the event's
    /// room. Typing signals refresh the typing registry instead of the
    /// history. Returns the number of sessions reached.
    pub async fn publish_event(&self, registry: &SessionRegistry, event: RealtimeEvent) -> usize {
        if event.kind == EventType::Typing {
            let mut typing = self.typing.write().await;
            typing.insert((event.room(), event.user_id), Instant::now());
        } else {
            self.append_history(event.clone()).await;
        }

        let room = event.room();
        registry.broadcast_to_room(&room, &Envelope::event(event)).await
    }

    /// Projects the notification into the entity's history and fans the
    /// full notification out to the entity's room.
    pub async fn publish_notification(
        &self,
        registry: &SessionRegistry,
        notification: NotificationEvent,
    ) -> usize {
        self.append_history(notification.to_event()).await;

        let room = notification.room();
        registry.broadcast_to_room(&room, &Envelope::notification(notification)).await
    }

    /// The most recent `limit` events for an entity, most-recent-last.
    pub async fn get_event_history(&self, entity_id: &str, limit: usize) -> Vec<RealtimeEvent> {
        let guard = self.history.read().await;
        guard
            .get(entity_id)
            .map(|events| {
                let skip = events.len().saturating_sub(limit);
                events.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Users with an unexpired typing signal in `room`, sorted for stable
    /// output.
    pub async fn typists_in_room(&self, room: &RoomId) -> Vec<Uuid> {
        let guard = self.typing.read().await;
        let mut typists: Vec<Uuid> = guard
            .iter()
            .filter(|((typing_room, _), seen_at)| {
                typing_room == room && seen_at.elapsed() < self.typing_ttl
            })
            .map(|((_, user_id), _)| *user_id)
            .collect();
        typists.sort();
        typists
    }

    /// Drops expired typing entries. Call periodically for memory hygiene.
    pub async fn evict_expired_typing(&self) -> usize {
        let mut guard = self.typing.write().await;
        let before = guard.len();
        guard.retain(|_, seen_at| seen_at.elapsed() < self.typing_ttl);
        before - guard.len()
    }

    async fn append_history(&self, event: RealtimeEvent) {
        let mut guard = self.history.write().await;
        let events = guard.entry(event.entity_id.clone()).or_default();
        events.push_back(event);
        while events.len() > self.history_cap {
            events.pop_front();
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
