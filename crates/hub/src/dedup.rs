// Message id deduplication for at-least-once delivery.
//
// Clients may redeliver frames after a reconnect. The hub remembers the ack
// it sent for every processed envelope id for a TTL window; a duplicate gets
// that ack replayed with the `duplicate` flag set instead of being processed
// twice.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tandem_common::protocol::ws::AckPayload;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default TTL for remembered message ids.
const DEFAULT_TTL: Duration = Duration::from_secs(600); // 10 minutes

/// In-memory store of processed envelope ids and their acks.
#[derive(Debug, Clone)]
pub struct DedupStore {
    entries: Arc<RwLock<HashMap<Uuid, DedupEntry>>>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct DedupEntry {
    ack: AckPayload,
    created_at: Instant,
}

impl DedupStore {
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), ttl: DEFAULT_TTL }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The ack originally sent for this id, unless expired.
    pub async fn stored_ack(&self, id: Uuid) -> Option<AckPayload> {
        let guard = self.entries.read().await;
        guard.get(&id).and_then(|entry| {
            if entry.created_at.elapsed() < self.ttl {
                Some(entry.ack.clone())
            } else {
                None
            }
        })
    }

    /// Record a processed id with the ack that was sent for it.
    pub async fn record(&self, id: Uuid, ack: AckPayload) {
        let mut guard = self.entries.write().await;
        guard.insert(id, DedupEntry { ack, created_at: Instant::now() });
    }

    /// Remove expired entries. Call periodically for memory hygiene.
    pub async fn evict_expired(&self) -> usize {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        before - guard.len()
    }

    /// Number of remembered ids (including potentially expired).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no ids are remembered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ack(acked_id: Uuid) -> AckPayload {
        AckPayload { server_version: Some(3), ..AckPayload::applied(acked_id) }
    }

    #[tokio::test]
    async fn unknown_id_has_no_stored_ack() {
        let store = DedupStore::new();
        assert!(store.stored_ack(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn recorded_id_replays_its_ack() {
        let store = DedupStore::new();
        let id = Uuid::new_v4();
        store.record(id, sample_ack(id)).await;

        let replay = store.stored_ack(id).await.expect("ack should be stored");
        assert_eq!(replay.acked_id, id);
        assert_eq!(replay.server_version, Some(3));
        assert!(replay.applied);
    }

    #[tokio::test]
    async fn rerecording_overwrites_the_ack() {
        let store = DedupStore::new();
        let id = Uuid::new_v4();
        store.record(id, sample_ack(id)).await;
        store.record(id, AckPayload::applied(id)).await;

        let replay = store.stored_ack(id).await.expect("ack should be stored");
        assert_eq!(replay.server_version, None);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn expired_entries_stop_matching() {
        let store = DedupStore::new().with_ttl(Duration::from_millis(1));
        let id = Uuid::new_v4();
        store.record(id, sample_ack(id)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store.stored_ack(id).await.is_none());
    }

    #[tokio::test]
    async fn evict_expired_removes_only_stale_entries() {
        let store = DedupStore::new().with_ttl(Duration::from_millis(20));
        let stale = Uuid::new_v4();
        store.record(stale, sample_ack(stale)).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = Uuid::new_v4();
        store.record(fresh, sample_ack(fresh)).await;

        let evicted = store.evict_expired().await;
        assert_eq!(evicted, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.stored_ack(fresh).await.is_some());
    }

    #[tokio::test]
    async fn len_and_is_empty_track_entries() {
        let store = DedupStore::new();
        assert!(store.is_empty().await);

        let id = Uuid::new_v4();
        store.record(id, sample_ack(id)).await;
        assert_eq!(store.len().await, 1);
        assert!(!store.is_empty().await);
    }
}
