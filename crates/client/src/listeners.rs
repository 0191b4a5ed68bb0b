// Event listener registry with per-type dispatch.
//
// Handlers run in registration order. A panicking handler is caught and
// logged so the remaining handlers still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use tandem_common::types::{EventType, RealtimeEvent};

/// Callback invoked for matching realtime events.
pub type EventHandler = Box<dyn Fn(&RealtimeEvent) + Send>;

/// Opaque registration token; pass it back to `remove` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    handlers: HashMap<EventType, Vec<(ListenerId, EventHandler)>>,
    next_id: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event_type: EventType, handler: EventHandler) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.handlers.entry(event_type).or_default().push((id, handler));
        id
    }

    /// Returns `false` when the id was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        for handlers in self.handlers.values_mut() {
            if let Some(index) = handlers.iter().position(|(handler_id, _)| *handler_id == id) {
                handlers.remove(index);
                return true;
            }
        }
        false
    }

    /// Runs every handler registered for the event's type, in registration
    /// order. Returns how many completed without panicking.
    pub fn dispatch(&self, event: &RealtimeEvent) -> usize {
        let Some(handlers) = self.handlers.get(&event.kind) else {
            return 0;
        };
        let mut completed = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => completed += 1,
                Err(_) => {
                    warn!(listener = id.0, kind = ?event.kind, "event listener panicked");
                }
            }
        }
        completed
    }

    pub fn listener_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use tandem_common::types::EntityType;
    use uuid::Uuid;

    fn event(kind: EventType) -> RealtimeEvent {
        RealtimeEvent {
            id: Uuid::new_v4(),
            kind,
            entity_type: EntityType::Task,
            entity_id: "t-1".into(),
            user_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    fn recording_handler(calls: &Arc<Mutex<Vec<u32>>>, tag: u32) -> EventHandler {
        let calls = calls.clone();
        Box::new(move |_event| calls.lock().unwrap().push(tag))
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.add(EventType::EntityUpdated, recording_handler(&calls, 1));
        registry.add(EventType::EntityUpdated, recording_handler(&calls, 2));
        registry.add(EventType::EntityUpdated, recording_handler(&calls, 3));

        let completed = registry.dispatch(&event(EventType::EntityUpdated));

        assert_eq!(completed, 3);
        assert_eq!(*calls.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn dispatch_only_hits_the_matching_type() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.add(EventType::Typing, recording_handler(&calls, 1));

        assert_eq!(registry.dispatch(&event(EventType::EntityUpdated)), 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_handler_does_not_break_dispatch() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        registry.add(EventType::EntityCreated, Box::new(|_event| panic!("boom")));
        registry.add(EventType::EntityCreated, recording_handler(&calls, 2));

        let completed = registry.dispatch(&event(EventType::EntityCreated));

        assert_eq!(completed, 1, "only the surviving handler counts");
        assert_eq!(*calls.lock().unwrap(), vec![2]);
    }

    #[test]
    fn removed_handler_no_longer_runs() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::new();
        let first = registry.add(EventType::Notification, recording_handler(&calls, 1));
        registry.add(EventType::Notification, recording_handler(&calls, 2));

        assert!(registry.remove(first));
        registry.dispatch(&event(EventType::Notification));

        assert_eq!(*calls.lock().unwrap(), vec![2]);
        assert_eq!(registry.listener_count(), 1);
    }

    #[test]
    fn remove_unknown_id_returns_false() {
        let mut registry = ListenerRegistry::new();
        let id = registry.add(EventType::Typing, Box::new(|_event| {}));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
    }
}
