// WebSocket surface: session registry, hello handshake, frame dispatch, and
// room fan-out. One task per socket; frames destined for other sessions are
// delivered through each session's registered outbound channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use tandem_common::protocol::ws::{
    AckPayload, Envelope, ErrorPayload, HelloAckPayload, HelloPayload, RoomPayload,
};
use tandem_common::types::{
    DocumentOperation, NotificationEvent, PresenceStatus, PresenceUpdate, RealtimeEvent, RoomId,
};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::dedup::DedupStore;
use crate::engine::{ApplyOutcome, CollabEngine};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, HubError};
use crate::presence::PresenceStore;
use crate::protocol;
use crate::router::EventRouter;

/// Interval between server liveness probes, advertised in `hello_ack`.
pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
/// A session that sends no heartbeat for this long is disconnected.
pub(crate) const HEARTBEAT_IDLE_DISCONNECT_MS: u64 = 45_000;
/// Upper bound on a single WebSocket frame.
pub(crate) const MAX_FRAME_BYTES: u32 = 262_144;

/// Shared stores behind the WebSocket routes.
#[derive(Clone)]
pub struct WsState {
    pub config: Arc<HubConfig>,
    pub engine: CollabEngine,
    pub presence: PresenceStore,
    pub events: EventRouter,
    pub registry: SessionRegistry,
    pub dedup: DedupStore,
}

/// Live socket sessions and their room memberships.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionRecord>>>,
}

#[derive(Debug)]
struct SessionRecord {
    user_id: Uuid,
    joined_rooms: HashSet<RoomId>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl SessionRegistry {
    pub async fn register(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        display_name: String,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) {
        debug!(
            session_id = %session_id,
            user_id = %user_id,
            display_name = %display_name,
            "session registered"
        );
        let mut guard = self.sessions.write().await;
        guard.insert(session_id, SessionRecord { user_id, joined_rooms: HashSet::new(), outbound });
    }

    /// Removes the session and returns the rooms it had joined, sorted.
    pub async fn unregister(&self, session_id: Uuid) -> Vec<RoomId> {
        let mut guard = self.sessions.write().await;
        match guard.remove(&session_id) {
            Some(record) => {
                debug!(session_id = %session_id, user_id = %record.user_id, "session unregistered");
                let mut rooms: Vec<RoomId> = record.joined_rooms.into_iter().collect();
                rooms.sort();
                rooms
            }
            None => Vec::new(),
        }
    }

    /// Adds the session to a room. Returns true when the membership is new.
    pub async fn join_room(&self, session_id: Uuid, room: RoomId) -> bool {
        let mut guard = self.sessions.write().await;
        match guard.get_mut(&session_id) {
            Some(record) => record.joined_rooms.insert(room),
            None => false,
        }
    }

    /// Removes the session from a room. Returns true when it was a member.
    pub async fn leave_room(&self, session_id: Uuid, room: &RoomId) -> bool {
        let mut guard = self.sessions.write().await;
        match guard.get_mut(&session_id) {
            Some(record) => record.joined_rooms.remove(room),
            None => false,
        }
    }

    /// Rooms the session has joined, sorted for stable iteration.
    pub async fn rooms_for(&self, session_id: Uuid) -> Vec<RoomId> {
        let guard = self.sessions.read().await;
        let mut rooms: Vec<RoomId> = guard
            .get(&session_id)
            .map(|record| record.joined_rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Sends the envelope to every session joined to `room`. Returns how
    /// many sessions were reached; sessions whose receiver is gone are
    /// skipped.
    pub async fn broadcast_to_room(&self, room: &RoomId, envelope: &Envelope) -> usize {
        self.broadcast_inner(room, envelope, None).await
    }

    /// Broadcast to the room, excluding the originating session.
    pub async fn broadcast_to_room_excluding(
        &self,
        room: &RoomId,
        envelope: &Envelope,
        exclude_session: Uuid,
    ) -> usize {
        self.broadcast_inner(room, envelope, Some(exclude_session)).await
    }

    async fn broadcast_inner(
        &self,
        room: &RoomId,
        envelope: &Envelope,
        exclude_session: Option<Uuid>,
    ) -> usize {
        let mut recipients = Vec::new();
        {
            let guard = self.sessions.read().await;
            for (session_id, record) in guard.iter() {
                if exclude_session == Some(*session_id) {
                    continue;
                }
                if record.joined_rooms.contains(room) {
                    recipients.push(record.outbound.clone());
                }
            }
        }

        let mut sent_count = 0;
        for recipient in recipients {
            if recipient.send(envelope.clone()).is_ok() {
                sent_count += 1;
            }
        }
        sent_count
    }
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    let max_frame = state.config.max_frame_bytes as usize;
    ws.max_frame_size(max_frame).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, socket)).await;
    })
}

async fn handle_socket(state: WsState, mut socket: WebSocket) {
    let session_id = Uuid::new_v4();

    // First frame must be a hello; anything else closes the socket.
    let (user_id, display_name) = match socket.recv().await {
        Some(Ok(Message::Text(raw_frame))) => match serde_json::from_str::<Envelope>(&raw_frame) {
            Ok(Envelope::Hello { payload, .. }) => match validate_hello(&state.config, &payload) {
                Ok(()) => (payload.user_id, payload.display_name),
                Err(error_frame) => {
                    let _ = send_envelope(&mut socket, &error_frame).await;
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            },
            Ok(_) => {
                let _ = send_envelope(&mut socket, &error_frame_for(ErrorCode::HelloRequired)).await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            Err(_) => {
                let _ =
                    send_envelope(&mut socket, &error_frame_for(ErrorCode::InvalidMessage)).await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        },
        _ => return,
    };

    let hello_ack = Envelope::hello_ack(HelloAckPayload {
        session_id,
        server_time: Utc::now(),
        heartbeat_interval_ms: state.config.heartbeat_interval_ms,
        max_frame_bytes: state.config.max_frame_bytes,
    });
    if send_envelope(&mut socket, &hello_ack).await.is_err() {
        return;
    }

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Envelope>();
    state.registry.register(session_id, user_id, display_name.clone(), outbound_sender).await;
    state
        .presence
        .upsert(PresenceUpdate {
            user_id,
            display_name: Some(display_name),
            status: Some(PresenceStatus::Online),
            current_room: None,
            cursor: None,
            last_seen_at: None,
        })
        .await;

    // Heartbeat: the server pings every interval and disconnects the session
    // once the idle budget runs out without a heartbeat frame or pong.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(state.config.heartbeat_interval_ms));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_heartbeat = Instant::now();
    let idle_budget = state.config.heartbeat_idle();

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_heartbeat.elapsed() > idle_budget {
                    warn!(
                        session_id = %session_id,
                        user_id = %user_id,
                        "heartbeat idle budget exhausted, disconnecting"
                    );
                    let _ = send_envelope(&mut socket, &error_frame_for(ErrorCode::HeartbeatTimeout)).await;
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_frame) => {
                        if send_envelope(&mut socket, &outbound_frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_frame)) => {
                        let inbound = match serde_json::from_str::<Envelope>(&raw_frame) {
                            Ok(envelope) => envelope,
                            Err(_) => {
                                if send_envelope(&mut socket, &error_frame_for(ErrorCode::InvalidMessage))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };

                        match inbound {
                            Envelope::Operation { id, payload } => {
                                let handled = handle_operation(&state, user_id, id, payload).await;
                                if send_envelope(&mut socket, &handled.ack).await.is_err() {
                                    break;
                                }
                                if let Some((room, broadcast_frame)) = handled.broadcast {
                                    state
                                        .registry
                                        .broadcast_to_room_excluding(&room, &broadcast_frame, session_id)
                                        .await;
                                }
                            }
                            Envelope::Presence { payload, .. } => {
                                handle_presence(&state, session_id, user_id, payload).await;
                            }
                            Envelope::Join { id, payload } => {
                                let outbound_frames =
                                    handle_join(&state, session_id, user_id, id, payload.room).await;
                                let mut send_failed = false;
                                for frame in outbound_frames {
                                    if send_envelope(&mut socket, &frame).await.is_err() {
                                        send_failed = true;
                                        break;
                                    }
                                }
                                if send_failed {
                                    break;
                                }
                            }
                            Envelope::Leave { id, payload } => {
                                let ack = handle_leave(&state, session_id, user_id, id, payload.room).await;
                                if send_envelope(&mut socket, &ack).await.is_err() {
                                    break;
                                }
                            }
                            Envelope::Heartbeat { id, .. } => {
                                last_heartbeat = Instant::now();
                                state.presence.touch(user_id).await;
                                if send_envelope(&mut socket, &Envelope::ack(AckPayload::applied(id)))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Envelope::Event { id, payload } => {
                                let ack = handle_event(&state, user_id, id, payload).await;
                                if send_envelope(&mut socket, &ack).await.is_err() {
                                    break;
                                }
                            }
                            Envelope::Notification { id, payload } => {
                                let ack = handle_notification(&state, user_id, id, payload).await;
                                if send_envelope(&mut socket, &ack).await.is_err() {
                                    break;
                                }
                            }
                            _ => {
                                if send_envelope(&mut socket, &error_frame_for(ErrorCode::UnsupportedMessage))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_heartbeat = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    disconnect_cleanup(&state, session_id, user_id).await;
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), ()> {
    let encoded = serde_json::to_string(envelope).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

fn error_frame_for(code: ErrorCode) -> Envelope {
    Envelope::error(ErrorPayload {
        code: code.as_str().to_string(),
        message: code.default_message().to_string(),
        retryable: code.retryable(),
    })
}

fn validate_hello(config: &HubConfig, payload: &HelloPayload) -> Result<(), Envelope> {
    if let Err(err) = protocol::require_supported(&payload.protocol_version) {
        return Err(Envelope::error(ErrorPayload {
            code: err.code().as_str().to_string(),
            message: err.message().to_string(),
            retryable: err.code().retryable(),
        }));
    }

    if let Some(expected) = config.shared_token.as_deref() {
        if payload.token.as_deref() != Some(expected) {
            return Err(error_frame_for(ErrorCode::TokenInvalid));
        }
    }

    Ok(())
}

#[derive(Debug)]
struct OperationHandled {
    ack: Envelope,
    broadcast: Option<(RoomId, Envelope)>,
}

/// Applies one operation through the engine. The ack goes back to the
/// sender; the applied operation is broadcast to the document's room. A
/// redelivered envelope id replays the original ack instead of applying
/// twice.
async fn handle_operation(
    state: &WsState,
    user_id: Uuid,
    envelope_id: Uuid,
    mut op: DocumentOperation,
) -> OperationHandled {
    if let Some(mut stored) = state.dedup.stored_ack(envelope_id).await {
        stored.duplicate = true;
        return OperationHandled { ack: Envelope::ack(stored), broadcast: None };
    }

    // The session, not the payload, decides who authored the edit.
    op.user_id = user_id;

    let document_id = op.document_id;
    let (ack, broadcast) = match state.engine.apply_operation(document_id, op).await {
        Ok(outcome) => {
            let ApplyOutcome { operation, conflict, document } = outcome;
            let room = document.room();
            let ack = AckPayload {
                conflict,
                server_version: operation.server_version,
                document: conflict.then_some(document),
                ..AckPayload::applied(envelope_id)
            };
            (ack, Some((room, Envelope::operation(operation))))
        }
        Err(err) => {
            let err = HubError::from(err);
            let ack = AckPayload::rejected(
                envelope_id,
                err.code().as_str(),
                err.message(),
                err.code().retryable(),
            );
            (ack, None)
        }
    };

    state.dedup.record(envelope_id, ack.clone()).await;
    OperationHandled { ack: Envelope::ack(ack), broadcast }
}

/// Merges a partial presence update and rebroadcasts the full entry to
/// every room the session has joined. Fire-and-forget: never acked.
async fn handle_presence(
    state: &WsState,
    session_id: Uuid,
    user_id: Uuid,
    mut update: PresenceUpdate,
) -> usize {
    update.user_id = user_id;
    let entry = state.presence.upsert(update).await;

    let frame = Envelope::presence(PresenceUpdate::from(entry));
    let mut reached = 0;
    for room in state.registry.rooms_for(session_id).await {
        reached += state.registry.broadcast_to_room_excluding(&room, &frame, session_id).await;
    }
    reached
}

/// Handles a join: membership, presence placement, and an announce to the
/// room. Returns the frames for the joining session, ack first, then the
/// entity's recent history most-recent-last.
async fn handle_join(
    state: &WsState,
    session_id: Uuid,
    user_id: Uuid,
    envelope_id: Uuid,
    room: RoomId,
) -> Vec<Envelope> {
    let newly_joined = state.registry.join_room(session_id, room.clone()).await;
    state
        .presence
        .upsert(PresenceUpdate {
            user_id,
            display_name: None,
            status: None,
            current_room: Some(room.clone()),
            cursor: None,
            last_seen_at: None,
        })
        .await;

    if newly_joined {
        let announce = Envelope::join(RoomPayload { room: room.clone(), user_id: Some(user_id) });
        state.registry.broadcast_to_room_excluding(&room, &announce, session_id).await;
    }

    let mut outbound = vec![Envelope::ack(AckPayload::applied(envelope_id))];
    if let Some((_, entity_id)) = room.parse() {
        let replay =
            state.events.get_event_history(entity_id, state.config.event_history_cap).await;
        outbound.extend(replay.into_iter().map(Envelope::event));
    }
    outbound
}

/// Converse of join. Leaving a room the session never joined still acks;
/// the announce only goes out when membership actually changed.
async fn handle_leave(
    state: &WsState,
    session_id: Uuid,
    user_id: Uuid,
    envelope_id: Uuid,
    room: RoomId,
) -> Envelope {
    let removed = state.registry.leave_room(session_id, &room).await;
    state.presence.clear_room(user_id, &room).await;

    if removed {
        let announce = Envelope::leave(RoomPayload { room: room.clone(), user_id: Some(user_id) });
        state.registry.broadcast_to_room_excluding(&room, &announce, session_id).await;
    }

    Envelope::ack(AckPayload::applied(envelope_id))
}

async fn handle_event(
    state: &WsState,
    user_id: Uuid,
    envelope_id: Uuid,
    mut event: RealtimeEvent,
) -> Envelope {
    if let Some(mut stored) = state.dedup.stored_ack(envelope_id).await {
        stored.duplicate = true;
        return Envelope::ack(stored);
    }

    event.user_id = user_id;
    let reached = state.events.publish_event(&state.registry, event).await;
    debug!(envelope_id = %envelope_id, reached, "event published");

    let ack = AckPayload::applied(envelope_id);
    state.dedup.record(envelope_id, ack.clone()).await;
    Envelope::ack(ack)
}

async fn handle_notification(
    state: &WsState,
    user_id: Uuid,
    envelope_id: Uuid,
    mut notification: NotificationEvent,
) -> Envelope {
    if let Some(mut stored) = state.dedup.stored_ack(envelope_id).await {
        stored.duplicate = true;
        return Envelope::ack(stored);
    }

    notification.sender_id = user_id;
    let reached = state.events.publish_notification(&state.registry, notification).await;
    debug!(envelope_id = %envelope_id, reached, "notification published");

    let ack = AckPayload::applied(envelope_id);
    state.dedup.record(envelope_id, ack.clone()).await;
    Envelope::ack(ack)
}

/// Tears down a closed session: membership, presence, and an offline
/// broadcast to every room the session had joined.
async fn disconnect_cleanup(state: &WsState, session_id: Uuid, user_id: Uuid) {
    let rooms = state.registry.unregister(session_id).await;

    for room in &rooms {
        state.presence.clear_room(user_id, room).await;
    }
    let Some(entry) = state.presence.mark_offline(user_id).await else {
        return;
    };

    let frame = Envelope::presence(PresenceUpdate::from(entry));
    for room in &rooms {
        state.registry.broadcast_to_room(room, &frame).await;
    }
    debug!(session_id = %session_id, user_id = %user_id, rooms = rooms.len(), "session disconnected");
}
