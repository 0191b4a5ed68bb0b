// Connection manager: single-owner client state machine over an injectable
// transport.
//
// Owns room membership, the deferred outbound queue, heartbeat liveness, and
// capped-backoff reconnection. All timing flows through explicit `Instant`
// parameters so the machine is deterministic under test; the async driver in
// `driver` pumps it with wall-clock time.
//
// Transport is abstracted via `Transport` for testability. The actual
// WebSocket transport lives with the embedding application.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use tandem_common::protocol::ws::{
    AckPayload, Envelope, HeartbeatPayload, HelloPayload, RoomPayload, CURRENT_PROTOCOL_VERSION,
};
use tandem_common::types::{
    DocumentOperation, EventType, NotificationEvent, PresenceUpdate, RealtimeEvent, RoomId,
};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::dedup::SeenIds;
use crate::listeners::{EventHandler, ListenerId, ListenerRegistry};
use crate::queue::{OutboundQueue, QueueOverflow};

/// How long the client waits for a heartbeat ack before treating the link as
/// dead. Matches `client_heartbeat_timeout_ms` in the wire contract.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

/// Ping cadence used until `hello_ack` advertises the real one.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// How long `connect` waits for the `hello_ack`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

// ── Transport trait ─────────────────────────────────────────────────

/// What a `recv` poll produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    Frame(Envelope),
    Empty,
    Closed,
}

/// Abstraction over the network transport for testability.
///
/// In production this wraps a WebSocket client; in tests it is a script of
/// canned frames.
pub trait Transport {
    /// Open the link described by the config.
    fn open(&mut self, config: &ClientConfig) -> Result<()>;

    /// Transmit one frame.
    fn send(&mut self, frame: &Envelope) -> Result<()>;

    /// Wait up to `timeout` for the next frame.
    fn recv(&mut self, timeout: Duration) -> Result<Polled>;

    /// Tear the link down.
    fn close(&mut self);
}

// ── Connection state ────────────────────────────────────────────────

/// Current state of the hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

// ── Caller-facing outcomes ──────────────────────────────────────────

/// Handshake or reconnect failure surfaced to the caller.
#[derive(Debug)]
pub struct ConnectionError {
    message: String,
    /// Set when the reconnect attempt ceiling is exhausted.
    pub terminal: bool,
}

impl ConnectionError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), terminal: false }
    }

    fn terminal(message: impl Into<String>) -> Self {
        Self { message: message.into(), terminal: true }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConnectionError {}

/// What a successful `connect` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSummary {
    pub session_id: Uuid,
    pub rejoined_rooms: usize,
    pub flushed_messages: usize,
}

/// Outcome of `send`.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmitted on the live connection.
    Sent,
    /// Deferred until the next successful connect.
    Queued { overflow: Option<QueueOverflow> },
}

/// Outcome of one `heartbeat_tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// Nothing to do: not connected, not due, or a ping is in flight.
    Idle,
    Sent,
    /// The pending ping was never acked; the link is considered lost.
    TimedOut,
    /// The ping could not be written; the link is considered lost.
    SendFailed,
}

/// Outcome of one `reconnect_tick`.
#[derive(Debug)]
pub enum ReconnectTick {
    /// Nothing scheduled.
    Idle,
    /// Scheduled but not due yet.
    NotDue,
    /// The scheduled attempt belonged to a superseded generation.
    Stale,
    Connected(ConnectSummary),
    Rescheduled { attempt: u32, delay: Duration },
    /// Attempt ceiling exhausted; reconnection stops.
    GaveUp(ConnectionError),
}

/// Facts surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { session_id: Uuid },
    Disconnected { reason: String },
    Ack(AckPayload),
    RemoteOperation(DocumentOperation),
    Presence(PresenceUpdate),
    PeerJoined { room: RoomId, user_id: Uuid },
    PeerLeft { room: RoomId, user_id: Uuid },
    Event(RealtimeEvent),
    Notification(NotificationEvent),
    ProtocolError { code: String, message: String, retryable: bool },
}

// ── Connection manager ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PendingHeartbeat {
    id: Uuid,
    sent_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PendingReconnect {
    due_at: Instant,
    generation: u64,
}

pub struct ConnectionManager<T: Transport> {
    config: ClientConfig,
    transport: T,
    state: ConnectionState,
    session_id: Option<Uuid>,
    /// Bumped by `connect` and `disconnect`; completions tagged with an older
    /// generation are discarded.
    generation: u64,
    joined_rooms: Vec<RoomId>,
    queue: OutboundQueue,
    seen: SeenIds,
    listeners: ListenerRegistry,
    heartbeat_interval: Duration,
    last_heartbeat_at: Option<Instant>,
    pending_heartbeat: Option<PendingHeartbeat>,
    pending_reconnect: Option<PendingReconnect>,
    consecutive_failures: u32,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(config: ClientConfig, transport: T) -> Self {
        let queue = OutboundQueue::with_capacity(config.queue_capacity);
        Self {
            config,
            transport,
            state: ConnectionState::Disconnected,
            session_id: None,
            generation: 0,
            joined_rooms: Vec::new(),
            queue,
            seen: SeenIds::new(),
            listeners: ListenerRegistry::new(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            last_heartbeat_at: None,
            pending_heartbeat: None,
            pending_reconnect: None,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn joined_rooms(&self) -> &[RoomId] {
        &self.joined_rooms
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Dial the hub and run the hello handshake. On success, membership is
    /// replayed and the deferred queue flushed in original order.
    ///
    /// Any existing link is torn down first. Failure leaves the machine
    /// `Disconnected`; the caller may retry or schedule a reconnect.
    pub fn connect(&mut self) -> Result<ConnectSummary, ConnectionError> {
        validate_hub_url(&self.config.hub_url)?;
        self.generation += 1;
        self.pending_reconnect = None;
        self.transport.close();
        self.state = ConnectionState::Connecting;

        if let Err(error) = self.transport.open(&self.config) {
            return Err(self.connect_failed(format!("transport open failed: {error}")));
        }

        let hello = Envelope::hello(HelloPayload {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            user_id: self.config.user_id,
            display_name: self.config.display_name.clone(),
            token: self.config.token.clone(),
        });
        if let Err(error) = self.transport.send(&hello) {
            self.transport.close();
            return Err(self.connect_failed(format!("failed to send hello: {error}")));
        }

        let session_id = match self.transport.recv(HANDSHAKE_TIMEOUT) {
            Ok(Polled::Frame(Envelope::HelloAck { payload, .. })) => {
                self.heartbeat_interval = Duration::from_millis(payload.heartbeat_interval_ms);
                payload.session_id
            }
            Ok(Polled::Frame(Envelope::Error { payload, .. })) => {
                self.transport.close();
                return Err(self.connect_failed(format!(
                    "handshake rejected: {}: {}",
                    payload.code, payload.message
                )));
            }
            Ok(Polled::Frame(other)) => {
                self.transport.close();
                return Err(self.connect_failed(format!(
                    "unexpected `{}` frame in response to hello",
                    other.type_name()
                )));
            }
            Ok(Polled::Empty) => {
                self.transport.close();
                return Err(self.connect_failed("handshake timed out".to_string()));
            }
            Ok(Polled::Closed) => {
                return Err(self.connect_failed("connection closed during handshake".to_string()));
            }
            Err(error) => {
                self.transport.close();
                return Err(self.connect_failed(format!("handshake recv failed: {error}")));
            }
        };

        self.state = ConnectionState::Connected;
        self.session_id = Some(session_id);
        self.consecutive_failures = 0;
        self.pending_heartbeat = None;
        self.last_heartbeat_at = None;

        let rejoined_rooms = self.rejoin_rooms()?;
        let flushed_messages = self.flush_queue()?;
        info!(
            session_id = %session_id,
            rejoined_rooms,
            flushed_messages,
            "connected to hub"
        );
        Ok(ConnectSummary { session_id, rejoined_rooms, flushed_messages })
    }

    /// Explicit, user-initiated teardown. Clears the deferred queue and
    /// cancels any scheduled reconnect; nothing fires after this returns.
    /// Room membership survives for the next `connect`.
    pub fn disconnect(&mut self) {
        self.generation += 1;
        self.pending_reconnect = None;
        self.pending_heartbeat = None;
        self.last_heartbeat_at = None;
        self.queue.clear();
        self.session_id = None;
        self.transport.close();
        self.state = ConnectionState::Disconnected;
        debug!("disconnected by caller");
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Transmit now if connected, otherwise defer. A frame that fails to
    /// write is queued rather than lost, and the link is marked lost.
    pub fn send(&mut self, frame: Envelope) -> SendOutcome {
        if self.state == ConnectionState::Connected {
            match self.transport.send(&frame) {
                Ok(()) => return SendOutcome::Sent,
                Err(error) => self.mark_link_lost(&format!("send failed: {error}")),
            }
        }
        let overflow = self.queue.push(frame);
        if let Some(warning) = &overflow {
            warn!(%warning, "outbound queue overflowed");
        }
        SendOutcome::Queued { overflow }
    }

    /// Idempotent membership add. Newly added rooms are announced on the live
    /// connection immediately and replayed on every reconnect.
    pub fn join_room(&mut self, room: RoomId) -> bool {
        if self.joined_rooms.contains(&room) {
            return false;
        }
        self.joined_rooms.push(room.clone());
        if self.state == ConnectionState::Connected {
            let frame = Envelope::join(RoomPayload { room, user_id: None });
            if let Err(error) = self.transport.send(&frame) {
                self.mark_link_lost(&format!("join send failed: {error}"));
            }
        }
        true
    }

    /// Idempotent membership remove.
    pub fn leave_room(&mut self, room: &RoomId) -> bool {
        let Some(index) = self.joined_rooms.iter().position(|r| r == room) else {
            return false;
        };
        self.joined_rooms.remove(index);
        if self.state == ConnectionState::Connected {
            let frame = Envelope::leave(RoomPayload { room: room.clone(), user_id: None });
            if let Err(error) = self.transport.send(&frame) {
                self.mark_link_lost(&format!("leave send failed: {error}"));
            }
        }
        true
    }

    // ── Listeners ───────────────────────────────────────────────────

    pub fn add_event_listener(&mut self, event_type: EventType, handler: EventHandler) -> ListenerId {
        self.listeners.add(event_type, handler)
    }

    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // ── Incoming ────────────────────────────────────────────────────

    /// Pump one incoming frame into a `ClientEvent`, if one is ready.
    ///
    /// Duplicate fact ids are dropped, heartbeat acks are consumed
    /// internally, and registered listeners run before the event is returned.
    pub fn poll_event(&mut self, timeout: Duration) -> Option<ClientEvent> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let polled = match self.transport.recv(timeout) {
            Ok(polled) => polled,
            Err(error) => {
                let reason = format!("recv failed: {error}");
                self.mark_link_lost(&reason);
                return Some(ClientEvent::Disconnected { reason });
            }
        };
        match polled {
            Polled::Empty => None,
            Polled::Closed => {
                self.mark_link_lost("connection closed by hub");
                Some(ClientEvent::Disconnected {
                    reason: "connection closed by hub".to_string(),
                })
            }
            Polled::Frame(frame) => self.translate(frame),
        }
    }

    fn translate(&mut self, frame: Envelope) -> Option<ClientEvent> {
        match frame {
            Envelope::Operation { payload, .. } => {
                if !self.seen.insert(payload.id) {
                    debug!(operation_id = %payload.id, "dropped duplicate operation");
                    return None;
                }
                Some(ClientEvent::RemoteOperation(payload))
            }
            // Presence has no fact id of its own; dedup on the envelope.
            Envelope::Presence { id, payload } => {
                if !self.seen.insert(id) {
                    return None;
                }
                Some(ClientEvent::Presence(payload))
            }
            Envelope::Join { payload, .. } => {
                let RoomPayload { room, user_id: Some(user_id) } = payload else {
                    debug!("join announce without a user id dropped");
                    return None;
                };
                Some(ClientEvent::PeerJoined { room, user_id })
            }
            Envelope::Leave { payload, .. } => {
                let RoomPayload { room, user_id: Some(user_id) } = payload else {
                    debug!("leave announce without a user id dropped");
                    return None;
                };
                Some(ClientEvent::PeerLeft { room, user_id })
            }
            Envelope::Event { payload, .. } => {
                if !self.seen.insert(payload.id) {
                    debug!(event_id = %payload.id, "dropped duplicate event");
                    return None;
                }
                let handled = self.listeners.dispatch(&payload);
                debug!(event_id = %payload.id, kind = ?payload.kind, handled, "event dispatched");
                Some(ClientEvent::Event(payload))
            }
            Envelope::Notification { payload, .. } => {
                if !self.seen.insert(payload.id) {
                    return None;
                }
                Some(ClientEvent::Notification(payload))
            }
            Envelope::Ack { payload, .. } => {
                if self.pending_heartbeat.as_ref().is_some_and(|p| p.id == payload.acked_id) {
                    self.pending_heartbeat = None;
                    return None;
                }
                Some(ClientEvent::Ack(payload))
            }
            Envelope::Error { payload, .. } => {
                warn!(code = %payload.code, message = %payload.message, "protocol error from hub");
                Some(ClientEvent::ProtocolError {
                    code: payload.code,
                    message: payload.message,
                    retryable: payload.retryable,
                })
            }
            other => {
                debug!(frame = other.type_name(), "ignoring unexpected frame");
                None
            }
        }
    }

    // ── Heartbeat ───────────────────────────────────────────────────

    /// Drive the liveness ping. Call regularly with the current instant; all
    /// interval arithmetic uses the instants passed in, never the wall clock.
    pub fn heartbeat_tick(&mut self, now: Instant) -> HeartbeatTick {
        if self.state != ConnectionState::Connected {
            return HeartbeatTick::Idle;
        }
        if let Some(pending) = self.pending_heartbeat {
            if now.duration_since(pending.sent_at) >= Duration::from_millis(HEARTBEAT_TIMEOUT_MS) {
                self.mark_link_lost("heartbeat ack timed out");
                return HeartbeatTick::TimedOut;
            }
            return HeartbeatTick::Idle;
        }
        let due = match self.last_heartbeat_at {
            None => true,
            Some(at) => now.duration_since(at) >= self.heartbeat_interval,
        };
        if !due {
            return HeartbeatTick::Idle;
        }
        let frame = Envelope::heartbeat(HeartbeatPayload { sent_at: Utc::now() });
        let id = frame.id();
        match self.transport.send(&frame) {
            Ok(()) => {
                self.last_heartbeat_at = Some(now);
                self.pending_heartbeat = Some(PendingHeartbeat { id, sent_at: now });
                HeartbeatTick::Sent
            }
            Err(error) => {
                self.mark_link_lost(&format!("heartbeat send failed: {error}"));
                HeartbeatTick::SendFailed
            }
        }
    }

    // ── Reconnection ────────────────────────────────────────────────

    /// Arm the next reconnect attempt `backoff(failures)` from `now`. The
    /// attempt is pinned to the current generation; `disconnect` or an
    /// explicit `connect` supersedes it.
    pub fn schedule_reconnect(&mut self, now: Instant) -> Duration {
        let delay = backoff_delay(&self.config.reconnect, self.consecutive_failures);
        self.pending_reconnect =
            Some(PendingReconnect { due_at: now + delay, generation: self.generation });
        self.state = ConnectionState::Reconnecting;
        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.consecutive_failures,
            "reconnect scheduled"
        );
        delay
    }

    /// Fire the scheduled reconnect once due. A failed attempt is
    /// rescheduled with the next backoff step until the ceiling is reached.
    pub fn reconnect_tick(&mut self, now: Instant) -> ReconnectTick {
        let Some(pending) = self.pending_reconnect else {
            return ReconnectTick::Idle;
        };
        if pending.generation != self.generation {
            self.pending_reconnect = None;
            debug!("discarding reconnect scheduled under a superseded generation");
            return ReconnectTick::Stale;
        }
        if now < pending.due_at {
            return ReconnectTick::NotDue;
        }
        self.pending_reconnect = None;
        if self.consecutive_failures >= self.config.reconnect.max_attempts {
            self.state = ConnectionState::Disconnected;
            return ReconnectTick::GaveUp(ConnectionError::terminal(format!(
                "reconnect abandoned after {} failed attempts",
                self.consecutive_failures
            )));
        }
        match self.connect() {
            Ok(summary) => ReconnectTick::Connected(summary),
            Err(error) => {
                if self.consecutive_failures >= self.config.reconnect.max_attempts {
                    self.state = ConnectionState::Disconnected;
                    return ReconnectTick::GaveUp(ConnectionError::terminal(format!(
                        "reconnect abandoned after {} failed attempts: {error}",
                        self.consecutive_failures
                    )));
                }
                let delay = self.schedule_reconnect(now);
                ReconnectTick::Rescheduled { attempt: self.consecutive_failures, delay }
            }
        }
    }

    // ── Internal ────────────────────────────────────────────────────

    fn connect_failed(&mut self, message: String) -> ConnectionError {
        self.state = ConnectionState::Disconnected;
        self.session_id = None;
        self.consecutive_failures += 1;
        warn!(failures = self.consecutive_failures, reason = %message, "connect attempt failed");
        ConnectionError::new(message)
    }

    /// Implicit failure: the socket died under us. Queue and membership
    /// survive; the driver schedules the reconnect.
    fn mark_link_lost(&mut self, reason: &str) {
        warn!(reason, "connection lost");
        self.transport.close();
        self.session_id = None;
        self.pending_heartbeat = None;
        self.last_heartbeat_at = None;
        self.state = ConnectionState::Reconnecting;
    }

    fn rejoin_rooms(&mut self) -> Result<usize, ConnectionError> {
        for room in self.joined_rooms.clone() {
            let frame = Envelope::join(RoomPayload { room: room.clone(), user_id: None });
            if let Err(error) = self.transport.send(&frame) {
                self.transport.close();
                return Err(self.connect_failed(format!("rejoin of {room} failed: {error}")));
            }
        }
        Ok(self.joined_rooms.len())
    }

    fn flush_queue(&mut self) -> Result<usize, ConnectionError> {
        let mut flushed = 0;
        while let Some(frame) = self.queue.pop() {
            if let Err(error) = self.transport.send(&frame) {
                // Keep original order for the next attempt.
                self.queue.requeue_front(frame);
                self.transport.close();
                return Err(self.connect_failed(format!("queue flush failed: {error}")));
            }
            flushed += 1;
        }
        Ok(flushed)
    }
}

/// Capped exponential backoff with 0-25% jitter.
fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exp = attempt.min(7);
    let capped = policy.base_delay.saturating_mul(1 << exp).min(policy.max_delay);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter_ms)
}

fn validate_hub_url(value: &str) -> Result<(), ConnectionError> {
    let parsed = Url::parse(value)
        .map_err(|error| ConnectionError::new(format!("invalid hub_url `{value}`: {error}")))?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(ConnectionError::new(
            "hub_url must use wss (ws is allowed only for localhost testing)",
        )),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use anyhow::bail;
    use tandem_common::protocol::ws::{AckError, ErrorPayload, HelloAckPayload};
    use tandem_common::types::{EntityType, OperationKind, PresenceStatus};

    const CONTRACT: &str = include_str!("../../../contracts/ws-protocol.json");

    // ── Mock transport ──────────────────────────────────────────────

    #[derive(Debug, Default)]
    struct MockTransport {
        /// Responses returned by recv() in order; `Empty` once exhausted.
        recv_queue: VecDeque<Polled>,
        /// Frames sent via send().
        sent: Vec<Envelope>,
        open_calls: u32,
        closed: bool,
        /// If set, open() returns this error.
        open_error: Option<String>,
        /// Fail every send once this many frames have been sent.
        fail_sends_from: Option<usize>,
    }

    impl MockTransport {
        fn with_hello_ack() -> Self {
            let mut transport = Self::default();
            transport.queue_frame(hello_ack(15_000));
            transport
        }

        fn failing_open(message: &str) -> Self {
            Self { open_error: Some(message.to_string()), ..Self::default() }
        }

        fn queue_frame(&mut self, frame: Envelope) {
            self.recv_queue.push_back(Polled::Frame(frame));
        }

        fn queue_close(&mut self) {
            self.recv_queue.push_back(Polled::Closed);
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self, _config: &ClientConfig) -> Result<()> {
            self.open_calls += 1;
            if let Some(error) = &self.open_error {
                bail!("{error}");
            }
            self.closed = false;
            Ok(())
        }

        fn send(&mut self, frame: &Envelope) -> Result<()> {
            if self.fail_sends_from.is_some_and(|from| self.sent.len() >= from) {
                bail!("socket write failed");
            }
            self.sent.push(frame.clone());
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Polled> {
            Ok(self.recv_queue.pop_front().unwrap_or(Polled::Empty))
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn test_config() -> ClientConfig {
        ClientConfig {
            hub_url: "wss://hub.test/v1/ws".to_string(),
            user_id: Uuid::new_v4(),
            display_name: "Dana".to_string(),
            token: Some("sekret".to_string()),
            queue_capacity: 8,
            reconnect: ReconnectPolicy::default(),
        }
    }

    fn hello_ack(heartbeat_interval_ms: u64) -> Envelope {
        Envelope::hello_ack(HelloAckPayload {
            session_id: Uuid::new_v4(),
            server_time: Utc::now(),
            heartbeat_interval_ms,
            max_frame_bytes: 262_144,
        })
    }

    fn op_frame() -> Envelope {
        Envelope::operation(DocumentOperation {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: OperationKind::Insert,
            position: 0,
            payload: "x".into(),
            length: 0,
            base_version: 0,
            server_version: None,
        })
    }

    fn connected_manager() -> ConnectionManager<MockTransport> {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::with_hello_ack());
        manager.connect().expect("connect");
        manager
    }

    fn task_room(id: &str) -> RoomId {
        RoomId::new(EntityType::Task, id)
    }

    fn unjittered_backoff(policy: &ReconnectPolicy, attempt: u32) -> Duration {
        policy.base_delay.saturating_mul(1 << attempt.min(7)).min(policy.max_delay)
    }

    fn assert_backoff_range(delay: Duration, expected: Duration) {
        assert!(delay >= expected, "delay {delay:?} below un-jittered base {expected:?}");
        assert!(delay <= expected + expected / 4, "delay {delay:?} above jitter ceiling");
    }

    // ── Connect ─────────────────────────────────────────────────────

    #[test]
    fn connect_happy_path() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::with_hello_ack());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let summary = manager.connect().expect("connect should succeed");
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.session_id(), Some(summary.session_id));
        assert_eq!(summary.rejoined_rooms, 0);
        assert_eq!(summary.flushed_messages, 0);
    }

    #[test]
    fn connect_sends_hello_first() {
        let manager = connected_manager();
        match &manager.transport.sent[0] {
            Envelope::Hello { payload, .. } => {
                assert_eq!(payload.protocol_version, CURRENT_PROTOCOL_VERSION);
                assert_eq!(payload.display_name, "Dana");
                assert_eq!(payload.token.as_deref(), Some("sekret"));
            }
            other => panic!("first frame should be hello, got {}", other.type_name()),
        }
    }

    #[test]
    fn connect_rejects_non_tls_hub_url() {
        let mut config = test_config();
        config.hub_url = "ws://hub.example.com/v1/ws".to_string();
        let mut manager = ConnectionManager::new(config, MockTransport::with_hello_ack());

        let error = manager.connect().expect_err("insecure url must be rejected");
        assert!(error.to_string().contains("must use wss"));
        assert_eq!(manager.transport.open_calls, 0, "no dial before validation");
    }

    #[test]
    fn connect_allows_plain_ws_for_loopback() {
        for host in ["ws://localhost:8080/v1/ws", "ws://127.0.0.1:8080/v1/ws"] {
            let mut config = test_config();
            config.hub_url = host.to_string();
            let mut manager = ConnectionManager::new(config, MockTransport::with_hello_ack());
            manager.connect().expect("loopback ws should be accepted");
        }
    }

    #[test]
    fn connect_fails_on_error_frame() {
        let mut transport = MockTransport::default();
        transport.queue_frame(Envelope::error(ErrorPayload {
            code: "TOKEN_INVALID".to_string(),
            message: "auth token rejected".to_string(),
            retryable: false,
        }));
        let mut manager = ConnectionManager::new(test_config(), transport);

        let error = manager.connect().expect_err("rejected handshake");
        assert!(error.to_string().contains("TOKEN_INVALID"));
        assert!(!error.terminal);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.consecutive_failures, 1);
    }

    #[test]
    fn connect_fails_when_closed_during_handshake() {
        let mut transport = MockTransport::default();
        transport.queue_close();
        let mut manager = ConnectionManager::new(test_config(), transport);

        let error = manager.connect().expect_err("close during handshake");
        assert!(error.to_string().contains("closed"));
    }

    #[test]
    fn connect_fails_when_hello_ack_never_arrives() {
        // recv_queue empty -> Empty, which the handshake treats as a timeout.
        let mut manager = ConnectionManager::new(test_config(), MockTransport::default());
        let error = manager.connect().expect_err("no hello_ack");
        assert!(error.to_string().contains("timed out"));
    }

    #[test]
    fn rejoin_failure_clears_the_session_id() {
        // The handshake succeeds; the join replay right after it does not.
        let mut transport = MockTransport::with_hello_ack();
        transport.fail_sends_from = Some(1);
        let mut manager = ConnectionManager::new(test_config(), transport);
        manager.join_room(task_room("t-1"));

        let error = manager.connect().expect_err("join replay fails");
        assert!(error.to_string().contains("rejoin"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.session_id().is_none(), "no session survives a failed connect");
    }

    #[test]
    fn connect_adopts_advertised_heartbeat_interval() {
        let mut transport = MockTransport::default();
        transport.queue_frame(hello_ack(5_000));
        let mut manager = ConnectionManager::new(test_config(), transport);
        manager.connect().expect("connect");
        assert_eq!(manager.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn connect_rejoins_rooms_and_flushes_queue_in_order() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::with_hello_ack());
        manager.join_room(task_room("t-1"));
        manager.join_room(task_room("t-2"));
        let first = op_frame();
        let second = op_frame();
        manager.send(first.clone());
        manager.send(second.clone());
        assert!(manager.transport.sent.is_empty(), "nothing goes out while disconnected");

        let summary = manager.connect().expect("connect");
        assert_eq!(summary.rejoined_rooms, 2);
        assert_eq!(summary.flushed_messages, 2);

        let sent = &manager.transport.sent;
        assert_eq!(sent.len(), 5, "hello, two joins, two flushed frames");
        assert!(matches!(sent[0], Envelope::Hello { .. }));
        match (&sent[1], &sent[2]) {
            (Envelope::Join { payload: a, .. }, Envelope::Join { payload: b, .. }) => {
                assert_eq!(a.room.as_str(), "task:t-1");
                assert_eq!(b.room.as_str(), "task:t-2");
            }
            _ => panic!("rooms must be rejoined before the flush"),
        }
        assert_eq!(sent[3].id(), first.id());
        assert_eq!(sent[4].id(), second.id());
    }

    // ── Send & queue ────────────────────────────────────────────────

    #[test]
    fn send_while_connected_transmits() {
        let mut manager = connected_manager();
        let outcome = manager.send(op_frame());
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(manager.queued_messages(), 0);
    }

    #[test]
    fn send_while_disconnected_queues() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::default());
        let outcome = manager.send(op_frame());
        assert_eq!(outcome, SendOutcome::Queued { overflow: None });
        assert_eq!(manager.queued_messages(), 1);
    }

    #[test]
    fn queue_overflow_reports_the_dropped_frame() {
        let mut config = test_config();
        config.queue_capacity = 2;
        let mut manager = ConnectionManager::new(config, MockTransport::default());

        let oldest = op_frame();
        manager.send(oldest.clone());
        manager.send(op_frame());
        match manager.send(op_frame()) {
            SendOutcome::Queued { overflow: Some(warning) } => {
                assert_eq!(warning.dropped_id, oldest.id());
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        assert_eq!(manager.queued_messages(), 2);
    }

    #[test]
    fn send_failure_queues_the_frame_and_marks_link_lost() {
        let mut manager = connected_manager();
        manager.transport.fail_sends_from = Some(manager.transport.sent.len());

        let outcome = manager.send(op_frame());

        assert_eq!(outcome, SendOutcome::Queued { overflow: None });
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.queued_messages(), 1);
        assert!(manager.session_id().is_none());
    }

    // ── Rooms ───────────────────────────────────────────────────────

    #[test]
    fn join_room_is_idempotent() {
        let mut manager = connected_manager();
        assert!(manager.join_room(task_room("t-1")));
        assert!(!manager.join_room(task_room("t-1")));

        let joins = manager
            .transport
            .sent
            .iter()
            .filter(|frame| matches!(frame, Envelope::Join { .. }))
            .count();
        assert_eq!(joins, 1, "repeat join must not reannounce");
    }

    #[test]
    fn join_while_disconnected_only_mutates_local_state() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::default());
        assert!(manager.join_room(task_room("t-1")));
        assert!(manager.transport.sent.is_empty());
        assert_eq!(manager.joined_rooms(), &[task_room("t-1")]);
    }

    #[test]
    fn leave_room_removes_and_announces() {
        let mut manager = connected_manager();
        manager.join_room(task_room("t-1"));
        assert!(manager.leave_room(&task_room("t-1")));
        assert!(!manager.leave_room(&task_room("t-1")));
        assert!(manager.joined_rooms().is_empty());

        match manager.transport.sent.last() {
            Some(Envelope::Leave { payload, .. }) => assert_eq!(payload.room.as_str(), "task:t-1"),
            other => panic!("expected a leave frame, got {other:?}"),
        }
    }

    // ── Heartbeat ───────────────────────────────────────────────────

    #[test]
    fn heartbeat_sends_on_interval() {
        let mut manager = connected_manager();
        let t0 = Instant::now();

        // Nothing sent yet, so the first tick pings immediately.
        assert_eq!(manager.heartbeat_tick(t0), HeartbeatTick::Sent);
        assert!(matches!(manager.transport.sent.last(), Some(Envelope::Heartbeat { .. })));

        // In flight: no second ping.
        assert_eq!(manager.heartbeat_tick(t0 + Duration::from_secs(1)), HeartbeatTick::Idle);
    }

    #[test]
    fn heartbeat_ack_is_swallowed_and_clears_the_pending_ping() {
        let mut manager = connected_manager();
        let t0 = Instant::now();
        manager.heartbeat_tick(t0);
        let heartbeat_id = match manager.transport.sent.last() {
            Some(Envelope::Heartbeat { id, .. }) => *id,
            other => panic!("expected heartbeat, got {other:?}"),
        };

        manager.transport.queue_frame(Envelope::ack(AckPayload::applied(heartbeat_id)));
        assert_eq!(manager.poll_event(Duration::ZERO), None, "heartbeat ack is internal");
        assert!(manager.pending_heartbeat.is_none());

        // Acked: the next interval boundary pings again.
        assert_eq!(
            manager.heartbeat_tick(t0 + Duration::from_millis(15_000)),
            HeartbeatTick::Sent
        );
    }

    #[test]
    fn non_heartbeat_acks_still_surface() {
        let mut manager = connected_manager();
        let acked_id = Uuid::new_v4();
        manager.transport.queue_frame(Envelope::ack(AckPayload::applied(acked_id)));

        match manager.poll_event(Duration::ZERO) {
            Some(ClientEvent::Ack(payload)) => assert_eq!(payload.acked_id, acked_id),
            other => panic!("expected ack event, got {other:?}"),
        }
    }

    #[test]
    fn missing_heartbeat_ack_is_an_implicit_disconnect() {
        let mut manager = connected_manager();
        let t0 = Instant::now();
        assert_eq!(manager.heartbeat_tick(t0), HeartbeatTick::Sent);

        let timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
        assert_eq!(manager.heartbeat_tick(t0 + timeout), HeartbeatTick::TimedOut);
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn heartbeat_send_failure_is_an_implicit_disconnect() {
        let mut manager = connected_manager();
        manager.transport.fail_sends_from = Some(manager.transport.sent.len());

        assert_eq!(manager.heartbeat_tick(Instant::now()), HeartbeatTick::SendFailed);
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn heartbeat_is_idle_while_disconnected() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::default());
        assert_eq!(manager.heartbeat_tick(Instant::now()), HeartbeatTick::Idle);
    }

    #[test]
    fn client_heartbeat_timeout_matches_the_contract() {
        let contract: serde_json::Value = serde_json::from_str(CONTRACT).expect("contract parses");
        assert_eq!(
            contract["constants"]["client_heartbeat_timeout_ms"].as_u64(),
            Some(HEARTBEAT_TIMEOUT_MS)
        );
    }

    // ── Poll & dispatch ─────────────────────────────────────────────

    #[test]
    fn poll_translates_remote_operations() {
        let mut manager = connected_manager();
        let frame = op_frame();
        manager.transport.queue_frame(frame.clone());

        match manager.poll_event(Duration::ZERO) {
            Some(ClientEvent::RemoteOperation(op)) => match frame {
                Envelope::Operation { payload, .. } => assert_eq!(op, payload),
                _ => unreachable!(),
            },
            other => panic!("expected operation, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_fact_ids_are_dropped_before_dispatch() {
        let mut manager = connected_manager();
        let op = match op_frame() {
            Envelope::Operation { payload, .. } => payload,
            _ => unreachable!(),
        };
        // Two distinct envelopes redeliver the same fact.
        manager.transport.queue_frame(Envelope::operation(op.clone()));
        manager.transport.queue_frame(Envelope::operation(op));

        assert!(manager.poll_event(Duration::ZERO).is_some());
        assert!(manager.poll_event(Duration::ZERO).is_none(), "redelivery must be dropped");
    }

    #[test]
    fn poll_surfaces_peer_join_and_leave() {
        let mut manager = connected_manager();
        let peer = Uuid::new_v4();
        manager.transport.queue_frame(Envelope::join(RoomPayload {
            room: task_room("t-1"),
            user_id: Some(peer),
        }));
        manager.transport.queue_frame(Envelope::leave(RoomPayload {
            room: task_room("t-1"),
            user_id: Some(peer),
        }));

        assert_eq!(
            manager.poll_event(Duration::ZERO),
            Some(ClientEvent::PeerJoined { room: task_room("t-1"), user_id: peer })
        );
        assert_eq!(
            manager.poll_event(Duration::ZERO),
            Some(ClientEvent::PeerLeft { room: task_room("t-1"), user_id: peer })
        );
    }

    #[test]
    fn poll_surfaces_presence_updates() {
        let mut manager = connected_manager();
        let update = PresenceUpdate {
            user_id: Uuid::new_v4(),
            display_name: Some("Riley".to_string()),
            status: Some(PresenceStatus::Away),
            current_room: Some(task_room("t-1")),
            cursor: None,
            last_seen_at: Some(Utc::now()),
        };
        manager.transport.queue_frame(Envelope::presence(update.clone()));

        assert_eq!(manager.poll_event(Duration::ZERO), Some(ClientEvent::Presence(update)));
    }

    #[test]
    fn event_listeners_run_before_the_event_surfaces() {
        use std::sync::{Arc, Mutex};

        let mut manager = connected_manager();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for tag in [1u32, 2] {
            let calls = calls.clone();
            manager.add_event_listener(
                EventType::EntityUpdated,
                Box::new(move |_event| calls.lock().unwrap().push(tag)),
            );
        }
        let event = RealtimeEvent {
            id: Uuid::new_v4(),
            kind: EventType::EntityUpdated,
            entity_type: EntityType::Task,
            entity_id: "t-1".into(),
            user_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            data: serde_json::Value::Null,
        };
        manager.transport.queue_frame(Envelope::event(event.clone()));

        assert_eq!(manager.poll_event(Duration::ZERO), Some(ClientEvent::Event(event)));
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn rejected_ack_surfaces_with_its_error() {
        let mut manager = connected_manager();
        let payload = AckPayload::rejected(Uuid::new_v4(), "NOT_FOUND", "document missing", false);
        manager.transport.queue_frame(Envelope::ack(payload.clone()));

        match manager.poll_event(Duration::ZERO) {
            Some(ClientEvent::Ack(ack)) => {
                assert_eq!(ack.error, Some(AckError {
                    code: "NOT_FOUND".to_string(),
                    message: "document missing".to_string(),
                    retryable: false,
                }));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn protocol_errors_surface() {
        let mut manager = connected_manager();
        manager.transport.queue_frame(Envelope::error(ErrorPayload {
            code: "HEARTBEAT_TIMEOUT".to_string(),
            message: "no heartbeat within the idle window".to_string(),
            retryable: true,
        }));

        match manager.poll_event(Duration::ZERO) {
            Some(ClientEvent::ProtocolError { code, retryable, .. }) => {
                assert_eq!(code, "HEARTBEAT_TIMEOUT");
                assert!(retryable);
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn closed_socket_surfaces_disconnect_and_marks_reconnecting() {
        let mut manager = connected_manager();
        manager.transport.queue_close();

        match manager.poll_event(Duration::ZERO) {
            Some(ClientEvent::Disconnected { reason }) => assert!(reason.contains("closed")),
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.poll_event(Duration::ZERO), None, "no polling while down");
    }

    // ── Reconnection ────────────────────────────────────────────────

    #[test]
    fn scheduled_reconnect_is_not_due_immediately() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::default());
        let t0 = Instant::now();
        manager.schedule_reconnect(t0);

        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert!(matches!(manager.reconnect_tick(t0), ReconnectTick::NotDue));
    }

    #[test]
    fn reconnect_tick_connects_once_due() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::with_hello_ack());
        let t0 = Instant::now();
        manager.schedule_reconnect(t0);

        match manager.reconnect_tick(t0 + Duration::from_secs(1)) {
            ReconnectTick::Connected(summary) => {
                assert_eq!(manager.session_id(), Some(summary.session_id));
            }
            other => panic!("expected connect, got {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(matches!(manager.reconnect_tick(t0 + Duration::from_secs(2)), ReconnectTick::Idle));
    }

    #[test]
    fn disconnect_discards_the_scheduled_reconnect() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::with_hello_ack());
        let t0 = Instant::now();
        manager.schedule_reconnect(t0);
        manager.disconnect();

        assert!(matches!(
            manager.reconnect_tick(t0 + Duration::from_secs(60)),
            ReconnectTick::Idle
        ));
        assert_eq!(manager.transport.open_calls, 0, "superseded attempt must not dial");
    }

    #[test]
    fn stale_generation_reconnect_is_discarded() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::with_hello_ack());
        let t0 = Instant::now();
        manager.schedule_reconnect(t0);
        // An explicit connect supersedes the scheduled attempt...
        manager.connect().expect("connect");
        // ...but a reconnect scheduled before it must not fire afterwards.
        manager.pending_reconnect =
            Some(PendingReconnect { due_at: t0, generation: manager.generation - 1 });

        assert!(matches!(
            manager.reconnect_tick(t0 + Duration::from_secs(60)),
            ReconnectTick::Stale
        ));
        assert!(manager.pending_reconnect.is_none());
    }

    #[test]
    fn failed_attempt_reschedules_with_backoff() {
        let mut manager =
            ConnectionManager::new(test_config(), MockTransport::failing_open("refused"));
        let t0 = Instant::now();
        manager.schedule_reconnect(t0);

        match manager.reconnect_tick(t0 + Duration::from_secs(40)) {
            ReconnectTick::Rescheduled { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_backoff_range(delay, unjittered_backoff(&manager.config.reconnect, 1));
            }
            other => panic!("expected reschedule, got {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn attempt_ceiling_surfaces_a_terminal_error() {
        let mut config = test_config();
        config.reconnect.max_attempts = 2;
        config.reconnect.base_delay = Duration::from_millis(1);
        config.reconnect.max_delay = Duration::from_millis(2);
        let mut manager = ConnectionManager::new(config, MockTransport::failing_open("refused"));

        let mut now = Instant::now();
        manager.schedule_reconnect(now);
        now += Duration::from_secs(1);
        assert!(matches!(
            manager.reconnect_tick(now),
            ReconnectTick::Rescheduled { attempt: 1, .. }
        ));

        now += Duration::from_secs(1);
        match manager.reconnect_tick(now) {
            ReconnectTick::GaveUp(error) => {
                assert!(error.terminal);
                assert!(error.to_string().contains("2 failed attempts"));
            }
            other => panic!("expected terminal give-up, got {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..20 {
            let delay = backoff_delay(&policy, attempt);
            assert_backoff_range(delay, unjittered_backoff(&policy, attempt));
        }
        // Past the cap the un-jittered delay stops growing.
        assert_eq!(unjittered_backoff(&policy, 19), policy.max_delay);
    }

    #[test]
    fn successful_connect_resets_the_failure_count() {
        let mut manager =
            ConnectionManager::new(test_config(), MockTransport::failing_open("refused"));
        manager.connect().expect_err("first failure");
        manager.connect().expect_err("second failure");
        assert_eq!(manager.consecutive_failures, 2);

        manager.transport.open_error = None;
        manager.transport.queue_frame(hello_ack(15_000));
        manager.connect().expect("third attempt succeeds");

        assert_eq!(manager.consecutive_failures, 0);
    }

    // ── Disconnect ──────────────────────────────────────────────────

    #[test]
    fn disconnect_clears_queue_and_closes_transport() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::default());
        manager.send(op_frame());
        manager.send(op_frame());

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.queued_messages(), 0);
        assert!(manager.transport.closed);
    }

    #[test]
    fn disconnect_preserves_room_membership() {
        let mut manager = ConnectionManager::new(test_config(), MockTransport::with_hello_ack());
        manager.join_room(task_room("t-1"));
        manager.connect().expect("connect");
        manager.disconnect();

        assert_eq!(manager.joined_rooms(), &[task_room("t-1")]);

        manager.transport.queue_frame(hello_ack(15_000));
        let summary = manager.connect().expect("reconnect");
        assert_eq!(summary.rejoined_rooms, 1);
    }
}
