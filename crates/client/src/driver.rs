// Async driver: owns a `ConnectionManager` on a blocking task and pumps its
// heartbeat, reconnect, and poll ticks. Commands flow in over a channel;
// `ClientEvent`s flow out over another. Shutdown is flag-based so the loop
// stops at a deterministic point and nothing is delivered after `wait`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tandem_common::protocol::ws::Envelope;
use tandem_common::types::RoomId;

use crate::manager::{
    ClientEvent, ConnectionManager, ConnectionState, HeartbeatTick, ReconnectTick, Transport,
};

/// Upper bound on one loop iteration: the poll timeout while connected, the
/// idle sleep while not.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Command {
    Send(Envelope),
    JoinRoom(RoomId),
    LeaveRoom(RoomId),
    Disconnect,
}

/// Control handle for a spawned client driver.
///
/// Dropping the handle signals shutdown; `wait` additionally blocks until the
/// driver has stopped and the transport is closed.
pub struct ClientHandle {
    commands: UnboundedSender<Command>,
    shutdown: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ClientHandle {
    /// Queue a frame for transmission. Returns false once the driver has
    /// stopped.
    pub fn send(&self, frame: Envelope) -> bool {
        self.commands.send(Command::Send(frame)).is_ok()
    }

    pub fn join_room(&self, room: RoomId) -> bool {
        self.commands.send(Command::JoinRoom(room)).is_ok()
    }

    pub fn leave_room(&self, room: RoomId) -> bool {
        self.commands.send(Command::LeaveRoom(room)).is_ok()
    }

    /// Tear the connection down without stopping the driver. Queued frames
    /// are discarded; room membership survives.
    pub fn disconnect(&self) -> bool {
        self.commands.send(Command::Disconnect).is_ok()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn wait(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the driver for an already-configured manager. The initial connect
/// happens on the driver; watch the event stream for the outcome.
pub fn spawn<T: Transport + Send + 'static>(
    manager: ConnectionManager<T>,
) -> (ClientHandle, UnboundedReceiver<ClientEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let task =
        tokio::task::spawn_blocking(move || run_loop(manager, command_rx, event_tx, flag));
    (ClientHandle { commands: command_tx, shutdown, task: Some(task) }, event_rx)
}

fn run_loop<T: Transport>(
    mut manager: ConnectionManager<T>,
    mut commands: UnboundedReceiver<Command>,
    events: UnboundedSender<ClientEvent>,
    shutdown: Arc<AtomicBool>,
) {
    match manager.connect() {
        Ok(summary) => {
            let _ = events.send(ClientEvent::Connected { session_id: summary.session_id });
        }
        Err(error) => {
            warn!(%error, "initial connect failed");
            let _ = events.send(ClientEvent::Disconnected { reason: error.to_string() });
            manager.schedule_reconnect(Instant::now());
        }
    }

    while !shutdown.load(Ordering::SeqCst) {
        loop {
            let command = match commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            };
            let was_connected = manager.state() == ConnectionState::Connected;
            match command {
                Command::Send(frame) => {
                    manager.send(frame);
                }
                Command::JoinRoom(room) => {
                    manager.join_room(room);
                }
                Command::LeaveRoom(room) => {
                    manager.leave_room(&room);
                }
                Command::Disconnect => manager.disconnect(),
            }
            // A failed write inside a command marks the link lost with no
            // tick to notice; surface the drop and arm the redial.
            if was_connected && manager.state() == ConnectionState::Reconnecting {
                let _ = events.send(ClientEvent::Disconnected {
                    reason: "link lost while sending".to_string(),
                });
                manager.schedule_reconnect(Instant::now());
            }
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        match manager.heartbeat_tick(now) {
            HeartbeatTick::TimedOut => {
                let _ = events
                    .send(ClientEvent::Disconnected { reason: "heartbeat ack timed out".into() });
                manager.schedule_reconnect(now);
            }
            HeartbeatTick::SendFailed => {
                let _ = events
                    .send(ClientEvent::Disconnected { reason: "heartbeat send failed".into() });
                manager.schedule_reconnect(now);
            }
            HeartbeatTick::Idle | HeartbeatTick::Sent => {}
        }

        match manager.reconnect_tick(now) {
            ReconnectTick::Connected(summary) => {
                let _ = events.send(ClientEvent::Connected { session_id: summary.session_id });
            }
            ReconnectTick::Rescheduled { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect rescheduled");
            }
            ReconnectTick::GaveUp(error) => {
                let _ = events.send(ClientEvent::Disconnected { reason: error.to_string() });
                // Terminal: the caller spawns a fresh driver to try again.
                break;
            }
            ReconnectTick::Idle | ReconnectTick::NotDue | ReconnectTick::Stale => {}
        }

        match manager.poll_event(POLL_INTERVAL) {
            Some(event) => {
                let lost = matches!(event, ClientEvent::Disconnected { .. });
                if events.send(event).is_err() {
                    // Receiver gone; no point running on.
                    break;
                }
                if lost {
                    manager.schedule_reconnect(Instant::now());
                }
            }
            None => {
                if manager.state() != ConnectionState::Connected {
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    manager.disconnect();
    debug!("client driver stopped");
}
