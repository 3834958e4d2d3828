//! Session relay hub
//!
//! Owns the room table and one outbound queue per connection. Room state is
//! serialized behind a single lock and events are enqueued while it is held,
//! so per-room emission order is preserved. Calls into the lifecycle manager
//! happen after the lock is released.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use super::protocol::{ConnectionId, OutputKind, RelayCommand, RelayEvent};
use super::room::{Readiness, Role, RoomTable, Transition};
use crate::sandbox::{LifecycleManager, SandboxError, SessionId};

/// The lifecycle operations the relay needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SandboxControl: Send + Sync {
    /// Terminate a sandbox (reclamation)
    async fn terminate(&self, id: &SessionId) -> Result<(), SandboxError>;
    /// Run a command and return its combined output
    async fn execute(&self, id: &SessionId, command: &str) -> Result<String, SandboxError>;
}

#[async_trait]
impl SandboxControl for LifecycleManager {
    async fn terminate(&self, id: &SessionId) -> Result<(), SandboxError> {
        LifecycleManager::terminate(self, id).await
    }

    async fn execute(&self, id: &SessionId, command: &str) -> Result<String, SandboxError> {
        LifecycleManager::execute(self, id, command).await
    }
}

/// Receiving half of a registered connection
pub struct RelayConnection {
    /// Relay-assigned id
    pub id: ConnectionId,
    /// Role the connection registered with
    pub role: Role,
    /// Events addressed to this connection
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

struct Peer {
    role: Role,
    outbox: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
struct RelayState {
    rooms: RoomTable,
    peers: HashMap<ConnectionId, Peer>,
}

impl RelayState {
    fn dispatch(&self, transition: &Transition) {
        for delivery in &transition.deliveries {
            let Some(peer) = self.peers.get(&delivery.to) else {
                continue;
            };
            if peer.outbox.send(delivery.event.clone()).is_err() {
                debug!(conn = %delivery.to, "Dropping event for closed connection");
            }
        }
    }
}

/// Pub/sub hub keyed by session id
pub struct SessionRelay {
    control: Arc<dyn SandboxControl>,
    state: Mutex<RelayState>,
    next_id: AtomicU64,
}

impl SessionRelay {
    /// Create a relay that reclaims and executes through `control`
    #[must_use]
    pub fn new(control: Arc<dyn SandboxControl>) -> Self {
        Self {
            control,
            state: Mutex::new(RelayState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection
    pub async fn connect(&self, role: Role) -> RelayConnection {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbox, events) = mpsc::unbounded_channel();
        self.state.lock().await.peers.insert(id, Peer { role, outbox });
        debug!(conn = %id, ?role, "Relay connection registered");
        RelayConnection { id, role, events }
    }

    /// Drop a connection and all of its room memberships.
    ///
    /// Rooms left without clients are reclaimed.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, conn: ConnectionId) {
        let transition = {
            let mut state = self.state.lock().await;
            state.peers.remove(&conn);
            let transition = state.rooms.disconnect(conn);
            state.dispatch(&transition);
            transition
        };
        debug!("Relay connection closed");
        self.reclaim(transition.reclaim).await;
    }

    /// Apply one inbound frame from `conn`
    #[instrument(skip(self, command), fields(event = command.name()))]
    pub async fn handle(&self, conn: ConnectionId, command: RelayCommand) {
        match command {
            RelayCommand::Join { session_id } => {
                let mut state = self.state.lock().await;
                let Some(role) = state.peers.get(&conn).map(|p| p.role) else {
                    return;
                };
                let transition = state.rooms.join(conn, role, &session_id);
                state.dispatch(&transition);
                info!(session_id = %session_id, ?role, "Joined room");
            }
            RelayCommand::Leave { session_id } => {
                let transition = self.apply(|rooms| rooms.leave(conn, &session_id)).await;
                self.reclaim(transition.reclaim).await;
            }
            RelayCommand::AgentReady { session_id } => {
                self.apply(|rooms| rooms.set_agent_ready(&session_id)).await;
                info!(session_id = %session_id, "Agent ready");
            }
            RelayCommand::ShellReady { session_id } => {
                self.apply(|rooms| rooms.set_shell_ready(&session_id)).await;
                info!(session_id = %session_id, "Shell ready");
            }
            RelayCommand::CommandInput {
                session_id,
                command,
            } => self.execute(&session_id, &command).await,
            RelayCommand::SendFile {
                session_id,
                path,
                content,
            } => {
                debug!(session_id = %session_id, path = %path, "Relaying file");
                let event = RelayEvent::FileReceived { path, content };
                self.apply(|rooms| rooms.broadcast(&session_id, &event, None))
                    .await;
            }
            RelayCommand::SendZip {
                session_id,
                bytes,
                dest_path,
            } => {
                let (Some(session_id), Some(bytes)) = (session_id, bytes) else {
                    warn!("Rejecting send-zip without session id or archive bytes");
                    return;
                };
                if bytes.is_empty() {
                    warn!(session_id = %session_id, "Rejecting send-zip with empty archive");
                    return;
                }
                debug!(session_id = %session_id, bytes = bytes.0.len(), dest_path = %dest_path, "Relaying archive");
                let event = RelayEvent::ZipReceived { bytes, dest_path };
                self.apply(|rooms| rooms.broadcast(&session_id, &event, None))
                    .await;
            }
            RelayCommand::Output { kind, data } => {
                let mut state = self.state.lock().await;
                if state.peers.get(&conn).map(|p| p.role) != Some(Role::Agent) {
                    debug!(conn = %conn, "Ignoring output from a client connection");
                    return;
                }
                let event = RelayEvent::Output { kind, data };
                let transition = state.rooms.route_from(conn, &event);
                state.dispatch(&transition);
            }
        }
    }

    /// Apply a room operation and enqueue its deliveries under the lock
    async fn apply<F>(&self, op: F) -> Transition
    where
        F: FnOnce(&mut RoomTable) -> Transition,
    {
        let mut state = self.state.lock().await;
        let transition = op(&mut state.rooms);
        state.dispatch(&transition);
        transition
    }

    async fn execute(&self, session_id: &SessionId, command: &str) {
        let event = match self.control.execute(session_id, command).await {
            Ok(output) => RelayEvent::stdout(output),
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Command failed");
                RelayEvent::Output {
                    kind: OutputKind::Stderr,
                    data: format!("Error: {e}\n"),
                }
            }
        };
        self.apply(|rooms| rooms.broadcast(session_id, &event, None))
            .await;
    }

    async fn reclaim(&self, sessions: Vec<SessionId>) {
        for session_id in sessions {
            info!(session_id = %session_id, "Room empty, reclaiming sandbox");
            match self.control.terminate(&session_id).await {
                Ok(()) => info!(session_id = %session_id, "Sandbox reclaimed"),
                Err(e) if e.is_not_found() => {
                    debug!(session_id = %session_id, "Sandbox already gone");
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "Reclamation failed"),
            }
        }
    }

    /// Forget a room after its sandbox was terminated elsewhere
    pub async fn close_room(&self, session_id: &SessionId) -> bool {
        self.state.lock().await.rooms.close(session_id)
    }

    /// Readiness flags of a session; all false if it has no room
    pub async fn readiness(&self, session_id: &SessionId) -> Readiness {
        self.state
            .lock()
            .await
            .rooms
            .readiness(session_id)
            .unwrap_or_default()
    }

    /// Number of live rooms
    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    /// Number of registered connections
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::Binary;
    use mockall::predicate::eq;

    fn drain(conn: &mut RelayConnection) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = conn.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn join(session: &str) -> RelayCommand {
        RelayCommand::Join {
            session_id: SessionId::from(session),
        }
    }

    #[tokio::test]
    async fn test_two_clients_reclaim_once() {
        let mut control = MockSandboxControl::new();
        control
            .expect_terminate()
            .with(eq(SessionId::from("s2")))
            .times(1)
            .returning(|_| Ok(()));
        let relay = SessionRelay::new(Arc::new(control));

        let mut c1 = relay.connect(Role::Client).await;
        let mut c2 = relay.connect(Role::Client).await;
        relay.handle(c1.id, join("s2")).await;
        relay.handle(c2.id, join("s2")).await;

        let s2 = SessionId::from("s2");
        relay
            .handle(c1.id, RelayCommand::AgentReady { session_id: s2.clone() })
            .await;
        relay
            .handle(c1.id, RelayCommand::ShellReady { session_id: s2.clone() })
            .await;

        assert_eq!(
            drain(&mut c1),
            vec![
                RelayEvent::ClientJoined { client_id: c2.id },
                RelayEvent::AgentReady,
                RelayEvent::ShellReady,
            ]
        );
        assert_eq!(drain(&mut c2), vec![RelayEvent::AgentReady, RelayEvent::ShellReady]);

        relay
            .handle(c1.id, RelayCommand::Leave { session_id: s2.clone() })
            .await;
        assert_eq!(relay.room_count().await, 1);

        relay.disconnect(c2.id).await;
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_late_joiner_catch_up() {
        let relay = SessionRelay::new(Arc::new(MockSandboxControl::new()));
        let agent = relay.connect(Role::Agent).await;
        let s1 = SessionId::from("s1");

        relay.handle(agent.id, join("s1")).await;
        relay
            .handle(agent.id, RelayCommand::AgentReady { session_id: s1.clone() })
            .await;
        relay
            .handle(agent.id, RelayCommand::ShellReady { session_id: s1.clone() })
            .await;

        let mut client = relay.connect(Role::Client).await;
        relay.handle(client.id, join("s1")).await;
        assert_eq!(
            drain(&mut client),
            vec![RelayEvent::AgentReady, RelayEvent::ShellReady]
        );
        assert_eq!(
            relay.readiness(&s1).await,
            Readiness {
                agent_connected: true,
                shell_ready: true,
            }
        );
    }

    #[tokio::test]
    async fn test_command_failure_becomes_stderr() {
        let mut control = MockSandboxControl::new();
        control
            .expect_execute()
            .returning(|id, _| Err(SandboxError::NotFound(id.clone())));
        let relay = SessionRelay::new(Arc::new(control));

        let mut client = relay.connect(Role::Client).await;
        relay.handle(client.id, join("s1")).await;
        relay
            .handle(
                client.id,
                RelayCommand::CommandInput {
                    session_id: SessionId::from("s1"),
                    command: "ls".to_string(),
                },
            )
            .await;

        assert_eq!(
            drain(&mut client),
            vec![RelayEvent::stderr("Error: Sandbox not found: s1\n")]
        );
    }

    #[tokio::test]
    async fn test_command_output_reaches_room() {
        let mut control = MockSandboxControl::new();
        control
            .expect_execute()
            .with(eq(SessionId::from("s1")), eq("echo hi"))
            .returning(|_, _| Ok("hi\n".to_string()));
        let relay = SessionRelay::new(Arc::new(control));

        let mut a = relay.connect(Role::Client).await;
        let mut b = relay.connect(Role::Client).await;
        let mut other = relay.connect(Role::Client).await;
        relay.handle(a.id, join("s1")).await;
        relay.handle(b.id, join("s1")).await;
        relay.handle(other.id, join("s9")).await;
        drain(&mut a);

        relay
            .handle(
                a.id,
                RelayCommand::CommandInput {
                    session_id: SessionId::from("s1"),
                    command: "echo hi".to_string(),
                },
            )
            .await;

        assert_eq!(drain(&mut a), vec![RelayEvent::stdout("hi\n")]);
        assert_eq!(drain(&mut b), vec![RelayEvent::stdout("hi\n")]);
        assert!(drain(&mut other).is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_not_found_is_benign() {
        let mut control = MockSandboxControl::new();
        control
            .expect_terminate()
            .times(1)
            .returning(|id| Err(SandboxError::NotFound(id.clone())));
        let relay = SessionRelay::new(Arc::new(control));

        let client = relay.connect(Role::Client).await;
        relay.handle(client.id, join("s1")).await;
        relay.disconnect(client.id).await;

        assert_eq!(relay.room_count().await, 0);
        assert_eq!(relay.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_zip_requires_session_and_bytes() {
        let relay = SessionRelay::new(Arc::new(MockSandboxControl::new()));
        let mut agent = relay.connect(Role::Agent).await;
        relay.handle(agent.id, join("s1")).await;

        relay
            .handle(
                agent.id,
                RelayCommand::SendZip {
                    session_id: Some(SessionId::from("s1")),
                    bytes: None,
                    dest_path: "site".to_string(),
                },
            )
            .await;
        assert!(drain(&mut agent).is_empty());

        relay
            .handle(
                agent.id,
                RelayCommand::SendZip {
                    session_id: Some(SessionId::from("s1")),
                    bytes: Some(Binary(b"PK\x03\x04".to_vec())),
                    dest_path: "site".to_string(),
                },
            )
            .await;
        assert_eq!(
            drain(&mut agent),
            vec![RelayEvent::ZipReceived {
                bytes: Binary(b"PK\x03\x04".to_vec()),
                dest_path: "site".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_agent_output_fans_out_to_clients() {
        let relay = SessionRelay::new(Arc::new(MockSandboxControl::new()));
        let mut agent = relay.connect(Role::Agent).await;
        let mut client = relay.connect(Role::Client).await;
        relay.handle(agent.id, join("s1")).await;
        relay.handle(client.id, join("s1")).await;
        drain(&mut agent);

        relay
            .handle(
                agent.id,
                RelayCommand::Output {
                    kind: OutputKind::Stdout,
                    data: "$ ".to_string(),
                },
            )
            .await;

        assert_eq!(drain(&mut client), vec![RelayEvent::stdout("$ ")]);
        assert!(drain(&mut agent).is_empty());
    }

    #[tokio::test]
    async fn test_client_output_is_not_relayed() {
        let relay = SessionRelay::new(Arc::new(MockSandboxControl::new()));
        let mut agent = relay.connect(Role::Agent).await;
        let mut alice = relay.connect(Role::Client).await;
        let mut bob = relay.connect(Role::Client).await;
        relay.handle(agent.id, join("s1")).await;
        relay.handle(alice.id, join("s1")).await;
        relay.handle(bob.id, join("s1")).await;
        drain(&mut agent);
        drain(&mut alice);

        relay
            .handle(
                alice.id,
                RelayCommand::Output {
                    kind: OutputKind::Stderr,
                    data: "forged\n".to_string(),
                },
            )
            .await;

        assert!(drain(&mut bob).is_empty());
        assert!(drain(&mut agent).is_empty());
    }

    #[tokio::test]
    async fn test_readiness_for_unjoined_session_is_dropped() {
        let relay = SessionRelay::new(Arc::new(MockSandboxControl::new()));
        let conn = relay.connect(Role::Client).await;
        for i in 0..100 {
            let session_id = SessionId::from(format!("bogus-{i}"));
            relay
                .handle(conn.id, RelayCommand::AgentReady { session_id: session_id.clone() })
                .await;
            relay
                .handle(conn.id, RelayCommand::ShellReady { session_id })
                .await;
        }
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_agent_only_room_goes_away_without_reclaim() {
        // No terminate expectation: reclaiming here would panic the mock
        let relay = SessionRelay::new(Arc::new(MockSandboxControl::new()));
        let agent = relay.connect(Role::Agent).await;
        relay.handle(agent.id, join("s1")).await;
        relay
            .handle(agent.id, RelayCommand::AgentReady { session_id: SessionId::from("s1") })
            .await;
        assert_eq!(relay.room_count().await, 1);

        relay.disconnect(agent.id).await;
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_agent_disconnect_resets_flags() {
        let relay = SessionRelay::new(Arc::new(MockSandboxControl::new()));
        let agent = relay.connect(Role::Agent).await;
        let client = relay.connect(Role::Client).await;
        let s1 = SessionId::from("s1");
        relay.handle(client.id, join("s1")).await;
        relay.handle(agent.id, join("s1")).await;
        relay
            .handle(agent.id, RelayCommand::AgentReady { session_id: s1.clone() })
            .await;

        relay.disconnect(agent.id).await;
        assert_eq!(relay.readiness(&s1).await, Readiness::default());
        assert_eq!(relay.room_count().await, 1);
    }
}
