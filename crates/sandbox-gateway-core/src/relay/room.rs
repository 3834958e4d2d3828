//! Room table
//!
//! Pure state machine behind the session relay. Every operation returns a
//! [`Transition`]: the events to enqueue per connection, in order, and the
//! sessions whose room just emptied and must be reclaimed. No I/O happens here.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::protocol::{ConnectionId, RelayEvent};
use crate::sandbox::SessionId;

/// Which side of the relay a connection is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A viewer; its memberships keep a room alive
    Client,
    /// An in-sandbox agent
    Agent,
}

/// Readiness flags of one room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    /// The agent has announced itself
    pub agent_connected: bool,
    /// The agent's shell is running
    pub shell_ready: bool,
}

/// One event addressed to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Recipient
    pub to: ConnectionId,
    /// Event to send
    pub event: RelayEvent,
}

/// Result of applying one relay event to the table
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Events to enqueue, in emission order
    pub deliveries: Vec<Delivery>,
    /// Sessions whose last client just left
    pub reclaim: Vec<SessionId>,
}

impl Transition {
    fn deliver(&mut self, to: ConnectionId, event: RelayEvent) {
        self.deliveries.push(Delivery { to, event });
    }

    fn merge(&mut self, other: Self) {
        self.deliveries.extend(other.deliveries);
        self.reclaim.extend(other.reclaim);
    }
}

#[derive(Debug, Default)]
struct Room {
    // Ordered so fan-out order is deterministic
    members: BTreeMap<ConnectionId, Role>,
    readiness: Readiness,
}

impl Room {
    fn has_clients(&self) -> bool {
        self.members.values().any(|role| *role == Role::Client)
    }
}

/// Rooms keyed by session id plus the reverse membership index
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<SessionId, Room>,
    memberships: HashMap<ConnectionId, HashSet<SessionId>>,
}

impl RoomTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to the room, creating it on first join.
    ///
    /// The joiner receives catch-up `agent-ready`/`shell-ready` for flags
    /// already set; peers receive `client-joined` on a first join.
    pub fn join(&mut self, conn: ConnectionId, role: Role, session: &SessionId) -> Transition {
        let mut transition = Transition::default();
        let room = self.rooms.entry(session.clone()).or_default();
        let is_new = room.members.insert(conn, role).is_none();
        self.memberships
            .entry(conn)
            .or_default()
            .insert(session.clone());

        if room.readiness.agent_connected {
            transition.deliver(conn, RelayEvent::AgentReady);
        }
        if room.readiness.shell_ready {
            transition.deliver(conn, RelayEvent::ShellReady);
        }

        if is_new {
            for peer in room.members.keys().filter(|peer| **peer != conn) {
                transition.deliver(*peer, RelayEvent::ClientJoined { client_id: conn });
            }
        }
        transition
    }

    /// Remove `conn` from one room, reclaiming it if the last client left
    pub fn leave(&mut self, conn: ConnectionId, session: &SessionId) -> Transition {
        let mut transition = Transition::default();
        if let Some(sessions) = self.memberships.get_mut(&conn) {
            sessions.remove(session);
            if sessions.is_empty() {
                self.memberships.remove(&conn);
            }
        }
        self.detach(conn, session, false, &mut transition);
        transition
    }

    /// Remove `conn` from every room it belongs to
    pub fn disconnect(&mut self, conn: ConnectionId) -> Transition {
        let mut transition = Transition::default();
        let Some(sessions) = self.memberships.remove(&conn) else {
            return transition;
        };

        let mut sessions: Vec<SessionId> = sessions.into_iter().collect();
        sessions.sort();
        for session in sessions {
            self.detach(conn, &session, true, &mut transition);
        }
        transition
    }

    /// Drop one membership. The last client leaving reclaims the room; a room
    /// left with no members at all is dropped without reclaiming. Readiness is
    /// reset only when an agent disconnects.
    fn detach(
        &mut self,
        conn: ConnectionId,
        session: &SessionId,
        disconnected: bool,
        transition: &mut Transition,
    ) {
        let Some(room) = self.rooms.get_mut(session) else {
            return;
        };
        let Some(role) = room.members.remove(&conn) else {
            return;
        };

        if role == Role::Agent && disconnected {
            room.readiness = Readiness::default();
        }
        if role == Role::Client && !room.has_clients() {
            self.discard(session);
            transition.reclaim.push(session.clone());
        } else if room.members.is_empty() {
            self.discard(session);
        }
    }

    /// Drop a room and every back-reference to it
    fn discard(&mut self, session: &SessionId) -> bool {
        let Some(room) = self.rooms.remove(session) else {
            return false;
        };
        for member in room.members.keys() {
            if let Some(sessions) = self.memberships.get_mut(member) {
                sessions.remove(session);
                if sessions.is_empty() {
                    self.memberships.remove(member);
                }
            }
        }
        true
    }

    /// Record that the agent is connected and tell the room.
    /// Rooms are only created by `join`; a session without one is ignored.
    pub fn set_agent_ready(&mut self, session: &SessionId) -> Transition {
        let Some(room) = self.rooms.get_mut(session) else {
            return Transition::default();
        };
        room.readiness.agent_connected = true;
        self.broadcast(session, &RelayEvent::AgentReady, None)
    }

    /// Record that the agent's shell is ready and tell the room.
    /// Rooms are only created by `join`; a session without one is ignored.
    pub fn set_shell_ready(&mut self, session: &SessionId) -> Transition {
        let Some(room) = self.rooms.get_mut(session) else {
            return Transition::default();
        };
        room.readiness.shell_ready = true;
        self.broadcast(session, &RelayEvent::ShellReady, None)
    }

    /// Address `event` to every member of the room except `exclude`
    #[must_use]
    pub fn broadcast(
        &self,
        session: &SessionId,
        event: &RelayEvent,
        exclude: Option<ConnectionId>,
    ) -> Transition {
        let mut transition = Transition::default();
        if let Some(room) = self.rooms.get(session) {
            for member in room.members.keys().filter(|m| Some(**m) != exclude) {
                transition.deliver(*member, event.clone());
            }
        }
        transition
    }

    /// Fan `event` out to every room `from` belongs to, excluding `from`.
    /// A connection in several rooms never receives the same event twice.
    #[must_use]
    pub fn route_from(&self, from: ConnectionId, event: &RelayEvent) -> Transition {
        let mut transition = Transition::default();
        let Some(sessions) = self.memberships.get(&from) else {
            return transition;
        };

        let mut sessions: Vec<&SessionId> = sessions.iter().collect();
        sessions.sort();
        let mut seen = HashSet::new();
        for session in sessions {
            let mut routed = self.broadcast(session, event, Some(from));
            routed.deliveries.retain(|d| seen.insert(d.to));
            transition.merge(routed);
        }
        transition
    }

    /// Forget a room without reclaiming it. Returns whether it existed.
    pub fn close(&mut self, session: &SessionId) -> bool {
        self.discard(session)
    }

    /// Readiness flags of a room, if it exists
    #[must_use]
    pub fn readiness(&self, session: &SessionId) -> Option<Readiness> {
        self.rooms.get(session).map(|room| room.readiness)
    }

    /// Members of a room
    #[must_use]
    pub fn members(&self, session: &SessionId) -> Vec<ConnectionId> {
        self.rooms
            .get(session)
            .map(|room| room.members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Rooms a connection belongs to
    #[must_use]
    pub fn rooms_of(&self, conn: ConnectionId) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .memberships
            .get(&conn)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        sessions.sort();
        sessions
    }

    /// Number of live rooms
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether there are no rooms
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn conn(n: u64) -> ConnectionId {
        ConnectionId::new(n)
    }

    fn events_for(transition: &Transition, to: ConnectionId) -> Vec<RelayEvent> {
        transition
            .deliveries
            .iter()
            .filter(|d| d.to == to)
            .map(|d| d.event.clone())
            .collect()
    }

    #[test]
    fn test_late_joiner_gets_catch_up_in_order() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s1");
        table.join(conn(10), Role::Agent, &s);
        table.set_agent_ready(&s);
        table.set_shell_ready(&s);

        let joined = table.join(conn(1), Role::Client, &s);
        assert_eq!(
            events_for(&joined, conn(1)),
            vec![RelayEvent::AgentReady, RelayEvent::ShellReady]
        );
    }

    #[test]
    fn test_client_joined_goes_to_peers_only() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s1");
        table.join(conn(1), Role::Client, &s);

        let joined = table.join(conn(2), Role::Client, &s);
        assert_eq!(
            joined.deliveries,
            vec![Delivery {
                to: conn(1),
                event: RelayEvent::ClientJoined { client_id: conn(2) },
            }]
        );

        // Re-joining does not announce again
        assert!(table.join(conn(2), Role::Client, &s).deliveries.is_empty());
    }

    #[test]
    fn test_two_clients_scenario() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s2");
        table.join(conn(1), Role::Client, &s);
        table.join(conn(2), Role::Client, &s);

        let agent_ready = table.set_agent_ready(&s);
        let shell_ready = table.set_shell_ready(&s);
        assert_eq!(agent_ready.deliveries.len(), 2);
        assert_eq!(shell_ready.deliveries.len(), 2);

        let left = table.leave(conn(1), &s);
        assert!(left.reclaim.is_empty());
        assert_eq!(table.members(&s), vec![conn(2)]);

        let gone = table.disconnect(conn(2));
        assert_eq!(gone.reclaim, vec![s.clone()]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_agent_does_not_keep_room_alive() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s1");
        table.join(conn(10), Role::Agent, &s);
        table.join(conn(1), Role::Client, &s);

        let left = table.leave(conn(1), &s);
        assert_eq!(left.reclaim, vec![s.clone()]);
        assert!(table.rooms_of(conn(10)).is_empty());
    }

    #[test]
    fn test_agent_disconnect_resets_readiness_without_reclaim() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s1");
        table.join(conn(1), Role::Client, &s);
        table.join(conn(10), Role::Agent, &s);
        table.set_agent_ready(&s);
        table.set_shell_ready(&s);

        let gone = table.disconnect(conn(10));
        assert!(gone.reclaim.is_empty());
        assert_eq!(table.readiness(&s), Some(Readiness::default()));
    }

    #[test]
    fn test_flags_survive_client_churn() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s1");
        table.join(conn(1), Role::Client, &s);
        table.join(conn(2), Role::Client, &s);
        table.set_agent_ready(&s);
        table.leave(conn(1), &s);
        table.join(conn(3), Role::Client, &s);

        assert_eq!(
            table.readiness(&s),
            Some(Readiness {
                agent_connected: true,
                shell_ready: false,
            })
        );
    }

    #[test]
    fn test_agent_output_reaches_room_but_not_sender() {
        let mut table = RoomTable::new();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");
        table.join(conn(10), Role::Agent, &s1);
        table.join(conn(1), Role::Client, &s1);
        table.join(conn(2), Role::Client, &s1);
        table.join(conn(3), Role::Client, &s2);

        let routed = table.route_from(conn(10), &RelayEvent::stdout("hi\n"));
        let recipients: Vec<ConnectionId> = routed.deliveries.iter().map(|d| d.to).collect();
        assert_eq!(recipients, vec![conn(1), conn(2)]);
    }

    #[test]
    fn test_close_forgets_room_without_reclaim() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s1");
        table.join(conn(1), Role::Client, &s);

        assert!(table.close(&s));
        assert!(!table.close(&s));
        assert!(table.rooms_of(conn(1)).is_empty());
        assert!(table.disconnect(conn(1)).reclaim.is_empty());
    }

    #[test]
    fn test_agent_only_room_is_dropped_on_disconnect() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s1");
        table.join(conn(10), Role::Agent, &s);
        table.set_agent_ready(&s);

        let gone = table.disconnect(conn(10));
        assert!(gone.reclaim.is_empty());
        assert!(table.is_empty());
        assert!(table.readiness(&s).is_none());
    }

    #[test]
    fn test_readiness_for_unknown_session_creates_no_room() {
        let mut table = RoomTable::new();
        for i in 0..1000 {
            let s = SessionId::from(format!("bogus-{i}"));
            assert!(table.set_agent_ready(&s).deliveries.is_empty());
            assert!(table.set_shell_ready(&s).deliveries.is_empty());
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_agent_leave_keeps_readiness() {
        let mut table = RoomTable::new();
        let s = SessionId::from("s1");
        table.join(conn(1), Role::Client, &s);
        table.join(conn(10), Role::Agent, &s);
        table.set_agent_ready(&s);
        table.set_shell_ready(&s);

        let left = table.leave(conn(10), &s);
        assert!(left.reclaim.is_empty());
        assert_eq!(
            table.readiness(&s),
            Some(Readiness {
                agent_connected: true,
                shell_ready: true,
            })
        );
        assert_eq!(table.members(&s), vec![conn(1)]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(u64, u8),
        Leave(u64, u8),
        Disconnect(u64),
        AgentReady(u8),
    }

    // Connections 0..3 are clients, 3..6 are agents
    const FIRST_AGENT: u64 = 3;

    fn role_of(c: u64) -> Role {
        if c >= FIRST_AGENT {
            Role::Agent
        } else {
            Role::Client
        }
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6u64, 0..3u8).prop_map(|(c, s)| Op::Join(c, s)),
            (0..6u64, 0..3u8).prop_map(|(c, s)| Op::Leave(c, s)),
            (0..6u64).prop_map(Op::Disconnect),
            (0..5u8).prop_map(Op::AgentReady),
        ]
    }

    /// Remove `c` from a modelled room: (reclaimed, room dropped)
    fn model_detach(members: &mut HashSet<u64>, c: u64) -> (bool, bool) {
        if !members.remove(&c) {
            return (false, false);
        }
        let has_clients = members.iter().any(|m| role_of(*m) == Role::Client);
        let reclaim = role_of(c) == Role::Client && !has_clients;
        (reclaim, reclaim || members.is_empty())
    }

    fn session(n: u8) -> SessionId {
        SessionId::from(format!("s{n}"))
    }

    proptest! {
        // Reclamation fires exactly when a room's last client goes away, and
        // rooms nobody is in never linger
        #[test]
        fn test_reclaim_exactly_once_per_emptying(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut table = RoomTable::new();
            let mut model: HashMap<u8, HashSet<u64>> = HashMap::new();

            for op in ops {
                let (transition, mut expected) = match op {
                    Op::Join(c, s) => {
                        model.entry(s).or_default().insert(c);
                        (table.join(conn(c), role_of(c), &session(s)), Vec::new())
                    }
                    Op::Leave(c, s) => {
                        let mut expected = Vec::new();
                        if let Some(members) = model.get_mut(&s) {
                            let (reclaim, dropped) = model_detach(members, c);
                            if reclaim {
                                expected.push(session(s));
                            }
                            if dropped {
                                model.remove(&s);
                            }
                        }
                        (table.leave(conn(c), &session(s)), expected)
                    }
                    Op::Disconnect(c) => {
                        let mut expected = Vec::new();
                        model.retain(|s, members| {
                            let (reclaim, dropped) = model_detach(members, c);
                            if reclaim {
                                expected.push(session(*s));
                            }
                            !dropped
                        });
                        (table.disconnect(conn(c)), expected)
                    }
                    // Sessions 3 and 4 are never joined
                    Op::AgentReady(s) => (table.set_agent_ready(&session(s)), Vec::new()),
                };

                let mut reclaimed = transition.reclaim.clone();
                reclaimed.sort();
                expected.sort();
                prop_assert_eq!(reclaimed, expected);
                prop_assert_eq!(table.len(), model.len());

                for (s, members) in &model {
                    let mut want: Vec<ConnectionId> = members.iter().map(|c| conn(*c)).collect();
                    want.sort();
                    prop_assert_eq!(table.members(&session(*s)), want);
                }
            }
        }

        // Broadcast reaches exactly the room's members
        #[test]
        fn test_broadcast_reaches_exactly_members(
            joins in prop::collection::vec((0..6u64, 0..3u8), 0..20),
            target in 0..3u8,
        ) {
            let mut table = RoomTable::new();
            let mut expected: HashSet<ConnectionId> = HashSet::new();
            for (c, s) in joins {
                table.join(conn(c), Role::Client, &session(s));
                if s == target {
                    expected.insert(conn(c));
                }
            }

            let transition = table.broadcast(&session(target), &RelayEvent::stdout("x"), None);
            let got: HashSet<ConnectionId> = transition.deliveries.iter().map(|d| d.to).collect();
            prop_assert_eq!(transition.deliveries.len(), expected.len());
            prop_assert_eq!(got, expected);
        }
    }
}
