//! Server-side room registry.
//!
//! Each room owns a replica of the document and a relay awareness map behind
//! its own mutex, so merges in one room never wait on another. Rooms appear
//! on first join and are dropped when their last member leaves. Messages are
//! fanned out with `try_send` after the room lock is released: delivery is
//! at-most-once and a slow member loses messages instead of stalling the
//! room.

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::protocol::Message;
use coderoom_core::{ConnectionId, ReplicaId, RoomId, StateVector};
use coderoom_doc::{AwarenessTracker, MergeOutcome, ReplicatedText, SharedOutput};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Replica id the hub uses for its own copy; it never originates operations.
const HUB_REPLICA: &str = "hub";

struct Member {
    replica: ReplicaId,
    tx: mpsc::Sender<Message>,
}

struct RoomState {
    doc: ReplicatedText,
    awareness: AwarenessTracker,
    output: SharedOutput,
    members: BTreeMap<ConnectionId, Member>,
    /// Set once the room has been removed from the registry.
    closed: bool,
}

struct Room {
    id: RoomId,
    state: Mutex<RoomState>,
}

/// Messages to deliver once the room lock is released.
type Deliveries = Vec<(ConnectionId, mpsc::Sender<Message>, Message)>;

/// Result of a successful [`Hub::join`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Joined {
    pub connection_id: ConnectionId,
    pub replica_id: ReplicaId,
}

pub struct Hub {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    config: ServerConfig,
}

impl Hub {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Add a connection to `room`, creating the room if needed.
    ///
    /// `WELCOME` is queued on `tx` before the member becomes visible to the
    /// rest of the room, so it is always the first message delivered.
    pub fn join(
        &self,
        room_id: &RoomId,
        requested: Option<ReplicaId>,
        known: Option<StateVector>,
        tx: mpsc::Sender<Message>,
    ) -> Result<Joined> {
        loop {
            let room = self.room(room_id);
            let mut state = room.state.lock();
            if state.closed {
                // Torn down between lookup and lock; the next lookup recreates it.
                continue;
            }
            if state.members.len() >= self.config.max_peers_per_room {
                warn!(room = %room_id, "Room is full, refusing join");
                return Err(SyncError::RoomFull(room_id.to_string()));
            }

            let connection_id = ConnectionId::generate();
            let replica_id = match requested {
                Some(replica)
                    if !replica.is_empty()
                        && replica.as_str() != HUB_REPLICA
                        && !state.members.values().any(|m| m.replica == replica) =>
                {
                    replica
                }
                _ => ReplicaId::generate(),
            };
            let operations = state.doc.diff_since(&known.unwrap_or_default());
            let welcome = Message::Welcome {
                connection_id: connection_id.clone(),
                replica_id: replica_id.clone(),
                operations,
                presence: state.awareness.snapshot(),
                output: state.output.state().cloned(),
            };
            if tx.try_send(welcome).is_err() {
                return Err(SyncError::ConnectionClosed);
            }

            state.members.insert(
                connection_id.clone(),
                Member {
                    replica: replica_id.clone(),
                    tx,
                },
            );
            info!(
                room = %room_id,
                connection = %connection_id,
                replica = %replica_id,
                members = state.members.len(),
                "Connection joined"
            );
            return Ok(Joined {
                connection_id,
                replica_id,
            });
        }
    }

    /// Process one message from a joined connection.
    pub fn handle(&self, room_id: &RoomId, from: &ConnectionId, message: Message) {
        let Some(room) = self.rooms.read().get(room_id).cloned() else {
            warn!(room = %room_id, connection = %from, "Message for unknown room dropped");
            return;
        };

        let deliveries = {
            let mut state = room.state.lock();
            let Some((sender, replica)) = state
                .members
                .get(from)
                .map(|m| (m.tx.clone(), m.replica.clone()))
            else {
                warn!(room = %room_id, connection = %from, "Message from non-member dropped");
                return;
            };
            match message {
                Message::SyncRequest { state_vector } => {
                    let response = Message::SyncResponse {
                        operations: state.doc.diff_since(&state_vector),
                        state_vector: state.doc.state_vector(),
                    };
                    vec![(from.clone(), sender, response)]
                }
                Message::Update { operation } => match state.doc.merge(operation.clone()) {
                    Ok(MergeOutcome::Duplicate) => Vec::new(),
                    Ok(_) => broadcast(&state, from, Message::Update { operation }),
                    Err(err) => {
                        warn!(room = %room_id, connection = %from, error = %err, "Dropping malformed update");
                        Vec::new()
                    }
                },
                Message::AwarenessDelta { delta } => {
                    if delta.connection_id != *from {
                        warn!(
                            room = %room_id,
                            connection = %from,
                            target = %delta.connection_id,
                            "Dropping awareness update for another connection"
                        );
                        return;
                    }
                    state.awareness.apply_remote(&delta);
                    broadcast(&state, from, Message::AwarenessDelta { delta })
                }
                Message::Output { output } => {
                    if output.replica != replica {
                        warn!(room = %room_id, connection = %from, "Dropping output written for another replica");
                        return;
                    }
                    if !state.output.apply_remote(&output) {
                        return;
                    }
                    debug!(room = %room_id, connection = %from, cleared = output.is_cleared(), "Run output replaced");
                    broadcast(&state, from, Message::Output { output })
                }
                Message::PresenceLeave { .. } => {
                    drop(state);
                    self.leave(room_id, from);
                    return;
                }
                Message::Ping => vec![(from.clone(), sender, Message::Pong)],
                Message::Pong => Vec::new(),
                other @ (Message::Join { .. } | Message::Welcome { .. } | Message::SyncResponse { .. }) => {
                    warn!(room = %room_id, connection = %from, kind = other.kind(), "Unexpected message dropped");
                    Vec::new()
                }
            }
        };
        deliver(&room.id, deliveries);
    }

    /// Remove a connection, announcing its departure. The room is dropped
    /// once empty.
    pub fn leave(&self, room_id: &RoomId, connection_id: &ConnectionId) {
        let Some(room) = self.rooms.read().get(room_id).cloned() else {
            return;
        };

        // Held until the room is settled so the member's channel closes last.
        let _departed;
        let (deliveries, now_empty) = {
            let mut state = room.state.lock();
            let Some(member) = state.members.remove(connection_id) else {
                return;
            };
            _departed = member;
            state.awareness.remove(connection_id);
            info!(room = %room_id, connection = %connection_id, members = state.members.len(), "Connection left");
            let leave = Message::PresenceLeave {
                connection_id: connection_id.clone(),
            };
            (broadcast(&state, connection_id, leave), state.members.is_empty())
        };
        deliver(&room.id, deliveries);

        if now_empty {
            let mut rooms = self.rooms.write();
            let mut state = room.state.lock();
            if state.members.is_empty() && !state.closed {
                state.closed = true;
                rooms.remove(room_id);
                info!(room = %room_id, "Room closed");
            }
        }
    }

    /// Expire silent presence entries in every room.
    pub fn sweep(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().values().cloned().collect();
        let mut expired_total = 0;
        for room in rooms {
            let deliveries = {
                let mut state = room.state.lock();
                let expired = state.awareness.expire();
                expired_total += expired.len();
                let mut deliveries = Vec::new();
                for connection_id in expired {
                    let leave = Message::PresenceLeave {
                        connection_id: connection_id.clone(),
                    };
                    deliveries.extend(broadcast(&state, &connection_id, leave));
                }
                deliveries
            };
            deliver(&room.id, deliveries);
        }
        expired_total
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .read()
            .get(room_id)
            .map_or(0, |room| room.state.lock().members.len())
    }

    /// Current text of a room, if it exists.
    pub fn room_text(&self, room_id: &RoomId) -> Option<String> {
        self.rooms
            .read()
            .get(room_id)
            .map(|room| room.state.lock().doc.text())
    }

    /// Code last run in a room, empty when cleared or never run.
    pub fn room_output(&self, room_id: &RoomId) -> Option<String> {
        self.rooms
            .read()
            .get(room_id)
            .map(|room| room.state.lock().output.code().to_string())
    }

    fn room(&self, room_id: &RoomId) -> Arc<Room> {
        if let Some(room) = self.rooms.read().get(room_id) {
            return room.clone();
        }
        self.rooms
            .write()
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!(room = %room_id, "Room created");
                Arc::new(Room {
                    id: room_id.clone(),
                    state: Mutex::new(RoomState {
                        doc: ReplicatedText::new(HUB_REPLICA),
                        awareness: AwarenessTracker::relay()
                            .with_expiry(self.config.presence_expiry_ms),
                        output: SharedOutput::new(HUB_REPLICA),
                        members: BTreeMap::new(),
                        closed: false,
                    }),
                })
            })
            .clone()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

fn broadcast(state: &RoomState, except: &ConnectionId, message: Message) -> Deliveries {
    state
        .members
        .iter()
        .filter(|(id, _)| *id != except)
        .map(|(id, member)| (id.clone(), member.tx.clone(), message.clone()))
        .collect()
}

fn deliver(room: &RoomId, deliveries: Deliveries) {
    for (connection_id, tx, message) in deliveries {
        let kind = message.kind();
        match tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(room = %room, connection = %connection_id, kind, "Outbound queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(room = %room, connection = %connection_id, kind, "Connection gone, message dropped");
            }
        }
    }
}
