use std::collections::HashMap;

use flare_proto::{ConnectionId, ParticipantId, ServerMessage, SessionId};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Frames queued for the writer half of a connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    Close { reason: &'static str },
}

/// Addressable end of one physical connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    /// Creates a handle with a fresh id and the receiver its writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ConnectionId::new(), tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns false when the writer is gone.
    pub fn deliver(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    pub fn close(&self, reason: &'static str) -> bool {
        self.tx.send(Outbound::Close { reason }).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("participant {participant} is already served by connection {current}")]
    StaleConnection {
        participant: ParticipantId,
        current: ConnectionId,
    },
}

#[derive(Debug)]
pub enum JoinOutcome {
    Inserted,
    AlreadyJoined,
    Replaced(ConnectionHandle),
}

/// Result of a join together with the other members as seen at that instant.
#[derive(Debug)]
pub struct Joined {
    pub outcome: JoinOutcome,
    pub others: Vec<ConnectionHandle>,
}

/// Live connections of one session, at most one per participant.
#[derive(Debug)]
pub struct ConnectionRegistry {
    session_id: SessionId,
    entries: Mutex<HashMap<ParticipantId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Inserts `handle` for `participant` and, under the same guard, collects
    /// every other member. Of two concurrent joiners exactly one sees the other.
    pub fn join(
        &self,
        participant: ParticipantId,
        handle: ConnectionHandle,
        override_existing: bool,
    ) -> Result<Joined, RegistryError> {
        let mut entries = self.entries.lock();
        let outcome = match entries.get(&participant) {
            None => {
                entries.insert(participant, handle);
                JoinOutcome::Inserted
            }
            Some(current) if current.id() == handle.id() => JoinOutcome::AlreadyJoined,
            Some(current) if !override_existing => {
                return Err(RegistryError::StaleConnection {
                    participant,
                    current: current.id(),
                })
            }
            Some(_) => entries
                .insert(participant, handle)
                .map_or(JoinOutcome::Inserted, JoinOutcome::Replaced),
        };
        Ok(Joined {
            outcome,
            others: others_of(&entries, participant),
        })
    }

    /// Removes the entry only while it still belongs to `connection`, so a
    /// superseded connection can never evict its replacement. Returns the
    /// remaining members at the moment of removal.
    pub fn leave_if_current(
        &self,
        participant: ParticipantId,
        connection: ConnectionId,
    ) -> Option<Vec<ConnectionHandle>> {
        let mut entries = self.entries.lock();
        match entries.get(&participant) {
            Some(current) if current.id() == connection => {
                entries.remove(&participant);
                Some(others_of(&entries, participant))
            }
            _ => None,
        }
    }

    pub fn resolve(&self, participant: ParticipantId) -> Option<ConnectionHandle> {
        self.entries.lock().get(&participant).cloned()
    }

    pub fn is_current(&self, participant: ParticipantId, connection: ConnectionId) -> bool {
        self.entries
            .lock()
            .get(&participant)
            .is_some_and(|current| current.id() == connection)
    }

    pub fn snapshot(&self) -> Vec<(ParticipantId, ConnectionHandle)> {
        self.entries
            .lock()
            .iter()
            .map(|(participant, handle)| (*participant, handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn others_of(
    entries: &HashMap<ParticipantId, ConnectionHandle>,
    participant: ParticipantId,
) -> Vec<ConnectionHandle> {
    entries
        .iter()
        .filter(|(member, _)| **member != participant)
        .map(|(_, handle)| handle.clone())
        .collect()
}
