use std::collections::HashMap;
use std::sync::Arc;

use flare_proto::{ParticipantId, ParticipantInfo, SessionId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{ConnectionState, EngineEvent, NegotiationEngine, Negotiator, Role};
use crate::signaling::{
    CloseReason, GatewayConnection, GatewayConnector, GatewayEvent, SignalingChannel,
    SignalingError,
};
use crate::transport::{LocalTrack, TransportFactory};

/// What the session owner sees of the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    PeerAdded {
        participant_id: ParticipantId,
        role: Role,
    },
    PeerInfo {
        participant_id: ParticipantId,
        info: ParticipantInfo,
    },
    PeerStateChanged {
        participant_id: ParticipantId,
        state: ConnectionState,
    },
    RemoteTrack {
        participant_id: ParticipantId,
        track_id: String,
        kind: String,
    },
    PeerRemoved {
        participant_id: ParticipantId,
    },
    /// The gateway link dropped and a rejoin is under way.
    Reconnecting,
    Reconnected,
    GatewayClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub participant_id: ParticipantId,
    pub role: Role,
    pub state: ConnectionState,
}

enum ClientCommand {
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    SetTracks(Vec<LocalTrack>),
    Shutdown(oneshot::Sender<()>),
}

type SharedConnection = Arc<Mutex<Arc<GatewayConnection>>>;

/// Joined session plus the engines for every remote participant in it.
pub struct GatewayClient {
    session_id: SessionId,
    connection: SharedConnection,
    commands: mpsc::UnboundedSender<ClientCommand>,
    task: JoinHandle<()>,
}

impl GatewayClient {
    /// Joins over a connection the caller owns. Losing it ends the client.
    pub async fn join(
        connection: Arc<GatewayConnection>,
        factory: Arc<dyn TransportFactory>,
        session_id: SessionId,
        ice_restart: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), SignalingError> {
        Self::start(connection, None, factory, session_id, ice_restart).await
    }

    /// Connects through `connector` and, whenever the link is lost rather
    /// than superseded, reconnects and rejoins with backoff.
    pub async fn connect(
        connector: GatewayConnector,
        factory: Arc<dyn TransportFactory>,
        session_id: SessionId,
        ice_restart: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), SignalingError> {
        let connection = connector.connect().await?;
        let started = Self::start(
            Arc::clone(&connection),
            Some(connector),
            factory,
            session_id,
            ice_restart,
        )
        .await;
        if started.is_err() {
            connection.close();
        }
        started
    }

    async fn start(
        connection: Arc<GatewayConnection>,
        connector: Option<GatewayConnector>,
        factory: Arc<dyn TransportFactory>,
        session_id: SessionId,
        ice_restart: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), SignalingError> {
        let gateway_events = connection.events()?;
        connection.join_session(session_id).await?;
        info!(session_id = %session_id, "joined session");

        let (client_events, client_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (engine_events, engine_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Arc::clone(&connection)));
        let mesh = Mesh {
            session_id,
            shared: Arc::clone(&shared),
            connector,
            connection,
            peers: PeerTable::new(factory, ice_restart, engine_events, client_events),
        };
        let task = tokio::spawn(mesh.run(gateway_events, engine_rx, commands_rx));

        Ok((
            Self {
                session_id,
                connection: shared,
                commands,
                task,
            },
            client_rx,
        ))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The gateway connection currently in use; changes after a reconnect.
    pub fn connection(&self) -> Arc<GatewayConnection> {
        self.connection.lock().clone()
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(ClientCommand::Peers(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Replaces the outgoing tracks offered to every current and future peer.
    pub fn set_tracks(&self, tracks: Vec<LocalTrack>) {
        let _ = self.commands.send(ClientCommand::SetTracks(tracks));
    }

    pub async fn participant_info(
        &self,
        participant_id: ParticipantId,
    ) -> Result<ParticipantInfo, SignalingError> {
        self.connection().participant_info(participant_id).await
    }

    /// Tears down every engine, then leaves the session on the gateway.
    pub async fn leave(self) -> Result<(), SignalingError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(ClientCommand::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        let _ = self.task.await;
        let connection = self.connection.lock().clone();
        connection.leave_session().await?;
        info!(session_id = %self.session_id, "left session");
        Ok(())
    }
}

struct Mesh {
    session_id: SessionId,
    shared: SharedConnection,
    connector: Option<GatewayConnector>,
    connection: Arc<GatewayConnection>,
    peers: PeerTable,
}

impl Mesh {
    async fn run(
        mut self,
        mut gateway_events: mpsc::UnboundedReceiver<GatewayEvent>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ClientCommand::Peers(reply)) => {
                        let _ = reply.send(self.peers.summaries());
                    }
                    Some(ClientCommand::SetTracks(tracks)) => self.peers.set_tracks(tracks),
                    Some(ClientCommand::Shutdown(done)) => {
                        self.peers.close_all().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.peers.close_all().await;
                        break;
                    }
                },
                event = gateway_events.recv() => match event {
                    Some(GatewayEvent::Closed { reason }) => match self.recover(reason).await {
                        Some(events) => gateway_events = events,
                        None => break,
                    },
                    None => match self.recover(CloseReason::Lost).await {
                        Some(events) => gateway_events = events,
                        None => break,
                    },
                    Some(event) => self.on_gateway_event(event).await,
                },
                Some(event) = engine_events.recv() => self.peers.on_engine_event(event).await,
            }
        }
        debug!("mesh loop stopped");
    }

    /// Drops every engine, then rejoins when the loss allows it. Returns the
    /// new event stream, or `None` once the client is finished.
    async fn recover(
        &mut self,
        reason: CloseReason,
    ) -> Option<mpsc::UnboundedReceiver<GatewayEvent>> {
        warn!(session_id = %self.session_id, ?reason, "gateway connection lost");
        self.peers.close_all().await;

        let connector = match (&self.connector, reason) {
            (Some(connector), CloseReason::Lost) => connector.clone(),
            _ => {
                self.peers.emit(ClientEvent::GatewayClosed);
                return None;
            }
        };

        self.peers.emit(ClientEvent::Reconnecting);
        match connector.rejoin(self.session_id).await {
            Ok((connection, events)) => {
                self.connection.close();
                *self.shared.lock() = Arc::clone(&connection);
                self.connection = connection;
                self.peers.emit(ClientEvent::Reconnected);
                Some(events)
            }
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "could not rejoin session");
                self.peers.emit(ClientEvent::GatewayClosed);
                None
            }
        }
    }

    async fn on_gateway_event(&mut self, event: GatewayEvent) {
        let signaling: Arc<dyn SignalingChannel> = self.connection.clone();
        match event {
            GatewayEvent::ParticipantJoined {
                participant_id,
                info,
            } => {
                self.peers.emit(ClientEvent::PeerInfo {
                    participant_id,
                    info,
                });
                self.peers
                    .add_peer(participant_id, Role::Impolite, signaling)
                    .await;
            }
            GatewayEvent::ParticipantLeft { participant_id } => {
                self.peers.remove_peer(participant_id).await;
            }
            GatewayEvent::SessionDescription {
                origin,
                payload,
                info,
            } => {
                if !self.peers.contains(origin) {
                    self.peers.emit(ClientEvent::PeerInfo {
                        participant_id: origin,
                        info,
                    });
                    self.peers.add_peer(origin, Role::Polite, signaling).await;
                }
                if let Some(engine) = self.peers.engine(origin) {
                    engine.accept_description(payload);
                }
            }
            GatewayEvent::IceCandidate { origin, payload } => match self.peers.engine(origin) {
                Some(engine) => engine.accept_candidate(payload),
                None => debug!(origin = %origin, "dropping candidate for unknown peer"),
            },
            GatewayEvent::Closed { .. } => {}
        }
    }
}

struct PeerEntry {
    engine: NegotiationEngine,
    state: ConnectionState,
}

/// One engine per remote participant, tagged with a generation so reports
/// from an engine that has since been replaced can be told apart.
struct PeerTable {
    factory: Arc<dyn TransportFactory>,
    ice_restart: bool,
    tracks: Vec<LocalTrack>,
    peers: HashMap<ParticipantId, PeerEntry>,
    next_generation: u64,
    engine_events: mpsc::UnboundedSender<EngineEvent>,
    client_events: mpsc::UnboundedSender<ClientEvent>,
}

impl PeerTable {
    fn new(
        factory: Arc<dyn TransportFactory>,
        ice_restart: bool,
        engine_events: mpsc::UnboundedSender<EngineEvent>,
        client_events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            factory,
            ice_restart,
            tracks: Vec::new(),
            peers: HashMap::new(),
            next_generation: 1,
            engine_events,
            client_events,
        }
    }

    fn contains(&self, remote: ParticipantId) -> bool {
        self.peers.contains_key(&remote)
    }

    fn engine(&self, remote: ParticipantId) -> Option<&NegotiationEngine> {
        self.peers.get(&remote).map(|entry| &entry.engine)
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::StateChanged {
                remote,
                generation,
                state,
            } => {
                let Some(entry) = self.peers.get_mut(&remote) else {
                    return;
                };
                if entry.engine.generation() != generation {
                    debug!(remote = %remote, generation, "ignoring state of replaced engine");
                    return;
                }
                entry.state = state;
                self.emit(ClientEvent::PeerStateChanged {
                    participant_id: remote,
                    state,
                });
                if state == ConnectionState::Disconnected {
                    self.remove_peer(remote).await;
                }
            }
            EngineEvent::RemoteTrack {
                remote,
                generation,
                track_id,
                kind,
            } => {
                let current = self
                    .peers
                    .get(&remote)
                    .is_some_and(|entry| entry.engine.generation() == generation);
                if current {
                    self.emit(ClientEvent::RemoteTrack {
                        participant_id: remote,
                        track_id,
                        kind,
                    });
                }
            }
        }
    }

    async fn add_peer(
        &mut self,
        remote: ParticipantId,
        role: Role,
        signaling: Arc<dyn SignalingChannel>,
    ) {
        // A stalled engine for the same participant is discarded first.
        self.remove_peer(remote).await;

        let (transport, transport_events) = match self.factory.create(remote).await {
            Ok(created) => created,
            Err(err) => {
                warn!(remote = %remote, error = %err, "failed to create transport");
                return;
            }
        };
        let negotiator = Negotiator::new(remote, role, transport, signaling, self.ice_restart);
        let generation = self.next_generation;
        self.next_generation += 1;
        let engine = NegotiationEngine::spawn(
            negotiator,
            transport_events,
            generation,
            self.engine_events.clone(),
        );
        if !self.tracks.is_empty() {
            engine.set_tracks(self.tracks.clone());
        }
        self.peers.insert(
            remote,
            PeerEntry {
                engine,
                state: ConnectionState::New,
            },
        );
        info!(remote = %remote, role = ?role, generation, "peer added");
        self.emit(ClientEvent::PeerAdded {
            participant_id: remote,
            role,
        });
    }

    async fn remove_peer(&mut self, remote: ParticipantId) {
        if let Some(entry) = self.peers.remove(&remote) {
            entry.engine.close().await;
            info!(remote = %remote, "peer removed");
            self.emit(ClientEvent::PeerRemoved {
                participant_id: remote,
            });
        }
    }

    fn set_tracks(&mut self, tracks: Vec<LocalTrack>) {
        for entry in self.peers.values() {
            entry.engine.set_tracks(tracks.clone());
        }
        info!(tracks = tracks.len(), peers = self.peers.len(), "local tracks replaced");
        self.tracks = tracks;
    }

    async fn close_all(&mut self) {
        let remotes: Vec<ParticipantId> = self.peers.keys().copied().collect();
        for remote in remotes {
            self.remove_peer(remote).await;
        }
    }

    fn summaries(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .peers
            .iter()
            .map(|(participant_id, entry)| PeerSummary {
                participant_id: *participant_id,
                role: entry.engine.role(),
                state: entry.state,
            })
            .collect();
        peers.sort_by_key(|peer| peer.participant_id);
        peers
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.client_events.send(event);
    }
}
