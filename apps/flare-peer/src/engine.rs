//! Perfect Negotiation towards one remote participant.
//!
//! [`Negotiator`] holds the state machine and performs each step against a
//! [`PeerTransport`]; [`NegotiationEngine`] wraps it in a task so inbound relay
//! messages and transport events for one remote are handled strictly one at a
//! time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flare_proto::{IceCandidate, ParticipantId, PayloadError, SessionDescription};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::signaling::{SignalingChannel, SignalingError};
use crate::transport::{
    Connectivity, LocalTrack, PeerTransport, SignalingState, TransportError, TransportEvent,
    TransportEvents,
};

/// Fixed per-pair role. The side that learned of the remote through a join
/// notification is impolite; the side that learned of it through an
/// unexpected description is polite and yields on collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

impl Role {
    pub fn is_polite(self) -> bool {
        self == Role::Polite
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Ready,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to apply remote description: {0}")]
    ApplyFailed(#[source] TransportError),
    #[error("failed to apply remote candidate: {0}")]
    CandidateFailed(#[source] TransportError),
    #[error("failed to produce local description: {0}")]
    LocalDescription(#[source] TransportError),
    #[error("failed to update local tracks: {0}")]
    Tracks(#[source] TransportError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("failed to relay to remote: {0}")]
    Relay(#[from] SignalingError),
}

pub struct Negotiator {
    remote: ParticipantId,
    role: Role,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingChannel>,
    ice_restart: bool,
    making_offer: bool,
    ignore_offer: bool,
    tracks: Vec<LocalTrack>,
    state: ConnectionState,
    closed: bool,
}

impl Negotiator {
    pub fn new(
        remote: ParticipantId,
        role: Role,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingChannel>,
        ice_restart: bool,
    ) -> Self {
        Self {
            remote,
            role,
            transport,
            signaling,
            ice_restart,
            making_offer: false,
            ignore_offer: false,
            tracks: Vec::new(),
            state: ConnectionState::New,
            closed: false,
        }
    }

    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn ignore_offer(&self) -> bool {
        self.ignore_offer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Produces and relays a local offer. `making_offer` covers the whole
    /// window and is cleared whether or not the offer went out.
    pub async fn on_negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        if self.closed {
            return Ok(());
        }
        if self.transport.signaling_state() != SignalingState::Stable
            || !self.transport.negotiation_pending()
        {
            debug!(remote = %self.remote, "negotiation not needed in current state");
            return Ok(());
        }

        self.making_offer = true;
        let result = self.send_offer().await;
        self.making_offer = false;
        result
    }

    async fn send_offer(&mut self) -> Result<(), NegotiationError> {
        let offer = self
            .transport
            .create_offer(self.ice_restart)
            .await
            .map_err(NegotiationError::LocalDescription)?;
        self.transport
            .set_local_description(offer.clone())
            .await
            .map_err(NegotiationError::LocalDescription)?;
        self.mark_connecting();
        self.signaling
            .send_session_description(self.remote, offer.encode()?)
            .await?;
        debug!(remote = %self.remote, role = ?self.role, "sent offer");
        Ok(())
    }

    pub async fn accept_description(&mut self, payload: &str) -> Result<(), NegotiationError> {
        if self.closed {
            return Ok(());
        }
        let description = SessionDescription::decode(payload)?;
        let offer_collision = description.is_offer()
            && (self.making_offer || self.transport.signaling_state() != SignalingState::Stable);

        self.ignore_offer = !self.role.is_polite() && offer_collision;
        if self.ignore_offer {
            debug!(remote = %self.remote, "ignoring colliding offer");
            return Ok(());
        }
        self.mark_connecting();

        if offer_collision {
            // Rollback and apply must both be attempted for the offer to land.
            debug!(remote = %self.remote, "rolling back local offer to accept remote one");
            self.transport
                .rollback()
                .await
                .map_err(NegotiationError::ApplyFailed)?;
        }
        let is_offer = description.is_offer();
        self.transport
            .set_remote_description(description)
            .await
            .map_err(NegotiationError::ApplyFailed)?;

        if is_offer {
            let answer = self
                .transport
                .create_answer()
                .await
                .map_err(NegotiationError::LocalDescription)?;
            self.transport
                .set_local_description(answer.clone())
                .await
                .map_err(NegotiationError::LocalDescription)?;
            self.signaling
                .send_session_description(self.remote, answer.encode()?)
                .await?;
            debug!(remote = %self.remote, "sent answer");
        }
        Ok(())
    }

    /// Applies a relayed candidate. Failures are swallowed while the offer
    /// the candidate belongs to is being ignored.
    pub async fn accept_candidate(&mut self, payload: &str) -> Result<(), NegotiationError> {
        if self.closed {
            return Ok(());
        }
        let candidate = IceCandidate::decode(payload)?;
        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(err) if self.ignore_offer => {
                debug!(remote = %self.remote, error = %err, "suppressed candidate of ignored offer");
                Ok(())
            }
            Err(err) => Err(NegotiationError::CandidateFailed(err)),
        }
    }

    pub async fn on_local_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.closed {
            return Ok(());
        }
        self.signaling
            .send_ice_candidate(self.remote, candidate.encode()?)
            .await?;
        Ok(())
    }

    /// Brings the transport's outgoing media in line with `tracks`. The
    /// transport raises negotiation-needed for whatever changed.
    pub async fn set_tracks(&mut self, tracks: &[LocalTrack]) -> Result<(), NegotiationError> {
        if self.closed {
            return Ok(());
        }
        for stale in self.tracks.iter().filter(|track| !tracks.contains(track)) {
            self.transport
                .remove_track(&stale.id)
                .await
                .map_err(NegotiationError::Tracks)?;
        }
        for fresh in tracks.iter().filter(|track| !self.tracks.contains(track)) {
            self.transport
                .add_track(fresh.clone())
                .await
                .map_err(NegotiationError::Tracks)?;
        }
        self.tracks = tracks.to_vec();
        debug!(remote = %self.remote, tracks = self.tracks.len(), "local tracks updated");
        Ok(())
    }

    /// Folds transport connectivity into the engine state. Returns the new
    /// state when it changed.
    pub fn on_connectivity(&mut self, connectivity: Connectivity) -> Option<ConnectionState> {
        let next = match connectivity {
            Connectivity::New => return None,
            Connectivity::Connecting => ConnectionState::Connecting,
            Connectivity::Connected => ConnectionState::Ready,
            Connectivity::Disconnected | Connectivity::Failed | Connectivity::Closed => {
                ConnectionState::Disconnected
            }
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.transport.close().await {
            warn!(remote = %self.remote, error = %err, "failed to close transport");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn mark_connecting(&mut self) {
        if self.state == ConnectionState::New {
            self.state = ConnectionState::Connecting;
        }
    }
}

/// Notifications an engine sends to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged {
        remote: ParticipantId,
        generation: u64,
        state: ConnectionState,
    },
    RemoteTrack {
        remote: ParticipantId,
        generation: u64,
        track_id: String,
        kind: String,
    },
}

enum Command {
    RemoteDescription(String),
    RemoteCandidate(String),
    SetTracks(Vec<LocalTrack>),
    Close(oneshot::Sender<()>),
}

/// Handle to the task that owns a [`Negotiator`]. Dropping it closes the
/// engine once the task drains its queue.
pub struct NegotiationEngine {
    remote: ParticipantId,
    role: Role,
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
}

impl NegotiationEngine {
    pub fn spawn(
        negotiator: Negotiator,
        transport_events: TransportEvents,
        generation: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let remote = negotiator.remote();
        let role = negotiator.role();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_engine(
            negotiator,
            commands_rx,
            transport_events,
            generation,
            events,
        ));
        Self {
            remote,
            role,
            generation,
            commands,
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn accept_description(&self, payload: String) {
        self.submit(Command::RemoteDescription(payload));
    }

    pub fn accept_candidate(&self, payload: String) {
        self.submit(Command::RemoteCandidate(payload));
    }

    pub fn set_tracks(&self, tracks: Vec<LocalTrack>) {
        self.submit(Command::SetTracks(tracks));
    }

    /// Stops accepting input immediately, then waits for the transport to be
    /// released. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn submit(&self, command: Command) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(command);
    }
}

async fn run_engine(
    mut negotiator: Negotiator,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut transport_events: TransportEvents,
    generation: u64,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let remote = negotiator.remote();
    let mut reported = negotiator.state();
    let mut transport_open = true;

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::RemoteDescription(payload)) => {
                    if let Err(err) = negotiator.accept_description(&payload).await {
                        warn!(remote = %remote, error = %err, "failed to accept description");
                    }
                }
                Some(Command::RemoteCandidate(payload)) => {
                    if let Err(err) = negotiator.accept_candidate(&payload).await {
                        warn!(remote = %remote, error = %err, "failed to accept candidate");
                    }
                }
                Some(Command::SetTracks(tracks)) => {
                    if let Err(err) = negotiator.set_tracks(&tracks).await {
                        warn!(remote = %remote, error = %err, "failed to update tracks");
                    }
                }
                Some(Command::Close(done)) => {
                    negotiator.close().await;
                    let _ = done.send(());
                    break;
                }
                None => {
                    negotiator.close().await;
                    break;
                }
            },
            event = transport_events.recv(), if transport_open => match event {
                Some(TransportEvent::NegotiationNeeded) => {
                    if let Err(err) = negotiator.on_negotiation_needed().await {
                        warn!(remote = %remote, error = %err, "failed to send offer");
                    }
                }
                Some(TransportEvent::LocalCandidate(candidate)) => {
                    if let Err(err) = negotiator.on_local_candidate(candidate).await {
                        warn!(remote = %remote, error = %err, "failed to send candidate");
                    }
                }
                Some(TransportEvent::Connectivity(connectivity)) => {
                    negotiator.on_connectivity(connectivity);
                }
                Some(TransportEvent::RemoteTrack { track_id, kind }) => {
                    let _ = events.send(EngineEvent::RemoteTrack {
                        remote,
                        generation,
                        track_id,
                        kind,
                    });
                }
                None => transport_open = false,
            },
        }

        if negotiator.state() != reported {
            reported = negotiator.state();
            let _ = events.send(EngineEvent::StateChanged {
                remote,
                generation,
                state: reported,
            });
        }
    }
    debug!(remote = %remote, generation, "negotiation engine stopped");
}
