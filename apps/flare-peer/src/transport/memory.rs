//! In-process transport that follows JSEP signaling rules but moves no data.
//! Headless runs and tests use it to exercise negotiation deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use flare_proto::{IceCandidate, ParticipantId, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use super::{
    Connectivity, LocalTrack, NegotiationTracker, PeerTransport, SignalingState, TrackKind,
    TransportError, TransportEvent, TransportEvents, TransportFactory,
};

const UFRAG_PREFIX: &str = "a=ice-ufrag:";
const MSID_PREFIX: &str = "a=msid:flare ";

pub struct MemoryTransport {
    remote: ParticipantId,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<MemoryState>,
}

struct MemoryState {
    signaling: SignalingState,
    connectivity: Connectivity,
    local_ufrag: String,
    version: u64,
    current_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    negotiation: NegotiationTracker,
    tracks: Vec<LocalTrack>,
    remote_tracks: HashSet<String>,
    rollbacks: usize,
}

impl MemoryTransport {
    /// Creates the transport and queues the initial negotiation-needed event,
    /// mirroring a pre-negotiated data channel on a fresh peer connection.
    pub fn new(remote: ParticipantId) -> (Arc<Self>, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            remote,
            events,
            state: Mutex::new(MemoryState {
                signaling: SignalingState::Stable,
                connectivity: Connectivity::New,
                local_ufrag: fresh_ufrag(),
                version: 0,
                current_local: None,
                current_remote: None,
                pending_local: None,
                pending_remote: None,
                remote_candidates: Vec::new(),
                negotiation: NegotiationTracker::default(),
                tracks: Vec::new(),
                remote_tracks: HashSet::new(),
                rollbacks: 0,
            }),
        });
        transport.emit(TransportEvent::NegotiationNeeded);
        (transport, rx)
    }

    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    pub fn rollback_count(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn current_remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().current_remote.clone()
    }

    pub fn local_track_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .tracks
            .iter()
            .map(|track| track.id.clone())
            .collect()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.state.lock().connectivity
    }

    /// Simulates losing the path to the remote side.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        if matches!(state.connectivity, Connectivity::Closed | Connectivity::Disconnected) {
            return;
        }
        state.connectivity = Connectivity::Disconnected;
        self.emit(TransportEvent::Connectivity(Connectivity::Disconnected));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn render(&self, kind: SdpKind, state: &MemoryState) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {remote} {version} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n{UFRAG_PREFIX}{ufrag}\r\n\
             a=setup:{setup}\r\n",
            remote = self.remote.as_uuid().simple(),
            version = state.version,
            ufrag = state.local_ufrag,
            setup = if kind == SdpKind::Offer { "actpass" } else { "active" },
        );
        for track in &state.tracks {
            sdp.push_str(&format!(
                "m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\n{MSID_PREFIX}{id}\r\n",
                kind = track.kind,
                id = track.id,
            ));
        }
        sdp
    }

    /// Emits a remote-track event for every track the description carries
    /// that an earlier one did not.
    fn announce_tracks(&self, state: &mut MemoryState, desc: &SessionDescription) {
        let present = tracks_of(desc);
        for (id, kind) in &present {
            if !state.remote_tracks.contains(id) {
                self.emit(TransportEvent::RemoteTrack {
                    track_id: id.clone(),
                    kind: kind.to_string(),
                });
            }
        }
        state.remote_tracks = present.into_iter().map(|(id, _)| id).collect();
    }

    fn local_candidate(&self, ufrag: &str, version: u64) {
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{version} 1 udp 2122260223 127.0.0.1 {port} typ host",
                port = 40000 + version
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some(ufrag.to_string()),
        }));
    }

    /// Records a local change; while stable the owner hears about it at once,
    /// otherwise the next settle reports it.
    fn request_negotiation(&self, state: &mut MemoryState) {
        state.negotiation.request();
        if state.signaling == SignalingState::Stable {
            self.emit(TransportEvent::NegotiationNeeded);
        }
    }

    fn begin_connecting(&self, state: &mut MemoryState) {
        if state.connectivity == Connectivity::New {
            state.connectivity = Connectivity::Connecting;
            self.emit(TransportEvent::Connectivity(Connectivity::Connecting));
        }
    }

    fn settle(&self, state: &mut MemoryState) {
        state.signaling = SignalingState::Stable;
        state.negotiation.settle();
        if state.current_local.is_some()
            && state.current_remote.is_some()
            && state.connectivity != Connectivity::Connected
        {
            state.connectivity = Connectivity::Connected;
            self.emit(TransportEvent::Connectivity(Connectivity::Connected));
        }
        if state.negotiation.is_pending() {
            self.emit(TransportEvent::NegotiationNeeded);
        }
    }
}

fn fresh_ufrag() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn ufrag_of(desc: &SessionDescription) -> Option<&str> {
    desc.sdp
        .lines()
        .find_map(|line| line.trim_end().strip_prefix(UFRAG_PREFIX))
}

fn tracks_of(desc: &SessionDescription) -> Vec<(String, TrackKind)> {
    let mut section: Option<TrackKind> = None;
    let mut tracks = Vec::new();
    for line in desc.sdp.lines().map(str::trim_end) {
        if let Some(media) = line.strip_prefix("m=") {
            section = media.split(' ').next().and_then(|kind| kind.parse().ok());
        } else if let (Some(id), Some(kind)) = (line.strip_prefix(MSID_PREFIX), section) {
            tracks.push((id.to_string(), kind));
        }
    }
    tracks
}

fn rejected(side: &str, kind: SdpKind, state: SignalingState) -> TransportError {
    TransportError::Description(format!(
        "cannot apply {side} {} in {state:?}",
        kind.as_str()
    ))
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        if ice_restart {
            state.local_ufrag = fresh_ufrag();
        }
        state.version += 1;
        state.negotiation.offer_created();
        Ok(SessionDescription::offer(self.render(SdpKind::Offer, &state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        match state.signaling {
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {}
            SignalingState::Closed => return Err(TransportError::Closed),
            other => {
                return Err(TransportError::Description(format!(
                    "no remote offer to answer in {other:?}"
                )))
            }
        }
        state.version += 1;
        Ok(SessionDescription::answer(self.render(SdpKind::Answer, &state)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let current = state.signaling;
        match (desc.kind, current) {
            (_, SignalingState::Closed) => return Err(TransportError::Closed),
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                state.pending_local = Some(desc);
                state.signaling = SignalingState::HaveLocalOffer;
            }
            (
                SdpKind::Answer,
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer,
            ) => {
                state.current_local = Some(desc);
                state.pending_local = None;
                state.current_remote = state.pending_remote.take();
                state.negotiation.answered();
                self.settle(&mut state);
            }
            (
                SdpKind::Pranswer,
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer,
            ) => {
                state.pending_local = Some(desc);
                state.signaling = SignalingState::HaveLocalPranswer;
            }
            (SdpKind::Rollback, SignalingState::HaveLocalOffer) => {
                state.pending_local = None;
                state.signaling = SignalingState::Stable;
                state.negotiation.rolled_back();
                state.rollbacks += 1;
                trace!(remote = %self.remote, "rolled back local offer");
                return Ok(());
            }
            (kind, from) => return Err(rejected("local", kind, from)),
        }
        self.begin_connecting(&mut state);
        let (ufrag, version) = (state.local_ufrag.clone(), state.version);
        self.local_candidate(&ufrag, version);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let current = state.signaling;
        match (desc.kind, current) {
            (_, SignalingState::Closed) => return Err(TransportError::Closed),
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                self.announce_tracks(&mut state, &desc);
                state.pending_remote = Some(desc);
                state.signaling = SignalingState::HaveRemoteOffer;
            }
            (
                SdpKind::Answer,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemotePranswer,
            ) => {
                self.announce_tracks(&mut state, &desc);
                state.current_remote = Some(desc);
                state.pending_remote = None;
                state.current_local = state.pending_local.take();
                self.settle(&mut state);
            }
            (
                SdpKind::Pranswer,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemotePranswer,
            ) => {
                state.pending_remote = Some(desc);
                state.signaling = SignalingState::HaveRemotePranswer;
            }
            (SdpKind::Rollback, SignalingState::HaveRemoteOffer) => {
                state.pending_remote = None;
                state.signaling = SignalingState::Stable;
                state.rollbacks += 1;
                return Ok(());
            }
            (kind, from) => return Err(rejected("remote", kind, from)),
        }
        self.begin_connecting(&mut state);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        if self.signaling_state() == SignalingState::HaveRemoteOffer {
            self.set_remote_description(rollback).await
        } else {
            self.set_local_description(rollback).await
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        let remote = state
            .pending_remote
            .as_ref()
            .or(state.current_remote.as_ref())
            .ok_or_else(|| TransportError::Candidate("no remote description".into()))?;
        if let Some(fragment) = candidate.username_fragment.as_deref() {
            if ufrag_of(remote) != Some(fragment) {
                return Err(TransportError::Candidate(format!(
                    "unknown username fragment {fragment}"
                )));
            }
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        if state.tracks.iter().any(|existing| existing.id == track.id) {
            return Ok(());
        }
        state.tracks.push(track);
        self.request_negotiation(&mut state);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        let before = state.tracks.len();
        state.tracks.retain(|track| track.id != track_id);
        if state.tracks.len() != before {
            self.request_negotiation(&mut state);
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn negotiation_pending(&self) -> bool {
        self.state.lock().negotiation.is_pending()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Ok(());
        }
        state.signaling = SignalingState::Closed;
        state.connectivity = Connectivity::Closed;
        self.emit(TransportEvent::Connectivity(Connectivity::Closed));
        Ok(())
    }
}

/// Hands out memory transports and remembers the latest one per remote.
#[derive(Default)]
pub struct MemoryFactory {
    created: Mutex<HashMap<ParticipantId, Arc<MemoryTransport>>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport_for(&self, remote: ParticipantId) -> Option<Arc<MemoryTransport>> {
        self.created.lock().get(&remote).cloned()
    }
}

#[async_trait]
impl TransportFactory for MemoryFactory {
    async fn create(
        &self,
        remote: ParticipantId,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let (transport, events) = MemoryTransport::new(remote);
        self.created.lock().insert(remote, Arc::clone(&transport));
        Ok((transport, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut TransportEvents) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_round_connects_both_sides() {
        let (caller, mut caller_rx) = MemoryTransport::new(ParticipantId::new());
        let (callee, mut callee_rx) = MemoryTransport::new(ParticipantId::new());
        assert_eq!(drain(&mut caller_rx), vec![TransportEvent::NegotiationNeeded]);
        drain(&mut callee_rx);

        let offer = caller.create_offer(false).await.unwrap();
        caller.set_local_description(offer.clone()).await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        assert_eq!(caller.signaling_state(), SignalingState::Stable);
        assert_eq!(callee.signaling_state(), SignalingState::Stable);
        assert!(!caller.negotiation_pending());
        assert!(!callee.negotiation_pending());
        assert!(drain(&mut caller_rx)
            .contains(&TransportEvent::Connectivity(Connectivity::Connected)));
        assert!(drain(&mut callee_rx)
            .contains(&TransportEvent::Connectivity(Connectivity::Connected)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_offer_requires_rollback_in_have_local_offer() {
        let (left, _left_rx) = MemoryTransport::new(ParticipantId::new());
        let (right, _right_rx) = MemoryTransport::new(ParticipantId::new());
        let mine = left.create_offer(false).await.unwrap();
        left.set_local_description(mine).await.unwrap();
        let theirs = right.create_offer(false).await.unwrap();

        let err = left
            .set_remote_description(theirs.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Description(_)));

        left.rollback().await.unwrap();
        left.set_remote_description(theirs).await.unwrap();
        assert_eq!(left.signaling_state(), SignalingState::HaveRemoteOffer);
        assert_eq!(left.rollback_count(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_must_match_remote_description() {
        let (left, _left_rx) = MemoryTransport::new(ParticipantId::new());
        let (right, mut right_rx) = MemoryTransport::new(ParticipantId::new());
        drain(&mut right_rx);
        let offer = right.create_offer(false).await.unwrap();
        right.set_local_description(offer.clone()).await.unwrap();
        let candidate = drain(&mut right_rx)
            .into_iter()
            .find_map(|event| match event {
                TransportEvent::LocalCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .unwrap();

        let early = left.add_ice_candidate(candidate.clone()).await.unwrap_err();
        assert!(matches!(early, TransportError::Candidate(_)));

        left.set_remote_description(offer).await.unwrap();
        left.add_ice_candidate(candidate.clone()).await.unwrap();

        let foreign = IceCandidate {
            username_fragment: Some("zzzzzzzz".into()),
            ..candidate
        };
        assert!(left.add_ice_candidate(foreign).await.is_err());
        assert_eq!(left.remote_candidates().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent() {
        let (transport, mut rx) = MemoryTransport::new(ParticipantId::new());
        drain(&mut rx);

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::Connectivity(Connectivity::Closed)]
        );
        assert!(matches!(
            transport.create_offer(false).await,
            Err(TransportError::Closed)
        ));
    }

    async fn round(caller: &MemoryTransport, callee: &MemoryTransport) {
        let offer = caller.create_offer(false).await.unwrap();
        caller.set_local_description(offer.clone()).await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn answering_does_not_settle_local_tracks() {
        let (caller, _caller_rx) = MemoryTransport::new(ParticipantId::new());
        let (callee, mut callee_rx) = MemoryTransport::new(ParticipantId::new());
        callee
            .add_track(LocalTrack::new("cam", TrackKind::Video))
            .await
            .unwrap();
        drain(&mut callee_rx);

        round(&caller, &callee).await;

        assert!(!caller.negotiation_pending());
        assert!(callee.negotiation_pending());
        assert!(drain(&mut callee_rx).contains(&TransportEvent::NegotiationNeeded));
    }

    #[test_timeout::tokio_timeout_test]
    async fn offered_tracks_surface_once_on_the_remote_side() {
        let (caller, mut caller_rx) = MemoryTransport::new(ParticipantId::new());
        let (callee, mut callee_rx) = MemoryTransport::new(ParticipantId::new());
        round(&caller, &callee).await;
        drain(&mut caller_rx);
        drain(&mut callee_rx);

        caller
            .add_track(LocalTrack::new("mic", TrackKind::Audio))
            .await
            .unwrap();
        caller
            .add_track(LocalTrack::new("mic", TrackKind::Audio))
            .await
            .unwrap();
        assert!(caller.negotiation_pending());
        assert_eq!(drain(&mut caller_rx), vec![TransportEvent::NegotiationNeeded]);

        round(&caller, &callee).await;
        round(&caller, &callee).await;

        let announced: Vec<TransportEvent> = drain(&mut callee_rx)
            .into_iter()
            .filter(|event| matches!(event, TransportEvent::RemoteTrack { .. }))
            .collect();
        assert_eq!(
            announced,
            vec![TransportEvent::RemoteTrack {
                track_id: "mic".into(),
                kind: "audio".into()
            }]
        );
        assert!(!caller.negotiation_pending());

        caller.remove_track("mic").await.unwrap();
        caller.remove_track("unknown").await.unwrap();
        assert!(caller.negotiation_pending());
    }

    #[test_timeout::tokio_timeout_test]
    async fn sever_reports_disconnect_once() {
        let (transport, mut rx) = MemoryTransport::new(ParticipantId::new());
        drain(&mut rx);

        transport.sever();
        transport.sever();

        assert_eq!(transport.connectivity(), Connectivity::Disconnected);
        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::Connectivity(Connectivity::Disconnected)]
        );
    }
}
