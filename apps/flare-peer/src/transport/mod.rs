use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use flare_proto::{IceCandidate, ParticipantId, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod webrtc;

pub use memory::{MemoryFactory, MemoryTransport};
pub use self::webrtc::{RtcOptions, WebRtcFactory};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("transport closed")]
    Closed,
}

/// Offer/answer exchange state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Connectivity as reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
    RemoteTrack { track_id: String, kind: String },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "audio" => Ok(TrackKind::Audio),
            "video" => Ok(TrackKind::Video),
            other => Err(format!("unknown track kind {other}")),
        }
    }
}

/// Outgoing media the local participant offers to every remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Local changes counted against what the remote has acknowledged. The
/// initial data channel counts as the first change; answering a remote offer
/// settles only that one, later track changes need an offer of our own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationTracker {
    requested: u64,
    offered: u64,
    settled: u64,
}

impl Default for NegotiationTracker {
    fn default() -> Self {
        Self {
            requested: 1,
            offered: 0,
            settled: 0,
        }
    }
}

impl NegotiationTracker {
    pub fn request(&mut self) {
        self.requested += 1;
    }

    pub fn offer_created(&mut self) {
        self.offered = self.requested;
    }

    pub fn answered(&mut self) {
        self.offered = self.settled.max(1);
    }

    pub fn rolled_back(&mut self) {
        self.offered = self.settled;
    }

    /// Signaling returned to stable after an answer.
    pub fn settle(&mut self) {
        self.settled = self.settled.max(self.offered);
    }

    pub fn is_pending(&self) -> bool {
        self.settled < self.requested
    }
}

/// One negotiated connection towards a single remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Discards the pending local offer and returns to `Stable`.
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Attaches outgoing media. Adding an attached track again is a no-op.
    async fn add_track(&self, track: LocalTrack) -> Result<(), TransportError>;

    /// Detaches outgoing media. Unknown ids are ignored.
    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;

    /// Whether local state still differs from what was last negotiated.
    fn negotiation_pending(&self) -> bool;

    /// Stops inbound media and releases the connection. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        remote: ParticipantId,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn answering_settles_only_the_initial_change() {
        let mut tracker = NegotiationTracker::default();
        tracker.request();

        tracker.answered();
        tracker.settle();
        assert!(tracker.is_pending());

        tracker.offer_created();
        tracker.settle();
        assert!(!tracker.is_pending());
    }

    #[test_timeout::timeout]
    fn rollback_forgets_the_discarded_offer() {
        let mut tracker = NegotiationTracker::default();
        tracker.offer_created();
        tracker.rolled_back();
        tracker.answered();
        tracker.settle();
        assert!(!tracker.is_pending());

        tracker.request();
        tracker.offer_created();
        tracker.rolled_back();
        tracker.answered();
        tracker.settle();
        assert!(tracker.is_pending());
    }

    #[test_timeout::timeout]
    fn track_kind_parses_its_own_label() {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            assert_eq!(kind.as_str().parse::<TrackKind>(), Ok(kind));
        }
        assert!("screen".parse::<TrackKind>().is_err());
    }
}
