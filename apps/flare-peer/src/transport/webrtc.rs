use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flare_proto::{IceCandidate, ParticipantId, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    Connectivity, LocalTrack, NegotiationTracker, PeerTransport, SignalingState, TrackKind,
    TransportError, TransportEvent, TransportEvents, TransportFactory,
};

/// Label and id of the pre-negotiated data channel every connection carries,
/// so negotiation has something to agree on before any media is attached.
const MANDATORY_CHANNEL_LABEL: &str = "mandatory";
const MANDATORY_CHANNEL_ID: u16 = 810;
const LOCAL_STREAM_ID: &str = "flare";

#[derive(Debug, Clone)]
pub struct RtcOptions {
    pub ice_servers: Vec<String>,
    pub ice_restart: bool,
}

impl Default for RtcOptions {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            ice_restart: true,
        }
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebRtcFactory {
    api: API,
    options: RtcOptions,
}

impl WebRtcFactory {
    pub fn new(options: RtcOptions) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api()?,
            options,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.options.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.options.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        remote: ParticipantId,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(to_setup_error)?,
        );
        let (events, rx) = mpsc::unbounded_channel();
        install_handlers(&pc, remote, events);

        let channel = pc
            .create_data_channel(
                MANDATORY_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    negotiated: Some(MANDATORY_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await
            .map_err(to_setup_error)?;
        debug!(remote = %remote, "peer connection created");

        let transport = WebRtcTransport {
            remote,
            pc,
            _channel: channel,
            negotiation: Mutex::new(NegotiationTracker::default()),
            senders: Mutex::new(HashMap::new()),
        };
        Ok((Arc::new(transport), rx))
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    remote: ParticipantId,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let negotiation_tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let _ = negotiation_tx.send(TransportEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let _ = candidate_tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => warn!(remote = %remote, error = %err, "failed to encode local candidate"),
            }
        }
        Box::pin(async {})
    }));

    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if let Some(connectivity) = map_connectivity(state) {
            let _ = state_tx.send(TransportEvent::Connectivity(connectivity));
        }
        Box::pin(async {})
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let _ = events.send(TransportEvent::RemoteTrack {
                track_id: track.id(),
                kind: track.kind().to_string(),
            });
            Box::pin(async {})
        },
    ));
}

fn map_connectivity(state: RTCPeerConnectionState) -> Option<Connectivity> {
    match state {
        RTCPeerConnectionState::New => Some(Connectivity::New),
        RTCPeerConnectionState::Connecting => Some(Connectivity::Connecting),
        RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
        RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
        RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
        RTCPeerConnectionState::Closed => Some(Connectivity::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_signaling(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::Description(
                "unspecified description type".into(),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            return Ok(rollback);
        }
    };
    converted.map_err(|err| TransportError::Description(err.to_string()))
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

struct WebRtcTransport {
    remote: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    _channel: Arc<RTCDataChannel>,
    negotiation: Mutex<NegotiationTracker>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            voice_activity_detection: false,
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        self.negotiation.lock().offer_created();
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let is_answer = desc.kind == SdpKind::Answer;
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        if is_answer {
            let mut negotiation = self.negotiation.lock();
            negotiation.answered();
            negotiation.settle();
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let is_answer = desc.kind == SdpKind::Answer;
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        if is_answer {
            self.negotiation.lock().settle();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        // The library refuses an empty local description, so roll back by
        // re-submitting the pending offer with its type switched.
        let mut pending = self
            .pc
            .pending_local_description()
            .await
            .ok_or_else(|| TransportError::Description("no pending local offer".into()))?;
        pending.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(pending)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        self.negotiation.lock().rolled_back();
        debug!(remote = %self.remote, "rolled back local offer");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), TransportError> {
        if self.senders.lock().contains_key(&track.id) {
            return Ok(());
        }
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind),
            track.id.clone(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_setup_error)?;

        // RTCP has to be read for the interceptors to run.
        let rtcp_sender = Arc::clone(&sender);
        let remote = self.remote;
        let track_id = track.id.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
            trace!(remote = %remote, track_id = %track_id, "rtcp reader stopped");
        });

        self.senders.lock().insert(track.id.clone(), sender);
        self.negotiation.lock().request();
        debug!(remote = %self.remote, track_id = %track.id, kind = %track.kind, "local track added");
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError> {
        let Some(sender) = self.senders.lock().remove(track_id) else {
            return Ok(());
        };
        self.pc.remove_track(&sender).await.map_err(to_setup_error)?;
        self.negotiation.lock().request();
        debug!(remote = %self.remote, track_id, "local track removed");
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling(self.pc.signaling_state())
    }

    fn negotiation_pending(&self) -> bool {
        self.negotiation.lock().is_pending()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return Ok(());
        }
        self.pc.close().await.map_err(to_setup_error)
    }
}
