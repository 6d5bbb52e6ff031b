use serde::{Deserialize, Serialize};

use crate::{ParticipantId, SessionId};

/// Display metadata for a participant, rendered by peers before media flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    #[serde(rename = "screenName")]
    pub screen_name: String,
}

impl ParticipantInfo {
    pub fn new(screen_name: impl Into<String>) -> Self {
        Self {
            screen_name: screen_name.into(),
        }
    }
}

/// Calls a connected peer may invoke on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum GatewayCall {
    JoinSession {
        session_id: SessionId,
    },
    LeaveCurrentSession,
    SendIceCandidate {
        destination: ParticipantId,
        payload: String,
    },
    SendSessionDescription {
        destination: ParticipantId,
        payload: String,
    },
    GetParticipant {
        participant_id: ParticipantId,
    },
}

impl GatewayCall {
    pub fn method(&self) -> &'static str {
        match self {
            GatewayCall::JoinSession { .. } => "join_session",
            GatewayCall::LeaveCurrentSession => "leave_current_session",
            GatewayCall::SendIceCandidate { .. } => "send_ice_candidate",
            GatewayCall::SendSessionDescription { .. } => "send_session_description",
            GatewayCall::GetParticipant { .. } => "get_participant",
        }
    }
}

/// The two payload families the gateway relays without interpreting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKind {
    IceCandidate,
    SessionDescription,
}

impl RelayKind {
    pub fn label(self) -> &'static str {
        match self {
            RelayKind::IceCandidate => "ice_candidate",
            RelayKind::SessionDescription => "session_description",
        }
    }
}

/// Messages sent from a peer to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Invoke {
        invocation_id: u64,
        call: GatewayCall,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallReply {
    Ack,
    Participant { info: ParticipantInfo },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    Unauthorized,
    NoActiveSession,
    DestinationNotFound,
    ParticipantNotFound,
    BadRequest,
}

/// Reason a call was refused. The caller learns the specific code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRejection {
    pub code: RejectionCode,
    pub message: String,
}

impl CallRejection {
    pub fn new(code: RejectionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Messages sent from the gateway to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Completion {
        invocation_id: u64,
        result: Result<CallReply, CallRejection>,
    },
    ParticipantJoined {
        participant_id: ParticipantId,
        info: ParticipantInfo,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    IceCandidate {
        origin: ParticipantId,
        payload: String,
    },
    SessionDescription {
        origin: ParticipantId,
        payload: String,
        info: ParticipantInfo,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Completion { .. } => "completion",
            ServerMessage::ParticipantJoined { .. } => "participant_joined",
            ServerMessage::ParticipantLeft { .. } => "participant_left",
            ServerMessage::IceCandidate { .. } => "ice_candidate",
            ServerMessage::SessionDescription { .. } => "session_description",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}
