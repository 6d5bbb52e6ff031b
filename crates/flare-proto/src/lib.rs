//! Message shapes exchanged between the Flare signaling gateway and the peers
//! that negotiate through it. Both sides depend on this crate so the JSON
//! framing never drifts between the server and the client library.

mod ids;
mod messages;
mod payload;

pub use ids::{ConnectionId, IdParseError, ParticipantId, SessionId};
pub use messages::{
    CallRejection, CallReply, ClientMessage, GatewayCall, ParticipantInfo, RejectionCode,
    RelayKind, ServerMessage,
};
pub use payload::{IceCandidate, PayloadError, SdpKind, SessionDescription};
