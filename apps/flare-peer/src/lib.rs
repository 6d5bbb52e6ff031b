pub mod client;
pub mod config;
pub mod engine;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use client::{ClientEvent, GatewayClient, PeerSummary};
pub use config::{Cli, PeerConfig, TransportKind};
pub use engine::{ConnectionState, NegotiationEngine, Negotiator, Role};
pub use signaling::{
    CloseReason, GatewayConnection, GatewayConnector, GatewayEvent, ReconnectPolicy,
    SignalingChannel, SignalingError,
};
pub use transport::{LocalTrack, TrackKind};
