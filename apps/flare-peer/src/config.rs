use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use flare_proto::SessionId;

use crate::signaling::{derive_websocket_url, GatewayConnector, ReconnectPolicy};
use crate::transport::{
    LocalTrack, MemoryFactory, RtcOptions, TrackKind, TransportFactory, WebRtcFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Real peer connections.
    Webrtc,
    /// Loopback transports that only exercise the signaling path.
    Memory,
}

#[derive(Debug, Parser)]
#[command(
    name = "flare-peer",
    author,
    version,
    about = "Joins a flare session and negotiates a connection with every other participant"
)]
pub struct Cli {
    /// Base url of the gateway (http, https, ws or wss).
    #[arg(long, env = "FLARE_PEER_GATEWAY", default_value = "ws://127.0.0.1:8480")]
    pub gateway: String,

    /// Access token presented when the websocket is opened.
    #[arg(long, env = "FLARE_PEER_TOKEN")]
    pub token: String,

    /// Session to join.
    #[arg(long, env = "FLARE_PEER_SESSION")]
    pub session: SessionId,

    /// STUN/TURN url; repeat for several. Defaults to a public STUN server.
    #[arg(long = "ice-server", env = "FLARE_PEER_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    #[arg(long, env = "FLARE_PEER_TRANSPORT", value_enum, default_value_t = TransportKind::Webrtc)]
    pub transport: TransportKind,

    /// Request an ICE restart on every renegotiation offer.
    #[arg(
        long,
        env = "FLARE_PEER_ICE_RESTART",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub ice_restart: bool,

    #[arg(long, env = "FLARE_PEER_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Outgoing track to offer (audio or video); repeat for several.
    #[arg(long = "track", env = "FLARE_PEER_TRACKS", value_delimiter = ',')]
    pub tracks: Vec<TrackKind>,

    /// Rejoin attempts after the gateway link drops; 0 disables reconnecting.
    #[arg(long, env = "FLARE_PEER_RECONNECT_ATTEMPTS", default_value_t = 5)]
    pub reconnect_attempts: usize,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub gateway: String,
    pub token: String,
    pub session: SessionId,
    pub transport: TransportKind,
    pub rtc: RtcOptions,
    pub heartbeat: Duration,
    pub tracks: Vec<LocalTrack>,
    pub reconnect: ReconnectPolicy,
}

impl TryFrom<Cli> for PeerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.token.trim().is_empty() {
            anyhow::bail!("access token must not be empty");
        }
        derive_websocket_url(&cli.gateway, &cli.token)
            .with_context(|| format!("invalid gateway url: {}", cli.gateway))?;
        if cli.heartbeat_secs == 0 {
            anyhow::bail!("heartbeat interval must be at least one second");
        }

        let mut rtc = RtcOptions {
            ice_restart: cli.ice_restart,
            ..RtcOptions::default()
        };
        if !cli.ice_servers.is_empty() {
            rtc.ice_servers = cli.ice_servers;
        }

        let tracks = cli
            .tracks
            .iter()
            .enumerate()
            .map(|(index, kind)| LocalTrack::new(format!("{kind}-{index}"), *kind))
            .collect();

        Ok(PeerConfig {
            gateway: cli.gateway,
            token: cli.token,
            session: cli.session,
            transport: cli.transport,
            rtc,
            heartbeat: Duration::from_secs(cli.heartbeat_secs),
            tracks,
            reconnect: ReconnectPolicy {
                max_attempts: cli.reconnect_attempts,
                ..ReconnectPolicy::default()
            },
        })
    }
}

impl PeerConfig {
    pub fn transport_factory(&self) -> Result<Arc<dyn TransportFactory>> {
        Ok(match self.transport {
            TransportKind::Webrtc => Arc::new(
                WebRtcFactory::new(self.rtc.clone()).context("failed to build webrtc api")?,
            ),
            TransportKind::Memory => Arc::new(MemoryFactory::new()),
        })
    }

    pub fn connector(&self) -> GatewayConnector {
        GatewayConnector::new(&self.gateway, &self.token, self.heartbeat)
            .with_policy(self.reconnect.clone())
    }
}
