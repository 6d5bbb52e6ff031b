use anyhow::{Context, Result};
use clap::Parser;
use flare_peer::{telemetry, Cli, ClientEvent, GatewayClient, PeerConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let cli = Cli::parse();
    let config = PeerConfig::try_from(cli)?;
    info!(
        gateway = %config.gateway,
        session = %config.session,
        transport = ?config.transport,
        "starting flare-peer"
    );

    let factory = config.transport_factory()?;
    let (client, mut events) = GatewayClient::connect(
        config.connector(),
        factory,
        config.session,
        config.rtc.ice_restart,
    )
    .await
    .context("failed to join session")?;
    if !config.tracks.is_empty() {
        client.set_tracks(config.tracks.clone());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Some(ClientEvent::GatewayClosed) | None => {
                    warn!("gateway went away");
                    client.connection().close();
                    return Ok(());
                }
                Some(event) => log_event(event),
            },
        }
    }

    let connection = client.connection();
    if let Err(err) = client.leave().await {
        warn!(error = %err, "failed to leave session cleanly");
    }
    connection.close();
    Ok(())
}

fn log_event(event: ClientEvent) {
    match event {
        ClientEvent::PeerAdded {
            participant_id,
            role,
        } => info!(peer = %participant_id, ?role, "peer added"),
        ClientEvent::PeerInfo {
            participant_id,
            info,
        } => info!(peer = %participant_id, screen_name = %info.screen_name, "peer identified"),
        ClientEvent::PeerStateChanged {
            participant_id,
            state,
        } => info!(peer = %participant_id, ?state, "peer state changed"),
        ClientEvent::RemoteTrack {
            participant_id,
            track_id,
            kind,
        } => info!(peer = %participant_id, %track_id, %kind, "remote track"),
        ClientEvent::PeerRemoved { participant_id } => {
            info!(peer = %participant_id, "peer removed")
        }
        ClientEvent::Reconnecting => warn!("gateway link lost, rejoining"),
        ClientEvent::Reconnected => info!("rejoined session"),
        ClientEvent::GatewayClosed => {}
    }
}
