use anyhow::Result;
use clap::Parser;
use flare_gateway::{telemetry::Telemetry, Cli, GatewayConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = GatewayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        roster = %config.roster.display(),
        open_sessions = config.open_sessions,
        "starting flare-gateway"
    );

    flare_gateway::run(config, telemetry.metrics_handle()).await
}
