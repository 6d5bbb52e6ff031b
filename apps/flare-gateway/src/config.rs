use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::access::{Access, StaticRoster};

#[derive(Debug, Parser)]
#[command(
    name = "flare-gateway",
    author,
    version,
    about = "Signaling gateway for peer-to-peer session participants"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(
        long,
        env = "FLARE_GATEWAY_LISTEN_ADDR",
        default_value = "127.0.0.1:8480"
    )]
    pub listen_addr: String,

    /// TOML roster with participant tokens, display names and session grants.
    #[arg(long, env = "FLARE_GATEWAY_ROSTER", default_value = "flare-roster.toml")]
    pub roster: PathBuf,

    /// Let every rostered participant join any session.
    #[arg(long, env = "FLARE_GATEWAY_OPEN_SESSIONS", default_value_t = false)]
    pub open_sessions: bool,

    /// How often unreferenced sessions are pruned from the directory.
    #[arg(long, env = "FLARE_GATEWAY_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "FLARE_GATEWAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub roster: PathBuf,
    pub open_sessions: bool,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.sweep_interval_secs == 0 {
            anyhow::bail!("sweep interval must be at least one second");
        }
        Ok(GatewayConfig {
            listen_addr,
            roster: cli.roster,
            open_sessions: cli.open_sessions,
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

impl GatewayConfig {
    /// Loads the roster; the command line flag can only widen its policy.
    pub fn load_access(&self) -> Result<Access> {
        let mut roster = StaticRoster::load(&self.roster)
            .with_context(|| format!("failed to load roster {}", self.roster.display()))?;
        if self.open_sessions {
            roster.set_open_sessions(true);
        }
        Ok(Access::from_roster(roster))
    }
}
