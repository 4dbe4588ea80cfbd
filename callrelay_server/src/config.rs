//! Command-line configuration

use crate::liveness::LivenessConfig;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Signaling relay for peer-to-peer WebRTC calls
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "callrelay-signaling")]
#[command(version)]
pub struct Config {
    /// Address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8000)]
    pub port: u16,

    /// Directory with the browser client, served at /
    #[arg(long, default_value = "client")]
    pub static_dir: PathBuf,

    /// Seconds between liveness probes
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds of silence before a client is evicted
    #[arg(long, default_value_t = 60)]
    pub liveness_timeout_secs: u64,

    /// Outbound messages buffered per client before it is considered stalled
    #[arg(long, default_value_t = 64)]
    pub outbox_capacity: usize,

    /// Log filter used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["callrelay-signaling"])
    }
}

impl Config {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig::from_secs(self.ping_interval_secs, self.liveness_timeout_secs)
    }
}
