//! CLI surface and the runtime configuration it produces

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// agent and broker share a process; no HTTP, no PAKE handshake.
    Local,
    /// agent and broker are separate processes, paired over loopback HTTP.
    Remote,
}

#[derive(Debug, Parser)]
#[command(name = "credbroker-broker", version, about = "human-in-the-loop credential broker")]
pub struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Remote)]
    pub mode: Mode,

    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = 120)]
    pub approval_wait_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub pairing_ttl_secs: i64,

    #[arg(long, default_value_t = 1800)]
    pub session_ttl_secs: i64,

    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    #[arg(long)]
    pub audit_log_path: Option<PathBuf>,

    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,
}

/// the validated, runtime-shaped form of [`Args`]
pub struct BrokerConfig {
    pub mode: Mode,
    pub bind: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub approval_wait: Duration,
    pub pairing_ttl: chrono::Duration,
    pub session_ttl: chrono::Duration,
    pub sweep_interval: Duration,
    pub audit_log_path: Option<PathBuf>,
    pub metrics_port: u16,
}

impl From<Args> for BrokerConfig {
    fn from(args: Args) -> Self {
        Self {
            mode: args.mode,
            bind: args.bind,
            port: args.port,
            log_level: args.log_level,
            approval_wait: Duration::from_secs(args.approval_wait_secs),
            pairing_ttl: chrono::Duration::seconds(args.pairing_ttl_secs),
            session_ttl: chrono::Duration::seconds(args.session_ttl_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            audit_log_path: args.audit_log_path,
            metrics_port: args.metrics_port,
        }
    }
}
