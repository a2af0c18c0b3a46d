use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use cribcall_core::types::{DEFAULT_CONTROL_PORT, DEFAULT_PAIRING_PORT};

/// Exit code for command-line usage errors (sysexits EX_USAGE).
pub const EXIT_USAGE: i32 = 64;

#[derive(Debug, Parser)]
#[command(name = "cribcall", version, about = "LAN-only baby monitor control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the monitor: pairing + control servers, sound detection, fan-out.
    Monitor(MonitorArgs),
    /// Run a listener: pair with a monitor, subscribe, consume noise events.
    Listener(ListenerArgs),
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    pub control_port: u16,

    #[arg(long, default_value_t = DEFAULT_PAIRING_PORT)]
    pub pairing_port: u16,

    /// Role-specific data directory (default: ./cribcall-data/monitor).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Monitor display name.
    #[arg(long)]
    pub name: Option<String>,

    /// Replace the microphone with periodic synthetic noise bursts.
    #[arg(long)]
    pub synthetic_noise: bool,
}

#[derive(Debug, Args)]
pub struct ListenerArgs {
    /// Monitor host or IP.
    #[arg(long)]
    pub host: String,

    /// Pinned monitor certificate fingerprint (lowercase hex SHA-256).
    #[arg(long)]
    pub fingerprint: String,

    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    pub control_port: u16,

    #[arg(long, default_value_t = DEFAULT_PAIRING_PORT)]
    pub pairing_port: u16,

    /// PIN shown on the monitor; pairs before connecting.
    #[arg(long)]
    pub pin: Option<String>,

    /// Role-specific data directory (default: ./cribcall-data/listener).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Listener display name.
    #[arg(long)]
    pub name: Option<String>,

    /// Run a single health check and exit.
    #[arg(long)]
    pub ping: bool,
}
