//! Tor integration.
//!
//! The daemon is an external collaborator reachable only through two local
//! ports:
//!
//! - the ControlPort, spoken by [`TorController`];
//! - the SOCKS5 port, used by [`TorConnection`] to open tunnelled streams.
//!
//! [`TorProcess`] owns the daemon itself. The orchestrator only sees it
//! through the [`Launcher`] / [`Daemon`] traits.

mod connection;
mod controller;
mod process;

pub use connection::TorConnection;
pub use controller::{
    AddOnionReply, BootstrapEvents, BootstrapStatus, ControlEvent, ProtocolInfo, Reply, TorAuth,
    TorController,
};
pub use process::{
    render_torrc, Daemon, LaunchConfig, Launcher, TorLauncher, TorProcess, CONTROL_PORT_FILE,
    COOKIE_FILE, DEFAULT_SHUTDOWN_GRACE, TORRC_FILE,
};

use std::time::Duration;

/// Default deadline for a control command reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
