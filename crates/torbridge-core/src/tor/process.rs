//! Tor daemon process supervision.
//!
//! Spawns `tor` against a generated torrc inside the data directory and
//! waits for it to publish its control address. The daemon is tied to our
//! process twice over: `kill_on_drop` on the child handle and
//! `__OwningControllerProcess` in the torrc.

use super::controller::{TorAuth, TorController};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// File name of the generated configuration.
pub const TORRC_FILE: &str = "torrc";

/// File Tor writes its control address to (`ControlPortWriteToFile`).
pub const CONTROL_PORT_FILE: &str = "control_port";

/// Cookie file for control port authentication.
pub const COOKIE_FILE: &str = "control_auth_cookie";

/// Default wait for SIGNAL SHUTDOWN to take effect before killing.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How to launch a daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Path or name of the `tor` executable.
    pub tor_binary: PathBuf,
    /// Data directory; created if absent, reused otherwise.
    pub data_dir: PathBuf,
    /// SOCKS port, `0` for an automatically chosen one.
    pub socks_port: u16,
    /// Control port, `0` for an automatically chosen one.
    pub control_port: u16,
    /// Deadline for the control port to come up.
    pub timeout: Duration,
    /// Wait after SIGNAL SHUTDOWN before killing.
    pub shutdown_grace: Duration,
}

impl LaunchConfig {
    /// Config with automatic ports and default grace period.
    pub fn new(tor_binary: impl Into<PathBuf>, data_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            tor_binary: tor_binary.into(),
            data_dir: data_dir.into(),
            socks_port: 0,
            control_port: 0,
            timeout,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// A running (or attached) daemon, as seen by the orchestrator.
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Address of the control port.
    fn control_addr(&self) -> SocketAddr;

    /// Credentials for the control port.
    fn auth(&self) -> TorAuth;

    /// Stop the daemon. Idempotent.
    async fn terminate(&mut self, control: Option<&TorController>) -> Result<()>;
}

/// Creates daemons.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a daemon and wait until its control port is reachable.
    async fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn Daemon>>;
}

/// Launches the real `tor` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct TorLauncher;

#[async_trait]
impl Launcher for TorLauncher {
    async fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn Daemon>> {
        Ok(Box::new(TorProcess::launch(config).await?))
    }
}

/// Handle to a Tor daemon.
pub struct TorProcess {
    child: Option<Child>,
    control_addr: SocketAddr,
    auth: TorAuth,
    shutdown_grace: Duration,
}

impl TorProcess {
    /// Spawn Tor and wait for its control port.
    ///
    /// Fails with [`Error::Launch`] if the binary cannot be spawned or exits
    /// during startup, and with [`Error::LaunchTimeout`] if the control port
    /// is not published within `config.timeout`. The child is killed on
    /// every failure path.
    pub async fn launch(config: &LaunchConfig) -> Result<Self> {
        let data_dir = &config.data_dir;
        prepare_data_dir(data_dir).await?;

        let control_file = data_dir.join(CONTROL_PORT_FILE);
        match tokio::fs::remove_file(&control_file).await {
            Ok(()) => debug!("Removed stale control port file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let torrc = data_dir.join(TORRC_FILE);
        tokio::fs::write(&torrc, render_torrc(config, std::process::id())).await?;

        let mut child = Command::new(&config.tor_binary)
            .arg("-f")
            .arg(&torrc)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Launch(format!(
                    "failed to spawn {}: {}",
                    config.tor_binary.display(),
                    e
                ))
            })?;

        forward_output(child.stdout.take(), "stdout");
        forward_output(child.stderr.take(), "stderr");

        info!(pid = child.id(), data_dir = %data_dir.display(), "Spawned tor");

        let control_addr = match wait_for_control_port(&mut child, &control_file, config.timeout).await {
            Ok(addr) => addr,
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    debug!(error = %kill_err, "Failed to kill tor after launch failure");
                }
                return Err(e);
            }
        };

        info!(%control_addr, "Tor control port ready");

        Ok(Self {
            child: Some(child),
            control_addr,
            auth: TorAuth::Cookie(data_dir.join(COOKIE_FILE)),
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Use a daemon we did not start (e.g. system Tor).
    ///
    /// [`Daemon::terminate`] leaves such a daemon running.
    pub fn attach(control_addr: SocketAddr, auth: TorAuth) -> Self {
        Self {
            child: None,
            control_addr,
            auth,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Whether this handle owns a child process that has not been reaped.
    pub fn is_owned(&self) -> bool {
        self.child.is_some()
    }
}

#[async_trait]
impl Daemon for TorProcess {
    fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    fn auth(&self) -> TorAuth {
        self.auth.clone()
    }

    async fn terminate(&mut self, control: Option<&TorController>) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let signalled = match control {
            Some(control) => match control.signal("SHUTDOWN").await {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "SIGNAL SHUTDOWN failed");
                    false
                }
            },
            None => false,
        };

        if signalled {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(%status, "Tor exited");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(Error::Shutdown(e.to_string())),
                Err(_) => warn!(grace = ?self.shutdown_grace, "Tor ignored SIGNAL SHUTDOWN, killing"),
            }
        }

        child
            .kill()
            .await
            .map_err(|e| Error::Shutdown(format!("failed to kill tor: {}", e)))?;
        info!("Tor killed");
        Ok(())
    }
}

/// Render the torrc for `config`, owned by process `owner_pid`.
pub fn render_torrc(config: &LaunchConfig, owner_pid: u32) -> String {
    let data_dir = &config.data_dir;
    let lines = [
        format!("DataDirectory {}", quote_path(data_dir)),
        format!("SocksPort 127.0.0.1:{}", port_or_auto(config.socks_port)),
        format!("ControlPort 127.0.0.1:{}", port_or_auto(config.control_port)),
        format!("ControlPortWriteToFile {}", quote_path(&data_dir.join(CONTROL_PORT_FILE))),
        "CookieAuthentication 1".to_string(),
        format!("CookieAuthFile {}", quote_path(&data_dir.join(COOKIE_FILE))),
        format!("__OwningControllerProcess {}", owner_pid),
        "Log notice stdout".to_string(),
    ];

    let mut torrc = lines.join("\n");
    torrc.push('\n');
    torrc
}

fn port_or_auto(port: u16) -> String {
    if port == 0 {
        "auto".to_string()
    } else {
        port.to_string()
    }
}

fn quote_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Parse the `PORT=host:port` line Tor writes to the control port file.
fn parse_control_port_file(contents: &str) -> Option<SocketAddr> {
    contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("PORT="))
        .find_map(|addr| addr.parse().ok())
}

async fn prepare_data_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        Error::Launch(format!("failed to create data directory {}: {}", dir.display(), e))
    })?;

    // Tor refuses group/world-accessible data directories.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }

    Ok(())
}

async fn wait_for_control_port(
    child: &mut Child,
    control_file: &Path,
    timeout: Duration,
) -> Result<SocketAddr> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(Error::Launch(format!("tor exited during startup: {}", status)));
        }

        match tokio::fs::read_to_string(control_file).await {
            // Tor may still be writing the file; retry on a partial read.
            Ok(contents) => {
                if let Some(addr) = parse_control_port_file(&contents) {
                    return Ok(addr);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if Instant::now() >= deadline {
            return Err(Error::LaunchTimeout(timeout));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

fn forward_output<R>(stream: Option<R>, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "torbridge::tor", stream = name, "{}", line);
        }
    });
}
