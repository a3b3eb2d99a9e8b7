//! Tor ControlPort client implementation.
//!
//! Communicates with Tor via the ControlPort protocol (control-spec.txt).
//! One TCP connection carries two logical channels:
//!
//! - synchronous command/reply pairs, serialized by a mutex held from the
//!   moment a command is written until its final `NNN ` line is consumed;
//! - asynchronous `650` event lines, pushed by Tor at any time.
//!
//! A dedicated reader task owns the read half and routes assembled replies
//! either to the reply queue or to the event broadcast, based on the status
//! code.

use crate::error::{Error, Result};
use crate::keys::{KeyMaterial, OnionAddress};
use crate::logging::{command_for_log, Redacted, RedactedOnion};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Status code of asynchronous event replies.
const EVENT_CODE: u16 = 650;

/// Status code Tor uses for unknown onion services on DEL_ONION.
const UNKNOWN_ONION_CODE: u16 = 552;

/// Buffered events per subscriber before lagging.
const EVENT_CAPACITY: usize = 256;

/// Authentication method for Tor ControlPort.
#[derive(Clone)]
pub enum TorAuth {
    /// No authentication required.
    None,
    /// Cookie authentication (reads from file).
    Cookie(PathBuf),
    /// Password authentication.
    Password(String),
}

impl fmt::Debug for TorAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorAuth::None => write!(f, "None"),
            TorAuth::Cookie(path) => f.debug_tuple("Cookie").field(path).finish(),
            TorAuth::Password(password) => f.debug_tuple("Password").field(&Redacted(password)).finish(),
        }
    }
}

/// A complete control port reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit status code shared by all lines of the reply.
    pub code: u16,
    /// Line payloads without the `NNN-`/`NNN ` prefix. Data blocks
    /// (`NNN+`) are folded into one entry with embedded newlines.
    pub lines: Vec<String>,
}

impl Reply {
    /// 2xx replies.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Value of the first `key=value` line for `key`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    fn message(&self) -> String {
        self.lines.join("; ")
    }

    fn into_error(self) -> Error {
        Error::Protocol {
            code: i32::from(self.code),
            message: self.message(),
        }
    }
}

/// Bootstrap progress as reported by `STATUS_CLIENT` events and
/// `GETINFO status/bootstrap-phase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStatus {
    /// Percentage, 0-100.
    pub progress: u8,
    /// Machine-readable phase tag (e.g. `done`).
    pub tag: String,
    /// Human-readable phase summary.
    pub summary: String,
}

impl BootstrapStatus {
    /// Parse the `... BOOTSTRAP PROGRESS=NN TAG=x SUMMARY="..."` form.
    pub fn parse(line: &str) -> Option<Self> {
        if !line.contains("BOOTSTRAP") {
            return None;
        }

        let progress = extract_param(line, "PROGRESS")?.parse::<u8>().ok()?.min(100);
        Some(Self {
            progress,
            tag: extract_param(line, "TAG").unwrap_or_default(),
            summary: extract_param(line, "SUMMARY").unwrap_or_default(),
        })
    }

    /// Whether Tor reports bootstrap completion.
    pub fn is_done(&self) -> bool {
        self.progress >= 100
    }
}

/// Asynchronous events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// `650 STATUS_CLIENT ... BOOTSTRAP ...`
    Bootstrap(BootstrapStatus),
    /// Any other event, unparsed.
    Other(Vec<String>),
    /// The control connection is gone; no further events follow.
    Closed,
}

impl ControlEvent {
    fn from_reply(reply: Reply) -> Self {
        let bootstrap = reply
            .lines
            .first()
            .filter(|line| line.starts_with("STATUS_CLIENT"))
            .and_then(|line| BootstrapStatus::parse(line));

        match bootstrap {
            Some(status) => ControlEvent::Bootstrap(status),
            None => ControlEvent::Other(reply.lines),
        }
    }
}

/// Information from PROTOCOLINFO response.
#[derive(Debug, Default)]
pub struct ProtocolInfo {
    /// Available authentication methods.
    pub auth_methods: Vec<String>,
    /// Path to control port cookie file for authentication.
    pub cookie_file: Option<String>,
    /// Tor version string.
    pub tor_version: Option<String>,
}

/// Result of a successful ADD_ONION.
pub struct AddOnionReply {
    /// Address of the new service.
    pub address: OnionAddress,
    /// Key returned by Tor when it generated one (`ED25519-V3:...`).
    pub private_key: Option<Zeroizing<String>>,
}

impl fmt::Debug for AddOnionReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddOnionReply")
            .field("address", &self.address)
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Stream of bootstrap progress updates.
///
/// Yields the phase Tor reported when the subscription was made, then every
/// subsequent `STATUS_CLIENT` bootstrap event, until the control connection
/// closes.
pub struct BootstrapEvents {
    initial: Option<BootstrapStatus>,
    rx: broadcast::Receiver<ControlEvent>,
}

impl BootstrapEvents {
    /// Next progress update, or `None` once the connection is closed.
    pub async fn next(&mut self) -> Option<BootstrapStatus> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }

        loop {
            match self.rx.recv().await {
                Ok(ControlEvent::Bootstrap(status)) => return Some(status),
                Ok(ControlEvent::Other(_)) => continue,
                Ok(ControlEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Bootstrap subscriber lagged");
                }
            }
        }
    }
}

struct CommandChannel {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Result<Reply>>,
    /// Set while a command is on the wire and kept if its reply is never
    /// consumed; every later command then fails without touching the socket.
    broken: Option<Broken>,
}

/// Why the command channel can no longer be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Broken {
    /// A command was written but its reply was not consumed (deadline hit
    /// or the caller went away), so the next reply belongs to it.
    Desynchronized,
    /// Tor sent a line that is not a valid reply.
    Malformed,
    /// The connection is gone.
    Closed,
}

impl Broken {
    fn error(self) -> Error {
        match self {
            Broken::Desynchronized => Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "control connection desynchronized by an unanswered command",
            )),
            Broken::Malformed => Error::malformed(),
            Broken::Closed => Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control connection closed",
            )),
        }
    }
}

/// Tor ControlPort client.
pub struct TorController {
    addr: SocketAddr,
    channel: Mutex<CommandChannel>,
    events: broadcast::Sender<ControlEvent>,
    reader: JoinHandle<()>,
    authenticated: AtomicBool,
    command_timeout: Duration,
}

impl TorController {
    /// Connect to a Tor ControlPort.
    pub async fn connect(addr: SocketAddr, command_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(command_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Launch(format!("failed to connect to control port {}: {}", addr, e)))?;

        let (read_half, write_half) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let reader = tokio::spawn(read_loop(read_half, reply_tx, event_tx.clone()));

        debug!(%addr, "Connected to Tor control port");

        Ok(Self {
            addr,
            channel: Mutex::new(CommandChannel {
                writer: write_half,
                replies: reply_rx,
                broken: None,
            }),
            events: event_tx,
            reader,
            authenticated: AtomicBool::new(false),
            command_timeout,
        })
    }

    /// Address of the control port.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether AUTHENTICATE has succeeded on this connection.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its complete reply.
    ///
    /// Non-2xx replies become [`Error::Protocol`]. A command whose reply is
    /// never consumed (timeout, or the caller's future dropped mid-command)
    /// leaves the connection unusable: Tor still owes that reply, and it
    /// must not be taken as the answer to anything else.
    async fn command(&self, cmd: &str) -> Result<Reply> {
        let mut channel = self.channel.lock().await;
        if let Some(broken) = channel.broken {
            return Err(broken.error());
        }

        debug!(command = %command_for_log(cmd), "Sending control command");

        channel.broken = Some(Broken::Desynchronized);
        channel.writer.write_all(cmd.as_bytes()).await?;
        channel.writer.write_all(b"\r\n").await?;
        channel.writer.flush().await?;

        let received = tokio::time::timeout(self.command_timeout, channel.replies.recv()).await;
        let reply = match received {
            Err(_) => {
                warn!(command = %command_for_log(cmd), "Timed out waiting for control reply");
                return Err(Error::Timeout);
            }
            Ok(None) => {
                channel.broken = Some(Broken::Closed);
                return Err(Broken::Closed.error());
            }
            Ok(Some(Err(e))) => {
                channel.broken = Some(match e {
                    Error::Protocol { code: -1, .. } => Broken::Malformed,
                    _ => Broken::Closed,
                });
                return Err(e);
            }
            Ok(Some(Ok(reply))) => {
                channel.broken = None;
                reply
            }
        };

        if !reply.is_success() {
            debug!(code = reply.code, "Control command failed");
            return Err(reply.into_error());
        }

        Ok(reply)
    }

    fn ensure_authenticated(&self) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(Error::Auth("not authenticated".into()))
        }
    }

    /// Get protocol info to determine authentication method.
    ///
    /// Allowed before authentication.
    pub async fn protocol_info(&self) -> Result<ProtocolInfo> {
        let reply = self.command("PROTOCOLINFO 1").await?;
        let mut info = ProtocolInfo::default();

        for line in &reply.lines {
            // AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/path"
            if let Some(auth_part) = line.strip_prefix("AUTH ") {
                if let Some(methods) = extract_param(auth_part, "METHODS") {
                    info.auth_methods = methods.split(',').map(String::from).collect();
                }
                info.cookie_file = extract_param(auth_part, "COOKIEFILE");
            }
            // VERSION Tor="0.4.8.9"
            if let Some(version_part) = line.strip_prefix("VERSION ") {
                info.tor_version = extract_param(version_part, "Tor");
            }
        }

        Ok(info)
    }

    /// Authenticate with the control port.
    ///
    /// Must precede every command other than PROTOCOLINFO.
    pub async fn authenticate(&self, auth: &TorAuth) -> Result<()> {
        let cmd = match auth {
            TorAuth::None => Zeroizing::new("AUTHENTICATE".to_string()),
            TorAuth::Cookie(path) => {
                let cookie = Zeroizing::new(tokio::fs::read(path).await.map_err(|e| {
                    Error::Auth(format!("failed to read cookie file {}: {}", path.display(), e))
                })?);
                Zeroizing::new(format!("AUTHENTICATE {}", hex::encode(&cookie[..])))
            }
            TorAuth::Password(password) => {
                Zeroizing::new(format!("AUTHENTICATE \"{}\"", escape_tor_string(password)))
            }
        };

        match self.command(&cmd).await {
            Ok(_) => {}
            Err(Error::Protocol { code, message }) if code > 0 => {
                return Err(Error::Auth(format!("{} {}", code, message)));
            }
            Err(e) => return Err(e),
        }

        self.authenticated.store(true, Ordering::SeqCst);
        info!("Authenticated with Tor control port");
        Ok(())
    }

    /// Single GETINFO value.
    pub async fn get_info(&self, keyword: &str) -> Result<String> {
        self.ensure_authenticated()?;

        let reply = self.command(&format!("GETINFO {}", keyword)).await?;
        reply
            .value(keyword)
            .map(|v| v.trim().to_string())
            .ok_or_else(|| Error::Protocol {
                code: -1,
                message: format!("GETINFO reply missing {}", keyword),
            })
    }

    /// Get Tor version.
    pub async fn get_version(&self) -> Result<String> {
        self.get_info("version").await
    }

    /// Address of the first SOCKS listener.
    ///
    /// Resolves the actual port when Tor was configured with `auto`.
    pub async fn socks_listener(&self) -> Result<SocketAddr> {
        let value = self.get_info("net/listeners/socks").await?;
        value
            .split_whitespace()
            .map(|entry| entry.trim_matches('"'))
            .find_map(|entry| entry.parse::<SocketAddr>().ok())
            .ok_or_else(|| Error::Protocol {
                code: -1,
                message: format!("no usable SOCKS listener in {:?}", value),
            })
    }

    /// Current bootstrap phase.
    pub async fn bootstrap_status(&self) -> Result<BootstrapStatus> {
        let value = self.get_info("status/bootstrap-phase").await?;
        BootstrapStatus::parse(&value).ok_or_else(Error::malformed)
    }

    /// Subscribe to bootstrap progress.
    ///
    /// The subscription is registered before `SETEVENTS` is sent, so no
    /// event between the two can be missed.
    pub async fn subscribe_bootstrap(&self) -> Result<BootstrapEvents> {
        self.ensure_authenticated()?;

        let rx = self.events.subscribe();
        self.command("SETEVENTS STATUS_CLIENT").await?;

        let initial = match self.bootstrap_status().await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(error = %e, "Could not read initial bootstrap phase");
                None
            }
        };

        Ok(BootstrapEvents { initial, rx })
    }

    /// Add an ephemeral onion service.
    ///
    /// Maps virtual `port` to `127.0.0.1:target_port`. For provided keys the
    /// returned service id must match the address derived from the key.
    pub async fn add_onion(
        &self,
        key: &KeyMaterial,
        port: u16,
        target_port: u16,
    ) -> Result<AddOnionReply> {
        self.ensure_authenticated()?;

        let cmd = Zeroizing::new(format!(
            "ADD_ONION {} Port={},127.0.0.1:{}",
            key.control_arg().as_str(),
            port,
            target_port
        ));

        let reply = self.command(&cmd).await?;

        let service_id = reply
            .value("ServiceID")
            .ok_or_else(|| Error::OnionCreate("no ServiceID in response".into()))?;
        let address = OnionAddress::parse(service_id)
            .map_err(|e| Error::OnionCreate(format!("invalid ServiceID {:?}: {}", service_id, e)))?;
        let private_key = reply
            .value("PrivateKey")
            .map(|k| Zeroizing::new(k.to_string()));

        if let Some(expected) = key.expected_address() {
            if expected != &address {
                warn!(
                    expected = %RedactedOnion(expected.as_str()),
                    got = %RedactedOnion(address.as_str()),
                    "Onion address mismatch, removing service"
                );
                if let Err(e) = self.del_onion(address.service_id()).await {
                    warn!(error = %e, "Failed to remove mismatched onion service");
                }
                return Err(Error::OnionCreate(
                    "Tor created a different address than the provided key".into(),
                ));
            }
        }

        info!(
            onion = %RedactedOnion(address.as_str()),
            port,
            target_port,
            "Created onion service"
        );

        Ok(AddOnionReply {
            address,
            private_key,
        })
    }

    /// Remove an onion service.
    pub async fn del_onion(&self, service_id: &str) -> Result<()> {
        self.ensure_authenticated()?;

        match self.command(&format!("DEL_ONION {}", service_id)).await {
            Ok(_) => {
                info!(onion = %RedactedOnion(service_id), "Removed onion service");
                Ok(())
            }
            Err(Error::Protocol { code, .. }) if code == i32::from(UNKNOWN_ONION_CODE) => {
                Err(Error::NotFound(service_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Signal Tor (e.g. SHUTDOWN, NEWNYM).
    pub async fn signal(&self, signal: &str) -> Result<()> {
        self.ensure_authenticated()?;

        self.command(&format!("SIGNAL {}", signal)).await?;
        Ok(())
    }
}

impl Drop for TorController {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Reader task: assemble lines into replies and route them.
async fn read_loop(
    reader: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Result<Reply>>,
    events: broadcast::Sender<ControlEvent>,
) {
    // Subscribers must learn the connection is gone however this task ends,
    // including abort and panic.
    let _closed = scopeguard::guard(events.clone(), |events| {
        let _ = events.send(ControlEvent::Closed);
    });

    let mut lines = BufReader::new(reader).lines();
    let mut assembler = ReplyAssembler::default();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Control connection closed by Tor");
                break;
            }
            Err(e) => {
                let _ = replies.send(Err(Error::Io(e)));
                break;
            }
        };

        match assembler.push(&line) {
            Ok(None) => {}
            Ok(Some(reply)) if reply.code == EVENT_CODE => {
                // No subscribers is fine.
                let _ = events.send(ControlEvent::from_reply(reply));
            }
            Ok(Some(reply)) => {
                if replies.send(Ok(reply)).is_err() {
                    break;
                }
            }
            Err(e) => {
                // The stream cannot be resynchronized after a bad line.
                warn!(line = %line.chars().take(64).collect::<String>(), "Malformed control line");
                let _ = replies.send(Err(e));
                break;
            }
        }
    }
}

/// Incremental reply parser.
#[derive(Default)]
struct ReplyAssembler {
    code: Option<u16>,
    lines: Vec<String>,
    data: Option<String>,
}

impl ReplyAssembler {
    /// Feed one line (without CRLF). Returns a reply once its final line
    /// has been seen.
    fn push(&mut self, line: &str) -> Result<Option<Reply>> {
        if let Some(data) = self.data.as_mut() {
            if line == "." {
                let block = self.data.take().unwrap_or_default();
                self.lines.push(block);
            } else {
                data.push('\n');
                data.push_str(line.strip_prefix('.').filter(|l| l.starts_with('.')).unwrap_or(line));
            }
            return Ok(None);
        }

        let bytes = line.as_bytes();
        if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(Error::malformed());
        }

        let code: u16 = line[..3].parse().map_err(|_| Error::malformed())?;
        if self.code.is_some_and(|current| current != code) {
            return Err(Error::malformed());
        }
        // Checked before slicing: the separator must be one ASCII byte.
        let separator = bytes[3];
        if !matches!(separator, b'-' | b'+' | b' ') {
            return Err(Error::malformed());
        }
        self.code = Some(code);

        let text = line[4..].to_string();
        match separator {
            b'-' => {
                self.lines.push(text);
                Ok(None)
            }
            b'+' => {
                self.data = Some(text);
                Ok(None)
            }
            _ => {
                self.lines.push(text);
                self.code = None;
                Ok(Some(Reply {
                    code,
                    lines: std::mem::take(&mut self.lines),
                }))
            }
        }
    }
}

/// Extract `KEY=value` or `KEY="quoted value"` from a reply line.
fn extract_param(line: &str, key: &str) -> Option<String> {
    let needle = format!("{}=", key);
    let start = line
        .match_indices(&needle)
        .find(|(i, _)| *i == 0 || line.as_bytes()[i - 1] == b' ')
        .map(|(i, _)| i + needle.len())?;
    let rest = &line[start..];

    if let Some(quoted) = rest.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = quoted.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => value.extend(chars.next()),
                '"' => return Some(value),
                _ => value.push(c),
            }
        }
        None
    } else {
        Some(rest.split(' ').next().unwrap_or_default().to_string())
    }
}

/// Escape a string for Tor control protocol.
fn escape_tor_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
