//! In-process stand-ins for the Tor daemon, its control port and its SOCKS
//! port, shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use torbridge_core::tor::{Daemon, LaunchConfig, Launcher, TorAuth, TorController};
use torbridge_core::{Error, OnionAddress, Result};

/// Seed and public key of RFC 8032 test vector 1.
pub const RFC8032_SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
pub const RFC8032_PUB: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

/// Behaviour knobs for [`FakeTor`].
#[derive(Clone)]
pub struct FakeTorOptions {
    pub reject_auth: bool,
    pub bootstrap_steps: Vec<u8>,
    pub socks_addr: SocketAddr,
    /// ADD_ONION fails once this many services have been created.
    pub add_onion_limit: Option<usize>,
}

impl Default for FakeTorOptions {
    fn default() -> Self {
        Self {
            reject_auth: false,
            bootstrap_steps: vec![50, 100],
            socks_addr: "127.0.0.1:9".parse().expect("addr"),
            add_onion_limit: None,
        }
    }
}

#[derive(Default)]
pub struct FakeTorState {
    commands: Mutex<Vec<String>>,
    services: Mutex<HashSet<String>>,
    created: AtomicUsize,
}

impl FakeTorState {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("lock").clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn services(&self) -> HashSet<String> {
        self.services.lock().expect("lock").clone()
    }
}

/// A fake control port.
pub struct FakeTor {
    pub control_addr: SocketAddr,
    pub state: Arc<FakeTorState>,
}

impl FakeTor {
    pub async fn spawn(options: FakeTorOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let control_addr = listener.local_addr().expect("addr");
        let state = Arc::new(FakeTorState::default());

        let server_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_control(stream, options.clone(), server_state.clone()));
            }
        });

        Self { control_addr, state }
    }
}

async fn serve_control(stream: TcpStream, options: FakeTorOptions, state: Arc<FakeTorState>) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut authenticated = false;

    while let Ok(Some(line)) = lines.next_line().await {
        state.commands.lock().expect("lock").push(line.clone());
        let mut parts = line.splitn(2, ' ');
        let verb = parts.next().unwrap_or_default();
        let args = parts.next().unwrap_or_default();

        let reply = match verb {
            "PROTOCOLINFO" => "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"0.4.8.9\"\r\n250 OK\r\n".to_string(),
            "AUTHENTICATE" if options.reject_auth => {
                "515 Authentication failed: Password did not match HashedControlPassword *or* authentication cookie.\r\n".to_string()
            }
            "AUTHENTICATE" => {
                authenticated = true;
                "250 OK\r\n".to_string()
            }
            _ if !authenticated => "514 Authentication required.\r\n".to_string(),
            "SETEVENTS" => {
                let mut out = "250 OK\r\n".to_string();
                for step in &options.bootstrap_steps {
                    out.push_str(&format!(
                        "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS={} TAG=step SUMMARY=\"Step {}\"\r\n",
                        step, step
                    ));
                }
                out
            }
            "GETINFO" => match args {
                "status/bootstrap-phase" => "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=0 TAG=starting SUMMARY=\"Starting\"\r\n250 OK\r\n".to_string(),
                "version" => "250-version=0.4.8.9\r\n250 OK\r\n".to_string(),
                "net/listeners/socks" => format!("250-net/listeners/socks=\"{}\"\r\n250 OK\r\n", options.socks_addr),
                _ => "552 Unrecognized key\r\n".to_string(),
            },
            "ADD_ONION" => {
                let created = state.created.load(Ordering::SeqCst);
                if options.add_onion_limit.is_some_and(|limit| created >= limit) {
                    "551 Failed to add onion service\r\n".to_string()
                } else {
                    match add_onion(args) {
                        Some((address, private_key)) => {
                            state.created.fetch_add(1, Ordering::SeqCst);
                            state
                                .services
                                .lock()
                                .expect("lock")
                                .insert(address.service_id().to_string());
                            let mut out = format!("250-ServiceID={}\r\n", address.service_id());
                            if let Some(key) = private_key {
                                out.push_str(&format!("250-PrivateKey={}\r\n", key));
                            }
                            out.push_str("250 OK\r\n");
                            out
                        }
                        None => "513 Invalid key\r\n".to_string(),
                    }
                }
            }
            "DEL_ONION" => {
                if state.services.lock().expect("lock").remove(args) {
                    "250 OK\r\n".to_string()
                } else {
                    "552 Unknown Onion Service id\r\n".to_string()
                }
            }
            "SIGNAL" => {
                let _ = writer.write_all(b"250 OK\r\n").await;
                if args == "SHUTDOWN" {
                    return;
                }
                continue;
            }
            _ => "510 Unrecognized command\r\n".to_string(),
        };

        if writer.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Mimic ADD_ONION: mint a key for `NEW:BEST`, derive the address for
/// `ED25519-V3:` keys.
fn add_onion(args: &str) -> Option<(OnionAddress, Option<String>)> {
    let key_arg = args.split(' ').next()?;

    if key_arg == "NEW:BEST" {
        let signing = SigningKey::generate(&mut OsRng);
        let address = OnionAddress::from_public_key(&signing.verifying_key());
        let private = format!("ED25519-V3:{}", BASE64.encode([0u8; 64]));
        return Some((address, Some(private)));
    }

    let encoded = key_arg.strip_prefix("ED25519-V3:")?;
    let expanded = BASE64.decode(encoded).ok()?;
    let scalar_bytes: [u8; 32] = expanded.get(..32)?.try_into().ok()?;
    let point = EdwardsPoint::mul_base(&Scalar::from_bytes_mod_order(scalar_bytes));
    let public = VerifyingKey::from_bytes(&point.compress().to_bytes()).ok()?;
    Some((OnionAddress::from_public_key(&public), None))
}

/// Launcher handing out daemons backed by a [`FakeTor`].
pub struct FakeLauncher {
    control_addr: SocketAddr,
    delay: Duration,
    fail: bool,
    pub launches: AtomicUsize,
    pub terminations: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(control_addr: SocketAddr) -> Self {
        Self {
            control_addr,
            delay: Duration::ZERO,
            fail: false,
            launches: AtomicUsize::new(0),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, _config: &LaunchConfig) -> Result<Box<dyn Daemon>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::Launch("tor exited during startup: exit status: 1".into()));
        }
        Ok(Box::new(FakeDaemon {
            control_addr: self.control_addr,
            terminations: self.terminations.clone(),
            terminated: false,
        }))
    }
}

struct FakeDaemon {
    control_addr: SocketAddr,
    terminations: Arc<AtomicUsize>,
    terminated: bool,
}

#[async_trait]
impl Daemon for FakeDaemon {
    fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    fn auth(&self) -> TorAuth {
        TorAuth::None
    }

    async fn terminate(&mut self, control: Option<&TorController>) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        if let Some(control) = control {
            let _ = control.signal("SHUTDOWN").await;
        }
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How the fake SOCKS proxy treats CONNECT requests.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SocksMode {
    /// Tunnel to a tiny HTTP responder.
    Http,
    /// Accept the tunnel, then never answer.
    Silent,
    /// Refuse with the given SOCKS reply code.
    Refuse(u8),
}

/// A fake SOCKS5 proxy with an HTTP endpoint behind it.
///
/// The HTTP responder answers `201` with a body echoing the request line,
/// the Host header, the `X-Test` header and the request body.
pub struct FakeSocks {
    pub addr: SocketAddr,
    pub targets: Arc<Mutex<Vec<(String, u16)>>>,
}

impl FakeSocks {
    pub async fn spawn(mode: SocksMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let targets = Arc::new(Mutex::new(Vec::new()));

        let server_targets = targets.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_socks(stream, mode, server_targets.clone()));
            }
        });

        Self { addr, targets }
    }

    pub fn targets(&self) -> Vec<(String, u16)> {
        self.targets.lock().expect("lock").clone()
    }
}

async fn serve_socks(
    mut stream: TcpStream,
    mode: SocksMode,
    targets: Arc<Mutex<Vec<(String, u16)>>>,
) -> std::io::Result<()> {
    let mut greeting = [0u8; 3];
    stream.read_exact(&mut greeting).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    let mut head = [0u8; 5];
    stream.read_exact(&mut head).await?;
    let mut rest = vec![0u8; head[4] as usize + 2];
    stream.read_exact(&mut rest).await?;
    let host = String::from_utf8_lossy(&rest[..head[4] as usize]).into_owned();
    let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);
    targets.lock().expect("lock").push((host, port));

    let code = match mode {
        SocksMode::Refuse(code) => code,
        _ => 0x00,
    };
    stream
        .write_all(&[0x05, code, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await?;

    match mode {
        SocksMode::Refuse(_) => Ok(()),
        SocksMode::Silent => {
            let mut sink = [0u8; 1024];
            while stream.read(&mut sink).await? > 0 {}
            Ok(())
        }
        SocksMode::Http => serve_http(stream).await,
    }
}

async fn serve_http(stream: TcpStream) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut host = String::new();
    let mut x_test = String::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "host" => host = value.to_string(),
                "x-test" => x_test = value.to_string(),
                "content-length" => content_length = value.parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    let echo = format!(
        "{}|host={}|x-test={}|body={}",
        request_line.trim_end(),
        host,
        x_test,
        String::from_utf8_lossy(&body)
    );
    let response = format!(
        "HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        echo.len(),
        echo
    );

    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
