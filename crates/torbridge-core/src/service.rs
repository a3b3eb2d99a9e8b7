//! Tor service orchestration.
//!
//! [`TorService`] is the facade behind the public contract:
//! - starts the daemon at most once per burst of concurrent start calls;
//! - follows bootstrap through control port events;
//! - provisions hidden services from caller key material;
//! - tunnels HTTP requests once the daemon is running.
//!
//! All state transitions happen while holding the runtime lock, so a status
//! read never observes a half-applied transition and there is never more
//! than one daemon.

use crate::error::{Error, Result};
use crate::http::{self, HttpMethod, HttpRequest, HttpResponse};
use crate::keys::{KeyMaterial, KeyOrigin, KeySpec, OnionAddress};
use crate::logging::RedactedOnion;
use crate::tor::{
    Daemon, LaunchConfig, Launcher, TorController, TorLauncher, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_SHUTDOWN_GRACE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Start deadline used when a caller passes `timeout_ms == 0`.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(120);

const EVENT_CAPACITY: usize = 64;

/// Orchestrator settings that do not vary per start call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorServiceConfig {
    /// Path or name of the `tor` executable.
    pub tor_binary: PathBuf,
    /// Control port, `0` for an automatically chosen one.
    pub control_port: u16,
    /// Wait after SIGNAL SHUTDOWN before killing the daemon.
    pub shutdown_grace: Duration,
    /// Deadline for each control command reply.
    pub command_timeout: Duration,
}

impl Default for TorServiceConfig {
    fn default() -> Self {
        Self {
            tor_binary: PathBuf::from("tor"),
            control_port: 0,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Parameters for bringing the daemon up without provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorConfig {
    /// Daemon data directory.
    pub data_dir: PathBuf,
    /// SOCKS port, `0` for an automatically chosen one.
    pub socks_port: u16,
    /// Start deadline in milliseconds; `0` selects [`DEFAULT_START_TIMEOUT`].
    pub timeout_ms: u64,
}

/// Parameters of [`TorService::start_tor_if_not_running`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTorParams {
    /// Daemon data directory.
    pub data_dir: PathBuf,
    /// SOCKS port, `0` for an automatically chosen one.
    pub socks_port: u16,
    /// Local port hidden services forward to; also their virtual port.
    pub target_port: u16,
    /// Start deadline in milliseconds; `0` selects [`DEFAULT_START_TIMEOUT`].
    pub timeout_ms: u64,
    /// Keys to provision; empty means one generated service.
    #[serde(default)]
    pub keys: Vec<KeySpec>,
}

impl StartTorParams {
    /// Parameters with no keys.
    pub fn new(data_dir: impl Into<PathBuf>, socks_port: u16, target_port: u16, timeout_ms: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            socks_port,
            target_port,
            timeout_ms,
            keys: Vec::new(),
        }
    }

    /// Replace the key list.
    pub fn with_keys(mut self, keys: Vec<KeySpec>) -> Self {
        self.keys = keys;
        self
    }

    fn tor_config(&self) -> TorConfig {
        TorConfig {
            data_dir: self.data_dir.clone(),
            socks_port: self.socks_port,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Lifecycle state of the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ServiceState {
    /// No daemon.
    Stopped,
    /// Launching the daemon.
    Starting,
    /// Daemon is up; bootstrap progress in percent.
    Bootstrapping(u8),
    /// Bootstrapped and provisioned.
    Running,
    /// Last start failed.
    Error(String),
    /// Tearing down.
    ShuttingDown,
}

impl ServiceState {
    /// Stable integer code of the public contract.
    pub fn code(&self) -> u8 {
        match self {
            ServiceState::Stopped => 0,
            ServiceState::Starting => 1,
            ServiceState::Bootstrapping(_) => 2,
            ServiceState::Running => 3,
            ServiceState::Error(_) => 4,
            ServiceState::ShuttingDown => 5,
        }
    }

    /// Whether requests may be served.
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    fn is_starting(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Bootstrapping(_))
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Bootstrapping(p) => write!(f, "bootstrapping ({}%)", p),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Error(msg) => write!(f, "error: {}", msg),
            ServiceState::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// A provisioned hidden service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenServiceRecord {
    /// Full `.onion` address.
    pub onion_address: OnionAddress,
    /// Virtual port on the onion side.
    pub listening_port: u16,
    /// Local port traffic is forwarded to.
    pub target_port: u16,
    /// Where the key came from.
    pub key_origin: KeyOrigin,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// The lifecycle state changed.
    StateChanged(ServiceState),
    /// A hidden service was provisioned.
    HiddenServiceCreated(HiddenServiceRecord),
    /// A hidden service was removed.
    HiddenServiceRemoved(OnionAddress),
}

/// Outcome of a start call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTorResponse {
    /// Whether the daemon is running with every requested service.
    pub is_success: bool,
    /// First provisioned address, empty on failure.
    pub onion_address: String,
    /// All provisioned addresses in key order.
    pub onion_addresses: Vec<String>,
    /// Control endpoint, `127.0.0.1:<port>`.
    pub control: String,
    /// Failure description, empty on success.
    pub error_message: String,
}

impl StartTorResponse {
    fn success(addresses: &[OnionAddress], control: String) -> Self {
        let onion_addresses: Vec<String> = addresses.iter().map(ToString::to_string).collect();
        Self {
            is_success: true,
            onion_address: onion_addresses.first().cloned().unwrap_or_default(),
            onion_addresses,
            control,
            error_message: String::new(),
        }
    }

    fn failure(error: &Error) -> Self {
        Self {
            error_message: error.to_string(),
            ..Default::default()
        }
    }
}

/// Outcome of [`TorService::create_hidden_service`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenServiceResponse {
    /// Whether the service was provisioned.
    pub is_success: bool,
    /// Its address, empty on failure.
    pub onion_address: String,
    /// Control endpoint, `127.0.0.1:<port>`.
    pub control: String,
    /// Failure description, empty on success.
    pub error_message: String,
}

/// State readable without waiting for an in-flight start.
struct Shared {
    state: ServiceState,
    socks_addr: Option<SocketAddr>,
    control_addr: Option<SocketAddr>,
    services: HashMap<OnionAddress, HiddenServiceRecord>,
}

/// Resources owned while a daemon exists. Guarded by the start lock.
#[derive(Default)]
struct Runtime {
    daemon: Option<Box<dyn Daemon>>,
    control: Option<TorController>,
    last_start: Option<StartTorResponse>,
}

/// The orchestrator.
pub struct TorService {
    config: TorServiceConfig,
    launcher: Arc<dyn Launcher>,
    shared: RwLock<Shared>,
    runtime: Mutex<Runtime>,
    /// Completed start attempts; lets queued callers detect that the start
    /// they were waiting on has finished.
    starts: AtomicU64,
    events: broadcast::Sender<ServiceEvent>,
}

impl TorService {
    /// Orchestrator launching the real `tor` binary.
    pub fn new(config: TorServiceConfig) -> Self {
        Self::with_launcher(config, Arc::new(TorLauncher))
    }

    /// Orchestrator with a custom daemon launcher.
    pub fn with_launcher(config: TorServiceConfig, launcher: Arc<dyn Launcher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            launcher,
            shared: RwLock::new(Shared {
                state: ServiceState::Stopped,
                socks_addr: None,
                control_addr: None,
                services: HashMap::new(),
            }),
            runtime: Mutex::new(Runtime::default()),
            starts: AtomicU64::new(0),
            events,
        }
    }

    /// Subscribe to orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Current state.
    pub async fn state(&self) -> ServiceState {
        self.shared.read().await.state.clone()
    }

    /// Current state as the integer code of the public contract.
    pub async fn get_service_status(&self) -> u8 {
        self.shared.read().await.state.code()
    }

    /// Snapshot of the hidden service registry.
    pub async fn hidden_services(&self) -> Vec<HiddenServiceRecord> {
        self.shared.read().await.services.values().cloned().collect()
    }

    /// Control port of the running daemon.
    pub async fn control_address(&self) -> Option<SocketAddr> {
        self.shared.read().await.control_addr
    }

    /// SOCKS endpoint of the running daemon.
    pub async fn socks_address(&self) -> Option<SocketAddr> {
        let shared = self.shared.read().await;
        shared.socks_addr.filter(|_| shared.state.is_running())
    }

    /// Start the daemon and provision hidden services, unless already running.
    ///
    /// Concurrent callers share one start: whoever arrives while a start is
    /// in flight waits for it and receives its outcome. Once running, the
    /// result of the successful start is returned as-is.
    pub async fn start_tor_if_not_running(&self, params: StartTorParams) -> StartTorResponse {
        let observed = self.starts.load(Ordering::SeqCst);
        let joined_in_flight = self.shared.read().await.state.is_starting();

        let mut runtime = self.runtime.lock().await;

        if joined_in_flight || self.starts.load(Ordering::SeqCst) != observed {
            if let Some(last) = runtime.last_start.clone() {
                debug!(is_success = last.is_success, "Returning outcome of concurrent start");
                return last;
            }
        }

        let running = self.shared.read().await.state.is_running();
        if running {
            if let Some(last) = runtime.last_start.clone().filter(|r| r.is_success) {
                return last;
            }
        }

        let outcome = self.start_locked(&mut runtime, &params, running).await;
        let response = match outcome {
            Ok(addresses) => {
                self.set_state(ServiceState::Running).await;
                let control = self.control_string().await;
                info!(services = addresses.len(), %control, "Tor service running");
                StartTorResponse::success(&addresses, control)
            }
            Err(e) => {
                warn!(error = %e, "Tor start failed");
                if let Err(teardown) = self.teardown(&mut runtime).await {
                    warn!(error = %teardown, "Teardown after failed start also failed");
                }
                self.set_state(ServiceState::Error(e.to_string())).await;
                StartTorResponse::failure(&e)
            }
        };

        runtime.last_start = Some(response.clone());
        self.starts.fetch_add(1, Ordering::SeqCst);
        response
    }

    async fn start_locked(
        &self,
        runtime: &mut Runtime,
        params: &StartTorParams,
        running: bool,
    ) -> Result<Vec<OnionAddress>> {
        let mut keys = KeyMaterial::from_specs(&params.keys)?;
        if keys.is_empty() {
            keys.push(KeyMaterial::Generate);
        }

        if !running {
            self.boot(runtime, &params.tor_config()).await?;
        }

        let control = runtime.control.as_ref().ok_or(Error::NotRunning)?;
        let mut addresses = Vec::with_capacity(keys.len());
        for key in &keys {
            let record = self
                .provision(control, key, params.target_port, params.target_port)
                .await?;
            addresses.push(record.onion_address);
        }
        Ok(addresses)
    }

    /// Bring the daemon up without provisioning any hidden service.
    pub async fn init_tor_service(&self, config: TorConfig) -> Result<()> {
        let mut runtime = self.runtime.lock().await;

        if self.shared.read().await.state.is_running() {
            return Ok(());
        }

        match self.boot(&mut runtime, &config).await {
            Ok(()) => {
                self.set_state(ServiceState::Running).await;
                runtime.last_start = None;
                info!(control = %self.control_string().await, "Tor service initialized");
                Ok(())
            }
            Err(e) => {
                if let Err(teardown) = self.teardown(&mut runtime).await {
                    warn!(error = %teardown, "Teardown after failed init also failed");
                }
                self.set_state(ServiceState::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Launch, authenticate and wait for bootstrap, all under one deadline.
    async fn boot(&self, runtime: &mut Runtime, config: &TorConfig) -> Result<()> {
        let timeout = if config.timeout_ms == 0 {
            DEFAULT_START_TIMEOUT
        } else {
            Duration::from_millis(config.timeout_ms)
        };

        match tokio::time::timeout(timeout, self.boot_inner(runtime, config, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(Error::LaunchTimeout(timeout)),
        }
    }

    async fn boot_inner(&self, runtime: &mut Runtime, config: &TorConfig, timeout: Duration) -> Result<()> {
        self.set_state(ServiceState::Starting).await;

        let launch = LaunchConfig {
            tor_binary: self.config.tor_binary.clone(),
            data_dir: config.data_dir.clone(),
            socks_port: config.socks_port,
            control_port: self.config.control_port,
            timeout,
            shutdown_grace: self.config.shutdown_grace,
        };
        let daemon = runtime.daemon.insert(self.launcher.launch(&launch).await?);
        let control_addr = daemon.control_addr();
        let auth = daemon.auth();

        let control = runtime.control.insert(
            TorController::connect(control_addr, self.config.command_timeout).await?,
        );
        control.authenticate(&auth).await?;
        self.shared.write().await.control_addr = Some(control_addr);

        match control.get_version().await {
            Ok(version) => info!(%version, "Connected to Tor"),
            Err(e) => debug!(error = %e, "Could not get Tor version"),
        }

        self.set_state(ServiceState::Bootstrapping(0)).await;
        let mut bootstrap = control.subscribe_bootstrap().await?;
        loop {
            let status = bootstrap
                .next()
                .await
                .ok_or_else(|| Error::Launch("control connection closed during bootstrap".into()))?;
            debug!(progress = status.progress, tag = %status.tag, "Bootstrap progress");
            self.set_state(ServiceState::Bootstrapping(status.progress)).await;
            if status.is_done() {
                break;
            }
        }

        let socks_addr = control.socks_listener().await?;
        self.shared.write().await.socks_addr = Some(socks_addr);
        info!(%socks_addr, %control_addr, "Tor bootstrapped");
        Ok(())
    }

    /// ADD_ONION and register the result.
    async fn provision(
        &self,
        control: &TorController,
        key: &KeyMaterial,
        port: u16,
        target_port: u16,
    ) -> Result<HiddenServiceRecord> {
        let reply = control.add_onion(key, port, target_port).await?;

        let record = HiddenServiceRecord {
            onion_address: reply.address,
            listening_port: port,
            target_port,
            key_origin: key.origin(),
        };
        self.shared
            .write()
            .await
            .services
            .insert(record.onion_address.clone(), record.clone());
        let _ = self.events.send(ServiceEvent::HiddenServiceCreated(record.clone()));
        Ok(record)
    }

    /// Provision one more generated hidden service on the running daemon.
    pub async fn create_hidden_service(&self, port: u16, target_port: u16) -> HiddenServiceResponse {
        let runtime = self.runtime.lock().await;

        let running = self.shared.read().await.state.is_running();
        let control = runtime.control.as_ref().filter(|_| running);
        let result = match control {
            Some(control) => {
                self.provision(control, &KeyMaterial::Generate, port, target_port)
                    .await
            }
            None => Err(Error::NotRunning),
        };

        match result {
            Ok(record) => HiddenServiceResponse {
                is_success: true,
                onion_address: record.onion_address.to_string(),
                control: self.control_string().await,
                error_message: String::new(),
            },
            Err(e) => {
                warn!(error = %e, "Failed to create hidden service");
                HiddenServiceResponse {
                    error_message: e.to_string(),
                    ..Default::default()
                }
            }
        }
    }

    /// Remove a hidden service by address (with or without `.onion`).
    pub async fn delete_hidden_service(&self, address: &str) -> Result<()> {
        let address =
            OnionAddress::parse(address).map_err(|_| Error::NotFound(address.to_string()))?;

        let runtime = self.runtime.lock().await;
        if !self.shared.read().await.services.contains_key(&address) {
            return Err(Error::NotFound(address.to_string()));
        }

        let control = runtime.control.as_ref().ok_or(Error::NotRunning)?;
        match control.del_onion(address.service_id()).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                debug!(onion = %RedactedOnion(address.as_str()), "Tor had already dropped the service");
            }
            Err(e) => return Err(e),
        }

        self.shared.write().await.services.remove(&address);
        let _ = self.events.send(ServiceEvent::HiddenServiceRemoved(address));
        Ok(())
    }

    /// Remove every hidden service and stop the daemon.
    ///
    /// Safe to call in any state; a no-op when nothing is running.
    pub async fn shutdown_service(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;

        if runtime.daemon.is_none() && runtime.control.is_none() {
            self.set_state(ServiceState::Stopped).await;
            return Ok(());
        }

        self.set_state(ServiceState::ShuttingDown).await;
        let result = self.teardown(&mut runtime).await;
        self.set_state(ServiceState::Stopped).await;

        match &result {
            Ok(()) => info!("Tor service stopped"),
            Err(e) => warn!(error = %e, "Tor service stopped with errors"),
        }
        result
    }

    /// Best-effort DEL_ONION for every record, then terminate the daemon.
    async fn teardown(&self, runtime: &mut Runtime) -> Result<()> {
        let records: Vec<HiddenServiceRecord> = {
            let mut shared = self.shared.write().await;
            shared.socks_addr = None;
            shared.control_addr = None;
            shared.services.drain().map(|(_, record)| record).collect()
        };

        let control = runtime.control.take();
        let mut control_usable = control.is_some();

        for record in records {
            if let (Some(ctrl), true) = (control.as_ref(), control_usable) {
                if let Err(e) = ctrl.del_onion(record.onion_address.service_id()).await {
                    debug!(
                        onion = %RedactedOnion(record.onion_address.as_str()),
                        error = %e,
                        "DEL_ONION during teardown failed"
                    );
                    control_usable = !e.is_connection_fatal();
                }
            }
            let _ = self.events.send(ServiceEvent::HiddenServiceRemoved(record.onion_address));
        }

        let result = match runtime.daemon.take() {
            Some(mut daemon) => {
                let usable = control.as_ref().filter(|_| control_usable);
                daemon.terminate(usable).await
            }
            None => Ok(()),
        };

        runtime.last_start = None;
        result
    }

    /// Tunnel a request through the daemon.
    ///
    /// Returns `{0, "", "tor not running"}` without any I/O unless running.
    pub async fn http_request(&self, request: HttpRequest) -> HttpResponse {
        match self.socks_address().await {
            Some(socks_addr) => http::send(socks_addr, &request).await,
            None => HttpResponse::failure(Error::NotRunning.to_string()),
        }
    }

    /// GET through Tor.
    pub async fn http_get(&self, url: &str, headers_json: &str, timeout_ms: u64) -> HttpResponse {
        self.http_request(HttpRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers_json: headers_json.to_string(),
            body: String::new(),
            timeout_ms,
        })
        .await
    }

    /// POST through Tor.
    pub async fn http_post(
        &self,
        url: &str,
        body: &str,
        headers_json: &str,
        timeout_ms: u64,
    ) -> HttpResponse {
        self.http_request(HttpRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers_json: headers_json.to_string(),
            body: body.to_string(),
            timeout_ms,
        })
        .await
    }

    /// PUT through Tor.
    pub async fn http_put(
        &self,
        url: &str,
        body: &str,
        headers_json: &str,
        timeout_ms: u64,
    ) -> HttpResponse {
        self.http_request(HttpRequest {
            method: HttpMethod::Put,
            url: url.to_string(),
            headers_json: headers_json.to_string(),
            body: body.to_string(),
            timeout_ms,
        })
        .await
    }

    /// DELETE through Tor.
    pub async fn http_delete(&self, url: &str, headers_json: &str, timeout_ms: u64) -> HttpResponse {
        self.http_request(HttpRequest {
            method: HttpMethod::Delete,
            url: url.to_string(),
            headers_json: headers_json.to_string(),
            body: String::new(),
            timeout_ms,
        })
        .await
    }

    async fn set_state(&self, state: ServiceState) {
        let mut shared = self.shared.write().await;
        if shared.state == state {
            return;
        }
        debug!(from = %shared.state, to = %state, "State transition");
        shared.state = state.clone();
        drop(shared);
        let _ = self.events.send(ServiceEvent::StateChanged(state));
    }

    async fn control_string(&self) -> String {
        self.shared
            .read()
            .await
            .control_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }
}

impl Default for TorService {
    fn default() -> Self {
        Self::new(TorServiceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(ServiceState::Stopped.code(), 0);
        assert_eq!(ServiceState::Starting.code(), 1);
        assert_eq!(ServiceState::Bootstrapping(42).code(), 2);
        assert_eq!(ServiceState::Running.code(), 3);
        assert_eq!(ServiceState::Error("x".into()).code(), 4);
        assert_eq!(ServiceState::ShuttingDown.code(), 5);
    }

    #[test]
    fn test_start_response_shapes() {
        let failed = StartTorResponse::failure(&Error::NotRunning);
        assert!(!failed.is_success);
        assert_eq!(failed.error_message, "tor not running");
        assert!(failed.onion_addresses.is_empty());
        assert!(failed.control.is_empty());

        let ok = StartTorResponse::success(&[], "127.0.0.1:9051".into());
        assert!(ok.is_success);
        assert!(ok.onion_address.is_empty());
        assert!(ok.error_message.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_service_is_stopped() {
        let service = TorService::default();
        assert_eq!(service.get_service_status().await, 0);
        assert!(service.hidden_services().await.is_empty());
        assert!(service.control_address().await.is_none());
        service.shutdown_service().await.expect("no-op shutdown");
    }

    #[tokio::test]
    async fn test_http_requires_running() {
        let service = TorService::default();
        let resp = service.http_get("http://example.com/", "", 1000).await;
        assert_eq!(resp, HttpResponse::failure("tor not running"));
    }

    #[tokio::test]
    async fn test_create_requires_running() {
        let service = TorService::default();
        let resp = service.create_hidden_service(80, 8080).await;
        assert!(!resp.is_success);
        assert_eq!(resp.error_message, "tor not running");
    }
}
