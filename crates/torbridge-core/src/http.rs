//! HTTP client tunnelled through Tor's SOCKS port.
//!
//! Each request opens its own SOCKS stream, optionally wraps it in TLS, and
//! runs a single HTTP/1.1 exchange over it with hyper's low-level client
//! connection. One deadline covers the whole exchange, from the SOCKS
//! handshake to the last body byte.
//!
//! Nothing here returns an error to the caller: every failure is folded
//! into [`HttpResponse::error`] with `status_code == 0`.

use crate::error::{Error, Result};
use crate::tor::TorConnection;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Deadline applied when a request asks for `timeout_ms == 0`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Supported request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl HttpMethod {
    fn as_method(self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_method().as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(Error::Validation(format!("unsupported HTTP method {:?}", other))),
        }
    }
}

/// A request to tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute `http://` or `https://` URL; `.onion` hosts are fine.
    pub url: String,
    /// JSON object of header name to value. Anything else means no headers.
    #[serde(default)]
    pub headers_json: String,
    /// Request body, sent as-is.
    #[serde(default)]
    pub body: String,
    /// Deadline in milliseconds; `0` selects [`DEFAULT_TIMEOUT`].
    #[serde(default)]
    pub timeout_ms: u64,
}

impl HttpRequest {
    /// Request without headers or body.
    pub fn new(method: HttpMethod, url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            method,
            url: url.into(),
            headers_json: String::new(),
            body: String::new(),
            timeout_ms,
        }
    }

    /// Effective deadline.
    pub fn timeout(&self) -> Duration {
        if self.timeout_ms == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_millis(self.timeout_ms)
        }
    }
}

/// Outcome of a tunnelled request. Always populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status, `0` when no response was received.
    pub status_code: u16,
    /// Response body (lossy UTF-8).
    pub body: String,
    /// Empty on transport success, otherwise a description of the failure.
    pub error: String,
}

impl HttpResponse {
    /// Transport failure.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status_code: 0,
            body: String::new(),
            error: error.into(),
        }
    }

    /// Whether a response was received (any status, including 4xx/5xx).
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// Parse the headers JSON permissively.
///
/// Only a JSON object yields headers. String values are used verbatim,
/// numbers and booleans are stringified, everything else is skipped, as are
/// names or values HTTP does not allow.
pub fn parse_headers(json: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let json = json.trim();
    if json.is_empty() {
        return headers;
    }

    let map = match serde_json::from_str::<serde_json::Value>(json) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            debug!("Ignoring headers that are not a JSON object");
            return headers;
        }
    };

    for (name, value) in map {
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => continue,
        };

        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(header = %name, "Skipping invalid header"),
        }
    }

    headers
}

/// Perform `request` through the SOCKS proxy at `socks_addr`.
pub async fn send(socks_addr: SocketAddr, request: &HttpRequest) -> HttpResponse {
    let deadline = request.timeout();

    match tokio::time::timeout(deadline, execute(socks_addr, request)).await {
        Ok(Ok(response)) => {
            debug!(
                method = %request.method,
                status = response.status_code,
                bytes = response.body.len(),
                "Request completed"
            );
            response
        }
        Ok(Err(e)) => {
            debug!(method = %request.method, error = %e, "Request failed");
            HttpResponse::failure(e.to_string())
        }
        Err(_) => {
            debug!(method = %request.method, ?deadline, "Request timed out");
            HttpResponse::failure(Error::Timeout.to_string())
        }
    }
}

struct Target {
    https: bool,
    host: String,
    port: u16,
    host_header: String,
    path: String,
}

fn parse_target(url: &str) -> Result<Target> {
    let uri: Uri = url
        .trim()
        .parse()
        .map_err(|e| Error::Request(format!("invalid url {:?}: {}", url, e)))?;

    let https = match uri.scheme_str() {
        Some(s) if s.eq_ignore_ascii_case("http") => false,
        Some(s) if s.eq_ignore_ascii_case("https") => true,
        Some(other) => return Err(Error::Request(format!("unsupported scheme {:?}", other))),
        None => return Err(Error::Request(format!("url {:?} has no scheme", url))),
    };

    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Request(format!("url {:?} has no host", url)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
    let host_header = match uri.port_u16() {
        Some(p) if host.contains(':') => format!("[{}]:{}", host, p),
        Some(p) => format!("{}:{}", host, p),
        None => uri.host().unwrap_or_default().to_string(),
    };
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
        .to_string();

    Ok(Target {
        https,
        host,
        port,
        host_header,
        path,
    })
}

async fn execute(socks_addr: SocketAddr, request: &HttpRequest) -> Result<HttpResponse> {
    let target = parse_target(&request.url)?;

    let mut builder = Request::builder()
        .method(request.method.as_method())
        .uri(target.path.as_str())
        .header(HOST, target.host_header.as_str());
    if let Some(headers) = builder.headers_mut() {
        // Caller headers replace defaults, Host included.
        headers.extend(parse_headers(&request.headers_json));
    }
    let outgoing = builder
        .body(Full::new(Bytes::from(request.body.clone())))
        .map_err(|e| Error::Request(format!("invalid request: {}", e)))?;

    let stream = TorConnection::connect(socks_addr, &target.host, target.port)
        .await?
        .into_stream();

    if target.https {
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| Error::Request(format!("invalid TLS server name: {}", e)))?;
        let tls = TlsConnector::from(tls_config()?)
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Request(format!("TLS handshake failed: {}", e)))?;
        exchange(tls, outgoing).await
    } else {
        exchange(stream, outgoing).await
    }
}

async fn exchange<S>(stream: S, request: Request<Full<Bytes>>) -> Result<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::Request(format!("HTTP handshake failed: {}", e)))?;

    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "HTTP connection closed with error");
        }
    });
    // Dropping the guard aborts the driver and with it the socket, also when
    // the caller's deadline cancels this future.
    let _driver = scopeguard::guard(driver, |driver| driver.abort());

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::Request(e.to_string()))?;

    let status_code = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Request(format!("failed to read body: {}", e)))?
        .to_bytes();

    Ok(HttpResponse {
        status_code,
        body: String::from_utf8_lossy(&body).into_owned(),
        error: String::new(),
    })
}

fn tls_config() -> Result<Arc<ClientConfig>> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!(error = %e, "Error loading native certificates");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded native root certificates");

    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Request(format!("TLS setup failed: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}
