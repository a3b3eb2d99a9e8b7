//! Tor connection handling.
//!
//! Opens TCP streams through Tor's SOCKS5 proxy. Hostnames are always sent
//! as SOCKS5 domain names (ATYP 0x03) so resolution happens inside Tor,
//! never locally; this is what makes `.onion` targets reachable at all.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// A connection through Tor to `host:port`.
pub struct TorConnection {
    stream: TcpStream,
}

impl TorConnection {
    /// Connect to `host:port` via the SOCKS5 proxy at `socks_addr`.
    pub async fn connect(socks_addr: SocketAddr, host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect(socks_addr)
            .await
            .map_err(|e| Error::Request(format!("failed to connect to SOCKS proxy: {}", e)))?;
        stream.set_nodelay(true)?;

        let mut connection = Self { stream };
        connection.socks5_handshake(host, port).await?;

        debug!(port, "SOCKS5 tunnel established");
        Ok(connection)
    }

    /// Perform SOCKS5 handshake.
    async fn socks5_handshake(&mut self, host: &str, port: u16) -> Result<()> {
        let host_bytes = host.as_bytes();
        if host_bytes.is_empty() || host_bytes.len() > 255 {
            return Err(Error::Request(format!("invalid hostname length {}", host_bytes.len())));
        }

        // Version 5, 1 auth method (no auth)
        self.stream
            .write_all(&[SOCKS_VERSION, 0x01, AUTH_NONE])
            .await
            .map_err(|e| Error::Request(format!("SOCKS5 greeting failed: {}", e)))?;

        let mut response = [0u8; 2];
        self.stream
            .read_exact(&mut response)
            .await
            .map_err(|e| Error::Request(format!("SOCKS5 response failed: {}", e)))?;

        if response[0] != SOCKS_VERSION || response[1] != AUTH_NONE {
            return Err(Error::Request("SOCKS5 authentication failed".into()));
        }

        let mut request = Vec::with_capacity(7 + host_bytes.len());
        request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        request.push(host_bytes.len() as u8);
        request.extend_from_slice(host_bytes);
        request.extend_from_slice(&port.to_be_bytes());

        self.stream
            .write_all(&request)
            .await
            .map_err(|e| Error::Request(format!("SOCKS5 connect failed: {}", e)))?;

        let mut header = [0u8; 4];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| Error::Request(format!("SOCKS5 connect response failed: {}", e)))?;

        if header[0] != SOCKS_VERSION {
            return Err(Error::Request("invalid SOCKS5 version in response".into()));
        }
        if header[1] != 0x00 {
            return Err(Error::Request(format!(
                "SOCKS5 connect failed: {}",
                reply_message(header[1])
            )));
        }

        // Bound address is unused but must be consumed.
        let remaining = match header[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.stream.read_exact(&mut len).await?;
                len[0] as usize + 2
            }
            _ => return Err(Error::Request("invalid SOCKS5 address type".into())),
        };
        let mut buf = vec![0u8; remaining];
        self.stream.read_exact(&mut buf).await?;

        Ok(())
    }

    /// Unwrap into the tunnelled stream.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Text for SOCKS5 reply codes, including Tor's onion-specific extensions.
fn reply_message(code: u8) -> String {
    let text = match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        0xF0 => "onion service descriptor can not be found",
        0xF1 => "onion service descriptor is invalid",
        0xF2 => "onion service introduction failed",
        0xF3 => "onion service rendezvous failed",
        0xF4 => "onion service missing client authorization",
        0xF5 => "onion service wrong client authorization",
        0xF6 => "onion service invalid address",
        0xF7 => "onion service introduction timed out",
        _ => return format!("error code {:#04x}", code),
    };
    text.to_string()
}
