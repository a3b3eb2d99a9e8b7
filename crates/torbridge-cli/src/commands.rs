//! CLI command implementations.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use torbridge_core::{
    parse_key_specs, HttpRequest, KeySpec, StartTorParams, TorConfig, TorService,
    TorServiceConfig,
};
use tracing::info;

/// Service config for the given tor executable (`~` expanded).
pub fn service_config(tor: &str) -> TorServiceConfig {
    TorServiceConfig {
        tor_binary: shellexpand::tilde(tor).to_string().into(),
        ..Default::default()
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode result")?
    );
    Ok(())
}

/// Start Tor with onion services and keep it up until Ctrl+C.
pub async fn run(
    config: TorServiceConfig,
    data_dir: &str,
    socks_port: u16,
    target_port: u16,
    timeout_ms: u64,
    keys_json: &str,
) -> Result<()> {
    let keys = parse_key_specs(keys_json).context("Invalid --keys")?;
    let service = TorService::new(config);

    println!("\nStarting Tor...");
    let params = StartTorParams::new(data_dir, socks_port, target_port, timeout_ms).with_keys(keys);
    let response = service.start_tor_if_not_running(params).await;
    print_json(&response)?;

    if !response.is_success {
        bail!("Tor failed to start: {}", response.error_message);
    }

    for address in &response.onion_addresses {
        println!("  Onion service: {} -> 127.0.0.1:{}", address, target_port);
    }
    if let Some(socks) = service.socks_address().await {
        println!("  SOCKS proxy:   {}", socks);
    }
    println!("\nPress Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!("\nShutting down...");
    service
        .shutdown_service()
        .await
        .context("Failed to shut down Tor")?;
    Ok(())
}

/// Start Tor, perform one request, print the result, stop Tor.
pub async fn fetch(
    config: TorServiceConfig,
    data_dir: &str,
    start_timeout_ms: u64,
    request: HttpRequest,
) -> Result<()> {
    let service = TorService::new(config);

    service
        .init_tor_service(TorConfig {
            data_dir: data_dir.into(),
            socks_port: 0,
            timeout_ms: start_timeout_ms,
        })
        .await
        .context("Failed to start Tor")?;

    info!(method = %request.method, "Sending request through Tor");
    let response = service.http_request(request).await;

    let shutdown = service.shutdown_service().await;
    print_json(&response)?;
    shutdown.context("Failed to shut down Tor")?;

    if !response.is_success() {
        bail!("Request failed: {}", response.error);
    }
    Ok(())
}

/// Print a freshly generated key spec.
pub fn keygen() -> Result<()> {
    let spec = KeySpec::random();
    print_json(&spec)?;
    eprintln!("\nKeep seed_hex secret. Pass this object in --keys to reuse the address.");
    Ok(())
}
