//! torbridge Command-Line Interface
//!
//! Drives the core library from a terminal: run a Tor daemon with onion
//! services, fetch a URL through Tor, or mint a key for later runs.

use anyhow::Result;
use clap::{Parser, Subcommand};
use torbridge_core::HttpMethod;
use tracing_subscriber::EnvFilter;

mod commands;

/// torbridge - run Tor, publish onion services, fetch over Tor
#[derive(Parser)]
#[command(name = "torbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Tor executable
    #[arg(long, env = "TOR_BINARY", default_value = "tor", global = true)]
    tor: String,

    /// Tor data directory
    #[arg(short, long, default_value = "~/.torbridge", global = true)]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start Tor, publish onion services and wait for Ctrl+C
    Run {
        /// SOCKS5 port (0 picks a free one)
        #[arg(long, default_value = "0")]
        socks_port: u16,

        /// Local port the onion services forward to
        #[arg(long, default_value = "8080")]
        target_port: u16,

        /// Start deadline in milliseconds
        #[arg(long, default_value = "120000")]
        timeout_ms: u64,

        /// Key list as JSON: [{"seed_hex": "..."}, {"generate": true}]
        #[arg(long, default_value = "")]
        keys: String,
    },

    /// Fetch a URL through Tor and print the result as JSON
    Fetch {
        /// http:// or https:// URL, .onion hosts included
        url: String,

        /// GET, POST, PUT or DELETE
        #[arg(short = 'X', long, default_value = "GET", value_parser = parse_method)]
        method: HttpMethod,

        /// Request body
        #[arg(long, default_value = "")]
        body: String,

        /// Headers as a JSON object
        #[arg(short = 'H', long, default_value = "")]
        headers: String,

        /// Request deadline in milliseconds (0 = 60 s)
        #[arg(long, default_value = "60000")]
        timeout_ms: u64,

        /// Start deadline in milliseconds
        #[arg(long, default_value = "120000")]
        start_timeout_ms: u64,
    },

    /// Generate a key spec to pass back via --keys
    Keygen,
}

fn parse_method(s: &str) -> std::result::Result<HttpMethod, String> {
    s.parse().map_err(|e: torbridge_core::Error| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let data_dir = shellexpand::tilde(&cli.data_dir).to_string();
    let config = commands::service_config(&cli.tor);

    match cli.command {
        Commands::Run {
            socks_port,
            target_port,
            timeout_ms,
            keys,
        } => {
            commands::run(config, &data_dir, socks_port, target_port, timeout_ms, &keys).await?;
        }
        Commands::Fetch {
            url,
            method,
            body,
            headers,
            timeout_ms,
            start_timeout_ms,
        } => {
            let request = torbridge_core::HttpRequest {
                method,
                url,
                headers_json: headers,
                body,
                timeout_ms,
            };
            commands::fetch(config, &data_dir, start_timeout_ms, request).await?;
        }
        Commands::Keygen => {
            commands::keygen()?;
        }
    }

    Ok(())
}
