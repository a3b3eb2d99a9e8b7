//! # torbridge core library
//!
//! Runs a Tor client daemon on behalf of an application: launches and
//! supervises the process, provisions v3 onion services from generated or
//! caller-supplied keys, and tunnels HTTP requests through the daemon.
//!
//! ## Guarantees
//!
//! - At most one daemon per [`TorService`], however many callers race to
//!   start it
//! - Key material is validated before Tor sees it, zeroized on drop and
//!   never logged
//! - Hostnames are resolved by Tor, never locally
//! - Every HTTP call finishes within its deadline and reports failure as
//!   data, not as an error
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             service (TorService)        │
//! ├──────────────────────┬──────────────────┤
//! │ tor::process         │      http        │
//! │ tor::controller      │ tor::connection  │
//! ├──────────────────────┴──────────────────┤
//! │          keys          │    logging     │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod http;
pub mod keys;
pub mod logging;
pub mod service;
pub mod tor;

pub use error::{Error, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use keys::{parse_key_specs, KeyMaterial, KeyOrigin, KeySpec, OnionAddress};
pub use service::{
    HiddenServiceRecord, HiddenServiceResponse, ServiceEvent, ServiceState, StartTorParams,
    StartTorResponse, TorConfig, TorService, TorServiceConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
