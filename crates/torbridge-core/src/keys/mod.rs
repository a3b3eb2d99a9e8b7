//! Hidden-service key material.
//!
//! Callers describe each service key with a [`KeySpec`]: either "let Tor
//! generate one" or a hex-encoded Ed25519 seed, optionally cross-checked
//! against a public key and an onion address. [`KeyMaterial`] is the
//! validated form handed to the control client.
//!
//! Validation never talks to Tor, so a bad spec is rejected before any
//! control command is issued.

mod onion;

pub use onion::{OnionAddress, SERVICE_ID_LEN};

use crate::error::{Error, Result};
use crate::logging::RedactedHex;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use zeroize::Zeroizing;

/// Key argument asking Tor to mint a fresh key of its preferred type.
const GENERATE_KEY_ARG: &str = "NEW:BEST";

/// Key type prefix for provided v3 keys.
const ED25519_V3_PREFIX: &str = "ED25519-V3:";

/// One entry of the key list of a start request.
///
/// Wire form: `{ "onion"?, "seed_hex"?, "pub_hex"?, "generate"? }`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Ask Tor to generate the key. Seed and public key are ignored.
    #[serde(default)]
    pub generate: bool,
    /// Expected onion address (or bare service id) of a provided key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onion: Option<String>,
    /// Hex-encoded 32-byte Ed25519 seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_hex: Option<String>,
    /// Hex-encoded 32-byte Ed25519 public key, cross-checked against the seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_hex: Option<String>,
}

impl KeySpec {
    /// A spec asking Tor for a fresh key.
    pub fn generated() -> Self {
        Self {
            generate: true,
            ..Default::default()
        }
    }

    /// A spec for a provided seed.
    pub fn from_seed_hex(seed_hex: impl Into<String>) -> Self {
        Self {
            seed_hex: Some(seed_hex.into()),
            ..Default::default()
        }
    }

    /// Create a fresh local key and describe it fully (seed, public key and
    /// onion address), ready to be stored by the caller and passed back later.
    pub fn random() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let seed = Zeroizing::new(signing_key.to_bytes());

        Self {
            generate: false,
            onion: Some(OnionAddress::from_public_key(&verifying_key).to_string()),
            seed_hex: Some(hex::encode(&seed[..])),
            pub_hex: Some(hex::encode(verifying_key.as_bytes())),
        }
    }
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySpec")
            .field("generate", &self.generate)
            .field("onion", &self.onion)
            .field("seed_hex", &self.seed_hex.as_deref().map(RedactedHex))
            .field("pub_hex", &self.pub_hex)
            .finish()
    }
}

/// Parse the JSON key list of the public contract.
///
/// An empty string or `null` means "no keys" (one default service).
pub fn parse_key_specs(json: &str) -> Result<Vec<KeySpec>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }

    let specs: Option<Vec<KeySpec>> = serde_json::from_str(json)
        .map_err(|e| Error::Validation(format!("malformed key list: {}", e)))?;
    Ok(specs.unwrap_or_default())
}

/// Where the key of a hidden service came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOrigin {
    /// Minted by Tor on ADD_ONION.
    Generated,
    /// Supplied by the caller.
    Provided,
}

/// Validated key material for one hidden service.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Tor mints the key.
    Generate,
    /// Caller-provided Ed25519 key.
    Provided(ProvidedKey),
}

/// A caller-provided key in the form Tor expects.
#[derive(Clone)]
pub struct ProvidedKey {
    /// SHA-512 expanded, clamped secret key.
    expanded: Zeroizing<[u8; 64]>,
    /// Address the key must produce.
    address: OnionAddress,
}

impl KeyMaterial {
    /// Validate a spec.
    ///
    /// Fails with [`Error::Validation`] on invalid hex, wrong lengths, a
    /// missing seed or any cross-check mismatch.
    pub fn from_spec(spec: &KeySpec) -> Result<Self> {
        if spec.generate {
            return Ok(KeyMaterial::Generate);
        }

        let seed_hex = spec
            .seed_hex
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::Validation("seed_hex is required unless generate is true".into()))?;

        let seed = decode_32("seed_hex", seed_hex)?;
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();

        if let Some(pub_hex) = spec.pub_hex.as_deref().filter(|s| !s.trim().is_empty()) {
            let expected = decode_32("pub_hex", pub_hex)?;
            if expected[..] != verifying_key.as_bytes()[..] {
                return Err(Error::Validation("pub_hex does not match seed_hex".into()));
            }
        }

        let address = OnionAddress::from_public_key(&verifying_key);

        if let Some(onion) = spec.onion.as_deref().filter(|s| !s.trim().is_empty()) {
            let expected = OnionAddress::parse(onion)?;
            if expected != address {
                return Err(Error::Validation("onion does not match seed_hex".into()));
            }
        }

        Ok(KeyMaterial::Provided(ProvidedKey {
            expanded: Zeroizing::new(expand_ed25519_secret_key(&seed)),
            address,
        }))
    }

    /// Validate a whole key list; the first invalid entry fails the batch.
    pub fn from_specs(specs: &[KeySpec]) -> Result<Vec<Self>> {
        specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                Self::from_spec(spec).map_err(|e| match e {
                    Error::Validation(msg) => Error::Validation(format!("key {}: {}", i, msg)),
                    other => other,
                })
            })
            .collect()
    }

    /// Origin recorded on the resulting hidden service.
    pub fn origin(&self) -> KeyOrigin {
        match self {
            KeyMaterial::Generate => KeyOrigin::Generated,
            KeyMaterial::Provided(_) => KeyOrigin::Provided,
        }
    }

    /// Address a provided key will produce; `None` for generated keys.
    pub fn expected_address(&self) -> Option<&OnionAddress> {
        match self {
            KeyMaterial::Generate => None,
            KeyMaterial::Provided(key) => Some(&key.address),
        }
    }

    /// Key argument of ADD_ONION.
    pub(crate) fn control_arg(&self) -> Zeroizing<String> {
        match self {
            KeyMaterial::Generate => Zeroizing::new(GENERATE_KEY_ARG.to_string()),
            KeyMaterial::Provided(key) => Zeroizing::new(format!(
                "{}{}",
                ED25519_V3_PREFIX,
                BASE64.encode(&key.expanded[..])
            )),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Generate => write!(f, "KeyMaterial::Generate"),
            KeyMaterial::Provided(key) => f
                .debug_struct("KeyMaterial::Provided")
                .field("address", &key.address)
                .field("expanded", &"[REDACTED]")
                .finish(),
        }
    }
}

fn decode_32(field: &str, value: &str) -> Result<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(
        hex::decode(value.trim()).map_err(|e| Error::Validation(format!("{} is not valid hex: {}", field, e)))?,
    );

    if bytes.len() != 32 {
        return Err(Error::Validation(format!(
            "{} must be 32 bytes, got {}",
            field,
            bytes.len()
        )));
    }

    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Expand Ed25519 32-byte seed to 64-byte expanded secret key.
///
/// Tor's ADD_ONION expects the expanded key format:
/// - First 32 bytes: clamped scalar
/// - Last 32 bytes: prefix for signing
fn expand_ed25519_secret_key(seed: &[u8; 32]) -> [u8; 64] {
    let hash = Sha512::digest(seed);
    let mut expanded = [0u8; 64];
    expanded.copy_from_slice(&hash);

    expanded[0] &= 248;
    expanded[31] &= 127;
    expanded[31] |= 64;

    expanded
}
