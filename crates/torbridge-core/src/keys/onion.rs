//! Tor v3 onion address derivation and validation.
//!
//! Tor v3 (.onion) addresses are derived from Ed25519 public keys:
//!
//! 1. Compute checksum: SHA3-256(".onion checksum" || pubkey || version)[..2]
//! 2. Encode: base32(pubkey || checksum || version)
//! 3. Append ".onion"
//!
//! This produces a 56-character service id + ".onion" suffix.

use crate::error::{Error, Result};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

/// Tor v3 onion service version byte.
const ONION_VERSION: u8 = 0x03;

/// Checksum prefix per Tor spec.
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Length of a v3 service id (the address without ".onion").
pub const SERVICE_ID_LEN: usize = 56;

const BASE32: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// A Tor v3 onion address.
///
/// Always stored lowercase with the `.onion` suffix.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse an onion address or bare service id.
    ///
    /// Accepts any case, with or without the `.onion` suffix, and verifies
    /// the embedded checksum and version.
    pub fn parse(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let id = lower.strip_suffix(".onion").unwrap_or(&lower);

        if id.len() != SERVICE_ID_LEN {
            return Err(Error::Validation(format!(
                "v3 service id must be {} characters, got {}",
                SERVICE_ID_LEN,
                id.len()
            )));
        }

        let address = Self(format!("{}.onion", id));
        address.extract_public_key()?;
        Ok(address)
    }

    /// Get the full address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Service id as used by ADD_ONION / DEL_ONION (no `.onion` suffix).
    pub fn service_id(&self) -> &str {
        &self.0[..SERVICE_ID_LEN]
    }

    /// Derive an onion address from an Ed25519 public key.
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let pubkey_bytes = public_key.as_bytes();
        let checksum = checksum(pubkey_bytes);

        // pubkey (32) || checksum (2) || version (1) = 35 bytes
        let mut addr_bytes = [0u8; 35];
        addr_bytes[..32].copy_from_slice(pubkey_bytes);
        addr_bytes[32..34].copy_from_slice(&checksum);
        addr_bytes[34] = ONION_VERSION;

        let encoded = base32::encode(BASE32, &addr_bytes);
        Self(format!("{}.onion", encoded.to_ascii_lowercase()))
    }

    /// Extract and verify the public key embedded in this address.
    pub fn extract_public_key(&self) -> Result<VerifyingKey> {
        let decoded = base32::decode(BASE32, &self.service_id().to_ascii_uppercase())
            .ok_or_else(|| Error::Validation("invalid base32 in onion address".into()))?;

        if decoded.len() != 35 {
            return Err(Error::Validation("invalid onion address length".into()));
        }
        if decoded[34] != ONION_VERSION {
            return Err(Error::Validation("unsupported onion version".into()));
        }

        let pubkey_bytes: [u8; 32] = decoded[..32]
            .try_into()
            .map_err(|_| Error::Validation("invalid key length".into()))?;

        if decoded[32..34] != checksum(&pubkey_bytes) {
            return Err(Error::Validation("onion address checksum mismatch".into()));
        }

        VerifyingKey::from_bytes(&pubkey_bytes)
            .map_err(|e| Error::Validation(format!("invalid public key in onion address: {}", e)))
    }
}

fn checksum(pubkey: &[u8; 32]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

impl TryFrom<String> for OnionAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<OnionAddress> for String {
    fn from(address: OnionAddress) -> Self {
        address.0
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn test_onion_address_derivation() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let onion = OnionAddress::from_public_key(&verifying_key);

        assert!(onion.as_str().ends_with(".onion"));
        assert_eq!(onion.service_id().len(), SERVICE_ID_LEN);

        let extracted = onion.extract_public_key().expect("should extract");
        assert_eq!(extracted, verifying_key);
    }

    #[test]
    fn test_parse_with_and_without_suffix() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let onion = OnionAddress::from_public_key(&signing_key.verifying_key());

        let bare = OnionAddress::parse(onion.service_id()).expect("bare id");
        let upper = OnionAddress::parse(&onion.as_str().to_uppercase()).expect("uppercase");

        assert_eq!(bare, onion);
        assert_eq!(upper, onion);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OnionAddress::parse("abc.onion").is_err());
        assert!(OnionAddress::parse("example.com").is_err());
        assert!(OnionAddress::parse(&"0".repeat(56)).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let onion = OnionAddress::from_public_key(&signing_key.verifying_key());

        // Flip one character in the key part; the checksum no longer matches.
        let mut chars: Vec<char> = onion.service_id().chars().collect();
        chars[0] = if chars[0] == 'a' { 'b' } else { 'a' };
        let tampered: String = chars.into_iter().collect();

        assert!(OnionAddress::parse(&tampered).is_err());
    }
}
