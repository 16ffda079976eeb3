pub mod config;
pub mod error;
pub mod router;
pub mod types;

pub use config::{
    flow, guards, protocol, routing, BackoffTier, ClientConfig, ConfigError, GuardConfig,
};
pub use error::{OnionError, Result};
pub use router::{ExitPolicy, ExitRule, RouterDescriptor, RouterFlags};
pub use types::Timestamp;

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Length of a relay fingerprint (SHA-1 of the identity key)
pub const FINGERPRINT_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid fingerprint length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid fingerprint hex: {0}")]
    InvalidHex(String),
}

/// Immutable fingerprint identifying a relay.
///
/// Ordering follows the bytes, which is the same order as the uppercase
/// hexadecimal form used in directory documents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterIdentity([u8; FINGERPRINT_LEN]);

impl RouterIdentity {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, IdentityError> {
        if bytes.len() != FINGERPRINT_LEN {
            return Err(IdentityError::InvalidLength {
                expected: FINGERPRINT_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; FINGERPRINT_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse a fingerprint, tolerating a leading `$` and lowercase digits.
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, IdentityError> {
        let trimmed = hex_str.trim().trim_start_matches('$');
        let decoded =
            hex::decode(trimmed).map_err(|err| IdentityError::InvalidHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }

    /// First eight hex digits, for log lines
    pub fn short(&self) -> String {
        hex::encode_upper(&self.0[..4])
    }
}

impl fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterIdentity({})", self.to_hex())
    }
}

impl fmt::Display for RouterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.to_hex())
    }
}

impl From<[u8; FINGERPRINT_LEN]> for RouterIdentity {
    fn from(value: [u8; FINGERPRINT_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for RouterIdentity {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        Self::from_slice(value)
    }
}

impl FromStr for RouterIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for RouterIdentity {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RouterIdentity {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
