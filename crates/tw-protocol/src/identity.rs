//! Thing identity derived from a hardware (MAC) address.
//!
//! The 48-bit address is widened EUI-64 style: the first three octets,
//! the literal `fffe`, then the last three octets. The result doubles as
//! the MQTT client ID and the `UniqueId` registration parameter.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator inserted between the two halves of the hardware address.
const EUI64_FILLER: &str = "fffe";

/// Hex digits in a 48-bit hardware address.
const HARDWARE_ADDRESS_DIGITS: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("hardware address '{0}' must contain exactly 12 hex digits")]
    InvalidLength(String),
    #[error("hardware address '{0}' contains non-hex characters")]
    NotHex(String),
}

/// Stable device identifier derived from a hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(String);

impl UniqueId {
    /// Derive the identity from a hardware address.
    ///
    /// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff` or bare hex. Hex
    /// digits are normalized to upper case; the filler stays lower case.
    pub fn from_hardware_address(address: &str) -> Result<Self, IdentityError> {
        let digits: String = address
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();

        if digits.len() != HARDWARE_ADDRESS_DIGITS {
            return Err(IdentityError::InvalidLength(address.to_string()));
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdentityError::NotHex(address.to_string()));
        }

        let digits = digits.to_ascii_uppercase();
        let (head, tail) = digits.split_at(HARDWARE_ADDRESS_DIGITS / 2);
        Ok(Self(format!("{head}{EUI64_FILLER}{tail}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
