//! Canonical Bluetooth device address.

use crate::error::EngineError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 48-bit device address, displayed as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Parse `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff` or 12 bare hex digits.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let digits: Vec<u8> = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .map(|c| {
                c.to_digit(16)
                    .map(|d| d as u8)
                    .ok_or_else(|| EngineError::InvalidAddress(s.to_string()))
            })
            .collect::<Result<_, _>>()?;

        if digits.len() != 12 {
            return Err(EngineError::InvalidAddress(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, pair) in digits.chunks_exact(2).enumerate() {
            bytes[i] = (pair[0] << 4) | pair[1];
        }
        Ok(Self(bytes))
    }

    /// Build from the low 48 bits of a platform address (WinRT uses `u64`).
    pub fn from_u64(raw: u64) -> Self {
        let be = raw.to_be_bytes();
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&be[2..8]);
        Self(bytes)
    }

    pub fn to_u64(&self) -> u64 {
        let mut be = [0u8; 8];
        be[2..8].copy_from_slice(&self.0);
        u64::from_be_bytes(be)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Address as 12 hex nibbles, most significant first. Used for OUI matching.
    pub fn nibbles(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        for (i, b) in self.0.iter().enumerate() {
            out[i * 2] = b >> 4;
            out[i * 2 + 1] = b & 0x0F;
        }
        out
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
