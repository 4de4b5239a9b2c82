//! 128-bit opaque identifiers.
//!
//! Uuids address sessions, protocol objects, and assets. The canonical text
//! form is 32 lowercase hex characters (high half, then low half, no
//! separators) and doubles as the cache filename for an asset. The canonical
//! binary form is 16 bytes with each half big-endian.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 128-bit identifier stored as two 64-bit halves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid {
    hi: u64,
    lo: u64,
}

impl Uuid {
    /// The all-zero identifier. Each peer hosts its root object here.
    pub const NIL: Uuid = Uuid { hi: 0, lo: 0 };

    pub const fn from_halves(hi: u64, lo: u64) -> Self {
        Uuid { hi, lo }
    }

    pub const fn halves(&self) -> (u64, u64) {
        (self.hi, self.lo)
    }

    /// Generates a fresh identifier from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Decodes the canonical 16-byte wire form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..]);
        Uuid {
            hi: u64::from_be_bytes(hi),
            lo: u64::from_be_bytes(lo),
        }
    }

    /// Encodes the canonical 16-byte wire form.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.hi.to_be_bytes());
        bytes[8..].copy_from_slice(&self.lo.to_be_bytes());
        bytes
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({self})")
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(UuidParseError::InvalidLength);
        }
        // `from_str_radix` tolerates a leading sign; only bare hex digits
        // form a canonical identifier.
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(UuidParseError::InvalidDigit);
        }
        let hi = u64::from_str_radix(&s[..16], 16).map_err(|_| UuidParseError::InvalidDigit)?;
        let lo = u64::from_str_radix(&s[16..], 16).map_err(|_| UuidParseError::InvalidDigit)?;
        Ok(Uuid { hi, lo })
    }
}

impl Serialize for Uuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Error type for Uuid parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidParseError {
    InvalidLength,
    InvalidDigit,
}

impl fmt::Display for UuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UuidParseError::InvalidLength => write!(f, "identifier must be 32 hex characters"),
            UuidParseError::InvalidDigit => write!(f, "identifier contains a non-hex character"),
        }
    }
}

impl std::error::Error for UuidParseError {}
