//! Bluetooth device addresses
//!
//! A `BdAddr` is the stable link-layer identity of a remote peripheral and
//! the key under which its connection worker is registered.

use std::fmt;
use std::str::FromStr;

/// A 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    /// Create an address from raw bytes (as transmitted over the air,
    /// least significant byte first)
    pub fn new(bytes: [u8; 6]) -> Self {
        BdAddr(bytes)
    }

    /// Get the raw address bytes
    pub fn bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Rendered most significant byte first, the usual notation
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

/// Error returned when parsing a badly formed address string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidAddress;

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bluetooth address")
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for BdAddr {
    type Err = InvalidAddress;

    /// Parse the colon-separated notation, e.g. `00:11:22:33:44:55`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;

        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(InvalidAddress);
            }
            let byte = hex::decode(part).map_err(|_| InvalidAddress)?[0];
            bytes[5 - count] = byte;
            count += 1;
        }

        if count != 6 {
            return Err(InvalidAddress);
        }

        Ok(BdAddr(bytes))
    }
}
