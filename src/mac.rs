use anyhow::{Context, Result, bail};
use std::fmt;
use std::str::FromStr;

/// 48-bit hardware address used as the routing key.
///
/// Equality and hashing cover all six bytes, so the same address read from a
/// kernel attribute or from a client attribute lands on the same index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const LEN: usize = 6;

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Builds an address from an attribute payload. Anything but exactly six
    /// bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            bail!("invalid MAC format: {s}");
        }
        let mut mac = [0u8; 6];
        for (i, p) in parts.iter().enumerate() {
            if p.len() != 2 || !p.bytes().all(|b| b.is_ascii_hexdigit()) {
                bail!("invalid MAC octet: {p}");
            }
            mac[i] =
                u8::from_str_radix(p, 16).with_context(|| format!("invalid MAC octet: {p}"))?;
        }
        Ok(Self(mac))
    }
}
