//! LoRaWAN network identifiers.
//!
//! NetID and DevAddr layouts follow the LoRaWAN Backend Interfaces: the
//! NetID type (3 MSB) determines how many bits of the NetID form the NwkID,
//! and a DevAddr starts with a type prefix followed by that NwkID.

use std::fmt;
use std::str::FromStr;

/// Errors parsing identifiers from configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("invalid hex `{0}`")]
    Hex(String),

    #[error("NetID `{0:06X}` exceeds 24 bits")]
    NetIdRange(u32),

    #[error("DevAddr prefix length {0} exceeds 32")]
    PrefixLength(u32),

    #[error("DevAddr prefix `{0}` is not of the form `ADDR/LENGTH`")]
    PrefixFormat(String),
}

/// 24-bit LoRaWAN network identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetId(u32);

impl NetId {
    /// Create a NetID from its numeric value.
    pub fn new(value: u32) -> Result<Self, IdentifierError> {
        if value > 0xFF_FFFF {
            return Err(IdentifierError::NetIdRange(value));
        }
        Ok(Self(value))
    }

    /// Numeric representation used on the broker wire.
    pub fn to_number(self) -> u32 {
        self.0
    }

    /// NetID type (0-7).
    pub fn net_type(self) -> u8 {
        (self.0 >> 21) as u8
    }

    /// Number of NwkID bits for this NetID type.
    pub fn id_bits(self) -> u32 {
        match self.net_type() {
            0 | 1 => 6,
            2 => 9,
            3 => 10,
            4 => 11,
            5 => 13,
            6 => 15,
            _ => 17,
        }
    }

    /// NwkID: the `id_bits` least significant bits of the NetID.
    pub fn nwk_id(self) -> u32 {
        self.0 & ((1 << self.id_bits()) - 1)
    }

    /// DevAddr prefix covering every address assigned under this NetID.
    pub fn dev_addr_prefix(self) -> DevAddrPrefix {
        let t = u32::from(self.net_type());
        let type_bits = t + 1;
        let type_prefix = ((1u32 << type_bits) - 2) << (32 - type_bits);
        let id_bits = self.id_bits();
        let nwk_id = self.nwk_id() << (32 - type_bits - id_bits);
        DevAddrPrefix {
            dev_addr: DevAddr(type_prefix | nwk_id),
            length: (type_bits + id_bits) as u8,
        }
    }
}

impl FromStr for NetId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = u32::from_str_radix(s.trim(), 16)
            .map_err(|_| IdentifierError::Hex(s.to_string()))?;
        if s.trim().len() > 6 {
            return Err(IdentifierError::NetIdRange(value));
        }
        Self::new(value)
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}", self.0)
    }
}

/// 32-bit device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevAddr(pub u32);

impl DevAddr {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// DevAddr prefix: the `length` most significant bits of `dev_addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevAddrPrefix {
    pub dev_addr: DevAddr,
    pub length: u8,
}

impl DevAddrPrefix {
    pub fn new(dev_addr: u32, length: u8) -> Result<Self, IdentifierError> {
        if length > 32 {
            return Err(IdentifierError::PrefixLength(u32::from(length)));
        }
        Ok(Self {
            dev_addr: DevAddr(dev_addr),
            length,
        })
    }

    #[cfg(test)]
    fn mask(&self) -> u32 {
        match self.length {
            0 => 0,
            l => u32::MAX << (32 - u32::from(l)),
        }
    }

    #[cfg(test)]
    pub fn matches(&self, addr: DevAddr) -> bool {
        let mask = self.mask();
        addr.0 & mask == self.dev_addr.0 & mask
    }
}

impl FromStr for DevAddrPrefix {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, length) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| IdentifierError::PrefixFormat(s.to_string()))?;
        let addr =
            u32::from_str_radix(addr, 16).map_err(|_| IdentifierError::Hex(addr.to_string()))?;
        let length: u32 = length
            .parse()
            .map_err(|_| IdentifierError::PrefixFormat(s.to_string()))?;
        if length > 32 {
            return Err(IdentifierError::PrefixLength(length));
        }
        Self::new(addr, length as u8)
    }
}

impl fmt::Display for DevAddrPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dev_addr, self.length)
    }
}

/// 64-bit extended unique identifier (JoinEUI, DevEUI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Eui64(pub u64);

impl Eui64 {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}
