//! Bluetooth attribute UUIDs.
//!
//! Attributes are identified by 16-bit, 32-bit or 128-bit UUIDs. Short forms
//! are aliases inside the Bluetooth base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`, so two UUIDs are equal whenever
//! their 128-bit expansions are equal, regardless of how they were built.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};

/// The Bluetooth base UUID that 16- and 32-bit UUIDs are widened into.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

/// A Bluetooth attribute UUID in one of its three native widths.
#[derive(Debug, Clone, Copy)]
pub enum BleUuid {
    /// 16-bit short form.
    Uuid16(u16),
    /// 32-bit short form.
    Uuid32(u32),
    /// Full 128-bit form.
    Uuid128(Uuid),
}

impl BleUuid {
    /// Create a UUID from its 16-bit short form.
    pub const fn from_u16(value: u16) -> Self {
        Self::Uuid16(value)
    }

    /// Create a UUID from its 32-bit short form.
    pub const fn from_u32(value: u32) -> Self {
        Self::Uuid32(value)
    }

    /// Create a UUID from a full 128-bit value.
    pub const fn from_u128(value: u128) -> Self {
        Self::Uuid128(Uuid::from_u128(value))
    }

    /// Create a UUID from a raw native buffer of 2, 4 or 16 bytes.
    ///
    /// Radio stacks hand UUIDs over least-significant byte first; pass
    /// `msb_first = true` for buffers in display order.
    pub fn from_bytes(data: &[u8], msb_first: bool) -> Result<Self> {
        let mut buf = data.to_vec();
        if !msb_first {
            buf.reverse();
        }

        match buf.len() {
            2 => Ok(Self::Uuid16(u16::from_be_bytes([buf[0], buf[1]]))),
            4 => Ok(Self::Uuid32(u32::from_be_bytes([
                buf[0], buf[1], buf[2], buf[3],
            ]))),
            16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&buf);
                Ok(Self::Uuid128(Uuid::from_bytes(bytes)))
            }
            len => Err(Error::InvalidUuid {
                input: format!("{} raw bytes: {:02X?}", len, data),
            }),
        }
    }

    /// Number of bits in the native representation.
    pub fn bit_size(&self) -> usize {
        match self {
            Self::Uuid16(_) => 16,
            Self::Uuid32(_) => 32,
            Self::Uuid128(_) => 128,
        }
    }

    /// The canonical 128-bit form.
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_u128(self.as_u128())
    }

    /// The canonical 128-bit form as an integer.
    pub fn as_u128(&self) -> u128 {
        match *self {
            Self::Uuid16(v) => BLUETOOTH_BASE_UUID.as_u128() | ((v as u128) << 96),
            Self::Uuid32(v) => BLUETOOTH_BASE_UUID.as_u128() | ((v as u128) << 96),
            Self::Uuid128(u) => u.as_u128(),
        }
    }

    /// Widen to the 128-bit representation.
    pub fn to_128(&self) -> Self {
        Self::Uuid128(self.to_uuid())
    }

    /// The 16-bit short form, if this UUID lies inside the base UUID range.
    pub fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        let base_mask = (1u128 << 96) - 1;
        if value & base_mask != BLUETOOTH_BASE_UUID.as_u128() || value >> 112 != 0 {
            return None;
        }
        Some((value >> 96) as u16)
    }

    /// Native little-endian bytes, as a radio stack expects them.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match *self {
            Self::Uuid16(v) => v.to_le_bytes().to_vec(),
            Self::Uuid32(v) => v.to_le_bytes().to_vec(),
            Self::Uuid128(u) => u.as_u128().to_le_bytes().to_vec(),
        }
    }
}

impl PartialEq for BleUuid {
    fn eq(&self, other: &Self) -> bool {
        self.as_u128() == other.as_u128()
    }
}

impl Eq for BleUuid {}

impl Hash for BleUuid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_u128().hash(state);
    }
}

impl From<u16> for BleUuid {
    fn from(value: u16) -> Self {
        Self::Uuid16(value)
    }
}

impl From<u32> for BleUuid {
    fn from(value: u32) -> Self {
        Self::Uuid32(value)
    }
}

impl From<Uuid> for BleUuid {
    fn from(value: Uuid) -> Self {
        Self::Uuid128(value)
    }
}

impl FromStr for BleUuid {
    type Err = Error;

    /// Parse a 4-digit, 8-digit or full 128-bit UUID string.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        let invalid = || Error::InvalidUuid {
            input: s.to_string(),
        };

        let all_hex = digits.chars().all(|c| c.is_ascii_hexdigit());
        match digits.len() {
            4 | 8 if !all_hex => Err(invalid()),
            4 => u16::from_str_radix(digits, 16)
                .map(Self::Uuid16)
                .map_err(|_| invalid()),
            8 => u32::from_str_radix(digits, 16)
                .map(Self::Uuid32)
                .map_err(|_| invalid()),
            _ => Uuid::parse_str(digits)
                .map(Self::Uuid128)
                .map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid().hyphenated())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for BleUuid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for BleUuid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
