//! Characteristic property flags and attribute permissions.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Application-level property mask bits accepted by
/// [`Characteristic::set_properties`](crate::gatt::Characteristic::set_properties).
pub mod mask {
    /// Peers may read the value.
    pub const READ: u32 = 1 << 0;
    /// Peers may write the value with a response.
    pub const WRITE: u32 = 1 << 1;
    /// The value can be notified.
    pub const NOTIFY: u32 = 1 << 2;
    /// The value can be broadcast.
    pub const BROADCAST: u32 = 1 << 3;
    /// The value can be indicated.
    pub const INDICATE: u32 = 1 << 4;
    /// Peers may write the value without a response.
    pub const WRITE_NR: u32 = 1 << 5;
}

/// Characteristic properties as encoded in the characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Properties(u8);

impl Properties {
    /// No properties.
    pub const NONE: Self = Self(0x00);
    /// Broadcast.
    pub const BROADCAST: Self = Self(0x01);
    /// Read.
    pub const READ: Self = Self(0x02);
    /// Write without response.
    pub const WRITE_NR: Self = Self(0x04);
    /// Write with response.
    pub const WRITE: Self = Self(0x08);
    /// Notify.
    pub const NOTIFY: Self = Self(0x10);
    /// Indicate.
    pub const INDICATE: Self = Self(0x20);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::BROADCAST, "broadcast"),
        (Self::READ, "read"),
        (Self::WRITE_NR, "write_nr"),
        (Self::WRITE, "write"),
        (Self::NOTIFY, "notify"),
        (Self::INDICATE, "indicate"),
    ];

    /// Create from raw declaration bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw declaration bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Translate an application property mask (see [`mask`]).
    pub fn from_app_mask(value: u32) -> Self {
        let mut props = Self::NONE;
        props.set(Self::READ, value & mask::READ != 0);
        props.set(Self::WRITE, value & mask::WRITE != 0);
        props.set(Self::NOTIFY, value & mask::NOTIFY != 0);
        props.set(Self::BROADCAST, value & mask::BROADCAST != 0);
        props.set(Self::INDICATE, value & mask::INDICATE != 0);
        props.set(Self::WRITE_NR, value & mask::WRITE_NR != 0);
        props
    }

    /// Check whether every flag in `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set or clear the flags in `other`.
    pub fn set(&mut self, other: Self, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    /// Check if no flag is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Access permissions implied by these properties.
    pub fn permissions(&self) -> Permissions {
        let mut perm = Permissions::NONE;
        if self.contains(Self::READ) {
            perm |= Permissions::READ;
        }
        if self.contains(Self::WRITE) || self.contains(Self::WRITE_NR) {
            perm |= Permissions::WRITE;
        }
        perm
    }
}

impl BitOr for Properties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Properties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Attribute access permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Permissions(u16);

impl Permissions {
    /// No access.
    pub const NONE: Self = Self(0x0000);
    /// Readable.
    pub const READ: Self = Self(0x0001);
    /// Writable.
    pub const WRITE: Self = Self(0x0010);
    /// Readable and writable.
    pub const READ_WRITE: Self = Self(0x0011);

    /// Raw permission bits.
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Check whether every flag in `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_app_mask() {
        let props = Properties::from_app_mask(mask::READ | mask::INDICATE);
        assert_eq!(props, Properties::READ | Properties::INDICATE);
        assert_eq!(props.bits(), 0x22);

        let all = Properties::from_app_mask(0x3F);
        assert_eq!(all.bits(), 0x3F);

        assert!(Properties::from_app_mask(0).is_empty());
    }

    #[test]
    fn test_set_and_clear() {
        let mut props = Properties::READ | Properties::WRITE;
        props.set(Properties::WRITE, false);
        assert_eq!(props, Properties::READ);
        props.set(Properties::NOTIFY, true);
        assert!(props.contains(Properties::NOTIFY));
    }

    #[test]
    fn test_display() {
        assert_eq!(Properties::NONE.to_string(), "none");
        assert_eq!(
            (Properties::READ | Properties::NOTIFY).to_string(),
            "read|notify"
        );
    }

    #[test]
    fn test_permissions() {
        assert_eq!(Properties::READ.permissions(), Permissions::READ);
        assert_eq!(
            (Properties::READ | Properties::WRITE_NR).permissions(),
            Permissions::READ_WRITE
        );
        assert_eq!(Properties::NOTIFY.permissions(), Permissions::NONE);
    }
}
