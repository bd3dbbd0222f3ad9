//! Key and pointer types shared by every layout.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Block position used as the key of every circuit table.
///
/// Layout (12 bytes, matches the host's `BlockPos`):
/// ```text
/// offset  field  size
/// ------  -----  ----
///  0      x      4
///  4      y      4
///  8      z      4
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 3]", into = "[i32; 3]")]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

const _: () = assert!(std::mem::size_of::<Coordinate>() == 12);

impl Coordinate {
    pub const SIZE: usize = 12;

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Decode from the little-endian in-memory representation.
    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let field = |i: usize| {
            i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        Self {
            x: field(0),
            y: field(4),
            z: field(8),
        }
    }

    pub fn to_le_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.z.to_le_bytes());
        out
    }
}

impl From<[i32; 3]> for Coordinate {
    fn from([x, y, z]: [i32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<Coordinate> for [i32; 3] {
    fn from(c: Coordinate) -> Self {
        [c.x, c.y, c.z]
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// An address in the foreign (host-owned) address space.
///
/// Never dereferenced directly; all access goes through a memory accessor
/// that can reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u64);

impl Address {
    pub const NULL: Address = Address(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `offset` bytes past `self`, or `None` on overflow.
    #[inline]
    pub fn checked_add(self, offset: u64) -> Option<Address> {
        self.0.checked_add(offset).map(Address)
    }

    /// Wrapping add, for offsets taken from a validated contract.
    #[inline]
    pub const fn add(self, offset: u64) -> Address {
        Address(self.0.wrapping_add(offset))
    }

    /// Byte distance from `base` to `self`, if `self >= base`.
    #[inline]
    pub fn distance_from(self, base: Address) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        align == 0 || self.0 % align == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque handle to a host-owned circuit component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentRef(pub Address);

impl ComponentRef {
    pub const NONE: ComponentRef = ComponentRef(Address::NULL);

    #[inline]
    pub const fn address(self) -> Address {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component@{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_bytes_match_repr_c() {
        let c = Coordinate::new(-1, 64, i32::MAX);
        let bytes = c.to_le_bytes();
        assert_eq!(&bytes[0..4], &(-1i32).to_le_bytes());
        assert_eq!(Coordinate::from_le_bytes(bytes), c);
    }

    #[test]
    fn test_coordinate_equality_is_exact() {
        assert_ne!(Coordinate::new(1, 0, 0), Coordinate::new(0, 1, 0));
        assert_ne!(Coordinate::new(0, 0, 1), Coordinate::new(0, 0, -1));
    }

    #[test]
    fn test_coordinate_serde_as_triple() {
        #[derive(Serialize, Deserialize)]
        struct Wrap {
            pos: Coordinate,
        }
        let parsed: Wrap = toml::from_str("pos = [3, -4, 5]").unwrap();
        assert_eq!(parsed.pos, Coordinate::new(3, -4, 5));
    }

    #[test]
    fn test_address_arithmetic() {
        let a = Address::new(0x1000);
        assert_eq!(a.add(0x20), Address::new(0x1020));
        assert_eq!(Address::new(0x1020).distance_from(a), Some(0x20));
        assert_eq!(a.distance_from(Address::new(0x2000)), None);
        assert_eq!(Address::new(u64::MAX).checked_add(1), None);
        assert!(Address::new(0x1008).is_aligned(8));
        assert!(!Address::new(0x1004).is_aligned(8));
        assert_eq!(a.to_string(), "0x1000");
    }
}
