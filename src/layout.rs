//! On-disk integer representation.
//!
//! Every integer stored on an ext2 volume is little-endian. The [`Le16`] and
//! [`Le32`] wrappers keep the disk byte order at the type level so that raw
//! on-disk fields never leak into host arithmetic without an explicit
//! conversion through [`Le16::get`] / [`Le32::get`].

use bytemuck::{Pod, Zeroable};

/// A little-endian `u16` as stored on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Le16(u16);

impl Le16 {
    pub const fn new(value: u16) -> Self {
        Self(value.to_le())
    }

    /// Host-endian value of the field.
    pub const fn get(self) -> u16 {
        u16::from_le(self.0)
    }

    pub fn set(&mut self, value: u16) {
        self.0 = value.to_le();
    }
}

impl From<u16> for Le16 {
    fn from(value: u16) -> Self {
        Self::new(value)
    }
}

impl From<Le16> for u16 {
    fn from(value: Le16) -> Self {
        value.get()
    }
}

/// A little-endian `u32` as stored on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Le32(u32);

impl Le32 {
    pub const fn new(value: u32) -> Self {
        Self(value.to_le())
    }

    /// Host-endian value of the field.
    pub const fn get(self) -> u32 {
        u32::from_le(self.0)
    }

    pub fn set(&mut self, value: u32) {
        self.0 = value.to_le();
    }
}

impl From<u32> for Le32 {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Le32> for u32 {
    fn from(value: Le32) -> Self {
        value.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le32_round_trip() {
        let mut v = Le32::new(0xef53_1234);
        assert_eq!(v.get(), 0xef53_1234);
        v.set(7);
        assert_eq!(v.get(), 7);
        assert_eq!(bytemuck::bytes_of(&Le32::new(0x0102_0304)), &[4, 3, 2, 1]);
    }

    #[test]
    fn le16_byte_order() {
        assert_eq!(bytemuck::bytes_of(&Le16::new(0xef53)), &[0x53, 0xef]);
    }
}
