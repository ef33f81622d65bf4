//! Timestamp plumbing.
//!
//! ext2 stores all four inode timestamps as 32-bit seconds since the epoch.
//! The core never reads a wall clock itself; the mount supplies a [`Clock`]
//! and every operation that touches `atime`/`ctime`/`mtime`/`dtime` asks it
//! for the current second.

use bytemuck::{Pod, Zeroable};
use core::fmt;

/// Seconds since the Unix epoch, as wide as an ext2 inode timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct UnixTimestamp(pub u32);

impl fmt::Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for UnixTimestamp {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Source of the current time for inode timestamps.
pub trait Clock: Send + Sync {
    /// Current time, truncated to the second.
    fn now(&self) -> UnixTimestamp;
}

/// A clock pinned to a fixed instant. Formatting tools and tests use this to
/// produce reproducible images.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedClock(pub UnixTimestamp);

impl Clock for FixedClock {
    fn now(&self) -> UnixTimestamp {
        self.0
    }
}
