//! Error surface of the filesystem core.
//!
//! Every fallible operation returns one of the kinds below; allocator and
//! block-map failures are surfaced to the caller unchanged, and corruption is
//! additionally routed through the mount's errors policy.

use core::fmt;

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Result alias used throughout the crate.
pub type Ext2Result<T> = Result<T, Error>;

/// Error kinds surfaced by the core, mirroring the POSIX errno each maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Name lookup or inode number has no entry (`ENOENT`).
    NotFound,

    /// Duplicate name on create, link or rename (`EEXIST`).
    Exists,

    /// Bitmap exhausted, or the reserved-blocks policy refused the caller
    /// (`ENOSPC`).
    NoSpace,

    /// Logical block index beyond triple-indirect capacity, or file size
    /// beyond the per-volume maximum (`EFBIG`).
    TooBig,

    /// Underlying device read/write failed, or a buffer was not up to date
    /// after submission (`EIO`).
    Io,

    /// On-disk structure failed validation: bad magic or revision, zero
    /// directory record length, descriptor outside its group, allocation in
    /// a system zone (`EUCLEAN`).
    Corrupted,

    /// An indirect chain changed under a lock-free walk; the caller
    /// re-drives the operation (`EAGAIN`).
    Again,

    /// `rmdir` on a directory that still has live entries (`ENOTEMPTY`).
    NotEmpty,

    /// Mutation of an immutable or append-only inode (`EPERM`).
    NotPermitted,

    /// Malformed input: inode zero, over-long name, size change on a fast
    /// symlink (`EINVAL`).
    Invalid,

    /// The volume is (or became, per `errors=remount-ro`) read-only
    /// (`EROFS`).
    ReadOnly,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "no such file or directory",
            Error::Exists => "file exists",
            Error::NoSpace => "no space left on device",
            Error::TooBig => "file too large",
            Error::Io => "input/output error",
            Error::Corrupted => "structure needs cleaning",
            Error::Again => "resource temporarily unavailable",
            Error::NotEmpty => "directory not empty",
            Error::NotPermitted => "operation not permitted",
            Error::Invalid => "invalid argument",
            Error::ReadOnly => "read-only file system",
        };

        f.write_str(msg)
    }
}
