//! An ext2-compatible block filesystem core.
//!
//! This crate translates a POSIX file/directory/symlink workload into
//! bit-exact ext2 on-disk structures and back: little-endian superblock,
//! group descriptors, inode tables and bitmaps, the direct/indirect block
//! map, and packed variable-length directory records.
//!
//! The host supplies two things: a [`device::BlockDevice`] and a
//! [`time::Clock`]. Everything else — the buffered-block cache, the block
//! and inode allocators with their reservation windows, the directory
//! engine and the mount state — lives here. VFS dispatch, the generic page
//! cache, extended attributes and quota accounting are the host's business;
//! this core exposes the operations they call into.
//!
//! ```ignore
//! let dev: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(8 << 20));
//! mkfs::format(&dev, &FormatOptions::default())?;
//! let fs = Ext2Fs::mount(dev, MountOptions::default(), clock)?;
//! let root = fs.root()?;
//! let dir = fs.mkdir(&root, b"a", 0o755, Cred::ROOT)?;
//! let file = fs.create(&dir, b"f", S_IFREG | 0o644, Cred::ROOT)?;
//! fs.write(&file, 0, b"hello", Cred::ROOT)?;
//! fs.unmount()?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod balloc;
pub mod bitmap;
pub mod blkmap;
pub mod block_grp;
pub mod device;
pub mod dir;
pub mod error;
pub mod file;
pub mod fs;
pub mod ialloc;
pub mod inode;
pub mod layout;
pub mod mkfs;
pub mod sb;
pub mod time;

pub use device::{BlockDevice, MemDisk};
pub use error::{CanFail, Error, Ext2Result};
pub use fs::{Cred, Ext2Fs, FsStat};
pub use inode::{FileType, Inode, InodeNo};
pub use mkfs::FormatOptions;
pub use sb::{ErrorsPolicy, MountOptions};
pub use time::{Clock, FixedClock, UnixTimestamp};
