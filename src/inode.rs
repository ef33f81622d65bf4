//! Inode records and the in-memory inode.
//!
//! The on-disk record is 128 bytes (larger `s_inode_size` leaves the tail
//! zero and ignored here). The in-memory [`Inode`] splits its state across
//! the locks the operation paths need: scalar fields behind one rwlock, the
//! `i_block` array behind the metadata lock that chain walks snapshot, a
//! truncate mutex serializing growth against truncation, and the
//! block-allocator reservation state.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use spin::{Mutex, RwLock};

use crate::balloc::BlockAllocInfo;
use crate::error::{CanFail, Error, Ext2Result};
use crate::fs::Ext2Fs;
use crate::layout::{Le16, Le32};
use crate::time::UnixTimestamp;

/// Number of direct block slots in `i_block`.
pub const DIRECT_BLOCKS: usize = 12;
/// Slot index of the single-indirect block.
pub const IND_BLOCK: usize = 12;
/// Slot index of the double-indirect block.
pub const DIND_BLOCK: usize = 13;
/// Slot index of the triple-indirect block.
pub const TIND_BLOCK: usize = 14;
/// Total `i_block` slots.
pub const N_BLOCKS: usize = 15;

/// A symlink target of at most this many bytes lives inline in `i_block`.
pub const SYMLINK_INLINE_MAX: usize = N_BLOCKS * 4;

/// Upper bound on the number of 512-byte sectors `i_blocks` can count.
const MAX_I_BLOCKS: u64 = u32::MAX as u64;

// `i_mode` type bits.
pub const S_IFMT: u16 = 0xf000;
pub const S_IFSOCK: u16 = 0xc000;
pub const S_IFLNK: u16 = 0xa000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

// `i_mode` permission bits the allocator cares about.
pub const S_ISUID: u16 = 0o4000;
pub const S_ISGID: u16 = 0o2000;

/// A number naming an inode. Inode numbers start at 1; zero marks a deleted
/// directory entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNo(pub u32);

impl InodeNo {
    /// Inode 1 holds the bad-blocks list.
    pub const BAD_BLOCKS: Self = Self(1);

    /// Inode 2 is the root directory.
    pub const ROOT: Self = Self(2);
}

impl core::fmt::Display for InodeNo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File type carried by `i_mode` and by directory records when the
/// `FILETYPE` feature is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl FileType {
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFCHR => Some(Self::CharDevice),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    pub fn to_mode_bits(self) -> u16 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
            Self::Symlink => S_IFLNK,
        }
    }
}

bitflags! {
    /// `i_flags` values.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InodeFlags: u32 {
        const SECRM = 0x0000_0001;
        const UNRM = 0x0000_0002;
        const COMPR = 0x0000_0004;
        const SYNC = 0x0000_0008;
        const IMMUTABLE = 0x0000_0010;
        const APPEND = 0x0000_0020;
        const NODUMP = 0x0000_0040;
        const NOATIME = 0x0000_0080;
        const DIRTY = 0x0000_0100;
        const COMPRBLK = 0x0000_0200;
        const NOCOMPR = 0x0000_0400;
        const ECOMPR = 0x0000_0800;
        const BTREE = 0x0000_1000;
        const IMAGIC = 0x0000_2000;
        const JOURNAL_DATA = 0x0000_4000;
        const NOTAIL = 0x0000_8000;
        const DIRSYNC = 0x0001_0000;
        const TOPDIR = 0x0002_0000;
    }
}

impl InodeFlags {
    /// Flags a regular file may inherit from its parent directory.
    pub const REG_MASK: Self = Self::all()
        .difference(Self::DIRSYNC)
        .difference(Self::TOPDIR);

    /// Flags a non-regular, non-directory inode may inherit.
    pub const OTHER_MASK: Self = Self::NODUMP.union(Self::NOATIME);

    /// Masks inherited flags by the new inode's type: directories take
    /// everything, regular files everything but the directory-only bits,
    /// everything else the strict subset.
    pub fn masked_for(self, mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => self,
            S_IFREG => self & Self::REG_MASK,
            _ => self & Self::OTHER_MASK,
        }
    }
}

/// The on-disk inode record (Linux osd2 flavour).
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RawInode {
    /// Type and permissions.
    pub i_mode: Le16,
    /// Low 16 bits of the owner uid.
    pub i_uid: Le16,
    /// Low 32 bits of the size; the high half of a regular file's size
    /// aliases `i_dir_acl`.
    pub i_size: Le32,
    pub i_atime: Le32,
    pub i_ctime: Le32,
    pub i_mtime: Le32,
    /// Deletion time; zero for live inodes.
    pub i_dtime: Le32,
    /// Low 16 bits of the group id.
    pub i_gid: Le16,
    pub i_links_count: Le16,
    /// Allocated storage in 512-byte units, indirect blocks included.
    pub i_blocks: Le32,
    pub i_flags: Le32,
    i_osd1: Le32,
    /// 12 direct slots, then single, double and triple indirect.
    pub i_block: [Le32; N_BLOCKS],
    pub i_generation: Le32,
    /// Extended-attribute block.
    pub i_file_acl: Le32,
    /// Directory ACL slot, aliased by the high size half of regular files.
    pub i_dir_acl: Le32,
    i_faddr: Le32,
    i_frag: u8,
    i_fsize: u8,
    i_pad: Le16,
    /// High 16 bits of the owner uid.
    pub i_uid_high: Le16,
    /// High 16 bits of the group id.
    pub i_gid_high: Le16,
    i_reserved2: Le32,
}

/// Scalar inode state, host endian, behind the inode's state lock.
#[derive(Clone, Debug, Default)]
pub struct InodeState {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: UnixTimestamp,
    pub ctime: UnixTimestamp,
    pub mtime: UnixTimestamp,
    pub dtime: UnixTimestamp,
    pub links_count: u16,
    /// 512-byte sectors backing the inode, metadata blocks included.
    pub blocks_512: u32,
    pub flags: InodeFlags,
    pub generation: u32,
    pub file_acl: u32,
}

impl InodeState {
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// An inode held in memory.
pub struct Inode {
    pub ino: InodeNo,
    /// Group the inode record lives in; allocation goals start here.
    pub block_group: u32,
    state: RwLock<InodeState>,
    /// Host mirror of `i_block`; the metadata lock chain walks snapshot.
    blocks: RwLock<[u32; N_BLOCKS]>,
    /// Serializes creating block mappings against truncation.
    truncate_lock: Mutex<()>,
    /// Reservation-window state, owned here, indexed by the global tree.
    pub(crate) alloc: Mutex<Option<BlockAllocInfo>>,
    dirty: AtomicBool,
    /// Set on a freshly allocated inode whose disk slot still holds stale
    /// bytes; the first write-back zeroes the whole record first.
    new: AtomicBool,
    /// Directory-scan hint: logical block where the last lookup hit.
    dir_start_lookup: AtomicU32,
}

impl Inode {
    pub(crate) fn from_parts(
        ino: InodeNo,
        block_group: u32,
        state: InodeState,
        blocks: [u32; N_BLOCKS],
        new: bool,
    ) -> Self {
        Self {
            ino,
            block_group,
            state: RwLock::new(state),
            blocks: RwLock::new(blocks),
            truncate_lock: Mutex::new(()),
            alloc: Mutex::new(None),
            dirty: AtomicBool::new(false),
            new: AtomicBool::new(new),
            dir_start_lookup: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> spin::RwLockReadGuard<'_, InodeState> {
        self.state.read()
    }

    pub fn state_mut(&self) -> spin::RwLockWriteGuard<'_, InodeState> {
        self.state.write()
    }

    /// Metadata read lock over the `i_block` mirror.
    pub fn blocks(&self) -> spin::RwLockReadGuard<'_, [u32; N_BLOCKS]> {
        self.blocks.read()
    }

    /// Metadata write lock over the `i_block` mirror.
    pub fn blocks_mut(&self) -> spin::RwLockWriteGuard<'_, [u32; N_BLOCKS]> {
        self.blocks.write()
    }

    /// The truncate mutex; `get_blocks(create)` and `truncate_blocks` hold
    /// it for their whole critical section.
    pub fn truncate_lock(&self) -> spin::MutexGuard<'_, ()> {
        self.truncate_lock.lock()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_new(&self) -> bool {
        self.new.load(Ordering::Acquire)
    }

    pub fn dir_lookup_hint(&self) -> u32 {
        self.dir_start_lookup.load(Ordering::Relaxed)
    }

    pub fn set_dir_lookup_hint(&self, blk: u32) {
        self.dir_start_lookup.store(blk, Ordering::Relaxed);
    }

    /// A symlink whose target lives inline in `i_block`: no data blocks
    /// beyond a possible xattr block.
    pub fn is_fast_symlink(&self, fs: &Ext2Fs) -> bool {
        let state = self.state();
        if !state.is_symlink() {
            return false;
        }
        let ea_blocks = if state.file_acl != 0 {
            fs.sb.block_size / 512
        } else {
            0
        };
        state.blocks_512 == ea_blocks
    }

    /// Refuses writes to immutable or append-only inodes.
    pub fn check_mutable(&self) -> CanFail<Error> {
        let flags = self.state().flags;
        if flags.intersects(InodeFlags::IMMUTABLE | InodeFlags::APPEND) {
            return Err(Error::NotPermitted);
        }
        Ok(())
    }
}

/// Where inode `ino`'s record lives: `(group, table block index, byte
/// offset in block)`.
fn locate(fs: &Ext2Fs, ino: InodeNo) -> Ext2Result<(u32, u32, usize)> {
    if ino.0 == 0 || ino.0 > fs.sb.inodes_count {
        return Err(Error::Invalid);
    }
    let index = ino.0 - 1;
    let group = index / fs.sb.inodes_per_group;
    let index_in_group = index % fs.sb.inodes_per_group;
    let byte = u64::from(index_in_group) * u64::from(fs.sb.inode_size);
    let block_in_table = (byte >> fs.sb.block_size_bits) as u32;
    let offset = (byte & u64::from(fs.sb.block_size - 1)) as usize;
    Ok((group, block_in_table, offset))
}

/// Reads inode `ino` from its table and builds the in-memory mirror.
pub fn read_inode(fs: &Ext2Fs, ino: InodeNo) -> Ext2Result<Inode> {
    if ino.0 != InodeNo::ROOT.0 && ino.0 < fs.sb.first_ino {
        return Err(Error::Invalid);
    }
    let (group, block_in_table, offset) = locate(fs, ino)?;
    let table = fs.groups.read(group).bg_inode_table.get();
    let buf = fs.cache.get(table + block_in_table)?;
    let raw: RawInode = {
        let data = buf.data();
        bytemuck::pod_read_unaligned(&data[offset..offset + core::mem::size_of::<RawInode>()])
    };

    let mode = raw.i_mode.get();
    let links_count = raw.i_links_count.get();
    let dtime = raw.i_dtime.get();
    if links_count == 0 && (mode == 0 || dtime != 0) {
        // A freed inode reached through a stale reference.
        return Err(Error::NotFound);
    }

    let (uid, gid) = if fs.sb.opts.nouid32 {
        (u32::from(raw.i_uid.get()), u32::from(raw.i_gid.get()))
    } else {
        (
            u32::from(raw.i_uid.get()) | u32::from(raw.i_uid_high.get()) << 16,
            u32::from(raw.i_gid.get()) | u32::from(raw.i_gid_high.get()) << 16,
        )
    };

    let mut size = u64::from(raw.i_size.get());
    if mode & S_IFMT == S_IFREG {
        size |= u64::from(raw.i_dir_acl.get()) << 32;
    }

    let mut blocks = [0u32; N_BLOCKS];
    for (slot, raw_slot) in blocks.iter_mut().zip(raw.i_block.iter()) {
        *slot = raw_slot.get();
    }

    let state = InodeState {
        mode,
        uid,
        gid,
        size,
        atime: UnixTimestamp(raw.i_atime.get()),
        ctime: UnixTimestamp(raw.i_ctime.get()),
        mtime: UnixTimestamp(raw.i_mtime.get()),
        dtime: UnixTimestamp(dtime),
        links_count,
        blocks_512: raw.i_blocks.get(),
        flags: InodeFlags::from_bits_retain(raw.i_flags.get()),
        generation: raw.i_generation.get(),
        file_acl: raw.i_file_acl.get(),
    };

    Ok(Inode::from_parts(ino, group, state, blocks, false))
}

/// Marshals the inode back to its table slot. A NEW inode zeroes the whole
/// record first so a wider-than-128-byte slot carries no stale tail. When
/// `sync`, the table buffer is flushed before returning.
pub fn write_inode(fs: &Ext2Fs, inode: &Inode, sync: bool) -> CanFail<Error> {
    let (_, block_in_table, offset) = locate(fs, inode.ino)?;
    let table = fs.groups.read(inode.block_group).bg_inode_table.get();
    let buf = fs.cache.get(table + block_in_table)?;

    let mut raw = RawInode::zeroed();
    {
        let state = inode.state();
        let blocks = inode.blocks();

        raw.i_mode.set(state.mode);
        raw.i_uid.set(state.uid as u16);
        raw.i_gid.set(state.gid as u16);
        if !fs.sb.opts.nouid32 {
            if state.dtime.0 != 0 {
                // Dead inode: zero the high halves so the ids can be
                // recycled by older tooling.
                raw.i_uid_high.set(0);
                raw.i_gid_high.set(0);
            } else {
                raw.i_uid_high.set((state.uid >> 16) as u16);
                raw.i_gid_high.set((state.gid >> 16) as u16);
            }
        }
        raw.i_size.set(state.size as u32);
        if state.is_reg() {
            let high = (state.size >> 32) as u32;
            raw.i_dir_acl.set(high);
            if state.size > i32::MAX as u64 {
                fs.sb.ensure_large_file();
            }
        }
        raw.i_atime.set(state.atime.0);
        raw.i_ctime.set(state.ctime.0);
        raw.i_mtime.set(state.mtime.0);
        raw.i_dtime.set(state.dtime.0);
        raw.i_links_count.set(state.links_count);
        raw.i_blocks.set(state.blocks_512);
        raw.i_flags.set(state.flags.bits());
        raw.i_generation.set(state.generation);
        raw.i_file_acl.set(state.file_acl);
        for (raw_slot, slot) in raw.i_block.iter_mut().zip(blocks.iter()) {
            raw_slot.set(*slot);
        }
    }

    {
        let mut data = buf.data_mut();
        if inode.is_new() {
            data[offset..offset + fs.sb.inode_size as usize].fill(0);
            inode.new.store(false, Ordering::Release);
        }
        data[offset..offset + core::mem::size_of::<RawInode>()]
            .copy_from_slice(bytemuck::bytes_of(&raw));
    }
    buf.mark_dirty();
    if sync {
        fs.cache.sync_one(&buf)?;
        if !buf.is_uptodate() {
            return Err(Error::Io);
        }
    } else {
        fs.cache.flush_if_sync(&buf)?;
    }
    inode.dirty.store(false, Ordering::Release);
    Ok(())
}

/// Largest byte size a file may reach: the triple-indirect addressing limit
/// clipped by what the 32-bit, 512-byte-unit `i_blocks` field can account.
pub fn max_file_size(block_size: u32) -> u64 {
    let bs = u64::from(block_size);
    let per = bs / 4;
    let addressable = (DIRECT_BLOCKS as u64 + per + per * per + per * per * per) * bs;
    let blocks_limit = MAX_I_BLOCKS * 512;
    addressable.min(blocks_limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_inode_is_128_bytes() {
        assert_eq!(core::mem::size_of::<RawInode>(), 128);
    }

    #[test]
    fn flag_inheritance_masks() {
        let parent = InodeFlags::SYNC | InodeFlags::DIRSYNC | InodeFlags::NOATIME;
        assert_eq!(parent.masked_for(S_IFDIR), parent);
        assert_eq!(
            parent.masked_for(S_IFREG),
            InodeFlags::SYNC | InodeFlags::NOATIME
        );
        assert_eq!(parent.masked_for(S_IFLNK), InodeFlags::NOATIME);
    }

    #[test]
    fn file_type_mode_round_trip() {
        for ft in [
            FileType::Regular,
            FileType::Directory,
            FileType::CharDevice,
            FileType::BlockDevice,
            FileType::Fifo,
            FileType::Socket,
            FileType::Symlink,
        ] {
            assert_eq!(FileType::from_mode(ft.to_mode_bits() | 0o644), Some(ft));
        }
        assert_eq!(FileType::from_mode(0o644), None);
    }

    #[test]
    fn max_size_tracks_block_size() {
        // 1 KiB blocks: 12 + 256 + 256^2 + 256^3 addressable blocks.
        let expect = (12u64 + 256 + 65536 + 16_777_216) * 1024;
        assert_eq!(max_file_size(1024), expect);
        // 4 KiB blocks hit the i_blocks sector-count cap instead.
        assert_eq!(max_file_size(4096), MAX_I_BLOCKS * 512);
    }

    #[test]
    fn immutable_refuses_mutation() {
        let mut state = InodeState::default();
        state.mode = S_IFREG | 0o644;
        state.flags = InodeFlags::IMMUTABLE;
        let inode = Inode::from_parts(InodeNo(12), 0, state, [0; N_BLOCKS], false);
        assert_eq!(inode.check_mutable(), Err(Error::NotPermitted));
    }
}
