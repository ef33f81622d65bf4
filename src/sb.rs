//! Superblock structures and the in-memory mount state.
//!
//! The superblock lives at byte offset 1024 of the volume, is 1024 bytes
//! long, and describes the whole filesystem geometry. It is read once at
//! mount, mirrored in memory ([`SuperState`]), and written back on sync and
//! unmount. Free-space counters are aggregated from the group descriptors at
//! mount and kept as plain atomics afterwards.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use log::{error, warn};
use spin::RwLock;

use crate::device::BlockDevice;
use crate::error::{CanFail, Error, Ext2Result};
use crate::layout::{Le16, Le32};

/// The ext2 signature, at byte offset 56 of the superblock.
pub const EXT2_MAGIC: u16 = 0xef53;

/// Byte offset of the superblock from the start of the volume.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Size of the on-disk superblock record.
pub const SUPERBLOCK_SIZE: usize = 1024;

/// `s_state`: the filesystem was unmounted cleanly.
pub const STATE_VALID_FS: u16 = 1;
/// `s_state`: the filesystem carries errors.
pub const STATE_ERROR_FS: u16 = 2;

/// `s_rev_level`: original revision, fixed inode size and first inode.
pub const REV_GOOD_OLD: u32 = 0;
/// `s_rev_level`: dynamic revision, variable inode size, feature flags.
pub const REV_DYNAMIC: u32 = 1;

/// First non-reserved inode number of a revision-0 volume.
pub const GOOD_OLD_FIRST_INO: u32 = 11;
/// Inode record size of a revision-0 volume.
pub const GOOD_OLD_INODE_SIZE: u16 = 128;

bitflags! {
    /// `s_feature_compat`: features the implementation may ignore.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CompatFeatures: u32 {
        const DIR_PREALLOC = 0x0001;
        const IMAGIC_INODES = 0x0002;
        const HAS_JOURNAL = 0x0004;
        const EXT_ATTR = 0x0008;
        const RESIZE_INODE = 0x0010;
        const DIR_INDEX = 0x0020;
    }
}

bitflags! {
    /// `s_feature_incompat`: features the implementation must understand to
    /// mount at all.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE = 0x0002;
        const RECOVER = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG = 0x0010;
    }
}

bitflags! {
    /// `s_feature_ro_compat`: features the implementation must understand to
    /// mount read-write.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RoCompatFeatures: u32 {
        const SPARSE_SUPER = 0x0001;
        const LARGE_FILE = 0x0002;
        const BTREE_DIR = 0x0004;
    }
}

impl IncompatFeatures {
    /// Feature set this core can handle.
    pub const SUPPORTED: Self = Self::FILETYPE.union(Self::META_BG);
}

impl RoCompatFeatures {
    /// Feature set this core can handle read-write.
    pub const SUPPORTED: Self = Self::SPARSE_SUPER.union(Self::LARGE_FILE);
}

/// Reaction to detected on-disk corruption, from `s_errors` or the
/// `errors=` mount option.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorsPolicy {
    /// Log and keep going.
    #[default]
    Continue,
    /// Flip the mount read-only.
    RemountRo,
    /// Panic the volume.
    Panic,
}

/// `s_errors`: keep going on errors.
pub const ERRORS_CONTINUE: u16 = 1;
/// `s_errors`: remount read-only on errors.
pub const ERRORS_RO: u16 = 2;
/// `s_errors`: panic on errors.
pub const ERRORS_PANIC: u16 = 3;

/// Parsed mount options. The option-string parser lives with the host; the
/// core consumes this struct.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Alternate superblock location (`sb=N`), in filesystem blocks.
    pub sb_block: Option<u32>,
    /// `minixdf`: statfs reports raw totals instead of subtracting the
    /// metadata overhead (`bsddf`, the default).
    pub minixdf: bool,
    /// `grpid`: new inodes take the parent directory's gid unconditionally.
    pub grpid: bool,
    /// `resuid=N`: overrides the superblock's reserved-blocks uid.
    pub resuid: Option<u32>,
    /// `resgid=N`: overrides the superblock's reserved-blocks gid.
    pub resgid: Option<u32>,
    /// `errors=`: overrides the superblock's errors policy.
    pub errors: Option<ErrorsPolicy>,
    /// `nouid32`: ignore the 16-bit high halves of stored uids/gids.
    pub nouid32: bool,
    /// `reservation`/`noreservation`: per-inode reservation windows.
    pub reservation: bool,
    /// Synchronous mount: flush dirtied metadata at operation end.
    pub sync: bool,
    /// `debug`: log the mount geometry banner.
    pub debug: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            sb_block: None,
            minixdf: false,
            grpid: false,
            resuid: None,
            resgid: None,
            errors: None,
            nouid32: false,
            reservation: true,
            sync: false,
            debug: false,
        }
    }
}

/// The on-disk superblock, revision 1 ("dynamic").
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    /// Total number of inodes.
    pub s_inodes_count: Le32,
    /// Total number of blocks.
    pub s_blocks_count: Le32,
    /// Blocks reserved for the privileged/reserved user.
    pub s_r_blocks_count: Le32,
    /// Free block count, authoritative only after sync.
    pub s_free_blocks_count: Le32,
    /// Free inode count, authoritative only after sync.
    pub s_free_inodes_count: Le32,
    /// First data block: 1 for 1 KiB blocks, 0 otherwise.
    pub s_first_data_block: Le32,
    /// `log2(block_size) - 10`.
    pub s_log_block_size: Le32,
    /// `log2(fragment_size) - 10`.
    pub s_log_frag_size: Le32,
    /// Blocks per block group.
    pub s_blocks_per_group: Le32,
    /// Fragments per block group.
    pub s_frags_per_group: Le32,
    /// Inodes per block group.
    pub s_inodes_per_group: Le32,
    /// Last mount time.
    pub s_mtime: Le32,
    /// Last write time.
    pub s_wtime: Le32,
    /// Mounts since the last check.
    pub s_mnt_count: Le16,
    /// Mounts allowed before a check is required.
    pub s_max_mnt_count: Le16,
    /// Signature, [`EXT2_MAGIC`].
    pub s_magic: Le16,
    /// [`STATE_VALID_FS`] / [`STATE_ERROR_FS`].
    pub s_state: Le16,
    /// On-error behaviour.
    pub s_errors: Le16,
    /// Minor revision.
    pub s_minor_rev_level: Le16,
    /// Time of the last check.
    pub s_lastcheck: Le32,
    /// Maximum interval between checks.
    pub s_checkinterval: Le32,
    /// Creator OS id.
    pub s_creator_os: Le32,
    /// Revision level.
    pub s_rev_level: Le32,
    /// Default uid for reserved blocks.
    pub s_def_resuid: Le16,
    /// Default gid for reserved blocks.
    pub s_def_resgid: Le16,

    // Dynamic-revision fields.
    /// First usable inode.
    pub s_first_ino: Le32,
    /// Inode record size, power of two, 128..=block size.
    pub s_inode_size: Le16,
    /// Group number hosting this superblock copy.
    pub s_block_group_nr: Le16,
    /// [`CompatFeatures`].
    pub s_feature_compat: Le32,
    /// [`IncompatFeatures`].
    pub s_feature_incompat: Le32,
    /// [`RoCompatFeatures`].
    pub s_feature_ro_compat: Le32,
    /// Volume UUID.
    pub s_uuid: [u8; 16],
    /// Volume label.
    pub s_volume_name: [u8; 16],
    /// Last mount point.
    pub s_last_mounted: [u8; 64],
    /// Compression algorithm bitmap.
    pub s_algo_bitmap: Le32,
    /// Blocks preallocated to files.
    pub s_prealloc_blocks: u8,
    /// Blocks preallocated to directories.
    pub s_prealloc_dir_blocks: u8,
    s_padding1: Le16,
    /// Journal UUID.
    pub s_journal_uuid: [u8; 16],
    /// Journal inode.
    pub s_journal_inum: Le32,
    /// Journal device.
    pub s_journal_dev: Le32,
    /// Head of the orphan inode list.
    pub s_last_orphan: Le32,
    /// Htree hash seed.
    pub s_hash_seed: [Le32; 4],
    /// Default hash version.
    pub s_def_hash_version: u8,
    s_reserved_char_pad: u8,
    s_reserved_word_pad: Le16,
    /// Default mount options.
    pub s_default_mount_opts: Le32,
    /// First metablock group, when `META_BG` is set.
    pub s_first_meta_bg: Le32,
    s_reserved: [u32; 190],
}

impl Superblock {
    /// Reads the superblock from the device. `sb_block` overrides the
    /// default location with a filesystem block number interpreted at 1 KiB
    /// granularity, as `sb=N` does.
    pub fn read_from(dev: &Arc<dyn BlockDevice>, sb_block: Option<u32>) -> Ext2Result<Self> {
        let offset = match sb_block {
            Some(blk) => u64::from(blk) * 1024,
            None => SUPERBLOCK_OFFSET,
        };
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        dev.read_at(offset, &mut raw)?;
        Ok(bytemuck::pod_read_unaligned(&raw))
    }

    pub fn is_valid_magic(&self) -> bool {
        self.s_magic.get() == EXT2_MAGIC
    }

    /// Block size in bytes: `1 KiB << s_log_block_size`.
    pub fn block_size(&self) -> u32 {
        1024 << self.s_log_block_size.get()
    }

    /// Inode record size; fixed at 128 bytes before the dynamic revision.
    pub fn inode_size(&self) -> u16 {
        if self.s_rev_level.get() >= REV_DYNAMIC {
            self.s_inode_size.get()
        } else {
            GOOD_OLD_INODE_SIZE
        }
    }

    /// First inode number available for regular allocation.
    pub fn first_ino(&self) -> u32 {
        if self.s_rev_level.get() >= REV_DYNAMIC {
            self.s_first_ino.get()
        } else {
            GOOD_OLD_FIRST_INO
        }
    }

    pub fn compat(&self) -> CompatFeatures {
        CompatFeatures::from_bits_retain(self.s_feature_compat.get())
    }

    pub fn incompat(&self) -> IncompatFeatures {
        IncompatFeatures::from_bits_retain(self.s_feature_incompat.get())
    }

    pub fn ro_compat(&self) -> RoCompatFeatures {
        RoCompatFeatures::from_bits_retain(self.s_feature_ro_compat.get())
    }

    /// Number of block groups on the volume.
    pub fn groups_count(&self) -> u32 {
        let data_blocks = self.s_blocks_count.get() - self.s_first_data_block.get();
        data_blocks.div_ceil(self.s_blocks_per_group.get())
    }
}

/// In-memory mirror of the superblock plus the derived geometry and the
/// aggregated free-space counters.
pub struct SuperState {
    /// Host copy of the on-disk record; mutated fields reach the device on
    /// [`SuperState::write_back`].
    raw: RwLock<Superblock>,

    /// Block size in bytes.
    pub block_size: u32,
    /// `log2(block_size)`.
    pub block_size_bits: u32,
    /// Inode record size in bytes.
    pub inode_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// Inode-table blocks per group.
    pub itb_per_group: u32,
    /// Group descriptors per block.
    pub desc_per_block: u32,
    /// Block-number slots per indirect block.
    pub addr_per_block: u32,
    pub inodes_per_block: u32,
    pub groups_count: u32,
    pub first_data_block: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub r_blocks_count: u32,
    pub first_ino: u32,
    /// Reserved-blocks uid after the mount-option override.
    pub resuid: u32,
    /// Reserved-blocks gid after the mount-option override.
    pub resgid: u32,
    pub errors_policy: ErrorsPolicy,
    pub opts: MountOptions,

    /// Directory records carry a file-type byte.
    pub has_filetype: bool,
    pub sparse_super: bool,
    pub meta_bg: bool,

    free_blocks: AtomicU64,
    free_inodes: AtomicU64,
    used_dirs: AtomicU64,
    read_only: AtomicBool,
}

impl SuperState {
    /// Validates a freshly read superblock and builds the mount state.
    /// Counters start at zero; the mount sequence fills them from the group
    /// descriptors.
    pub fn new(raw: Superblock, opts: MountOptions) -> Ext2Result<Self> {
        if !raw.is_valid_magic() {
            error!(target: "ext2", "bad superblock magic {:#06x}", raw.s_magic.get());
            return Err(Error::Corrupted);
        }
        if raw.s_rev_level.get() > REV_DYNAMIC {
            error!(target: "ext2", "unsupported revision level {}", raw.s_rev_level.get());
            return Err(Error::Corrupted);
        }
        if raw.s_state.get() & STATE_VALID_FS == 0 {
            error!(target: "ext2", "volume was not unmounted cleanly");
            return Err(Error::Corrupted);
        }
        let unsupported = raw.incompat().difference(IncompatFeatures::SUPPORTED);
        if !unsupported.is_empty() {
            error!(target: "ext2", "unsupported incompat features {:#x}", unsupported.bits());
            return Err(Error::Invalid);
        }

        let block_size = raw.block_size();
        let inode_size = u32::from(raw.inode_size());
        if !inode_size.is_power_of_two() || inode_size < 128 || inode_size > block_size {
            error!(target: "ext2", "bad inode size {inode_size}");
            return Err(Error::Corrupted);
        }
        if raw.s_blocks_per_group.get() == 0
            || raw.s_blocks_per_group.get() > block_size * 8
            || raw.s_inodes_per_group.get() == 0
            || raw.s_inodes_per_group.get() > block_size * 8
        {
            error!(target: "ext2", "bad per-group geometry");
            return Err(Error::Corrupted);
        }

        let ro_unsupported = raw.ro_compat().difference(RoCompatFeatures::SUPPORTED);
        let read_only = !ro_unsupported.is_empty();
        if read_only {
            warn!(target: "ext2",
                "unsupported ro_compat features {:#x}, mounting read-only",
                ro_unsupported.bits());
        }

        let errors_policy = opts.errors.unwrap_or(match raw.s_errors.get() {
            ERRORS_RO => ErrorsPolicy::RemountRo,
            ERRORS_PANIC => ErrorsPolicy::Panic,
            _ => ErrorsPolicy::Continue,
        });

        let resuid = opts.resuid.unwrap_or(u32::from(raw.s_def_resuid.get()));
        let resgid = opts.resgid.unwrap_or(u32::from(raw.s_def_resgid.get()));

        Ok(Self {
            block_size,
            block_size_bits: block_size.trailing_zeros(),
            inode_size,
            blocks_per_group: raw.s_blocks_per_group.get(),
            inodes_per_group: raw.s_inodes_per_group.get(),
            itb_per_group: (raw.s_inodes_per_group.get() * inode_size).div_ceil(block_size),
            desc_per_block: block_size / 32,
            addr_per_block: block_size / 4,
            inodes_per_block: block_size / inode_size,
            groups_count: raw.groups_count(),
            first_data_block: raw.s_first_data_block.get(),
            blocks_count: raw.s_blocks_count.get(),
            inodes_count: raw.s_inodes_count.get(),
            r_blocks_count: raw.s_r_blocks_count.get(),
            first_ino: raw.first_ino(),
            resuid,
            resgid,
            errors_policy,
            has_filetype: raw.incompat().contains(IncompatFeatures::FILETYPE),
            sparse_super: raw.ro_compat().contains(RoCompatFeatures::SPARSE_SUPER),
            meta_bg: raw.incompat().contains(IncompatFeatures::META_BG),
            opts,
            free_blocks: AtomicU64::new(0),
            free_inodes: AtomicU64::new(0),
            used_dirs: AtomicU64::new(0),
            read_only: AtomicBool::new(read_only),
            raw: RwLock::new(raw),
        })
    }

    /// First block of group `group`.
    pub fn group_first_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group
    }

    /// Number of blocks in group `group`; the last group holds the
    /// remainder.
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        if group == self.groups_count - 1 {
            self.blocks_count - self.group_first_block(group)
        } else {
            self.blocks_per_group
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    // Counter maintenance. The counters shadow the group descriptors and
    // reach the on-disk superblock only at sync.

    pub fn init_counters(&self, free_blocks: u64, free_inodes: u64, used_dirs: u64) {
        self.free_blocks.store(free_blocks, Ordering::Release);
        self.free_inodes.store(free_inodes, Ordering::Release);
        self.used_dirs.store(used_dirs, Ordering::Release);
    }

    pub fn free_blocks_count(&self) -> u64 {
        self.free_blocks.load(Ordering::Acquire)
    }

    pub fn free_inodes_count(&self) -> u64 {
        self.free_inodes.load(Ordering::Acquire)
    }

    pub fn used_dirs_count(&self) -> u64 {
        self.used_dirs.load(Ordering::Acquire)
    }

    pub fn add_free_blocks(&self, n: i64) {
        if n >= 0 {
            self.free_blocks.fetch_add(n as u64, Ordering::AcqRel);
        } else {
            self.free_blocks.fetch_sub(n.unsigned_abs(), Ordering::AcqRel);
        }
    }

    pub fn add_free_inodes(&self, n: i64) {
        if n >= 0 {
            self.free_inodes.fetch_add(n as u64, Ordering::AcqRel);
        } else {
            self.free_inodes.fetch_sub(n.unsigned_abs(), Ordering::AcqRel);
        }
    }

    pub fn add_used_dirs(&self, n: i64) {
        if n >= 0 {
            self.used_dirs.fetch_add(n as u64, Ordering::AcqRel);
        } else {
            self.used_dirs.fetch_sub(n.unsigned_abs(), Ordering::AcqRel);
        }
    }

    /// Whether an allocation by `(uid, gid)` may proceed. The reserved tail
    /// of the volume is admitted only to uid 0 or the reserved identity; a
    /// privileged caller passing the gate can still run out at the bitmap.
    pub fn has_free_blocks(&self, uid: u32, gid: u32) -> bool {
        let free = self.free_blocks_count();
        let reserved = u64::from(self.r_blocks_count);
        if free < reserved + 1
            && uid != 0
            && uid != self.resuid
            && (self.resgid == 0 || gid != self.resgid)
        {
            return false;
        }
        true
    }

    /// Runs `f` against the superblock mirror and marks it dirty.
    pub fn update_raw(&self, f: impl FnOnce(&mut Superblock)) {
        let mut raw = self.raw.write();
        f(&mut raw);
    }

    /// Read access to the superblock mirror.
    pub fn with_raw<T>(&self, f: impl FnOnce(&Superblock) -> T) -> T {
        f(&self.raw.read())
    }

    /// Records that a regular file grew past the 2 GiB boundary: flips the
    /// `LARGE_FILE` ro-compat flag on first use.
    pub fn ensure_large_file(&self) {
        let has = self.with_raw(|raw| raw.ro_compat().contains(RoCompatFeatures::LARGE_FILE));
        if !has {
            self.update_raw(|raw| {
                let bits = raw.s_feature_ro_compat.get() | RoCompatFeatures::LARGE_FILE.bits();
                raw.s_feature_ro_compat.set(bits);
            });
        }
    }

    /// Flips the `EXT_ATTR` compat flag; called when an xattr block is first
    /// written by an external xattr layer.
    pub fn ensure_ext_attr(&self) {
        let has = self.with_raw(|raw| raw.compat().contains(CompatFeatures::EXT_ATTR));
        if !has {
            self.update_raw(|raw| {
                let bits = raw.s_feature_compat.get() | CompatFeatures::EXT_ATTR.bits();
                raw.s_feature_compat.set(bits);
            });
        }
    }

    /// Folds the live counters into the mirror and writes it to the device.
    /// `state` overrides `s_state` when `Some` (freeze writes "not valid",
    /// unmount restores "valid").
    pub fn write_back(
        &self,
        dev: &Arc<dyn BlockDevice>,
        wtime: u32,
        state: Option<u16>,
    ) -> CanFail<Error> {
        let mut raw = self.raw.write();
        raw.s_free_blocks_count
            .set(self.free_blocks_count().min(u64::from(u32::MAX)) as u32);
        raw.s_free_inodes_count
            .set(self.free_inodes_count().min(u64::from(u32::MAX)) as u32);
        raw.s_wtime.set(wtime);
        if let Some(state) = state {
            raw.s_state.set(state);
        }
        dev.write_at(SUPERBLOCK_OFFSET, bytemuck::bytes_of(&*raw))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_layout_is_1024_bytes() {
        assert_eq!(core::mem::size_of::<Superblock>(), SUPERBLOCK_SIZE);
        // Spot-check the magic offset the way fsck tools find it.
        let mut raw = Superblock::zeroed();
        raw.s_magic.set(EXT2_MAGIC);
        let bytes = bytemuck::bytes_of(&raw);
        assert_eq!(&bytes[56..58], &[0x53, 0xef]);
    }

    fn minimal_raw() -> Superblock {
        let mut raw = Superblock::zeroed();
        raw.s_magic.set(EXT2_MAGIC);
        raw.s_state.set(STATE_VALID_FS);
        raw.s_rev_level.set(REV_DYNAMIC);
        raw.s_inode_size.set(128);
        raw.s_first_ino.set(11);
        raw.s_log_block_size.set(0);
        raw.s_first_data_block.set(1);
        raw.s_blocks_count.set(8193);
        raw.s_inodes_count.set(2048);
        raw.s_blocks_per_group.set(8192);
        raw.s_inodes_per_group.set(2048);
        raw.s_feature_incompat.set(IncompatFeatures::FILETYPE.bits());
        raw
    }

    #[test]
    fn group_count_rounds_up() {
        let mut raw = minimal_raw();
        assert_eq!(raw.groups_count(), 1);
        raw.s_blocks_count.set(8194);
        assert_eq!(raw.groups_count(), 2);
    }

    #[test]
    fn state_rejects_bad_magic_and_features() {
        let mut raw = minimal_raw();
        raw.s_magic.set(0x1234);
        assert_eq!(
            SuperState::new(raw, MountOptions::default()).err(),
            Some(Error::Corrupted)
        );

        let mut raw = minimal_raw();
        raw.s_feature_incompat.set(IncompatFeatures::COMPRESSION.bits());
        assert_eq!(
            SuperState::new(raw, MountOptions::default()).err(),
            Some(Error::Invalid)
        );

        let mut raw = minimal_raw();
        raw.s_state.set(0);
        assert_eq!(
            SuperState::new(raw, MountOptions::default()).err(),
            Some(Error::Corrupted)
        );
    }

    #[test]
    fn reserved_blocks_gate() {
        let mut raw = minimal_raw();
        raw.s_r_blocks_count.set(16);
        raw.s_def_resuid.set(1000);
        let state = SuperState::new(raw, MountOptions::default()).unwrap();

        state.init_counters(100, 10, 1);
        assert!(state.has_free_blocks(4242, 4242));

        state.init_counters(16, 10, 1);
        assert!(!state.has_free_blocks(4242, 4242));
        assert!(state.has_free_blocks(0, 0), "root reaches the reserve");
        assert!(state.has_free_blocks(1000, 0), "resuid reaches the reserve");

        // The gate is a policy check only; a privileged caller on an empty
        // volume passes it and fails later at the bitmap.
        state.init_counters(0, 10, 1);
        assert!(state.has_free_blocks(0, 0));
        assert!(!state.has_free_blocks(4242, 4242));
    }

    #[test]
    fn large_file_flag_is_sticky() {
        let raw = minimal_raw();
        let state = SuperState::new(raw, MountOptions::default()).unwrap();
        assert!(!state.with_raw(|r| r.ro_compat().contains(RoCompatFeatures::LARGE_FILE)));
        state.ensure_large_file();
        state.ensure_large_file();
        assert!(state.with_raw(|r| r.ro_compat().contains(RoCompatFeatures::LARGE_FILE)));
    }
}
