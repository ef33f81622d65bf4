//! The mounted filesystem.
//!
//! [`Ext2Fs`] is the mount-scoped object every operation threads through:
//! the buffered-block cache, the superblock state, the descriptor table,
//! the reservation-window tree and the inode cache. There is no global
//! state; two mounts are fully independent.
//!
//! Operations enter here carrying the caller's [`Cred`], take the locks
//! described on each path, and return [`Error`] kinds mapping one-to-one
//! onto POSIX errnos.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use log::{error, info, warn};
use spin::Mutex;

use crate::balloc::{self, RsvTree};
use crate::blkmap;
use crate::block_grp::{group_has_super, BlockGroups};
use crate::device::{BlockDevice, BufferCache};
use crate::dir;
use crate::error::{CanFail, Error, Ext2Result};
use crate::file;
use crate::ialloc;
use crate::inode::{self, FileType, Inode, InodeNo, S_IFDIR, S_IFLNK, S_IFMT};
use crate::sb::{ErrorsPolicy, MountOptions, SuperState, Superblock, STATE_ERROR_FS, STATE_VALID_FS};
use crate::time::Clock;

/// Hard link ceiling, as ext2 enforces it.
pub const LINK_MAX: u16 = 32000;

/// Identity of the calling process, for ownership and the reserved-blocks
/// policy. Uid zero is privileged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

impl Cred {
    pub const ROOT: Self = Self { uid: 0, gid: 0 };
}

/// Filesystem usage summary, `statfs` flavoured by the `minixdf` option.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStat {
    pub block_size: u32,
    pub blocks: u64,
    pub free_blocks: u64,
    /// Free blocks an unprivileged caller can actually claim.
    pub avail_blocks: u64,
    pub inodes: u64,
    pub free_inodes: u64,
    pub name_max: u32,
}

/// A mounted ext2 volume.
pub struct Ext2Fs {
    pub(crate) cache: BufferCache,
    pub sb: SuperState,
    pub(crate) groups: BlockGroups,
    /// The reservation-window index (§ lock order: above the per-group
    /// locks, below the inode metadata locks).
    pub(crate) rsv: Mutex<RsvTree>,
    pub(crate) clock: Arc<dyn Clock>,
    icache: Mutex<HashMap<u32, Arc<Inode>>>,
    dev: Arc<dyn BlockDevice>,
}

impl Ext2Fs {
    /// Mounts the volume: read and verify the superblock, load and verify
    /// every group descriptor, seed the counters, flush the bumped mount
    /// count, and hand back the filesystem with its root reachable.
    pub fn mount(
        dev: Arc<dyn BlockDevice>,
        opts: MountOptions,
        clock: Arc<dyn Clock>,
    ) -> Ext2Result<Arc<Self>> {
        let raw = Superblock::read_from(&dev, opts.sb_block)?;
        let debug = opts.debug;
        let sb = SuperState::new(raw, opts)?;

        let cache = BufferCache::new(dev.clone(), sb.block_size as usize, sb.opts.sync);
        let groups = BlockGroups::load(&sb, &cache)?;
        let (free_blocks, free_inodes, used_dirs) = groups.aggregate_counts();
        sb.init_counters(free_blocks, free_inodes, used_dirs);

        let now = clock.now();
        let exceeded = sb.with_raw(|raw| {
            raw.s_max_mnt_count.get() != 0 && raw.s_mnt_count.get() >= raw.s_max_mnt_count.get()
        });
        if exceeded {
            warn!(target: "ext2", "maximal mount count reached, a filesystem check is recommended");
        }
        sb.update_raw(|raw| {
            let count = raw.s_mnt_count.get();
            raw.s_mnt_count.set(count + 1);
            raw.s_mtime.set(now.0);
        });
        sb.write_back(&dev, now.0, None)?;

        if debug {
            info!(target: "ext2",
                "mounted: {} blocks of {} bytes, {} inodes, {} groups, {} free blocks",
                sb.blocks_count, sb.block_size, sb.inodes_count, sb.groups_count, free_blocks);
        }

        let fs = Arc::new(Self {
            cache,
            sb,
            groups,
            rsv: Mutex::new(RsvTree::new()),
            clock,
            icache: Mutex::new(HashMap::new()),
            dev,
        });
        // Fault in the root so a broken root fails the mount, not the
        // first lookup.
        fs.root()?;
        Ok(fs)
    }

    /// The root directory inode.
    pub fn root(&self) -> Ext2Result<Arc<Inode>> {
        self.iget(InodeNo::ROOT)
    }

    /// Fetches an inode, serving repeated requests from the inode cache.
    pub fn iget(&self, ino: InodeNo) -> Ext2Result<Arc<Inode>> {
        let mut cache = self.icache.lock();
        if let Some(inode) = cache.get(&ino.0) {
            return Ok(inode.clone());
        }
        let inode = Arc::new(inode::read_inode(self, ino)?);
        cache.insert(ino.0, inode.clone());
        Ok(inode)
    }

    /// Drops a handle, as the last close of a file does: the reservation
    /// window goes away, dirty state reaches the buffer layer, and an
    /// unlinked inode with no remaining users is destroyed.
    pub fn release(&self, inode: Arc<Inode>) -> CanFail<Error> {
        balloc::discard_reservation(self, &inode);
        if inode.state().links_count == 0 {
            self.maybe_evict(inode)
        } else {
            if inode.is_dirty() && !self.sb.is_read_only() {
                inode::write_inode(self, &inode, false)?;
            }
            Ok(())
        }
    }

    /// Destroys an unlinked inode once the inode cache holds the only
    /// other reference: record `dtime`, tear the block tree down, write
    /// the dead record once, and free the bitmap bit.
    fn maybe_evict(&self, inode: Arc<Inode>) -> CanFail<Error> {
        {
            let mut cache = self.icache.lock();
            // One reference in the map, one in our hand; anything more is
            // an open handle that will come through release() later.
            if Arc::strong_count(&inode) > 2 {
                return Ok(());
            }
            cache.remove(&inode.ino.0);
        }
        if self.sb.is_read_only() {
            return Ok(());
        }
        {
            let mut state = inode.state_mut();
            state.dtime = self.clock.now();
            state.size = 0;
        }
        blkmap::truncate_blocks(self, &inode, 0)?;
        inode::write_inode(self, &inode, false)?;
        ialloc::free_inode(self, &inode)?;
        Ok(())
    }

    /// Routes a corruption report through the mount's errors policy.
    pub(crate) fn report_corruption(&self, what: fmt::Arguments<'_>) {
        error!(target: "ext2", "corruption: {what}");
        match self.sb.errors_policy {
            ErrorsPolicy::Continue => {}
            ErrorsPolicy::RemountRo => {
                if !self.sb.is_read_only() {
                    warn!(target: "ext2", "remounting read-only after errors");
                    self.sb.set_read_only();
                }
            }
            ErrorsPolicy::Panic => panic!("ext2: unrecoverable corruption: {what}"),
        }
    }

    fn check_writable(&self) -> CanFail<Error> {
        if self.sb.is_read_only() {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn require_dir(inode: &Inode) -> CanFail<Error> {
        if inode.state().is_dir() {
            Ok(())
        } else {
            Err(Error::Invalid)
        }
    }

    // Directory-tree operations.

    /// Resolves `name` inside `dir`.
    pub fn lookup(&self, dir: &Inode, name: &[u8]) -> Ext2Result<Arc<Inode>> {
        Self::require_dir(dir)?;
        let entry = dir::find_entry(self, dir, name)?.ok_or(Error::NotFound)?;
        self.iget(InodeNo(entry.ino))
    }

    /// Creates a non-directory child (regular file, device node, fifo or
    /// socket, depending on the type bits of `mode`).
    pub fn create(
        &self,
        dir: &Arc<Inode>,
        name: &[u8],
        mode: u16,
        cred: Cred,
    ) -> Ext2Result<Arc<Inode>> {
        self.check_writable()?;
        Self::require_dir(dir)?;
        if mode & S_IFMT == S_IFDIR {
            return Err(Error::Invalid);
        }
        if dir::find_entry(self, dir, name)?.is_some() {
            return Err(Error::Exists);
        }

        let inode = Arc::new(ialloc::new_inode(self, dir, mode, cred)?);
        let file_type = inode.state().file_type();
        if let Err(e) = dir::add_link(self, dir, name, inode.ino, file_type, cred) {
            self.undo_new_inode(&inode);
            return Err(e);
        }
        inode::write_inode(self, &inode, false)?;
        inode::write_inode(self, dir, false)?;
        self.icache.lock().insert(inode.ino.0, inode.clone());
        Ok(inode)
    }

    /// Creates a directory with `.` and `..` in place.
    pub fn mkdir(
        &self,
        dir: &Arc<Inode>,
        name: &[u8],
        mode: u16,
        cred: Cred,
    ) -> Ext2Result<Arc<Inode>> {
        self.check_writable()?;
        Self::require_dir(dir)?;
        if dir.state().links_count >= LINK_MAX {
            return Err(Error::NoSpace);
        }
        if dir::find_entry(self, dir, name)?.is_some() {
            return Err(Error::Exists);
        }

        let inode = Arc::new(ialloc::new_inode(
            self,
            dir,
            (mode & !S_IFMT) | S_IFDIR,
            cred,
        )?);
        // `.` gives the new directory its second link.
        inode.state_mut().links_count = 2;
        if let Err(e) = dir::make_empty(self, &inode, dir.ino, cred)
            .and_then(|_| dir::add_link(self, dir, name, inode.ino, Some(FileType::Directory), cred))
        {
            inode.state_mut().links_count = 0;
            self.undo_new_inode(&inode);
            return Err(e);
        }
        dir.state_mut().links_count += 1;
        inode::write_inode(self, &inode, false)?;
        inode::write_inode(self, dir, false)?;
        self.icache.lock().insert(inode.ino.0, inode.clone());
        Ok(inode)
    }

    /// Creates a symbolic link to `target`.
    pub fn symlink(
        &self,
        dir: &Arc<Inode>,
        name: &[u8],
        target: &[u8],
        cred: Cred,
    ) -> Ext2Result<Arc<Inode>> {
        self.check_writable()?;
        Self::require_dir(dir)?;
        if dir::find_entry(self, dir, name)?.is_some() {
            return Err(Error::Exists);
        }

        let inode = Arc::new(ialloc::new_inode(self, dir, S_IFLNK | 0o777, cred)?);
        if let Err(e) = file::set_symlink(self, &inode, target, cred)
            .and_then(|_| dir::add_link(self, dir, name, inode.ino, Some(FileType::Symlink), cred))
        {
            self.undo_new_inode(&inode);
            return Err(e);
        }
        inode::write_inode(self, &inode, false)?;
        self.icache.lock().insert(inode.ino.0, inode.clone());
        Ok(inode)
    }

    /// Adds another name for `target` inside `dir`.
    pub fn link(&self, dir: &Arc<Inode>, name: &[u8], target: &Arc<Inode>, cred: Cred) -> CanFail<Error> {
        self.check_writable()?;
        Self::require_dir(dir)?;
        {
            let state = target.state();
            if state.is_dir() {
                return Err(Error::NotPermitted);
            }
            if state.links_count >= LINK_MAX {
                return Err(Error::NoSpace);
            }
        }
        if dir::find_entry(self, dir, name)?.is_some() {
            return Err(Error::Exists);
        }
        dir::add_link(self, dir, name, target.ino, target.state().file_type(), cred)?;
        {
            let mut state = target.state_mut();
            state.links_count += 1;
            state.ctime = self.clock.now();
        }
        target.mark_dirty();
        inode::write_inode(self, target, false)?;
        Ok(())
    }

    /// Removes `name` from `dir` and drops the target's link count. The
    /// inode itself dies when its last handle is released.
    pub fn unlink(&self, dir: &Arc<Inode>, name: &[u8]) -> CanFail<Error> {
        self.check_writable()?;
        Self::require_dir(dir)?;
        if name == b"." || name == b".." {
            return Err(Error::Invalid);
        }
        let entry = dir::find_entry(self, dir, name)?.ok_or(Error::NotFound)?;
        let target = self.iget(InodeNo(entry.ino))?;
        if target.state().is_dir() {
            return Err(Error::NotPermitted);
        }

        dir::delete_entry(self, dir, &entry)?;
        {
            let mut state = target.state_mut();
            state.links_count = state.links_count.saturating_sub(1);
            state.ctime = self.clock.now();
        }
        target.mark_dirty();
        inode::write_inode(self, &target, false)?;
        self.maybe_evict(target)
    }

    /// Removes an empty directory: the entry, the victim's `.`-and-entry
    /// links, and the parent's `..` backlink all go.
    pub fn rmdir(&self, dir: &Arc<Inode>, name: &[u8]) -> CanFail<Error> {
        self.check_writable()?;
        Self::require_dir(dir)?;
        if name == b"." || name == b".." {
            return Err(Error::Invalid);
        }
        let entry = dir::find_entry(self, dir, name)?.ok_or(Error::NotFound)?;
        let target = self.iget(InodeNo(entry.ino))?;
        Self::require_dir(&target)?;
        if !dir::is_empty(self, &target)? {
            return Err(Error::NotEmpty);
        }

        dir::delete_entry(self, dir, &entry)?;
        {
            let mut state = target.state_mut();
            state.links_count = state.links_count.saturating_sub(2);
            state.size = 0;
            state.ctime = self.clock.now();
        }
        target.mark_dirty();
        {
            let mut state = dir.state_mut();
            state.links_count = state.links_count.saturating_sub(1);
        }
        dir.mark_dirty();
        inode::write_inode(self, &target, false)?;
        inode::write_inode(self, dir, false)?;
        self.maybe_evict(target)
    }

    /// Moves `old_name` in `old_dir` to `new_name` in `new_dir`, replacing
    /// an existing target under the usual POSIX constraints. Renaming a
    /// path onto itself is a no-op.
    pub fn rename(
        &self,
        old_dir: &Arc<Inode>,
        old_name: &[u8],
        new_dir: &Arc<Inode>,
        new_name: &[u8],
    ) -> CanFail<Error> {
        self.check_writable()?;
        Self::require_dir(old_dir)?;
        Self::require_dir(new_dir)?;
        if old_dir.ino == new_dir.ino && old_name == new_name {
            return Ok(());
        }

        let old_entry = dir::find_entry(self, old_dir, old_name)?.ok_or(Error::NotFound)?;
        let source = self.iget(InodeNo(old_entry.ino))?;
        let source_is_dir = source.state().is_dir();
        let source_type = source.state().file_type();
        // A moving directory needs its `..` rewired afterwards.
        let dotdot = if source_is_dir {
            Some(dir::dotdot(self, &source)?)
        } else {
            None
        };

        let existing = dir::find_entry(self, new_dir, new_name)?;
        let mut victim = None;
        if let Some(new_entry) = existing {
            let target = self.iget(InodeNo(new_entry.ino))?;
            let target_is_dir = target.state().is_dir();
            if source_is_dir {
                if !target_is_dir {
                    return Err(Error::Invalid);
                }
                if !dir::is_empty(self, &target)? {
                    return Err(Error::NotEmpty);
                }
            } else if target_is_dir {
                return Err(Error::Invalid);
            }
            dir::set_link(self, new_dir, &new_entry, source.ino, source_type, true)?;
            {
                let mut state = target.state_mut();
                state.links_count = state.links_count.saturating_sub(1);
                if target_is_dir {
                    state.links_count = state.links_count.saturating_sub(1);
                }
                state.ctime = self.clock.now();
            }
            target.mark_dirty();
            inode::write_inode(self, &target, false)?;
            victim = Some(target);
        } else {
            if source_is_dir && new_dir.state().links_count >= LINK_MAX {
                return Err(Error::NoSpace);
            }
            dir::add_link(self, new_dir, new_name, source.ino, source_type, Cred::ROOT)?;
            if source_is_dir {
                new_dir.state_mut().links_count += 1;
                new_dir.mark_dirty();
            }
        }

        // The entry moved; drop the old name. Look it up again in case the
        // insertion above reshuffled the source directory's records.
        let old_entry = dir::find_entry(self, old_dir, old_name)?.ok_or(Error::NotFound)?;
        dir::delete_entry(self, old_dir, &old_entry)?;
        source.state_mut().ctime = self.clock.now();
        source.mark_dirty();

        if let Some(dotdot) = dotdot {
            if old_dir.ino != new_dir.ino {
                dir::set_link(self, &source, &dotdot, new_dir.ino, Some(FileType::Directory), false)?;
            }
            let mut state = old_dir.state_mut();
            state.links_count = state.links_count.saturating_sub(1);
            drop(state);
            old_dir.mark_dirty();
        }

        inode::write_inode(self, &source, false)?;
        inode::write_inode(self, old_dir, false)?;
        inode::write_inode(self, new_dir, false)?;
        if let Some(victim) = victim {
            self.maybe_evict(victim)?;
        }
        Ok(())
    }

    /// Iterates the live entries of `dir`; `f` returns `false` to stop.
    pub fn read_dir(
        &self,
        dir: &Inode,
        f: impl FnMut(dir::DirEntry) -> bool,
    ) -> CanFail<Error> {
        Self::require_dir(dir)?;
        dir::for_each(self, dir, f)
    }

    /// Reads a symlink target.
    pub fn read_link(&self, inode: &Inode, buf: &mut [u8]) -> Ext2Result<usize> {
        file::read_link(self, inode, buf)
    }

    /// Positional read.
    pub fn read(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Ext2Result<usize> {
        file::read_at(self, inode, offset, buf)
    }

    /// Positional write.
    pub fn write(&self, inode: &Inode, offset: u64, data: &[u8], cred: Cred) -> Ext2Result<usize> {
        let n = file::write_at(self, inode, offset, data, cred)?;
        if inode.is_dirty() {
            inode::write_inode(self, inode, false)?;
        }
        Ok(n)
    }

    /// Size change (`truncate`/`ftruncate`).
    pub fn truncate(&self, inode: &Inode, new_size: u64) -> CanFail<Error> {
        file::set_size(self, inode, new_size)?;
        if new_size == 0 {
            balloc::discard_reservation(self, inode);
        }
        inode::write_inode(self, inode, false)
    }

    /// Usage counters for `statfs`. The `bsddf` flavour (default) hides
    /// the metadata overhead from the block totals; `minixdf` reports raw
    /// volume numbers.
    pub fn statfs(&self) -> FsStat {
        let overhead = if self.sb.opts.minixdf {
            0
        } else {
            let gdt_blocks = self.sb.groups_count.div_ceil(self.sb.desc_per_block);
            let mut overhead = u64::from(self.sb.first_data_block);
            for group in 0..self.sb.groups_count {
                if group_has_super(self.sb.sparse_super, group) {
                    overhead += 1 + u64::from(gdt_blocks);
                }
                overhead += u64::from(2 + self.sb.itb_per_group);
            }
            overhead
        };
        let free = self.sb.free_blocks_count();
        FsStat {
            block_size: self.sb.block_size,
            blocks: u64::from(self.sb.blocks_count) - overhead,
            free_blocks: free,
            avail_blocks: free.saturating_sub(u64::from(self.sb.r_blocks_count)),
            inodes: u64::from(self.sb.inodes_count),
            free_inodes: self.sb.free_inodes_count(),
            name_max: dir::MAX_NAME_LEN as u32,
        }
    }

    /// Writes every dirty inode and buffer back and folds the aggregated
    /// counters into the on-disk superblock.
    pub fn sync(&self) -> CanFail<Error> {
        let inodes: Vec<Arc<Inode>> = self.icache.lock().values().cloned().collect();
        for inode in inodes {
            if inode.is_dirty() {
                inode::write_inode(self, &inode, false)?;
            }
        }
        self.cache.sync_all()?;
        self.sb.write_back(&self.dev, self.clock.now().0, None)?;
        Ok(())
    }

    /// Freezes the volume: everything durable, then the state flag flipped
    /// to "has errors" so a crash while frozen is caught by the next mount.
    pub fn freeze(&self) -> CanFail<Error> {
        self.sync()?;
        self.sb
            .write_back(&self.dev, self.clock.now().0, Some(STATE_ERROR_FS))
    }

    /// Thaws a frozen volume, restoring the valid state flag.
    pub fn unfreeze(&self) -> CanFail<Error> {
        self.sb
            .write_back(&self.dev, self.clock.now().0, Some(STATE_VALID_FS))
    }

    /// Clean unmount: final sync, caches dropped, superblock written once
    /// with the valid state.
    pub fn unmount(self: Arc<Self>) -> CanFail<Error> {
        self.sync()?;
        self.icache.lock().clear();
        self.sb
            .write_back(&self.dev, self.clock.now().0, Some(STATE_VALID_FS))?;
        Ok(())
    }

    /// Rolls back a freshly allocated inode whose directory entry never
    /// materialized.
    fn undo_new_inode(&self, inode: &Arc<Inode>) {
        {
            let mut state = inode.state_mut();
            state.links_count = 0;
            state.dtime = self.clock.now();
        }
        let _ = blkmap::truncate_blocks(self, inode, 0);
        let _ = inode::write_inode(self, inode, false);
        let _ = ialloc::free_inode(self, inode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap;
    use crate::device::MemDisk;
    use crate::inode::S_IFREG;
    use crate::mkfs::{self, FormatOptions};
    use crate::time::{FixedClock, UnixTimestamp};

    const TS: u32 = 1_700_000_000;

    fn mkfs_mount_with(
        size: usize,
        fmt: FormatOptions,
        opts: MountOptions,
    ) -> (Arc<MemDisk>, Arc<Ext2Fs>) {
        let disk = Arc::new(MemDisk::new(size));
        let dev: Arc<dyn BlockDevice> = disk.clone();
        mkfs::format(&dev, &fmt).unwrap();
        let clock = Arc::new(FixedClock(UnixTimestamp(TS)));
        let fs = Ext2Fs::mount(dev, opts, clock).unwrap();
        (disk, fs)
    }

    fn mkfs_mount(size: usize) -> (Arc<MemDisk>, Arc<Ext2Fs>) {
        mkfs_mount_with(
            size,
            FormatOptions {
                timestamp: TS,
                ..Default::default()
            },
            MountOptions::default(),
        )
    }

    /// Every group's bitmap agrees with its descriptor, and the summed
    /// descriptors agree with the filesystem counter.
    fn assert_free_blocks_consistent(fs: &Ext2Fs) {
        let mut total = 0u64;
        for group in 0..fs.sb.groups_count {
            let buf = crate::balloc::read_block_bitmap(fs, group).unwrap();
            let free = bitmap::count_free(&buf.data(), fs.sb.blocks_in_group(group));
            let desc = fs.groups.read(group);
            assert_eq!(
                free,
                u32::from(desc.bg_free_blocks_count.get()),
                "bitmap and descriptor disagree for group {group}"
            );
            total += u64::from(free);
        }
        assert_eq!(total, fs.sb.free_blocks_count());
    }

    /// Record lengths in every directory block must tile the block exactly.
    fn assert_dir_blocks_tiled(fs: &Ext2Fs, dir: &Inode) {
        let nblocks = (dir.state().size >> fs.sb.block_size_bits) as u32;
        for n in 0..nblocks {
            let data = dir_block_bytes(fs, dir, n);
            let mut off = 0usize;
            while off < data.len() {
                let rec_len =
                    u16::from_le_bytes([data[off + 4], data[off + 5]]) as usize;
                assert!(rec_len >= 8, "runt record in block {n}");
                off += rec_len;
            }
            assert_eq!(off, data.len(), "block {n} is not exactly tiled");
        }
    }

    fn dir_block_bytes(fs: &Ext2Fs, dir: &Inode, n: u32) -> Vec<u8> {
        let mapping = blkmap::get_blocks(fs, dir, n, 1, false, Cred::ROOT)
            .unwrap()
            .unwrap();
        fs.cache.get(mapping.first).unwrap().data().to_vec()
    }

    fn dir_names(fs: &Ext2Fs, dir: &Inode) -> Vec<Vec<u8>> {
        let mut names = Vec::new();
        fs.read_dir(dir, |entry| {
            names.push(entry.name);
            true
        })
        .unwrap();
        names
    }

    #[test]
    fn mount_verify_sixteen_sparse_groups() {
        // 1 KiB blocks, exactly 16 full groups.
        let blocks = 1 + 16 * 8192;
        let (disk, fs) = mkfs_mount(blocks * 1024);

        assert_eq!(fs.sb.groups_count, 16);
        assert_eq!(fs.sb.block_size, 1024);
        assert!(fs.sb.sparse_super);

        // Superblock copies sit in groups 0, 1, 3, 5, 7, 9 and nowhere
        // else; backups carry the ext2 magic at offset 56.
        for group in 1..16u32 {
            let first = fs.sb.group_first_block(group);
            let mut magic = [0u8; 2];
            disk.read_at(u64::from(first) * 1024 + 56, &mut magic).unwrap();
            let has_copy = magic == [0x53, 0xef];
            assert_eq!(
                has_copy,
                [1, 3, 5, 7, 9].contains(&group),
                "superblock copy mismatch in group {group}"
            );
            // Descriptors reflect the same placement: the block bitmap
            // follows the copy in sparse groups and opens the group
            // elsewhere.
            let desc = fs.groups.read(group);
            let expected = first + if has_copy { 2 } else { 0 };
            assert_eq!(desc.bg_block_bitmap.get(), expected);
        }

        assert_free_blocks_consistent(&fs);

        // After sync the on-disk superblock agrees with the live counter.
        fs.sync().unwrap();
        let mut raw = [0u8; 4];
        disk.read_at(1024 + 12, &mut raw).unwrap();
        assert_eq!(u64::from(u32::from_le_bytes(raw)), fs.sb.free_blocks_count());
    }

    #[test]
    fn create_and_lookup() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();

        let a = fs.mkdir(&root, b"a", 0o755, Cred::ROOT).unwrap();
        let f = fs.create(&a, b"f", S_IFREG | 0o644, Cred::ROOT).unwrap();

        assert_eq!(dir_names(&fs, &a), [b".".to_vec(), b"..".to_vec(), b"f".to_vec()]);
        {
            let state = f.state();
            assert_eq!(state.links_count, 1);
            assert_eq!(state.size, 0);
            assert_eq!(state.mode, 0o100644);
        }
        assert_eq!(fs.lookup(&a, b"f").unwrap().ino, f.ino);
        assert_eq!(fs.lookup(&a, b"g").err(), Some(Error::NotFound));
        assert_eq!(
            fs.create(&a, b"f", S_IFREG | 0o644, Cred::ROOT).err(),
            Some(Error::Exists)
        );
        assert_dir_blocks_tiled(&fs, &a);
    }

    #[test]
    fn thirteen_kib_write_spills_into_indirect() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();
        let a = fs.mkdir(&root, b"a", 0o755, Cred::ROOT).unwrap();
        let f = fs.create(&a, b"f", S_IFREG | 0o644, Cred::ROOT).unwrap();

        let payload = vec![0u8; 13 * 1024];
        assert_eq!(fs.write(&f, 0, &payload, Cred::ROOT).unwrap(), 13 * 1024);

        // 12 direct + 1 data behind 1 fresh indirect block = 14 blocks,
        // counted in 512-byte units.
        assert_eq!(f.state().blocks_512, 28);
        assert_eq!(f.state().size, 13 * 1024);

        // The new single-indirect block holds exactly one mapping; the
        // remaining slots must have been zero-initialized.
        let ind = f.blocks()[12];
        assert_ne!(ind, 0);
        let ind_buf = fs.cache.get(ind).unwrap();
        let data = ind_buf.data();
        let slot0 = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        assert_ne!(slot0, 0);
        assert!(data[4..].iter().all(|&b| b == 0));
        drop(data);

        let mut back = vec![0xffu8; 13 * 1024];
        assert_eq!(fs.read(&f, 0, &mut back).unwrap(), 13 * 1024);
        assert!(back.iter().all(|&b| b == 0));
        assert_free_blocks_consistent(&fs);
    }

    #[test]
    fn truncate_returns_every_block() {
        let (_disk, fs) = mkfs_mount(8 << 20);
        let root = fs.root().unwrap();
        let f = fs.create(&root, b"big", S_IFREG | 0o644, Cred::ROOT).unwrap();

        let free_before = fs.sb.free_blocks_count();
        let payload: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.write(&f, 0, &payload, Cred::ROOT).unwrap(), payload.len());
        assert!(f.state().blocks_512 > 2048, "double-indirect tree expected");

        let mut back = vec![0u8; payload.len()];
        fs.read(&f, 0, &mut back).unwrap();
        assert_eq!(back, payload);

        fs.truncate(&f, 0).unwrap();
        assert_eq!(f.state().blocks_512, 0);
        assert_eq!(f.state().size, 0);
        assert_eq!(fs.sb.free_blocks_count(), free_before);
        assert_free_blocks_consistent(&fs);

        // A rewrite of the same bytes reads back identically.
        assert_eq!(fs.write(&f, 0, &payload, Cred::ROOT).unwrap(), payload.len());
        fs.read(&f, 0, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn rename_across_directories() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();
        let x = fs.mkdir(&root, b"x", 0o755, Cred::ROOT).unwrap();
        let y = fs.mkdir(&root, b"y", 0o755, Cred::ROOT).unwrap();
        let f = fs.create(&x, b"f", S_IFREG | 0o644, Cred::ROOT).unwrap();
        let ino = f.ino;

        fs.rename(&x, b"f", &y, b"g").unwrap();
        assert_eq!(fs.lookup(&x, b"f").err(), Some(Error::NotFound));
        let g = fs.lookup(&y, b"g").unwrap();
        assert_eq!(g.ino, ino);
        assert_eq!(g.state().links_count, 1);

        // Renaming a path onto itself changes nothing.
        fs.rename(&y, b"g", &y, b"g").unwrap();
        assert_eq!(fs.lookup(&y, b"g").unwrap().ino, ino);
    }

    #[test]
    fn rename_directory_rewires_dotdot() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();
        let x = fs.mkdir(&root, b"x", 0o755, Cred::ROOT).unwrap();
        let y = fs.mkdir(&root, b"y", 0o755, Cred::ROOT).unwrap();
        let d = fs.mkdir(&x, b"d", 0o755, Cred::ROOT).unwrap();
        assert_eq!(x.state().links_count, 3);
        assert_eq!(y.state().links_count, 2);

        fs.rename(&x, b"d", &y, b"d2").unwrap();
        assert_eq!(x.state().links_count, 2);
        assert_eq!(y.state().links_count, 3);
        let d2 = fs.lookup(&y, b"d2").unwrap();
        assert_eq!(d2.ino, d.ino);
        assert_eq!(fs.lookup(&d2, b"..").unwrap().ino, y.ino);
    }

    #[test]
    fn rmdir_requires_empty() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();
        let root_links = root.state().links_count;

        let d = fs.mkdir(&root, b"d", 0o755, Cred::ROOT).unwrap();
        assert_eq!(root.state().links_count, root_links + 1);
        drop(fs.create(&d, b"g", S_IFREG | 0o644, Cred::ROOT).unwrap());

        assert_eq!(fs.rmdir(&root, b"d").err(), Some(Error::NotEmpty));
        fs.unlink(&d, b"g").unwrap();
        fs.rmdir(&root, b"d").unwrap();
        assert_eq!(root.state().links_count, root_links);
        assert_eq!(fs.lookup(&root, b"d").err(), Some(Error::NotFound));
    }

    #[test]
    fn directory_slack_is_used_exactly() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();

        // Three 248-byte names split the first block down to 232 spare
        // bytes behind the last record.
        let fill = |fs: &Ext2Fs, dir: &Arc<Inode>| {
            for c in [b'a', b'b', b'c'] {
                let name = vec![c; 248];
                fs.create(dir, &name, S_IFREG | 0o644, Cred::ROOT).unwrap();
            }
        };

        // A 224-byte name needs exactly those 232 bytes: no growth.
        let d1 = fs.mkdir(&root, b"d1", 0o755, Cred::ROOT).unwrap();
        fill(&fs, &d1);
        assert_eq!(d1.state().size, 1024);
        fs.create(&d1, &vec![b'x'; 224], S_IFREG | 0o644, Cred::ROOT)
            .unwrap();
        assert_eq!(d1.state().size, 1024, "exact fit must not grow the directory");
        assert_dir_blocks_tiled(&fs, &d1);

        // One more byte of name cannot fit: the directory gains a block.
        let d2 = fs.mkdir(&root, b"d2", 0o755, Cred::ROOT).unwrap();
        fill(&fs, &d2);
        fs.create(&d2, &vec![b'x'; 225], S_IFREG | 0o644, Cred::ROOT)
            .unwrap();
        assert_eq!(d2.state().size, 2048, "overflow must open a fresh block");
        assert_dir_blocks_tiled(&fs, &d2);
    }

    #[test]
    fn delete_and_reinsert_is_byte_identical() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();
        let d = fs.mkdir(&root, b"d", 0o755, Cred::ROOT).unwrap();

        drop(fs.create(&d, b"aaa", S_IFREG | 0o644, Cred::ROOT).unwrap());
        drop(fs.create(&d, b"bbb", S_IFREG | 0o644, Cred::ROOT).unwrap());
        let before = dir_block_bytes(&fs, &d, 0);

        fs.unlink(&d, b"bbb").unwrap();
        drop(fs.create(&d, b"bbb", S_IFREG | 0o644, Cred::ROOT).unwrap());
        let after = dir_block_bytes(&fs, &d, 0);

        assert_eq!(before, after);
    }

    #[test]
    fn inode_record_survives_remount_bit_exact() {
        let disk = Arc::new(MemDisk::new(4 << 20));
        let dev: Arc<dyn BlockDevice> = disk.clone();
        mkfs::format(
            &dev,
            &FormatOptions {
                timestamp: TS,
                ..Default::default()
            },
        )
        .unwrap();
        let clock = Arc::new(FixedClock(UnixTimestamp(TS)));

        let fs = Ext2Fs::mount(dev.clone(), MountOptions::default(), clock.clone()).unwrap();
        let root = fs.root().unwrap();
        let f = fs.create(&root, b"f", S_IFREG | 0o644, Cred::ROOT).unwrap();
        fs.write(&f, 0, b"persistent bytes", Cred::ROOT).unwrap();
        let ino = f.ino;
        let table = fs.groups.read(0).bg_inode_table.get();
        let record_off = u64::from(table) * 1024 + u64::from(ino.0 - 1) * 128;
        drop((root, f));
        Arc::clone(&fs).unmount().unwrap();
        drop(fs);

        let mut before = [0u8; 128];
        disk.read_at(record_off, &mut before).unwrap();

        // Read it back in and write it out again: the record must not
        // change shape.
        let fs = Ext2Fs::mount(dev, MountOptions::default(), clock).unwrap();
        let f = fs.iget(ino).unwrap();
        inode::write_inode(&fs, &f, true).unwrap();
        let mut after = [0u8; 128];
        disk.read_at(record_off, &mut after).unwrap();
        assert_eq!(before, after);

        let mut buf = [0u8; 16];
        fs.read(&f, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"persistent bytes");
    }

    #[test]
    fn sparse_reads_serve_holes_as_zeros() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();
        let f = fs.create(&root, b"sparse", S_IFREG | 0o644, Cred::ROOT).unwrap();

        // Write beyond block 4 only; everything before stays a hole.
        let payload: Vec<u8> = (0..3000).map(|i| (i % 131) as u8).collect();
        fs.write(&f, 4096 + 100, &payload, Cred::ROOT).unwrap();
        assert_eq!(f.state().size, 4096 + 100 + 3000);

        let mut back = vec![0xaau8; 4096 + 100 + 3000];
        assert_eq!(fs.read(&f, 0, &mut back).unwrap(), back.len());
        assert!(back[..4096 + 100].iter().all(|&b| b == 0));
        assert_eq!(&back[4096 + 100..], &payload[..]);

        // Reading past the end clips.
        let mut tail = [0u8; 64];
        assert_eq!(fs.read(&f, f.state().size - 10, &mut tail).unwrap(), 10);
    }

    #[test]
    fn symlink_fast_and_slow() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();

        let short = fs.symlink(&root, b"short", b"target/file", Cred::ROOT).unwrap();
        assert_eq!(short.state().blocks_512, 0, "inline target takes no blocks");
        assert!(short.is_fast_symlink(&fs));
        let mut buf = [0u8; 64];
        let n = fs.read_link(&short, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"target/file");

        let long_target = vec![b'p'; 100];
        let long = fs.symlink(&root, b"long", &long_target, Cred::ROOT).unwrap();
        assert_eq!(long.state().blocks_512, 2, "block-backed target");
        assert!(!long.is_fast_symlink(&fs));
        let mut buf = vec![0u8; 128];
        let n = fs.read_link(&long, &mut buf).unwrap();
        assert_eq!(&buf[..n], &long_target[..]);

        // Both survive a remount.
        let disk2 = _disk;
        drop((short, long, root));
        Arc::clone(&fs).unmount().unwrap();
        drop(fs);
        let clock = Arc::new(FixedClock(UnixTimestamp(TS)));
        let dev: Arc<dyn BlockDevice> = disk2;
        let fs = Ext2Fs::mount(dev, MountOptions::default(), clock).unwrap();
        let root = fs.root().unwrap();
        let short = fs.lookup(&root, b"short").unwrap();
        let n = fs.read_link(&short, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"target/file");
    }

    #[test]
    fn hard_links_share_the_inode() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();
        let f = fs.create(&root, b"f", S_IFREG | 0o644, Cred::ROOT).unwrap();
        fs.write(&f, 0, b"shared", Cred::ROOT).unwrap();

        fs.link(&root, b"g", &f, Cred::ROOT).unwrap();
        assert_eq!(f.state().links_count, 2);
        assert_eq!(fs.lookup(&root, b"g").unwrap().ino, f.ino);

        fs.unlink(&root, b"f").unwrap();
        assert_eq!(f.state().links_count, 1);
        let mut buf = [0u8; 6];
        let g = fs.lookup(&root, b"g").unwrap();
        fs.read(&g, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");

        // Directories never take extra hard links.
        let d = fs.mkdir(&root, b"d", 0o755, Cred::ROOT).unwrap();
        assert_eq!(
            fs.link(&root, b"d2", &d, Cred::ROOT).err(),
            Some(Error::NotPermitted)
        );
    }

    #[test]
    fn unlinked_inode_is_reclaimed() {
        let (_disk, fs) = mkfs_mount(4 << 20);
        let root = fs.root().unwrap();
        let free_inodes = fs.sb.free_inodes_count();
        let free_blocks = fs.sb.free_blocks_count();

        let f = fs.create(&root, b"doomed", S_IFREG | 0o644, Cred::ROOT).unwrap();
        fs.write(&f, 0, &vec![7u8; 64 * 1024], Cred::ROOT).unwrap();
        let ino = f.ino;

        // The open handle keeps the inode alive across the unlink.
        fs.unlink(&root, b"doomed").unwrap();
        assert_eq!(f.state().links_count, 0);
        assert!(fs.sb.free_blocks_count() < free_blocks);

        fs.release(f).unwrap();
        assert_eq!(fs.sb.free_inodes_count(), free_inodes);
        assert_eq!(fs.sb.free_blocks_count(), free_blocks);
        assert_eq!(fs.iget(ino).err(), Some(Error::NotFound));
        assert_free_blocks_consistent(&fs);
    }

    #[test]
    fn reserved_blocks_gate_unprivileged_writers() {
        // 1 MiB volume, 5% reserved.
        let (_disk, fs) = mkfs_mount(1 << 20);
        let root = fs.root().unwrap();
        let user = Cred { uid: 1000, gid: 1000 };
        let f = fs.create(&root, b"hog", S_IFREG | 0o644, user).unwrap();

        let chunk = [0u8; 1024];
        let mut offset = 0u64;
        let denied = loop {
            match fs.write(&f, offset, &chunk, user) {
                Ok(_) => offset += 1024,
                Err(e) => break e,
            }
        };
        assert_eq!(denied, Error::NoSpace);
        // The reserved tail is still there, and root can use it.
        assert!(fs.sb.free_blocks_count() > 0);
        fs.write(&f, offset, &chunk, Cred::ROOT).unwrap();
    }

    #[test]
    fn corruption_remounts_read_only() {
        let disk = Arc::new(MemDisk::new(4 << 20));
        let dev: Arc<dyn BlockDevice> = disk.clone();
        mkfs::format(&dev, &FormatOptions::default()).unwrap();
        let clock = Arc::new(FixedClock(UnixTimestamp(TS)));

        // Find the root directory's data block, then break its first
        // record on disk.
        let root_block = {
            let fs = Ext2Fs::mount(dev.clone(), MountOptions::default(), clock.clone()).unwrap();
            let root = fs.root().unwrap();
            let blk = root.blocks()[0];
            drop(root);
            Arc::clone(&fs).unmount().unwrap();
            blk
        };
        disk.write_at(u64::from(root_block) * 1024 + 4, &[0, 0]).unwrap();

        let opts = MountOptions {
            errors: Some(ErrorsPolicy::RemountRo),
            ..Default::default()
        };
        let fs = Ext2Fs::mount(dev, opts, clock).unwrap();
        let root = fs.root().unwrap();
        assert_eq!(fs.lookup(&root, b"x").err(), Some(Error::Corrupted));
        assert!(fs.sb.is_read_only());
        assert_eq!(
            fs.create(&root, b"y", S_IFREG | 0o644, Cred::ROOT).err(),
            Some(Error::ReadOnly)
        );
    }

    #[test]
    fn statfs_flavours_disagree_on_overhead() {
        let (_a, bsd) = mkfs_mount(4 << 20);
        let (_b, minix) = mkfs_mount_with(
            4 << 20,
            FormatOptions {
                timestamp: TS,
                ..Default::default()
            },
            MountOptions {
                minixdf: true,
                ..Default::default()
            },
        );
        let bsd_stat = bsd.statfs();
        let minix_stat = minix.statfs();
        assert!(minix_stat.blocks > bsd_stat.blocks);
        assert_eq!(minix_stat.blocks, u64::from(minix.sb.blocks_count));
        assert!(bsd_stat.avail_blocks < bsd_stat.free_blocks);
    }

    #[test]
    fn concurrent_writers_keep_counters_consistent() {
        let (_disk, fs) = mkfs_mount(16 << 20);
        let root = fs.root().unwrap();

        // Directory serialization is the caller's job (the VFS holds the
        // directory mutex); block allocation below is not. Create the
        // names up front, then let the writers race.
        let files: Vec<_> = (0..4u8)
            .map(|i| {
                fs.create(&root, &[b'f', b'0' + i], S_IFREG | 0o644, Cred::ROOT)
                    .unwrap()
            })
            .collect();

        std::thread::scope(|scope| {
            for (i, f) in files.iter().enumerate() {
                let fs = fs.clone();
                scope.spawn(move || {
                    let payload = vec![i as u8; 64 * 1024];
                    fs.write(f, 0, &payload, Cred::ROOT).unwrap();
                    let mut back = vec![0u8; payload.len()];
                    fs.read(f, 0, &mut back).unwrap();
                    assert_eq!(back, payload);
                });
            }
        });

        assert_free_blocks_consistent(&fs);
        assert_dir_blocks_tiled(&fs, &root);

        // Reservation windows kept the four files' blocks disjoint.
        let mut seen = std::collections::HashSet::new();
        for i in 0..4u8 {
            let f = fs.lookup(&root, &[b'f', b'0' + i]).unwrap();
            for blk in 0..64u32 {
                let mapping = blkmap::get_blocks(&fs, &f, blk, 1, false, Cred::ROOT)
                    .unwrap()
                    .unwrap();
                assert!(seen.insert(mapping.first), "block {} shared", mapping.first);
            }
        }
    }

    #[test]
    fn sync_restores_valid_state_after_freeze() {
        let (disk, fs) = mkfs_mount(4 << 20);
        let state_off = 1024 + 58;

        fs.freeze().unwrap();
        let mut state = [0u8; 2];
        disk.read_at(state_off, &mut state).unwrap();
        assert_eq!(u16::from_le_bytes(state), crate::sb::STATE_ERROR_FS);

        fs.unfreeze().unwrap();
        disk.read_at(state_off, &mut state).unwrap();
        assert_eq!(u16::from_le_bytes(state), crate::sb::STATE_VALID_FS);
    }
}
