//! Inode allocation.
//!
//! Directories are placed with an Orlov-style heuristic that spreads them
//! across groups with above-average free inodes; everything else probes
//! quadratically outward from its parent's group. The bitmap claim itself
//! retries over every group, wrapping once, so a racing claim only costs a
//! new search.

use log::{debug, warn};

use crate::bitmap;
use crate::device::Buffer;
use crate::error::{CanFail, Error, Ext2Result};
use crate::fs::{Cred, Ext2Fs};
use crate::inode::{Inode, InodeNo, InodeState, N_BLOCKS, S_IFDIR, S_IFMT, S_ISGID};

/// Reads a group's inode bitmap.
pub fn read_inode_bitmap(fs: &Ext2Fs, group: u32) -> Ext2Result<Buffer> {
    let desc = fs.groups.read(group);
    fs.cache.get(desc.bg_inode_bitmap.get())
}

/// Picks the block group for a new directory.
///
/// Among groups whose free-inode count is at least the filesystem average,
/// the one with the most free blocks wins; when no group clears the bar,
/// the first group with any free inode at all is used.
fn find_group_dir(fs: &Ext2Fs) -> Option<u32> {
    let groups_count = fs.sb.groups_count;
    let ave_free_inodes = fs.sb.free_inodes_count() / u64::from(groups_count);

    let mut best: Option<(u32, u16)> = None;
    let mut fallback = None;
    for group in 0..groups_count {
        let desc = fs.groups.read(group);
        let free_inodes = desc.bg_free_inodes_count.get();
        if free_inodes == 0 {
            continue;
        }
        if fallback.is_none() {
            fallback = Some(group);
        }
        if u64::from(free_inodes) < ave_free_inodes {
            continue;
        }
        let free_blocks = desc.bg_free_blocks_count.get();
        if best.map_or(true, |(_, blocks)| free_blocks > blocks) {
            best = Some((group, free_blocks));
        }
    }
    best.map(|(group, _)| group).or(fallback)
}

/// Picks the block group for a non-directory: the parent's group when it
/// has room, then a quadratic probe away from it, then a plain linear scan.
fn find_group_other(fs: &Ext2Fs, parent_group: u32) -> Option<u32> {
    let groups_count = fs.sb.groups_count;
    let has_room = |group: u32| {
        let desc = fs.groups.read(group);
        desc.bg_free_inodes_count.get() > 0 && desc.bg_free_blocks_count.get() > 0
    };

    if has_room(parent_group) {
        return Some(parent_group);
    }
    let mut step = 1u64;
    while step < u64::from(groups_count) {
        let group = ((u64::from(parent_group) + step * step) % u64::from(groups_count)) as u32;
        if has_room(group) {
            return Some(group);
        }
        step += 1;
    }
    (0..groups_count).find(|&group| fs.groups.read(group).bg_free_inodes_count.get() > 0)
}

/// Allocates an inode for a child of `parent` and returns its in-memory
/// mirror, NEW bit set and marked dirty. `mode` arrives with the caller's
/// umask already applied; setgid propagation may add the setgid bit back
/// for directories.
pub fn new_inode(fs: &Ext2Fs, parent: &Inode, mode: u16, cred: Cred) -> Ext2Result<Inode> {
    if fs.sb.is_read_only() {
        return Err(Error::ReadOnly);
    }
    let is_dir = mode & S_IFMT == S_IFDIR;
    if fs.sb.free_inodes_count() == 0 {
        return Err(Error::NoSpace);
    }

    let start_group = if is_dir {
        find_group_dir(fs)
    } else {
        find_group_other(fs, parent.block_group)
    }
    .ok_or(Error::NoSpace)?;

    // Claim a bitmap bit, moving to the next group (wrapping once) whenever
    // the chosen one turns out to be full.
    let mut group = start_group;
    let mut claimed = None;
    'groups: for _ in 0..fs.sb.groups_count {
        let bitmap_buf = read_inode_bitmap(fs, group)?;
        let mut bit = 0u32;
        loop {
            let found = {
                let data = bitmap_buf.data();
                bitmap::find_next_zero(&data, bit, fs.sb.inodes_per_group)
            };
            if found >= fs.sb.inodes_per_group {
                break;
            }
            let won = {
                let _group = fs.groups.lock(group);
                let mut data = bitmap_buf.data_mut();
                !bitmap::set_bit(&mut data, found)
            };
            if won {
                claimed = Some((group, bitmap_buf, found));
                break 'groups;
            }
            // Claimed under us; keep scanning from the next bit.
            bit = found + 1;
            if bit >= fs.sb.inodes_per_group {
                break;
            }
        }
        group = (group + 1) % fs.sb.groups_count;
    }
    let (group, bitmap_buf, bit) = claimed.ok_or(Error::NoSpace)?;

    let ino = group * fs.sb.inodes_per_group + bit + 1;
    if ino < fs.sb.first_ino || ino > fs.sb.inodes_count {
        fs.report_corruption(format_args!("inode bitmap handed out reserved inode {ino}"));
        return Err(Error::Corrupted);
    }

    fs.sb.add_free_inodes(-1);
    fs.groups.update(group, &fs.cache, |desc| {
        let cur = desc.bg_free_inodes_count.get();
        desc.bg_free_inodes_count.set(cur - 1);
        if is_dir {
            let dirs = desc.bg_used_dirs_count.get();
            desc.bg_used_dirs_count.set(dirs + 1);
        }
    })?;
    if is_dir {
        fs.sb.add_used_dirs(1);
    }
    bitmap_buf.mark_dirty();
    fs.cache.flush_if_sync(&bitmap_buf)?;

    // Owner and group follow the usual POSIX rules: a setgid parent (or the
    // grpid mount option) passes its gid down, and a directory under a
    // setgid parent keeps the setgid bit itself.
    let parent_state = parent.state();
    let mut mode = mode;
    let gid = if fs.sb.opts.grpid || parent_state.mode & S_ISGID != 0 {
        if is_dir && parent_state.mode & S_ISGID != 0 {
            mode |= S_ISGID;
        }
        parent_state.gid
    } else {
        cred.gid
    };
    let flags = parent_state.flags.masked_for(mode);
    drop(parent_state);

    let now = fs.clock.now();
    let state = InodeState {
        mode,
        uid: cred.uid,
        gid,
        size: 0,
        atime: now,
        ctime: now,
        mtime: now,
        dtime: crate::time::UnixTimestamp(0),
        links_count: 1,
        blocks_512: 0,
        flags,
        generation: 0,
        file_acl: 0,
    };

    debug!(target: "ext2", "allocated inode {ino} in group {group}");
    let inode = Inode::from_parts(InodeNo(ino), group, state, [0u32; N_BLOCKS], true);
    inode.mark_dirty();
    Ok(inode)
}

/// Releases `inode`'s bitmap bit and rolls the counters back. The caller
/// has already recorded `dtime` and torn the block tree down.
pub fn free_inode(fs: &Ext2Fs, inode: &Inode) -> CanFail<Error> {
    let ino = inode.ino.0;
    if ino < fs.sb.first_ino || ino > fs.sb.inodes_count {
        fs.report_corruption(format_args!("attempt to free reserved inode {ino}"));
        return Err(Error::Corrupted);
    }
    let is_dir = inode.state().is_dir();
    let group = (ino - 1) / fs.sb.inodes_per_group;
    let bit = (ino - 1) % fs.sb.inodes_per_group;

    let bitmap_buf = read_inode_bitmap(fs, group)?;
    let was_set = {
        let _group = fs.groups.lock(group);
        let mut data = bitmap_buf.data_mut();
        bitmap::clear_bit(&mut data, bit)
    };
    if !was_set {
        warn!(target: "ext2", "bit already cleared for inode {ino}");
        return Ok(());
    }

    fs.sb.add_free_inodes(1);
    fs.groups.update(group, &fs.cache, |desc| {
        let cur = desc.bg_free_inodes_count.get();
        desc.bg_free_inodes_count.set(cur + 1);
        if is_dir {
            let dirs = desc.bg_used_dirs_count.get();
            desc.bg_used_dirs_count.set(dirs - 1);
        }
    })?;
    if is_dir {
        fs.sb.add_used_dirs(-1);
    }
    bitmap_buf.mark_dirty();
    fs.cache.flush_if_sync(&bitmap_buf)?;
    Ok(())
}
