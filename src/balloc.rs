//! Block allocation.
//!
//! Allocation works per group against the group's block bitmap, preferring a
//! goal block for locality. Regular files additionally carry a per-inode
//! reservation window: a contiguous interval of block numbers pre-claimed in
//! a filesystem-wide tree so that concurrent writers do not interleave their
//! allocations. Windows are owned by their inode ([`BlockAllocInfo`]) and
//! indexed, never owned, by the ordered [`RsvTree`] under the reservation
//! lock.
//!
//! Lock order on these paths: reservation lock, then the per-group lock,
//! then the bitmap buffer.

use alloc::collections::BTreeMap;

use log::{debug, warn};

use crate::bitmap;
use crate::device::Buffer;
use crate::error::{CanFail, Error, Ext2Result};
use crate::fs::{Cred, Ext2Fs};
use crate::inode::Inode;

/// Initial reservation window width, in blocks.
pub const DEFAULT_RESERVE_BLOCKS: u32 = 8;

/// Ceiling a window may grow to through hit-ratio doubling.
pub const MAX_RESERVE_BLOCKS: u32 = 1024;

/// Marker for a window that reserves nothing: a live window can never end
/// at block zero.
const RSV_NOT_ALLOCATED: u32 = 0;

/// A per-inode reservation interval, inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReserveWindow {
    pub start: u32,
    pub end: u32,
}

impl ReserveWindow {
    pub const EMPTY: Self = Self {
        start: RSV_NOT_ALLOCATED,
        end: RSV_NOT_ALLOCATED,
    };

    pub fn is_empty(&self) -> bool {
        self.end == RSV_NOT_ALLOCATED
    }

    pub fn contains(&self, block: u32) -> bool {
        !self.is_empty() && self.start <= block && block <= self.end
    }
}

/// Block-allocator state embedded in each in-memory inode.
#[derive(Clone, Debug)]
pub struct BlockAllocInfo {
    pub window: ReserveWindow,
    /// Preferred window width for the next reservation.
    pub goal_size: u32,
    /// Blocks consumed from the current window.
    pub alloc_hit: u32,
    /// Logical block of the most recent allocation, for goal heuristics.
    pub last_alloc_logical: u32,
    /// Physical block of the most recent allocation.
    pub last_alloc_physical: u32,
}

impl BlockAllocInfo {
    pub fn new() -> Self {
        Self {
            window: ReserveWindow::EMPTY,
            goal_size: DEFAULT_RESERVE_BLOCKS,
            alloc_hit: 0,
            last_alloc_logical: 0,
            last_alloc_physical: 0,
        }
    }
}

impl Default for BlockAllocInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// The filesystem-wide window index, ordered by window start. A sentinel at
/// block zero is present for the lifetime of the mount; block zero is always
/// part of the superblock area and never allocatable, so the sentinel can
/// never collide with a live window.
pub struct RsvTree {
    map: BTreeMap<u32, u32>,
}

impl RsvTree {
    pub fn new() -> Self {
        let mut map = BTreeMap::new();
        map.insert(RSV_NOT_ALLOCATED, RSV_NOT_ALLOCATED);
        Self { map }
    }

    fn insert(&mut self, window: ReserveWindow) {
        self.map.insert(window.start, window.end);
    }

    fn remove(&mut self, window: &ReserveWindow) {
        if !window.is_empty() {
            self.map.remove(&window.start);
        }
    }

    /// Start of the neighbouring window after `start`, if any.
    fn next_window_start(&self, start: u32) -> Option<u32> {
        self.map
            .range(start.saturating_add(1)..)
            .next()
            .map(|(&s, _)| s)
    }

    /// Finds the lowest gap of `size` free-of-reservation blocks beginning
    /// at or after `from`. The caller's own window must already be out of
    /// the tree. Returns the gap start; the gap may run past `last_block`
    /// (a window is allowed to cross its group's end), but may not begin
    /// past it.
    fn find_gap(&self, from: u32, size: u32, last_block: u32) -> Option<u32> {
        let mut cur = from;
        if let Some((_, &end)) = self.map.range(..=cur).next_back() {
            if cur <= end {
                cur = end + 1;
            }
        }
        for (&start, &end) in self.map.range(cur..) {
            if cur > last_block {
                return None;
            }
            if cur + size <= start {
                return Some(cur);
            }
            cur = end + 1;
        }
        (cur <= last_block).then_some(cur)
    }

    /// Live window count, sentinel excluded.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len() - 1
    }
}

impl Default for RsvTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads and sanity-checks a group's block bitmap: the bits covering the
/// bitmap blocks themselves and the inode table must be set on a healthy
/// volume.
pub fn read_block_bitmap(fs: &Ext2Fs, group: u32) -> Ext2Result<Buffer> {
    let desc = fs.groups.read(group);
    let buf = fs.cache.get(desc.bg_block_bitmap.get())?;
    let first = fs.sb.group_first_block(group);
    {
        let data = buf.data();
        let in_use = |blk: u32| bitmap::test_bit(&data, blk - first);
        let table = desc.bg_inode_table.get();
        let table_ok = (0..fs.sb.itb_per_group).all(|i| in_use(table + i));
        if !in_use(desc.bg_block_bitmap.get()) || !in_use(desc.bg_inode_bitmap.get()) || !table_ok
        {
            drop(data);
            fs.report_corruption(format_args!("group {group} has an invalid block bitmap"));
            return Err(Error::Corrupted);
        }
    }
    Ok(buf)
}

/// Attempts to take up to `*count` consecutive bits from `group`'s bitmap,
/// starting at the group-relative `grp_goal` (or anywhere when `None`),
/// clipped to `window` when one is active. Returns the group-relative first
/// bit on success and updates `*count` to the run length.
fn try_to_allocate(
    fs: &Ext2Fs,
    group: u32,
    bitmap_buf: &Buffer,
    mut grp_goal: Option<u32>,
    count: &mut u32,
    window: Option<&ReserveWindow>,
) -> Option<u32> {
    let group_first = fs.sb.group_first_block(group);
    let group_blocks = fs.sb.blocks_in_group(group);

    let (mut start, end) = match window {
        Some(rsv) => {
            // Clip the window to this group; it may cross either boundary.
            if rsv.is_empty() || rsv.end < group_first {
                return None;
            }
            let start = rsv.start.saturating_sub(group_first);
            let end = (rsv.end - group_first + 1).min(group_blocks);
            if start >= end {
                return None;
            }
            match grp_goal {
                Some(g) if start <= g && g < end => (g, end),
                _ => {
                    grp_goal = None;
                    (start, end)
                }
            }
        }
        None => (grp_goal.unwrap_or(0), group_blocks),
    };

    let mut num = 0u32;
    loop {
        let goal = match grp_goal {
            Some(g) => g,
            None => {
                let found = {
                    let data = bitmap_buf.data();
                    bitmap::find_next_usable(&data, Some(start), end)
                }?;
                let mut found = found;
                if window.is_none() {
                    // Pull the allocation back over up to seven free
                    // predecessors so small files cluster.
                    let data = bitmap_buf.data();
                    let mut steps = 0;
                    while steps < 7 && start < found && !bitmap::test_bit(&data, found - 1) {
                        found -= 1;
                        steps += 1;
                    }
                }
                found
            }
        };

        start = goal;
        let mut cur = goal;

        // Bit acquisition proper, under the per-group lock.
        let _group = fs.groups.lock(group);
        let mut data = bitmap_buf.data_mut();
        if bitmap::set_bit(&mut data, cur) {
            // Lost the race for this bit: advance and retry the search.
            drop(data);
            drop(_group);
            start = cur + 1;
            grp_goal = None;
            if start >= end {
                *count = num;
                return None;
            }
            continue;
        }
        num += 1;
        cur += 1;
        // Extend the run greedily while neighbouring bits stay free.
        while num < *count && cur < end && !bitmap::set_bit(&mut data, cur) {
            num += 1;
            cur += 1;
        }
        *count = num;
        return Some(cur - num);
    }
}

/// Books a fresh reservation window for `alloc` near the group-relative
/// goal, confirming against the bitmap that the window holds at least one
/// free block. Fails without a window when the group (and the tree) have no
/// reservable room.
fn alloc_new_reservation(
    fs: &Ext2Fs,
    alloc: &mut BlockAllocInfo,
    grp_goal: Option<u32>,
    group: u32,
    bitmap_buf: &Buffer,
) -> CanFail<()> {
    let group_first = fs.sb.group_first_block(group);
    let group_end = group_first + fs.sb.blocks_in_group(group) - 1;
    let mut start_block = group_first + grp_goal.unwrap_or(0);

    let mut size = alloc.goal_size;
    if !alloc.window.is_empty() {
        // An old window crossing into the next group still holds usable
        // blocks there; keep it and let the caller carry on in that group.
        if alloc.window.start <= group_end
            && group_end < alloc.window.end
            && alloc.window.start <= start_block
        {
            return Err(());
        }
        if alloc.alloc_hit > (alloc.window.end - alloc.window.start + 1) / 2 {
            // More than half the previous window was consumed: double the
            // next one, up to the cap.
            size = (size * 2).min(MAX_RESERVE_BLOCKS);
            alloc.goal_size = size;
        }
    }

    loop {
        let booked = {
            let mut tree = fs.rsv.lock();
            tree.remove(&alloc.window);
            match tree.find_gap(start_block, size, group_end) {
                Some(cur) => {
                    alloc.window = ReserveWindow {
                        start: cur,
                        end: cur + size - 1,
                    };
                    alloc.alloc_hit = 0;
                    tree.insert(alloc.window);
                    true
                }
                None => {
                    alloc.window = ReserveWindow::EMPTY;
                    alloc.alloc_hit = 0;
                    false
                }
            }
        };
        if !booked {
            return Err(());
        }

        // The tree gave us unreserved room; make sure the disk actually has
        // a free bit inside it before keeping the booking.
        let first_free = {
            let data = bitmap_buf.data();
            let from = alloc.window.start - group_first;
            let found = bitmap::find_next_zero(&data, from, group_end - group_first + 1);
            (found < group_end - group_first + 1).then_some(found)
        };
        let Some(first_free) = first_free else {
            let mut tree = fs.rsv.lock();
            tree.remove(&alloc.window);
            alloc.window = ReserveWindow::EMPTY;
            alloc.alloc_hit = 0;
            return Err(());
        };

        let first_free_block = group_first + first_free;
        if alloc.window.contains(first_free_block) {
            return Ok(());
        }
        // First free bit sits past the proposed window: shift the search
        // there and book again.
        start_block = first_free_block;
    }
}

/// Widens the window by up to `extra` blocks into the gap before its
/// successor, when the reservation lock is free to take.
fn try_to_extend_reservation(fs: &Ext2Fs, alloc: &mut BlockAllocInfo, extra: u32) {
    let Some(mut tree) = fs.rsv.try_lock() else {
        return;
    };
    let new_end = match tree.next_window_start(alloc.window.start) {
        Some(next_start) if next_start <= alloc.window.end + extra => next_start - 1,
        _ => alloc.window.end + extra,
    };
    if new_end > alloc.window.end {
        alloc.window.end = new_end;
        tree.insert(alloc.window);
    }
}

/// One group's worth of reservation-guided allocation: ensure a usable
/// window around the goal, then take bits inside it.
fn try_to_allocate_with_rsv(
    fs: &Ext2Fs,
    group: u32,
    bitmap_buf: &Buffer,
    mut grp_goal: Option<u32>,
    alloc: Option<&mut BlockAllocInfo>,
    count: &mut u32,
) -> Option<u32> {
    let Some(alloc) = alloc else {
        return try_to_allocate(fs, group, bitmap_buf, grp_goal, count, None);
    };

    let group_first = fs.sb.group_first_block(group);
    let group_end = group_first + fs.sb.blocks_in_group(group) - 1;
    let goal_in_window = |w: &ReserveWindow, goal: Option<u32>| -> bool {
        if w.start > group_end || w.end < group_first {
            return false;
        }
        match goal {
            Some(g) => w.contains(group_first + g),
            None => true,
        }
    };

    let mut failed_last = false;
    loop {
        if alloc.window.is_empty() || failed_last || !goal_in_window(&alloc.window, grp_goal) {
            if alloc.goal_size < *count {
                alloc.goal_size = *count;
            }
            if alloc_new_reservation(fs, alloc, grp_goal, group, bitmap_buf).is_err() {
                return None;
            }
            if !goal_in_window(&alloc.window, grp_goal) {
                grp_goal = None;
            }
        } else if let Some(g) = grp_goal {
            let remaining = alloc.window.end - (group_first + g) + 1;
            if remaining < *count {
                try_to_extend_reservation(fs, alloc, *count - remaining);
            }
        }

        let mut num = *count;
        let window = alloc.window;
        if let Some(first) = try_to_allocate(fs, group, bitmap_buf, grp_goal, &mut num, Some(&window))
        {
            alloc.alloc_hit += num;
            *count = num;
            return Some(first);
        }
        failed_last = true;
    }
}

/// Allocates up to `count` consecutive blocks near `goal` for `inode`.
/// Returns the first block and the run length actually obtained, which may
/// be shorter than requested.
pub fn new_blocks(
    fs: &Ext2Fs,
    inode: &Inode,
    goal: u32,
    count: u32,
    cred: Cred,
) -> Ext2Result<(u32, u32)> {
    if count == 0 {
        return Err(Error::Invalid);
    }
    if fs.sb.is_read_only() {
        return Err(Error::ReadOnly);
    }
    if !fs.sb.has_free_blocks(cred.uid, cred.gid) {
        return Err(Error::NoSpace);
    }

    // Lazily attach reservation state: regular files only, and only while
    // the mount keeps reservations on.
    if fs.sb.opts.reservation && inode.state().is_reg() {
        let mut slot = inode.alloc.lock();
        if slot.is_none() {
            *slot = Some(BlockAllocInfo::new());
        }
    }

    let mut alloc_guard = inode.alloc.lock();
    // A zero goal width turns reservations off for this file.
    let mut use_rsv = matches!(&*alloc_guard, Some(a) if a.goal_size > 0);

    let goal = if goal < fs.sb.first_data_block || goal >= fs.sb.blocks_count {
        fs.sb.first_data_block
    } else {
        goal
    };
    let goal_group = (goal - fs.sb.first_data_block) / fs.sb.blocks_per_group;

    loop {
        let windowsz = alloc_guard
            .as_ref()
            .map(|a| a.goal_size)
            .unwrap_or(0);

        // Target group first.
        let mut group = goal_group;
        let mut result = None;

        let free_blocks = u32::from(fs.groups.read(group).bg_free_blocks_count.get());
        if use_rsv && free_blocks < windowsz {
            if let Some(a) = alloc_guard.as_ref() {
                // Not enough room for a fresh window here; fall back to
                // plain allocation for this call if no window exists yet.
                if a.window.is_empty() {
                    use_rsv = false;
                }
            }
        }
        if free_blocks > 0 {
            let grp_target = (goal - fs.sb.first_data_block) % fs.sb.blocks_per_group;
            let bitmap_buf = read_block_bitmap(fs, group)?;
            let mut num = count;
            let rsv = if use_rsv { alloc_guard.as_mut() } else { None };
            if let Some(first) =
                try_to_allocate_with_rsv(fs, group, &bitmap_buf, Some(grp_target), rsv, &mut num)
            {
                result = Some((group, bitmap_buf, first, num));
            }
        }

        // Then every other group, skipping those too full to host the
        // window.
        if result.is_none() {
            for _ in 0..fs.sb.groups_count {
                group += 1;
                if group >= fs.sb.groups_count {
                    group = 0;
                }
                let free_blocks = u32::from(fs.groups.read(group).bg_free_blocks_count.get());
                if use_rsv && free_blocks <= windowsz / 2 {
                    continue;
                }
                if free_blocks == 0 {
                    continue;
                }
                let bitmap_buf = read_block_bitmap(fs, group)?;
                let mut num = count;
                let rsv = if use_rsv { alloc_guard.as_mut() } else { None };
                if let Some(first) =
                    try_to_allocate_with_rsv(fs, group, &bitmap_buf, None, rsv, &mut num)
                {
                    result = Some((group, bitmap_buf, first, num));
                    break;
                }
            }
        }

        let Some((group, bitmap_buf, grp_alloc, num)) = result else {
            if use_rsv {
                // The volume may only be full of reservations; retry once
                // ignoring windows entirely.
                use_rsv = false;
                continue;
            }
            return Err(Error::NoSpace);
        };

        let first_block = fs.sb.group_first_block(group) + grp_alloc;

        // Bug guard: a run overlapping the group's own metadata means the
        // bitmap lied. Leave the bits set for fsck, report, and search on.
        let desc = fs.groups.read(group);
        let in_run = |blk: u32, len: u32| {
            blk + len > first_block && blk < first_block + num
        };
        if in_run(desc.bg_block_bitmap.get(), 1)
            || in_run(desc.bg_inode_bitmap.get(), 1)
            || in_run(desc.bg_inode_table.get(), fs.sb.itb_per_group)
        {
            fs.report_corruption(format_args!(
                "allocating blocks in system zone: run {first_block}..{}",
                first_block + num
            ));
            continue;
        }

        if first_block + num - 1 >= fs.sb.blocks_count {
            fs.report_corruption(format_args!(
                "allocated run {first_block}+{num} beyond blocks count {}",
                fs.sb.blocks_count
            ));
            return Err(Error::Corrupted);
        }

        debug!(target: "ext2",
            "allocated {num} block(s) at {first_block} from group {group} for inode {}",
            inode.ino);

        fs.groups.update(group, &fs.cache, |desc| {
            let cur = desc.bg_free_blocks_count.get();
            desc.bg_free_blocks_count.set(cur - num as u16);
        })?;
        fs.sb.add_free_blocks(-(i64::from(num)));
        bitmap_buf.mark_dirty();
        fs.cache.flush_if_sync(&bitmap_buf)?;

        if let Some(a) = alloc_guard.as_mut() {
            a.last_alloc_physical = first_block + num - 1;
        }

        // Storage accounting: `i_blocks` counts 512-byte sectors, charged
        // here and refunded in free_blocks.
        inode.state_mut().blocks_512 += num * (fs.sb.block_size / 512);
        inode.mark_dirty();

        return Ok((first_block, num));
    }
}

/// Returns `count` blocks starting at `block` to the free pool. Bits
/// already clear are reported and skipped; the run may span group
/// boundaries.
pub fn free_blocks(fs: &Ext2Fs, inode: &Inode, block: u32, count: u32) -> CanFail<Error> {
    if count == 0 {
        return Ok(());
    }
    if block < fs.sb.first_data_block
        || block + count < block
        || block + count > fs.sb.blocks_count
    {
        fs.report_corruption(format_args!(
            "freeing blocks outside the data area: {block}+{count}"
        ));
        return Err(Error::Corrupted);
    }

    let mut block = block;
    let mut remaining = count;
    while remaining > 0 {
        let group = (block - fs.sb.first_data_block) / fs.sb.blocks_per_group;
        let bit = (block - fs.sb.first_data_block) % fs.sb.blocks_per_group;
        let in_group = remaining.min(fs.sb.blocks_per_group - bit);

        let bitmap_buf = read_block_bitmap(fs, group)?;
        let mut freed = 0u32;
        {
            let _group = fs.groups.lock(group);
            let mut data = bitmap_buf.data_mut();
            for i in 0..in_group {
                if !bitmap::clear_bit(&mut data, bit + i) {
                    warn!(target: "ext2",
                        "bit already cleared for block {} (inode {})",
                        block + i, inode.ino);
                } else {
                    freed += 1;
                }
            }
        }
        if freed > 0 {
            fs.groups.update(group, &fs.cache, |desc| {
                let cur = desc.bg_free_blocks_count.get();
                desc.bg_free_blocks_count.set(cur + freed as u16);
            })?;
            fs.sb.add_free_blocks(i64::from(freed));
            let mut state = inode.state_mut();
            state.blocks_512 = state
                .blocks_512
                .saturating_sub(freed * (fs.sb.block_size / 512));
            drop(state);
            inode.mark_dirty();
        }
        bitmap_buf.mark_dirty();
        fs.cache.flush_if_sync(&bitmap_buf)?;

        block += in_group;
        remaining -= in_group;
    }
    Ok(())
}

/// Drops the inode's reservation window, if any. Called on last close, on
/// truncation to zero, and on eviction.
pub fn discard_reservation(fs: &Ext2Fs, inode: &Inode) {
    let mut slot = inode.alloc.lock();
    if let Some(alloc) = slot.as_mut() {
        if !alloc.window.is_empty() {
            let mut tree = fs.rsv.lock();
            tree.remove(&alloc.window);
            alloc.window = ReserveWindow::EMPTY;
            alloc.alloc_hit = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_semantics() {
        assert!(ReserveWindow::EMPTY.is_empty());
        assert!(!ReserveWindow::EMPTY.contains(0));
        let w = ReserveWindow { start: 10, end: 17 };
        assert!(w.contains(10) && w.contains(17) && !w.contains(18));
    }

    #[test]
    fn gap_search_respects_existing_windows() {
        let mut tree = RsvTree::new();
        tree.insert(ReserveWindow { start: 100, end: 107 });
        tree.insert(ReserveWindow { start: 120, end: 139 });

        // Room right at the goal.
        assert_eq!(tree.find_gap(50, 8, 1000), Some(50));
        // Goal inside a window: pushed past its end.
        assert_eq!(tree.find_gap(103, 8, 1000), Some(108));
        // Gap between the windows too small for 16 blocks.
        assert_eq!(tree.find_gap(108, 16, 1000), Some(140));
        // Past the last window everything is free.
        assert_eq!(tree.find_gap(500, 64, 1000), Some(500));
        // Beyond the search limit.
        assert_eq!(tree.find_gap(1001, 8, 1000), None);
        // A window may begin at the limit and run past it.
        assert_eq!(tree.find_gap(1000, 64, 1000), Some(1000));
    }

    #[test]
    fn gap_search_with_only_sentinel() {
        let tree = RsvTree::new();
        assert_eq!(tree.find_gap(1, 8, 100), Some(1));
        // The sentinel occupies block zero.
        assert_eq!(tree.find_gap(0, 8, 100), Some(1));
    }

    #[test]
    fn remove_ignores_empty_windows() {
        let mut tree = RsvTree::new();
        assert_eq!(tree.len(), 0);
        tree.remove(&ReserveWindow::EMPTY);
        let w = ReserveWindow { start: 30, end: 37 };
        tree.insert(w);
        assert_eq!(tree.len(), 1);
        tree.remove(&w);
        assert_eq!(tree.len(), 0);
        // The sentinel survives every removal.
        assert_eq!(tree.find_gap(0, 4, 50), Some(1));
    }

    #[test]
    fn successor_lookup() {
        let mut tree = RsvTree::new();
        tree.insert(ReserveWindow { start: 64, end: 71 });
        assert_eq!(tree.next_window_start(0), Some(64));
        assert_eq!(tree.next_window_start(64), None);
    }
}
