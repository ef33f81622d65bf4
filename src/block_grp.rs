//! Block group descriptors.
//!
//! One 32-byte descriptor per group locates the group's block bitmap, inode
//! bitmap and inode table, and carries the free-block / free-inode /
//! used-directory counts. The location fields are stable for the lifetime of
//! the mount; the counts mutate under the per-group lock, and every counter
//! update dirties the descriptor's table buffer in the same critical
//! section.

use alloc::vec::Vec;

use bytemuck::{Pod, Zeroable};
use log::error;
use spin::{Mutex, MutexGuard};

use crate::device::BufferCache;
use crate::error::{Error, Ext2Result};
use crate::layout::{Le16, Le32};
use crate::sb::SuperState;

/// Size of one on-disk group descriptor.
pub const DESC_SIZE: usize = 32;

/// The on-disk block group descriptor.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GroupDescriptor {
    /// Block number of the group's block bitmap.
    pub bg_block_bitmap: Le32,
    /// Block number of the group's inode bitmap.
    pub bg_inode_bitmap: Le32,
    /// First block of the group's inode table.
    pub bg_inode_table: Le32,
    /// Free blocks in the group.
    pub bg_free_blocks_count: Le16,
    /// Free inodes in the group.
    pub bg_free_inodes_count: Le16,
    /// Inodes allocated to directories in the group.
    pub bg_used_dirs_count: Le16,
    bg_pad: Le16,
    bg_reserved: [u8; 12],
}

/// Whether `group` carries a superblock + descriptor-table copy.
///
/// Without `SPARSE_SUPER` every group does; with it, only groups 0, 1 and
/// the powers of 3, 5 and 7.
pub fn group_has_super(sparse_super: bool, group: u32) -> bool {
    if !sparse_super || group <= 1 {
        return true;
    }
    test_root(group, 3) || test_root(group, 5) || test_root(group, 7)
}

fn test_root(group: u32, base: u32) -> bool {
    let mut n = base;
    while n < group {
        n = match n.checked_mul(base) {
            Some(n) => n,
            None => return false,
        };
    }
    n == group
}

/// Location of one group's descriptor on disk.
#[derive(Clone, Copy, Debug)]
struct DescLocation {
    /// Descriptor-table block holding the record.
    table_block: u32,
    /// Byte offset of the record inside that block.
    offset: usize,
}

/// Computes where group `group`'s descriptor lives, honouring `META_BG`
/// placement for meta block groups past `s_first_meta_bg`.
fn descriptor_location(state: &SuperState, group: u32) -> DescLocation {
    let dpb = state.desc_per_block;
    let first_meta_bg = state.with_raw(|raw| raw.s_first_meta_bg.get());
    if state.meta_bg && group >= first_meta_bg * dpb {
        // The descriptor block for a meta group sits at the front of the
        // meta group's first group, right after its superblock copy when
        // present.
        let base_group = group / dpb * dpb;
        let mut blk = state.group_first_block(base_group);
        if group_has_super(state.sparse_super, base_group) {
            blk += 1;
        }
        DescLocation {
            table_block: blk,
            offset: (group % dpb) as usize * DESC_SIZE,
        }
    } else {
        let table_start = state.first_data_block + 1;
        DescLocation {
            table_block: table_start + group / dpb,
            offset: (group % dpb) as usize * DESC_SIZE,
        }
    }
}

struct GroupSlot {
    /// Host copy of the descriptor; the mutex doubles as the per-group lock
    /// serializing bitmap mutation.
    desc: Mutex<GroupDescriptor>,
    location: DescLocation,
}

/// The full descriptor table, one slot per group.
pub struct BlockGroups {
    groups: Vec<GroupSlot>,
}

impl BlockGroups {
    /// Reads and validates every descriptor. A descriptor whose bitmap or
    /// inode-table blocks fall outside its group is corruption.
    pub fn load(state: &SuperState, cache: &BufferCache) -> Ext2Result<Self> {
        let mut groups = Vec::with_capacity(state.groups_count as usize);
        for group in 0..state.groups_count {
            let location = descriptor_location(state, group);
            let buf = cache.get(location.table_block)?;
            let desc: GroupDescriptor = {
                let data = buf.data();
                bytemuck::pod_read_unaligned(&data[location.offset..location.offset + DESC_SIZE])
            };

            let first = state.group_first_block(group);
            let last = first + state.blocks_in_group(group);
            let in_group = |blk: u32| first <= blk && blk < last;
            if !in_group(desc.bg_block_bitmap.get())
                || !in_group(desc.bg_inode_bitmap.get())
                || !in_group(desc.bg_inode_table.get())
                || !in_group(desc.bg_inode_table.get() + state.itb_per_group - 1)
            {
                error!(target: "ext2",
                    "group {group} descriptor points outside the group \
                     (bitmap {}, inode bitmap {}, table {})",
                    desc.bg_block_bitmap.get(),
                    desc.bg_inode_bitmap.get(),
                    desc.bg_inode_table.get());
                return Err(Error::Corrupted);
            }

            groups.push(GroupSlot {
                desc: Mutex::new(desc),
                location,
            });
        }
        Ok(Self { groups })
    }

    pub fn count(&self) -> u32 {
        self.groups.len() as u32
    }

    /// Takes the per-group lock and returns the guarded descriptor. Callers
    /// that mutate counts must go through [`BlockGroups::update`] instead so
    /// the table buffer is dirtied alongside.
    pub fn lock(&self, group: u32) -> MutexGuard<'_, GroupDescriptor> {
        self.groups[group as usize].desc.lock()
    }

    /// Snapshot of a descriptor, for the lock-free read paths (the location
    /// fields never change while mounted; the counts are advisory).
    pub fn read(&self, group: u32) -> GroupDescriptor {
        *self.groups[group as usize].desc.lock()
    }

    /// Mutates the descriptor under the per-group lock and writes the
    /// record through to its table buffer, dirtying both together.
    pub fn update<T>(
        &self,
        group: u32,
        cache: &BufferCache,
        f: impl FnOnce(&mut GroupDescriptor) -> T,
    ) -> Ext2Result<T> {
        let slot = &self.groups[group as usize];
        let mut desc = slot.desc.lock();
        let ret = f(&mut desc);

        let buf = cache.get(slot.location.table_block)?;
        {
            let mut data = buf.data_mut();
            let off = slot.location.offset;
            data[off..off + DESC_SIZE].copy_from_slice(bytemuck::bytes_of(&*desc));
        }
        buf.mark_dirty();
        cache.flush_if_sync(&buf)?;
        Ok(ret)
    }

    /// Aggregates `(free blocks, free inodes, used dirs)` across all groups,
    /// as the mount sequence does to seed the superblock counters.
    pub fn aggregate_counts(&self) -> (u64, u64, u64) {
        let mut free_blocks = 0u64;
        let mut free_inodes = 0u64;
        let mut used_dirs = 0u64;
        for slot in &self.groups {
            let desc = slot.desc.lock();
            free_blocks += u64::from(desc.bg_free_blocks_count.get());
            free_inodes += u64::from(desc.bg_free_inodes_count.get());
            used_dirs += u64::from(desc.bg_used_dirs_count.get());
        }
        (free_blocks, free_inodes, used_dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_is_32_bytes() {
        assert_eq!(core::mem::size_of::<GroupDescriptor>(), DESC_SIZE);
    }

    #[test]
    fn sparse_super_placement() {
        // Groups 0, 1 and powers of 3, 5, 7 carry copies.
        let with: Vec<u32> = (0..50).filter(|&g| group_has_super(true, g)).collect();
        assert_eq!(with, [0, 1, 3, 5, 7, 9, 25, 27, 49]);
        // Without the feature, every group does.
        assert!((0..50).all(|g| group_has_super(false, g)));
    }
}
