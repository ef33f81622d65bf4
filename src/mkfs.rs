//! Volume formatter.
//!
//! Lays down a dynamic-revision ext2 filesystem: superblock (with sparse
//! backups), group descriptor tables, bitmaps, zeroed inode tables, the
//! reserved inodes and a root directory. The result mounts under this
//! crate and under any other ext2 implementation.

use alloc::sync::Arc;
use alloc::vec;

use bytemuck::Zeroable;
use log::debug;

use crate::bitmap;
use crate::block_grp::{group_has_super, GroupDescriptor, DESC_SIZE};
use crate::device::BlockDevice;
use crate::dir::rec_len_needed;
use crate::error::{CanFail, Error};
use crate::inode::{InodeNo, RawInode, S_IFDIR};
use crate::layout::Le32;
use crate::sb::{
    IncompatFeatures, RoCompatFeatures, Superblock, ERRORS_CONTINUE, EXT2_MAGIC, REV_DYNAMIC,
    STATE_VALID_FS, SUPERBLOCK_OFFSET,
};

/// Formatting knobs; the defaults match a small mke2fs run.
#[derive(Clone, Debug)]
pub struct FormatOptions {
    /// Block size in bytes: 1024, 2048 or 4096.
    pub block_size: u32,
    /// Inodes per group; derived from the volume size when `None`.
    pub inodes_per_group: Option<u32>,
    /// Percent of blocks reserved for the privileged user.
    pub reserved_percent: u32,
    /// Place superblock/descriptor copies only in sparse groups.
    pub sparse_super: bool,
    /// Write the file-type byte in directory records.
    pub filetype: bool,
    /// Volume UUID; callers wanting uniqueness supply their own bytes.
    pub uuid: [u8; 16],
    /// Volume label.
    pub label: [u8; 16],
    /// Timestamp recorded as the format and root-inode time.
    pub timestamp: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            inodes_per_group: None,
            reserved_percent: 5,
            sparse_super: true,
            filetype: true,
            uuid: [0; 16],
            label: [0; 16],
            timestamp: 0,
        }
    }
}

/// Computed placement shared by the format passes.
struct Layout {
    block_size: u32,
    blocks_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    groups: u32,
    itb_per_group: u32,
    gdt_blocks: u32,
}

impl Layout {
    fn group_first_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group
    }

    fn blocks_in_group(&self, group: u32) -> u32 {
        if group == self.groups - 1 {
            self.blocks_count - self.group_first_block(group)
        } else {
            self.blocks_per_group
        }
    }

    /// Metadata blocks at the head of `group`, in order: optional
    /// superblock + descriptor copies, block bitmap, inode bitmap, inode
    /// table.
    fn group_meta(&self, group: u32, sparse: bool) -> (u32, u32, u32, u32) {
        let mut blk = self.group_first_block(group);
        if group_has_super(sparse, group) {
            blk += 1 + self.gdt_blocks;
        }
        let block_bitmap = blk;
        let inode_bitmap = blk + 1;
        let inode_table = blk + 2;
        (block_bitmap, inode_bitmap, inode_table, blk + 2 + self.itb_per_group)
    }
}

fn write_block(dev: &Arc<dyn BlockDevice>, layout: &Layout, blk: u32, data: &[u8]) -> CanFail<Error> {
    dev.write_at(u64::from(blk) * u64::from(layout.block_size), data)
}

/// Formats the device. Destroys whatever the volume held.
pub fn format(dev: &Arc<dyn BlockDevice>, opts: &FormatOptions) -> CanFail<Error> {
    if !matches!(opts.block_size, 1024 | 2048 | 4096) {
        return Err(Error::Invalid);
    }
    let block_size = opts.block_size;
    let blocks_count = u32::try_from(dev.size_bytes() / u64::from(block_size))
        .map_err(|_| Error::TooBig)?;
    let first_data_block = if block_size == 1024 { 1 } else { 0 };
    let blocks_per_group = block_size * 8;
    let groups = (blocks_count - first_data_block).div_ceil(blocks_per_group);
    if groups == 0 {
        return Err(Error::Invalid);
    }

    let inode_size = 128u32;
    let inodes_per_block = block_size / inode_size;
    let inodes_per_group = opts
        .inodes_per_group
        .unwrap_or_else(|| (blocks_count / groups / 4).max(inodes_per_block))
        .next_multiple_of(inodes_per_block)
        .min(block_size * 8);
    let itb_per_group = (inodes_per_group * inode_size).div_ceil(block_size);
    let desc_per_block = block_size / DESC_SIZE as u32;
    let gdt_blocks = groups.div_ceil(desc_per_block);

    let layout = Layout {
        block_size,
        blocks_count,
        first_data_block,
        blocks_per_group,
        groups,
        itb_per_group,
        gdt_blocks,
    };

    // The smallest volume still needs group 0's metadata plus the root
    // directory block.
    let (_, _, _, first_data) = layout.group_meta(0, opts.sparse_super);
    let root_block = first_data;
    if root_block >= blocks_count {
        return Err(Error::Invalid);
    }

    // Pass 1: per-group bitmaps, inode tables and descriptors.
    let mut descs = vec![GroupDescriptor::zeroed(); groups as usize];
    let mut total_free_blocks = 0u32;
    for group in 0..groups {
        let (block_bitmap, inode_bitmap, inode_table, data_start) =
            layout.group_meta(group, opts.sparse_super);
        let group_first = layout.group_first_block(group);
        let group_blocks = layout.blocks_in_group(group);
        if data_start > group_first + group_blocks {
            // The trailing group is too short to hold its own metadata.
            return Err(Error::Invalid);
        }

        // Block bitmap: metadata head in use, data free, the tail beyond
        // the volume end padded as allocated.
        let mut bmap = vec![0u8; block_size as usize];
        for blk in group_first..data_start {
            bitmap::set_bit(&mut bmap, blk - group_first);
        }
        if group == 0 {
            bitmap::set_bit(&mut bmap, root_block - group_first);
        }
        for bit in group_blocks..blocks_per_group {
            bitmap::set_bit(&mut bmap, bit);
        }
        let mut free_blocks = bitmap::count_free(&bmap, blocks_per_group);
        // The remainder group may be shorter than its bitmap.
        free_blocks = free_blocks.min(group_blocks);
        write_block(dev, &layout, block_bitmap, &bmap)?;

        // Inode bitmap: the reserved inodes live in group 0; pad the tail
        // past inodes_per_group.
        let mut imap = vec![0u8; block_size as usize];
        let mut used_inodes = 0u32;
        if group == 0 {
            for bit in 0..(InodeNo::ROOT.0 + 8) {
                bitmap::set_bit(&mut imap, bit);
            }
            used_inodes = InodeNo::ROOT.0 + 8;
        }
        for bit in inodes_per_group..block_size * 8 {
            bitmap::set_bit(&mut imap, bit);
        }
        write_block(dev, &layout, inode_bitmap, &imap)?;

        // Zeroed inode table.
        let zero = vec![0u8; block_size as usize];
        for i in 0..itb_per_group {
            write_block(dev, &layout, inode_table + i, &zero)?;
        }

        let desc = &mut descs[group as usize];
        desc.bg_block_bitmap.set(block_bitmap);
        desc.bg_inode_bitmap.set(inode_bitmap);
        desc.bg_inode_table.set(inode_table);
        desc.bg_free_blocks_count.set(free_blocks as u16);
        desc.bg_free_inodes_count
            .set((inodes_per_group - used_inodes) as u16);
        desc.bg_used_dirs_count.set(if group == 0 { 1 } else { 0 });
        total_free_blocks += free_blocks;
    }

    // Pass 2: root directory block and inode.
    let mut root_data = vec![0u8; block_size as usize];
    {
        let dot_len = rec_len_needed(1);
        root_data[0..4].copy_from_slice(&InodeNo::ROOT.0.to_le_bytes());
        root_data[4..6].copy_from_slice(&(dot_len as u16).to_le_bytes());
        root_data[6] = 1;
        root_data[7] = if opts.filetype { 2 } else { 0 };
        root_data[8] = b'.';

        let rest = block_size as usize - dot_len;
        let off = dot_len;
        root_data[off..off + 4].copy_from_slice(&InodeNo::ROOT.0.to_le_bytes());
        root_data[off + 4..off + 6].copy_from_slice(&(rest as u16).to_le_bytes());
        root_data[off + 6] = 2;
        root_data[off + 7] = if opts.filetype { 2 } else { 0 };
        root_data[off + 8] = b'.';
        root_data[off + 9] = b'.';
    }
    write_block(dev, &layout, root_block, &root_data)?;

    let mut root = RawInode::zeroed();
    root.i_mode.set(S_IFDIR | 0o755);
    root.i_size.set(block_size);
    root.i_atime.set(opts.timestamp);
    root.i_ctime.set(opts.timestamp);
    root.i_mtime.set(opts.timestamp);
    root.i_links_count.set(2);
    root.i_blocks.set(block_size / 512);
    root.i_block[0] = Le32::new(root_block);
    let (_, _, table0, _) = layout.group_meta(0, opts.sparse_super);
    let root_slot = u64::from(table0) * u64::from(block_size)
        + u64::from(InodeNo::ROOT.0 - 1) * u64::from(inode_size);
    dev.write_at(root_slot, bytemuck::bytes_of(&root))?;

    // Pass 3: descriptor tables and superblocks wherever a copy belongs.
    let mut gdt = vec![0u8; (gdt_blocks * block_size) as usize];
    for (i, desc) in descs.iter().enumerate() {
        gdt[i * DESC_SIZE..(i + 1) * DESC_SIZE].copy_from_slice(bytemuck::bytes_of(desc));
    }

    let total_inodes = inodes_per_group * groups;
    let reserved = blocks_count * opts.reserved_percent / 100;
    let mut sb = Superblock::zeroed();
    sb.s_inodes_count.set(total_inodes);
    sb.s_blocks_count.set(blocks_count);
    sb.s_r_blocks_count.set(reserved);
    sb.s_free_blocks_count.set(total_free_blocks);
    sb.s_free_inodes_count
        .set(total_inodes - (InodeNo::ROOT.0 + 8));
    sb.s_first_data_block.set(first_data_block);
    sb.s_log_block_size.set(block_size.trailing_zeros() - 10);
    sb.s_log_frag_size.set(block_size.trailing_zeros() - 10);
    sb.s_blocks_per_group.set(blocks_per_group);
    sb.s_frags_per_group.set(blocks_per_group);
    sb.s_inodes_per_group.set(inodes_per_group);
    sb.s_wtime.set(opts.timestamp);
    sb.s_max_mnt_count.set(u16::MAX);
    sb.s_magic.set(EXT2_MAGIC);
    sb.s_state.set(STATE_VALID_FS);
    sb.s_errors.set(ERRORS_CONTINUE);
    sb.s_lastcheck.set(opts.timestamp);
    sb.s_rev_level.set(REV_DYNAMIC);
    sb.s_first_ino.set(11);
    sb.s_inode_size.set(inode_size as u16);
    if opts.filetype {
        sb.s_feature_incompat.set(IncompatFeatures::FILETYPE.bits());
    }
    if opts.sparse_super {
        sb.s_feature_ro_compat
            .set(RoCompatFeatures::SPARSE_SUPER.bits());
    }
    sb.s_uuid = opts.uuid;
    sb.s_volume_name = opts.label;

    for group in 0..groups {
        if !group_has_super(opts.sparse_super, group) {
            continue;
        }
        let first = layout.group_first_block(group);
        if group == 0 {
            dev.write_at(SUPERBLOCK_OFFSET, bytemuck::bytes_of(&sb))?;
        } else {
            let mut copy = sb;
            copy.s_block_group_nr.set(group as u16);
            write_block(dev, &layout, first, bytemuck::bytes_of(&copy))?;
        }
        let gdt_start = first + 1;
        for i in 0..gdt_blocks {
            let off = (i * block_size) as usize;
            write_block(
                dev,
                &layout,
                gdt_start + i,
                &gdt[off..off + block_size as usize],
            )?;
        }
    }

    debug!(target: "ext2",
        "formatted {blocks_count} blocks in {groups} group(s), {total_inodes} inodes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    #[test]
    fn rejects_odd_block_sizes() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(1 << 20));
        let opts = FormatOptions {
            block_size: 512,
            ..Default::default()
        };
        assert_eq!(format(&dev, &opts), Err(Error::Invalid));
    }

    #[test]
    fn superblock_lands_at_1024() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(4 << 20));
        format(&dev, &FormatOptions::default()).unwrap();
        let mut magic = [0u8; 2];
        dev.read_at(1024 + 56, &mut magic).unwrap();
        assert_eq!(magic, [0x53, 0xef]);
    }
}
