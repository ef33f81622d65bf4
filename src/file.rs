//! Positional file I/O over the block map, size changes, and symlink
//! payloads.
//!
//! Reads serve holes as zeros; writes map missing blocks on demand and
//! zero-fill fresh allocations around the written range. Size changes
//! follow ext2 `setattr` semantics: shrinking zeroes the tail of the new
//! last block and tears the block tree down, extending just moves the size
//! and leaves a hole.

use crate::blkmap;
use crate::error::{CanFail, Error, Ext2Result};
use crate::fs::{Cred, Ext2Fs};
use crate::inode::{self, Inode, SYMLINK_INLINE_MAX};

/// Reads up to `buf.len()` bytes at byte `offset`, clipped to the file
/// size. Returns the byte count actually read.
pub fn read_at(fs: &Ext2Fs, inode: &Inode, offset: u64, buf: &mut [u8]) -> Ext2Result<usize> {
    let size = inode.state().size;
    if offset >= size {
        return Ok(0);
    }
    let block_size = u64::from(fs.sb.block_size);
    let end = size.min(offset + buf.len() as u64);
    let mut pos = offset;

    while pos < end {
        let i_block = (pos >> fs.sb.block_size_bits) as u32;
        let in_block = (pos % block_size) as usize;
        let chunk = ((end - pos) as usize).min(fs.sb.block_size as usize - in_block);
        let want_blocks = ((end - pos + block_size - 1) >> fs.sb.block_size_bits) as u32;

        match blkmap::get_blocks(fs, inode, i_block, want_blocks, false, Cred::ROOT)? {
            Some(mapping) => {
                // Copy out of each block of the contiguous run that the
                // request still covers.
                let mut copied = 0usize;
                let mut blk = mapping.first;
                let mut in_blk = in_block;
                let run_end =
                    ((u64::from(i_block + mapping.count) * block_size).min(end) - pos) as usize;
                while copied < run_end {
                    let buf_blk = fs.cache.get(blk)?;
                    let data = buf_blk.data();
                    let take = (run_end - copied).min(fs.sb.block_size as usize - in_blk);
                    let dst = (pos - offset) as usize + copied;
                    buf[dst..dst + take].copy_from_slice(&data[in_blk..in_blk + take]);
                    copied += take;
                    in_blk = 0;
                    blk += 1;
                }
                pos += copied as u64;
            }
            None => {
                // A hole reads as zeros.
                let dst = (pos - offset) as usize;
                buf[dst..dst + chunk].fill(0);
                pos += chunk as u64;
            }
        }
    }
    Ok((end - offset) as usize)
}

/// Writes `data` at byte `offset`, allocating blocks as needed and growing
/// the file size. Returns the byte count written.
pub fn write_at(
    fs: &Ext2Fs,
    inode: &Inode,
    offset: u64,
    data: &[u8],
    cred: Cred,
) -> Ext2Result<usize> {
    if fs.sb.is_read_only() {
        return Err(Error::ReadOnly);
    }
    inode.check_mutable()?;
    if data.is_empty() {
        return Ok(0);
    }
    let max = inode::max_file_size(fs.sb.block_size);
    if offset >= max {
        return Err(Error::TooBig);
    }
    let end = (offset + data.len() as u64).min(max);
    let block_size = u64::from(fs.sb.block_size);
    let mut pos = offset;

    while pos < end {
        let i_block = (pos >> fs.sb.block_size_bits) as u32;
        let in_block = (pos % block_size) as usize;
        let want_blocks = ((end - pos + block_size - 1) >> fs.sb.block_size_bits) as u32;

        let mapping = blkmap::get_blocks(fs, inode, i_block, want_blocks, true, cred)?
            .ok_or(Error::Io)?;

        let mut blk = mapping.first;
        let mut in_blk = in_block;
        let run_end = ((u64::from(i_block + mapping.count) * block_size).min(end) - pos) as usize;
        let mut copied = 0usize;
        while copied < run_end {
            // A freshly allocated block skips the device read; anything it
            // held before is dead, and the parts we don't overwrite must
            // read back as zeros.
            let buf_blk = if mapping.new {
                fs.cache.get_zeroed(blk)?
            } else {
                fs.cache.get(blk)?
            };
            {
                let mut dst = buf_blk.data_mut();
                let take = (run_end - copied).min(fs.sb.block_size as usize - in_blk);
                let src = (pos - offset) as usize + copied;
                dst[in_blk..in_blk + take].copy_from_slice(&data[src..src + take]);
                copied += take;
            }
            buf_blk.mark_dirty();
            fs.cache.flush_if_sync(&buf_blk)?;
            in_blk = 0;
            blk += 1;
        }
        pos += copied as u64;
    }

    let now = fs.clock.now();
    {
        let mut state = inode.state_mut();
        if end > state.size {
            state.size = end;
        }
        state.mtime = now;
        state.ctime = now;
    }
    inode.mark_dirty();
    Ok((end - offset) as usize)
}

/// Zeroes the tail of the block containing byte `from`, so a shrunken file
/// cannot resurrect old bytes past its new end.
fn zero_block_tail(fs: &Ext2Fs, inode: &Inode, from: u64) -> CanFail<Error> {
    let block_size = u64::from(fs.sb.block_size);
    let in_block = (from % block_size) as usize;
    if in_block == 0 {
        return Ok(());
    }
    let i_block = (from >> fs.sb.block_size_bits) as u32;
    if let Some(mapping) = blkmap::get_blocks(fs, inode, i_block, 1, false, Cred::ROOT)? {
        let buf = fs.cache.get(mapping.first)?;
        buf.data_mut()[in_block..].fill(0);
        buf.mark_dirty();
        fs.cache.flush_if_sync(&buf)?;
    }
    Ok(())
}

/// Changes a regular file's size, per `setattr`. Shrinking releases the
/// block tree beyond the cutoff; growing leaves a hole.
pub fn set_size(fs: &Ext2Fs, inode: &Inode, new_size: u64) -> CanFail<Error> {
    if fs.sb.is_read_only() {
        return Err(Error::ReadOnly);
    }
    inode.check_mutable()?;
    {
        let state = inode.state();
        if !(state.is_reg() || state.is_dir() || state.is_symlink()) {
            return Err(Error::Invalid);
        }
    }
    if inode.is_fast_symlink(fs) {
        return Err(Error::Invalid);
    }
    if new_size > inode::max_file_size(fs.sb.block_size) {
        return Err(Error::TooBig);
    }

    let old_size = inode.state().size;
    if new_size < old_size {
        zero_block_tail(fs, inode, new_size)?;
        blkmap::truncate_blocks(fs, inode, new_size)?;
    }
    let now = fs.clock.now();
    {
        let mut state = inode.state_mut();
        state.size = new_size;
        state.mtime = now;
        state.ctime = now;
    }
    inode.mark_dirty();
    Ok(())
}

/// Stores a symlink target: inline in `i_block` when it fits, else in the
/// link's single data block.
pub fn set_symlink(fs: &Ext2Fs, inode: &Inode, target: &[u8], cred: Cred) -> CanFail<Error> {
    if target.is_empty() || target.len() > fs.sb.block_size as usize {
        return Err(Error::Invalid);
    }
    if target.len() < SYMLINK_INLINE_MAX {
        // Fast symlink: the bytes live in the i_block slots. Packing them
        // little-endian round-trips bit-exactly through the on-disk record.
        let mut blocks = inode.blocks_mut();
        let mut bytes = [0u8; SYMLINK_INLINE_MAX];
        bytes[..target.len()].copy_from_slice(target);
        for (slot, chunk) in blocks.iter_mut().zip(bytes.chunks_exact(4)) {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    } else {
        let mapping = blkmap::get_blocks(fs, inode, 0, 1, true, cred)?.ok_or(Error::Io)?;
        let buf = fs.cache.get_zeroed(mapping.first)?;
        buf.data_mut()[..target.len()].copy_from_slice(target);
        buf.mark_dirty();
        fs.cache.flush_if_sync(&buf)?;
    }
    inode.state_mut().size = target.len() as u64;
    inode.mark_dirty();
    Ok(())
}

/// Reads a symlink target into `buf`, serving both inline and block-backed
/// targets. Returns the target length.
pub fn read_link(fs: &Ext2Fs, inode: &Inode, buf: &mut [u8]) -> Ext2Result<usize> {
    if !inode.state().is_symlink() {
        return Err(Error::Invalid);
    }
    let len = inode.state().size as usize;
    if len > fs.sb.block_size as usize {
        fs.report_corruption(format_args!("symlink {} longer than a block", inode.ino));
        return Err(Error::Corrupted);
    }
    let take = len.min(buf.len());
    if inode.is_fast_symlink(fs) {
        let blocks = inode.blocks();
        let mut bytes = [0u8; SYMLINK_INLINE_MAX];
        for (chunk, slot) in bytes.chunks_exact_mut(4).zip(blocks.iter()) {
            chunk.copy_from_slice(&slot.to_le_bytes());
        }
        buf[..take].copy_from_slice(&bytes[..take]);
    } else {
        let mapping =
            blkmap::get_blocks(fs, inode, 0, 1, false, Cred::ROOT)?.ok_or(Error::Corrupted)?;
        let blk = fs.cache.get(mapping.first)?;
        buf[..take].copy_from_slice(&blk.data()[..take]);
    }
    Ok(take)
}
