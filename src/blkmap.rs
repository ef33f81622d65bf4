//! Logical-to-physical block mapping.
//!
//! An inode addresses its data through `i_block`: twelve direct slots, then
//! one single-, one double- and one triple-indirect tree. A lookup walks a
//! chain of up to four `(slot, key)` links; the first zero key marks the
//! "partial" point where a new branch must be grown and spliced in.
//!
//! Chain walks run under the inode's metadata read lock and re-verify the
//! snapshot against the live slots; a mismatch surfaces as [`Error::Again`]
//! and the operation re-drives itself. Growing a mapping takes the
//! truncate mutex, so creation and truncation of the same inode never
//! interleave.

use alloc::vec::Vec;

use crate::balloc;
use crate::device::Buffer;
use crate::error::{CanFail, Error, Ext2Result};
use crate::fs::{Cred, Ext2Fs};
use crate::inode::{Inode, DIND_BLOCK, DIRECT_BLOCKS, IND_BLOCK, N_BLOCKS, TIND_BLOCK};

/// Where a chain link's slot lives: directly in `i_block`, or at a slot
/// index inside an indirect block.
#[derive(Clone)]
enum SlotLoc {
    Inode(usize),
    Block(Buffer, usize),
}

/// One link of the indirect chain: the slot location and the key (block
/// number) read from it.
#[derive(Clone)]
struct Indirect {
    key: u32,
    loc: SlotLoc,
}

fn slot_from_buffer(buf: &Buffer, slot: usize) -> u32 {
    let data = buf.data();
    let off = slot * 4;
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn store_slot(buf: &Buffer, slot: usize, value: u32) {
    let mut data = buf.data_mut();
    let off = slot * 4;
    data[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

impl Indirect {
    /// Re-reads the live slot value; `blocks` is the caller's metadata-lock
    /// guard over `i_block`.
    fn live_value(&self, blocks: &[u32; N_BLOCKS]) -> u32 {
        match &self.loc {
            SlotLoc::Inode(idx) => blocks[*idx],
            SlotLoc::Block(buf, slot) => slot_from_buffer(buf, *slot),
        }
    }
}

/// Every link still matches the snapshot taken when the chain was walked.
fn verify_chain(chain: &[Indirect], blocks: &[u32; N_BLOCKS]) -> bool {
    chain.iter().all(|ind| ind.live_value(blocks) == ind.key)
}

/// Classifies a logical block into the direct/indirect regions and fills
/// the per-level slot offsets. Returns `(offsets, depth, boundary)` where
/// `boundary` counts how many more logical blocks share the final-level
/// block after this one.
pub fn block_to_path(fs: &Ext2Fs, i_block: u32) -> Ext2Result<([usize; 4], usize, u32)> {
    let ptrs = fs.sb.addr_per_block;
    let ptrs_bits = ptrs.trailing_zeros();
    let direct = DIRECT_BLOCKS as u32;
    let indirect = ptrs;
    let double = ptrs * ptrs;

    let mut offsets = [0usize; 4];
    let (depth, final_offset) = if i_block < direct {
        offsets[0] = i_block as usize;
        (1, i_block)
    } else if i_block - direct < indirect {
        let rel = i_block - direct;
        offsets[0] = IND_BLOCK;
        offsets[1] = rel as usize;
        (2, rel)
    } else if i_block - direct - indirect < double {
        let rel = i_block - direct - indirect;
        offsets[0] = DIND_BLOCK;
        offsets[1] = (rel >> ptrs_bits) as usize;
        offsets[2] = (rel & (ptrs - 1)) as usize;
        (3, rel & (ptrs - 1))
    } else if (i_block - direct - indirect - double) >> (2 * ptrs_bits) < ptrs {
        let rel = i_block - direct - indirect - double;
        offsets[0] = TIND_BLOCK;
        offsets[1] = (rel >> (2 * ptrs_bits)) as usize;
        offsets[2] = ((rel >> ptrs_bits) & (ptrs - 1)) as usize;
        offsets[3] = (rel & (ptrs - 1)) as usize;
        (4, rel & (ptrs - 1))
    } else {
        return Err(Error::TooBig);
    };

    let boundary = if depth == 1 {
        direct - 1 - final_offset
    } else {
        ptrs - 1 - final_offset
    };
    Ok((offsets, depth, boundary))
}

/// Validates a block number read out of a slot before following it.
fn check_key(fs: &Ext2Fs, key: u32) -> Ext2Result<u32> {
    if key < fs.sb.first_data_block || key >= fs.sb.blocks_count {
        fs.report_corruption(format_args!("indirect chain points at block {key}"));
        return Err(Error::Corrupted);
    }
    Ok(key)
}

/// Walks the chain for `offsets[..depth]`, stopping at the first missing
/// link. Returns the chain and `Some(level)` of the first zero slot, or
/// `None` when the mapping is complete. [`Error::Again`] means the chain
/// moved underneath the walk.
fn get_branch(
    fs: &Ext2Fs,
    inode: &Inode,
    depth: usize,
    offsets: &[usize; 4],
) -> Ext2Result<(Vec<Indirect>, Option<usize>)> {
    let mut chain: Vec<Indirect> = Vec::with_capacity(4);
    let key = {
        let blocks = inode.blocks();
        blocks[offsets[0]]
    };
    chain.push(Indirect {
        key,
        loc: SlotLoc::Inode(offsets[0]),
    });
    if key == 0 {
        return Ok((chain, Some(0)));
    }

    for level in 1..depth {
        let parent_key = chain[level - 1].key;
        let buf = fs.cache.get(check_key(fs, parent_key)?)?;
        let key = {
            let blocks = inode.blocks();
            if !verify_chain(&chain, &blocks) {
                return Err(Error::Again);
            }
            slot_from_buffer(&buf, offsets[level])
        };
        chain.push(Indirect {
            key,
            loc: SlotLoc::Block(buf, offsets[level]),
        });
        if key == 0 {
            return Ok((chain, Some(level)));
        }
    }
    Ok((chain, None))
}

/// Goal block for a new branch: the nearest preceding non-empty slot in the
/// partial link's container, else the container block itself, else a
/// deterministic colour inside the inode's home group.
fn find_near(fs: &Ext2Fs, inode: &Inode, partial: &Indirect) -> u32 {
    match &partial.loc {
        SlotLoc::Inode(idx) => {
            let blocks = inode.blocks();
            for slot in (0..*idx).rev() {
                if blocks[slot] != 0 {
                    return blocks[slot];
                }
            }
        }
        SlotLoc::Block(buf, idx) => {
            for slot in (0..*idx).rev() {
                let v = slot_from_buffer(buf, slot);
                if v != 0 {
                    return v;
                }
            }
            return buf.block();
        }
    }
    // Nothing nearby: spread inodes across their home group by a colour
    // keyed on the inode number.
    let bg_start = fs.sb.group_first_block(inode.block_group);
    let colour = (inode.ino.0 % 16) * (fs.sb.blocks_per_group / 16);
    bg_start + colour
}

fn find_goal(fs: &Ext2Fs, inode: &Inode, i_block: u32, partial: &Indirect) -> u32 {
    {
        let alloc = inode.alloc.lock();
        if let Some(info) = alloc.as_ref() {
            if info.last_alloc_physical != 0 && i_block == info.last_alloc_logical + 1 {
                return info.last_alloc_physical + 1;
            }
        }
    }
    find_near(fs, inode, partial)
}

/// How many data blocks to ask for in one go: when indirect blocks are also
/// missing just clip the request to the leaf boundary, otherwise extend
/// while the following leaf slots are holes.
fn blks_to_allocate(
    partial: &Indirect,
    inode: &Inode,
    indirect_blks: usize,
    wanted: u32,
    boundary: u32,
) -> u32 {
    if indirect_blks > 0 {
        return wanted.min(boundary + 1);
    }
    let mut count = 1;
    while count < wanted && count <= boundary {
        let next = match &partial.loc {
            SlotLoc::Inode(idx) => {
                let blocks = inode.blocks();
                let slot = idx + count as usize;
                if slot >= DIRECT_BLOCKS {
                    break;
                }
                blocks[slot]
            }
            SlotLoc::Block(buf, idx) => slot_from_buffer(buf, idx + count as usize),
        };
        if next != 0 {
            break;
        }
        count += 1;
    }
    count
}

/// Obtains `indirect_blks` metadata blocks plus up to `blks` data blocks.
/// The data blocks are the contiguous tail of the final allocation; on any
/// failure everything obtained so far is released.
fn alloc_blocks(
    fs: &Ext2Fs,
    inode: &Inode,
    goal: u32,
    indirect_blks: usize,
    blks: u32,
    cred: Cred,
) -> Ext2Result<([u32; 4], u32)> {
    let mut new_blocks = [0u32; 4];
    let mut index = 0usize;
    let mut target = blks + indirect_blks as u32;
    let (first_data, data_count);

    loop {
        let (mut current, mut got) = match balloc::new_blocks(fs, inode, goal, target, cred) {
            Ok(r) => r,
            Err(e) => {
                for blk in &new_blocks[..index] {
                    let _ = balloc::free_blocks(fs, inode, *blk, 1);
                }
                return Err(e);
            }
        };
        target -= got;
        while index < indirect_blks && got > 0 {
            new_blocks[index] = current;
            index += 1;
            current += 1;
            got -= 1;
        }
        if got > 0 {
            first_data = current;
            data_count = got;
            break;
        }
    }
    new_blocks[index] = first_data;
    Ok((new_blocks, data_count))
}

/// Builds the missing branch: fresh zeroed indirect buffers chained
/// together, with the leaf level carrying the new data block numbers. The
/// branch stays detached until [`splice_branch`] publishes it.
fn alloc_branch(
    fs: &Ext2Fs,
    inode: &Inode,
    chain: &mut Vec<Indirect>,
    offsets: &[usize; 4],
    partial_level: usize,
    indirect_blks: usize,
    blks: u32,
    goal: u32,
    cred: Cred,
) -> Ext2Result<u32> {
    let (new_blocks, num) = alloc_blocks(fs, inode, goal, indirect_blks, blks, cred)?;

    let release_on_error = || {
        // Roll everything back: the branch was never reachable.
        for (i, blk) in new_blocks[..=indirect_blks].iter().enumerate() {
            fs.cache.forget(*blk);
            let run = if i == indirect_blks { num } else { 1 };
            let _ = balloc::free_blocks(fs, inode, *blk, run);
        }
    };

    chain[partial_level].key = new_blocks[0];
    for n in 1..=indirect_blks {
        let buf = match fs.cache.get_zeroed(new_blocks[n - 1]) {
            Ok(buf) => buf,
            Err(e) => {
                release_on_error();
                return Err(e);
            }
        };
        let slot = offsets[partial_level + n];
        store_slot(&buf, slot, new_blocks[n]);
        if n == indirect_blks {
            // The leaf indirect block takes the whole data run.
            let mut current = new_blocks[n];
            for i in 1..num {
                current += 1;
                store_slot(&buf, slot + i as usize, current);
            }
        }
        buf.mark_dirty();
        if let Err(e) = fs.cache.flush_if_sync(&buf) {
            release_on_error();
            return Err(e);
        }
        chain.push(Indirect {
            key: new_blocks[n],
            loc: SlotLoc::Block(buf, slot),
        });
    }
    Ok(num)
}

/// Publishes a freshly built branch by writing its first key into the
/// partial slot. When no indirect block was needed and several data blocks
/// were obtained, the consecutive keys land in the neighbouring slots of
/// the same container.
fn splice_branch(
    fs: &Ext2Fs,
    inode: &Inode,
    i_block: u32,
    chain: &[Indirect],
    partial_level: usize,
    indirect_blks: usize,
    blks: u32,
) -> CanFail<Error> {
    let partial = &chain[partial_level];
    match &partial.loc {
        SlotLoc::Inode(idx) => {
            let mut blocks = inode.blocks_mut();
            blocks[*idx] = partial.key;
            if indirect_blks == 0 && blks > 1 {
                for i in 1..blks as usize {
                    blocks[idx + i] = partial.key + i as u32;
                }
            }
        }
        SlotLoc::Block(buf, idx) => {
            store_slot(buf, *idx, partial.key);
            if indirect_blks == 0 && blks > 1 {
                for i in 1..blks as usize {
                    store_slot(buf, idx + i, partial.key + i as u32);
                }
            }
            buf.mark_dirty();
            fs.cache.flush_if_sync(buf)?;
        }
    }

    {
        let mut alloc = inode.alloc.lock();
        if let Some(info) = alloc.as_mut() {
            info.last_alloc_logical = i_block + blks - 1;
            info.last_alloc_physical = chain[partial_level + indirect_blks].key + blks - 1;
        }
    }
    let now = fs.clock.now();
    inode.state_mut().ctime = now;
    inode.mark_dirty();
    Ok(())
}

/// A resolved run of contiguous physical blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Physical block backing the requested logical block.
    pub first: u32,
    /// Contiguous blocks resolved, starting at `first`.
    pub count: u32,
    /// The run was allocated by this call; its on-disk contents are stale.
    pub new: bool,
}

/// Maps logical block `i_block` of `inode` to physical storage, resolving
/// up to `max_blocks` contiguous blocks in one call.
///
/// Without `create`, a hole maps to `None`. With `create`, the missing part
/// of the branch is allocated, spliced in, and the fresh mapping returned;
/// chain races re-drive internally.
pub fn get_blocks(
    fs: &Ext2Fs,
    inode: &Inode,
    i_block: u32,
    max_blocks: u32,
    create: bool,
    cred: Cred,
) -> Ext2Result<Option<Mapping>> {
    let (offsets, depth, boundary) = block_to_path(fs, i_block)?;

    loop {
        let (chain, partial) = match get_branch(fs, inode, depth, &offsets) {
            Ok(r) => r,
            Err(Error::Again) => continue,
            Err(e) => return Err(e),
        };

        let Some(partial_level) = partial else {
            // Fully mapped: extend greedily along the leaf while the slot
            // values stay consecutive, re-validating the snapshot.
            let first_block = chain[depth - 1].key;
            let mut count = 1u32;
            let blocks = inode.blocks();
            if !verify_chain(&chain, &blocks) {
                drop(blocks);
                continue;
            }
            let leaf = &chain[depth - 1];
            while count < max_blocks && count <= boundary {
                let next = match &leaf.loc {
                    SlotLoc::Inode(idx) => blocks[idx + count as usize],
                    SlotLoc::Block(buf, idx) => slot_from_buffer(buf, idx + count as usize),
                };
                if next != first_block + count {
                    break;
                }
                count += 1;
            }
            return Ok(Some(Mapping {
                first: first_block,
                count,
                new: false,
            }));
        };

        if !create {
            return Ok(None);
        }

        // Serialize against truncation, then look again: someone may have
        // completed the branch while we were unlocked.
        let _truncate = inode.truncate_lock();
        let (mut chain, partial) = match get_branch(fs, inode, depth, &offsets) {
            Ok(r) => r,
            Err(Error::Again) => continue,
            Err(e) => return Err(e),
        };
        if partial.is_none() {
            drop(_truncate);
            continue;
        }

        let partial_level = chain.len() - 1;
        let indirect_blks = depth - partial_level - 1;
        let wanted = blks_to_allocate(
            &chain[partial_level],
            inode,
            indirect_blks,
            max_blocks,
            boundary,
        );
        let goal = find_goal(fs, inode, i_block, &chain[partial_level]);
        let num = alloc_branch(
            fs,
            inode,
            &mut chain,
            &offsets,
            partial_level,
            indirect_blks,
            wanted,
            goal,
            cred,
        )?;
        splice_branch(fs, inode, i_block, &chain, partial_level, indirect_blks, num)?;
        let first = chain[partial_level + indirect_blks].key;
        return Ok(Some(Mapping {
            first,
            count: num,
            new: true,
        }));
    }
}

/// Zeroes the slot range and frees the named blocks, batching contiguous
/// runs into single calls.
fn free_data(fs: &Ext2Fs, inode: &Inode, slots: &mut [u32]) {
    let mut run_start = 0u32;
    let mut run_len = 0u32;
    for slot in slots.iter_mut() {
        let nr = *slot;
        if nr == 0 {
            continue;
        }
        *slot = 0;
        if run_len == 0 {
            run_start = nr;
            run_len = 1;
        } else if nr == run_start + run_len {
            run_len += 1;
        } else {
            let _ = balloc::free_blocks(fs, inode, run_start, run_len);
            inode.mark_dirty();
            run_start = nr;
            run_len = 1;
        }
    }
    if run_len > 0 {
        let _ = balloc::free_blocks(fs, inode, run_start, run_len);
        inode.mark_dirty();
    }
}

/// Frees every branch rooted in the slot range, depth-first: children
/// before the indirect block that names them.
fn free_branches(fs: &Ext2Fs, inode: &Inode, roots: &[u32], depth: usize) {
    if depth == 0 {
        let mut slots: Vec<u32> = roots.to_vec();
        free_data(fs, inode, &mut slots);
        return;
    }
    for &nr in roots {
        if nr == 0 {
            continue;
        }
        let Ok(buf) = fs.cache.get(nr) else {
            fs.report_corruption(format_args!("unreadable indirect block {nr}"));
            continue;
        };
        let per = fs.sb.addr_per_block as usize;
        let children: Vec<u32> = (0..per).map(|i| slot_from_buffer(&buf, i)).collect();
        free_branches(fs, inode, &children, depth - 1);
        fs.cache.forget(nr);
        let _ = balloc::free_blocks(fs, inode, nr, 1);
        inode.mark_dirty();
    }
}

/// Result of detaching the partially shared branch at the truncation
/// cutoff.
struct SharedBranch {
    /// Chain levels that survive, deepest last.
    chain: Vec<Indirect>,
    /// Root of the detached subtree hanging below the cutoff, zero if the
    /// cutoff did not detach one.
    top: u32,
    /// First slot to clear at the deepest surviving level.
    first_free_slot: usize,
}

/// Finds the deepest chain level that survives truncation at `offsets` and
/// atomically detaches everything below it, taking the metadata write lock
/// for the single moment the shared top is cut.
fn find_shared(
    fs: &Ext2Fs,
    inode: &Inode,
    depth: usize,
    offsets: &[usize; 4],
) -> Ext2Result<SharedBranch> {
    // Collapse trailing zero offsets: a cutoff at the very start of a level
    // kills the whole branch one level up.
    let mut k = depth;
    while k > 1 && offsets[k - 1] == 0 {
        k -= 1;
    }

    let (mut chain, partial) = match get_branch(fs, inode, k, offsets) {
        Ok(r) => r,
        // Nothing newer can appear under the truncate mutex; a mismatch
        // here means the walk itself raced a reader, so just re-walk.
        Err(Error::Again) => get_branch(fs, inode, k, offsets)?,
        Err(e) => return Err(e),
    };
    let partial_level = partial.unwrap_or(k - 1);

    let mut blocks = inode.blocks_mut();
    let live = chain[partial_level].live_value(&blocks);
    if chain[partial_level].key == 0 && live != 0 {
        // The branch grew since the walk; the new top is not ours to free.
        drop(blocks);
        chain.truncate(partial_level + 1);
        let first_free_slot = match &chain[partial_level].loc {
            SlotLoc::Inode(idx) | SlotLoc::Block(_, idx) => idx + 1,
        };
        return Ok(SharedBranch {
            chain,
            top: 0,
            first_free_slot,
        });
    }

    // Walk up while every slot before ours in the container is zero: those
    // levels become empty once we cut, so the cut moves up.
    let mut p = partial_level;
    while p > 0 {
        let empty_before = match &chain[p].loc {
            SlotLoc::Inode(idx) => (0..*idx).all(|i| blocks[i] == 0),
            SlotLoc::Block(buf, idx) => (0..*idx).all(|i| slot_from_buffer(buf, i) == 0),
        };
        if !empty_before {
            break;
        }
        p -= 1;
    }

    let (top, first_free_slot);
    if p == k - 1 && p > 0 {
        // The doomed range lives wholly inside this indirect block, which
        // itself survives: no detach needed, just widen the sweep to
        // include our slot.
        top = 0;
        first_free_slot = match &chain[p].loc {
            SlotLoc::Inode(idx) | SlotLoc::Block(_, idx) => *idx,
        };
    } else {
        // Cut the branch at level p under the metadata write lock.
        match &chain[p].loc {
            SlotLoc::Inode(idx) => {
                top = blocks[*idx];
                blocks[*idx] = 0;
            }
            SlotLoc::Block(buf, idx) => {
                top = slot_from_buffer(buf, *idx);
                store_slot(buf, *idx, 0);
                buf.mark_dirty();
            }
        }
        first_free_slot = match &chain[p].loc {
            SlotLoc::Inode(idx) | SlotLoc::Block(_, idx) => idx + 1,
        };
    }
    drop(blocks);
    chain.truncate(p + 1);
    Ok(SharedBranch {
        chain,
        top,
        first_free_slot,
    })
}

/// Frees every block of `inode` at or beyond byte `offset`, indirect
/// blocks included. Runs with the truncate mutex held for the whole sweep.
///
/// Only regular files, directories and slow symlinks own a block tree; for
/// everything else `i_block` carries other payload (an inline link target,
/// a device number) and must not be walked.
pub fn truncate_blocks(fs: &Ext2Fs, inode: &Inode, offset: u64) -> CanFail<Error> {
    let has_block_tree = {
        let state = inode.state();
        state.is_reg() || state.is_dir() || state.is_symlink()
    };
    if !has_block_tree || inode.is_fast_symlink(fs) {
        return Ok(());
    }

    let block_size = u64::from(fs.sb.block_size);
    let i_block = (offset + block_size - 1) >> fs.sb.block_size_bits;
    let i_block = match u32::try_from(i_block) {
        Ok(b) => b,
        Err(_) => return Ok(()),
    };

    let (offsets, depth, _) = match block_to_path(fs, i_block) {
        Ok(r) => r,
        // Past the addressable range nothing can be mapped.
        Err(Error::TooBig) => return Ok(()),
        Err(e) => return Err(e),
    };

    let _truncate = inode.truncate_lock();

    if depth == 1 {
        let mut doomed = {
            let mut blocks = inode.blocks_mut();
            let mut doomed = [0u32; DIRECT_BLOCKS];
            for (i, slot) in blocks[offsets[0]..DIRECT_BLOCKS].iter_mut().enumerate() {
                doomed[i] = *slot;
                *slot = 0;
            }
            doomed
        };
        free_data(fs, inode, &mut doomed[..DIRECT_BLOCKS - offsets[0]]);
    } else {
        let shared = find_shared(fs, inode, depth, &offsets)?;
        if shared.top != 0 {
            let sub_depth = (depth - 1) - (shared.chain.len() - 1);
            match shared.chain.last() {
                Some(Indirect {
                    loc: SlotLoc::Block(buf, _),
                    ..
                }) => buf.mark_dirty(),
                _ => inode.mark_dirty(),
            }
            free_branches(fs, inode, &[shared.top], sub_depth);
        }
        // Clear the tails of the surviving indirect blocks along the
        // branch, bottom-up.
        let mut level = shared.chain.len() - 1;
        let mut first_slot = shared.first_free_slot;
        while level > 0 {
            if let SlotLoc::Block(buf, _) = &shared.chain[level].loc {
                let per = fs.sb.addr_per_block as usize;
                let roots: Vec<u32> =
                    (first_slot..per).map(|i| slot_from_buffer(buf, i)).collect();
                free_branches(fs, inode, &roots, (depth - 1) - level);
                for slot in first_slot..per {
                    store_slot(buf, slot, 0);
                }
                buf.mark_dirty();
            }
            level -= 1;
            first_slot = match &shared.chain[level].loc {
                SlotLoc::Inode(idx) | SlotLoc::Block(_, idx) => idx + 1,
            };
        }
    }

    // Kill the untouched whole subtrees above the cutoff's own region.
    let kill_from = match offsets[0] {
        idx if idx < IND_BLOCK => IND_BLOCK,
        IND_BLOCK => DIND_BLOCK,
        DIND_BLOCK => TIND_BLOCK,
        _ => N_BLOCKS,
    };
    for slot in kill_from..N_BLOCKS {
        let nr = {
            let mut blocks = inode.blocks_mut();
            let nr = blocks[slot];
            blocks[slot] = 0;
            nr
        };
        if nr != 0 {
            inode.mark_dirty();
            free_branches(fs, inode, &[nr], slot - DIRECT_BLOCKS + 1);
        }
    }

    balloc::discard_reservation(fs, inode);
    let now = fs.clock.now();
    {
        let mut state = inode.state_mut();
        state.mtime = now;
        state.ctime = now;
    }
    inode.mark_dirty();
    Ok(())
}

#[cfg(test)]
mod tests {
    // Path classification is pure arithmetic over the superblock geometry;
    // exercised here against the 1 KiB layout the scenarios use (256 slots
    // per indirect block). End-to-end mapping and truncation are covered by
    // the filesystem tests.
    use super::*;

    // Mirrors block_to_path with addr_per_block fixed at 256, avoiding a
    // full mount.
    fn classify(i_block: u32) -> ([usize; 4], usize, u32) {
        let ptrs = 256u32;
        let direct = DIRECT_BLOCKS as u32;
        if i_block < direct {
            ([i_block as usize, 0, 0, 0], 1, direct - 1 - i_block)
        } else if i_block - direct < ptrs {
            let rel = i_block - direct;
            ([IND_BLOCK, rel as usize, 0, 0], 2, ptrs - 1 - rel)
        } else if i_block - direct - ptrs < ptrs * ptrs {
            let rel = i_block - direct - ptrs;
            (
                [DIND_BLOCK, (rel / ptrs) as usize, (rel % ptrs) as usize, 0],
                3,
                ptrs - 1 - rel % ptrs,
            )
        } else {
            let rel = i_block - direct - ptrs - ptrs * ptrs;
            (
                [
                    TIND_BLOCK,
                    (rel / (ptrs * ptrs)) as usize,
                    (rel / ptrs % ptrs) as usize,
                    (rel % ptrs) as usize,
                ],
                4,
                ptrs - 1 - rel % ptrs,
            )
        }
    }

    #[test]
    fn region_boundaries() {
        assert_eq!(classify(0), ([0, 0, 0, 0], 1, 11));
        assert_eq!(classify(11), ([11, 0, 0, 0], 1, 0));
        // First block past the direct region opens the single indirect.
        assert_eq!(classify(12), ([12, 0, 0, 0], 2, 255));
        assert_eq!(classify(12 + 255), ([12, 255, 0, 0], 2, 0));
        assert_eq!(classify(12 + 256), ([13, 0, 0, 0], 3, 255));
        assert_eq!(classify(12 + 256 + 256 * 256), ([14, 0, 0, 0], 4, 255));
    }
}
