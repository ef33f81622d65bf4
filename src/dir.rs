//! The directory entry engine.
//!
//! A directory's data is a sequence of blocks, each packed with
//! variable-length records: `inode (4), rec_len (2), name_len (1),
//! file_type (1), name`. Records never straddle a block boundary, the last
//! record of every block runs to the block end, and a record with inode
//! zero is a hole that later insertions may reclaim. The first block opens
//! with `.` and `..` at fixed offsets.
//!
//! Every scan re-validates the records it walks; a zero `rec_len` or a
//! record leaking past its block aborts the operation through the mount's
//! errors policy.

use alloc::vec::Vec;

use crate::blkmap;
use crate::device::Buffer;
use crate::error::{CanFail, Error, Ext2Result};
use crate::fs::{Cred, Ext2Fs};
use crate::inode::{FileType, Inode, InodeNo};

/// Longest permitted entry name.
pub const MAX_NAME_LEN: usize = 255;

/// Fixed header bytes before the name.
const HEADER_LEN: usize = 8;

/// Bytes a record with an `len`-byte name occupies, 4-byte aligned.
pub fn rec_len_needed(len: usize) -> usize {
    (HEADER_LEN + len + 3) & !3
}

/// `file_type` byte values.
const FT_UNKNOWN: u8 = 0;
const FT_REG_FILE: u8 = 1;
const FT_DIR: u8 = 2;
const FT_CHRDEV: u8 = 3;
const FT_BLKDEV: u8 = 4;
const FT_FIFO: u8 = 5;
const FT_SOCK: u8 = 6;
const FT_SYMLINK: u8 = 7;

fn type_to_byte(file_type: Option<FileType>) -> u8 {
    match file_type {
        Some(FileType::Regular) => FT_REG_FILE,
        Some(FileType::Directory) => FT_DIR,
        Some(FileType::CharDevice) => FT_CHRDEV,
        Some(FileType::BlockDevice) => FT_BLKDEV,
        Some(FileType::Fifo) => FT_FIFO,
        Some(FileType::Socket) => FT_SOCK,
        Some(FileType::Symlink) => FT_SYMLINK,
        None => FT_UNKNOWN,
    }
}

fn byte_to_type(byte: u8) -> Option<FileType> {
    match byte {
        FT_REG_FILE => Some(FileType::Regular),
        FT_DIR => Some(FileType::Directory),
        FT_CHRDEV => Some(FileType::CharDevice),
        FT_BLKDEV => Some(FileType::BlockDevice),
        FT_FIFO => Some(FileType::Fifo),
        FT_SOCK => Some(FileType::Socket),
        FT_SYMLINK => Some(FileType::Symlink),
        _ => None,
    }
}

// Raw field access within a block.

fn get_inode(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn set_inode(data: &mut [u8], off: usize, ino: u32) {
    data[off..off + 4].copy_from_slice(&ino.to_le_bytes());
}

fn get_rec_len(data: &[u8], off: usize) -> usize {
    u16::from_le_bytes([data[off + 4], data[off + 5]]) as usize
}

fn set_rec_len(data: &mut [u8], off: usize, rec_len: usize) {
    data[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
}

fn get_name_len(data: &[u8], off: usize) -> usize {
    data[off + 6] as usize
}

fn get_file_type(data: &[u8], off: usize) -> u8 {
    data[off + 7]
}

fn get_name<'a>(data: &'a [u8], off: usize) -> &'a [u8] {
    &data[off + HEADER_LEN..off + HEADER_LEN + get_name_len(data, off)]
}

fn write_record(
    fs: &Ext2Fs,
    data: &mut [u8],
    off: usize,
    ino: u32,
    name: &[u8],
    file_type: Option<FileType>,
) {
    set_inode(data, off, ino);
    data[off + 6] = name.len() as u8;
    data[off + 7] = if fs.sb.has_filetype {
        type_to_byte(file_type)
    } else {
        FT_UNKNOWN
    };
    data[off + HEADER_LEN..off + HEADER_LEN + name.len()].copy_from_slice(name);
}

/// Location of a record inside a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryRef {
    /// Logical block of the directory holding the record.
    pub block: u32,
    /// Byte offset of the record inside that block.
    pub offset: usize,
    /// Inode number the record named when it was found.
    pub ino: u32,
}

/// A live entry yielded during iteration.
pub struct DirEntry {
    pub ino: InodeNo,
    pub file_type: Option<FileType>,
    pub name: Vec<u8>,
}

/// Checks one record header, returning `(rec_len, name_len, ino)`.
fn validate_record(
    fs: &Ext2Fs,
    dir: &Inode,
    data: &[u8],
    block: u32,
    off: usize,
) -> Ext2Result<(usize, usize, u32)> {
    let block_size = fs.sb.block_size as usize;
    if off + HEADER_LEN > block_size {
        fs.report_corruption(format_args!(
            "directory {}: entry header leaks past block {block}",
            dir.ino
        ));
        return Err(Error::Corrupted);
    }
    let rec_len = get_rec_len(data, off);
    let name_len = get_name_len(data, off);
    if rec_len == 0 {
        fs.report_corruption(format_args!(
            "directory {}: zero-length entry in block {block} at {off}",
            dir.ino
        ));
        return Err(Error::Corrupted);
    }
    if rec_len % 4 != 0 || rec_len < rec_len_needed(name_len) || off + rec_len > block_size {
        fs.report_corruption(format_args!(
            "directory {}: malformed entry in block {block} at {off} (rec_len {rec_len})",
            dir.ino
        ));
        return Err(Error::Corrupted);
    }
    let ino = get_inode(data, off);
    if ino > fs.sb.inodes_count {
        fs.report_corruption(format_args!(
            "directory {}: entry names impossible inode {ino}",
            dir.ino
        ));
        return Err(Error::Corrupted);
    }
    Ok((rec_len, name_len, ino))
}

/// Number of data blocks the directory spans. The size of a healthy
/// directory is always block-aligned.
fn dir_blocks(fs: &Ext2Fs, dir: &Inode) -> u32 {
    (dir.state().size >> fs.sb.block_size_bits) as u32
}

/// Resolves logical directory block `n` to its buffer.
fn dir_block(fs: &Ext2Fs, dir: &Inode, n: u32) -> Ext2Result<Buffer> {
    match blkmap::get_blocks(fs, dir, n, 1, false, Cred::ROOT)? {
        Some(mapping) => fs.cache.get(mapping.first),
        None => {
            fs.report_corruption(format_args!("directory {} has a hole at block {n}", dir.ino));
            Err(Error::Corrupted)
        }
    }
}

/// Walks every record, live or deleted, calling `f(block, offset, entry)`.
/// Iteration stops early when `f` returns `false`.
fn walk<F>(fs: &Ext2Fs, dir: &Inode, mut f: F) -> CanFail<Error>
where
    F: FnMut(u32, usize, &[u8]) -> Ext2Result<bool>,
{
    let nblocks = dir_blocks(fs, dir);
    for n in 0..nblocks {
        let buf = dir_block(fs, dir, n)?;
        let data = buf.data();
        let mut off = 0;
        while off < fs.sb.block_size as usize {
            let (rec_len, _, _) = validate_record(fs, dir, &data, n, off)?;
            if !f(n, off, &data)? {
                return Ok(());
            }
            off += rec_len;
        }
    }
    Ok(())
}

/// Yields every live entry to `f`; stops when `f` returns `false`.
pub fn for_each(fs: &Ext2Fs, dir: &Inode, mut f: impl FnMut(DirEntry) -> bool) -> CanFail<Error> {
    walk(fs, dir, |_, off, data| {
        let ino = get_inode(data, off);
        if ino == 0 {
            return Ok(true);
        }
        let entry = DirEntry {
            ino: InodeNo(ino),
            file_type: if fs.sb.has_filetype {
                byte_to_type(get_file_type(data, off))
            } else {
                None
            },
            name: get_name(data, off).to_vec(),
        };
        Ok(f(entry))
    })
}

/// Finds `name`, starting at the block where the previous lookup hit.
pub fn find_entry(fs: &Ext2Fs, dir: &Inode, name: &[u8]) -> Ext2Result<Option<EntryRef>> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::Invalid);
    }
    let nblocks = dir_blocks(fs, dir);
    if nblocks == 0 {
        return Ok(None);
    }
    let start = dir.dir_lookup_hint().min(nblocks - 1);

    let mut n = start;
    loop {
        let buf = dir_block(fs, dir, n)?;
        let data = buf.data();
        let mut off = 0;
        while off < fs.sb.block_size as usize {
            let (rec_len, name_len, ino) = validate_record(fs, dir, &data, n, off)?;
            if ino != 0 && name_len == name.len() && get_name(&data, off) == name {
                dir.set_dir_lookup_hint(n);
                return Ok(Some(EntryRef {
                    block: n,
                    offset: off,
                    ino,
                }));
            }
            off += rec_len;
        }
        n = (n + 1) % nblocks;
        if n == start {
            return Ok(None);
        }
    }
}

/// The `..` record: second entry of the first block.
pub fn dotdot(fs: &Ext2Fs, dir: &Inode) -> Ext2Result<EntryRef> {
    let buf = dir_block(fs, dir, 0)?;
    let data = buf.data();
    let (first_len, ..) = validate_record(fs, dir, &data, 0, 0)?;
    let (_, name_len, ino) = validate_record(fs, dir, &data, 0, first_len)?;
    if name_len != 2 || get_name(&data, first_len) != b".." {
        fs.report_corruption(format_args!("directory {} lost its '..' entry", dir.ino));
        return Err(Error::Corrupted);
    }
    Ok(EntryRef {
        block: 0,
        offset: first_len,
        ino,
    })
}

/// Inserts `name -> child` into `dir`, reusing a hole or a live record's
/// slack, or growing the directory by one block when every block is tight.
pub fn add_link(
    fs: &Ext2Fs,
    dir: &Inode,
    name: &[u8],
    child: InodeNo,
    file_type: Option<FileType>,
    cred: Cred,
) -> CanFail<Error> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::Invalid);
    }
    let needed = rec_len_needed(name.len());
    let block_size = fs.sb.block_size as usize;
    let nblocks = dir_blocks(fs, dir);

    // Walk one block past the end so the directory can grow.
    for n in 0..=nblocks {
        if n == nblocks {
            // Hit i_size: start a fresh block holding a single hole record
            // spanning the whole block.
            let mapping = blkmap::get_blocks(fs, dir, n, 1, true, cred)?.ok_or(Error::Io)?;
            let buf = fs.cache.get_zeroed(mapping.first)?;
            {
                let mut data = buf.data_mut();
                set_rec_len(&mut data, 0, block_size);
                write_record(fs, &mut data, 0, child.0, name, file_type);
            }
            buf.mark_dirty();
            fs.cache.flush_if_sync(&buf)?;
            dir.state_mut().size += block_size as u64;
            break;
        }

        let buf = dir_block(fs, dir, n)?;
        let mut found = None;
        {
            let data = buf.data();
            let mut off = 0;
            while off < block_size {
                let (rec_len, name_len, ino) = validate_record(fs, dir, &data, n, off)?;
                if ino != 0 && name_len == name.len() && get_name(&data, off) == name {
                    return Err(Error::Exists);
                }
                let live_len = rec_len_needed(name_len);
                if ino == 0 && rec_len >= needed {
                    // A deleted record wide enough to take us whole.
                    found = Some((off, rec_len, false));
                    break;
                }
                if ino != 0 && rec_len >= live_len + needed {
                    // Enough slack behind a live record: split it.
                    found = Some((off, rec_len, true));
                    break;
                }
                off += rec_len;
            }
        }

        if let Some((off, rec_len, split)) = found {
            let mut data = buf.data_mut();
            let target = if split {
                let live_len = rec_len_needed(get_name_len(&data, off));
                set_rec_len(&mut data, off, live_len);
                set_rec_len(&mut data, off + live_len, rec_len - live_len);
                off + live_len
            } else {
                off
            };
            write_record(fs, &mut data, target, child.0, name, file_type);
            drop(data);
            buf.mark_dirty();
            fs.cache.flush_if_sync(&buf)?;
            break;
        }
    }

    let now = fs.clock.now();
    {
        let mut state = dir.state_mut();
        state.mtime = now;
        state.ctime = now;
    }
    dir.mark_dirty();
    Ok(())
}

/// Removes the record at `entry` by folding it into its predecessor (when
/// one exists in the same block) and zeroing its inode.
pub fn delete_entry(fs: &Ext2Fs, dir: &Inode, entry: &EntryRef) -> CanFail<Error> {
    let buf = dir_block(fs, dir, entry.block)?;
    {
        let mut data = buf.data_mut();
        // Find the predecessor by scanning forward from the block start.
        let mut prev: Option<usize> = None;
        let mut off = 0;
        while off < entry.offset {
            let (rec_len, ..) = validate_record(fs, dir, &data, entry.block, off)?;
            prev = Some(off);
            off += rec_len;
        }
        if off != entry.offset {
            fs.report_corruption(format_args!(
                "directory {}: entry offset {} does not fall on a record",
                dir.ino, entry.offset
            ));
            return Err(Error::Corrupted);
        }
        let victim_end = entry.offset + get_rec_len(&data, entry.offset);
        if let Some(prev_off) = prev {
            set_rec_len(&mut data, prev_off, victim_end - prev_off);
        }
        set_inode(&mut data, entry.offset, 0);
    }
    buf.mark_dirty();
    fs.cache.flush_if_sync(&buf)?;

    let now = fs.clock.now();
    {
        let mut state = dir.state_mut();
        state.mtime = now;
        state.ctime = now;
    }
    dir.mark_dirty();
    Ok(())
}

/// Repoints an existing record at `inode`, refreshing the type byte; used
/// by rename when the target name already exists.
pub fn set_link(
    fs: &Ext2Fs,
    dir: &Inode,
    entry: &EntryRef,
    inode: InodeNo,
    file_type: Option<FileType>,
    update_times: bool,
) -> CanFail<Error> {
    let buf = dir_block(fs, dir, entry.block)?;
    {
        let mut data = buf.data_mut();
        set_inode(&mut data, entry.offset, inode.0);
        if fs.sb.has_filetype {
            data[entry.offset + 7] = type_to_byte(file_type);
        }
    }
    buf.mark_dirty();
    fs.cache.flush_if_sync(&buf)?;

    if update_times {
        let now = fs.clock.now();
        let mut state = dir.state_mut();
        state.mtime = now;
        state.ctime = now;
    }
    dir.mark_dirty();
    Ok(())
}

/// Writes the initial `.` and `..` records into a fresh directory.
pub fn make_empty(fs: &Ext2Fs, dir: &Inode, parent: InodeNo, cred: Cred) -> CanFail<Error> {
    let block_size = fs.sb.block_size as usize;
    let mapping = blkmap::get_blocks(fs, dir, 0, 1, true, cred)?.ok_or(Error::Io)?;
    let buf = fs.cache.get_zeroed(mapping.first)?;
    {
        let mut data = buf.data_mut();
        let dot_len = rec_len_needed(1);
        set_rec_len(&mut data, 0, dot_len);
        write_record(fs, &mut data, 0, dir.ino.0, b".", Some(FileType::Directory));
        set_rec_len(&mut data, dot_len, block_size - dot_len);
        write_record(
            fs,
            &mut data,
            dot_len,
            parent.0,
            b"..",
            Some(FileType::Directory),
        );
    }
    buf.mark_dirty();
    fs.cache.flush_if_sync(&buf)?;
    dir.state_mut().size = block_size as u64;
    dir.mark_dirty();
    Ok(())
}

/// A directory is removable when nothing but `.` (naming itself) and `..`
/// survives in it.
pub fn is_empty(fs: &Ext2Fs, dir: &Inode) -> Ext2Result<bool> {
    let mut empty = true;
    walk(fs, dir, |_, off, data| {
        let ino = get_inode(data, off);
        if ino == 0 {
            return Ok(true);
        }
        let name = get_name(data, off);
        if name == b"." {
            if ino != dir.ino.0 {
                empty = false;
            }
        } else if name != b".." {
            empty = false;
        }
        Ok(empty)
    })?;
    Ok(empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lengths_are_aligned() {
        assert_eq!(rec_len_needed(1), 12);
        assert_eq!(rec_len_needed(2), 12);
        assert_eq!(rec_len_needed(4), 12);
        assert_eq!(rec_len_needed(5), 16);
        assert_eq!(rec_len_needed(255), 264);
    }

    #[test]
    fn type_byte_round_trip() {
        for ft in [
            FileType::Regular,
            FileType::Directory,
            FileType::CharDevice,
            FileType::BlockDevice,
            FileType::Fifo,
            FileType::Socket,
            FileType::Symlink,
        ] {
            assert_eq!(byte_to_type(type_to_byte(Some(ft))), Some(ft));
        }
        assert_eq!(byte_to_type(FT_UNKNOWN), None);
    }

    #[test]
    fn raw_field_accessors() {
        let mut block = [0u8; 64];
        set_inode(&mut block, 0, 42);
        set_rec_len(&mut block, 0, 16);
        block[6] = 3;
        block[7] = FT_DIR;
        block[8..11].copy_from_slice(b"abc");
        assert_eq!(get_inode(&block, 0), 42);
        assert_eq!(get_rec_len(&block, 0), 16);
        assert_eq!(get_name(&block, 0), b"abc");
        assert_eq!(byte_to_type(get_file_type(&block, 0)), Some(FileType::Directory));
    }
}
