//! Block device access and the buffered-block cache.
//!
//! The core never talks to a device directly: every metadata block travels
//! through a [`BufferCache`] keyed by filesystem block number. A [`Buffer`]
//! is shared, interior-locked, and carries a dirty bit; writers mutate the
//! bytes under the buffer's lock, mark it dirty, and rely on [`BufferCache::sync_all`]
//! (or the synchronous-mount flush) to push it out.
//!
//! [`MemDisk`] is a RAM-backed device used by the formatter's callers and by
//! the test suite.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::error::{CanFail, Error, Ext2Result};

/// A random-access block device, addressed in bytes.
///
/// Implementations must tolerate concurrent calls; the cache serializes
/// access per block but distinct blocks are read and written in parallel.
pub trait BlockDevice: Send + Sync {
    /// Total capacity of the device, in bytes.
    fn size_bytes(&self) -> u64;

    /// Reads `buf.len()` bytes starting at byte `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<Error>;

    /// Writes `data` starting at byte `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> CanFail<Error>;
}

/// A volatile, memory-backed [`BlockDevice`].
pub struct MemDisk {
    data: RwLock<Vec<u8>>,
}

impl MemDisk {
    /// Creates a zero-filled device of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn size_bytes(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<Error> {
        let data = self.data.read();
        let start = usize::try_from(offset).map_err(|_| Error::Io)?;
        let end = start.checked_add(buf.len()).ok_or(Error::Io)?;
        if data.len() < end {
            return Err(Error::Io);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> CanFail<Error> {
        let mut inner = self.data.write();
        let start = usize::try_from(offset).map_err(|_| Error::Io)?;
        let end = start.checked_add(data.len()).ok_or(Error::Io)?;
        if inner.len() < end {
            return Err(Error::Io);
        }
        inner[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// A cached filesystem block.
///
/// The payload sits behind a read/write lock; the dirty bit is flipped with
/// [`BufferHead::mark_dirty`] after mutation and cleared by the cache when
/// the block reaches the device.
pub struct BufferHead {
    blk: u32,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    uptodate: AtomicBool,
}

/// Shared handle to a cached block.
pub type Buffer = Arc<BufferHead>;

impl BufferHead {
    /// Filesystem block number this buffer mirrors.
    pub fn block(&self) -> u32 {
        self.blk
    }

    /// Read access to the block payload.
    pub fn data(&self) -> spin::RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Write access to the block payload. Callers mark the buffer dirty
    /// after releasing the guard.
    pub fn data_mut(&self) -> spin::RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Whether the payload reflects the device contents (or newer).
    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }
}

/// Write-back cache of filesystem blocks over a [`BlockDevice`].
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    block_size: usize,
    buffers: Mutex<HashMap<u32, Buffer>>,
    synchronous: bool,
}

impl BufferCache {
    pub fn new(dev: Arc<dyn BlockDevice>, block_size: usize, synchronous: bool) -> Self {
        Self {
            dev,
            block_size,
            buffers: Mutex::new(HashMap::new()),
            synchronous,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Returns the buffer for block `blk`, reading it from the device on a
    /// cache miss.
    pub fn get(&self, blk: u32) -> Ext2Result<Buffer> {
        let buf = self.lookup_or_insert(blk);
        if !buf.is_uptodate() {
            let mut data = buf.data_mut();
            // Re-check under the payload lock: a racing reader may have
            // filled the buffer while we waited.
            if !buf.is_uptodate() {
                self.dev
                    .read_at(u64::from(blk) * self.block_size as u64, &mut data)?;
                buf.uptodate.store(true, Ordering::Release);
            }
        }
        Ok(buf)
    }

    /// Returns a zero-filled buffer for block `blk` without reading the
    /// device. Used for freshly allocated blocks whose previous contents are
    /// dead.
    pub fn get_zeroed(&self, blk: u32) -> Ext2Result<Buffer> {
        let buf = self.lookup_or_insert(blk);
        {
            let mut data = buf.data_mut();
            data.fill(0);
            buf.uptodate.store(true, Ordering::Release);
        }
        Ok(buf)
    }

    fn lookup_or_insert(&self, blk: u32) -> Buffer {
        let mut map = self.buffers.lock();
        map.entry(blk)
            .or_insert_with(|| {
                Arc::new(BufferHead {
                    blk,
                    data: RwLock::new(vec![0u8; self.block_size].into_boxed_slice()),
                    dirty: AtomicBool::new(false),
                    uptodate: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Drops block `blk` from the cache without writing it back. The error
    /// path of a failed branch allocation uses this to forget buffers whose
    /// backing blocks were released.
    pub fn forget(&self, blk: u32) {
        self.buffers.lock().remove(&blk);
    }

    /// Writes one buffer to the device if it is dirty.
    pub fn sync_one(&self, buf: &BufferHead) -> CanFail<Error> {
        if !buf.is_dirty() {
            return Ok(());
        }
        if !buf.is_uptodate() {
            return Err(Error::Io);
        }
        let data = buf.data();
        self.dev
            .write_at(u64::from(buf.blk) * self.block_size as u64, &data)?;
        buf.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Flushes `buf` immediately when the volume is mounted synchronous;
    /// otherwise leaves it for the next [`BufferCache::sync_all`].
    pub fn flush_if_sync(&self, buf: &BufferHead) -> CanFail<Error> {
        if self.synchronous {
            self.sync_one(buf)?;
        }
        Ok(())
    }

    /// Writes every dirty buffer back to the device.
    pub fn sync_all(&self) -> CanFail<Error> {
        let bufs: Vec<Buffer> = self.buffers.lock().values().cloned().collect();
        for buf in bufs {
            self.sync_one(&buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_through_and_write_back() {
        let dev = Arc::new(MemDisk::new(8192));
        dev.write_at(1024, &[0xab; 16]).unwrap();

        let cache = BufferCache::new(dev.clone(), 1024, false);
        let buf = cache.get(1).unwrap();
        assert_eq!(buf.data()[..16], [0xab; 16]);

        buf.data_mut()[0] = 0xcd;
        buf.mark_dirty();
        let mut raw = [0u8; 1];
        dev.read_at(1024, &mut raw).unwrap();
        assert_eq!(raw[0], 0xab, "write-back must not happen before sync");

        cache.sync_all().unwrap();
        dev.read_at(1024, &mut raw).unwrap();
        assert_eq!(raw[0], 0xcd);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn zeroed_buffer_skips_device_read() {
        let dev = Arc::new(MemDisk::new(4096));
        dev.write_at(2048, &[0xff; 1024]).unwrap();

        let cache = BufferCache::new(dev, 1024, false);
        let buf = cache.get_zeroed(2).unwrap();
        assert!(buf.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_io_fails() {
        let disk = MemDisk::new(512);
        let mut buf = [0u8; 16];
        assert_eq!(disk.read_at(512, &mut buf), Err(Error::Io));
        assert_eq!(disk.write_at(500, &[0u8; 32]), Err(Error::Io));
    }
}
