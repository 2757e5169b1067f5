//! Raw storage under the log: byte-addressed reads and writes plus a
//! durability barrier.

use alloc::{vec, vec::Vec};

use spin::Mutex;

use crate::common::{LfsError, LfsResult};

pub trait BlockDevice: Send + Sync {
    fn read_at(&self, pos: u32, buf: &mut [u8]) -> LfsResult<()>;
    fn write_at(&self, pos: u32, buf: &[u8]) -> LfsResult<()>;
    /// Returns once every completed write is durable.
    fn sync(&self) -> LfsResult<()>;
    fn capacity(&self) -> u64;
    /// Writes must start and end on this boundary.
    fn sector_size(&self) -> u32 {
        1
    }
}

fn check_range(pos: u32, len: usize, capacity: usize) -> LfsResult<core::ops::Range<usize>> {
    let start = pos as usize;
    let end = start.checked_add(len).ok_or(LfsError::Io)?;
    if end > capacity {
        return Err(LfsError::Io);
    }
    Ok(start..end)
}

/// Volatile device backed by a heap buffer.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; capacity]),
        }
    }

    /// Reopens a device from a previously taken [`MemDisk::snapshot`].
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemDisk {
    fn read_at(&self, pos: u32, buf: &mut [u8]) -> LfsResult<()> {
        let data = self.data.lock();
        let range = check_range(pos, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_at(&self, pos: u32, buf: &[u8]) -> LfsResult<()> {
        let mut data = self.data.lock();
        let range = check_range(pos, buf.len(), data.len())?;
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> LfsResult<()> {
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

/// Device backed by a memory-mapped image file.
#[cfg(feature = "std")]
pub struct FileDisk {
    map: Mutex<memmap2::MmapMut>,
    capacity: u64,
}

#[cfg(feature = "std")]
impl FileDisk {
    /// Opens `path`, creating it and extending it to `capacity` bytes when
    /// it is smaller.
    pub fn open(path: &std::path::Path, capacity: u64) -> LfsResult<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                log::error!("open {}: {}", path.display(), e);
                LfsError::Io
            })?;
        let len = file.metadata().map_err(|_| LfsError::Io)?.len();
        if len < capacity {
            file.set_len(capacity).map_err(|_| LfsError::Io)?;
        }
        let capacity = len.max(capacity);
        // SAFETY: the image file is owned by this process for the lifetime
        // of the mount.
        let map = unsafe { memmap2::MmapMut::map_mut(&file) }.map_err(|e| {
            log::error!("mmap {}: {}", path.display(), e);
            LfsError::Io
        })?;
        log::info!("opened {} ({} bytes)", path.display(), capacity);
        Ok(Self {
            map: Mutex::new(map),
            capacity,
        })
    }
}

#[cfg(feature = "std")]
impl BlockDevice for FileDisk {
    fn read_at(&self, pos: u32, buf: &mut [u8]) -> LfsResult<()> {
        let map = self.map.lock();
        let range = check_range(pos, buf.len(), map.len())?;
        buf.copy_from_slice(&map[range]);
        Ok(())
    }

    fn write_at(&self, pos: u32, buf: &[u8]) -> LfsResult<()> {
        let mut map = self.map.lock();
        let range = check_range(pos, buf.len(), map.len())?;
        map[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> LfsResult<()> {
        self.map.lock().flush().map_err(|e| {
            log::error!("fdatasync failed: {}", e);
            LfsError::SyncFailed
        })
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}
