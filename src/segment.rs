//! One segment of the log: the in-memory builder that blocks and inode
//! records are appended to, and the summary that maps its content back to
//! owning inodes.
//!
//! Layout of a segment:
//!
//! ```text
//! [header | summary entries ...][blocks and inodes ->      <- inode table]
//! |<------- summary_size ------>|
//! ```

use alloc::{sync::Arc, vec, vec::Vec};

use log::debug;

use crate::{
    common::LfsResult,
    config::Geometry,
    device::BlockDevice,
    disk_inode::{OnDiskInode, INODE_SIZE},
    le_u32,
};

/// `occupied_bytes`, entry count, inode count, flush version.
pub const SUMMARY_HEADER_SIZE: u32 = 16;
/// `(addr, inode_id, position code)`.
pub const SUMMARY_ENTRY_SIZE: u32 = 12;
/// `(inode_id, addr)`.
pub const INODE_TABLE_ENTRY_SIZE: u32 = 8;

/// Reverse mapping of one appended block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryEntry {
    pub addr: u32,
    pub inode_id: u32,
    pub code: u32,
}

/// An inode record placed in a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeTableEntry {
    pub inode_id: u32,
    pub addr: u32,
}

/// Summary and inode table of a flushed segment, as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub occupied: u32,
    pub version: u32,
    pub entries: Vec<SummaryEntry>,
    pub inodes: Vec<InodeTableEntry>,
}

impl SegmentSummary {
    pub fn read(device: &dyn BlockDevice, geometry: &Geometry, segment: u32) -> LfsResult<Self> {
        let base = geometry.segment_base(segment);
        let mut head = vec![0u8; geometry.summary_size as usize];
        device.read_at(base, &mut head)?;
        let occupied = le_u32!(head, 0);
        let entry_count = le_u32!(head, 4).min(geometry.max_summary_entries());
        let inode_count = le_u32!(head, 8);
        let version = le_u32!(head, 12);

        let entries = (0..entry_count as usize)
            .map(|i| {
                let at = (SUMMARY_HEADER_SIZE + SUMMARY_ENTRY_SIZE * i as u32) as usize;
                SummaryEntry {
                    addr: le_u32!(head, at),
                    inode_id: le_u32!(head, at + 4),
                    code: le_u32!(head, at + 8),
                }
            })
            .collect();

        let max_inodes = (geometry.segment_size - geometry.summary_size) / INODE_TABLE_ENTRY_SIZE;
        let inode_count = inode_count.min(max_inodes);
        let tail_len = inode_count * INODE_TABLE_ENTRY_SIZE;
        let mut tail = vec![0u8; tail_len as usize];
        device.read_at(base + geometry.segment_size - tail_len, &mut tail)?;
        // Entry k sits k+1 slots before the segment end.
        let inodes = (0..inode_count)
            .map(|k| {
                let at = (tail_len - (k + 1) * INODE_TABLE_ENTRY_SIZE) as usize;
                InodeTableEntry {
                    inode_id: le_u32!(tail, at),
                    addr: le_u32!(tail, at + 4),
                }
            })
            .collect();

        Ok(Self {
            occupied,
            version,
            entries,
            inodes,
        })
    }
}

/// Accumulates one segment in memory until it is flushed.
pub struct SegmentBuilder {
    geometry: Geometry,
    device: Arc<dyn BlockDevice>,
    buf: Vec<u8>,
    segment: u32,
    base: u32,
    offset: u32,
    occupied: u32,
    entries: Vec<SummaryEntry>,
    inodes: Vec<InodeTableEntry>,
}

impl SegmentBuilder {
    pub fn new(geometry: Geometry, device: Arc<dyn BlockDevice>, segment: u32) -> Self {
        let mut builder = Self {
            geometry,
            device,
            buf: vec![0u8; geometry.segment_size as usize],
            segment: 0,
            base: 0,
            offset: 0,
            occupied: 0,
            entries: Vec::new(),
            inodes: Vec::new(),
        };
        builder.seek(segment);
        builder
    }

    /// Starts a fresh segment at slot `segment`.
    pub fn seek(&mut self, segment: u32) {
        self.segment = segment;
        self.base = self.geometry.segment_base(segment);
        self.offset = self.geometry.summary_size;
        self.occupied = 0;
        self.entries.clear();
        self.inodes.clear();
        self.buf.fill(0);
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn occupied(&self) -> u32 {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.inodes.is_empty()
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base + self.geometry.segment_size
    }

    /// Whether `len` more bytes fit, keeping room for one more inode-table
    /// entry than currently exists.
    fn has_room(&self, len: u32) -> bool {
        let reserved = (self.inodes.len() as u32 + 1) * INODE_TABLE_ENTRY_SIZE;
        self.offset + len + reserved <= self.geometry.segment_size
    }

    fn append(&mut self, bytes: &[u8]) -> u32 {
        let at = self.offset as usize;
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
        let addr = self.base + self.offset;
        self.offset += bytes.len() as u32;
        self.occupied += bytes.len() as u32;
        addr
    }

    /// Appends a block owned by `inode_id` at tree position `code`; `None`
    /// when the segment is full.
    pub fn push_block(&mut self, bytes: &[u8], inode_id: u32, code: u32) -> Option<u32> {
        debug_assert_eq!(bytes.len() as u32, self.geometry.block_size);
        if self.entries.len() as u32 >= self.geometry.max_summary_entries()
            || !self.has_room(bytes.len() as u32)
        {
            return None;
        }
        let addr = self.append(bytes);
        self.entries.push(SummaryEntry {
            addr,
            inode_id,
            code,
        });
        Some(addr)
    }

    /// Appends an inode record; `None` when the segment is full.
    pub fn push_inode(&mut self, inode: &OnDiskInode, inode_id: u32) -> Option<u32> {
        if !self.has_room(INODE_SIZE) {
            return None;
        }
        let addr = self.append(&inode.to_bytes());
        self.inodes.push(InodeTableEntry { inode_id, addr });
        Some(addr)
    }

    /// Subtracts a superseded object that lives in this segment.
    pub fn discard(&mut self, addr: u32, size: u32) -> bool {
        if !self.contains(addr) {
            return false;
        }
        assert!(self.occupied >= size, "segment occupancy underflow");
        self.occupied -= size;
        true
    }

    /// Reads from the open segment when `addr` lies in it, otherwise from
    /// the device.
    pub fn read(&self, addr: u32, buf: &mut [u8]) -> LfsResult<()> {
        if self.contains(addr) {
            let at = (addr - self.base) as usize;
            buf.copy_from_slice(&self.buf[at..at + buf.len()]);
            return Ok(());
        }
        self.device.read_at(addr, buf)
    }

    /// Seals the summary and inode table; returns the segment image, its
    /// base address and its occupied bytes.
    pub fn build(&mut self, version: u32) -> (&[u8], u32, u32) {
        let head = &mut self.buf[..self.geometry.summary_size as usize];
        head[0..4].copy_from_slice(&self.occupied.to_le_bytes());
        head[4..8].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        head[8..12].copy_from_slice(&(self.inodes.len() as u32).to_le_bytes());
        head[12..16].copy_from_slice(&version.to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let at = (SUMMARY_HEADER_SIZE + SUMMARY_ENTRY_SIZE * i as u32) as usize;
            head[at..at + 4].copy_from_slice(&entry.addr.to_le_bytes());
            head[at + 4..at + 8].copy_from_slice(&entry.inode_id.to_le_bytes());
            head[at + 8..at + 12].copy_from_slice(&entry.code.to_le_bytes());
        }

        let end = self.geometry.segment_size as usize;
        for (k, entry) in self.inodes.iter().enumerate() {
            let at = end - (k + 1) * INODE_TABLE_ENTRY_SIZE as usize;
            self.buf[at..at + 4].copy_from_slice(&entry.inode_id.to_le_bytes());
            self.buf[at + 4..at + 8].copy_from_slice(&entry.addr.to_le_bytes());
        }
        debug!(
            "built segment {}: {} blocks, {} inodes, {} bytes live",
            self.segment,
            self.entries.len(),
            self.inodes.len(),
            self.occupied
        );
        (&self.buf, self.base, self.occupied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::MemDisk, test_util::small_geometry};

    fn builder() -> (SegmentBuilder, Arc<MemDisk>, Geometry) {
        let geometry = small_geometry();
        let disk = Arc::new(MemDisk::new(geometry.capacity as usize));
        (SegmentBuilder::new(geometry, disk.clone(), 0), disk, geometry)
    }

    #[test]
    fn push_returns_consecutive_addresses() {
        let (mut b, _, g) = builder();
        let block = vec![1u8; g.block_size as usize];
        let first = b.push_block(&block, 3, 7).unwrap();
        assert_eq!(first, g.segment_base(0) + g.summary_size);
        let second = b.push_block(&block, 3, 8).unwrap();
        assert_eq!(second, first + g.block_size);
        let inode = b.push_inode(&OnDiskInode::make_file(0, 0, 0), 3).unwrap();
        assert_eq!(inode, second + g.block_size);
        assert_eq!(b.occupied(), 2 * g.block_size + INODE_SIZE);
    }

    #[test]
    fn reads_are_served_from_open_segment() {
        let (mut b, disk, g) = builder();
        let block = vec![9u8; g.block_size as usize];
        let addr = b.push_block(&block, 1, 1).unwrap();
        // Nothing has reached the device yet.
        let mut on_disk = vec![0u8; 4];
        disk.read_at(addr, &mut on_disk).unwrap();
        assert_eq!(on_disk, vec![0u8; 4]);
        let mut buf = vec![0u8; g.block_size as usize];
        b.read(addr, &mut buf).unwrap();
        assert_eq!(buf, block);
    }

    #[test]
    fn full_segment_refuses_push() {
        let (mut b, _, g) = builder();
        let block = vec![0u8; g.block_size as usize];
        let mut pushed = 0;
        while b.push_block(&block, 1, pushed).is_some() {
            pushed += 1;
        }
        // Summary 256, segment 4096, block 256: 15 block slots, one table
        // entry reserved.
        assert_eq!(pushed, 14);
        assert!(b.push_block(&block, 1, 0).is_none());
    }

    #[test]
    fn inode_table_reservation_grows() {
        let (mut b, _, g) = builder();
        let inode = OnDiskInode::make_file(0, 0, 0);
        let mut count = 0;
        while b.push_inode(&inode, count).is_some() {
            count += 1;
        }
        let used = g.summary_size + count * INODE_SIZE + count * INODE_TABLE_ENTRY_SIZE;
        assert!(used <= g.segment_size);
        assert!(used + INODE_SIZE + 2 * INODE_TABLE_ENTRY_SIZE > g.segment_size);
    }

    #[test]
    fn built_summary_reads_back() {
        let (mut b, disk, g) = builder();
        let block = vec![5u8; g.block_size as usize];
        let a1 = b.push_block(&block, 4, 0x4000_0001).unwrap();
        let i1 = b.push_inode(&OnDiskInode::make_file(0, 0, 0), 4).unwrap();
        let i2 = b.push_inode(&OnDiskInode::make_dir(0, 0, 0), 0).unwrap();
        assert!(b.discard(i1, INODE_SIZE));
        let (bytes, base, occupied) = b.build(6);
        disk.write_at(base, bytes).unwrap();
        assert_eq!(occupied, g.block_size + INODE_SIZE);

        let summary = SegmentSummary::read(disk.as_ref(), &g, 0).unwrap();
        assert_eq!(summary.occupied, occupied);
        assert_eq!(summary.version, 6);
        assert_eq!(
            summary.entries,
            vec![SummaryEntry {
                addr: a1,
                inode_id: 4,
                code: 0x4000_0001
            }]
        );
        assert_eq!(
            summary.inodes,
            vec![
                InodeTableEntry {
                    inode_id: 4,
                    addr: i1
                },
                InodeTableEntry {
                    inode_id: 0,
                    addr: i2
                },
            ]
        );
    }

    #[test]
    fn discard_outside_segment_is_ignored() {
        let (mut b, _, g) = builder();
        assert!(!b.discard(g.segment_base(1), g.block_size));
    }
}
