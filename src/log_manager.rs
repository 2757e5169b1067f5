//! The segmented log: appends objects through a [`SegmentBuilder`], keeps
//! per-segment occupancy, hands out free segments and picks segments for
//! cleaning.

use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};

use crate::{
    common::{LfsError, LfsResult},
    config::{Geometry, LfsConfig},
    device::BlockDevice,
    disk_inode::{is_real_addr, BlockPos, OnDiskInode, INODE_SIZE},
    le_u32,
    segment::{SegmentBuilder, SegmentSummary},
};

/// Occupancy record of one segment slot, persisted in the checkpoint region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStatus {
    pub flushing_version: u32,
    pub occupied: u32,
}

impl SegmentStatus {
    pub fn is_free(&self) -> bool {
        self.occupied == 0
    }

    /// Cleaning cost; lower is cleaned first.
    pub fn cost(&self) -> u64 {
        self.occupied as u64 * self.flushing_version as u64
    }
}

/// Something appended to the log.
#[derive(Debug, Clone, Copy)]
pub enum LogObject<'a> {
    Block {
        data: &'a [u8],
        inode_id: u32,
        pos: BlockPos,
    },
    Inode {
        inode: &'a OnDiskInode,
        inode_id: u32,
    },
}

impl LogObject<'_> {
    pub fn size(&self) -> u32 {
        match self {
            Self::Block { data, .. } => data.len() as u32,
            Self::Inode { .. } => INODE_SIZE,
        }
    }
}

/// Live-object candidates gathered from the segments chosen for cleaning.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcPlan {
    pub segments: Vec<u32>,
    /// `(addr, position code)` pairs per owning inode.
    pub blocks: BTreeMap<u32, Vec<(u32, u32)>>,
    /// `(inode_id, addr)` of the newest record of each inode per segment.
    pub inode_roots: Vec<(u32, u32)>,
}

impl GcPlan {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.inode_roots.is_empty()
    }
}

pub struct SegmentManager {
    geometry: Geometry,
    device: Arc<dyn BlockDevice>,
    builder: SegmentBuilder,
    /// The builder's segment is already on the device and takes no more
    /// appends; the next push moves to a fresh segment first.
    sealed: bool,
    status: Vec<SegmentStatus>,
    /// Segments that became empty since the last checkpoint. The on-disk
    /// checkpoint may still point into them, so they are not reused yet.
    pending_free: Vec<bool>,
    free_segments: Arc<AtomicU32>,
    version: u32,
    low_watermark: u32,
    merging_segments: u32,
}

impl SegmentManager {
    pub fn new(
        config: &LfsConfig,
        geometry: Geometry,
        device: Arc<dyn BlockDevice>,
        status: Vec<SegmentStatus>,
        version: u32,
    ) -> LfsResult<Self> {
        assert_eq!(status.len() as u32, geometry.num_segments);
        let free = status.iter().filter(|s| s.is_free()).count() as u32;
        let pending_free = vec![false; status.len()];
        let (first, sealed) =
            match Self::scan_for_empty(&status, &pending_free, geometry.num_segments - 1, None) {
                Ok(first) => (first, false),
                Err(LfsError::OutOfSpace) => {
                    warn!("no free segment at mount, appends fail until space is reclaimed");
                    (0, true)
                }
                Err(e) => return Err(e),
            };
        info!(
            "segment manager: {} segments, {} free, writing into segment {}",
            geometry.num_segments, free, first
        );
        Ok(Self {
            builder: SegmentBuilder::new(geometry, device.clone(), first),
            sealed,
            geometry,
            device,
            status,
            pending_free,
            free_segments: Arc::new(AtomicU32::new(free)),
            version,
            low_watermark: config.low_watermark,
            merging_segments: config.merging_segments,
        })
    }

    pub fn status_from_bytes(buf: &[u8], num_segments: u32) -> Vec<SegmentStatus> {
        (0..num_segments as usize)
            .map(|i| SegmentStatus {
                flushing_version: le_u32!(buf, 8 * i),
                occupied: le_u32!(buf, 8 * i + 4),
            })
            .collect()
    }

    pub fn status_buffer(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.status.len() * 8);
        for status in &self.status {
            buf.extend_from_slice(&status.flushing_version.to_le_bytes());
            buf.extend_from_slice(&status.occupied.to_le_bytes());
        }
        buf
    }

    pub fn status(&self, segment: u32) -> SegmentStatus {
        self.status[segment as usize]
    }

    pub fn num_segments(&self) -> u32 {
        self.geometry.num_segments
    }

    pub fn free_segments(&self) -> u32 {
        self.free_segments.load(Ordering::SeqCst)
    }

    /// Shared handle to the free-segment counter, readable without the
    /// manager's lock.
    pub fn free_segments_handle(&self) -> Arc<AtomicU32> {
        self.free_segments.clone()
    }

    pub fn current_segment(&self) -> u32 {
        self.builder.segment()
    }

    /// Live bytes in the open, not yet flushed segment.
    pub fn open_occupied(&self) -> u32 {
        if self.sealed {
            0
        } else {
            self.builder.occupied()
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Version stamped on segments flushed from now on.
    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Appends `object` and retires its previous copy at `old_addr`.
    pub fn push(&mut self, object: LogObject<'_>, old_addr: u32) -> LfsResult<u32> {
        self.advance()?;
        let addr = match self.try_push(&object) {
            Some(addr) => addr,
            None => {
                if self.builder.is_empty() {
                    return Err(LfsError::SegmentOverflow);
                }
                self.flush()?;
                self.try_push(&object).ok_or(LfsError::SegmentOverflow)?
            }
        };
        self.discard(old_addr, object.size());
        Ok(addr)
    }

    fn try_push(&mut self, object: &LogObject<'_>) -> Option<u32> {
        match *object {
            LogObject::Block {
                data,
                inode_id,
                pos,
            } => self.builder.push_block(data, inode_id, pos.encode()),
            LogObject::Inode { inode, inode_id } => self.builder.push_inode(inode, inode_id),
        }
    }

    /// Retires `size` bytes at `addr`; holes and placeholders are ignored.
    pub fn discard(&mut self, addr: u32, size: u32) {
        if !is_real_addr(addr) || (!self.sealed && self.builder.discard(addr, size)) {
            return;
        }
        let segment = match self.geometry.segment_of(addr) {
            Some(segment) => segment as usize,
            None => panic!("discard of address {} outside the segment area", addr),
        };
        let status = &mut self.status[segment];
        assert!(
            status.occupied >= size,
            "segment {} occupancy underflow",
            segment
        );
        status.occupied -= size;
        if status.occupied == 0 {
            self.pending_free[segment] = true;
            self.free_segments.fetch_add(1, Ordering::SeqCst);
            debug!("segment {} emptied", segment);
        }
    }

    pub fn read(&self, addr: u32, buf: &mut [u8]) -> LfsResult<()> {
        if self.sealed {
            return self.device.read_at(addr, buf);
        }
        self.builder.read(addr, buf)
    }

    fn scan_for_empty(
        status: &[SegmentStatus],
        pending: &[bool],
        cursor: u32,
        skip: Option<u32>,
    ) -> LfsResult<u32> {
        let n = status.len() as u32;
        (1..=n)
            .map(|step| (cursor + step) % n)
            .find(|&i| Some(i) != skip && status[i as usize].is_free() && !pending[i as usize])
            .ok_or(LfsError::OutOfSpace)
    }

    /// First allocatable segment after `cursor` other than the open one,
    /// wrapping around once.
    pub fn find_next_empty(&self, cursor: u32) -> LfsResult<u32> {
        Self::scan_for_empty(
            &self.status,
            &self.pending_free,
            cursor,
            Some(self.builder.segment()),
        )
    }

    /// Writes the open segment to the device and moves to the next empty one.
    pub fn flush(&mut self) -> LfsResult<()> {
        self.seal()?;
        self.advance()
    }

    /// Writes the open segment to the device and records its occupancy
    /// without choosing a successor, so a checkpoint can release held
    /// segments before the next one is picked.
    pub fn seal(&mut self) -> LfsResult<()> {
        if self.sealed || self.builder.is_empty() {
            return Ok(());
        }
        let segment = self.builder.segment();
        let version = self.version;
        let (bytes, base, occupied) = self.builder.build(version);
        debug_assert_eq!(base % self.device.sector_size(), 0);
        self.device.write_at(base, bytes)?;
        self.status[segment as usize] = SegmentStatus {
            flushing_version: version,
            occupied,
        };
        if occupied > 0 {
            self.free_segments.fetch_sub(1, Ordering::SeqCst);
        }
        self.sealed = true;
        debug!(
            "flushed segment {} ({} bytes live, version {})",
            segment, occupied, version
        );
        Ok(())
    }

    /// Opens the next allocatable segment after a sealed one. A sealed
    /// segment whose content is already dead is itself reusable.
    pub fn advance(&mut self) -> LfsResult<()> {
        if !self.sealed {
            return Ok(());
        }
        let segment = self.builder.segment();
        let next = match Self::scan_for_empty(&self.status, &self.pending_free, segment, None) {
            Ok(next) => next,
            Err(LfsError::OutOfSpace) if self.pending_free.contains(&true) => {
                debug!("only segments held for the next checkpoint are free");
                return Err(LfsError::CheckpointRequired);
            }
            Err(e) => return Err(e),
        };
        self.builder.seek(next);
        self.sealed = false;
        debug!("writing into segment {}", next);
        Ok(())
    }

    /// Segments emptied before the checkpoint that just completed may be
    /// reused.
    pub fn checkpoint_committed(&mut self) {
        self.pending_free.iter_mut().for_each(|p| *p = false);
    }

    /// Picks the cheapest segments to clean when free space runs low and
    /// gathers every reverse-mapping entry they hold.
    pub fn select_segments_for_gc(&self) -> LfsResult<GcPlan> {
        self.select_segments_below(self.low_watermark)
    }

    /// Like [`Self::select_segments_for_gc`], idle once `watermark`
    /// segments are free.
    pub fn select_segments_below(&self, watermark: u32) -> LfsResult<GcPlan> {
        let mut plan = GcPlan::default();
        if self.free_segments() >= watermark {
            return Ok(plan);
        }
        let open = (!self.sealed).then_some(self.builder.segment());
        let mut candidates: Vec<u32> = (0..self.geometry.num_segments)
            .filter(|&i| Some(i) != open && !self.status[i as usize].is_free())
            .collect();
        candidates.sort_by_key(|&i| (self.status[i as usize].cost(), i));
        candidates.truncate(self.merging_segments as usize);

        for segment in candidates {
            let occupied = self.status[segment as usize].occupied;
            if self.geometry.segment_size - occupied <= self.geometry.block_size {
                debug!("segment {} is nearly full, not worth cleaning", segment);
                continue;
            }
            let summary = SegmentSummary::read(self.device.as_ref(), &self.geometry, segment)?;
            for entry in &summary.entries {
                plan.blocks
                    .entry(entry.inode_id)
                    .or_default()
                    .push((entry.addr, entry.code));
            }
            let mut newest: BTreeMap<u32, u32> = BTreeMap::new();
            for entry in &summary.inodes {
                newest.insert(entry.inode_id, entry.addr);
            }
            plan.inode_roots.extend(newest);
            plan.segments.push(segment);
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::MemDisk,
        disk_inode::DIRECT_CNT,
        test_util::{small_config, small_geometry},
    };

    fn manager() -> (SegmentManager, Arc<MemDisk>, Geometry) {
        let geometry = small_geometry();
        let disk = Arc::new(MemDisk::new(geometry.capacity as usize));
        let status = vec![SegmentStatus::default(); geometry.num_segments as usize];
        let mgr = SegmentManager::new(&small_config(), geometry, disk.clone(), status, 0).unwrap();
        (mgr, disk, geometry)
    }

    fn block_of(byte: u8, geometry: &Geometry) -> Vec<u8> {
        vec![byte; geometry.block_size as usize]
    }

    fn push_block(mgr: &mut SegmentManager, data: &[u8], old: u32, i0: u32) -> u32 {
        mgr.push(
            LogObject::Block {
                data,
                inode_id: 1,
                pos: BlockPos::Level1(i0 % DIRECT_CNT),
            },
            old,
        )
        .unwrap()
    }

    fn free_count(mgr: &SegmentManager) -> u32 {
        (0..mgr.num_segments())
            .filter(|&i| mgr.status(i).is_free())
            .count() as u32
    }

    #[test]
    fn full_segment_rolls_over_to_next() {
        let (mut mgr, disk, g) = manager();
        let total = mgr.free_segments();
        let data = block_of(3, &g);
        let addrs: Vec<u32> = (0..20).map(|i| push_block(&mut mgr, &data, 0, i)).collect();
        assert_eq!(mgr.current_segment(), 1);
        assert_eq!(mgr.free_segments(), total - 1);
        assert_eq!(mgr.status(0).occupied, 14 * g.block_size);
        assert_eq!(g.segment_of(addrs[14]), Some(1));
        // Flushed data is on the device, open data is served from memory.
        let mut buf = vec![0u8; g.block_size as usize];
        disk.read_at(addrs[0], &mut buf).unwrap();
        assert_eq!(buf, data);
        mgr.read(addrs[19], &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(free_count(&mgr), mgr.free_segments());
    }

    #[test]
    fn discard_frees_segment_after_checkpoint_only() {
        let (mut mgr, _, g) = manager();
        let data = block_of(1, &g);
        let first: Vec<u32> = (0..14).map(|i| push_block(&mut mgr, &data, 0, i)).collect();
        mgr.flush().unwrap();
        assert_eq!(mgr.current_segment(), 1);
        let before = mgr.free_segments();
        for (i, addr) in first.iter().enumerate() {
            push_block(&mut mgr, &data, *addr, i as u32);
        }
        assert!(mgr.status(0).is_free());
        assert_eq!(mgr.free_segments(), before + 1);
        assert_eq!(free_count(&mgr), mgr.free_segments());
        // Segment 0 is empty but still referenced by the last checkpoint.
        assert_ne!(mgr.find_next_empty(mgr.num_segments() - 1).unwrap(), 0);
        mgr.checkpoint_committed();
        assert_eq!(mgr.find_next_empty(mgr.num_segments() - 1).unwrap(), 0);
    }

    #[test]
    fn discard_in_open_segment_stays_in_builder() {
        let (mut mgr, _, g) = manager();
        let data = block_of(1, &g);
        let a = push_block(&mut mgr, &data, 0, 0);
        push_block(&mut mgr, &data, a, 0);
        assert_eq!(mgr.open_occupied(), g.block_size);
    }

    #[test]
    fn empty_flush_keeps_segment() {
        let (mut mgr, _, _) = manager();
        let free = mgr.free_segments();
        mgr.flush().unwrap();
        assert_eq!(mgr.current_segment(), 0);
        assert_eq!(mgr.free_segments(), free);
    }

    #[test]
    fn allocation_wraps_and_reports_out_of_space() {
        let geometry = small_geometry();
        let disk = Arc::new(MemDisk::new(geometry.capacity as usize));
        let mut status = vec![
            SegmentStatus {
                flushing_version: 1,
                occupied: 100
            };
            geometry.num_segments as usize
        ];
        status[0].occupied = 0;
        status[2].occupied = 0;
        let mgr =
            SegmentManager::new(&small_config(), geometry, disk.clone(), status.clone(), 1).unwrap();
        assert_eq!(mgr.current_segment(), 0);
        // Wraps past the end and skips the open segment.
        assert_eq!(mgr.find_next_empty(5).unwrap(), 2);
        status[0].occupied = 100;
        status[2].occupied = 100;
        // A full device still mounts; appends are refused.
        let mut full = SegmentManager::new(&small_config(), geometry, disk, status, 1).unwrap();
        assert_eq!(full.open_occupied(), 0);
        let data = block_of(1, &geometry);
        let object = LogObject::Block {
            data: &data,
            inode_id: 1,
            pos: BlockPos::Level1(0),
        };
        assert_eq!(full.push(object, 0), Err(LfsError::OutOfSpace));
    }

    #[test]
    fn held_segments_need_a_checkpoint() {
        let geometry = small_geometry();
        let disk = Arc::new(MemDisk::new(geometry.capacity as usize));
        let mut status = vec![
            SegmentStatus {
                flushing_version: 1,
                occupied: 100
            };
            geometry.num_segments as usize
        ];
        status[0].occupied = 0;
        status[1].occupied = 0;
        let mut mgr = SegmentManager::new(&small_config(), geometry, disk, status, 1).unwrap();
        let data = block_of(5, &geometry);
        let first: Vec<u32> = (0..14).map(|i| push_block(&mut mgr, &data, 0, i)).collect();
        // Segment 0 fills up and the log moves on to segment 1.
        let second: Vec<u32> = (0..14).map(|i| push_block(&mut mgr, &data, first[i as usize], i)).collect();
        assert_eq!(mgr.current_segment(), 1);
        assert!(mgr.status(0).is_free());
        assert_eq!(mgr.free_segments(), 2);

        // Segment 0 is empty but held, so the full segment 1 has nowhere to go.
        let object = LogObject::Block {
            data: &data,
            inode_id: 1,
            pos: BlockPos::Level1(0),
        };
        assert_eq!(mgr.push(object, second[0]), Err(LfsError::CheckpointRequired));
        assert_eq!(mgr.free_segments(), 1);

        // What a checkpoint does: seal, commit, then continue.
        mgr.seal().unwrap();
        mgr.checkpoint_committed();
        mgr.advance().unwrap();
        assert_eq!(mgr.current_segment(), 0);
        let addr = mgr.push(object, second[0]).unwrap();
        assert_eq!(geometry.segment_of(addr), Some(0));
        assert_eq!(free_count(&mgr), mgr.free_segments());
    }

    #[test]
    fn sealed_segment_is_read_from_device_and_discarded_in_table() {
        let (mut mgr, _, g) = manager();
        let data = block_of(6, &g);
        let addr = push_block(&mut mgr, &data, 0, 0);
        mgr.seal().unwrap();
        assert_eq!(mgr.status(0).occupied, g.block_size);
        let mut buf = vec![0u8; g.block_size as usize];
        mgr.read(addr, &mut buf).unwrap();
        assert_eq!(buf, data);
        mgr.discard(addr, g.block_size);
        assert!(mgr.status(0).is_free());
        assert_eq!(free_count(&mgr), mgr.free_segments());
    }

    #[test]
    fn status_table_round_trip() {
        let (mut mgr, _, g) = manager();
        mgr.set_version(4);
        push_block(&mut mgr, &block_of(2, &g), 0, 0);
        mgr.flush().unwrap();
        let table = SegmentManager::status_from_bytes(&mgr.status_buffer(), mgr.num_segments());
        assert_eq!(
            table[0],
            SegmentStatus {
                flushing_version: 4,
                occupied: g.block_size
            }
        );
        assert!(table[1..].iter().all(|s| s.is_free()));
    }

    #[test]
    fn gc_selection_prefers_cheap_segments() {
        let geometry = small_geometry();
        let disk = Arc::new(MemDisk::new(geometry.capacity as usize));
        let config = LfsConfig {
            low_watermark: geometry.num_segments,
            high_watermark: geometry.num_segments,
            merging_segments: 2,
            ..small_config()
        };
        let status = vec![SegmentStatus::default(); geometry.num_segments as usize];
        let mut mgr = SegmentManager::new(&config, geometry, disk, status, 1).unwrap();
        let data = block_of(7, &geometry);
        // Three segments: one dense, two sparse after overwrites.
        let mut seg_addrs = Vec::new();
        for version in 1..=3 {
            mgr.set_version(version);
            let addrs: Vec<u32> = (0..14).map(|i| push_block(&mut mgr, &data, 0, i)).collect();
            mgr.flush().unwrap();
            seg_addrs.push(addrs);
        }
        // Leave one live block in segments 1 and 2.
        for seg in [1usize, 2] {
            for addr in &seg_addrs[seg][1..] {
                mgr.discard(*addr, geometry.block_size);
            }
        }
        mgr.set_version(4);
        let plan = mgr.select_segments_for_gc().unwrap();
        // Segment 0 (cost 14 * bs * 1) is dearer than 1 (bs * 2) and 2 (bs * 3).
        assert_eq!(plan.segments, vec![1, 2]);
        let cands = &plan.blocks[&1];
        assert_eq!(cands.len(), 28);
        assert!(cands.contains(&(seg_addrs[1][0], BlockPos::Level1(0).encode())));
        assert!(plan.inode_roots.is_empty());
    }

    #[test]
    fn gc_is_idle_above_low_watermark() {
        let (mgr, _, _) = manager();
        assert!(mgr.select_segments_for_gc().unwrap().is_empty());
    }
}
