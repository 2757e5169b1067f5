//! Copy-on-write access to one inode's block tree.
//!
//! An [`InodeView`] owns a private copy of an [`OnDiskInode`] and caches the
//! single-indirect table, the double-indirect root and one double-indirect
//! leaf while it walks. Every changed block, and every pointer block above
//! it, is appended to the log at a new address; the caller re-appends the
//! inode record itself once the view reports it dirty.
//!
//! Superseded copies are not retired while the view works: the caller
//! settles them with [`InodeView::commit`] once the new inode record is in
//! the log, or drops the view's own appends with [`InodeView::abort`] when
//! the operation failed halfway.

use alloc::{string::String, vec, vec::Vec};

use log::{debug, warn};
use spin::Mutex;

use crate::{
    common::{LfsError, LfsResult},
    dir::{self, DirRecord},
    disk_inode::{
        is_real_addr, BlockPos, OnDiskInode, DIRECT_CNT, INDIRECT1_SLOT, INDIRECT2_SLOT,
        INVALID_ADDR, TEMPORARY_ADDR,
    },
    le_u32,
    log_manager::{LogObject, SegmentManager},
};

/// One indirect block held in memory, tagged with its index among its
/// siblings and the address it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndirectCache {
    index: u32,
    addr: u32,
    table: Vec<u32>,
    dirty: bool,
}

impl IndirectCache {
    /// A table allocated in memory for a hole; it has no log address yet.
    fn empty(index: u32, entries: u32) -> Self {
        Self {
            index,
            addr: TEMPORARY_ADDR,
            table: vec![INVALID_ADDR; entries as usize],
            dirty: true,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.table.iter().flat_map(|addr| addr.to_le_bytes()).collect()
    }
}

#[derive(Debug)]
enum Evicted {
    Clean,
    Dirty(IndirectCache),
}

fn evict(slot: &mut Option<IndirectCache>) -> Option<Evicted> {
    slot.take().map(|cache| {
        if cache.dirty {
            Evicted::Dirty(cache)
        } else {
            Evicted::Clean
        }
    })
}

/// Log changes of a view that are not settled yet, as `(addr, size)`.
#[derive(Debug, Default)]
struct Pending {
    appended: Vec<(u32, u32)>,
    retired: Vec<(u32, u32)>,
}

impl Pending {
    fn absorb(&mut self, other: Pending) {
        self.appended.extend(other.appended);
        self.retired.extend(other.retired);
    }

    fn retire(&mut self, addr: u32, size: u32) {
        if is_real_addr(addr) {
            self.retired.push((addr, size));
        }
    }
}

/// Appends `object` as the new copy of whatever lives at `old`.
fn append(
    log: &Mutex<SegmentManager>,
    pending: &mut Pending,
    object: LogObject<'_>,
    old: u32,
) -> LfsResult<u32> {
    let size = object.size();
    let addr = log.lock().push(object, INVALID_ADDR)?;
    pending.appended.push((addr, size));
    pending.retire(old, size);
    Ok(addr)
}

/// One block overlapping a walked range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockVisit {
    /// Current address of the block, `INVALID_ADDR` for a hole.
    pub addr: u32,
    pub pos: BlockPos,
    /// Start of the chunk within the block.
    pub offset: u32,
    pub len: u32,
    /// Start of the chunk within the file.
    pub file_offset: u32,
}

/// What a visitor wants done with the pointer it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Replace(u32),
}

pub struct InodeView<'a> {
    id: u32,
    inode: OnDiskInode,
    log: &'a Mutex<SegmentManager>,
    block_size: u32,
    single: Option<IndirectCache>,
    double_root: Option<IndirectCache>,
    double_leaf: Option<IndirectCache>,
    dirty: bool,
    pending: Pending,
}

impl<'a> InodeView<'a> {
    pub fn new(id: u32, inode: OnDiskInode, log: &'a Mutex<SegmentManager>, block_size: u32) -> Self {
        Self {
            id,
            inode,
            log,
            block_size,
            single: None,
            double_root: None,
            double_leaf: None,
            dirty: false,
            pending: Pending::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn inode(&self) -> &OnDiskInode {
        &self.inode
    }

    pub fn inode_mut(&mut self) -> &mut OnDiskInode {
        self.dirty = true;
        &mut self.inode
    }

    pub fn size(&self) -> u32 {
        self.inode.size
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    /// Whether the inode record changed and must be appended again.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Retires every copy this view superseded. Call once the inode record
    /// pointing at the new copies is in the log, or the inode is gone.
    pub fn commit(&mut self) {
        let mut log = self.log.lock();
        for (addr, size) in self.pending.retired.drain(..) {
            log.discard(addr, size);
        }
        self.pending.appended.clear();
    }

    /// Retires everything this view appended; the copies it meant to
    /// supersede stay live.
    pub fn abort(&mut self) {
        let mut log = self.log.lock();
        if !self.pending.appended.is_empty() {
            debug!(
                "inode {}: dropping {} unreferenced appends",
                self.id,
                self.pending.appended.len()
            );
        }
        for (addr, size) in self.pending.appended.drain(..) {
            log.discard(addr, size);
        }
        self.pending.retired.clear();
    }

    fn per_block(&self) -> u32 {
        self.block_size / 4
    }

    fn load_table(&self, index: u32, addr: u32) -> LfsResult<IndirectCache> {
        debug_assert!(is_real_addr(addr));
        let mut buf = vec![0u8; self.block_size as usize];
        self.log.lock().read(addr, &mut buf)?;
        let table = (0..self.per_block() as usize)
            .map(|i| le_u32!(buf, 4 * i))
            .collect();
        Ok(IndirectCache {
            index,
            addr,
            table,
            dirty: false,
        })
    }

    fn top_cache(&mut self, slot: u32) -> &mut Option<IndirectCache> {
        if slot == INDIRECT1_SLOT {
            &mut self.single
        } else {
            &mut self.double_root
        }
    }

    fn top_addr(&mut self, slot: u32) -> &mut u32 {
        if slot == INDIRECT1_SLOT {
            &mut self.inode.indirect1
        } else {
            &mut self.inode.indirect2
        }
    }

    /// The table `slot` of the inode points to; with `allocate`, a hole is
    /// replaced by an empty placeholder table.
    fn fetch_top(&mut self, slot: u32, allocate: bool) -> LfsResult<Option<&mut IndirectCache>> {
        if self.top_cache(slot).is_none() {
            let addr = *self.top_addr(slot);
            let cache = if addr == INVALID_ADDR {
                if !allocate {
                    return Ok(None);
                }
                *self.top_addr(slot) = TEMPORARY_ADDR;
                self.dirty = true;
                IndirectCache::empty(0, self.per_block())
            } else {
                self.load_table(0, addr)?
            };
            *self.top_cache(slot) = Some(cache);
        }
        Ok(self.top_cache(slot).as_mut())
    }

    /// Leaf `i1` below the double-indirect root. Only one leaf is cached;
    /// asking for another writes the current one back first.
    fn fetch_leaf(&mut self, i1: u32, allocate: bool) -> LfsResult<Option<&mut IndirectCache>> {
        if self.double_leaf.as_ref().map_or(false, |c| c.index == i1) {
            return Ok(self.double_leaf.as_mut());
        }
        self.evict_leaf()?;
        let addr = match self.fetch_top(INDIRECT2_SLOT, allocate)? {
            None => return Ok(None),
            Some(root) => {
                let addr = root.table[i1 as usize];
                if addr == INVALID_ADDR {
                    if !allocate {
                        return Ok(None);
                    }
                    root.table[i1 as usize] = TEMPORARY_ADDR;
                    root.dirty = true;
                }
                addr
            }
        };
        let cache = if addr == INVALID_ADDR {
            IndirectCache::empty(i1, self.per_block())
        } else {
            self.load_table(i1, addr)?
        };
        self.double_leaf = Some(cache);
        Ok(self.double_leaf.as_mut())
    }

    /// Appends a dirty table and returns its new address. A table with no
    /// entries left is dropped instead and its old copy retired.
    fn write_back(&mut self, pos: BlockPos, cache: IndirectCache) -> LfsResult<u32> {
        if cache.table.iter().all(|&addr| addr == INVALID_ADDR) {
            self.pending.retire(cache.addr, self.block_size);
            debug!("inode {}: pointer block {} emptied", self.id, pos);
            return Ok(INVALID_ADDR);
        }
        debug_assert!(!cache.table.contains(&TEMPORARY_ADDR));
        let object = LogObject::Block {
            data: &cache.to_bytes(),
            inode_id: self.id,
            pos,
        };
        append(self.log, &mut self.pending, object, cache.addr)
    }

    fn evict_leaf(&mut self) -> LfsResult<()> {
        if let Some(Evicted::Dirty(cache)) = evict(&mut self.double_leaf) {
            let index = cache.index;
            let addr = self.write_back(BlockPos::Level2(INDIRECT2_SLOT, index), cache)?;
            let root = self
                .fetch_top(INDIRECT2_SLOT, false)?
                .ok_or(LfsError::Corrupted)?;
            root.table[index as usize] = addr;
            root.dirty = true;
        }
        Ok(())
    }

    /// Writes every dirty cached table back, leaves first, and points the
    /// inode at the results.
    fn flush_caches(&mut self) -> LfsResult<()> {
        self.evict_leaf()?;
        for slot in [INDIRECT2_SLOT, INDIRECT1_SLOT] {
            if let Some(Evicted::Dirty(cache)) = evict(self.top_cache(slot)) {
                let addr = self.write_back(BlockPos::Level1(slot), cache)?;
                *self.top_addr(slot) = addr;
                self.dirty = true;
            }
        }
        Ok(())
    }

    /// Current address stored at `pos`.
    fn pointer(&mut self, pos: BlockPos, allocate: bool) -> LfsResult<u32> {
        let addr = match pos {
            BlockPos::Level1(INDIRECT1_SLOT) => self.inode.indirect1,
            BlockPos::Level1(INDIRECT2_SLOT) => self.inode.indirect2,
            BlockPos::Level1(i0) => self.inode.directs[i0 as usize],
            BlockPos::Level2(slot, i1) => self
                .fetch_top(slot, allocate)?
                .map_or(INVALID_ADDR, |c| c.table[i1 as usize]),
            BlockPos::Level3(_, i1, i2) => self
                .fetch_leaf(i1, allocate)?
                .map_or(INVALID_ADDR, |c| c.table[i2 as usize]),
        };
        Ok(addr)
    }

    fn set_pointer(&mut self, pos: BlockPos, addr: u32) -> LfsResult<()> {
        match pos {
            BlockPos::Level1(i0) if i0 < DIRECT_CNT => self.inode.directs[i0 as usize] = addr,
            BlockPos::Level1(slot) => *self.top_addr(slot) = addr,
            BlockPos::Level2(slot, i1) => {
                let cache = self.fetch_top(slot, false)?.ok_or(LfsError::Corrupted)?;
                cache.table[i1 as usize] = addr;
                cache.dirty = true;
            }
            BlockPos::Level3(_, i1, i2) => {
                let cache = self.fetch_leaf(i1, false)?.ok_or(LfsError::Corrupted)?;
                cache.table[i2 as usize] = addr;
                cache.dirty = true;
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Visits every block overlapping `[offset, offset + len)` in order and
    /// applies the visitor's decision to its pointer. With `allocate`, holes
    /// in the pointer tree are filled with placeholder tables so the visitor
    /// can place new blocks. Cached tables are written back at the end.
    pub fn for_each_block<F>(
        &mut self,
        offset: u32,
        len: u32,
        allocate: bool,
        mut visit: F,
    ) -> LfsResult<()>
    where
        F: FnMut(BlockVisit) -> LfsResult<Decision>,
    {
        let bs = self.block_size as u64;
        let end = offset as u64 + len as u64;
        let mut cur = offset as u64;
        while cur < end {
            let block_start = cur / bs * bs;
            let within = cur - block_start;
            let chunk = (bs - within).min(end - cur);
            let pos = BlockPos::translate(block_start as u32, self.block_size)?;
            let addr = self.pointer(pos, allocate)?;
            let decision = visit(BlockVisit {
                addr,
                pos,
                offset: within as u32,
                len: chunk as u32,
                file_offset: cur as u32,
            })?;
            if let Decision::Replace(new) = decision {
                if new != addr {
                    self.set_pointer(pos, new)?;
                }
            }
            cur += chunk;
        }
        self.flush_caches()
    }

    /// Reads up to `buf.len()` bytes at `offset`, stopping at end of file.
    /// Holes read as zeros.
    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> LfsResult<usize> {
        if offset >= self.inode.size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min((self.inode.size - offset) as u64) as u32;
        let log = self.log;
        self.for_each_block(offset, n, false, |v| {
            let start = (v.file_offset - offset) as usize;
            let dst = &mut buf[start..start + v.len as usize];
            if is_real_addr(v.addr) {
                log.lock().read(v.addr + v.offset, dst)?;
            } else {
                dst.fill(0);
            }
            Ok(Decision::Keep)
        })?;
        Ok(n as usize)
    }

    /// Writes `data` at `offset`, extending the file when needed. Whole
    /// blocks are appended as given; partial blocks are merged with their
    /// previous content first.
    pub fn write(&mut self, offset: u32, data: &[u8], now: u32) -> LfsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset as u64 + data.len() as u64;
        if end > BlockPos::max_file_size(self.block_size) as u64 {
            return Err(LfsError::FileTooLarge);
        }
        let log = self.log;
        let id = self.id;
        let bs = self.block_size;
        let mut pending = core::mem::take(&mut self.pending);
        let walked = self.for_each_block(offset, data.len() as u32, true, |v| {
            let start = (v.file_offset - offset) as usize;
            let src = &data[start..start + v.len as usize];
            let merged;
            let bytes = if v.len == bs {
                src
            } else {
                let mut block = vec![0u8; bs as usize];
                if is_real_addr(v.addr) {
                    log.lock().read(v.addr, &mut block)?;
                }
                let at = v.offset as usize;
                block[at..at + src.len()].copy_from_slice(src);
                merged = block;
                &merged[..]
            };
            let object = LogObject::Block {
                data: bytes,
                inode_id: id,
                pos: v.pos,
            };
            Ok(Decision::Replace(append(log, &mut pending, object, v.addr)?))
        });
        self.pending.absorb(pending);
        walked?;
        self.inode.size = self.inode.size.max(end as u32);
        self.inode.modify_time = now;
        self.inode.change_time = now;
        self.dirty = true;
        Ok(())
    }

    /// Sets the file size. Shrinking retires every block past the new end
    /// and zeroes the rest of the new last block; growing leaves a hole.
    pub fn truncate(&mut self, size: u32, now: u32) -> LfsResult<()> {
        let old = self.inode.size;
        if size < old {
            let bs = self.block_size;
            let log = self.log;
            let id = self.id;
            let tail = size % bs;
            let mut pending = core::mem::take(&mut self.pending);
            if tail != 0 {
                let len = (bs - tail).min(old - size);
                let walked = self.for_each_block(size, len, false, |v| {
                    if !is_real_addr(v.addr) {
                        return Ok(Decision::Keep);
                    }
                    let mut block = vec![0u8; bs as usize];
                    log.lock().read(v.addr, &mut block)?;
                    let at = v.offset as usize;
                    block[at..at + v.len as usize].fill(0);
                    let object = LogObject::Block {
                        data: &block,
                        inode_id: id,
                        pos: v.pos,
                    };
                    Ok(Decision::Replace(append(log, &mut pending, object, v.addr)?))
                });
                if let Err(e) = walked {
                    self.pending.absorb(pending);
                    return Err(e);
                }
            }
            let keep = ((size as u64 + bs as u64 - 1) / bs as u64 * bs as u64).min(old as u64) as u32;
            let walked = if keep < old {
                self.for_each_block(keep, old - keep, false, |v| {
                    if !is_real_addr(v.addr) {
                        return Ok(Decision::Keep);
                    }
                    pending.retire(v.addr, bs);
                    Ok(Decision::Replace(INVALID_ADDR))
                })
            } else {
                Ok(())
            };
            self.pending.absorb(pending);
            walked?;
        }
        self.inode.size = size;
        self.inode.modify_time = now;
        self.inode.change_time = now;
        self.dirty = true;
        Ok(())
    }

    /// Re-appends every candidate `(addr, position code)` the tree still
    /// points at. Returns whether anything moved, in which case the inode
    /// record must be appended again.
    pub fn rewrite_if_hit(&mut self, candidates: &[(u32, u32)]) -> LfsResult<bool> {
        let bs = self.block_size;
        let mut moved = 0;
        for &(addr, code) in candidates {
            let pos = match BlockPos::decode(code) {
                Some(pos) => pos,
                None => {
                    warn!("inode {}: bad position code {:#x} at {}", self.id, code, addr);
                    continue;
                }
            };
            if self.pointer(pos, false)? != addr {
                continue;
            }
            if pos.is_data() {
                let mut block = vec![0u8; bs as usize];
                self.log.lock().read(addr, &mut block)?;
                let object = LogObject::Block {
                    data: &block,
                    inode_id: self.id,
                    pos,
                };
                let new = append(self.log, &mut self.pending, object, addr)?;
                self.set_pointer(pos, new)?;
            } else {
                // A live pointer block moves when its cached copy is
                // written back.
                let cache = match pos {
                    BlockPos::Level1(slot) => self.fetch_top(slot, false)?,
                    BlockPos::Level2(_, i1) => self.fetch_leaf(i1, false)?,
                    BlockPos::Level3(..) => None,
                };
                cache.ok_or(LfsError::Corrupted)?.dirty = true;
                self.dirty = true;
            }
            moved += 1;
        }
        self.flush_caches()?;
        if moved > 0 {
            debug!("inode {}: relocated {} blocks", self.id, moved);
        }
        Ok(moved > 0)
    }

    /// Whole content of the file.
    pub fn read_all(&mut self) -> LfsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.inode.size as usize];
        self.read(0, &mut buf)?;
        Ok(buf)
    }

    /// Live `(name, inode id)` entries of a directory, oldest first.
    pub fn list_entries(&mut self) -> LfsResult<Vec<(String, u32)>> {
        let content = self.read_all()?;
        dir::live_entries(&content)
    }

    pub fn find_entry(&mut self, name: &str) -> LfsResult<Option<u32>> {
        Ok(self
            .list_entries()?
            .into_iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, id)| id))
    }

    fn append(&mut self, record: DirRecord<'_>, now: u32) -> LfsResult<()> {
        let size = self.inode.size;
        self.write(size, &record.encode(), now)
    }

    /// Adds `name -> inode_id`; `DuplicateEntry` when the name is taken.
    pub fn push_entry(&mut self, name: &str, inode_id: u32, now: u32) -> LfsResult<()> {
        dir::validate_name(name)?;
        if self.find_entry(name)?.is_some() {
            return Err(LfsError::DuplicateEntry);
        }
        self.append(
            DirRecord {
                name,
                inode_id,
                deleted: false,
            },
            now,
        )
    }

    /// Hides `name` behind a tombstone and returns the id it pointed to.
    pub fn erase_entry(&mut self, name: &str, now: u32) -> LfsResult<u32> {
        let inode_id = self.find_entry(name)?.ok_or(LfsError::NoSuchPathEntry)?;
        self.append(
            DirRecord {
                name,
                inode_id,
                deleted: true,
            },
            now,
        )?;
        Ok(inode_id)
    }
}
