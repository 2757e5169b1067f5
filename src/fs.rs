//! The mounted filesystem: path resolution, file operations, checkpoints
//! and cleaning.
//!
//! Ordinary calls hold the checkpoint lock shared and serialize on a
//! striped per-inode lock; [`NaiveFs::checkpoint`] and
//! [`NaiveFs::collect_garbage`] hold it exclusively so they observe a
//! consistent index map and status table.

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};
use smallvec::SmallVec;
use spin::{Mutex, MutexGuard, RwLock};

use crate::{
    common::{crc32, LfsAttr, LfsError, LfsFsStat, LfsResult, OpenFlags},
    config::{Geometry, LfsConfig},
    device::BlockDevice,
    dir,
    disk_inode::{OnDiskInode, INODE_SIZE, INVALID_ADDR},
    imap::IndexMap,
    inode::InodeView,
    le_u32,
    log_manager::{GcPlan, LogObject, SegmentManager, SegmentStatus},
};

pub const ROOT_ID: u32 = 0;

const LOCK_STRIPES: usize = 64;

/// Seconds since the epoch, stamped on inodes.
pub type Clock = fn() -> u32;

#[cfg(feature = "std")]
fn default_clock() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(not(feature = "std"))]
fn default_clock() -> u32 {
    0
}

/// The two places a checkpoint region copy lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrSlot {
    Start,
    End,
}

struct Checkpoint {
    slot: CrSlot,
    imap: IndexMap,
    status: Vec<SegmentStatus>,
}

/// Which entries a removal accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Any,
    File,
    Directory,
}

fn split_path(path: &str) -> SmallVec<[&str; 8]> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

pub struct NaiveFs {
    config: LfsConfig,
    geometry: Geometry,
    device: Arc<dyn BlockDevice>,
    cr_lock: RwLock<()>,
    segs: Mutex<SegmentManager>,
    imap: Mutex<IndexMap>,
    inode_locks: Vec<Mutex<()>>,
    files: Mutex<BTreeMap<u32, u32>>,
    next_fd: AtomicU32,
    next_id: AtomicU32,
    current_cr: Mutex<Option<CrSlot>>,
    free_segments: Arc<AtomicU32>,
    clock: Clock,
}

impl NaiveFs {
    pub fn mount(device: Arc<dyn BlockDevice>, config: LfsConfig) -> LfsResult<Self> {
        Self::mount_with_clock(device, config, default_clock)
    }

    /// Mounts `device`, recovering from the newer valid checkpoint copy or
    /// formatting it when neither copy is valid.
    pub fn mount_with_clock(
        device: Arc<dyn BlockDevice>,
        config: LfsConfig,
        clock: Clock,
    ) -> LfsResult<Self> {
        let geometry = Geometry::new(&config, device.capacity())?;
        let start = Self::read_checkpoint(device.as_ref(), &geometry, CrSlot::Start)?;
        let end = Self::read_checkpoint(device.as_ref(), &geometry, CrSlot::End)?;
        let chosen = match (start, end) {
            (Some(a), Some(b)) => Some(if b.imap.version() > a.imap.version() { b } else { a }),
            (a, b) => a.or(b),
        };
        let (imap, status, current) = match chosen {
            Some(cp) => {
                info!(
                    "recovered checkpoint version {} from the {:?} slot ({} inodes)",
                    cp.imap.version(),
                    cp.slot,
                    cp.imap.count()
                );
                (cp.imap, cp.status, Some(cp.slot))
            }
            None => {
                info!(
                    "no valid checkpoint, formatting {} segments of {} bytes",
                    geometry.num_segments, geometry.segment_size
                );
                (
                    IndexMap::new(geometry.max_inodes),
                    vec![SegmentStatus::default(); geometry.num_segments as usize],
                    None,
                )
            }
        };
        let segs = SegmentManager::new(&config, geometry, device.clone(), status, imap.version())?;
        let free_segments = segs.free_segments_handle();
        let next_id = imap.max_id().map_or(ROOT_ID + 1, |id| id + 1);
        let fs = Self {
            config,
            geometry,
            device,
            cr_lock: RwLock::new(()),
            segs: Mutex::new(segs),
            imap: Mutex::new(imap),
            inode_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            files: Mutex::new(BTreeMap::new()),
            next_fd: AtomicU32::new(1),
            next_id: AtomicU32::new(next_id),
            current_cr: Mutex::new(current),
            free_segments,
            clock,
        };
        if !fs.imap.lock().contains(ROOT_ID) {
            let root = OnDiskInode::make_dir(fs.now(), 0, 0);
            fs.store_inode(ROOT_ID, &root)?;
            debug!("created root directory");
        }
        Ok(fs)
    }

    fn slot_addr(&self, slot: CrSlot) -> u32 {
        match slot {
            CrSlot::Start => self.geometry.cr_start(),
            CrSlot::End => self.geometry.cr_end(),
        }
    }

    /// One checkpoint copy; `None` when its checksum does not match.
    fn read_checkpoint(
        device: &dyn BlockDevice,
        geometry: &Geometry,
        slot: CrSlot,
    ) -> LfsResult<Option<Checkpoint>> {
        let addr = match slot {
            CrSlot::Start => geometry.cr_start(),
            CrSlot::End => geometry.cr_end(),
        };
        let mut buf = vec![0u8; geometry.cr_size as usize];
        device.read_at(addr, &mut buf)?;
        let imap_len = geometry.imap_size() as usize;
        let payload = imap_len + geometry.status_table_size() as usize;
        if le_u32!(buf, payload) != crc32(&buf[..payload]) {
            if buf.iter().any(|&b| b != 0) {
                warn!("checkpoint copy in the {:?} slot is torn, ignoring it", slot);
            }
            return Ok(None);
        }
        let imap = IndexMap::from_bytes(&buf[..imap_len], geometry.max_inodes);
        let status = SegmentManager::status_from_bytes(&buf[imap_len..payload], geometry.num_segments);
        if status.iter().any(|s| s.occupied > geometry.segment_size) {
            return Err(LfsError::Corrupted);
        }
        Ok(Some(Checkpoint { slot, imap, status }))
    }

    fn now(&self) -> u32 {
        (self.clock)()
    }

    fn lock_inode(&self, id: u32) -> MutexGuard<'_, ()> {
        self.inode_locks[id as usize % LOCK_STRIPES].lock()
    }

    /// Locks two inodes in stripe order.
    fn lock_pair(&self, a: u32, b: u32) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (sa, sb) = (a as usize % LOCK_STRIPES, b as usize % LOCK_STRIPES);
        if sa == sb {
            return (self.inode_locks[sa].lock(), None);
        }
        let (low, high) = if sa < sb { (sa, sb) } else { (sb, sa) };
        let first = self.inode_locks[low].lock();
        let second = self.inode_locks[high].lock();
        (first, Some(second))
    }

    fn load(&self, id: u32) -> LfsResult<InodeView<'_>> {
        let addr = self.imap.lock().get(id)?;
        let mut buf = [0u8; INODE_SIZE as usize];
        self.segs.lock().read(addr, &mut buf)?;
        Ok(InodeView::new(
            id,
            OnDiskInode::from_bytes(&buf),
            &self.segs,
            self.geometry.block_size,
        ))
    }

    fn load_dir(&self, id: u32) -> LfsResult<InodeView<'_>> {
        let view = self.load(id)?;
        if !view.is_dir() {
            return Err(LfsError::NotDirectory);
        }
        Ok(view)
    }

    fn load_file(&self, id: u32) -> LfsResult<InodeView<'_>> {
        let view = self.load(id)?;
        if view.is_dir() {
            return Err(LfsError::IsDirectory);
        }
        Ok(view)
    }

    /// Appends the inode record of `id` and points the imap at it.
    fn store_inode(&self, id: u32, inode: &OnDiskInode) -> LfsResult<()> {
        let old = self.imap.lock().get(id).unwrap_or(INVALID_ADDR);
        let addr = self.segs.lock().push(
            LogObject::Inode {
                inode,
                inode_id: id,
            },
            old,
        )?;
        self.imap.lock().update(id, addr)?;
        Ok(())
    }

    fn store(&self, view: &InodeView<'_>) -> LfsResult<()> {
        self.store_inode(view.id(), view.inode())
    }

    /// Appends the view's inode record when it changed and settles the
    /// view's log changes. If `walked` or the append failed, the view's
    /// appends are dropped and the stored inode stays as it was.
    fn finish(&self, view: &mut InodeView<'_>, walked: LfsResult<()>) -> LfsResult<()> {
        let stored = walked.and_then(|()| {
            if view.is_dirty() {
                self.store(view)
            } else {
                Ok(())
            }
        });
        match stored {
            Ok(()) => view.commit(),
            Err(_) => view.abort(),
        }
        stored
    }

    /// Runs a mutating call under the shared lock. When the log only has
    /// segments left that the last checkpoint still holds, writes a
    /// checkpoint and runs the call once more.
    fn mutate<T>(&self, op: impl Fn() -> LfsResult<T>) -> LfsResult<T> {
        let first = {
            let _cr = self.cr_lock.read();
            op()
        };
        match first {
            Err(LfsError::CheckpointRequired) => {
                info!("free segments are held by the last checkpoint, checkpointing");
                self.checkpoint()?;
                let _cr = self.cr_lock.read();
                op()
            }
            other => other,
        }
    }

    fn alloc_id(&self) -> LfsResult<u32> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id >= self.geometry.max_inodes {
            self.next_id.store(self.geometry.max_inodes, Ordering::SeqCst);
            return Err(LfsError::InodeTableFull);
        }
        Ok(id)
    }

    fn alloc_fd(&self, id: u32) -> u32 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.files.lock().insert(fd, id);
        fd
    }

    /// Inode behind an open descriptor.
    pub fn fd_inode(&self, fd: u32) -> LfsResult<u32> {
        self.files
            .lock()
            .get(&fd)
            .copied()
            .ok_or(LfsError::NoFileHandle(fd))
    }

    fn lookup_in(&self, parent: u32, name: &str) -> LfsResult<u32> {
        self.load_dir(parent)?
            .find_entry(name)?
            .ok_or(LfsError::NoSuchPathEntry)
    }

    fn resolve(&self, path: &str) -> LfsResult<u32> {
        let id = split_path(path)
            .iter()
            .try_fold(ROOT_ID, |id, name| self.lookup_in(id, name))?;
        debug!("resolved {} to inode {}", path, id);
        Ok(id)
    }

    fn resolve_parent<'p>(&self, path: &'p str) -> LfsResult<(u32, &'p str)> {
        let mut parts = split_path(path);
        let name = parts.pop().ok_or(LfsError::InvalidName)?;
        let parent = parts
            .iter()
            .try_fold(ROOT_ID, |id, part| self.lookup_in(id, part))?;
        Ok((parent, name))
    }

    /// Gives `inode` a fresh id and links it into `dir` as `name`.
    fn link_new(&self, dir: &mut InodeView<'_>, name: &str, inode: OnDiskInode) -> LfsResult<u32> {
        let id = self.alloc_id()?;
        self.store_inode(id, &inode)?;
        let linked = dir.push_entry(name, id, self.now());
        if let Err(e) = self.finish(dir, linked) {
            let removed = self.imap.lock().remove(id);
            if let Ok(addr) = removed {
                self.segs.lock().discard(addr, INODE_SIZE);
            }
            return Err(e);
        }
        debug!("linked inode {} as {:?} in {}", id, name, dir.id());
        Ok(id)
    }

    fn open_in(&self, parent: u32, name: &str, flags: OpenFlags) -> LfsResult<u32> {
        dir::validate_name(name)?;
        let id = {
            let _guard = self.lock_inode(parent);
            let mut dir = self.load_dir(parent)?;
            match dir.find_entry(name)? {
                Some(_) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) => {
                    return Err(LfsError::DuplicateEntry)
                }
                Some(id) => id,
                None if flags.contains(OpenFlags::CREATE) => {
                    let inode = OnDiskInode::make_file(self.now(), 0, 0);
                    self.link_new(&mut dir, name, inode)?
                }
                None => return Err(LfsError::NoSuchPathEntry),
            }
        };
        if flags.contains(OpenFlags::TRUNCATE) {
            self.resize(id, 0)?;
        }
        Ok(id)
    }

    fn resize(&self, id: u32, size: u32) -> LfsResult<()> {
        let _guard = self.lock_inode(id);
        let mut view = self.load_file(id)?;
        if view.size() == size {
            return Ok(());
        }
        let walked = view.truncate(size, self.now());
        self.finish(&mut view, walked)
    }

    fn unlink_in(&self, parent: u32, name: &str, removal: Removal) -> LfsResult<()> {
        dir::validate_name(name)?;
        loop {
            let child = self.lookup_in(parent, name)?;
            let _guards = self.lock_pair(parent, child);
            let mut dir = self.load_dir(parent)?;
            match dir.find_entry(name)? {
                None => return Err(LfsError::NoSuchPathEntry),
                // Replaced while unlocked, look again.
                Some(id) if id != child => continue,
                Some(_) => {}
            }
            let mut target = self.load(child)?;
            match (removal, target.is_dir()) {
                (Removal::File, true) => return Err(LfsError::IsDirectory),
                (Removal::Directory, false) => return Err(LfsError::NotDirectory),
                _ => {}
            }
            if target.is_dir() && !target.list_entries()?.is_empty() {
                return Err(LfsError::NotEmpty);
            }
            let now = self.now();
            if let Err(e) = target.truncate(0, now) {
                target.abort();
                return Err(e);
            }
            let erased = dir.erase_entry(name, now).map(|_| ());
            if let Err(e) = self.finish(&mut dir, erased) {
                target.abort();
                return Err(e);
            }
            // The record is dropped with the imap entry, not re-appended.
            target.commit();
            let old = self.imap.lock().remove(child)?;
            self.segs.lock().discard(old, INODE_SIZE);
            debug!("unlinked {:?} (inode {}) from {}", name, child, parent);
            return Ok(());
        }
    }

    fn attr_of(&self, id: u32) -> LfsResult<LfsAttr> {
        let view = self.load(id)?;
        let inode = view.inode();
        Ok(LfsAttr {
            ino: id,
            size: inode.size,
            mode: inode.mode(),
            uid: inode.uid,
            gid: inode.gid,
            link_cnt: inode.link_cnt,
            atime: inode.access_time,
            mtime: inode.modify_time,
            ctime: inode.change_time,
            blocks: inode.st_blocks(self.geometry.block_size),
        })
    }

    pub fn config(&self) -> &LfsConfig {
        &self.config
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Opens `path`, creating or truncating it as `flags` ask, and returns a
    /// descriptor. `/` opens the root directory.
    pub fn open(&self, path: &str, flags: OpenFlags) -> LfsResult<u32> {
        let id = self.mutate(|| {
            if split_path(path).is_empty() {
                return Ok(ROOT_ID);
            }
            let (parent, name) = self.resolve_parent(path)?;
            self.open_in(parent, name, flags)
        })?;
        Ok(self.alloc_fd(id))
    }

    pub fn close(&self, fd: u32) -> LfsResult<()> {
        self.files
            .lock()
            .remove(&fd)
            .map(|_| ())
            .ok_or(LfsError::NoFileHandle(fd))
    }

    pub fn mkdir(&self, path: &str) -> LfsResult<u32> {
        self.mutate(|| {
            let (parent, name) = self.resolve_parent(path)?;
            self.mkdir_in(parent, name)
        })
    }

    fn mkdir_in(&self, parent: u32, name: &str) -> LfsResult<u32> {
        dir::validate_name(name)?;
        let _guard = self.lock_inode(parent);
        let mut dir = self.load_dir(parent)?;
        if dir.find_entry(name)?.is_some() {
            return Err(LfsError::DuplicateEntry);
        }
        self.link_new(&mut dir, name, OnDiskInode::make_dir(self.now(), 0, 0))
    }

    /// Removes `path`; its storage is reclaimed immediately.
    pub fn unlink(&self, path: &str) -> LfsResult<()> {
        self.mutate(|| {
            let (parent, name) = self.resolve_parent(path)?;
            self.unlink_in(parent, name, Removal::Any)
        })
    }

    pub fn truncate(&self, fd: u32, size: u32) -> LfsResult<()> {
        self.mutate(|| self.resize(self.fd_inode(fd)?, size))
    }

    /// Reads into `buf` from `offset`; returns the bytes read, 0 at end of
    /// file.
    pub fn read(&self, fd: u32, buf: &mut [u8], offset: u32) -> LfsResult<usize> {
        let _cr = self.cr_lock.read();
        let mut view = self.load_file(self.fd_inode(fd)?)?;
        view.read(offset, buf)
    }

    pub fn write(&self, fd: u32, data: &[u8], offset: u32) -> LfsResult<usize> {
        self.mutate(|| {
            let id = self.fd_inode(fd)?;
            let _guard = self.lock_inode(id);
            let mut view = self.load_file(id)?;
            let walked = view.write(offset, data, self.now());
            self.finish(&mut view, walked)
        })?;
        Ok(data.len())
    }

    /// Names in the directory at `path`, in creation order.
    pub fn readdir(&self, path: &str) -> LfsResult<Vec<String>> {
        let _cr = self.cr_lock.read();
        let id = self.resolve(path)?;
        let entries = self.load_dir(id)?.list_entries()?;
        Ok(entries.into_iter().map(|(name, _)| name).collect())
    }

    pub fn getattr(&self, path: &str) -> LfsResult<LfsAttr> {
        let _cr = self.cr_lock.read();
        self.attr_of(self.resolve(path)?)
    }

    pub fn lookup(&self, parent: u32, name: &str) -> LfsResult<u32> {
        let _cr = self.cr_lock.read();
        self.lookup_in(parent, name)
    }

    pub fn attr(&self, id: u32) -> LfsResult<LfsAttr> {
        let _cr = self.cr_lock.read();
        self.attr_of(id)
    }

    /// `(name, inode id)` entries of directory `id`.
    pub fn read_dir(&self, id: u32) -> LfsResult<Vec<(String, u32)>> {
        let _cr = self.cr_lock.read();
        self.load_dir(id)?.list_entries()
    }

    pub fn open_inode(&self, id: u32) -> LfsResult<u32> {
        let _cr = self.cr_lock.read();
        self.imap.lock().get(id)?;
        Ok(self.alloc_fd(id))
    }

    /// Opens `name` in directory `parent`; returns the inode id and a
    /// descriptor.
    pub fn open_at(&self, parent: u32, name: &str, flags: OpenFlags) -> LfsResult<(u32, u32)> {
        let id = self.mutate(|| self.open_in(parent, name, flags))?;
        Ok((id, self.alloc_fd(id)))
    }

    pub fn mkdir_at(&self, parent: u32, name: &str) -> LfsResult<u32> {
        self.mutate(|| self.mkdir_in(parent, name))
    }

    pub fn unlink_at(&self, parent: u32, name: &str) -> LfsResult<()> {
        self.mutate(|| self.unlink_in(parent, name, Removal::Any))
    }

    /// Like [`Self::unlink_at`], refusing directories with `IsDirectory`.
    pub fn remove_file_at(&self, parent: u32, name: &str) -> LfsResult<()> {
        self.mutate(|| self.unlink_in(parent, name, Removal::File))
    }

    /// Like [`Self::unlink_at`], refusing files with `NotDirectory`.
    pub fn remove_dir_at(&self, parent: u32, name: &str) -> LfsResult<()> {
        self.mutate(|| self.unlink_in(parent, name, Removal::Directory))
    }

    pub fn set_size(&self, id: u32, size: u32) -> LfsResult<()> {
        self.mutate(|| self.resize(id, size))
    }

    pub fn statfs(&self) -> LfsFsStat {
        LfsFsStat {
            block_size: self.geometry.block_size,
            segment_size: self.geometry.segment_size,
            total_segments: self.geometry.num_segments,
            free_segments: self.free_segments(),
            max_inodes: self.geometry.max_inodes,
            active_inodes: self.imap.lock().count(),
        }
    }

    /// Free segments, read without any lock.
    pub fn free_segments(&self) -> u32 {
        self.free_segments.load(Ordering::SeqCst)
    }

    /// Version of the last checkpoint written or recovered.
    pub fn checkpoint_version(&self) -> u32 {
        self.imap.lock().version()
    }

    /// Flushes the open segment and writes the index map and segment table
    /// to the checkpoint slot not used last time.
    pub fn checkpoint(&self) -> LfsResult<()> {
        let _cr = self.cr_lock.write();
        self.checkpoint_locked()
    }

    fn checkpoint_locked(&self) -> LfsResult<()> {
        let mut segs = self.segs.lock();
        segs.seal()?;
        let (version, imap_buf) = {
            let mut imap = self.imap.lock();
            let buf = imap.bump_and_get_buffer();
            (imap.version(), buf)
        };
        let mut buf = Vec::with_capacity(self.geometry.cr_size as usize);
        buf.extend_from_slice(&imap_buf);
        buf.extend_from_slice(&segs.status_buffer());
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.resize(self.geometry.cr_size as usize, 0);

        let slot = match *self.current_cr.lock() {
            Some(CrSlot::Start) => CrSlot::End,
            _ => CrSlot::Start,
        };
        self.device.write_at(self.slot_addr(slot), &buf)?;
        self.device.sync()?;
        *self.current_cr.lock() = Some(slot);
        segs.checkpoint_committed();
        segs.set_version(version);
        info!("checkpoint {} written to the {:?} slot", version, slot);
        // The next append retries if no segment is free right now.
        if let Err(e) = segs.advance() {
            warn!("log cannot continue after checkpoint {}: {}", version, e);
        }
        Ok(())
    }

    /// Cleans segments while free space is below the low watermark, then
    /// keeps going up to the high watermark as long as rounds make
    /// progress. Returns the number of segments cleaned.
    pub fn collect_garbage(&self) -> LfsResult<u32> {
        if self.free_segments() >= self.config.low_watermark {
            return Ok(0);
        }
        let _cr = self.cr_lock.write();
        let mut watermark = self.config.low_watermark;
        let mut cleaned = 0;
        loop {
            let before = self.free_segments();
            let plan = self.segs.lock().select_segments_below(watermark)?;
            if plan.segments.is_empty() {
                if cleaned == 0 {
                    warn!("gc: no segment worth cleaning ({} free)", before);
                }
                break;
            }
            match self.relocate(&plan) {
                Err(LfsError::CheckpointRequired) => {
                    self.checkpoint_locked()?;
                    self.relocate(&plan)?;
                }
                moved => moved?,
            }
            self.checkpoint_locked()?;
            cleaned += plan.segments.len() as u32;
            let after = self.free_segments();
            info!(
                "gc: cleaned segments {:?}, free {} -> {}",
                plan.segments, before, after
            );
            if after <= before {
                break;
            }
            watermark = self.config.high_watermark;
        }
        Ok(cleaned)
    }

    /// Moves everything in `plan` that is still live to the open segment.
    fn relocate(&self, plan: &GcPlan) -> LfsResult<()> {
        for (&id, candidates) in &plan.blocks {
            if !self.imap.lock().contains(id) {
                continue;
            }
            let mut view = self.load(id)?;
            let moved = view.rewrite_if_hit(candidates).map(|_| ());
            self.finish(&mut view, moved)?;
        }
        for &(id, addr) in &plan.inode_roots {
            if self.imap.lock().get(id).ok() == Some(addr) {
                let view = self.load(id)?;
                self.store(&view)?;
            }
        }
        Ok(())
    }

    /// Writes a final checkpoint.
    pub fn unmount(self) -> LfsResult<()> {
        self.checkpoint()?;
        info!("unmounted");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn disk_inode(&self, id: u32) -> LfsResult<OnDiskInode> {
        Ok(self.load(id)?.inode().clone())
    }

    /// Occupied bytes over all segments, the open one included.
    #[cfg(test)]
    pub(crate) fn live_bytes(&self) -> u64 {
        let segs = self.segs.lock();
        let flushed: u64 = (0..segs.num_segments())
            .map(|i| segs.status(i).occupied as u64)
            .sum();
        flushed + segs.open_occupied() as u64
    }

    /// Segments whose status entry says free.
    #[cfg(test)]
    pub(crate) fn free_in_table(&self) -> u32 {
        let segs = self.segs.lock();
        (0..segs.num_segments())
            .filter(|&i| segs.status(i).is_free())
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::MemDisk,
        test_util::{fixed_clock, small_config},
    };

    fn mount() -> (NaiveFs, Arc<MemDisk>) {
        let disk = Arc::new(MemDisk::new(1 << 20));
        let fs = NaiveFs::mount_with_clock(disk.clone(), small_config(), fixed_clock).unwrap();
        (fs, disk)
    }

    #[test]
    fn path_split_ignores_empty_components() {
        assert!(split_path("/").is_empty());
        assert_eq!(split_path("//a/b/").to_vec(), vec!["a", "b"]);
    }

    #[test]
    fn checkpoints_alternate_slots() {
        let (fs, disk) = mount();
        fs.checkpoint().unwrap();
        assert_eq!(*fs.current_cr.lock(), Some(CrSlot::Start));
        fs.checkpoint().unwrap();
        assert_eq!(*fs.current_cr.lock(), Some(CrSlot::End));
        let g = *fs.geometry();
        let start = NaiveFs::read_checkpoint(disk.as_ref(), &g, CrSlot::Start)
            .unwrap()
            .unwrap();
        let end = NaiveFs::read_checkpoint(disk.as_ref(), &g, CrSlot::End)
            .unwrap()
            .unwrap();
        assert_eq!(start.imap.version(), 1);
        assert_eq!(end.imap.version(), 2);
    }

    #[test]
    fn corrupted_copy_is_ignored() {
        let (fs, disk) = mount();
        fs.checkpoint().unwrap();
        disk.write_at(fs.geometry().cr_start() + 8, &[0xff; 4]).unwrap();
        let g = *fs.geometry();
        assert!(NaiveFs::read_checkpoint(disk.as_ref(), &g, CrSlot::Start)
            .unwrap()
            .is_none());
    }

    #[test]
    fn removal_checks_entry_kind() {
        let (fs, _) = mount();
        let dir = fs.mkdir("/d").unwrap();
        fs.open("/f", OpenFlags::CREATE).unwrap();
        assert_eq!(fs.remove_file_at(ROOT_ID, "d"), Err(LfsError::IsDirectory));
        assert_eq!(fs.remove_dir_at(ROOT_ID, "f"), Err(LfsError::NotDirectory));
        assert_eq!(fs.lookup(ROOT_ID, "d"), Ok(dir));
        fs.remove_file_at(ROOT_ID, "f").unwrap();
        fs.remove_dir_at(ROOT_ID, "d").unwrap();
        assert!(fs.read_dir(ROOT_ID).unwrap().is_empty());
    }

    #[test]
    fn descriptors_are_released() {
        let (fs, _) = mount();
        let fd = fs.open("/f", OpenFlags::CREATE).unwrap();
        assert_eq!(fs.fd_inode(fd).unwrap(), 1);
        fs.close(fd).unwrap();
        assert_eq!(fs.close(fd), Err(LfsError::NoFileHandle(fd)));
        assert_eq!(fs.write(fd, b"x", 0), Err(LfsError::NoFileHandle(fd)));
    }

    #[test]
    fn inode_ids_run_out() {
        let disk = Arc::new(MemDisk::new(1 << 20));
        let config = LfsConfig {
            max_inodes: 3,
            ..small_config()
        };
        let fs = NaiveFs::mount_with_clock(disk, config, fixed_clock).unwrap();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        assert_eq!(fs.mkdir("/c"), Err(LfsError::InodeTableFull));
        assert_eq!(fs.readdir("/").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn attributes_follow_writes() {
        let (fs, _) = mount();
        let fd = fs.open("/f", OpenFlags::CREATE).unwrap();
        fs.write(fd, &[1u8; 300], 0).unwrap();
        let attr = fs.getattr("/f").unwrap();
        assert_eq!(attr.size, 300);
        assert_eq!(attr.blocks, 2);
        assert!(attr.mode.is_file());
        assert_eq!(attr.mtime, fixed_clock());
        assert!(fs.getattr("/").unwrap().mode.is_dir());
        assert_eq!(fs.statfs().active_inodes, 2);
    }
}
