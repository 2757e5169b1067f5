//! FUSE front end. Kernel inode numbers are inode ids shifted by one so the
//! root directory gets `FUSE_ROOT_ID`.

use std::{
    ffi::OsStr,
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use log::{debug, error, info};

use crate::{
    background::BackgroundWorkers,
    common::{LfsAttr, LfsError, LfsResult, OpenFlags},
    dir::NAME_MAX,
    fs::NaiveFs,
};

const TTL: Duration = Duration::from_secs(1);

fn to_ino(id: u32) -> u64 {
    id as u64 + 1
}

fn to_id(ino: u64) -> u32 {
    (ino - 1) as u32
}

fn to_time(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs as u64)
}

fn to_name(name: &OsStr) -> LfsResult<&str> {
    name.to_str().ok_or(LfsError::InvalidName)
}

fn errno(err: LfsError) -> libc::c_int {
    debug!("fuse call failed: {}", err);
    err.to_errno()
}

pub struct NaiveFuse {
    fs: Arc<NaiveFs>,
    workers: Option<BackgroundWorkers>,
}

impl NaiveFuse {
    pub fn new(fs: Arc<NaiveFs>) -> Self {
        Self { fs, workers: None }
    }

    fn file_attr(&self, attr: &LfsAttr) -> FileAttr {
        FileAttr {
            ino: to_ino(attr.ino),
            size: attr.size as u64,
            blocks: attr.blocks as u64,
            atime: to_time(attr.atime),
            mtime: to_time(attr.mtime),
            ctime: to_time(attr.ctime),
            crtime: to_time(attr.ctime),
            kind: if attr.mode.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: attr.mode.permissions(),
            nlink: attr.link_cnt as u32,
            uid: attr.uid as u32,
            gid: attr.gid as u32,
            rdev: 0,
            blksize: self.fs.geometry().block_size,
            flags: 0,
        }
    }

    fn entry_attr(&self, id: u32) -> LfsResult<FileAttr> {
        Ok(self.file_attr(&self.fs.attr(id)?))
    }
}

impl Filesystem for NaiveFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        self.workers = Some(self.fs.spawn_background().map_err(errno)?);
        Ok(())
    }

    fn destroy(&mut self) {
        self.workers.take();
        match self.fs.checkpoint() {
            Ok(()) => info!("final checkpoint written"),
            Err(e) => error!("final checkpoint failed: {}", e),
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = to_name(name)
            .and_then(|name| self.fs.lookup(to_id(parent), name))
            .and_then(|id| self.entry_attr(id));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.entry_attr(to_id(ino)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let id = to_id(ino);
        if let Some(size) = size {
            let size = match u32::try_from(size) {
                Ok(size) => size,
                Err(_) => return reply.error(libc::EFBIG),
            };
            if let Err(e) = self.fs.set_size(id, size) {
                return reply.error(errno(e));
            }
        }
        match self.entry_attr(id) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = to_name(name)
            .and_then(|name| self.fs.mkdir_at(to_id(parent), name))
            .and_then(|id| self.entry_attr(id));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let mut open_flags = OpenFlags::CREATE;
        if flags & libc::O_EXCL != 0 {
            open_flags |= OpenFlags::EXCLUSIVE;
        }
        if flags & libc::O_TRUNC != 0 {
            open_flags |= OpenFlags::TRUNCATE;
        }
        let result = to_name(name)
            .and_then(|name| self.fs.open_at(to_id(parent), name, open_flags))
            .and_then(|(id, fd)| Ok((self.entry_attr(id)?, fd)));
        match result {
            Ok((attr, fd)) => reply.created(&TTL, &attr, 0, fd as u64, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let id = to_id(ino);
        let result = self.fs.open_inode(id).and_then(|fd| {
            if flags & libc::O_TRUNC != 0 {
                self.fs.set_size(id, 0)?;
            }
            Ok(fd)
        });
        match result {
            Ok(fd) => reply.opened(fd as u64, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.open_inode(to_id(ino)) {
            Ok(fd) => reply.opened(fd as u64, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = match u32::try_from(offset) {
            Ok(offset) => offset,
            Err(_) => return reply.data(&[]),
        };
        let mut buf = vec![0u8; size as usize];
        match self.fs.read(fh as u32, &mut buf, offset) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = match u32::try_from(offset) {
            Ok(offset) => offset,
            Err(_) => return reply.error(libc::EFBIG),
        };
        match self.fs.write(fh as u32, data, offset) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.close(fh as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.fs.close(fh as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.checkpoint() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match to_name(name).and_then(|name| self.fs.remove_file_at(to_id(parent), name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = to_name(name).and_then(|name| self.fs.remove_dir_at(to_id(parent), name));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let id = to_id(ino);
        let entries = match self.fs.read_dir(id) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno(e)),
        };
        let dots = [
            (ino, FileType::Directory, String::from(".")),
            (ino, FileType::Directory, String::from("..")),
        ];
        let listed = entries.into_iter().map(|(name, child)| {
            let kind = match self.fs.attr(child) {
                Ok(attr) if attr.mode.is_dir() => FileType::Directory,
                _ => FileType::RegularFile,
            };
            (to_ino(child), kind, name)
        });
        for (i, (child, kind, name)) in dots
            .into_iter()
            .chain(listed)
            .enumerate()
            .skip(offset as usize)
        {
            if reply.add(child, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stat = self.fs.statfs();
        let per_segment = (stat.segment_size / stat.block_size) as u64;
        reply.statfs(
            stat.total_segments as u64 * per_segment,
            stat.free_segments as u64 * per_segment,
            stat.free_segments as u64 * per_segment,
            stat.max_inodes as u64,
            (stat.max_inodes - stat.active_inodes) as u64,
            stat.block_size,
            NAME_MAX as u32,
            stat.block_size,
        );
    }
}

/// Mounts `fs` at `mountpoint` and serves requests until it is unmounted.
pub fn mount(fs: Arc<NaiveFs>, mountpoint: &Path) -> LfsResult<()> {
    let options = [
        MountOption::FSName(String::from("naivefs")),
        MountOption::DefaultPermissions,
    ];
    info!("mounting at {}", mountpoint.display());
    fuser::mount2(NaiveFuse::new(fs), mountpoint, &options).map_err(|e| {
        error!("fuse session ended with error: {}", e);
        LfsError::Io
    })
}
