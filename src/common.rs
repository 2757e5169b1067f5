//! Types shared by every layer of NaiveFS: the error enum, mode and open
//! flags, attribute records and the checksum used by checkpoint regions.

use bitflags::bitflags;
use onlyerror::Error;

/// Every failure a NaiveFS call can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LfsError {
    #[error("no such path entry")]
    NoSuchPathEntry,
    #[error("no index map entry for inode {0}")]
    NoIndexMapEntry(u32),
    #[error("entry already exists")]
    DuplicateEntry,
    #[error("no file handle {0}")]
    NoFileHandle(u32),
    #[error("device sync failed")]
    SyncFailed,
    #[error("object does not fit into an empty segment")]
    SegmentOverflow,
    #[error("offset beyond the largest addressable file")]
    FileTooLarge,
    #[error("no free segment left on the device")]
    OutOfSpace,
    #[error("free segments are held until the next checkpoint")]
    CheckpointRequired,
    #[error("inode table is full")]
    InodeTableFull,
    #[error("invalid entry name")]
    InvalidName,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("on-disk structure is corrupted")]
    Corrupted,
    #[error("device I/O error")]
    Io,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type LfsResult<T> = Result<T, LfsError>;

#[cfg(feature = "std")]
impl LfsError {
    /// The errno reported to the kernel for this error.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoSuchPathEntry | Self::NoIndexMapEntry(_) => libc::ENOENT,
            Self::DuplicateEntry => libc::EEXIST,
            Self::NoFileHandle(_) => libc::EBADF,
            Self::SyncFailed | Self::Io | Self::Corrupted => libc::EIO,
            Self::SegmentOverflow => libc::EIO,
            Self::FileTooLarge => libc::EFBIG,
            Self::OutOfSpace | Self::CheckpointRequired | Self::InodeTableFull => libc::ENOSPC,
            Self::InvalidName => libc::EINVAL,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::InvalidConfig(_) => libc::EINVAL,
        }
    }
}

bitflags! {
    /// File type and permission bits stored in the on-disk `mode` field.
    pub struct InodeMode: u16 {
        const S_IFMT = 0o170000;
        const S_IFDIR = 0o040000;
        const S_IFREG = 0o100000;

        const S_IRWXU = 0o0700;
        const S_IRUSR = 0o0400;
        const S_IWUSR = 0o0200;
        const S_IXUSR = 0o0100;

        const S_IRWXG = 0o0070;
        const S_IRGRP = 0o0040;
        const S_IWGRP = 0o0020;
        const S_IXGRP = 0o0010;

        const S_IRWXO = 0o0007;
        const S_IROTH = 0o0004;
        const S_IWOTH = 0o0002;
        const S_IXOTH = 0o0001;
    }
}

impl InodeMode {
    pub fn is_dir(&self) -> bool {
        (*self & Self::S_IFMT) == Self::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        (*self & Self::S_IFMT) == Self::S_IFREG
    }

    pub fn permissions(&self) -> u16 {
        (*self & !Self::S_IFMT).bits()
    }
}

bitflags! {
    /// Flags accepted by [`crate::NaiveFs::open`].
    pub struct OpenFlags: u32 {
        /// Create the leaf when it does not exist.
        const CREATE = 1 << 0;
        /// Truncate an existing file to zero length.
        const TRUNCATE = 1 << 1;
        /// Together with `CREATE`, fail with `DuplicateEntry` if the leaf exists.
        const EXCLUSIVE = 1 << 2;
    }
}

/// Attributes of one inode as seen by callers of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfsAttr {
    pub ino: u32,
    pub size: u32,
    pub mode: InodeMode,
    pub uid: u16,
    pub gid: u16,
    pub link_cnt: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Number of data blocks the file spans, holes included.
    pub blocks: u32,
}

/// Filesystem-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfsFsStat {
    pub block_size: u32,
    pub segment_size: u32,
    pub total_segments: u32,
    pub free_segments: u32,
    pub max_inodes: u32,
    pub active_inodes: u32,
}

/// CRC-32 (IEEE) over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_reference_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn mode_type_queries() {
        let dir = InodeMode::S_IFDIR | InodeMode::from_bits_truncate(0o755);
        assert!(dir.is_dir());
        assert!(!dir.is_file());
        assert_eq!(dir.permissions(), 0o755);
        let file = InodeMode::S_IFREG | InodeMode::S_IRUSR | InodeMode::S_IWUSR;
        assert!(file.is_file());
        assert_eq!(file.permissions(), 0o600);
    }

    #[cfg(feature = "std")]
    #[test]
    fn errno_mapping() {
        assert_eq!(LfsError::NoSuchPathEntry.to_errno(), libc::ENOENT);
        assert_eq!(LfsError::NoIndexMapEntry(3).to_errno(), libc::ENOENT);
        assert_eq!(LfsError::DuplicateEntry.to_errno(), libc::EEXIST);
        assert_eq!(LfsError::NoFileHandle(9).to_errno(), libc::EBADF);
        assert_eq!(LfsError::SyncFailed.to_errno(), libc::EIO);
        assert_eq!(LfsError::OutOfSpace.to_errno(), libc::ENOSPC);
        assert_eq!(LfsError::CheckpointRequired.to_errno(), libc::ENOSPC);
        assert_eq!(LfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
    }
}
