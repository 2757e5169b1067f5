//! NaiveFS: a log-structured filesystem over a raw block device.
//!
//! Every update is appended to the open segment of a log; an index map
//! records where the newest copy of each inode lives and is persisted,
//! together with per-segment occupancy, in a checkpoint region written
//! alternately to both ends of the device.
#![cfg_attr(not(any(test, feature = "std")), no_std)]
extern crate alloc;

#[macro_export]
macro_rules! le_u32 {
    ($buf:expr, $off:expr) => {{
        let off: usize = $off;
        let b = &$buf[off..off + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }};
}

#[macro_export]
macro_rules! le_u16 {
    ($buf:expr, $off:expr) => {{
        let off: usize = $off;
        let b = &$buf[off..off + 2];
        u16::from_le_bytes([b[0], b[1]])
    }};
}

pub mod common;
pub mod config;
pub mod device;
pub mod dir;
pub mod disk_inode;
pub mod fs;
pub mod imap;
pub mod inode;
pub mod log_manager;
pub mod segment;

#[cfg(feature = "std")]
pub mod background;

#[cfg(feature = "fuse")]
pub mod fuse;

#[cfg(test)]
mod test_util;


pub use common::{crc32, InodeMode, LfsAttr, LfsError, LfsFsStat, LfsResult, OpenFlags};
pub use config::{Geometry, LfsConfig};
#[cfg(feature = "std")]
pub use device::FileDisk;
pub use device::{BlockDevice, MemDisk};
pub use fs::{NaiveFs, ROOT_ID};
