//! The fixed-size inode record appended to the log, and the mapping between
//! byte offsets and positions in its block-address tree.

use core::fmt;

use crate::{
    common::{InodeMode, LfsError, LfsResult},
    le_u16, le_u32,
};

pub const DIRECT_CNT: u32 = 24;
/// Slot index of the single-indirect pointer.
pub const INDIRECT1_SLOT: u32 = DIRECT_CNT;
/// Slot index of the double-indirect pointer.
pub const INDIRECT2_SLOT: u32 = DIRECT_CNT + 1;

pub const INODE_SIZE: u32 = 4 * 4 + 2 * 4 + 4 * DIRECT_CNT + 4 * 2;

/// Hole, or nothing allocated yet.
pub const INVALID_ADDR: u32 = 0;
/// Pointer block allocated in memory that has no place in the log yet.
pub const TEMPORARY_ADDR: u32 = u32::MAX;

pub fn is_real_addr(addr: u32) -> bool {
    addr != INVALID_ADDR && addr != TEMPORARY_ADDR
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDiskInode {
    pub size: u32,
    pub access_time: u32,
    pub modify_time: u32,
    pub change_time: u32,
    pub uid: u16,
    pub gid: u16,
    pub link_cnt: u16,
    pub mode: u16,
    pub directs: [u32; DIRECT_CNT as usize],
    pub indirect1: u32,
    pub indirect2: u32,
}

impl OnDiskInode {
    fn make(mode: InodeMode, now: u32, uid: u16, gid: u16) -> Self {
        Self {
            size: 0,
            access_time: now,
            modify_time: now,
            change_time: now,
            uid,
            gid,
            link_cnt: 1,
            mode: mode.bits(),
            directs: [INVALID_ADDR; DIRECT_CNT as usize],
            indirect1: INVALID_ADDR,
            indirect2: INVALID_ADDR,
        }
    }

    pub fn make_file(now: u32, uid: u16, gid: u16) -> Self {
        Self::make(
            InodeMode::S_IFREG | InodeMode::from_bits_truncate(0o644),
            now,
            uid,
            gid,
        )
    }

    pub fn make_dir(now: u32, uid: u16, gid: u16) -> Self {
        Self::make(
            InodeMode::S_IFDIR | InodeMode::from_bits_truncate(0o755),
            now,
            uid,
            gid,
        )
    }

    pub fn mode(&self) -> InodeMode {
        InodeMode::from_bits_truncate(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode().is_dir()
    }

    /// Blocks spanned by the file, holes included.
    pub fn st_blocks(&self, block_size: u32) -> u32 {
        ((self.size as u64 + block_size as u64 - 1) / block_size as u64) as u32
    }

    pub fn to_bytes(&self) -> [u8; INODE_SIZE as usize] {
        let mut buf = [0u8; INODE_SIZE as usize];
        let mut pos = 0;
        let mut put = |bytes: &[u8]| {
            buf[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        put(&self.size.to_le_bytes());
        put(&self.access_time.to_le_bytes());
        put(&self.modify_time.to_le_bytes());
        put(&self.change_time.to_le_bytes());
        put(&self.uid.to_le_bytes());
        put(&self.gid.to_le_bytes());
        put(&self.link_cnt.to_le_bytes());
        put(&self.mode.to_le_bytes());
        for direct in &self.directs {
            put(&direct.to_le_bytes());
        }
        put(&self.indirect1.to_le_bytes());
        put(&self.indirect2.to_le_bytes());
        buf
    }

    /// Parses a record produced by [`OnDiskInode::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Self {
        assert!(buf.len() >= INODE_SIZE as usize);
        let mut directs = [INVALID_ADDR; DIRECT_CNT as usize];
        for (i, direct) in directs.iter_mut().enumerate() {
            *direct = le_u32!(buf, 24 + 4 * i);
        }
        let tail = 24 + 4 * DIRECT_CNT as usize;
        Self {
            size: le_u32!(buf, 0),
            access_time: le_u32!(buf, 4),
            modify_time: le_u32!(buf, 8),
            change_time: le_u32!(buf, 12),
            uid: le_u16!(buf, 16),
            gid: le_u16!(buf, 18),
            link_cnt: le_u16!(buf, 20),
            mode: le_u16!(buf, 22),
            directs,
            indirect1: le_u32!(buf, tail),
            indirect2: le_u32!(buf, tail + 4),
        }
    }
}

/// Position of a pointer in an inode's block-address tree.
///
/// `Level1(i0)` is slot `i0` of the inode itself (`directs`, then
/// `indirect1`, then `indirect2`). `Level2(i0, i1)` is entry `i1` of the
/// block slot `i0` points to, and `Level3(i0, i1, i2)` goes one level
/// further down. The same value names both the pointer and the block it
/// points to, which is what the segment summary records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockPos {
    Level1(u32),
    Level2(u32, u32),
    Level3(u32, u32, u32),
}

const I0_BITS: u32 = 5;
const IX_BITS: u32 = 10;
const TAG_SHIFT: u32 = 30;

impl BlockPos {
    /// Maps a byte offset to the position of the data block holding it.
    pub fn translate(offset: u32, block_size: u32) -> LfsResult<Self> {
        let per_block = block_size / 4;
        let base1 = block_size * DIRECT_CNT;
        let base2 = base1 + block_size * per_block;
        if offset < base1 {
            return Ok(Self::Level1(offset / block_size));
        }
        if offset < base2 {
            return Ok(Self::Level2(INDIRECT1_SLOT, (offset - base1) / block_size));
        }
        let block = (offset - base2) / block_size;
        let i1 = block / per_block;
        if i1 >= per_block {
            return Err(LfsError::FileTooLarge);
        }
        Ok(Self::Level3(INDIRECT2_SLOT, i1, block % per_block))
    }

    /// Largest file the tree can address, saturated to `u32`.
    pub fn max_file_size(block_size: u32) -> u32 {
        let per_block = (block_size / 4) as u64;
        let blocks = DIRECT_CNT as u64 + per_block + per_block * per_block;
        (blocks * block_size as u64).min(u32::MAX as u64) as u32
    }

    /// Packs the position, tagging its depth in the top two bits.
    pub fn encode(&self) -> u32 {
        let (tag, i0, i1, i2) = match *self {
            Self::Level1(i0) => (1, i0, 0, 0),
            Self::Level2(i0, i1) => (2, i0, i1, 0),
            Self::Level3(i0, i1, i2) => (3, i0, i1, i2),
        };
        assert!(i0 < (1 << I0_BITS) && i1 < (1 << IX_BITS) && i2 < (1 << IX_BITS));
        (tag << TAG_SHIFT) | i0 | (i1 << I0_BITS) | (i2 << (I0_BITS + IX_BITS))
    }

    pub fn decode(code: u32) -> Option<Self> {
        let i0 = code & ((1 << I0_BITS) - 1);
        let i1 = (code >> I0_BITS) & ((1 << IX_BITS) - 1);
        let i2 = (code >> (I0_BITS + IX_BITS)) & ((1 << IX_BITS) - 1);
        if i0 > INDIRECT2_SLOT {
            return None;
        }
        match code >> TAG_SHIFT {
            1 => Some(Self::Level1(i0)),
            2 if i0 >= INDIRECT1_SLOT => Some(Self::Level2(i0, i1)),
            3 if i0 == INDIRECT2_SLOT => Some(Self::Level3(i0, i1, i2)),
            _ => None,
        }
    }

    /// Whether this position holds file data rather than a pointer block.
    pub fn is_data(&self) -> bool {
        match *self {
            Self::Level1(i0) => i0 < DIRECT_CNT,
            Self::Level2(i0, _) => i0 == INDIRECT1_SLOT,
            Self::Level3(..) => true,
        }
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Level1(i0) => write!(f, "[{}]", i0),
            Self::Level2(i0, i1) => write!(f, "[{}, {}]", i0, i1),
            Self::Level3(i0, i1, i2) => write!(f, "[{}, {}, {}]", i0, i1, i2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u32 = 256;

    #[test]
    fn inode_record_is_128_bytes() {
        assert_eq!(INODE_SIZE, 128);
    }

    #[test]
    fn inode_bytes_round_trip() {
        let mut inode = OnDiskInode::make_file(1_700_000_000, 1000, 100);
        inode.size = 12345;
        inode.directs[3] = 0xdead_beef;
        inode.indirect1 = 77;
        inode.indirect2 = TEMPORARY_ADDR;
        let parsed = OnDiskInode::from_bytes(&inode.to_bytes());
        assert_eq!(parsed, inode);
        assert!(parsed.mode().is_file());
        assert_eq!(parsed.link_cnt, 1);
    }

    #[test]
    fn make_dir_zeroes_pointers() {
        let inode = OnDiskInode::make_dir(5, 0, 0);
        assert!(inode.is_dir());
        assert!(inode.directs.iter().all(|&a| a == INVALID_ADDR));
        assert_eq!(inode.indirect1, INVALID_ADDR);
        assert_eq!(inode.indirect2, INVALID_ADDR);
        assert_eq!(inode.modify_time, 5);
    }

    #[test]
    fn translate_boundaries() {
        let per = BS / 4;
        assert_eq!(BlockPos::translate(0, BS).unwrap(), BlockPos::Level1(0));
        assert_eq!(BlockPos::translate(BS - 1, BS).unwrap(), BlockPos::Level1(0));
        // A block boundary belongs to the block starting there.
        assert_eq!(BlockPos::translate(BS, BS).unwrap(), BlockPos::Level1(1));
        assert_eq!(
            BlockPos::translate(BS * DIRECT_CNT, BS).unwrap(),
            BlockPos::Level2(INDIRECT1_SLOT, 0)
        );
        let base2 = BS * (DIRECT_CNT + per);
        assert_eq!(
            BlockPos::translate(base2 - 1, BS).unwrap(),
            BlockPos::Level2(INDIRECT1_SLOT, per - 1)
        );
        assert_eq!(
            BlockPos::translate(base2, BS).unwrap(),
            BlockPos::Level3(INDIRECT2_SLOT, 0, 0)
        );
        assert_eq!(
            BlockPos::translate(base2 + BS * (per + 1), BS).unwrap(),
            BlockPos::Level3(INDIRECT2_SLOT, 1, 1)
        );
        assert_eq!(
            BlockPos::translate(BlockPos::max_file_size(BS), BS),
            Err(LfsError::FileTooLarge)
        );
    }

    #[test]
    fn encode_decode_round_trip_over_whole_tree() {
        for bs in [256u32, 1024, 4096] {
            let max = BlockPos::max_file_size(bs);
            let mut offset = 0u32;
            while offset < max {
                let pos = BlockPos::translate(offset, bs).unwrap();
                assert!(pos.is_data());
                assert_eq!(BlockPos::decode(pos.encode()), Some(pos));
                offset = match offset.checked_add(bs / 2 * 7 + 1) {
                    Some(next) => next,
                    None => break,
                };
            }
        }
    }

    #[test]
    fn pointer_positions_are_not_data() {
        assert!(!BlockPos::Level1(INDIRECT1_SLOT).is_data());
        assert!(!BlockPos::Level1(INDIRECT2_SLOT).is_data());
        assert!(!BlockPos::Level2(INDIRECT2_SLOT, 7).is_data());
        for pos in [
            BlockPos::Level1(INDIRECT1_SLOT),
            BlockPos::Level1(INDIRECT2_SLOT),
            BlockPos::Level2(INDIRECT2_SLOT, 1023),
        ] {
            assert_eq!(BlockPos::decode(pos.encode()), Some(pos));
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(BlockPos::decode(0), None);
        assert_eq!(BlockPos::decode((1 << 30) | 31), None);
        // Level2 below the indirect slots is not a tree position.
        assert_eq!(BlockPos::decode((2 << 30) | 3), None);
    }

    #[test]
    fn display_shows_coordinates() {
        assert_eq!(format!("{}", BlockPos::Level3(25, 1, 2)), "[25, 1, 2]");
    }
}
