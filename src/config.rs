//! Startup configuration and the device geometry derived from it.

use serde::{Deserialize, Serialize};

use crate::{
    common::{LfsError, LfsResult},
    disk_inode::INODE_SIZE,
    segment::{INODE_TABLE_ENTRY_SIZE, SUMMARY_ENTRY_SIZE, SUMMARY_HEADER_SIZE},
};

/// Tunables of a NaiveFS instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LfsConfig {
    pub block_size: u32,
    pub segment_size: u32,
    /// Bytes reserved at the head of every segment for its summary.
    pub summary_size: u32,
    pub max_inodes: u32,
    pub checkpoint_interval_ms: u64,
    pub gc_interval_ms: u64,
    /// GC only runs while fewer segments than this are free.
    pub low_watermark: u32,
    /// A GC pass keeps cleaning until this many segments are free.
    pub high_watermark: u32,
    /// Segments cleaned per GC round.
    pub merging_segments: u32,
}

impl Default for LfsConfig {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            segment_size: 512 * 1024,
            summary_size: 4 * 1024,
            max_inodes: 65536,
            checkpoint_interval_ms: 5_000,
            gc_interval_ms: 10_000,
            low_watermark: 16,
            high_watermark: 32,
            merging_segments: 4,
        }
    }
}

impl LfsConfig {
    pub fn from_json(data: &[u8]) -> LfsResult<Self> {
        let config: Self = serde_json::from_slice(data)
            .map_err(|_| LfsError::InvalidConfig("malformed json"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LfsResult<()> {
        if !self.block_size.is_power_of_two() || !(256..=4096).contains(&self.block_size) {
            return Err(LfsError::InvalidConfig(
                "block_size must be a power of two in [256, 4096]",
            ));
        }
        if self.segment_size == 0 || self.segment_size % self.block_size != 0 {
            return Err(LfsError::InvalidConfig(
                "segment_size must be a multiple of block_size",
            ));
        }
        if self.summary_size < SUMMARY_HEADER_SIZE + SUMMARY_ENTRY_SIZE
            || self.summary_size % self.block_size != 0
        {
            return Err(LfsError::InvalidConfig(
                "summary_size must be a non-empty multiple of block_size",
            ));
        }
        let smallest = self.summary_size + self.block_size + INODE_SIZE + INODE_TABLE_ENTRY_SIZE;
        if self.segment_size < smallest {
            return Err(LfsError::InvalidConfig(
                "segment_size cannot hold a summary, one block and one inode",
            ));
        }
        if self.max_inodes == 0 {
            return Err(LfsError::InvalidConfig("max_inodes must be positive"));
        }
        if self.low_watermark > self.high_watermark {
            return Err(LfsError::InvalidConfig("low_watermark exceeds high_watermark"));
        }
        if self.merging_segments == 0 {
            return Err(LfsError::InvalidConfig("merging_segments must be positive"));
        }
        Ok(())
    }
}

/// Byte layout of a device: `[CR][segment 0]..[segment n-1][CR]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub segment_size: u32,
    pub summary_size: u32,
    pub max_inodes: u32,
    /// Size of one checkpoint region copy, a whole number of blocks.
    pub cr_size: u32,
    pub num_segments: u32,
    pub capacity: u32,
}

impl Geometry {
    pub fn new(config: &LfsConfig, capacity: u64) -> LfsResult<Self> {
        config.validate()?;
        if capacity >= u32::MAX as u64 {
            return Err(LfsError::InvalidConfig("device larger than 4 GiB"));
        }
        let capacity = capacity as u32;
        // The status table is sized for the upper bound of segments, so the
        // CR size does not depend on itself.
        let max_segments = capacity / config.segment_size;
        let payload = Self::cr_payload_size(config.max_inodes, max_segments);
        let cr_size = round_up(payload, config.block_size);
        if capacity < 2 * cr_size + config.segment_size {
            return Err(LfsError::InvalidConfig("device too small"));
        }
        let num_segments = (capacity - 2 * cr_size) / config.segment_size;
        Ok(Self {
            block_size: config.block_size,
            segment_size: config.segment_size,
            summary_size: config.summary_size,
            max_inodes: config.max_inodes,
            cr_size,
            num_segments,
            capacity,
        })
    }

    /// Imap (version + entries), status table and trailing checksum.
    fn cr_payload_size(max_inodes: u32, segments: u32) -> u32 {
        4 + 4 * max_inodes + 8 * segments + 4
    }

    pub fn imap_size(&self) -> u32 {
        4 + 4 * self.max_inodes
    }

    pub fn status_table_size(&self) -> u32 {
        8 * self.num_segments
    }

    pub fn cr_start(&self) -> u32 {
        0
    }

    pub fn cr_end(&self) -> u32 {
        self.capacity - self.cr_size
    }

    pub fn segment_base(&self, segment: u32) -> u32 {
        debug_assert!(segment < self.num_segments);
        self.cr_size + segment * self.segment_size
    }

    /// Segment containing `addr`, if `addr` lies in the segment area.
    pub fn segment_of(&self, addr: u32) -> Option<u32> {
        if addr < self.cr_size {
            return None;
        }
        let segment = (addr - self.cr_size) / self.segment_size;
        (segment < self.num_segments).then_some(segment)
    }

    pub fn max_summary_entries(&self) -> u32 {
        (self.summary_size - SUMMARY_HEADER_SIZE) / SUMMARY_ENTRY_SIZE
    }

    /// Block addresses held by one indirect block.
    pub fn addrs_per_block(&self) -> u32 {
        self.block_size / 4
    }
}

pub(crate) fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::small_config;

    #[test]
    fn default_config_is_valid() {
        assert!(LfsConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_block_size() {
        let config = LfsConfig {
            block_size: 8192,
            ..LfsConfig::default()
        };
        assert!(matches!(config.validate(), Err(LfsError::InvalidConfig(_))));
        let config = LfsConfig {
            block_size: 1000,
            ..LfsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let config = LfsConfig {
            low_watermark: 10,
            high_watermark: 5,
            ..LfsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config =
            LfsConfig::from_json(br#"{"block_size": 1024, "segment_size": 65536}"#).unwrap();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.segment_size, 65536);
        assert_eq!(config.max_inodes, LfsConfig::default().max_inodes);
        assert!(LfsConfig::from_json(b"{not json").is_err());
    }

    #[test]
    fn geometry_layout() {
        let geometry = Geometry::new(&small_config(), 1 << 20).unwrap();
        assert_eq!(geometry.cr_size % 256, 0);
        assert!(geometry.cr_size >= 4 + 4 * 256 + 8 * geometry.num_segments + 4);
        assert_eq!(geometry.segment_base(0), geometry.cr_size);
        let last = geometry.num_segments - 1;
        assert!(geometry.segment_base(last) + geometry.segment_size <= geometry.cr_end());
        assert_eq!(geometry.segment_of(geometry.cr_size + 4096 + 10), Some(1));
        assert_eq!(geometry.segment_of(3), None);
        assert_eq!(geometry.max_summary_entries(), (256 - 16) / 12);
    }

    #[test]
    fn geometry_rejects_tiny_device() {
        assert!(Geometry::new(&small_config(), 4096).is_err());
    }
}
