//! Shared fixtures for the unit tests.

use crate::config::{Geometry, LfsConfig};

/// A geometry small enough that a few kilobytes of data span several
/// segments and every level of the block tree: 14 blocks per segment,
/// 64 addresses per indirect block.
pub(crate) fn small_config() -> LfsConfig {
    LfsConfig {
        block_size: 256,
        segment_size: 4096,
        summary_size: 256,
        max_inodes: 256,
        ..LfsConfig::default()
    }
}

pub(crate) fn small_geometry() -> Geometry {
    Geometry::new(&small_config(), 1 << 20).unwrap()
}

pub(crate) fn fixed_clock() -> u32 {
    1_700_000_000
}

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
