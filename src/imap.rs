//! Inode index map: inode id to the log address of its newest record.

use alloc::{vec, vec::Vec};

use crate::{
    common::{LfsError, LfsResult},
    le_u32,
};

const INVALID_VALUE: u32 = 0;

pub struct IndexMap {
    map: Vec<u32>,
    version: u32,
    active_count: u32,
}

impl IndexMap {
    pub fn new(max_inodes: u32) -> Self {
        Self {
            map: vec![INVALID_VALUE; max_inodes as usize],
            version: 0,
            active_count: 0,
        }
    }

    /// Rebuilds the map from its serialized form (`version` then one
    /// address per inode id).
    pub fn from_bytes(buf: &[u8], max_inodes: u32) -> Self {
        assert!(buf.len() >= Self::serialized_size(max_inodes));
        let version = le_u32!(buf, 0);
        let map: Vec<u32> = (0..max_inodes as usize)
            .map(|i| le_u32!(buf, 4 + 4 * i))
            .collect();
        let active_count = map.iter().filter(|&&addr| addr != INVALID_VALUE).count() as u32;
        Self {
            map,
            version,
            active_count,
        }
    }

    pub fn serialized_size(max_inodes: u32) -> usize {
        4 + 4 * max_inodes as usize
    }

    pub fn count(&self) -> u32 {
        self.active_count
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn capacity(&self) -> u32 {
        self.map.len() as u32
    }

    pub fn get(&self, id: u32) -> LfsResult<u32> {
        match self.map.get(id as usize) {
            Some(&addr) if addr != INVALID_VALUE => Ok(addr),
            _ => Err(LfsError::NoIndexMapEntry(id)),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_ok()
    }

    /// Points `id` at `addr`, returning the previous address (0 if none).
    pub fn update(&mut self, id: u32, addr: u32) -> LfsResult<u32> {
        assert_ne!(addr, INVALID_VALUE, "imap address 0 is reserved");
        let slot = self
            .map
            .get_mut(id as usize)
            .ok_or(LfsError::InodeTableFull)?;
        let old = core::mem::replace(slot, addr);
        if old == INVALID_VALUE {
            self.active_count += 1;
        }
        Ok(old)
    }

    /// Drops the entry of `id`, returning its last address.
    pub fn remove(&mut self, id: u32) -> LfsResult<u32> {
        let old = self.get(id)?;
        self.map[id as usize] = INVALID_VALUE;
        self.active_count -= 1;
        Ok(old)
    }

    /// Highest id with an entry.
    pub fn max_id(&self) -> Option<u32> {
        self.map
            .iter()
            .rposition(|&addr| addr != INVALID_VALUE)
            .map(|i| i as u32)
    }

    /// Bumps the version and serializes the map for a checkpoint.
    pub fn bump_and_get_buffer(&mut self) -> Vec<u8> {
        self.version += 1;
        let mut buf = Vec::with_capacity(Self::serialized_size(self.capacity()));
        buf.extend_from_slice(&self.version.to_le_bytes());
        for addr in &self.map {
            buf.extend_from_slice(&addr.to_le_bytes());
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_missing_entry_fails() {
        let imap = IndexMap::new(8);
        assert_eq!(imap.get(3), Err(LfsError::NoIndexMapEntry(3)));
        assert_eq!(imap.get(100), Err(LfsError::NoIndexMapEntry(100)));
    }

    #[test]
    fn active_count_tracks_first_insert_only() {
        let mut imap = IndexMap::new(8);
        assert_eq!(imap.update(1, 4096).unwrap(), 0);
        assert_eq!(imap.update(1, 8192).unwrap(), 4096);
        assert_eq!(imap.update(2, 100).unwrap(), 0);
        assert_eq!(imap.count(), 2);
        assert_eq!(imap.get(1).unwrap(), 8192);
        assert_eq!(imap.remove(1).unwrap(), 8192);
        assert_eq!(imap.count(), 1);
        assert!(!imap.contains(1));
        assert_eq!(imap.remove(1), Err(LfsError::NoIndexMapEntry(1)));
    }

    #[test]
    #[should_panic]
    fn zero_address_is_rejected() {
        let mut imap = IndexMap::new(8);
        let _ = imap.update(1, 0);
    }

    #[test]
    fn update_beyond_capacity_fails() {
        let mut imap = IndexMap::new(4);
        assert_eq!(imap.update(4, 1), Err(LfsError::InodeTableFull));
    }

    #[test]
    fn versions_strictly_increase_across_flushes() {
        let mut imap = IndexMap::new(4);
        imap.update(0, 512).unwrap();
        let first = imap.bump_and_get_buffer();
        let second = imap.bump_and_get_buffer();
        assert_eq!(IndexMap::from_bytes(&first, 4).version(), 1);
        let restored = IndexMap::from_bytes(&second, 4);
        assert_eq!(restored.version(), 2);
        assert_eq!(restored.count(), 1);
        assert_eq!(restored.get(0).unwrap(), 512);
        assert_eq!(restored.max_id(), Some(0));
    }
}
