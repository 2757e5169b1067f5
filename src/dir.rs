//! Directory content: a flat run of self-delimiting records
//! `(name_len: u32, name, inode_id: u32, deleted: u8)`. Removal appends a
//! tombstone copy of the record instead of rewriting earlier bytes.

use alloc::{string::String, vec::Vec};

use crate::{
    common::{LfsError, LfsResult},
    le_u32,
};

pub const NAME_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirRecord<'a> {
    pub name: &'a str,
    pub inode_id: u32,
    pub deleted: bool,
}

impl DirRecord<'_> {
    pub fn encoded_len(&self) -> usize {
        4 + self.name.len() + 4 + 1
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.inode_id.to_le_bytes());
        buf.push(self.deleted as u8);
        buf
    }
}

pub fn validate_name(name: &str) -> LfsResult<()> {
    if name.is_empty()
        || name.len() > NAME_MAX
        || name == "."
        || name == ".."
        || name.contains(|c| c == '/' || c == '\0')
    {
        return Err(LfsError::InvalidName);
    }
    Ok(())
}

/// Iterates the raw records of a directory, tombstones included.
pub struct DirRecords<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> DirRecords<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn parse_one(&mut self) -> LfsResult<DirRecord<'a>> {
        let buf = self.buf;
        let at = self.offset;
        if at + 4 > buf.len() {
            return Err(LfsError::Corrupted);
        }
        let len = le_u32!(buf, at) as usize;
        if len == 0 || len > NAME_MAX || at + 4 + len + 5 > buf.len() {
            return Err(LfsError::Corrupted);
        }
        let name = core::str::from_utf8(&buf[at + 4..at + 4 + len])
            .map_err(|_| LfsError::Corrupted)?;
        let inode_id = le_u32!(buf, at + 4 + len);
        let deleted = buf[at + 8 + len] != 0;
        self.offset = at + 9 + len;
        Ok(DirRecord {
            name,
            inode_id,
            deleted,
        })
    }
}

impl<'a> Iterator for DirRecords<'a> {
    type Item = LfsResult<DirRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.len() {
            return None;
        }
        let record = self.parse_one();
        if record.is_err() {
            // Nothing after a malformed record can be trusted.
            self.offset = self.buf.len();
        }
        Some(record)
    }
}

/// Live `(name, inode_id)` pairs in creation order; a tombstone cancels the
/// live record with the same name.
pub fn live_entries(buf: &[u8]) -> LfsResult<Vec<(String, u32)>> {
    let mut live: Vec<(String, u32)> = Vec::new();
    for record in DirRecords::new(buf) {
        let record = record?;
        if record.deleted {
            live.retain(|(name, _)| name != record.name);
        } else {
            live.push((String::from(record.name), record.inode_id));
        }
    }
    Ok(live)
}
