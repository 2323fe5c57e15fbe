//! The index maps key hashes to the arena ids of active entries, and
//! knows how to persist a summary of the cache to an `index` file.
//!
//! The in-memory [`Index`] chains colliding hashes and compares full
//! keys on lookup, through a caller-supplied predicate: the index
//! itself never stores keys, so it cannot disagree with the entry
//! records about them.  Removal is immediate, so a lookup racing with
//! a doom simply misses.
//!
//! On disk, an index file is a fixed header, optionally followed by
//! one record per entry (the simple backend's snapshot), and trailed
//! by a CRC32C of everything before it.  A missing, empty, truncated,
//! or otherwise garbled file is reported as such, never as an error:
//! deciding what to do about it is the backend's job.
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::arena::EntryId;
use crate::error::Error;
use crate::error::Result;
use crate::rankings::LIST_COUNT;
use crate::STREAM_COUNT;

pub(crate) const INDEX_MAGIC: u32 = 0xC103_CAC3;

const HEADER_SIZE: usize = 48;
const FLAG_CLEAN_SHUTDOWN: u32 = 1;

#[derive(Debug, Default)]
pub(crate) struct Index {
    buckets: HashMap<u64, Vec<EntryId>>,
    len: usize,
}

impl Index {
    /// Returns the id in `hash`'s chain for which `matches` holds.
    pub fn lookup(&self, hash: u64, mut matches: impl FnMut(EntryId) -> bool) -> Option<EntryId> {
        self.buckets
            .get(&hash)?
            .iter()
            .copied()
            .find(|id| matches(*id))
    }

    pub fn insert(&mut self, hash: u64, id: EntryId) {
        self.buckets.entry(hash).or_default().push(id);
        self.len += 1;
    }

    /// Returns whether `id` was in `hash`'s chain.
    pub fn remove(&mut self, hash: u64, id: EntryId) -> bool {
        let chain = match self.buckets.get_mut(&hash) {
            Some(chain) => chain,
            None => return false,
        };

        let found = match chain.iter().position(|x| *x == id) {
            Some(position) => {
                chain.swap_remove(position);
                true
            }
            None => false,
        };

        if chain.is_empty() {
            self.buckets.remove(&hash);
        }

        if found {
            self.len -= 1;
        }

        found
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }
}

/// Fixed part of an index file.  List ends are engine-specific
/// addresses (0 for none).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct IndexHeader {
    pub version: u32,
    pub clean_shutdown: bool,
    pub entry_count: u64,
    pub total_size: i64,
    pub heads: [u32; LIST_COUNT],
    pub tails: [u32; LIST_COUNT],
}

/// Summary of one entry, enough to rebuild the in-memory state
/// without touching the entry's files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IndexRecord {
    pub hash: u64,
    pub key: Vec<u8>,
    pub last_used: i64,
    pub last_modified: i64,
    pub stream_sizes: [u32; STREAM_COUNT],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct IndexFile {
    pub header: IndexHeader,
    pub records: Vec<IndexRecord>,
}

#[derive(Debug)]
pub(crate) enum IndexRead {
    Missing,
    Valid(IndexFile),
    Invalid(String),
}

pub(crate) fn le_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    let mut array = [0u8; 4];
    array.copy_from_slice(bytes);
    Some(u32::from_le_bytes(array))
}

pub(crate) fn le_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset.checked_add(8)?)?;
    let mut array = [0u8; 8];
    array.copy_from_slice(bytes);
    Some(u64::from_le_bytes(array))
}

pub(crate) fn le_i64(buf: &[u8], offset: usize) -> Option<i64> {
    le_u64(buf, offset).map(|x| x as i64)
}

fn encode(file: &IndexFile) -> Vec<u8> {
    let header = &file.header;
    let mut buf = Vec::with_capacity(HEADER_SIZE + 64 * file.records.len() + 4);

    buf.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
    buf.extend_from_slice(&header.version.to_le_bytes());
    let flags = if header.clean_shutdown {
        FLAG_CLEAN_SHUTDOWN
    } else {
        0
    };
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&(file.records.len() as u32).to_le_bytes());
    buf.extend_from_slice(&header.entry_count.to_le_bytes());
    buf.extend_from_slice(&header.total_size.to_le_bytes());
    for head in header.heads.iter() {
        buf.extend_from_slice(&head.to_le_bytes());
    }
    for tail in header.tails.iter() {
        buf.extend_from_slice(&tail.to_le_bytes());
    }

    for record in file.records.iter() {
        buf.extend_from_slice(&record.hash.to_le_bytes());
        buf.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&record.key);
        buf.extend_from_slice(&record.last_used.to_le_bytes());
        buf.extend_from_slice(&record.last_modified.to_le_bytes());
        for size in record.stream_sizes.iter() {
            buf.extend_from_slice(&size.to_le_bytes());
        }
    }

    let checksum = crc32c::crc32c(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

fn decode(buf: &[u8]) -> std::result::Result<IndexFile, String> {
    if buf.is_empty() {
        return Err("empty index file".into());
    }

    if buf.len() < HEADER_SIZE + 4 {
        return Err(format!("index file truncated at {} bytes", buf.len()));
    }

    let (body, trailer) = buf.split_at(buf.len() - 4);
    let magic = le_u32(body, 0).unwrap_or(0);
    if magic != INDEX_MAGIC {
        return Err(format!("bad index magic {:#x}", magic));
    }

    let expected = le_u32(trailer, 0).unwrap_or(0);
    let actual = crc32c::crc32c(body);
    if expected != actual {
        return Err(format!(
            "index checksum mismatch: stored {:#x}, computed {:#x}",
            expected, actual
        ));
    }

    let truncated = || "index file truncated".to_string();
    let word = |offset| le_u32(body, offset).ok_or_else(truncated);

    let header = IndexHeader {
        version: word(4)?,
        clean_shutdown: word(8)? & FLAG_CLEAN_SHUTDOWN != 0,
        entry_count: le_u64(body, 16).ok_or_else(truncated)?,
        total_size: le_i64(body, 24).ok_or_else(truncated)?,
        heads: [word(32)?, word(36)?],
        tails: [word(40)?, word(44)?],
    };

    let record_count = word(12)? as usize;
    let mut records = Vec::with_capacity(record_count.min(body.len() / 36));
    let mut offset = HEADER_SIZE;
    for _ in 0..record_count {
        let hash = le_u64(body, offset).ok_or_else(truncated)?;
        let key_len = word(offset + 8)? as usize;
        offset += 12;

        let key = body
            .get(offset..offset.saturating_add(key_len))
            .ok_or_else(truncated)?
            .to_vec();
        offset += key_len;

        let last_used = le_i64(body, offset).ok_or_else(truncated)?;
        let last_modified = le_i64(body, offset + 8).ok_or_else(truncated)?;
        let stream_sizes = [
            word(offset + 16)?,
            word(offset + 20)?,
            word(offset + 24)?,
        ];
        offset += 28;

        records.push(IndexRecord {
            hash,
            key,
            last_used,
            last_modified,
            stream_sizes,
        });
    }

    if offset != body.len() {
        return Err(format!(
            "index file has {} trailing bytes",
            body.len() - offset
        ));
    }

    Ok(IndexFile { header, records })
}

/// Reads and validates the index file at `path`.  Only I/O errors
/// other than a missing file are errors; every kind of garbage is
/// reported as [`IndexRead::Invalid`].
pub(crate) fn read_index_file(path: &Path) -> Result<IndexRead> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if crate::benign_error::is_absent_file_error(&e) => return Ok(IndexRead::Missing),
        Err(e) => return Err(Error::Io(e)),
    };

    Ok(match decode(&buf) {
        Ok(file) => IndexRead::Valid(file),
        Err(reason) => IndexRead::Invalid(reason),
    })
}

/// Atomically replaces the index file at `path` with `file`.  Readers
/// see either the old or the new contents, never a torn write.
pub(crate) fn write_index_file(path: &Path, file: &IndexFile) -> Result<()> {
    use tempfile::NamedTempFile;

    let parent = path
        .parent()
        .ok_or(Error::InvalidArgument("index path has no parent directory"))?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&encode(file))?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
