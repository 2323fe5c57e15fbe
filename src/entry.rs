//! An entry is a key plus [`STREAM_COUNT`] independent byte streams
//! (headers, body, side data) and two timestamps.
//!
//! The core keeps one [`EntryRecord`] per entry, live or doomed, in
//! its arena.  Callers only ever see [`Entry`] handles: opening the
//! same key twice yields two handles to the same record, and the
//! record's storage is reclaimed once it is doomed and its last
//! handle is dropped.
use std::sync::Arc;
use std::time::SystemTime;

use crate::arena::EntryId;
use crate::backend::Shared;
use crate::engine::EntryMeta;
use crate::engine::Location;
use crate::error::Result;
use crate::rankings::Links;
use crate::rankings::Ranked;
use crate::sparse;
use crate::STREAM_COUNT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum EntryState {
    Normal,
    /// Open for modification.  A crash in this state invalidates the
    /// entry.
    Dirty,
    /// Invisible to lookups; storage goes away with the last handle.
    Doomed,
}

impl EntryState {
    pub fn to_u8(self) -> u8 {
        match self {
            EntryState::Normal => 0,
            EntryState::Dirty => 1,
            EntryState::Doomed => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<EntryState> {
        match raw {
            0 => Some(EntryState::Normal),
            1 => Some(EntryState::Dirty),
            2 => Some(EntryState::Doomed),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct EntryRecord {
    pub key: Arc<[u8]>,
    pub hash: u64,
    pub location: Location,
    pub state: EntryState,
    pub last_used: SystemTime,
    pub last_modified: SystemTime,
    pub stream_sizes: [u32; STREAM_COUNT],
    /// Open handles.
    pub refs: usize,
    /// Opens after creation; drives two-list eviction.
    pub reuse_count: u32,
    /// What this entry currently contributes to the total size.
    pub accounted: i64,
    pub links: Links,
    /// Whether the engine vouched for the entry's storage.
    pub validated: bool,
    /// Holds a chunk of some other entry's sparse data.
    pub sparse_child: bool,
    /// Has sparse children to doom along with it.
    pub sparse_parent: bool,
}

impl EntryRecord {
    pub fn is_doomed(&self) -> bool {
        self.state == EntryState::Doomed
    }

    pub fn meta(&self) -> EntryMeta<'_> {
        EntryMeta {
            key: &self.key,
            hash: self.hash,
            last_used: self.last_used,
            last_modified: self.last_modified,
            stream_sizes: self.stream_sizes,
            reuse_count: self.reuse_count,
        }
    }
}

impl Ranked for EntryRecord {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// A handle to an open cache entry.  Dropping the handle closes it.
///
/// Entry I/O runs synchronously on the caller's thread.  Handles stay
/// usable after their entry is doomed, and after the backend itself
/// is dropped.
pub struct Entry {
    shared: Arc<Shared>,
    id: EntryId,
    key: Arc<[u8]>,
}

impl Entry {
    pub(crate) fn new(shared: Arc<Shared>, id: EntryId, key: Arc<[u8]>) -> Entry {
        Entry { shared, id, key }
    }

    /// Returns exactly the bytes the entry was created with.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Removes the entry from the cache.  The handle keeps working;
    /// storage is reclaimed once every handle is gone.  Idempotent.
    pub fn doom(&self) -> Result<()> {
        self.shared.core.lock().doom_handle(self.id)
    }

    /// Reads up to `buf.len()` bytes of `stream` at `offset`.  Returns
    /// 0 at or past the end of the stream.
    pub fn read_data(&self, stream: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.shared.core.lock().read(self.id, stream, offset, buf)
    }

    /// Writes `data` at `offset` in `stream`, zero-filling any gap
    /// past the current end.  With `truncate`, the stream ends right
    /// after `data`.
    pub fn write_data(
        &self,
        stream: usize,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        self.shared
            .core
            .lock()
            .write(self.id, stream, offset, data, truncate)
    }

    /// Returns the length of `stream`, or 0 for a bad stream index.
    pub fn data_size(&self, stream: usize) -> u32 {
        self.shared.core.lock().data_size(self.id, stream)
    }

    pub fn last_used(&self) -> SystemTime {
        self.shared.core.lock().timestamps(self.id).0
    }

    pub fn last_modified(&self) -> SystemTime {
        self.shared.core.lock().timestamps(self.id).1
    }

    /// Writes `data` at `offset` in the entry's sparse address space.
    pub fn write_sparse_data(&self, offset: u64, data: &[u8]) -> Result<usize> {
        sparse::write(&mut self.shared.core.lock(), self.id, offset, data)
    }

    /// Reads the sparse data available from `offset` on, stopping at
    /// the first gap.
    pub fn read_sparse_data(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        sparse::read(&mut self.shared.core.lock(), self.id, offset, buf)
    }

    /// Returns the first contiguous run of sparse data inside
    /// `[offset, offset + len)`, as a start offset and length.  The
    /// length is 0 if there is none.
    pub fn get_available_range(&self, offset: u64, len: usize) -> Result<(u64, usize)> {
        sparse::available_range(&mut self.shared.core.lock(), self.id, offset, len)
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.shared.core.lock().close(self.id);
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.id == other.id
    }
}

impl Eq for Entry {}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("id", &self.id)
            .finish()
    }
}

#[test]
fn test_state_codes() {
    for state in [EntryState::Normal, EntryState::Dirty, EntryState::Doomed].iter() {
        assert_eq!(EntryState::from_u8(state.to_u8()), Some(*state));
    }

    assert_eq!(EntryState::from_u8(3), None);
}
