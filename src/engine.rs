//! A [`StorageEngine`] is where entry bytes actually live.  The core
//! owns every piece of bookkeeping (index, rankings, sizes, handle
//! counts) and calls into the engine for persistence only, so the
//! three engines share one consistency contract:
//!
//! - [`crate::memory`]: plain in-memory buffers;
//! - [`crate::simple`]: one file per entry stream;
//! - [`crate::blockfile`]: records and small streams packed in shared
//!   block files.
//!
//! Engines are always called with the core lock held, one call at a
//! time.  They identify entries by an opaque [`Location`], which they
//! hand out on `create` and `load`.
use std::time::SystemTime;

use crate::config::BackendKind;
use crate::config::CacheType;
use crate::entry::EntryState;
use crate::error::Result;
use crate::fd_limiter::FdStats;
use crate::index::IndexRecord;
use crate::rankings::List;
use crate::rankings::LIST_COUNT;
use crate::STREAM_COUNT;

/// Engine-specific address of an entry's storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Location(pub u64);

/// Rankings links in terms of storage locations, for engines that
/// persist them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PersistedLinks {
    pub prev: Option<Location>,
    pub next: Option<Location>,
    pub list: List,
}

/// An entry found in persistent storage at startup.
#[derive(Clone, Debug)]
pub(crate) struct LoadedEntry {
    pub key: Vec<u8>,
    pub hash: u64,
    pub last_used: SystemTime,
    pub last_modified: SystemTime,
    pub stream_sizes: [u32; STREAM_COUNT],
    pub location: Location,
    /// Only when the engine persists links and shut down cleanly.
    pub links: Option<PersistedLinks>,
    pub reuse_count: u32,
    /// Whether the engine already checked the entry's storage.
    /// Unchecked entries are validated on first open.
    pub validated: bool,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Loaded {
    pub entries: Vec<LoadedEntry>,
    /// Persisted list ends (head, tail), when every entry carries
    /// trustworthy links.
    pub lists: Option<[(Option<Location>, Option<Location>); LIST_COUNT]>,
    /// Invalid entries deleted while loading.
    pub dropped: u64,
}

/// What an engine persists about an entry when its last handle
/// closes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EntryMeta<'a> {
    pub key: &'a [u8],
    pub hash: u64,
    pub last_used: SystemTime,
    pub last_modified: SystemTime,
    pub stream_sizes: [u32; STREAM_COUNT],
    pub reuse_count: u32,
}

/// Everything an engine may want to write to its index file.
#[derive(Clone, Debug, Default)]
pub(crate) struct Snapshot {
    /// Active entries, most recently used first.
    pub records: Vec<IndexRecord>,
    pub heads: [Option<Location>; LIST_COUNT],
    pub tails: [Option<Location>; LIST_COUNT],
    pub total_size: i64,
}

pub(crate) trait StorageEngine: Send + std::fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Opens (or creates, or recovers) persistent state, and returns
    /// the entries it holds.
    fn load(&mut self) -> Result<Loaded>;

    /// Returns the number of bytes an entry with this key length and
    /// these stream sizes counts against the cache's maximum size.
    fn accounted_size(&self, key_len: usize, stream_sizes: &[u32; STREAM_COUNT]) -> i64;

    /// Returns the largest permitted stream for a cache of `max_size`
    /// bytes.
    fn max_stream_size(&self, max_size: u64) -> u64 {
        max_size / 8
    }

    /// Allocates storage for a new, empty, dirty entry.  Fails with
    /// `AlreadyExists` if the storage is taken.
    fn create(&mut self, key: &[u8], hash: u64, now: SystemTime) -> Result<Location>;

    /// Checks the storage of an entry that was loaded without
    /// validation.  Returns its actual stream sizes, or a `Corrupt`
    /// error for an entry that should be dropped.
    fn open(&mut self, location: Location, key: &[u8], hash: u64)
        -> Result<[u32; STREAM_COUNT]>;

    /// Fills `buf` from `stream` at `offset`.  The caller has clamped
    /// `buf` to the stream's length.
    fn read(&mut self, location: Location, stream: usize, offset: u64, buf: &mut [u8])
        -> Result<usize>;

    /// Writes `data` at `offset` in `stream`, and leaves the stream
    /// exactly `new_len` bytes long.  Any gap is zero-filled.
    fn write(
        &mut self,
        location: Location,
        stream: usize,
        offset: u64,
        data: &[u8],
        new_len: u32,
    ) -> Result<()>;

    fn set_state(&mut self, location: Location, state: EntryState) -> Result<()>;

    /// Persists an entry whose last handle just closed.  The entry
    /// is `Normal` again.
    fn close(&mut self, location: Location, meta: &EntryMeta) -> Result<()>;

    /// Whether this engine stores rankings links.
    fn persists_links(&self) -> bool {
        false
    }

    fn update_links(&mut self, _location: Location, _links: PersistedLinks) -> Result<()> {
        Ok(())
    }

    /// Deletes an entry's storage.
    fn remove(&mut self, location: Location) -> Result<()>;

    /// Deletes all storage and starts afresh.
    fn remove_all(&mut self) -> Result<()>;

    /// Writes the index.  `clean` marks a shutdown after which every
    /// entry file is complete.
    fn flush(&mut self, snapshot: &Snapshot, clean: bool) -> Result<()>;

    /// Releases files.  No other call follows.
    fn shutdown(&mut self);

    fn fd_stats(&self) -> FdStats {
        FdStats::default()
    }

    /// Whether this engine answers size queries for a time range.
    fn supports_range_size(&self, cache_type: CacheType, unbounded: bool) -> bool;
}
