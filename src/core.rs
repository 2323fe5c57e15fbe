//! The core is the single logical sequence behind a backend: every
//! change to the index, the rankings lists, the size total, or the
//! entry records happens in a `&mut Core` method, under the backend's
//! one lock.  The storage engine is only ever called from here.
//!
//! The core also owns the cache's failure policy.  Structurally
//! invalid entries are dropped one at a time, without fuss.  A
//! corrupt rankings list met during enumeration is a critical error:
//! the cache resets right away if nothing is open, and otherwise
//! disables itself until the last open entry closes.  Corruption met
//! during eviction is repaired locally instead, by excising the bad
//! node and relinking the list.
use std::cmp::Reverse;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::arena::Arena;
use crate::arena::EntryId;
use crate::benign_error::is_absent_file_error;
use crate::blockfile::BlockfileEngine;
use crate::config::BackendKind;
use crate::config::Config;
use crate::engine::Loaded;
use crate::engine::Location;
use crate::engine::PersistedLinks;
use crate::engine::Snapshot;
use crate::engine::StorageEngine;
use crate::entry::EntryRecord;
use crate::entry::EntryState;
use crate::error::Error;
use crate::eviction::MemoryPressure;
use crate::error::Result;
use crate::hash::key_hash;
use crate::index::Index;
use crate::index::IndexRecord;
use crate::memory::MemoryEngine;
use crate::rankings::Direction;
use crate::rankings::Links;
use crate::rankings::List;
use crate::rankings::Rankings;
use crate::simple::SimpleEngine;
use crate::size::available_space;
use crate::size::DEFAULT_MEMORY_SIZE;
use crate::sparse;
use crate::trigger::WritebackTrigger;
use crate::STREAM_COUNT;

/// A point-in-time summary of a backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub entry_count: usize,
    pub total_size: i64,
    pub max_size: u64,
    /// Entry handles currently open.
    pub open_entries: usize,
    pub evictions: u64,
    /// Corrupt rankings lists and index files detected.
    pub corruptions: u64,
    /// Structurally invalid entries found and deleted.
    pub invalid_entries_dropped: u64,
    pub resets: u64,
    /// Entry files the file limiter closed to stay under its cap.
    pub fd_closes: u64,
    /// Entry files the file limiter had to reopen.
    pub fd_reopens: u64,
    pub disabled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CoreState {
    Running,
    /// Waiting for open entries to close before a reset.
    Disabled,
    /// Shut down or crashed; nothing works anymore.
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    evictions: u64,
    corruptions: u64,
    invalid_dropped: u64,
    resets: u64,
}

#[derive(Debug)]
pub(crate) struct Core {
    config: Config,
    engine: Box<dyn StorageEngine>,
    records: Arena<EntryRecord>,
    index: Index,
    rankings: Rankings,
    total_size: i64,
    max_size: u64,
    state: CoreState,
    open_handles: usize,
    writeback: WritebackTrigger,
    counters: Counters,
}

fn check_stream(stream: usize) -> Result<()> {
    if stream < STREAM_COUNT {
        Ok(())
    } else {
        Err(Error::InvalidArgument("stream index out of range"))
    }
}

/// Sparse children live in the same index as ordinary entries; keys
/// shaped like a child's are off limits to callers.
fn check_user_key(key: &[u8]) -> Result<()> {
    if sparse::parent_key(key).is_some() {
        Err(Error::InvalidArgument("key is reserved for sparse data"))
    } else {
        Ok(())
    }
}

/// Returns the bounds of `range` as owned values.
pub(crate) fn owned_bounds(
    range: &impl RangeBounds<SystemTime>,
) -> (Bound<SystemTime>, Bound<SystemTime>) {
    (range.start_bound().cloned(), range.end_bound().cloned())
}

impl Core {
    /// Builds the engine for `config`, loads its persistent state,
    /// and sizes the cache.
    pub fn new(config: Config) -> Result<Core> {
        let engine: Box<dyn StorageEngine> = match config.kind {
            BackendKind::Memory => Box::new(MemoryEngine::new()),
            BackendKind::Simple => Box::new(SimpleEngine::new(&config)),
            BackendKind::Blockfile => Box::new(BlockfileEngine::new(&config)),
            BackendKind::Default => {
                return Err(Error::InvalidArgument("backend kind must be resolved"))
            }
        };

        let writeback = WritebackTrigger::new(config.index_writeback_period);
        let mut core = Core {
            config,
            engine,
            records: Arena::default(),
            index: Index::default(),
            rankings: Rankings::default(),
            total_size: 0,
            max_size: 0,
            state: CoreState::Running,
            open_handles: 0,
            writeback,
            counters: Counters::default(),
        };

        let loaded = core.engine.load()?;
        core.install(loaded);
        core.max_size = core.resolve_max_size(core.config.max_size)?;
        info!(
            kind = core.config.kind.name(),
            path = ?core.config.path,
            entries = core.index.len(),
            total_size = core.total_size,
            max_size = core.max_size,
            "opened cache backend"
        );

        core.make_room(0, None);
        Ok(core)
    }

    fn resolve_max_size(&self, requested: u64) -> Result<u64> {
        if requested != 0 {
            return Ok(requested);
        }

        if self.config.kind == BackendKind::Memory {
            return Ok(DEFAULT_MEMORY_SIZE);
        }

        let available = available_space(&self.config.path)?;
        let preferred = self.config.size_policy.preferred_cache_size(available);
        if self.config.kind.accepts_max_size(preferred) {
            Ok(preferred)
        } else {
            Ok(i32::MAX as u64)
        }
    }

    /// Turns the engine's loaded entries into records, and rebuilds
    /// the index and the rankings lists.
    fn install(&mut self, loaded: Loaded) {
        self.counters.invalid_dropped += loaded.dropped;

        let mut by_location: HashMap<Location, EntryId> = HashMap::new();
        let mut persisted: Vec<(EntryId, Option<PersistedLinks>)> = Vec::new();
        for entry in loaded.entries {
            if self.lookup(&entry.key).is_some() {
                warn!(key = ?String::from_utf8_lossy(&entry.key), "dropping duplicate entry");
                self.counters.invalid_dropped += 1;
                if let Err(e) = self.engine.remove(entry.location) {
                    warn!(%e, "failed to remove duplicate entry");
                }
                continue;
            }

            let accounted = self
                .engine
                .accounted_size(entry.key.len(), &entry.stream_sizes);
            let sparse_child = sparse::parent_key(&entry.key).is_some();
            let id = self.records.insert(EntryRecord {
                key: Arc::from(entry.key),
                hash: entry.hash,
                location: entry.location,
                state: EntryState::Normal,
                last_used: entry.last_used,
                last_modified: entry.last_modified,
                stream_sizes: entry.stream_sizes,
                refs: 0,
                reuse_count: entry.reuse_count,
                accounted,
                links: Links::default(),
                validated: entry.validated,
                sparse_child,
                sparse_parent: false,
            });

            self.index.insert(entry.hash, id);
            self.total_size += accounted;
            by_location.insert(entry.location, id);
            persisted.push((id, entry.links));
        }

        let parents: Vec<EntryId> = self
            .records
            .iter()
            .filter_map(|(_, record)| sparse::parent_key(&record.key))
            .filter_map(|parent| self.lookup(parent))
            .collect();
        for parent in parents {
            if let Some(record) = self.records.get_mut(parent) {
                record.sparse_parent = true;
            }
        }

        let restored = match loaded.lists {
            Some(ends) if persisted.iter().all(|(_, links)| links.is_some()) => {
                self.restore_lists(&ends, &persisted, &by_location)
            }
            _ => false,
        };

        if !restored {
            self.rebuild_lists_by_time();
        }

        self.sync_links();
    }

    /// Installs persisted links, and checks them with a full walk.
    /// Returns false (and leaves the lists empty) if they don't hold
    /// up.
    fn restore_lists(
        &mut self,
        ends: &[(Option<Location>, Option<Location>)],
        persisted: &[(EntryId, Option<PersistedLinks>)],
        by_location: &HashMap<Location, EntryId>,
    ) -> bool {
        let resolve = |location: Option<Location>| {
            location.map(|location| {
                by_location
                    .get(&location)
                    .copied()
                    .unwrap_or(EntryId::DANGLING)
            })
        };

        let mut lens = [0usize; 2];
        for (id, links) in persisted.iter() {
            let links = match links {
                Some(links) => links,
                None => return false,
            };

            lens[links.list.index()] += 1;
            if let Some(record) = self.records.get_mut(*id) {
                record.links = Links {
                    prev: resolve(links.prev),
                    next: resolve(links.next),
                    list: Some(links.list),
                    seq: 0,
                };
            }
        }

        let max_seq = persisted.len() as u64;
        for list in List::ALL.iter() {
            let (head, tail) = ends[list.index()];
            self.rankings.restore(
                *list,
                resolve(head),
                resolve(tail),
                lens[list.index()],
                max_seq,
            );
        }

        let mut seq = 0;
        for list in List::ALL.iter() {
            match self.rankings.walk(&self.records, *list, Direction::FromTail) {
                Ok(order) => {
                    for id in order {
                        seq += 1;
                        if let Some(record) = self.records.get_mut(id) {
                            record.links.seq = seq;
                        }
                    }
                }
                Err(corruption) => {
                    warn!(
                        %corruption,
                        "persisted rankings are corrupt; rebuilding from timestamps"
                    );
                    self.counters.corruptions += 1;
                    return false;
                }
            }
        }

        self.rankings.take_touched();
        true
    }

    /// Relinks every live entry by last use, oldest at the tail.  Ties
    /// keep load order.
    fn rebuild_lists_by_time(&mut self) {
        self.rankings.clear();

        let mut order: Vec<(SystemTime, EntryId)> = Vec::with_capacity(self.records.len());
        for (id, record) in self.records.iter() {
            order.push((record.last_used, id));
        }
        order.sort();

        for (_, id) in order {
            if let Some(record) = self.records.get_mut(id) {
                record.links = Links::default();
                let list = self.config.eviction.list_for(record.reuse_count);
                self.rankings.insert_head(&mut self.records, id, list);
            }
        }
    }

    /// Writes changed links through to engines that persist them.
    fn sync_links(&mut self) {
        let touched = self.rankings.take_touched();
        if !self.engine.persists_links() {
            return;
        }

        for id in touched {
            let (location, links) = match self.records.get(id) {
                Some(record) if !record.is_doomed() => (record.location, record.links),
                _ => continue,
            };
            let list = match links.list {
                Some(list) => list,
                None => continue,
            };

            let records = &self.records;
            let location_of = |other: Option<EntryId>| {
                other
                    .and_then(|other| records.get(other))
                    .map(|record| record.location)
            };
            let persisted = PersistedLinks {
                prev: location_of(links.prev),
                next: location_of(links.next),
                list,
            };

            if let Err(e) = self.engine.update_links(location, persisted) {
                warn!(%e, ?location, "failed to persist rankings links");
            }
        }
    }

    fn now(&self) -> SystemTime {
        self.config.clock.now()
    }

    fn check_running(&self) -> Result<()> {
        match self.state {
            CoreState::Running => Ok(()),
            CoreState::Disabled => Err(Error::Disabled),
            CoreState::Closed => Err(Error::BackendGone),
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            CoreState::Running | CoreState::Disabled => Ok(()),
            CoreState::Closed => Err(Error::BackendGone),
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<EntryId> {
        let records = &self.records;
        self.index.lookup(key_hash(key), |id| {
            records
                .get(id)
                .map_or(false, |record| &*record.key == key)
        })
    }

    /// Like [`Core::lookup`], but drops the entry (and misses) if its
    /// storage turns out to be invalid.
    pub fn lookup_valid(&mut self, key: &[u8]) -> Result<Option<EntryId>> {
        match self.lookup(key) {
            Some(id) if self.ensure_valid(id)? => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    pub fn key_of(&self, id: EntryId) -> Option<Arc<[u8]>> {
        self.records.get(id).map(|record| record.key.clone())
    }

    pub fn is_sparse_parent(&self, id: EntryId) -> bool {
        self.records
            .get(id)
            .map_or(false, |record| record.sparse_parent)
    }

    pub fn mark_sparse_parent(&mut self, id: EntryId) {
        if let Some(record) = self.records.get_mut(id) {
            record.sparse_parent = true;
        }
    }

    fn note_mutation(&mut self) {
        if self.writeback.event() {
            match self.write_snapshot(false) {
                Ok(()) => debug!(entries = self.index.len(), "wrote back index"),
                Err(e) => warn!(%e, "index write-back failed"),
            }
        }
    }

    /// Makes sure the engine vouched for `id`'s storage.  Drops the
    /// entry and returns false if the storage is invalid.
    fn ensure_valid(&mut self, id: EntryId) -> Result<bool> {
        let (location, hash, key) = match self.records.get(id) {
            Some(record) if record.validated => return Ok(true),
            Some(record) => (record.location, record.hash, record.key.clone()),
            None => return Ok(false),
        };

        match self.engine.open(location, &key, hash) {
            Ok(sizes) => {
                let accounted = self.engine.accounted_size(key.len(), &sizes);
                if let Some(record) = self.records.get_mut(id) {
                    self.total_size += accounted - record.accounted;
                    record.stream_sizes = sizes;
                    record.accounted = accounted;
                    record.validated = true;
                }
                Ok(true)
            }
            Err(Error::Corrupt(reason)) => {
                warn!(%reason, key = ?String::from_utf8_lossy(&key), "dropping invalid entry");
                self.drop_invalid(id);
                Ok(false)
            }
            Err(Error::Io(e)) if is_absent_file_error(&e) => {
                warn!(key = ?String::from_utf8_lossy(&key), "dropping entry with missing files");
                self.drop_invalid(id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn drop_invalid(&mut self, id: EntryId) {
        self.counters.invalid_dropped += 1;
        self.doom_id(id);
    }

    /// Moves `id` to the head of its list and refreshes its last use.
    fn touch(&mut self, id: EntryId) {
        let now = self.now();
        let list = match self.records.get_mut(id) {
            Some(record) if !record.is_doomed() => {
                record.last_used = now;
                self.config.eviction.list_for(record.reuse_count)
            }
            _ => return,
        };

        self.rankings.move_to_head(&mut self.records, id, list);
        self.sync_links();
    }

    pub fn open(&mut self, key: &[u8]) -> Result<EntryId> {
        self.check_running()?;
        check_user_key(key)?;
        self.open_unchecked(key)
    }

    /// Opens `key` whatever the backend's state.  Sparse I/O on open
    /// entries uses this for child entries.
    pub fn open_unchecked(&mut self, key: &[u8]) -> Result<EntryId> {
        let id = self.lookup(key).ok_or(Error::NotFound)?;
        if !self.ensure_valid(id)? {
            return Err(Error::NotFound);
        }

        let cache_type = self.config.cache_type;
        let (location, mark_dirty) = match self.records.get(id) {
            Some(record) => (
                record.location,
                cache_type.dirties_on_open() && record.state == EntryState::Normal,
            ),
            None => return Err(Error::NotFound),
        };

        if mark_dirty {
            self.engine.set_state(location, EntryState::Dirty)?;
        }

        if let Some(record) = self.records.get_mut(id) {
            record.refs += 1;
            record.reuse_count = record.reuse_count.saturating_add(1);
            if mark_dirty {
                record.state = EntryState::Dirty;
            }
        }
        self.open_handles += 1;

        if cache_type.reorders_on_read() {
            self.touch(id);
        }

        self.note_mutation();
        Ok(id)
    }

    pub fn create(&mut self, key: &[u8]) -> Result<EntryId> {
        self.check_running()?;
        check_user_key(key)?;
        self.create_unchecked(key)
    }

    pub fn create_unchecked(&mut self, key: &[u8]) -> Result<EntryId> {
        if self.lookup(key).is_some() {
            return Err(Error::AlreadyExists);
        }

        let hash = key_hash(key);
        let accounted = self.engine.accounted_size(key.len(), &[0; STREAM_COUNT]);
        self.make_room(accounted, None);

        let now = self.now();
        let location = self.engine.create(key, hash, now)?;
        let id = self.records.insert(EntryRecord {
            key: Arc::from(key),
            hash,
            location,
            state: EntryState::Dirty,
            last_used: now,
            last_modified: now,
            stream_sizes: [0; STREAM_COUNT],
            refs: 1,
            reuse_count: 0,
            accounted,
            links: Links::default(),
            validated: true,
            sparse_child: sparse::parent_key(key).is_some(),
            sparse_parent: false,
        });

        self.index.insert(hash, id);
        self.total_size += accounted;
        self.open_handles += 1;

        let list = self.config.eviction.list_for(0);
        self.rankings.insert_head(&mut self.records, id, list);
        self.sync_links();
        self.note_mutation();
        Ok(id)
    }

    /// Returns the entry and whether it already existed.
    pub fn open_or_create(&mut self, key: &[u8]) -> Result<(EntryId, bool)> {
        match self.open(key) {
            Ok(id) => Ok((id, true)),
            Err(Error::NotFound) => self.create(key).map(|id| (id, false)),
            Err(e) => Err(e),
        }
    }

    /// Dooms the active entry for `key`.  Dooming a missing key is a
    /// success: the key is absent either way.
    pub fn doom_key(&mut self, key: &[u8]) -> Result<()> {
        self.check_running()?;
        check_user_key(key)?;
        if let Some(id) = self.lookup(key) {
            self.doom_id(id);
            self.note_mutation();
        }

        Ok(())
    }

    /// Dooms on behalf of an open handle, which works even while the
    /// backend is disabled.
    pub fn doom_handle(&mut self, id: EntryId) -> Result<()> {
        self.check_open()?;
        self.doom_id(id);
        self.note_mutation();
        Ok(())
    }

    /// Takes `id` out of the index and the rankings, and deletes its
    /// storage unless some handle still has it open.
    pub fn doom_id(&mut self, id: EntryId) {
        let (location, refs, sparse_parent, key) = match self.records.get(id) {
            Some(record) if !record.is_doomed() => (
                record.location,
                record.refs,
                record.sparse_parent,
                record.key.clone(),
            ),
            _ => return,
        };

        self.rankings.remove(&mut self.records, id);
        if let Some(record) = self.records.get_mut(id) {
            self.index.remove(record.hash, id);
            self.total_size -= record.accounted;
            record.accounted = 0;
            record.state = EntryState::Doomed;
        }

        if refs == 0 {
            self.reclaim(id);
        } else if let Err(e) = self.engine.set_state(location, EntryState::Doomed) {
            warn!(%e, ?location, "failed to mark entry doomed");
        }

        if sparse_parent {
            for child in self.sparse_children(&key) {
                self.doom_id(child);
            }
        }

        self.sync_links();
    }

    fn sparse_children(&self, key: &[u8]) -> Vec<EntryId> {
        self.records
            .iter()
            .filter(|(_, record)| record.sparse_child && !record.is_doomed())
            .filter(|(_, record)| sparse::parent_key(&record.key) == Some(key))
            .map(|(id, _)| id)
            .collect()
    }

    fn reclaim(&mut self, id: EntryId) {
        if let Some(record) = self.records.remove(id) {
            if let Err(e) = self.engine.remove(record.location) {
                warn!(%e, location = ?record.location, "failed to delete entry storage");
            }
        }
    }

    /// Releases one handle on `id`.
    pub fn close(&mut self, id: EntryId) {
        if self.state == CoreState::Closed {
            return;
        }

        let record = match self.records.get_mut(id) {
            Some(record) if record.refs > 0 => record,
            _ => return,
        };

        record.refs -= 1;
        self.open_handles = self.open_handles.saturating_sub(1);
        if record.refs == 0 {
            if record.is_doomed() {
                self.reclaim(id);
            } else {
                record.state = EntryState::Normal;
                let location = record.location;
                let closed = self.engine.close(location, &record.meta());
                if let Err(e) = closed {
                    warn!(%e, ?location, "failed to close entry; dropping it");
                    self.drop_invalid(id);
                }
            }
        }

        if self.open_handles == 0 && self.state == CoreState::Disabled {
            self.reset();
        }
    }

    pub fn read(
        &mut self,
        id: EntryId,
        stream: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.check_open()?;
        check_stream(stream)?;

        let record = self.records.get(id).ok_or(Error::NotFound)?;
        let len = record.stream_sizes[stream] as u64;
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }

        let wanted = (buf.len() as u64).min(len - offset) as usize;
        let location = record.location;
        let doomed = record.is_doomed();
        let read = self
            .engine
            .read(location, stream, offset, &mut buf[..wanted])?;

        if !doomed && self.config.cache_type.reorders_on_read() {
            self.touch(id);
        }

        Ok(read)
    }

    pub fn write(
        &mut self,
        id: EntryId,
        stream: usize,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        self.check_open()?;
        check_stream(stream)?;

        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= u32::MAX as u64)
            .ok_or(Error::InvalidArgument("write extends past the largest stream"))?;

        let record = self.records.get(id).ok_or(Error::NotFound)?;
        let old_len = record.stream_sizes[stream] as u64;
        let new_len = if truncate { end } else { old_len.max(end) };
        if new_len > self.engine.max_stream_size(self.max_size) {
            return Err(Error::InsufficientResources("stream exceeds the per-entry limit"));
        }

        let mut sizes = record.stream_sizes;
        sizes[stream] = new_len as u32;
        let accounted = self.engine.accounted_size(record.key.len(), &sizes);
        let growth = accounted - record.accounted;
        let doomed = record.is_doomed();
        let location = record.location;
        let needs_dirty = record.state == EntryState::Normal;

        if !doomed && growth > 0 && !self.make_room(growth, Some(id)) {
            return Err(Error::InsufficientResources("cache is full"));
        }

        if needs_dirty {
            self.engine.set_state(location, EntryState::Dirty)?;
        }

        self.engine
            .write(location, stream, offset, data, new_len as u32)?;

        let now = self.now();
        if let Some(record) = self.records.get_mut(id) {
            record.stream_sizes = sizes;
            record.last_modified = now;
            if needs_dirty {
                record.state = EntryState::Dirty;
            }
            if !doomed {
                self.total_size += accounted - record.accounted;
                record.accounted = accounted;
            }
        }

        if !doomed {
            self.touch(id);
        }

        self.note_mutation();
        Ok(data.len())
    }

    pub fn data_size(&self, id: EntryId, stream: usize) -> u32 {
        self.records
            .get(id)
            .and_then(|record| record.stream_sizes.get(stream).copied())
            .unwrap_or(0)
    }

    /// Returns `(last_used, last_modified)`.
    pub fn timestamps(&self, id: EntryId) -> (SystemTime, SystemTime) {
        self.records
            .get(id)
            .map(|record| (record.last_used, record.last_modified))
            .unwrap_or((UNIX_EPOCH, UNIX_EPOCH))
    }

    fn live_ids(&self) -> Vec<EntryId> {
        self.records
            .iter()
            .filter(|(_, record)| !record.is_doomed())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn doom_all(&mut self) -> Result<()> {
        self.check_running()?;
        for id in self.live_ids() {
            self.doom_id(id);
        }

        self.note_mutation();
        Ok(())
    }

    /// Dooms entries last used in `range`.
    pub fn doom_range(&mut self, range: (Bound<SystemTime>, Bound<SystemTime>)) -> Result<()> {
        if matches!(range, (Bound::Unbounded, Bound::Unbounded)) {
            return self.doom_all();
        }

        self.check_running()?;
        let victims: Vec<EntryId> = self
            .records
            .iter()
            .filter(|(_, record)| !record.is_doomed() && range.contains(&record.last_used))
            .map(|(id, _)| id)
            .collect();
        for id in victims {
            self.doom_id(id);
        }

        self.note_mutation();
        Ok(())
    }

    fn recomputed_size(&self, id: EntryId) -> i64 {
        self.records.get(id).map_or(0, |record| {
            self.engine
                .accounted_size(record.key.len(), &record.stream_sizes)
        })
    }

    /// Recomputes the total size from scratch.
    pub fn size_of_all(&self) -> Result<i64> {
        self.check_running()?;
        Ok(self
            .live_ids()
            .into_iter()
            .map(|id| self.recomputed_size(id))
            .sum())
    }

    pub fn size_of_range(&self, range: (Bound<SystemTime>, Bound<SystemTime>)) -> Result<i64> {
        self.check_running()?;
        let unbounded = matches!(range, (Bound::Unbounded, Bound::Unbounded));
        if !self
            .engine
            .supports_range_size(self.config.cache_type, unbounded)
        {
            return Err(Error::NotImplemented(self.config.kind.name()));
        }

        Ok(self
            .records
            .iter()
            .filter(|(_, record)| !record.is_doomed() && range.contains(&record.last_used))
            .map(|(id, _)| self.recomputed_size(id))
            .sum())
    }

    /// Returns every live entry, most recently used first.  A corrupt
    /// list here is a critical error.
    pub fn iteration_snapshot(&mut self) -> Result<Vec<EntryId>> {
        self.check_running()?;

        let mut merged: Vec<(u64, EntryId)> = Vec::with_capacity(self.index.len());
        for list in List::ALL.iter() {
            match self.rankings.walk(&self.records, *list, Direction::FromHead) {
                Ok(order) => merged.extend(order.into_iter().map(|id| {
                    let seq = self.records.get(id).map_or(0, |record| record.links.seq);
                    (seq, id)
                })),
                Err(corruption) => {
                    self.critical_error(&corruption.to_string());
                    return Err(Error::corrupt(corruption));
                }
            }
        }

        merged.sort_by_key(|(seq, id)| (Reverse(*seq), *id));
        Ok(merged.into_iter().map(|(_, id)| id).collect())
    }

    /// Opens `id` for an iterator, if it is still live and valid.
    /// Neither timestamps nor rankings change.
    pub fn open_for_iteration(&mut self, id: EntryId) -> Result<Option<EntryId>> {
        self.check_running()?;
        match self.records.get(id) {
            Some(record) if !record.is_doomed() => {}
            _ => return Ok(None),
        }

        if !self.ensure_valid(id)? {
            return Ok(None);
        }

        if let Some(record) = self.records.get_mut(id) {
            record.refs += 1;
            self.open_handles += 1;
        }

        Ok(Some(id))
    }

    /// Counts a hit served from elsewhere as a use of `key`.
    pub fn on_external_cache_hit(&mut self, key: &[u8]) -> Result<()> {
        self.check_running()?;
        check_user_key(key)?;
        if let Some(id) = self.lookup(key) {
            self.touch(id);
        }

        Ok(())
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Changes the maximum size (0 for automatic), evicting right away
    /// if the cache is now over budget.
    pub fn set_max_size(&mut self, max_size: u64) -> Result<()> {
        self.check_open()?;
        if !self.config.kind.accepts_max_size(max_size) {
            return Err(Error::InvalidArgument("max_size is too large for this backend"));
        }

        self.max_size = self.resolve_max_size(max_size)?;
        self.make_room(0, None);
        Ok(())
    }

    /// Trims a memory cache below its maximum size.  Disk caches
    /// ignore memory pressure.
    pub fn on_memory_pressure(&mut self, level: MemoryPressure) {
        if self.config.kind != BackendKind::Memory || self.state != CoreState::Running {
            return;
        }

        let target = level.target_size(self.max_size);
        debug!(?level, target, total_size = self.total_size, "trimming for memory pressure");
        self.evict_until(target, 0, None);
    }

    pub fn entry_count(&self) -> usize {
        match self.state {
            CoreState::Running => self.index.len(),
            CoreState::Disabled | CoreState::Closed => 0,
        }
    }

    pub fn stats(&self) -> Stats {
        let fd = self.engine.fd_stats();
        Stats {
            entry_count: self.entry_count(),
            total_size: self.total_size,
            max_size: self.max_size,
            open_entries: self.open_handles,
            evictions: self.counters.evictions,
            corruptions: self.counters.corruptions,
            invalid_entries_dropped: self.counters.invalid_dropped,
            resets: self.counters.resets,
            fd_closes: fd.closes,
            fd_reopens: fd.reopens,
            disabled: self.state == CoreState::Disabled,
        }
    }

    /// Whether `id` may be evicted to make room for `protect`.
    fn evictable(&self, id: EntryId, protect: Option<EntryId>) -> bool {
        Some(id) != protect
            && self
                .records
                .get(id)
                .map_or(false, |record| record.refs == 0 && !record.is_doomed())
    }

    /// Walks `list` from its tail for eviction.  A corrupt node is
    /// excised (if nobody has it open) and the list relinked.
    fn eviction_order(&mut self, list: List, protect: Option<EntryId>) -> VecDeque<EntryId> {
        for _ in 0..3 {
            match self.rankings.walk(&self.records, list, Direction::FromTail) {
                Ok(order) => return order.into(),
                Err(corruption) => {
                    warn!(%corruption, "repairing rankings list during eviction");
                    self.counters.corruptions += 1;
                    if let Some(culprit) = corruption.culprit() {
                        if self.evictable(culprit, protect) {
                            self.doom_id(culprit);
                        }
                    }

                    self.rankings.relink(&mut self.records, list);
                    self.sync_links();
                }
            }
        }

        VecDeque::new()
    }

    /// Evicts unused entries, least recently used first, until
    /// `incoming` more bytes fit under the maximum size.  Returns
    /// whether they fit.
    fn make_room(&mut self, incoming: i64, protect: Option<EntryId>) -> bool {
        self.evict_until(self.max_size, incoming, protect)
    }

    /// Evicts until `incoming` more bytes fit under `limit`.
    fn evict_until(&mut self, limit: u64, incoming: i64, protect: Option<EntryId>) -> bool {
        let max_size = limit.min(i64::MAX as u64) as i64;
        let mut candidates: [Option<VecDeque<EntryId>>; 2] = [None, None];
        let mut evicted = 0u64;

        while self.total_size + incoming > max_size {
            let preferred = self.config.eviction.select_list(
                self.rankings.len(List::NoUse),
                self.rankings.len(List::Reused),
            );

            let mut victim = None;
            for list in [preferred, preferred.other()].iter() {
                let slot = list.index();
                if candidates[slot].is_none() {
                    candidates[slot] = Some(self.eviction_order(*list, protect));
                }

                while let Some(id) = candidates[slot].as_mut().and_then(|queue| queue.pop_front()) {
                    if self.evictable(id, protect) {
                        victim = Some(id);
                        break;
                    }
                }

                if victim.is_some() {
                    break;
                }
            }

            match victim {
                Some(id) => {
                    self.doom_id(id);
                    evicted += 1;
                }
                None => break,
            }
        }

        if evicted > 0 {
            self.counters.evictions += evicted;
            debug!(
                evicted,
                total_size = self.total_size,
                limit,
                "evicted entries"
            );
        }

        self.total_size + incoming <= max_size
    }

    fn critical_error(&mut self, reason: &str) {
        warn!(%reason, "critical cache error");
        self.counters.corruptions += 1;
        if self.open_handles == 0 {
            self.reset();
        } else {
            info!(open = self.open_handles, "disabling cache until open entries close");
            self.state = CoreState::Disabled;
        }
    }

    /// Wipes everything.  Only valid with no open handles.
    fn reset(&mut self) {
        info!(entries = self.index.len(), "resetting cache");
        self.rankings.clear();
        self.index.clear();
        self.records.clear();
        self.total_size = 0;
        if let Err(e) = self.engine.remove_all() {
            warn!(%e, "failed to wipe cache storage");
        }

        self.counters.resets += 1;
        self.state = CoreState::Running;
    }

    fn snapshot(&self) -> Snapshot {
        let mut order: Vec<(u64, EntryId)> = self
            .records
            .iter()
            .filter(|(_, record)| !record.is_doomed())
            .map(|(id, record)| (record.links.seq, id))
            .collect();
        order.sort_by_key(|(seq, id)| (Reverse(*seq), *id));

        let records = order
            .into_iter()
            .filter_map(|(_, id)| self.records.get(id))
            .map(|record| IndexRecord {
                hash: record.hash,
                key: record.key.to_vec(),
                last_used: crate::clock::to_micros(record.last_used),
                last_modified: crate::clock::to_micros(record.last_modified),
                stream_sizes: record.stream_sizes,
            })
            .collect();

        let location_of = |id: Option<EntryId>| {
            id.and_then(|id| self.records.get(id))
                .map(|record| record.location)
        };
        let mut snapshot = Snapshot {
            records,
            total_size: self.total_size,
            ..Default::default()
        };
        for list in List::ALL.iter() {
            snapshot.heads[list.index()] = location_of(self.rankings.head(*list));
            snapshot.tails[list.index()] = location_of(self.rankings.tail(*list));
        }

        snapshot
    }

    fn write_snapshot(&mut self, clean: bool) -> Result<()> {
        let snapshot = self.snapshot();
        self.engine.flush(&snapshot, clean)
    }

    /// Writes the index now.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        self.write_snapshot(false)
    }

    /// Writes a clean index and releases every file.  Called once all
    /// handles are gone.
    pub fn shutdown(&mut self) {
        if self.state == CoreState::Closed {
            return;
        }

        if let Err(e) = self.write_snapshot(true) {
            warn!(%e, "failed to write index at shutdown");
        }

        self.engine.shutdown();
        self.state = CoreState::Closed;
        info!(
            kind = self.config.kind.name(),
            entries = self.index.len(),
            "cache backend shut down"
        );
    }

    /// Drops every file handle without writing anything, as if the
    /// process died.
    pub fn simulate_crash(&mut self) {
        self.engine.shutdown();
        self.state = CoreState::Closed;
    }

    /// Points `key`'s forward rankings link at `target`'s entry, the
    /// way a torn write would.
    #[cfg(test)]
    pub fn corrupt_rankings(&mut self, key: &[u8], target: &[u8]) {
        if let (Some(id), Some(target)) = (self.lookup(key), self.lookup(target)) {
            self.rankings.corrupt_next(&mut self.records, id, target);
        }
    }
}
