//! A [`Backend`] is the public face of a cache instance.  Operations
//! that look up or change the set of entries return a [`Pending`]
//! result: the disk engines queue them on worker threads, while the
//! memory engine completes them before returning.
//!
//! Everything a backend knows lives in one [`Core`] behind one lock,
//! shared with every open [`Entry`].  Dropping the backend cancels its
//! queued operations; the core itself goes away (writing its index and
//! releasing its files) once the last entry handle is gone too, and
//! only then does the post-cleanup callback run.
use std::ops::RangeBounds;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::arena::EntryId;
use crate::config::BackendKind;
use crate::config::Config;
use crate::core::owned_bounds;
use crate::core::Core;
use crate::core::Stats;
use crate::entry::Entry;
use crate::error::Error;
use crate::error::Result;
use crate::eviction::MemoryPressure;
use crate::hash::key_hash;
use crate::queue::OperationQueue;
use crate::queue::Pending;

type Callback = Box<dyn FnOnce() + Send>;

pub(crate) struct Shared {
    pub core: Mutex<Core>,
    destroyed: AtomicBool,
    queue: Option<OperationQueue>,
    post_cleanup: Mutex<Option<Callback>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.core.get_mut().shutdown();
        if let Some(callback) = self.post_cleanup.get_mut().take() {
            callback();
        }
    }
}

/// Builds a handle for `id`, which the caller just opened.
fn make_entry(shared: &Arc<Shared>, core: &Core, id: EntryId, key: &[u8]) -> Entry {
    let key = core.key_of(id).unwrap_or_else(|| Arc::from(key));
    Entry::new(shared.clone(), id, key)
}

/// The result of [`Backend::open_or_create_entry`].
#[derive(Debug)]
pub struct EntryResult {
    pub entry: Entry,
    /// Whether the entry already existed.
    pub opened: bool,
}

/// A cache instance.
pub struct Backend {
    shared: Arc<Shared>,
}

impl Backend {
    pub(crate) fn open(config: Config, post_cleanup: Option<Callback>) -> Result<Backend> {
        let kind = config.kind;
        let workers = config.worker_threads;
        let core = Core::new(config)?;

        let queue = match kind {
            BackendKind::Memory => None,
            _ => Some(OperationQueue::new(
                &format!("cache-{}", kind.name()),
                workers,
            )?),
        };

        Ok(Backend {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                destroyed: AtomicBool::new(false),
                queue,
                post_cleanup: Mutex::new(post_cleanup),
            }),
        })
    }

    /// Runs `op` on the worker for `key`, or as a fence without a key.
    fn submit<T, F>(&self, key: Option<&[u8]>, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Shared>) -> Result<T> + Send + 'static,
    {
        let shared = self.shared.clone();
        match (&self.shared.queue, key) {
            (None, _) => Pending::ready(op(&shared)),
            (Some(queue), Some(key)) => queue.run(key_hash(key), move || op(&shared)),
            (Some(queue), None) => queue.fence(move || op(&shared)),
        }
    }

    /// Creates a new entry for `key`.  Fails with `AlreadyExists` if
    /// there is an active one.
    pub fn create_entry(&self, key: &[u8]) -> Pending<Entry> {
        let owned = key.to_vec();
        self.submit(Some(key), move |shared| {
            let mut core = shared.core.lock();
            let id = core.create(&owned)?;
            Ok(make_entry(shared, &core, id, &owned))
        })
    }

    /// Opens the active entry for `key`.  Fails with `NotFound` if
    /// there is none.
    pub fn open_entry(&self, key: &[u8]) -> Pending<Entry> {
        let owned = key.to_vec();
        self.submit(Some(key), move |shared| {
            let mut core = shared.core.lock();
            let id = core.open(&owned)?;
            Ok(make_entry(shared, &core, id, &owned))
        })
    }

    /// Opens the active entry for `key`, or creates one.
    pub fn open_or_create_entry(&self, key: &[u8]) -> Pending<EntryResult> {
        let owned = key.to_vec();
        self.submit(Some(key), move |shared| {
            let mut core = shared.core.lock();
            let (id, opened) = core.open_or_create(&owned)?;
            Ok(EntryResult {
                entry: make_entry(shared, &core, id, &owned),
                opened,
            })
        })
    }

    /// Dooms the active entry for `key`, if any.
    pub fn doom_entry(&self, key: &[u8]) -> Pending<()> {
        let owned = key.to_vec();
        self.submit(Some(key), move |shared| shared.core.lock().doom_key(&owned))
    }

    pub fn doom_all_entries(&self) -> Pending<()> {
        self.submit(None, |shared| shared.core.lock().doom_all())
    }

    /// Dooms every entry last used in `range`.
    pub fn doom_entries_between(&self, range: impl RangeBounds<SystemTime>) -> Pending<()> {
        let bounds = owned_bounds(&range);
        self.submit(None, move |shared| shared.core.lock().doom_range(bounds))
    }

    /// Dooms every entry last used at or after `since`.
    pub fn doom_entries_since(&self, since: SystemTime) -> Pending<()> {
        self.doom_entries_between(since..)
    }

    /// Recomputes the total size of all entries.
    pub fn calculate_size_of_all_entries(&self) -> Pending<i64> {
        self.submit(None, |shared| shared.core.lock().size_of_all())
    }

    /// Recomputes the total size of the entries last used in `range`.
    pub fn calculate_size_of_entries_between(
        &self,
        range: impl RangeBounds<SystemTime>,
    ) -> Pending<i64> {
        let bounds = owned_bounds(&range);
        self.submit(None, move |shared| shared.core.lock().size_of_range(bounds))
    }

    /// Returns a fresh iterator over the cache's entries, most recently
    /// used first.
    pub fn iter(&self) -> EntryIter {
        EntryIter {
            shared: Arc::downgrade(&self.shared),
            queued: self.shared.queue.is_some(),
            state: Arc::new(Mutex::new(IterState::Unstarted)),
        }
    }

    /// Returns the number of active entries, or 0 while disabled.
    pub fn entry_count(&self) -> usize {
        self.shared.core.lock().entry_count()
    }

    pub fn max_size(&self) -> u64 {
        self.shared.core.lock().max_size()
    }

    /// Changes the maximum size, evicting entries if the cache is now
    /// too large.  0 picks a size automatically.
    pub fn set_max_size(&self, max_size: u64) -> Result<()> {
        self.shared.core.lock().set_max_size(max_size)
    }

    pub fn stats(&self) -> Stats {
        self.shared.core.lock().stats()
    }

    /// Waits for every queued operation, then writes the index.
    pub fn flush(&self) -> Pending<()> {
        self.submit(None, |shared| shared.core.lock().flush())
    }

    /// Records that `key` was served from some other cache, as a use
    /// of its entry.
    pub fn on_external_cache_hit(&self, key: &[u8]) -> Pending<()> {
        let owned = key.to_vec();
        self.submit(Some(key), move |shared| {
            shared.core.lock().on_external_cache_hit(&owned)
        })
    }

    /// Trims a memory cache below a fraction of its maximum size.
    /// Disk caches ignore memory pressure.
    pub fn on_memory_pressure(&self, level: MemoryPressure) {
        self.shared.core.lock().on_memory_pressure(level)
    }

    /// Stops the backend as if the process died: queued operations are
    /// cancelled and files closed without writing anything.
    #[doc(hidden)]
    pub fn simulate_crash(self) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        if let Some(queue) = &self.shared.queue {
            queue.shutdown();
        }

        self.shared.core.lock().simulate_crash();
    }

    #[cfg(test)]
    pub(crate) fn corrupt_rankings(&self, key: &[u8], target: &[u8]) {
        self.shared.core.lock().corrupt_rankings(key, target);
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        if let Some(queue) = &self.shared.queue {
            queue.shutdown();
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Debug)]
enum IterState {
    Unstarted,
    /// Entries still to visit, in order.
    Walking(std::collections::VecDeque<EntryId>),
}

/// Enumerates a backend's entries, most recently used first, opening
/// each one.
///
/// The order is fixed on the first call to [`EntryIter::open_next`].
/// Entries doomed after that are skipped.  Enumeration leaves
/// timestamps and rankings alone.
#[derive(Debug)]
pub struct EntryIter {
    shared: Weak<Shared>,
    queued: bool,
    state: Arc<Mutex<IterState>>,
}

fn advance(shared: &Arc<Shared>, state: &Mutex<IterState>) -> Result<Option<Entry>> {
    if shared.destroyed.load(Ordering::SeqCst) {
        return Err(Error::BackendGone);
    }

    let mut state = state.lock();
    let mut core = shared.core.lock();
    if let IterState::Unstarted = *state {
        *state = IterState::Walking(core.iteration_snapshot()?.into());
    }

    let pending = match &mut *state {
        IterState::Walking(pending) => pending,
        IterState::Unstarted => return Ok(None),
    };

    while let Some(id) = pending.pop_front() {
        if let Some(id) = core.open_for_iteration(id)? {
            let key = core.key_of(id).unwrap_or_else(|| Arc::from(&[][..]));
            drop(core);
            return Ok(Some(Entry::new(shared.clone(), id, key)));
        }
    }

    Ok(None)
}

impl EntryIter {
    /// Opens the next entry, or returns `None` once every entry was
    /// visited.  Fails once the backend is gone or disabled.
    pub fn open_next(&mut self) -> Pending<Option<Entry>> {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return Pending::ready(Err(Error::BackendGone)),
        };

        let state = self.state.clone();
        match (&shared.queue, self.queued) {
            (Some(queue), true) => {
                let worker_shared = shared.clone();
                queue.fence(move || advance(&worker_shared, &state))
            }
            _ => Pending::ready(advance(&shared, &state)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BackendBuilder;
    use crate::config::CacheType;

    fn memory_backend() -> Backend {
        BackendBuilder::new()
            .cache_type(CacheType::Memory)
            .build()
            .expect("memory backend should build")
    }

    #[test]
    fn test_memory_ops_complete_inline() {
        let backend = memory_backend();

        let created = backend.create_entry(b"key");
        assert!(!created.is_pending());
        let entry = created.wait().expect("create should succeed");
        assert_eq!(entry.key(), b"key");

        let again = backend.open_entry(b"key").wait().expect("open should succeed");
        assert_eq!(again, entry);
        assert_eq!(backend.entry_count(), 1);
    }

    #[test]
    fn test_iterator_outlives_backend() {
        let backend = memory_backend();
        drop(
            backend
                .create_entry(b"a")
                .wait()
                .expect("create should succeed"),
        );

        let mut iter = backend.iter();
        drop(backend);
        assert!(matches!(iter.open_next().wait(), Err(Error::BackendGone)));
    }

    #[test]
    fn test_post_cleanup_waits_for_entries() {
        let fired = Arc::new(AtomicBool::new(false));
        let backend = {
            let fired = fired.clone();
            BackendBuilder::new()
                .cache_type(CacheType::Memory)
                .post_cleanup(move || fired.store(true, Ordering::SeqCst))
                .build()
                .expect("memory backend should build")
        };

        let entry = backend
            .create_entry(b"key")
            .wait()
            .expect("create should succeed");
        drop(backend);
        assert!(!fired.load(Ordering::SeqCst));

        // The handle still works without its backend.
        assert_eq!(entry.write_data(0, 0, b"abc", false).expect("write"), 3);
        drop(entry);
        assert!(fired.load(Ordering::SeqCst));
    }
}
