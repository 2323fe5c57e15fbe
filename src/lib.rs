//! A bounded, crash-tolerant disk cache for HTTP responses and other
//! keyed blobs.  Each cache entry has a byte-string key and three
//! independently sized data streams (by convention: headers, body,
//! and side data), plus an optional sparse address space for range
//! requests.
//!
//! Three storage engines sit behind the same [`Backend`] API:
//!
//! - the *simple* engine stores each stream in its own file, and
//!   periodically writes an index snapshot to start up faster;
//! - the *blockfile* engine packs entry records and small streams in
//!   a few shared block files, and persists its eviction lists;
//! - the *memory* engine keeps everything on the heap.
//!
//! Whatever the engine, the backend keeps an in-memory index from key
//! hash to entry, tracks the total size of all entries, and evicts
//! least recently used entries to stay under its maximum size.  With
//! [`EvictionMode::TwoList`], entries that were used more than once
//! live in a separate list, and the backend trims whichever list is
//! disproportionately long.  A memory cache also sheds entries when
//! the embedder reports [`MemoryPressure`].
//!
//! Disk backends run index operations (create, open, doom,
//! enumeration, size queries) on worker threads, and return a
//! [`Pending`] result that is both a [`std::future::Future`] and
//! something synchronous callers can [`Pending::wait`] on.  Operations
//! on one key complete in submission order.  Entry I/O, on the other
//! hand, is synchronous on the calling thread.
//!
//! ```
//! use disk_cache_backend::BackendBuilder;
//! use disk_cache_backend::CacheType;
//!
//! # fn main() -> disk_cache_backend::Result<()> {
//! let backend = BackendBuilder::new()
//!     .cache_type(CacheType::Memory)
//!     .max_size(1 << 20)
//!     .build()?;
//!
//! let entry = backend.create_entry(b"https://example.com/").wait()?;
//! entry.write_data(1, 0, b"<html></html>", false)?;
//! drop(entry);
//!
//! let entry = backend.open_entry(b"https://example.com/").wait()?;
//! let mut body = vec![0u8; entry.data_size(1) as usize];
//! entry.read_data(1, 0, &mut body)?;
//! assert_eq!(body, b"<html></html>");
//! # Ok(())
//! # }
//! ```
//!
//! # Crash tolerance
//!
//! A disk cache must come back after a crash with every entry it
//! still lists being complete.  The simple engine terminates each
//! stream file with an end-of-stream record that is only written when
//! the entry closes; the blockfile engine marks entries dirty while
//! they are open, and its index records whether the last shutdown was
//! clean.  Entries that fail these checks at startup are deleted, and
//! counted in [`Stats::invalid_entries_dropped`].  When the index
//! itself is unusable, [`ResetHandling`] picks between failing,
//! starting over, and salvaging what the entry files still describe.
//!
//! Corrupt eviction lists are repaired in place.  A corrupt list met
//! while enumerating is treated as critical: the cache resets, or, if
//! entries are open, refuses new operations with [`Error::Disabled`]
//! until they all close.
mod arena;
mod backend;
mod benign_error;
mod block_file;
mod blockfile;
mod clock;
mod config;
mod core;
mod engine;
mod entry;
mod error;
mod eviction;
mod fd_limiter;
mod hash;
mod index;
mod memory;
mod queue;
mod rankings;
mod simple;
mod size;
mod sparse;
mod trigger;

#[cfg(test)]
mod backend_test;

pub use crate::backend::Backend;
pub use crate::backend::EntryIter;
pub use crate::backend::EntryResult;
pub use crate::clock::Clock;
pub use crate::clock::ManualClock;
pub use crate::clock::SystemClock;
pub use crate::config::BackendBuilder;
pub use crate::config::BackendKind;
pub use crate::config::CacheType;
pub use crate::config::ResetHandling;
pub use crate::core::Stats;
pub use crate::entry::Entry;
pub use crate::error::Error;
pub use crate::error::NetError;
pub use crate::error::Result;
pub use crate::eviction::EvictionMode;
pub use crate::eviction::MemoryPressure;
pub use crate::fd_limiter::FdStats;
pub use crate::queue::Pending;
pub use crate::size::SizePolicy;

/// Every entry has this many data streams, indexed from 0.
pub const STREAM_COUNT: usize = 3;
