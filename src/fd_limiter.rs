//! The simple backend needs a file per entry stream, which quickly
//! adds up to more descriptors than a process may hold.  The
//! [`FileTracker`] owns every open entry file and keeps at most
//! `limit` of them open: when the limit is reached (or the kernel
//! says we ran out of descriptors) it closes the least recently used
//! file, and reopens it the next time someone needs it.
//!
//! Cycling files is invisible to callers.  It only shows up in the
//! [`FdStats`] counters.
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::benign_error::is_fd_exhaustion;

/// How often the tracker had to close and reopen files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FdStats {
    /// Files closed to stay under the limit.
    pub closes: u64,
    /// Files reopened after the limiter had closed them.
    pub reopens: u64,
}

#[derive(Debug)]
pub(crate) struct FileTracker {
    limit: usize,
    // Recency clock for `open`.
    tick: u64,
    open: HashMap<PathBuf, (File, u64)>,
    // Files we closed behind their owner's back.
    closed_by_limiter: HashSet<PathBuf>,
    stats: FdStats,
}

impl FileTracker {
    pub fn new(limit: usize) -> FileTracker {
        FileTracker {
            limit: limit.max(1),
            tick: 0,
            open: HashMap::new(),
            closed_by_limiter: HashSet::new(),
            stats: FdStats::default(),
        }
    }

    pub fn stats(&self) -> FdStats {
        self.stats
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Closes the least recently used file.  Returns false if nothing
    /// is open.
    fn close_lru(&mut self) -> bool {
        let victim = self
            .open
            .iter()
            .min_by_key(|(_, (_, tick))| *tick)
            .map(|(path, _)| path.clone());

        match victim {
            Some(path) => {
                self.open.remove(&path);
                debug!(?path, "closed idle entry file");
                self.closed_by_limiter.insert(path);
                self.stats.closes += 1;
                true
            }
            None => false,
        }
    }

    fn make_room(&mut self) {
        while self.open.len() >= self.limit {
            if !self.close_lru() {
                break;
            }
        }
    }

    /// Calls `f` with the file at `path`, opening it (or creating it,
    /// if `create`) when it isn't already open.
    pub fn with_file<T>(
        &mut self,
        path: &Path,
        create: bool,
        f: impl FnOnce(&mut File) -> Result<T>,
    ) -> Result<T> {
        let tick = self.next_tick();
        if let Some((file, last)) = self.open.get_mut(path) {
            *last = tick;
            return f(file);
        }

        self.make_room();
        let file = loop {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(path)
            {
                Ok(file) => break file,
                Err(e) if is_fd_exhaustion(&e) => {
                    if !self.close_lru() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        };

        if self.closed_by_limiter.remove(path) {
            debug!(?path, "reopened entry file");
            self.stats.reopens += 1;
        }

        let (file, _) = self
            .open
            .entry(path.to_owned())
            .or_insert((file, tick));
        f(file)
    }

    /// Takes ownership of a file the caller just opened or created.
    pub fn adopt(&mut self, path: &Path, file: File) {
        if !self.open.contains_key(path) {
            self.make_room();
        }

        let tick = self.next_tick();
        self.closed_by_limiter.remove(path);
        self.open.insert(path.to_owned(), (file, tick));
    }

    /// Tracks a file that was renamed from `from` to `to`.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        if let Some(open) = self.open.remove(from) {
            self.open.insert(to.to_owned(), open);
        }

        if self.closed_by_limiter.remove(from) {
            self.closed_by_limiter.insert(to.to_owned());
        }
    }

    /// Closes the file at `path`, if open, and forgets about it.
    pub fn forget(&mut self, path: &Path) {
        self.open.remove(path);
        self.closed_by_limiter.remove(path);
    }

    /// Closes every file.
    pub fn clear(&mut self) {
        self.open.clear();
        self.closed_by_limiter.clear();
    }
}
