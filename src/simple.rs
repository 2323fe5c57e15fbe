//! The simple engine stores each entry stream in its own file,
//! `<key hash:016x>_<stream>`, directly in the cache directory:
//!
//! ```text
//! | header (24 bytes) | key | stream data | EOF record (16 bytes) |
//! ```
//!
//! The header names the key (length and CRC32C) and the stream.  The
//! EOF record repeats the data length, and is only present while the
//! stream is at rest: a write drops it, and the last close of the
//! entry writes it back.  A stream file without a valid EOF record is
//! what a crash mid-write leaves behind, and invalidates its entry.
//!
//! Streams 1 and 2 only get a file once written.  The file's `mtime`
//! doubles as the entry's last use time when the directory is
//! rescanned.
//!
//! Besides entry files, the directory holds an `index` file that
//! marks the directory format, and `index-dir/the-real-index`, a
//! snapshot of every entry's key, size and timestamps.  The snapshot
//! saves a rescan at startup, but is only trusted when it was written
//! at a clean shutdown.
use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::SystemTime;

use filetime::FileTime;
use tempfile::NamedTempFile;
use tracing::info;
use tracing::warn;

use crate::benign_error::ensure_file_removed;
use crate::benign_error::is_absent_file_error;
use crate::clock::from_micros;
use crate::config::BackendKind;
use crate::config::CacheType;
use crate::config::Config;
use crate::config::ResetHandling;
use crate::engine::EntryMeta;
use crate::engine::Loaded;
use crate::engine::LoadedEntry;
use crate::engine::Location;
use crate::engine::Snapshot;
use crate::engine::StorageEngine;
use crate::entry::EntryState;
use crate::error::Error;
use crate::error::Result;
use crate::fd_limiter::FdStats;
use crate::fd_limiter::FileTracker;
use crate::hash::key_hash;
use crate::index::le_u32;
use crate::index::le_u64;
use crate::index::read_index_file;
use crate::index::write_index_file;
use crate::index::IndexFile;
use crate::index::IndexHeader;
use crate::index::IndexRead;
use crate::STREAM_COUNT;

const HEADER_MAGIC: u64 = 0xfcfb_6d1b_a772_5c30;
const EOF_MAGIC: u64 = 0xf4fa_6f45_970d_41d8;
const FILE_VERSION: u32 = 5;
/// Version of both the `index` marker and the snapshot.
const INDEX_VERSION: u32 = 0x5_0001;

const HEADER_SIZE: u64 = 24;
const EOF_SIZE: u64 = 16;

const INDEX_FILE: &str = "index";
const SNAPSHOT_DIR: &str = "index-dir";
const SNAPSHOT_FILE: &str = "the-real-index";
const DOOMED_PREFIX: &str = "doomed_";

/// Streams may always grow to 5 MiB, however small the cache.
const MIN_STREAM_LIMIT: u64 = 5 << 20;

pub(crate) fn entry_file_name(hash: u64, stream: usize) -> String {
    format!("{:016x}_{}", hash, stream)
}

/// Parses `<hash:016x>_<stream>`.
fn parse_entry_file_name(name: &str) -> Option<(u64, usize)> {
    let (hash, stream) = name.split_once('_')?;
    if hash.len() != 16 || stream.len() != 1 {
        return None;
    }

    let hash = u64::from_str_radix(hash, 16).ok()?;
    let stream = stream.parse::<usize>().ok()?;
    if stream < STREAM_COUNT {
        Some((hash, stream))
    } else {
        None
    }
}

fn encode_header(key: &[u8], stream: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE as usize + key.len());
    buf.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
    buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(key).to_le_bytes());
    buf.extend_from_slice(&[stream as u8, 0, 0, 0]);
    buf.extend_from_slice(key);
    buf
}

fn encode_eof(data_len: u32) -> [u8; EOF_SIZE as usize] {
    let mut buf = [0u8; EOF_SIZE as usize];
    buf[..8].copy_from_slice(&EOF_MAGIC.to_le_bytes());
    buf[8..12].copy_from_slice(&data_len.to_le_bytes());
    buf
}

/// Where stream data starts for a key of `key_len` bytes.
fn data_offset(key_len: usize) -> u64 {
    HEADER_SIZE + key_len as u64
}

/// Reads until `buf` is full or the file ends.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(done)
}

/// Checks a complete stream file.  Returns its key and data length.
/// `expected` is the key the file must carry, if known.
fn check_stream_file(
    file: &File,
    stream: usize,
    expected: Option<&[u8]>,
) -> Result<(Vec<u8>, u32)> {
    let mut header = [0u8; HEADER_SIZE as usize];
    if read_full_at(file, &mut header, 0)? < header.len() {
        return Err(Error::corrupt("truncated entry file header"));
    }

    if le_u64(&header, 0) != Some(HEADER_MAGIC) {
        return Err(Error::corrupt("bad entry file magic"));
    }
    if le_u32(&header, 8) != Some(FILE_VERSION) {
        return Err(Error::corrupt("unknown entry file version"));
    }
    if header[20] as usize != stream {
        return Err(Error::corrupt("entry file holds the wrong stream"));
    }

    let key_len = le_u32(&header, 12).unwrap_or(0) as usize;
    let file_len = file.metadata()?.len();
    let data_start = data_offset(key_len);
    if file_len < data_start + EOF_SIZE {
        return Err(Error::corrupt("entry file is missing its EOF record"));
    }

    let mut key = vec![0u8; key_len];
    read_full_at(file, &mut key, HEADER_SIZE)?;
    if le_u32(&header, 16) != Some(crc32c::crc32c(&key)) {
        return Err(Error::corrupt("entry key checksum mismatch"));
    }
    if let Some(expected) = expected {
        if expected != &key[..] {
            return Err(Error::corrupt("entry file holds another key"));
        }
    }

    let mut eof = [0u8; EOF_SIZE as usize];
    read_full_at(file, &mut eof, file_len - EOF_SIZE)?;
    let data_len = file_len - data_start - EOF_SIZE;
    if le_u64(&eof, 0) != Some(EOF_MAGIC) {
        return Err(Error::corrupt("entry file is missing its EOF record"));
    }
    if le_u32(&eof, 8).map(u64::from) != Some(data_len) || data_len > u32::MAX as u64 {
        return Err(Error::corrupt("entry file length disagrees with its EOF record"));
    }

    Ok((key, data_len as u32))
}

#[derive(Clone, Debug)]
struct StreamFile {
    path: PathBuf,
    /// The file exists on disk.
    exists: bool,
    len: u32,
    /// The EOF record is in place after the data.
    at_rest: bool,
}

#[derive(Clone, Debug)]
struct SimpleEntry {
    key_len: usize,
    key_crc: u32,
    streams: [StreamFile; STREAM_COUNT],
}

#[derive(Debug)]
pub(crate) struct SimpleEngine {
    path: PathBuf,
    reset_handling: ResetHandling,
    files: FileTracker,
    next_location: u64,
    entries: HashMap<Location, SimpleEntry>,
}

/// Entry files found in the directory, by key hash.
type Listing = HashMap<u64, [bool; STREAM_COUNT]>;

impl SimpleEngine {
    pub fn new(config: &Config) -> SimpleEngine {
        SimpleEngine {
            path: config.path.clone(),
            reset_handling: config.reset_handling,
            files: FileTracker::new(config.max_open_files),
            next_location: 0,
            entries: HashMap::new(),
        }
    }

    fn allocate_location(&mut self) -> Location {
        self.next_location += 1;
        Location(self.next_location)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_DIR).join(SNAPSHOT_FILE)
    }

    fn new_entry(
        &self,
        hash: u64,
        key: &[u8],
        sizes: [u32; STREAM_COUNT],
        exists: [bool; STREAM_COUNT],
    ) -> SimpleEntry {
        let stream = |index: usize| StreamFile {
            path: self.path.join(entry_file_name(hash, index)),
            exists: exists[index],
            len: sizes[index],
            at_rest: exists[index],
        };

        SimpleEntry {
            key_len: key.len(),
            key_crc: crc32c::crc32c(key),
            streams: [stream(0), stream(1), stream(2)],
        }
    }

    fn entry_mut(&mut self, location: Location) -> Result<&mut SimpleEntry> {
        self.entries
            .get_mut(&location)
            .ok_or_else(|| Error::corrupt(format!("no simple entry at {:?}", location)))
    }

    fn write_marker(&self) -> Result<()> {
        let marker = IndexFile {
            header: IndexHeader {
                version: INDEX_VERSION,
                ..Default::default()
            },
            records: Vec::new(),
        };

        write_index_file(&self.path.join(INDEX_FILE), &marker)
    }

    /// Lists entry files, and deletes leftovers: temporary files and
    /// files of entries doomed before a crash.
    fn list_entry_files(&self) -> Result<Listing> {
        let mut listing = Listing::new();
        for dirent in std::fs::read_dir(&self.path)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };

            if let Some((hash, stream)) = parse_entry_file_name(name) {
                listing.entry(hash).or_default()[stream] = true;
            } else if name.starts_with(".tmp") || name.starts_with(DOOMED_PREFIX) {
                ensure_file_removed(&dirent.path())?;
            }
        }

        Ok(listing)
    }

    fn remove_entry_files(&self, hash: u64) -> Result<()> {
        for stream in 0..STREAM_COUNT {
            ensure_file_removed(&self.path.join(entry_file_name(hash, stream)))?;
        }

        Ok(())
    }

    /// Deletes everything in the cache directory.
    fn wipe_directory(&mut self) -> Result<()> {
        self.files.clear();
        self.entries.clear();

        for dirent in std::fs::read_dir(&self.path)? {
            let dirent = dirent?;
            let path = dirent.path();
            let result = if dirent.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };

            match result {
                Err(e) if !is_absent_file_error(&e) => return Err(e.into()),
                _ => {}
            }
        }

        Ok(())
    }

    /// Checks the `index` marker.  Returns the listing to load from,
    /// after applying the reset policy to a bad marker.
    fn check_marker(&mut self, listing: Listing) -> Result<Listing> {
        let problem = match read_index_file(&self.path.join(INDEX_FILE))? {
            IndexRead::Valid(file) if file.header.version == INDEX_VERSION => return Ok(listing),
            IndexRead::Valid(file) => format!("unknown index version {:#x}", file.header.version),
            IndexRead::Missing => "index file is missing".to_owned(),
            IndexRead::Invalid(reason) => reason,
        };

        if listing.is_empty() {
            self.write_marker()?;
            return Ok(listing);
        }

        warn!(%problem, path = ?self.path, policy = ?self.reset_handling, "bad simple cache index");
        match self.reset_handling {
            ResetHandling::NeverReset => Err(Error::Corrupt(problem)),
            ResetHandling::ResetOnError => {
                self.wipe_directory()?;
                self.write_marker()?;
                Ok(Listing::new())
            }
            ResetHandling::Recover => {
                self.write_marker()?;
                Ok(listing)
            }
        }
    }

    /// Loads entries from a clean snapshot.  Returns `None` if there is
    /// no usable snapshot.
    fn load_snapshot(&mut self, listing: &Listing) -> Result<Option<Vec<LoadedEntry>>> {
        let path = self.snapshot_path();
        let read = read_index_file(&path)?;
        // A later crash must not find a stale clean snapshot.
        ensure_file_removed(&path)?;

        let file = match read {
            IndexRead::Valid(file)
                if file.header.version == INDEX_VERSION && file.header.clean_shutdown =>
            {
                file
            }
            IndexRead::Valid(_) | IndexRead::Missing => return Ok(None),
            IndexRead::Invalid(reason) => {
                warn!(%reason, "ignoring corrupt simple cache snapshot");
                return Ok(None);
            }
        };

        let consistent = file.records.iter().all(|record| {
            record.hash == key_hash(&record.key)
                && listing.get(&record.hash).map_or(false, |streams| streams[0])
        });
        if !consistent || file.records.len() != listing.len() {
            warn!("simple cache snapshot disagrees with the directory; rescanning");
            return Ok(None);
        }

        let mut loaded = Vec::with_capacity(file.records.len());
        for record in file.records {
            let exists = listing.get(&record.hash).copied().unwrap_or_default();
            let location = self.allocate_location();
            let entry = self.new_entry(record.hash, &record.key, record.stream_sizes, exists);
            self.entries.insert(location, entry);

            loaded.push(LoadedEntry {
                hash: record.hash,
                last_used: from_micros(record.last_used),
                last_modified: from_micros(record.last_modified),
                stream_sizes: record.stream_sizes,
                location,
                links: None,
                reuse_count: 0,
                validated: false,
                key: record.key,
            });
        }

        Ok(Some(loaded))
    }

    /// Loads every valid entry in `listing` from its files, and
    /// deletes the rest.
    fn scan(&mut self, listing: &Listing) -> Result<(Vec<LoadedEntry>, u64)> {
        let mut loaded = Vec::with_capacity(listing.len());
        let mut dropped = 0;

        for (hash, exists) in listing.iter() {
            if !exists[0] {
                // Orphaned streams of an entry whose stream 0 is gone.
                self.remove_entry_files(*hash)?;
                continue;
            }

            match self.scan_entry(*hash, exists) {
                Ok(entry) => loaded.push(entry),
                Err(Error::Corrupt(reason)) => {
                    warn!(
                        %reason,
                        hash = %format!("{:016x}", hash),
                        "dropping invalid entry files"
                    );
                    dropped += 1;
                    self.remove_entry_files(*hash)?;
                }
                Err(Error::Io(e)) if is_absent_file_error(&e) => {}
                Err(e) => return Err(e),
            }
        }

        Ok((loaded, dropped))
    }

    fn scan_entry(&mut self, hash: u64, exists: &[bool; STREAM_COUNT]) -> Result<LoadedEntry> {
        let mut key = Vec::new();
        let mut sizes = [0u32; STREAM_COUNT];
        let mut last_used = SystemTime::UNIX_EPOCH;

        for stream in 0..STREAM_COUNT {
            if !exists[stream] {
                continue;
            }

            let file = File::open(self.path.join(entry_file_name(hash, stream)))?;
            let expected = if stream == 0 { None } else { Some(&key[..]) };
            let (found, len) = check_stream_file(&file, stream, expected)?;
            if stream == 0 {
                if key_hash(&found) != hash {
                    return Err(Error::corrupt("entry file name disagrees with its key"));
                }

                last_used = file.metadata()?.modified()?;
                key = found;
            }

            sizes[stream] = len;
        }

        let location = self.allocate_location();
        let entry = self.new_entry(hash, &key, sizes, *exists);
        self.entries.insert(location, entry);

        Ok(LoadedEntry {
            key,
            hash,
            last_used,
            last_modified: last_used,
            stream_sizes: sizes,
            location,
            links: None,
            reuse_count: 0,
            validated: true,
        })
    }

    /// Creates the file for `stream`, with its header and no data.
    fn create_stream_file(&mut self, location: Location, stream: usize, key: &[u8]) -> Result<()> {
        let entry = self.entry_mut(location)?;
        let path = entry.streams[stream].path.clone();
        let header = encode_header(key, stream);

        self.files.with_file(&path, true, |file| {
            file.set_len(0)?;
            file.write_all_at(&header, 0)
        })?;

        let entry = self.entry_mut(location)?;
        entry.streams[stream].exists = true;
        entry.streams[stream].len = 0;
        entry.streams[stream].at_rest = false;
        Ok(())
    }
}

impl StorageEngine for SimpleEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Simple
    }

    fn load(&mut self) -> Result<Loaded> {
        std::fs::create_dir_all(&self.path)?;

        let listing = self.list_entry_files()?;
        let listing = self.check_marker(listing)?;

        let (entries, dropped) = match self.load_snapshot(&listing)? {
            Some(entries) => (entries, 0),
            None => self.scan(&listing)?,
        };

        info!(
            path = ?self.path,
            entries = entries.len(),
            dropped,
            "loaded simple cache"
        );
        Ok(Loaded {
            entries,
            lists: None,
            dropped,
        })
    }

    fn accounted_size(&self, key_len: usize, stream_sizes: &[u32; STREAM_COUNT]) -> i64 {
        let overhead = STREAM_COUNT as i64 * (HEADER_SIZE + EOF_SIZE + key_len as u64) as i64;
        let data: i64 = stream_sizes.iter().map(|size| *size as i64).sum();
        // Round up to the 256-byte granularity files take on disk.
        (overhead + data + 255) & !255
    }

    fn max_stream_size(&self, max_size: u64) -> u64 {
        (max_size / 8).max(MIN_STREAM_LIMIT)
    }

    fn create(&mut self, key: &[u8], hash: u64, _now: SystemTime) -> Result<Location> {
        let path = self.path.join(entry_file_name(hash, 0));
        let mut tmp = NamedTempFile::new_in(&self.path)?;
        tmp.write_all(&encode_header(key, 0))?;

        let file = match tmp.persist_noclobber(&path) {
            Ok(file) => file,
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists)
            }
            Err(e) => return Err(Error::Io(e.error)),
        };

        // Stale later streams would be adopted by this entry.
        for stream in 1..STREAM_COUNT {
            ensure_file_removed(&self.path.join(entry_file_name(hash, stream)))?;
        }

        self.files.adopt(&path, file);

        let location = self.allocate_location();
        let mut entry = self.new_entry(hash, key, [0; STREAM_COUNT], [true, false, false]);
        entry.streams[0].at_rest = false;
        self.entries.insert(location, entry);
        Ok(location)
    }

    fn open(
        &mut self,
        location: Location,
        key: &[u8],
        _hash: u64,
    ) -> Result<[u32; STREAM_COUNT]> {
        let entry = self.entry_mut(location)?.clone();
        if entry.key_len != key.len() || entry.key_crc != crc32c::crc32c(key) {
            return Err(Error::corrupt("snapshot key disagrees with the entry"));
        }

        let mut sizes = [0u32; STREAM_COUNT];
        for (stream, file) in entry.streams.iter().enumerate() {
            if !file.exists {
                continue;
            }

            let (_, len) = self
                .files
                .with_file(&file.path, false, |file| {
                    Ok(check_stream_file(file, stream, Some(key)))
                })??;
            sizes[stream] = len;
        }

        let entry = self.entry_mut(location)?;
        for (file, size) in entry.streams.iter_mut().zip(sizes.iter()) {
            file.len = *size;
        }

        Ok(sizes)
    }

    fn read(
        &mut self,
        location: Location,
        stream: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let entry = self.entry_mut(location)?;
        let file = &entry.streams[stream];
        if !file.exists {
            return Ok(0);
        }

        let path = file.path.clone();
        let start = data_offset(entry.key_len) + offset;
        Ok(self
            .files
            .with_file(&path, false, |file| read_full_at(file, buf, start))?)
    }

    fn write(
        &mut self,
        location: Location,
        stream: usize,
        offset: u64,
        data: &[u8],
        new_len: u32,
    ) -> Result<()> {
        let entry = self.entry_mut(location)?;
        if !entry.streams[stream].exists {
            let key_len = entry.key_len;
            let path = entry.streams[0].path.clone();
            let mut key = vec![0u8; key_len];
            self.files.with_file(&path, false, |file| {
                read_full_at(file, &mut key, HEADER_SIZE).map(|_| ())
            })?;
            self.create_stream_file(location, stream, &key)?;
        }

        let entry = self.entry_mut(location)?;
        let start = data_offset(entry.key_len);
        let file = &mut entry.streams[stream];
        let old_end = start + file.len as u64;
        let at_rest = file.at_rest;
        let path = file.path.clone();

        self.files.with_file(&path, false, |file| {
            if at_rest {
                // Drop the EOF record first, so the gap reads as zeros.
                file.set_len(old_end)?;
            }
            file.write_all_at(data, start + offset)?;
            file.set_len(start + new_len as u64)
        })?;

        let file = &mut self.entry_mut(location)?.streams[stream];
        file.len = new_len;
        file.at_rest = false;
        Ok(())
    }

    fn set_state(&mut self, location: Location, state: EntryState) -> Result<()> {
        if state != EntryState::Doomed {
            return Ok(());
        }

        // Move the files aside, so the key can be created again while
        // handles are open.
        let dir = self.path.clone();
        let entry = self.entry_mut(location)?;
        let mut renames = Vec::new();
        for (stream, file) in entry.streams.iter_mut().enumerate() {
            let doomed = dir.join(format!("{}{:016x}_{}", DOOMED_PREFIX, location.0, stream));
            if file.exists {
                renames.push((file.path.clone(), doomed.clone()));
            }
            file.path = doomed;
        }

        for (from, to) in renames {
            std::fs::rename(&from, &to)?;
            self.files.rename(&from, &to);
        }

        Ok(())
    }

    fn close(&mut self, location: Location, meta: &EntryMeta) -> Result<()> {
        let entry = self.entry_mut(location)?;
        let start = data_offset(entry.key_len);
        let pending: Vec<(usize, PathBuf, u32)> = entry
            .streams
            .iter()
            .enumerate()
            .filter(|(_, file)| file.exists && !file.at_rest)
            .map(|(stream, file)| (stream, file.path.clone(), file.len))
            .collect();
        let first = entry.streams[0].path.clone();

        for (stream, path, len) in pending {
            let eof = encode_eof(len);
            self.files.with_file(&path, false, |file| {
                file.write_all_at(&eof, start + len as u64)?;
                file.sync_data()
            })?;

            self.entry_mut(location)?.streams[stream].at_rest = true;
        }

        filetime::set_file_mtime(&first, FileTime::from_system_time(meta.last_used))?;
        Ok(())
    }

    fn remove(&mut self, location: Location) -> Result<()> {
        let entry = match self.entries.remove(&location) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        for file in entry.streams.iter() {
            self.files.forget(&file.path);
            ensure_file_removed(&file.path)?;
        }

        Ok(())
    }

    fn remove_all(&mut self) -> Result<()> {
        self.wipe_directory()?;
        self.write_marker()
    }

    fn flush(&mut self, snapshot: &Snapshot, clean: bool) -> Result<()> {
        let path = self.snapshot_path();
        std::fs::create_dir_all(self.path.join(SNAPSHOT_DIR))?;

        let file = IndexFile {
            header: IndexHeader {
                version: INDEX_VERSION,
                clean_shutdown: clean,
                entry_count: snapshot.records.len() as u64,
                total_size: snapshot.total_size,
                ..Default::default()
            },
            records: snapshot.records.clone(),
        };

        write_index_file(&path, &file)
    }

    fn shutdown(&mut self) {
        self.files.clear();
        self.entries.clear();
    }

    fn fd_stats(&self) -> FdStats {
        self.files.stats()
    }

    fn supports_range_size(&self, cache_type: CacheType, unbounded: bool) -> bool {
        cache_type != CacheType::App || unbounded
    }
}

/// Returns the paths of every entry file in `dir`.
#[cfg(test)]
pub(crate) fn entry_files(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("cache directory should be readable")
        .filter_map(|dirent| dirent.ok())
        .filter(|dirent| {
            dirent
                .file_name()
                .to_str()
                .map_or(false, |name| parse_entry_file_name(name).is_some())
        })
        .map(|dirent| dirent.path())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::Arc;

    use test_dir::{DirBuilder, TestDir};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BackendBuilder;

    fn engine(path: &Path, reset_handling: ResetHandling) -> SimpleEngine {
        let config = Config {
            cache_type: CacheType::Disk,
            kind: BackendKind::Simple,
            path: path.to_owned(),
            max_size: 1 << 20,
            reset_handling,
            eviction: Default::default(),
            clock: Arc::new(ManualClock::default()),
            max_open_files: 4,
            worker_threads: 1,
            size_policy: Default::default(),
            index_writeback_period: 0,
        };

        SimpleEngine::new(&config)
    }

    fn meta(key: &[u8]) -> EntryMeta<'_> {
        EntryMeta {
            key,
            hash: key_hash(key),
            last_used: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000),
            last_modified: SystemTime::UNIX_EPOCH,
            stream_sizes: [0; STREAM_COUNT],
            reuse_count: 0,
        }
    }

    #[test]
    fn test_file_names() {
        assert_eq!(entry_file_name(0xabc, 2), "0000000000000abc_2");
        assert_eq!(parse_entry_file_name("0000000000000abc_2"), Some((0xabc, 2)));
        assert_eq!(parse_entry_file_name("0000000000000abc_3"), None);
        assert_eq!(parse_entry_file_name("abc_1"), None);
        assert_eq!(parse_entry_file_name("index"), None);
    }

    #[test]
    fn test_accounting_rounds_up() {
        let temp = TestDir::temp();
        let engine = engine(&temp.path("."), ResetHandling::ResetOnError);

        assert_eq!(engine.accounted_size(0, &[0, 0, 0]), 256);
        assert_eq!(engine.accounted_size(0, &[0, 136, 0]), 256);
        assert_eq!(engine.accounted_size(0, &[0, 137, 0]), 512);
        assert_eq!(engine.max_stream_size(1 << 20), 5 << 20);
        assert_eq!(engine.max_stream_size(80 << 20), 10 << 20);
    }

    #[test]
    fn test_write_close_rescan() {
        let temp = TestDir::temp();
        let key = b"http://example.com/\0nul";

        {
            let mut engine = engine(&temp.path("."), ResetHandling::ResetOnError);
            engine.load().expect("load should succeed");
            let location = engine
                .create(key, key_hash(key), SystemTime::now())
                .expect("create should succeed");
            engine
                .write(location, 1, 3, b"body", 7)
                .expect("write should succeed");
            engine.close(location, &meta(key)).expect("close should succeed");
            engine.shutdown();
        }

        let mut engine = engine(&temp.path("."), ResetHandling::ResetOnError);
        let loaded = engine.load().expect("load should succeed");
        assert_eq!(loaded.dropped, 0);
        assert_eq!(loaded.entries.len(), 1);

        let entry = &loaded.entries[0];
        assert_eq!(entry.key, key.to_vec());
        assert_eq!(entry.stream_sizes, [0, 7, 0]);
        assert_eq!(entry.last_used, meta(key).last_used);

        let mut buf = [0xffu8; 7];
        assert_eq!(
            engine.read(entry.location, 1, 0, &mut buf).expect("read"),
            7
        );
        assert_eq!(&buf, b"\0\0\0body");
    }

    #[test]
    fn test_unclosed_entry_is_dropped() {
        let temp = TestDir::temp();
        {
            let mut engine = engine(&temp.path("."), ResetHandling::ResetOnError);
            engine.load().expect("load should succeed");
            let location = engine
                .create(b"key", key_hash(b"key"), SystemTime::now())
                .expect("create should succeed");
            engine
                .write(location, 0, 0, b"headers", 7)
                .expect("write should succeed");
            // No close: the stream never gets its EOF record.
            engine.shutdown();
        }

        let mut engine = engine(&temp.path("."), ResetHandling::ResetOnError);
        let loaded = engine.load().expect("load should succeed");
        assert_eq!(loaded.entries.len(), 0);
        assert_eq!(loaded.dropped, 1);
        assert!(entry_files(&temp.path(".")).is_empty());
    }

    #[test]
    fn test_create_collides() {
        let temp = TestDir::temp();
        let mut engine = engine(&temp.path("."), ResetHandling::ResetOnError);
        engine.load().expect("load should succeed");

        engine
            .create(b"key", key_hash(b"key"), SystemTime::now())
            .expect("create should succeed");
        assert!(matches!(
            engine.create(b"key", key_hash(b"key"), SystemTime::now()),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn test_doomed_files_move_aside() {
        let temp = TestDir::temp();
        let mut engine = engine(&temp.path("."), ResetHandling::ResetOnError);
        engine.load().expect("load should succeed");

        let first = engine
            .create(b"key", key_hash(b"key"), SystemTime::now())
            .expect("create should succeed");
        engine
            .set_state(first, EntryState::Doomed)
            .expect("doom should succeed");

        // The key's file name is free again.
        let second = engine
            .create(b"key", key_hash(b"key"), SystemTime::now())
            .expect("create should succeed");
        engine
            .write(first, 1, 0, b"old", 3)
            .expect("doomed entries stay writable");

        engine.remove(first).expect("remove should succeed");
        assert_eq!(entry_files(&temp.path(".")).len(), 1);
        engine.remove(second).expect("remove should succeed");
        assert!(entry_files(&temp.path(".")).is_empty());
    }

    #[test]
    fn test_bad_marker_policies() {
        for policy in [
            ResetHandling::NeverReset,
            ResetHandling::ResetOnError,
            ResetHandling::Recover,
        ]
        .iter()
        {
            let temp = TestDir::temp();
            {
                let backend = BackendBuilder::new()
                    .kind(BackendKind::Simple)
                    .path(temp.path("."))
                    .max_size(1 << 20)
                    .build()
                    .expect("build should succeed");
                drop(
                    backend
                        .create_entry(b"key")
                        .wait()
                        .expect("create should succeed"),
                );
            }

            std::fs::write(temp.path(INDEX_FILE), b"garbage").expect("write should succeed");
            let mut engine = engine(&temp.path("."), *policy);
            match (policy, engine.load()) {
                (ResetHandling::NeverReset, Err(Error::Corrupt(_))) => {}
                (ResetHandling::ResetOnError, Ok(loaded)) => assert!(loaded.entries.is_empty()),
                (ResetHandling::Recover, Ok(loaded)) => assert_eq!(loaded.entries.len(), 1),
                (policy, result) => panic!(
                    "{:?}: unexpected {:?}",
                    policy,
                    result.map(|loaded| loaded.entries.len())
                ),
            }
        }
    }

    #[test]
    fn test_bad_marker_without_entries_is_rewritten() {
        let temp = TestDir::temp();
        std::fs::write(temp.path(INDEX_FILE), b"").expect("write should succeed");

        let mut engine = engine(&temp.path("."), ResetHandling::NeverReset);
        engine.load().expect("load should succeed");
        assert!(matches!(
            read_index_file(&temp.path(INDEX_FILE)).expect("read should succeed"),
            IndexRead::Valid(_)
        ));
    }
}
