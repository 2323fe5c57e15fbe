//! The blockfile engine packs entries into a handful of shared files:
//!
//! - `data_0`: one 256-byte record per entry (key, sizes, stream
//!   addresses, timestamps, state and rankings links);
//! - `data_1`: streams and long keys up to 4 KiB, in 1 KiB blocks;
//! - `data_2`: streams and long keys up to 16 KiB, in 4 KiB blocks;
//! - `data_0_1`, `data_1_1`, ...: more blocks, once the files before
//!   them in the chain are full;
//! - `f_NNNNNN`: one external file per larger stream or key;
//! - `index`: the rankings list ends, and whether the cache shut down
//!   cleanly.
//!
//! Every piece of storage is named by a 32-bit [`Addr`], which is also
//! the entry's [`Location`] for records.  Records carry a CRC32C, so a
//! torn record write is detected at the next load.
//!
//! The index is marked dirty as soon as the cache is loaded.  After a
//! crash, entries whose record still says `Dirty` were open for
//! modification, and are dropped; persisted links are ignored, and the
//! lists rebuilt from timestamps.  Blocks no record references are
//! reclaimed at load time.  External files are only ever created under
//! fresh names, and only deleted through a record that references
//! them: the cache directory may hold `f_` files the cache does not
//! own.
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::benign_error::ensure_file_removed;
use crate::benign_error::is_absent_file_error;
use crate::block_file::is_chain_name;
use crate::block_file::BlockChain;
use crate::block_file::MAX_RUN;
use crate::clock::from_micros;
use crate::clock::to_micros;
use crate::config::BackendKind;
use crate::config::CacheType;
use crate::config::Config;
use crate::config::ResetHandling;
use crate::engine::EntryMeta;
use crate::engine::Loaded;
use crate::engine::LoadedEntry;
use crate::engine::Location;
use crate::engine::PersistedLinks;
use crate::engine::Snapshot;
use crate::engine::StorageEngine;
use crate::entry::EntryState;
use crate::error::Error;
use crate::error::Result;
use crate::hash::key_hash;
use crate::index::le_i64;
use crate::index::le_u32;
use crate::index::le_u64;
use crate::index::read_index_file;
use crate::index::write_index_file;
use crate::index::IndexFile;
use crate::index::IndexHeader;
use crate::index::IndexRead;
use crate::rankings::List;
use crate::rankings::LIST_COUNT;
use crate::STREAM_COUNT;

const INDEX_VERSION: u32 = 0x2_0001;
const INDEX_FILE: &str = "index";

const RECORD_SIZE: usize = 256;
const INLINE_KEY_OFFSET: usize = 76;
const INLINE_KEY_MAX: usize = RECORD_SIZE - INLINE_KEY_OFFSET;
const CRC_OFFSET: usize = 72;

/// Which file an [`Addr`] points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum FileKind {
    External = 0,
    Records = 1,
    Small = 2,
    Large = 3,
}

impl FileKind {
    const BLOCK_FILES: [FileKind; 3] = [FileKind::Records, FileKind::Small, FileKind::Large];

    fn file_name(self) -> &'static str {
        match self {
            FileKind::External => "f_",
            FileKind::Records => "data_0",
            FileKind::Small => "data_1",
            FileKind::Large => "data_2",
        }
    }

    fn block_size(self) -> u32 {
        match self {
            FileKind::External => 0,
            FileKind::Records => RECORD_SIZE as u32,
            FileKind::Small => 1024,
            FileKind::Large => 4096,
        }
    }
}

/// Returns where `len` bytes go: a run of blocks, or an external file
/// (`None`).
fn placement(len: u64) -> Option<(FileKind, u32)> {
    let fits = |kind: FileKind| {
        let block = kind.block_size() as u64;
        let blocks = ((len + block - 1) / block).max(1);
        if blocks <= MAX_RUN as u64 {
            Some((kind, blocks as u32))
        } else {
            None
        }
    };

    fits(FileKind::Small).or_else(|| fits(FileKind::Large))
}

/// A 32-bit storage address.
///
/// ```text
/// bit 31     initialized
/// bits 28-30 file kind
/// bits 24-25 blocks - 1      (block files)
/// bits 0-23  first block     (block files)
/// bits 0-27  file number     (external files)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Addr(u32);

impl Addr {
    const NONE: Addr = Addr(0);
    const INITIALIZED: u32 = 1 << 31;
    /// External file names have six hex digits.
    const MAX_EXTERNAL: u32 = 0x00ff_ffff;

    fn blocks_in(kind: FileKind, start: u32, blocks: u32) -> Addr {
        Addr(Addr::INITIALIZED | (kind as u32) << 28 | (blocks - 1) << 24 | start)
    }

    fn external(number: u32) -> Addr {
        Addr(Addr::INITIALIZED | (number & 0x0fff_ffff))
    }

    fn is_set(self) -> bool {
        self.0 & Addr::INITIALIZED != 0
    }

    fn kind(self) -> Option<FileKind> {
        if !self.is_set() {
            return None;
        }

        match (self.0 >> 28) & 7 {
            0 => Some(FileKind::External),
            1 => Some(FileKind::Records),
            2 => Some(FileKind::Small),
            3 => Some(FileKind::Large),
            _ => None,
        }
    }

    fn start(self) -> u32 {
        self.0 & 0x00ff_ffff
    }

    fn blocks(self) -> u32 {
        ((self.0 >> 24) & 3) + 1
    }

    fn number(self) -> u32 {
        self.0 & 0x0fff_ffff
    }

    fn location(self) -> Location {
        Location(self.0 as u64)
    }

    fn of(location: Option<Location>) -> Addr {
        location.map_or(Addr::NONE, |location| Addr(location.0 as u32))
    }

    fn record(location: Location) -> Result<Addr> {
        let addr = Addr(location.0 as u32);
        if location.0 <= u32::MAX as u64 && addr.kind() == Some(FileKind::Records) {
            Ok(addr)
        } else {
            Err(Error::corrupt(format!("{:?} is not an entry record", location)))
        }
    }

    fn to_location(self) -> Option<Location> {
        if self.is_set() {
            Some(self.location())
        } else {
            None
        }
    }
}

/// The fixed-size part of an entry, as stored in `data_0`.
///
/// ```text
///   0 hash            u64
///   8 prev, next      u32 x 2   rankings links
///  16 list, state     u8 x 2
///  18 flags           u16
///  20 reuse count     u32
///  24 last used       i64 (microseconds)
///  32 last modified   i64
///  40 key length      u32
///  44 long key        u32
///  48 stream sizes    u32 x 3
///  60 stream addrs    u32 x 3
///  72 crc32c          u32       over everything but itself
///  76 inline key      up to 180 bytes
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
struct Record {
    hash: u64,
    prev: Addr,
    next: Addr,
    list: u8,
    state: EntryState,
    reuse_count: u32,
    last_used: i64,
    last_modified: i64,
    key_len: u32,
    long_key: Addr,
    sizes: [u32; STREAM_COUNT],
    addrs: [Addr; STREAM_COUNT],
    /// Empty for long keys.
    inline_key: Vec<u8>,
}

fn record_crc(buf: &[u8; RECORD_SIZE]) -> u32 {
    let crc = crc32c::crc32c(&buf[..CRC_OFFSET]);
    crc32c::crc32c_append(crc, &buf[CRC_OFFSET + 4..])
}

impl Record {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.hash.to_le_bytes());
        buf[8..12].copy_from_slice(&self.prev.0.to_le_bytes());
        buf[12..16].copy_from_slice(&self.next.0.to_le_bytes());
        buf[16] = self.list;
        buf[17] = self.state.to_u8();
        buf[20..24].copy_from_slice(&self.reuse_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_used.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_modified.to_le_bytes());
        buf[40..44].copy_from_slice(&self.key_len.to_le_bytes());
        buf[44..48].copy_from_slice(&self.long_key.0.to_le_bytes());
        for stream in 0..STREAM_COUNT {
            let size_at = 48 + 4 * stream;
            let addr_at = 60 + 4 * stream;
            buf[size_at..size_at + 4].copy_from_slice(&self.sizes[stream].to_le_bytes());
            buf[addr_at..addr_at + 4].copy_from_slice(&self.addrs[stream].0.to_le_bytes());
        }
        buf[INLINE_KEY_OFFSET..INLINE_KEY_OFFSET + self.inline_key.len()]
            .copy_from_slice(&self.inline_key);

        let crc = record_crc(&buf);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; RECORD_SIZE]) -> Result<Record> {
        let u32_at = |offset| le_u32(buf, offset).unwrap_or_default();

        if u32_at(CRC_OFFSET) != record_crc(buf) {
            return Err(Error::corrupt("entry record checksum mismatch"));
        }

        let state = EntryState::from_u8(buf[17])
            .ok_or_else(|| Error::corrupt(format!("bad entry state {}", buf[17])))?;
        let key_len = u32_at(40);
        let inline_key = if key_len as usize <= INLINE_KEY_MAX {
            buf[INLINE_KEY_OFFSET..INLINE_KEY_OFFSET + key_len as usize].to_vec()
        } else {
            Vec::new()
        };

        let mut sizes = [0u32; STREAM_COUNT];
        let mut addrs = [Addr::NONE; STREAM_COUNT];
        for stream in 0..STREAM_COUNT {
            sizes[stream] = u32_at(48 + 4 * stream);
            addrs[stream] = Addr(u32_at(60 + 4 * stream));
        }

        Ok(Record {
            hash: le_u64(buf, 0).unwrap_or_default(),
            prev: Addr(u32_at(8)),
            next: Addr(u32_at(12)),
            list: buf[16],
            state,
            reuse_count: u32_at(20),
            last_used: le_i64(buf, 24).unwrap_or_default(),
            last_modified: le_i64(buf, 32).unwrap_or_default(),
            key_len,
            long_key: Addr(u32_at(44)),
            sizes,
            addrs,
            inline_key,
        })
    }

    /// Every blob address the record holds, set or not.
    fn blobs(&self) -> impl Iterator<Item = Addr> + '_ {
        self.addrs
            .iter()
            .copied()
            .chain(std::iter::once(self.long_key))
    }
}

#[derive(Debug)]
struct BlockFiles {
    records: BlockChain,
    small: BlockChain,
    large: BlockChain,
}

#[derive(Debug)]
pub(crate) struct BlockfileEngine {
    path: PathBuf,
    reset_handling: ResetHandling,
    /// `None` until loaded, and after shutdown.
    files: Option<BlockFiles>,
    records: HashMap<Addr, Record>,
    next_external: u32,
}

impl BlockfileEngine {
    pub fn new(config: &Config) -> BlockfileEngine {
        BlockfileEngine {
            path: config.path.clone(),
            reset_handling: config.reset_handling,
            files: None,
            records: HashMap::new(),
            next_external: 1,
        }
    }

    fn external_path(&self, number: u32) -> PathBuf {
        self.path
            .join(format!("{}{:06x}", FileKind::External.file_name(), number))
    }

    fn block_file(&self, kind: FileKind) -> Result<&BlockChain> {
        let files = self.files.as_ref().ok_or(Error::BackendGone)?;
        match kind {
            FileKind::Records => Ok(&files.records),
            FileKind::Small => Ok(&files.small),
            FileKind::Large => Ok(&files.large),
            FileKind::External => Err(Error::InvalidArgument("external files have no blocks")),
        }
    }

    fn block_file_mut(&mut self, kind: FileKind) -> Result<&mut BlockChain> {
        let files = self.files.as_mut().ok_or(Error::BackendGone)?;
        match kind {
            FileKind::Records => Ok(&mut files.records),
            FileKind::Small => Ok(&mut files.small),
            FileKind::Large => Ok(&mut files.large),
            FileKind::External => Err(Error::InvalidArgument("external files have no blocks")),
        }
    }

    fn open_files(&self) -> Result<BlockFiles> {
        let open = |kind: FileKind| {
            BlockChain::open(&self.path.join(kind.file_name()), kind.block_size())
        };
        Ok(BlockFiles {
            records: open(FileKind::Records)?,
            small: open(FileKind::Small)?,
            large: open(FileKind::Large)?,
        })
    }

    fn write_header(&self, clean: bool, snapshot: &Snapshot) -> Result<()> {
        let mut header = IndexHeader {
            version: INDEX_VERSION,
            clean_shutdown: clean,
            entry_count: snapshot.records.len() as u64,
            total_size: snapshot.total_size,
            ..Default::default()
        };
        for list in 0..LIST_COUNT {
            header.heads[list] = Addr::of(snapshot.heads[list]).0;
            header.tails[list] = Addr::of(snapshot.tails[list]).0;
        }

        write_index_file(
            &self.path.join(INDEX_FILE),
            &IndexFile {
                header,
                records: Vec::new(),
            },
        )
    }

    /// Deletes every cache file and starts over with empty ones.
    /// External files go only if a known record references them.
    fn start_fresh(&mut self) -> Result<()> {
        let external: Vec<u32> = self
            .records
            .values()
            .flat_map(|record| record.blobs())
            .filter(|blob| blob.kind() == Some(FileKind::External))
            .map(Addr::number)
            .collect();
        self.files = None;
        self.records.clear();

        for number in external {
            ensure_file_removed(&self.external_path(number))?;
        }

        for dirent in std::fs::read_dir(&self.path)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let ours = name.to_str().map_or(false, |name| {
                name == INDEX_FILE
                    || FileKind::BLOCK_FILES
                        .iter()
                        .any(|kind| is_chain_name(name, kind.file_name()))
            });

            if ours {
                ensure_file_removed(&dirent.path())?;
            }
        }

        let create = |kind: FileKind| {
            BlockChain::create(&self.path.join(kind.file_name()), kind.block_size())
        };
        let files = BlockFiles {
            records: create(FileKind::Records)?,
            small: create(FileKind::Small)?,
            large: create(FileKind::Large)?,
        };
        self.files = Some(files);
        self.next_external = 1;
        self.write_header(false, &Snapshot::default())
    }

    /// Applies the reset policy to unusable persistent state.  Returns
    /// true if loading should go on with a recovery scan.
    fn handle_bad_state(&mut self, problem: String) -> Result<bool> {
        warn!(
            %problem,
            path = ?self.path,
            policy = ?self.reset_handling,
            "bad blockfile cache state"
        );
        match self.reset_handling {
            ResetHandling::NeverReset => Err(Error::Corrupt(problem)),
            ResetHandling::ResetOnError => {
                self.start_fresh()?;
                Ok(false)
            }
            ResetHandling::Recover => Ok(true),
        }
    }

    fn record(&self, addr: Addr) -> Result<&Record> {
        self.records
            .get(&addr)
            .ok_or_else(|| Error::corrupt(format!("no entry record at {:?}", addr)))
    }

    fn write_record(&mut self, addr: Addr, record: Record) -> Result<()> {
        self.block_file(FileKind::Records)?
            .write(addr.start(), 0, &record.encode())?;
        self.records.insert(addr, record);
        Ok(())
    }

    fn read_record(&self, addr: Addr) -> Result<Record> {
        let mut buf = [0u8; RECORD_SIZE];
        self.block_file(FileKind::Records)?
            .read(addr.start(), 0, &mut buf)?;
        Record::decode(&buf)
    }

    /// Reads `buf.len()` bytes at `offset` in the blob at `addr`.
    fn read_blob(&self, addr: Addr, offset: u64, buf: &mut [u8]) -> Result<()> {
        match addr.kind() {
            Some(FileKind::External) => {
                let file = std::fs::File::open(self.external_path(addr.number()))?;
                file.read_exact_at(buf, offset)?;
                Ok(())
            }
            Some(kind) => self.block_file(kind)?.read(addr.start(), offset, buf),
            None => Err(Error::corrupt(format!("read from bad address {:?}", addr))),
        }
    }

    /// Writes `data` to a new external file.  Names that already exist
    /// are skipped, whoever owns them.
    fn create_external(&mut self, data: &[u8]) -> Result<Addr> {
        loop {
            let number = self.next_external;
            if number > Addr::MAX_EXTERNAL {
                return Err(Error::InsufficientResources("out of external file names"));
            }
            self.next_external += 1;

            let path = self.external_path(number);
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(number, "skipping existing external file name");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = file.write_all_at(data, 0) {
                ensure_file_removed(&path)?;
                return Err(e.into());
            }

            return Ok(Addr::external(number));
        }
    }

    /// Stores `data` in fresh storage.
    fn store(&mut self, data: &[u8]) -> Result<Addr> {
        if data.is_empty() {
            return Ok(Addr::NONE);
        }

        match placement(data.len() as u64) {
            Some((kind, blocks)) => {
                let file = self.block_file_mut(kind)?;
                let start = file.allocate(blocks)?;
                if let Err(e) = file.write(start, 0, data) {
                    file.free(start, blocks)?;
                    return Err(e);
                }

                Ok(Addr::blocks_in(kind, start, blocks))
            }
            None => self.create_external(data),
        }
    }

    /// Frees the storage at `addr`.
    fn release(&mut self, addr: Addr) -> Result<()> {
        match addr.kind() {
            None => Ok(()),
            Some(FileKind::External) => {
                ensure_file_removed(&self.external_path(addr.number()))?;
                Ok(())
            }
            Some(kind) => self.block_file_mut(kind)?.free(addr.start(), addr.blocks()),
        }
    }

    fn read_key(&self, record: &Record) -> Result<Vec<u8>> {
        if record.key_len as usize <= INLINE_KEY_MAX {
            return Ok(record.inline_key.clone());
        }

        let mut key = vec![0u8; record.key_len as usize];
        self.read_blob(record.long_key, 0, &mut key)?;
        Ok(key)
    }

    /// Checks that the storage for `len` bytes at `addr` is where it
    /// should be.
    fn check_blob(&self, addr: Addr, len: u64) -> Result<()> {
        if len == 0 {
            return if addr.is_set() {
                Err(Error::corrupt("empty stream has storage"))
            } else {
                Ok(())
            };
        }

        match (placement(len), addr.kind()) {
            (Some((kind, blocks)), Some(found)) if kind == found && blocks == addr.blocks() => {
                if self.block_file(kind)?.is_allocated(addr.start()) {
                    Ok(())
                } else {
                    Err(Error::corrupt("stream points at free blocks"))
                }
            }
            (None, Some(FileKind::External)) => {
                let found = std::fs::metadata(self.external_path(addr.number()))?.len();
                if found >= len {
                    Ok(())
                } else {
                    Err(Error::corrupt("external file is truncated"))
                }
            }
            _ => Err(Error::corrupt(format!("bad address {:?} for {} bytes", addr, len))),
        }
    }

    /// Reads and checks the record at `addr`.  Returns `None` for
    /// doomed records, which should simply go away.
    fn load_record(&self, addr: Addr, clean: bool) -> Result<Option<(LoadedEntry, Record)>> {
        let mut record = self.read_record(addr)?;
        match record.state {
            EntryState::Doomed => return Ok(None),
            EntryState::Dirty if !clean => {
                return Err(Error::corrupt("entry was open for writing during a crash"))
            }
            EntryState::Dirty | EntryState::Normal => {}
        }

        let key = self.read_key(&record)?;
        if key_hash(&key) != record.hash {
            return Err(Error::corrupt("entry key does not match its hash"));
        }
        if record.long_key.is_set() {
            self.check_blob(record.long_key, key.len() as u64)?;
        }
        for stream in 0..STREAM_COUNT {
            self.check_blob(record.addrs[stream], record.sizes[stream] as u64)?;
        }

        let links = if clean {
            List::from_u8(record.list).map(|list| PersistedLinks {
                prev: record.prev.to_location(),
                next: record.next.to_location(),
                list,
            })
        } else {
            None
        };

        record.state = EntryState::Normal;
        let entry = LoadedEntry {
            key,
            hash: record.hash,
            last_used: from_micros(record.last_used),
            last_modified: from_micros(record.last_modified),
            stream_sizes: record.sizes,
            location: addr.location(),
            links,
            reuse_count: record.reuse_count,
            validated: true,
        };
        Ok(Some((entry, record)))
    }

    /// Loads every record in `data_0`, drops the bad ones, and frees
    /// storage nothing references anymore.
    fn scan(&mut self, clean: bool) -> Result<Loaded> {
        let mut loaded = Loaded::default();
        let mut small = Vec::new();
        let mut large = Vec::new();
        let mut external = HashSet::new();

        let starts = self.block_file(FileKind::Records)?.allocated_blocks();
        for start in starts {
            let addr = Addr::blocks_in(FileKind::Records, start, 1);
            let result = match self.load_record(addr, clean) {
                Err(Error::Io(e)) if is_absent_file_error(&e) => {
                    Err(Error::corrupt("entry storage is missing"))
                }
                result => result,
            };

            match result {
                Ok(Some((entry, record))) => {
                    for blob in record.blobs() {
                        match blob.kind() {
                            Some(FileKind::Small) => small.push((blob.start(), blob.blocks())),
                            Some(FileKind::Large) => large.push((blob.start(), blob.blocks())),
                            Some(FileKind::External) => {
                                external.insert(blob.number());
                            }
                            Some(FileKind::Records) | None => {}
                        }
                    }

                    loaded.entries.push(entry);
                    self.records.insert(addr, record);
                }
                Ok(None) => self.block_file_mut(FileKind::Records)?.free(start, 1)?,
                Err(Error::Corrupt(reason)) => {
                    warn!(%reason, record = start, "dropping invalid entry record");
                    loaded.dropped += 1;
                    self.block_file_mut(FileKind::Records)?.free(start, 1)?;
                }
                Err(e) => return Err(e),
            }
        }

        let leaked = self.block_file_mut(FileKind::Small)?.reset_bitmap(&small)?
            + self.block_file_mut(FileKind::Large)?.reset_bitmap(&large)?;
        if leaked > 0 {
            debug!(leaked, "freed unreferenced blocks");
        }

        self.next_external = external.iter().copied().max().unwrap_or(0) + 1;

        Ok(loaded)
    }
}

impl StorageEngine for BlockfileEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Blockfile
    }

    fn load(&mut self) -> Result<Loaded> {
        std::fs::create_dir_all(&self.path)?;

        let data_exists = self.path.join(FileKind::Records.file_name()).exists();
        let header = match read_index_file(&self.path.join(INDEX_FILE))? {
            IndexRead::Valid(file) if file.header.version == INDEX_VERSION => Some(file.header),
            IndexRead::Missing if !data_exists => {
                self.start_fresh()?;
                return Ok(Loaded::default());
            }
            IndexRead::Valid(file) => {
                let problem = format!("unknown index version {:#x}", file.header.version);
                if !self.handle_bad_state(problem)? {
                    return Ok(Loaded::default());
                }
                None
            }
            IndexRead::Missing => {
                if !self.handle_bad_state("index file is missing".to_owned())? {
                    return Ok(Loaded::default());
                }
                None
            }
            IndexRead::Invalid(reason) => {
                if !self.handle_bad_state(reason)? {
                    return Ok(Loaded::default());
                }
                None
            }
        };

        match self.open_files() {
            Ok(files) => self.files = Some(files),
            Err(Error::Corrupt(problem)) => {
                // Nothing to recover from without the block files.
                if self.reset_handling == ResetHandling::NeverReset {
                    return Err(Error::Corrupt(problem));
                }
                warn!(%problem, "bad block file; starting over");
                self.start_fresh()?;
                return Ok(Loaded::default());
            }
            Err(Error::Io(e)) if is_absent_file_error(&e) => {
                if self.reset_handling == ResetHandling::NeverReset {
                    return Err(Error::corrupt("a block file is missing"));
                }
                warn!("missing block file; starting over");
                self.start_fresh()?;
                return Ok(Loaded::default());
            }
            Err(e) => return Err(e),
        }

        let clean = header.map_or(false, |header| header.clean_shutdown);
        let mut loaded = self.scan(clean)?;
        if let (true, Some(header)) = (clean, header) {
            let mut lists = [(None, None); LIST_COUNT];
            for (list, ends) in lists.iter_mut().enumerate() {
                *ends = (
                    Addr(header.heads[list]).to_location(),
                    Addr(header.tails[list]).to_location(),
                );
            }
            loaded.lists = Some(lists);
        }

        // Until the next clean shutdown, the files are in flux.
        self.write_header(false, &Snapshot::default())?;
        info!(
            path = ?self.path,
            entries = loaded.entries.len(),
            dropped = loaded.dropped,
            clean,
            "loaded blockfile cache"
        );
        Ok(loaded)
    }

    fn accounted_size(&self, key_len: usize, stream_sizes: &[u32; STREAM_COUNT]) -> i64 {
        key_len as i64 + stream_sizes.iter().map(|size| *size as i64).sum::<i64>()
    }

    fn create(&mut self, key: &[u8], hash: u64, now: SystemTime) -> Result<Location> {
        let start = self.block_file_mut(FileKind::Records)?.allocate(1)?;
        let addr = Addr::blocks_in(FileKind::Records, start, 1);

        let (long_key, inline_key) = if key.len() > INLINE_KEY_MAX {
            match self.store(key) {
                Ok(long_key) => (long_key, Vec::new()),
                Err(e) => {
                    self.block_file_mut(FileKind::Records)?.free(start, 1)?;
                    return Err(e);
                }
            }
        } else {
            (Addr::NONE, key.to_vec())
        };

        let now = to_micros(now);
        let record = Record {
            hash,
            prev: Addr::NONE,
            next: Addr::NONE,
            list: List::NoUse as u8,
            state: EntryState::Dirty,
            reuse_count: 0,
            last_used: now,
            last_modified: now,
            key_len: key.len() as u32,
            long_key,
            sizes: [0; STREAM_COUNT],
            addrs: [Addr::NONE; STREAM_COUNT],
            inline_key,
        };

        self.write_record(addr, record)?;
        Ok(addr.location())
    }

    fn open(&mut self, location: Location, key: &[u8], hash: u64) -> Result<[u32; STREAM_COUNT]> {
        let addr = Addr::record(location)?;
        let record = self.read_record(addr)?;
        if record.hash != hash || self.read_key(&record)? != key {
            return Err(Error::corrupt("entry record holds another key"));
        }

        let sizes = record.sizes;
        self.records.insert(addr, record);
        Ok(sizes)
    }

    fn read(
        &mut self,
        location: Location,
        stream: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let record = self.record(Addr::record(location)?)?;
        let available = (record.sizes[stream] as u64).saturating_sub(offset);
        let len = (buf.len() as u64).min(available) as usize;
        if len == 0 {
            return Ok(0);
        }

        self.read_blob(record.addrs[stream], offset, &mut buf[..len])?;
        Ok(len)
    }

    fn write(
        &mut self,
        location: Location,
        stream: usize,
        offset: u64,
        data: &[u8],
        new_len: u32,
    ) -> Result<()> {
        let addr = Addr::record(location)?;
        let mut record = self.record(addr)?.clone();
        let old_addr = record.addrs[stream];
        let old_len = record.sizes[stream] as u64;
        let new_len64 = new_len as u64;

        record.addrs[stream] = if placement(new_len64).is_none() {
            // Large streams live in their own file, and are written in
            // place.
            let (external, migrate) = match old_addr.kind() {
                Some(FileKind::External) => (old_addr, false),
                _ => {
                    let mut old = vec![0u8; old_len as usize];
                    if !old.is_empty() {
                        self.read_blob(old_addr, 0, &mut old)?;
                    }
                    (self.create_external(&old)?, true)
                }
            };

            let file = OpenOptions::new()
                .write(true)
                .open(self.external_path(external.number()))?;
            file.write_all_at(data, offset)?;
            file.set_len(new_len64)?;
            if migrate {
                self.release(old_addr)?;
            }
            external
        } else {
            let mut contents = vec![0u8; old_len.min(new_len64) as usize];
            if !contents.is_empty() {
                self.read_blob(old_addr, 0, &mut contents)?;
            }
            contents.resize(new_len as usize, 0);
            contents[offset as usize..offset as usize + data.len()].copy_from_slice(data);

            match (placement(new_len64), old_addr.kind()) {
                (Some((kind, blocks)), Some(found))
                    if new_len > 0 && kind == found && blocks == old_addr.blocks() =>
                {
                    self.block_file(kind)?.write(old_addr.start(), 0, &contents)?;
                    old_addr
                }
                _ => {
                    let fresh = self.store(&contents)?;
                    self.release(old_addr)?;
                    fresh
                }
            }
        };

        record.sizes[stream] = new_len;
        self.write_record(addr, record)
    }

    fn set_state(&mut self, location: Location, state: EntryState) -> Result<()> {
        let addr = Addr::record(location)?;
        let mut record = self.record(addr)?.clone();
        record.state = state;
        self.write_record(addr, record)
    }

    fn close(&mut self, location: Location, meta: &EntryMeta) -> Result<()> {
        let addr = Addr::record(location)?;
        let mut record = self.record(addr)?.clone();
        record.state = EntryState::Normal;
        record.last_used = to_micros(meta.last_used);
        record.last_modified = to_micros(meta.last_modified);
        record.reuse_count = meta.reuse_count;
        self.write_record(addr, record)
    }

    fn persists_links(&self) -> bool {
        true
    }

    fn update_links(&mut self, location: Location, links: PersistedLinks) -> Result<()> {
        let addr = Addr::record(location)?;
        let mut record = self.record(addr)?.clone();
        record.prev = Addr::of(links.prev);
        record.next = Addr::of(links.next);
        record.list = links.list as u8;
        self.write_record(addr, record)
    }

    fn remove(&mut self, location: Location) -> Result<()> {
        let addr = Addr::record(location)?;
        let record = match self.records.remove(&addr) {
            Some(record) => record,
            None => return Ok(()),
        };

        for blob in record.blobs() {
            self.release(blob)?;
        }
        self.release(addr)
    }

    fn remove_all(&mut self) -> Result<()> {
        self.start_fresh()
    }

    fn flush(&mut self, snapshot: &Snapshot, clean: bool) -> Result<()> {
        if let Some(files) = &self.files {
            files.records.sync()?;
            files.small.sync()?;
            files.large.sync()?;
        }

        self.write_header(clean, snapshot)
    }

    fn shutdown(&mut self) {
        self.files = None;
        self.records.clear();
    }

    fn supports_range_size(&self, _cache_type: CacheType, _unbounded: bool) -> bool {
        false
    }
}
