//! A block file is an array of fixed-size blocks behind a header and
//! an allocation bitmap:
//!
//! ```text
//! | magic | version | block size | capacity | bitmap (8 KiB) | pad | blocks... |
//! ```
//!
//! Allocations are runs of 1 to [`MAX_RUN`] contiguous blocks, found
//! first-fit.  Bitmap bytes are written through as soon as they
//! change, but nothing records which blocks belong together: after a
//! crash, the owner rebuilds the bitmap from the runs it still
//! references ([`BlockFile::reset_bitmap`]), which frees leaked blocks.
//!
//! A full block file does not grow.  A [`BlockChain`] adds files
//! instead: `data_1` is followed by `data_1_1`, `data_1_2`, and so
//! on, and block numbers count across the whole chain.
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::index::le_u32;

const MAGIC: u32 = 0xC104_CAC3;
const VERSION: u32 = 1;

/// Blocks per file.
pub(crate) const CAPACITY: u32 = 65536;
/// Longest run of blocks in one allocation.
pub(crate) const MAX_RUN: u32 = 4;
/// Most files in one [`BlockChain`]; chain block numbers fit in 24
/// bits.
pub(crate) const MAX_CHAIN_FILES: u32 = 256;

const HEADER_SIZE: u64 = 16;
const BITMAP_BYTES: usize = (CAPACITY / 8) as usize;
const DATA_OFFSET: u64 = (HEADER_SIZE + BITMAP_BYTES as u64 + 4095) & !4095;

#[derive(Debug)]
pub(crate) struct BlockFile {
    file: File,
    block_size: u32,
    bitmap: Vec<u8>,
    allocated: u32,
    // Every block below this one is allocated.
    first_free: u32,
}

fn encode_header(block_size: u32) -> [u8; HEADER_SIZE as usize] {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&block_size.to_le_bytes());
    header[12..16].copy_from_slice(&CAPACITY.to_le_bytes());
    header
}

fn count_bits(bitmap: &[u8]) -> u32 {
    bitmap.iter().map(|byte| byte.count_ones()).sum()
}

impl BlockFile {
    /// Creates an empty block file at `path`, replacing any file there.
    pub fn create(path: &Path, block_size: u32) -> Result<BlockFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.write_all_at(&encode_header(block_size), 0)?;
        let bitmap = vec![0u8; BITMAP_BYTES];
        file.write_all_at(&bitmap, HEADER_SIZE)?;
        file.set_len(DATA_OFFSET)?;
        file.sync_all()?;

        Ok(BlockFile {
            file,
            block_size,
            bitmap,
            allocated: 0,
            first_free: 0,
        })
    }

    /// Opens an existing block file, and checks its header.  A bad
    /// header is a `Corrupt` error.
    pub fn open(path: &Path, block_size: u32) -> Result<BlockFile> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < DATA_OFFSET {
            return Err(Error::corrupt(format!("{:?} is truncated", path)));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;
        if le_u32(&header, 0) != Some(MAGIC) || le_u32(&header, 4) != Some(VERSION) {
            return Err(Error::corrupt(format!("{:?} is not a block file", path)));
        }
        if le_u32(&header, 8) != Some(block_size) || le_u32(&header, 12) != Some(CAPACITY) {
            return Err(Error::corrupt(format!("{:?} has the wrong geometry", path)));
        }

        let mut bitmap = vec![0u8; BITMAP_BYTES];
        file.read_exact_at(&mut bitmap, HEADER_SIZE)?;
        let allocated = count_bits(&bitmap);
        Ok(BlockFile {
            file,
            block_size,
            bitmap,
            allocated,
            first_free: 0,
        })
    }

    /// Number of allocated blocks.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn is_allocated(&self, block: u32) -> bool {
        block < CAPACITY && self.bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    /// Returns every allocated block, in increasing order.
    pub fn allocated_blocks(&self) -> Vec<u32> {
        (0..CAPACITY).filter(|block| self.is_allocated(*block)).collect()
    }

    /// Sets bits `[start, start + blocks)` to `value`, and writes the
    /// changed bitmap bytes.
    fn mark(&mut self, start: u32, blocks: u32, value: bool) -> Result<()> {
        for block in start..start + blocks {
            let mask = 1u8 << (block % 8);
            let byte = &mut self.bitmap[(block / 8) as usize];
            if value {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }

        let first = (start / 8) as usize;
        let last = ((start + blocks - 1) / 8) as usize;
        self.file
            .write_all_at(&self.bitmap[first..=last], HEADER_SIZE + first as u64)?;
        Ok(())
    }

    /// Allocates `blocks` contiguous blocks, and returns the first.
    pub fn allocate(&mut self, blocks: u32) -> Result<u32> {
        if blocks == 0 || blocks > MAX_RUN {
            return Err(Error::InvalidArgument("block run length out of range"));
        }

        let mut run = 0;
        let mut first_seen = None;
        let mut block = self.first_free;
        while block < CAPACITY {
            if run == 0 && block % 8 == 0 && self.bitmap[(block / 8) as usize] == 0xff {
                block += 8;
                continue;
            }

            if self.is_allocated(block) {
                run = 0;
            } else {
                first_seen.get_or_insert(block);
                run += 1;
                if run == blocks {
                    let start = block + 1 - blocks;
                    self.mark(start, blocks, true)?;
                    self.allocated += blocks;
                    self.first_free = match first_seen {
                        Some(first) if first != start => first,
                        _ => start + blocks,
                    };
                    return Ok(start);
                }
            }

            block += 1;
        }

        self.first_free = first_seen.unwrap_or(CAPACITY);
        Err(Error::InsufficientResources("block file is full"))
    }

    /// Frees a run returned by [`BlockFile::allocate`].  Freeing free
    /// blocks is a no-op.
    pub fn free(&mut self, start: u32, blocks: u32) -> Result<()> {
        if blocks == 0 || start.checked_add(blocks).map_or(true, |end| end > CAPACITY) {
            return Err(Error::InvalidArgument("block run out of range"));
        }

        let freed = (start..start + blocks)
            .filter(|block| self.is_allocated(*block))
            .count() as u32;
        self.mark(start, blocks, false)?;
        self.allocated -= freed;
        self.first_free = self.first_free.min(start);
        Ok(())
    }

    /// Replaces the bitmap with exactly the runs in `used`.  Returns
    /// how many blocks were allocated but not in `used`.
    pub fn reset_bitmap(&mut self, used: &[(u32, u32)]) -> Result<u32> {
        let mut bitmap = vec![0u8; BITMAP_BYTES];
        for (start, blocks) in used.iter() {
            for block in *start..(*start + *blocks).min(CAPACITY) {
                bitmap[(block / 8) as usize] |= 1 << (block % 8);
            }
        }

        let kept = count_bits(&bitmap);
        let leaked = self.allocated.saturating_sub(kept);
        self.file.write_all_at(&bitmap, HEADER_SIZE)?;
        self.bitmap = bitmap;
        self.allocated = kept;
        self.first_free = 0;
        Ok(leaked)
    }

    fn position(&self, start: u32, offset: u64) -> u64 {
        DATA_OFFSET + start as u64 * self.block_size as u64 + offset
    }

    /// Reads `buf.len()` bytes at `offset` into the run at `start`.
    pub fn read(&self, start: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        if !self.is_allocated(start) {
            return Err(Error::corrupt(format!("read from free block {}", start)));
        }

        self.file.read_exact_at(buf, self.position(start, offset))?;
        Ok(())
    }

    /// Writes `data` at `offset` into the run at `start`.
    pub fn write(&self, start: u32, offset: u64, data: &[u8]) -> Result<()> {
        if !self.is_allocated(start) {
            return Err(Error::corrupt(format!("write to free block {}", start)));
        }

        self.file.write_all_at(data, self.position(start, offset))?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// A growable sequence of block files with the same block size.
/// Block `n` of the chain is block `n % CAPACITY` of file
/// `n / CAPACITY`; runs never straddle two files.
#[derive(Debug)]
pub(crate) struct BlockChain {
    base: PathBuf,
    block_size: u32,
    // Never empty.
    files: Vec<BlockFile>,
}

/// Returns the path of file `number` in the chain that starts at
/// `base`.
pub(crate) fn chain_path(base: &Path, number: u32) -> PathBuf {
    if number == 0 {
        return base.to_owned();
    }

    let mut name = base.as_os_str().to_owned();
    name.push(format!("_{}", number));
    PathBuf::from(name)
}

/// Returns whether `name` is a file of the chain whose first file is
/// named `base`.
pub(crate) fn is_chain_name(name: &str, base: &str) -> bool {
    match name.strip_prefix(base) {
        Some("") => true,
        Some(suffix) => suffix
            .strip_prefix('_')
            .map_or(false, |digits| digits.parse::<u32>().map_or(false, |n| n > 0)),
        None => false,
    }
}

impl BlockChain {
    /// Creates a chain of one empty file at `base`.
    pub fn create(base: &Path, block_size: u32) -> Result<BlockChain> {
        Ok(BlockChain {
            base: base.to_owned(),
            block_size,
            files: vec![BlockFile::create(base, block_size)?],
        })
    }

    /// Opens the chain at `base`: its first file must exist, and
    /// the chain ends at the first missing file.
    pub fn open(base: &Path, block_size: u32) -> Result<BlockChain> {
        let mut files = vec![BlockFile::open(base, block_size)?];
        for number in 1..MAX_CHAIN_FILES {
            let path = chain_path(base, number);
            if !path.exists() {
                break;
            }

            files.push(BlockFile::open(&path, block_size)?);
        }

        Ok(BlockChain {
            base: base.to_owned(),
            block_size,
            files,
        })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of allocated blocks, over every file.
    pub fn allocated(&self) -> u32 {
        self.files.iter().map(BlockFile::allocated).sum()
    }

    fn file(&self, block: u32) -> Result<(&BlockFile, u32)> {
        self.files
            .get((block / CAPACITY) as usize)
            .map(|file| (file, block % CAPACITY))
            .ok_or_else(|| Error::corrupt(format!("block {} is past the last block file", block)))
    }

    pub fn is_allocated(&self, block: u32) -> bool {
        self.file(block)
            .map_or(false, |(file, block)| file.is_allocated(block))
    }

    /// Returns every allocated block in the chain, in increasing order.
    pub fn allocated_blocks(&self) -> Vec<u32> {
        let mut blocks = Vec::new();
        for (number, file) in self.files.iter().enumerate() {
            let base = number as u32 * CAPACITY;
            blocks.extend(file.allocated_blocks().into_iter().map(|block| base + block));
        }

        blocks
    }

    /// Allocates `blocks` contiguous blocks in the first file with
    /// room for them, adding a file to the chain if none has.
    pub fn allocate(&mut self, blocks: u32) -> Result<u32> {
        for (number, file) in self.files.iter_mut().enumerate() {
            match file.allocate(blocks) {
                Ok(start) => return Ok(number as u32 * CAPACITY + start),
                Err(Error::InsufficientResources(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        let number = self.files.len() as u32;
        if number >= MAX_CHAIN_FILES {
            return Err(Error::InsufficientResources("every block file is full"));
        }

        let path = chain_path(&self.base, number);
        debug!(?path, "adding a block file");
        let mut file = BlockFile::create(&path, self.block_size)?;
        let start = file.allocate(blocks)?;
        self.files.push(file);
        Ok(number * CAPACITY + start)
    }

    pub fn free(&mut self, start: u32, blocks: u32) -> Result<()> {
        let file = self
            .files
            .get_mut((start / CAPACITY) as usize)
            .ok_or(Error::InvalidArgument("block run out of range"))?;
        file.free(start % CAPACITY, blocks)
    }

    /// Replaces every file's bitmap with exactly the runs in `used`.
    /// Returns how many blocks leaked.
    pub fn reset_bitmap(&mut self, used: &[(u32, u32)]) -> Result<u32> {
        let mut leaked = 0;
        for (number, file) in self.files.iter_mut().enumerate() {
            let number = number as u32;
            let runs: Vec<(u32, u32)> = used
                .iter()
                .filter(|(start, _)| start / CAPACITY == number)
                .map(|(start, blocks)| (start % CAPACITY, *blocks))
                .collect();
            leaked += file.reset_bitmap(&runs)?;
        }

        Ok(leaked)
    }

    pub fn read(&self, start: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (file, start) = self.file(start)?;
        file.read(start, offset, buf)
    }

    pub fn write(&self, start: u32, offset: u64, data: &[u8]) -> Result<()> {
        let (file, start) = self.file(start)?;
        file.write(start, offset, data)
    }

    pub fn sync(&self) -> Result<()> {
        for file in self.files.iter() {
            file.sync()?;
        }

        Ok(())
    }
}
