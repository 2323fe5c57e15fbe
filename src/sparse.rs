//! Sparse data gives an entry a 64-bit address space that can be
//! filled in arbitrary pieces, as for resumable downloads.
//!
//! The address space is cut into 1 MiB children.  Each child is an
//! ordinary entry keyed `Range_<parent key>:<child index in hex>`:
//! its stream 1 holds the bytes, and its stream 0 a 128-byte bitmap
//! with one bit per 1 KiB block.  A block becomes available only once
//! a single write covered all of it, so reads never return bytes
//! nobody wrote.
//!
//! Callers may not open, create, or doom keys shaped like a child's:
//! they would collide with some entry's sparse data.
use crate::arena::EntryId;
use crate::core::Core;
use crate::error::Error;
use crate::error::Result;

const CHILD_SIZE: u64 = 1 << 20;
const BLOCK_SIZE: u64 = 1024;
const BLOCKS_PER_CHILD: u64 = CHILD_SIZE / BLOCK_SIZE;
const BITMAP_BYTES: usize = (BLOCKS_PER_CHILD / 8) as usize;

const CHILD_PREFIX: &[u8] = b"Range_";

type Bitmap = [u8; BITMAP_BYTES];

pub(crate) fn child_key(parent: &[u8], child: u64) -> Vec<u8> {
    let index = format!("{:x}", child);
    let mut key = Vec::with_capacity(CHILD_PREFIX.len() + parent.len() + 1 + index.len());
    key.extend_from_slice(CHILD_PREFIX);
    key.extend_from_slice(parent);
    key.push(b':');
    key.extend_from_slice(index.as_bytes());
    key
}

/// Returns the parent's key if `key` names a sparse child.
pub(crate) fn parent_key(key: &[u8]) -> Option<&[u8]> {
    let rest = key.strip_prefix(CHILD_PREFIX)?;
    let colon = rest.iter().rposition(|byte| *byte == b':')?;
    let index = &rest[colon + 1..];
    if index.is_empty() || !index.iter().all(|byte| byte.is_ascii_hexdigit()) {
        return None;
    }

    Some(&rest[..colon])
}

fn bit(bitmap: &Bitmap, block: u64) -> bool {
    bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
}

fn set_bit(bitmap: &mut Bitmap, block: u64) {
    bitmap[(block / 8) as usize] |= 1 << (block % 8);
}

fn read_bitmap(core: &mut Core, child: EntryId) -> Result<Bitmap> {
    let mut bitmap = [0u8; BITMAP_BYTES];
    core.read(child, 0, 0, &mut bitmap)?;
    Ok(bitmap)
}

fn parent_key_of(core: &Core, parent: EntryId) -> Result<Vec<u8>> {
    core.key_of(parent)
        .map(|key| key.to_vec())
        .ok_or(Error::NotFound)
}

fn checked_end(offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(len as u64)
        .ok_or(Error::InvalidArgument("sparse range overflows"))
}

fn write_child(core: &mut Core, child: EntryId, offset: u64, data: &[u8]) -> Result<()> {
    core.write(child, 1, offset, data, false)?;

    let mut bitmap = read_bitmap(core, child)?;
    let first = (offset + BLOCK_SIZE - 1) / BLOCK_SIZE;
    let last = (offset + data.len() as u64) / BLOCK_SIZE;
    for block in first..last {
        set_bit(&mut bitmap, block);
    }

    core.write(child, 0, 0, &bitmap, true)?;
    Ok(())
}

/// Writes `data` at `offset` in `parent`'s sparse space.
pub(crate) fn write(core: &mut Core, parent: EntryId, offset: u64, data: &[u8]) -> Result<usize> {
    let key = parent_key_of(core, parent)?;
    checked_end(offset, data.len())?;

    let mut written = 0;
    while written < data.len() {
        let position = offset + written as u64;
        let child_offset = position % CHILD_SIZE;
        let chunk = (data.len() - written).min((CHILD_SIZE - child_offset) as usize);
        let child_key = child_key(&key, position / CHILD_SIZE);

        let child = match core.open_unchecked(&child_key) {
            Ok(child) => child,
            Err(Error::NotFound) => core.create_unchecked(&child_key)?,
            Err(e) => return Err(e),
        };
        core.mark_sparse_parent(parent);

        let result = write_child(core, child, child_offset, &data[written..written + chunk]);
        core.close(child);
        result?;

        written += chunk;
    }

    Ok(written)
}

/// Reads the contiguous run of available sparse data at `offset`.
pub(crate) fn read(core: &mut Core, parent: EntryId, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let key = parent_key_of(core, parent)?;
    checked_end(offset, buf.len())?;

    let mut done = 0;
    while done < buf.len() {
        let position = offset + done as u64;
        let child_offset = position % CHILD_SIZE;
        let child = match core.lookup_valid(&child_key(&key, position / CHILD_SIZE))? {
            Some(child) => child,
            None => break,
        };

        let bitmap = read_bitmap(core, child)?;
        let mut block = child_offset / BLOCK_SIZE;
        while block < BLOCKS_PER_CHILD && bit(&bitmap, block) {
            block += 1;
        }

        let available_end = block * BLOCK_SIZE;
        if available_end <= child_offset {
            break;
        }

        let wanted = (buf.len() - done).min((available_end - child_offset) as usize);
        let got = core.read(child, 1, child_offset, &mut buf[done..done + wanted])?;
        done += got;
        if got < wanted || available_end < CHILD_SIZE {
            break;
        }
    }

    Ok(done)
}

/// Returns the first run of available blocks that overlaps
/// `[offset, offset + len)`, clipped to that range.
pub(crate) fn available_range(
    core: &mut Core,
    parent: EntryId,
    offset: u64,
    len: usize,
) -> Result<(u64, usize)> {
    let key = parent_key_of(core, parent)?;
    let end = checked_end(offset, len)?;

    let mut start: Option<u64> = None;
    let mut run_end = offset;
    let mut position = offset;
    'children: while position < end {
        let child_index = position / CHILD_SIZE;
        let child_base = child_index * CHILD_SIZE;
        let child = match core.lookup_valid(&child_key(&key, child_index))? {
            Some(child) => child,
            None if start.is_some() => break,
            None => {
                position = child_base + CHILD_SIZE;
                continue;
            }
        };

        let bitmap = read_bitmap(core, child)?;
        let mut block = (position - child_base) / BLOCK_SIZE;
        while block < BLOCKS_PER_CHILD && position < end {
            let block_start = child_base + block * BLOCK_SIZE;
            let block_end = block_start + BLOCK_SIZE;

            if bit(&bitmap, block) {
                start.get_or_insert(position.max(block_start));
                run_end = block_end.min(end);
            } else if start.is_some() {
                break 'children;
            }

            block += 1;
            position = block_end;
        }
    }

    Ok(match start {
        Some(start) => (start, (run_end - start) as usize),
        None => (offset, 0),
    })
}

#[test]
fn test_child_keys() {
    let key = child_key(b"http://example.com/a:b", 0x1f);
    assert_eq!(key, b"Range_http://example.com/a:b:1f".to_vec());
    assert_eq!(parent_key(&key), Some(&b"http://example.com/a:b"[..]));

    assert_eq!(parent_key(b"http://example.com/"), None);
    assert_eq!(parent_key(b"Range_nocolon"), None);
    assert_eq!(parent_key(b"Range_x:"), None);
    assert_eq!(parent_key(b"Range_x:zz"), None);
    assert_eq!(parent_key(b"Range_:0"), Some(&b""[..]));
}

#[test]
fn test_bitmap() {
    let mut bitmap = [0u8; BITMAP_BYTES];
    set_bit(&mut bitmap, 0);
    set_bit(&mut bitmap, 1023);

    assert!(bit(&bitmap, 0));
    assert!(!bit(&bitmap, 1));
    assert!(bit(&bitmap, 1023));
    assert_eq!(BITMAP_BYTES, 128);
}
