//! The memory engine keeps every stream in a `Vec<u8>`.  Nothing
//! survives the backend, so loading always starts empty and there is
//! no validation to do.
use std::collections::HashMap;
use std::time::SystemTime;

use crate::config::BackendKind;
use crate::config::CacheType;
use crate::engine::EntryMeta;
use crate::engine::Loaded;
use crate::engine::Location;
use crate::engine::Snapshot;
use crate::engine::StorageEngine;
use crate::entry::EntryState;
use crate::error::Error;
use crate::error::Result;
use crate::STREAM_COUNT;

type Streams = [Vec<u8>; STREAM_COUNT];

#[derive(Debug, Default)]
pub(crate) struct MemoryEngine {
    next_location: u64,
    streams: HashMap<Location, Streams>,
}

impl MemoryEngine {
    pub fn new() -> MemoryEngine {
        MemoryEngine::default()
    }

    fn streams_mut(&mut self, location: Location) -> Result<&mut Streams> {
        self.streams
            .get_mut(&location)
            .ok_or_else(|| Error::corrupt(format!("no memory entry at {:?}", location)))
    }
}

impl StorageEngine for MemoryEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn load(&mut self) -> Result<Loaded> {
        Ok(Loaded::default())
    }

    fn accounted_size(&self, key_len: usize, stream_sizes: &[u32; STREAM_COUNT]) -> i64 {
        key_len as i64 + stream_sizes.iter().map(|size| *size as i64).sum::<i64>()
    }

    fn create(&mut self, _key: &[u8], _hash: u64, _now: SystemTime) -> Result<Location> {
        self.next_location += 1;
        let location = Location(self.next_location);
        self.streams.insert(location, Default::default());
        Ok(location)
    }

    fn open(
        &mut self,
        location: Location,
        _key: &[u8],
        _hash: u64,
    ) -> Result<[u32; STREAM_COUNT]> {
        let streams = self.streams_mut(location)?;
        let mut sizes = [0u32; STREAM_COUNT];
        for (size, stream) in sizes.iter_mut().zip(streams.iter()) {
            *size = stream.len() as u32;
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
        let data = &self.streams_mut(location)?[stream];
        let start = (offset as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());

        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(end - start)
    }

    fn write(
        &mut self,
        location: Location,
        stream: usize,
        offset: u64,
        data: &[u8],
        new_len: u32,
    ) -> Result<()> {
        let buf = &mut self.streams_mut(location)?[stream];
        let offset = offset as usize;
        let end = offset + data.len();

        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        buf.resize(new_len as usize, 0);
        Ok(())
    }

    fn set_state(&mut self, _location: Location, _state: EntryState) -> Result<()> {
        Ok(())
    }

    fn close(&mut self, _location: Location, _meta: &EntryMeta) -> Result<()> {
        Ok(())
    }

    fn remove(&mut self, location: Location) -> Result<()> {
        self.streams.remove(&location);
        Ok(())
    }

    fn remove_all(&mut self) -> Result<()> {
        self.streams.clear();
        Ok(())
    }

    fn flush(&mut self, _snapshot: &Snapshot, _clean: bool) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {
        self.streams.clear();
    }

    fn supports_range_size(&self, _cache_type: CacheType, _unbounded: bool) -> bool {
        true
    }
}

#[test]
fn test_write_gap_and_truncate() {
    let mut engine = MemoryEngine::new();
    let location = engine
        .create(b"key", 0, SystemTime::now())
        .expect("create should succeed");

    engine
        .write(location, 1, 4, b"abcd", 8)
        .expect("write should succeed");
    let mut buf = [0xffu8; 8];
    assert_eq!(engine.read(location, 1, 0, &mut buf).expect("read"), 8);
    assert_eq!(&buf, b"\0\0\0\0abcd");

    engine
        .write(location, 1, 1, b"X", 2)
        .expect("write should succeed");
    assert_eq!(engine.open(location, b"key", 0).expect("open"), [0, 2, 0]);
    assert_eq!(engine.read(location, 1, 0, &mut buf).expect("read"), 2);
    assert_eq!(&buf[..2], b"\0X");

    engine.remove(location).expect("remove should succeed");
    assert!(engine.open(location, b"key", 0).is_err());
}
