//! Scenarios every engine must get right, run against the memory,
//! simple, and blockfile backends alike.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use test_dir::{DirBuilder, TestDir};

use crate::Backend;
use crate::BackendBuilder;
use crate::BackendKind;
use crate::CacheType;
use crate::Clock;
use crate::Entry;
use crate::Error;
use crate::EvictionMode;
use crate::MemoryPressure;
use crate::ManualClock;
use crate::NetError;
use crate::ResetHandling;

const KINDS: [BackendKind; 3] = [
    BackendKind::Memory,
    BackendKind::Simple,
    BackendKind::Blockfile,
];

const DISK_KINDS: [BackendKind; 2] = [BackendKind::Simple, BackendKind::Blockfile];

const MIB: u64 = 1 << 20;

fn builder(kind: BackendKind, temp: &TestDir) -> BackendBuilder {
    let builder = BackendBuilder::new().kind(kind).max_size(MIB);
    match kind {
        BackendKind::Memory => builder.cache_type(CacheType::Memory),
        _ => builder.path(temp.path("cache")),
    }
}

fn open(kind: BackendKind, temp: &TestDir) -> Backend {
    builder(kind, temp)
        .build()
        .expect("backend should build")
}

fn create(backend: &Backend, key: &[u8]) -> Entry {
    backend
        .create_entry(key)
        .wait()
        .expect("create should succeed")
}

/// Creates `key` with `len` bytes of stream 1, and closes it.
fn fill(backend: &Backend, key: &[u8], len: usize) {
    let entry = create(backend, key);
    let data = vec![key[key.len() - 1]; len];
    assert_eq!(
        entry.write_data(1, 0, &data, false).expect("write should succeed"),
        len
    );
}

fn exists(backend: &Backend, key: &[u8]) -> bool {
    match backend.open_entry(key).wait() {
        Ok(_) => true,
        Err(Error::NotFound) => false,
        Err(e) => panic!("unexpected open failure: {}", e),
    }
}

fn read_all(entry: &Entry, stream: usize) -> Vec<u8> {
    let mut buf = vec![0u8; entry.data_size(stream) as usize];
    let read = entry
        .read_data(stream, 0, &mut buf)
        .expect("read should succeed");
    assert_eq!(read, buf.len());
    buf
}

/// Returns the keys an iterator visits, in order.
fn enumerate(backend: &Backend) -> Vec<Vec<u8>> {
    let mut iter = backend.iter();
    let mut keys = Vec::new();
    while let Some(entry) = iter.open_next().wait().expect("iteration should succeed") {
        keys.push(entry.key().to_vec());
    }

    keys
}

#[test]
fn test_keys_are_exact() {
    for kind in KINDS.iter() {
        let temp = TestDir::temp();
        let backend = open(*kind, &temp);

        let first = create(&backend, b"a\0b");
        let second = create(&backend, b"a\0c");
        assert_eq!(first.key(), b"a\0b");
        assert_eq!(second.key(), b"a\0c");
        assert_ne!(first, second);
        assert_eq!(backend.entry_count(), 2);

        assert!(matches!(
            backend.create_entry(b"a\0b").wait(),
            Err(Error::AlreadyExists)
        ));
        assert!(matches!(
            backend.open_entry(b"a\0").wait(),
            Err(Error::NotFound)
        ));

        let again = backend
            .open_entry(b"a\0b")
            .wait()
            .expect("open should succeed");
        assert_eq!(again, first);
    }
}

#[test]
fn test_stream_io() {
    for kind in KINDS.iter() {
        let temp = TestDir::temp();
        let backend = open(*kind, &temp);
        let entry = create(&backend, b"http://example.com/");

        entry.write_data(0, 0, b"headers", false).expect("write");
        entry.write_data(1, 0, b"the body", false).expect("write");
        // Writing past the end zero-fills the gap.
        entry.write_data(2, 4, b"side", false).expect("write");

        assert_eq!(read_all(&entry, 0), b"headers");
        assert_eq!(read_all(&entry, 1), b"the body");
        assert_eq!(read_all(&entry, 2), b"\0\0\0\0side");

        // Overwrite in place, then truncate.
        entry.write_data(1, 4, b"BODY", false).expect("write");
        assert_eq!(read_all(&entry, 1), b"the BODY");
        entry.write_data(1, 2, b"e", true).expect("write");
        assert_eq!(read_all(&entry, 1), b"the");

        let mut buf = [0u8; 8];
        assert_eq!(entry.read_data(1, 3, &mut buf).expect("read at end"), 0);
        assert_eq!(entry.read_data(1, 100, &mut buf).expect("read past end"), 0);

        let result = entry.read_data(3, 0, &mut buf);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(NetError::of(&result), NetError::InvalidArgument);
        assert!(matches!(
            entry.write_data(3, 0, b"x", false),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(entry.data_size(3), 0);
    }
}

#[test]
fn test_data_survives_restart() {
    let large: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

    for kind in DISK_KINDS.iter() {
        let temp = TestDir::temp();
        {
            let backend = open(*kind, &temp);
            let entry = create(&backend, b"small");
            entry.write_data(0, 0, b"headers", false).expect("write");
            entry.write_data(1, 0, b"body", false).expect("write");
            drop(entry);

            let entry = create(&backend, b"large");
            entry.write_data(1, 0, &large, false).expect("write");
        }

        let backend = open(*kind, &temp);
        assert_eq!(backend.entry_count(), 2, "{:?}", kind);
        assert_eq!(backend.stats().invalid_entries_dropped, 0);

        let entry = backend
            .open_entry(b"small")
            .wait()
            .expect("open should succeed");
        assert_eq!(read_all(&entry, 0), b"headers");
        assert_eq!(read_all(&entry, 1), b"body");
        assert_eq!(entry.data_size(2), 0);

        let entry = backend
            .open_entry(b"large")
            .wait()
            .expect("open should succeed");
        assert_eq!(read_all(&entry, 1), large);
    }
}

#[test]
fn test_open_or_create_reports_existence() {
    for kind in KINDS.iter() {
        let temp = TestDir::temp();
        let backend = open(*kind, &temp);

        let result = backend
            .open_or_create_entry(b"key")
            .wait()
            .expect("open_or_create should succeed");
        assert!(!result.opened);
        result.entry.write_data(0, 0, b"abc", false).expect("write");
        drop(result);

        let result = backend
            .open_or_create_entry(b"key")
            .wait()
            .expect("open_or_create should succeed");
        assert!(result.opened);
        assert_eq!(read_all(&result.entry, 0), b"abc");
    }
}

#[test]
fn test_size_accounting() {
    let temp = TestDir::temp();
    let backend = open(BackendKind::Memory, &temp);

    let entry = create(&backend, b"key");
    entry.write_data(0, 0, &[1u8; 10], false).expect("write");
    entry.write_data(1, 0, &[2u8; 20], false).expect("write");
    assert_eq!(backend.stats().total_size, 33);
    assert_eq!(
        backend
            .calculate_size_of_all_entries()
            .wait()
            .expect("size should succeed"),
        33
    );

    entry.write_data(1, 0, &[2u8; 5], true).expect("write");
    assert_eq!(backend.stats().total_size, 18);

    entry.doom().expect("doom should succeed");
    assert_eq!(backend.stats().total_size, 0);
    assert_eq!(backend.entry_count(), 0);

    // The doomed handle keeps working.
    entry.write_data(1, 0, b"still here", false).expect("write");
    assert_eq!(read_all(&entry, 1), b"still here");
    assert_eq!(backend.stats().total_size, 0);
}

#[test]
fn test_size_accounting_on_disk() {
    // Simple files carry headers and round up to 256 bytes; blockfile
    // counts keys and data.
    for (kind, expected) in DISK_KINDS.iter().zip([3328 + 20224, 3013 + 20005].iter()) {
        let temp = TestDir::temp();
        {
            let backend = open(*kind, &temp);
            let entry = create(&backend, b"key");
            entry.write_data(0, 0, &[1u8; 10], false).expect("write");
            entry.write_data(1, 0, &[2u8; 3000], false).expect("write");
            drop(entry);
            fill(&backend, b"other", 20000);

            let calculated = backend
                .calculate_size_of_all_entries()
                .wait()
                .expect("size should succeed");
            assert_eq!(calculated, *expected, "{:?}", kind);
            assert_eq!(calculated, backend.stats().total_size);
        }

        let backend = open(*kind, &temp);
        let calculated = backend
            .calculate_size_of_all_entries()
            .wait()
            .expect("size should succeed");
        assert_eq!(calculated, *expected, "{:?}", kind);
        assert_eq!(calculated, backend.stats().total_size);
    }
}

#[test]
fn test_range_sizes() {
    let clock = Arc::new(ManualClock::default());
    let temp = TestDir::temp();
    let backend = builder(BackendKind::Memory, &temp)
        .clock(clock.clone())
        .build()
        .expect("backend should build");

    let start = clock.now();
    fill(&backend, b"k1", 100);
    clock.advance(Duration::from_secs(10));
    let middle = clock.now();
    fill(&backend, b"k2", 1000);

    let size = |range: std::ops::Range<std::time::SystemTime>| {
        backend
            .calculate_size_of_entries_between(range)
            .wait()
            .expect("size should succeed")
    };
    assert_eq!(size(start..middle), 102);
    assert_eq!(size(middle..middle + Duration::from_secs(1)), 1002);

    // Blockfile only knows its total.
    let temp = TestDir::temp();
    let blockfile = open(BackendKind::Blockfile, &temp);
    assert!(matches!(
        blockfile.calculate_size_of_entries_between(..).wait(),
        Err(Error::NotImplemented(_))
    ));
    assert_eq!(
        blockfile
            .calculate_size_of_all_entries()
            .wait()
            .expect("size should succeed"),
        0
    );
}

#[test]
fn test_per_entry_limit() {
    for kind in [BackendKind::Memory, BackendKind::Blockfile].iter() {
        let temp = TestDir::temp();
        let backend = builder(*kind, &temp)
            .max_size(64 * 1024)
            .build()
            .expect("backend should build");
        let entry = create(&backend, b"key");

        // A fifth of the cache is too much for one stream; a tenth is
        // fine.
        let result = entry.write_data(1, 0, &vec![0u8; 64 * 1024 / 5], false);
        assert!(matches!(result, Err(Error::InsufficientResources(_))));
        assert_eq!(NetError::of(&result), NetError::InsufficientResources);
        assert_eq!(entry.data_size(1), 0);

        entry
            .write_data(1, 0, &vec![0u8; 64 * 1024 / 10], false)
            .expect("write should succeed");
    }
}

#[test]
fn test_stream_offsets_stop_at_32_bits() {
    let temp = TestDir::temp();
    let backend = open(BackendKind::Memory, &temp);
    let entry = create(&backend, b"key");

    assert!(matches!(
        entry.write_data(0, u32::MAX as u64, b"x", false),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        backend.set_max_size(i32::MAX as u64 + 1),
        Err(Error::InvalidArgument(_))
    ));
    backend
        .set_max_size(i32::MAX as u64)
        .expect("2 GiB should be fine");
}

#[test]
fn test_eviction_keeps_cache_bounded() {
    for kind in KINDS.iter() {
        let temp = TestDir::temp();
        let backend = builder(*kind, &temp)
            .max_size(64 * 1024)
            .build()
            .expect("backend should build");

        for i in 0..20 {
            fill(&backend, format!("key-{:02}", i).as_bytes(), 6000);
            assert!(backend.stats().total_size <= 64 * 1024);
        }

        let stats = backend.stats();
        assert!(stats.evictions > 0);
        assert!(!exists(&backend, b"key-00"));
        assert!(exists(&backend, b"key-19"));

        backend.set_max_size(16 * 1024).expect("shrink should succeed");
        let stats = backend.stats();
        assert!(stats.total_size <= 16 * 1024);
        assert_eq!(stats.max_size, 16 * 1024);
        assert!(exists(&backend, b"key-19"));
        assert!(!exists(&backend, b"key-15"));
    }
}

#[test]
fn test_open_entries_are_not_evicted() {
    let temp = TestDir::temp();
    let backend = builder(BackendKind::Memory, &temp)
        .max_size(64 * 1024)
        .build()
        .expect("backend should build");

    let pinned = create(&backend, b"pinned");
    pinned.write_data(1, 0, &[1u8; 6000], false).expect("write");
    for i in 0..20 {
        fill(&backend, format!("key-{:02}", i).as_bytes(), 6000);
    }

    assert!(exists(&backend, b"pinned"));
    assert_eq!(read_all(&pinned, 1), vec![1u8; 6000]);
}

/// Fills a 64 KiB cache with four reused entries and then ten fresh
/// ones, and returns which of them survived.
fn survivors(eviction: EvictionMode) -> (Vec<bool>, Vec<bool>) {
    let temp = TestDir::temp();
    let backend = builder(BackendKind::Memory, &temp)
        .max_size(64 * 1024)
        .eviction(eviction)
        .build()
        .expect("backend should build");

    let reused: Vec<Vec<u8>> = (0..4).map(|i| format!("r{}", i).into_bytes()).collect();
    let fresh: Vec<Vec<u8>> = (0..10).map(|i| format!("n{}", i).into_bytes()).collect();

    for key in reused.iter() {
        fill(&backend, key, 6000);
    }
    for key in reused.iter() {
        assert!(exists(&backend, key));
    }
    for key in fresh.iter() {
        fill(&backend, key, 6000);
    }

    let check = |keys: &[Vec<u8>]| -> Vec<bool> {
        keys.iter().map(|key| exists(&backend, key)).collect()
    };
    (check(&reused), check(&fresh))
}

#[test]
fn test_two_list_eviction_protects_reused_entries() {
    let (reused, fresh) = survivors(EvictionMode::TwoList);
    assert_eq!(reused, vec![true; 4]);
    assert_eq!(&fresh[..4], &[false; 4]);
    assert_eq!(&fresh[4..], &[true; 6]);

    let (reused, fresh) = survivors(EvictionMode::Lru);
    assert_eq!(reused, vec![false; 4]);
    assert_eq!(fresh, vec![true; 10]);
}

#[test]
fn test_doom_by_time() {
    for kind in KINDS.iter() {
        let clock = Arc::new(ManualClock::default());
        let temp = TestDir::temp();
        let backend = builder(*kind, &temp)
            .clock(clock.clone())
            .build()
            .expect("backend should build");

        let t0 = clock.now();
        fill(&backend, b"a", 10);
        clock.advance(Duration::from_secs(10));
        fill(&backend, b"b", 10);
        clock.advance(Duration::from_secs(10));
        fill(&backend, b"c", 10);
        clock.advance(Duration::from_secs(10));
        fill(&backend, b"d", 10);

        backend
            .doom_entries_between(t0 + Duration::from_secs(5)..t0 + Duration::from_secs(15))
            .wait()
            .expect("doom should succeed");
        assert!(exists(&backend, b"a"));
        assert!(!exists(&backend, b"b"));

        // `exists` just touched a, so it goes along with c and d.
        clock.advance(Duration::from_secs(10));
        backend
            .doom_entries_since(t0 + Duration::from_secs(20))
            .wait()
            .expect("doom should succeed");
        assert_eq!(backend.entry_count(), 0, "{:?}", kind);

        fill(&backend, b"e", 10);
        backend
            .doom_all_entries()
            .wait()
            .expect("doom should succeed");
        assert_eq!(backend.entry_count(), 0);
        assert_eq!(backend.stats().total_size, 0);
    }
}

#[test]
fn test_doom_then_recreate() {
    for kind in KINDS.iter() {
        let temp = TestDir::temp();
        let backend = open(*kind, &temp);

        let old = create(&backend, b"key");
        old.write_data(1, 0, b"old", false).expect("write");
        backend
            .doom_entry(b"key")
            .wait()
            .expect("doom should succeed");
        assert!(matches!(
            backend.open_entry(b"key").wait(),
            Err(Error::NotFound)
        ));

        // The key is free again while the doomed handle lives on.
        let new = create(&backend, b"key");
        new.write_data(1, 0, b"new data", false).expect("write");
        assert_eq!(read_all(&old, 1), b"old");
        drop(old);
        drop(new);

        let reopened = backend
            .open_entry(b"key")
            .wait()
            .expect("open should succeed");
        assert_eq!(read_all(&reopened, 1), b"new data");

        // Dooming a missing key is fine.
        backend
            .doom_entry(b"missing")
            .wait()
            .expect("doom should succeed");
    }
}

#[test]
fn test_enumeration_order() {
    for kind in KINDS.iter() {
        let clock = Arc::new(ManualClock::default());
        let temp = TestDir::temp();
        let backend = builder(*kind, &temp)
            .clock(clock.clone())
            .build()
            .expect("backend should build");

        let mut used = Vec::new();
        for i in 0..5 {
            fill(&backend, format!("k{}", i).as_bytes(), 10);
            used.push(clock.now());
            clock.advance(Duration::from_secs(1));
        }

        // Reopening k1 makes it the most recently used.
        drop(
            backend
                .open_entry(b"k1")
                .wait()
                .expect("open should succeed"),
        );
        used[1] = clock.now();
        clock.advance(Duration::from_secs(1));

        let mut iter = backend.iter();
        let mut seen = Vec::new();
        while let Some(entry) = iter.open_next().wait().expect("iteration should succeed") {
            let index = (entry.key()[1] - b'0') as usize;
            // Enumeration leaves timestamps alone.
            assert_eq!(entry.last_used(), used[index]);
            seen.push(index);

            if index == 1 {
                backend
                    .doom_entry(b"k3")
                    .wait()
                    .expect("doom should succeed");
            }
        }

        assert_eq!(seen, vec![1, 4, 2, 0], "{:?}", kind);
        assert_eq!(enumerate(&backend).len(), 4);
    }
}

#[test]
fn test_enumeration_fails_once_backend_is_gone() {
    for kind in KINDS.iter() {
        let temp = TestDir::temp();
        let backend = open(*kind, &temp);
        fill(&backend, b"a", 1);
        fill(&backend, b"b", 1);

        let mut iter = backend.iter();
        let first = iter
            .open_next()
            .wait()
            .expect("iteration should succeed")
            .expect("cache should not be empty");
        drop(backend);

        assert!(matches!(iter.open_next().wait(), Err(Error::BackendGone)));
        // The handle outlives both.
        assert!(first.data_size(1) > 0);
    }
}

#[test]
fn test_corrupt_rankings_reset_cache() {
    let temp = TestDir::temp();
    let backend = open(BackendKind::Memory, &temp);
    fill(&backend, b"a", 10);
    fill(&backend, b"b", 10);
    fill(&backend, b"c", 10);

    backend.corrupt_rankings(b"b", b"b");
    let mut iter = backend.iter();
    assert!(matches!(iter.open_next().wait(), Err(Error::Corrupt(_))));

    let stats = backend.stats();
    assert_eq!(stats.resets, 1);
    assert!(stats.corruptions >= 1);
    assert!(!stats.disabled);
    assert_eq!(backend.entry_count(), 0);

    fill(&backend, b"a", 10);
    assert_eq!(enumerate(&backend), vec![b"a".to_vec()]);
}

#[test]
fn test_corrupt_rankings_disable_until_entries_close() {
    let temp = TestDir::temp();
    let backend = open(BackendKind::Memory, &temp);
    fill(&backend, b"a", 10);
    fill(&backend, b"b", 10);
    fill(&backend, b"c", 10);
    let held = backend
        .open_entry(b"a")
        .wait()
        .expect("open should succeed");

    backend.corrupt_rankings(b"b", b"b");
    assert!(matches!(
        backend.iter().open_next().wait(),
        Err(Error::Corrupt(_))
    ));

    assert!(backend.stats().disabled);
    assert_eq!(backend.entry_count(), 0);
    let result = backend.create_entry(b"d").wait();
    assert!(matches!(result, Err(Error::Disabled)));
    assert_eq!(NetError::of(&result), NetError::Failed);

    // Open handles keep working.
    held.write_data(0, 0, b"still open", false).expect("write");
    drop(held);

    let stats = backend.stats();
    assert!(!stats.disabled);
    assert_eq!(stats.resets, 1);
    fill(&backend, b"d", 10);
    assert_eq!(backend.entry_count(), 1);
}

#[test]
fn test_eviction_repairs_corrupt_rankings() {
    let temp = TestDir::temp();
    let backend = builder(BackendKind::Memory, &temp)
        .max_size(64 * 1024)
        .build()
        .expect("backend should build");
    for i in 0..5 {
        fill(&backend, format!("key-{}", i).as_bytes(), 6000);
    }

    backend.corrupt_rankings(b"key-2", b"key-2");
    backend.set_max_size(20_000).expect("shrink should succeed");

    let stats = backend.stats();
    assert!(stats.corruptions >= 1);
    assert_eq!(stats.resets, 0);
    assert!(stats.total_size <= 20_000);
    assert!(!exists(&backend, b"key-2"));
    assert!(exists(&backend, b"key-4"));
    assert_eq!(enumerate(&backend).len(), backend.entry_count());
}

#[test]
fn test_invalid_entry_is_contained() {
    const COUNT: usize = 5;
    let victim = b"k3";

    for kind in DISK_KINDS.iter() {
        let temp = TestDir::temp();
        {
            let backend = open(*kind, &temp);
            for i in 0..COUNT {
                fill(&backend, format!("k{}", i).as_bytes(), 100);
            }
        }

        let cache = temp.path("cache");
        match kind {
            BackendKind::Simple => {
                let name = crate::simple::entry_file_name(crate::hash::key_hash(victim), 0);
                std::fs::write(cache.join(name), b"definitely not an entry")
                    .expect("overwrite should succeed");
            }
            _ => {
                // Flip a byte in the fourth record of `data_0`.
                use std::os::unix::fs::FileExt;
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(cache.join("data_0"))
                    .expect("open should succeed");
                let offset = 12288 + 3 * 256 + 250;
                let mut byte = [0u8; 1];
                file.read_exact_at(&mut byte, offset).expect("read");
                byte[0] ^= 0xff;
                file.write_all_at(&byte, offset).expect("write");
            }
        }

        let backend = open(*kind, &temp);
        for i in 0..COUNT {
            let key = format!("k{}", i).into_bytes();
            assert_eq!(exists(&backend, &key), &key[..] != victim, "{:?}", kind);
        }

        assert_eq!(backend.entry_count(), COUNT - 1);
        assert_eq!(backend.stats().invalid_entries_dropped, 1);
        assert_eq!(enumerate(&backend).len(), COUNT - 1);
    }
}

#[test]
fn test_crash_drops_open_entries() {
    for kind in DISK_KINDS.iter() {
        let temp = TestDir::temp();
        {
            let backend = open(*kind, &temp);
            fill(&backend, b"kept", 100);

            let open = create(&backend, b"open");
            open.write_data(1, 0, &[7u8; 3000], false).expect("write");
            backend.simulate_crash();
            drop(open);
        }

        let backend = open(*kind, &temp);
        assert!(exists(&backend, b"kept"), "{:?}", kind);
        assert!(!exists(&backend, b"open"), "{:?}", kind);
        assert_eq!(backend.entry_count(), 1);

        let entry = backend
            .open_entry(b"kept")
            .wait()
            .expect("open should succeed");
        assert_eq!(read_all(&entry, 1), vec![b't'; 100]);
    }
}

#[test]
fn test_bad_blockfile_index() {
    for policy in [
        ResetHandling::NeverReset,
        ResetHandling::ResetOnError,
        ResetHandling::Recover,
    ]
    .iter()
    {
        let temp = TestDir::temp();
        {
            let backend = open(BackendKind::Blockfile, &temp);
            fill(&backend, b"key", 100);
        }

        std::fs::write(temp.path("cache").join("index"), b"not an index")
            .expect("overwrite should succeed");
        let result = builder(BackendKind::Blockfile, &temp)
            .reset_handling(*policy)
            .build();

        match policy {
            ResetHandling::NeverReset => {
                assert!(matches!(result, Err(Error::Corrupt(_))));
            }
            ResetHandling::ResetOnError => {
                let backend = result.expect("backend should build");
                assert_eq!(backend.entry_count(), 0);
            }
            ResetHandling::Recover => {
                let backend = result.expect("backend should build");
                assert_eq!(backend.entry_count(), 1);
                let entry = backend
                    .open_entry(b"key")
                    .wait()
                    .expect("open should succeed");
                assert_eq!(read_all(&entry, 1), vec![b'y'; 100]);
            }
        }
    }
}

#[test]
fn test_file_descriptor_cap() {
    let temp = TestDir::temp();
    let backend = builder(BackendKind::Simple, &temp)
        .max_size(16 * MIB)
        .max_open_files(64)
        .build()
        .expect("backend should build");

    for i in 0..512 {
        let entry = create(&backend, format!("key-{}", i).as_bytes());
        entry.write_data(0, 0, b"headers", false).expect("write");
    }

    let stats = backend.stats();
    assert_eq!(stats.entry_count, 512);
    assert_eq!(stats.fd_closes, 448);
    assert_eq!(stats.fd_reopens, 0);

    let entry = backend
        .open_entry(b"key-0")
        .wait()
        .expect("open should succeed");
    assert_eq!(read_all(&entry, 0), b"headers");
    assert_eq!(backend.stats().fd_reopens, 1);
}

#[test]
fn test_shutdown_with_pending_operations() {
    let fired = Arc::new(AtomicBool::new(false));
    let temp = TestDir::temp();
    let backend = {
        let fired = fired.clone();
        builder(BackendKind::Simple, &temp)
            .worker_threads(2)
            .post_cleanup(move || fired.store(true, Ordering::SeqCst))
            .build()
            .expect("backend should build")
    };

    let pending: Vec<_> = (0..50)
        .map(|i| backend.create_entry(format!("key-{}", i).as_bytes()))
        .collect();
    drop(backend);

    let mut entries = Vec::new();
    for op in pending {
        match op.wait() {
            Ok(entry) => entries.push(entry),
            Err(Error::Cancelled) => {}
            Err(e) => panic!("unexpected failure: {}", e),
        }
    }

    if !entries.is_empty() {
        assert!(!fired.load(Ordering::SeqCst));
    }
    drop(entries);
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_queued_operations_complete_in_order() {
    let temp = TestDir::temp();
    let backend = builder(BackendKind::Blockfile, &temp)
        .worker_threads(4)
        .build()
        .expect("backend should build");

    let created = backend.create_entry(b"key");
    let doomed = backend.doom_entry(b"key");
    let missing = backend.open_entry(b"key");
    assert!(created.is_pending());

    drop(created.wait().expect("create should succeed"));
    doomed.wait().expect("doom should succeed");
    assert!(matches!(missing.wait(), Err(Error::NotFound)));

    backend.flush().wait().expect("flush should succeed");
}

#[test]
fn test_instances_are_independent() {
    for kind in KINDS.iter() {
        let first_dir = TestDir::temp();
        let second_dir = TestDir::temp();
        let first = open(*kind, &first_dir);
        let second = open(*kind, &second_dir);

        let a = create(&first, b"key");
        let b = create(&second, b"key");
        a.write_data(1, 0, b"first", false).expect("write");
        b.write_data(1, 0, b"second", false).expect("write");

        assert_eq!(read_all(&a, 1), b"first");
        assert_eq!(read_all(&b, 1), b"second");
        drop(a);
        first
            .doom_all_entries()
            .wait()
            .expect("doom should succeed");
        assert_eq!(first.entry_count(), 0);
        assert_eq!(second.entry_count(), 1);
    }
}

#[test]
fn test_external_cache_hit_counts_as_use() {
    for kind in KINDS.iter() {
        let clock = Arc::new(ManualClock::default());
        let temp = TestDir::temp();
        let backend = builder(*kind, &temp)
            .clock(clock.clone())
            .build()
            .expect("backend should build");

        fill(&backend, b"a", 1);
        clock.advance(Duration::from_secs(1));
        fill(&backend, b"b", 1);
        clock.advance(Duration::from_secs(1));

        backend
            .on_external_cache_hit(b"a")
            .wait()
            .expect("hit should succeed");
        backend
            .on_external_cache_hit(b"missing")
            .wait()
            .expect("hit should succeed");

        let mut iter = backend.iter();
        let entry = iter
            .open_next()
            .wait()
            .expect("iteration should succeed")
            .expect("cache should not be empty");
        assert_eq!(entry.key(), b"a");
        assert_eq!(entry.last_used(), clock.now());
    }
}

#[test]
fn test_sparse_data() {
    const CHILD: u64 = MIB;

    let temp = TestDir::temp();
    let backend = builder(BackendKind::Memory, &temp)
        .max_size(64 * MIB)
        .build()
        .expect("backend should build");
    let entry = create(&backend, b"video");

    assert_eq!(
        entry
            .write_sparse_data(129 * 1024, &[7u8; 4096])
            .expect("write should succeed"),
        4096
    );
    assert_eq!(
        entry.get_available_range(0, CHILD as usize).expect("range"),
        (129 * 1024, 4096)
    );

    let mut buf = vec![0u8; 8192];
    assert_eq!(entry.read_sparse_data(129 * 1024, &mut buf).expect("read"), 4096);
    assert_eq!(&buf[..4096], &[7u8; 4096][..]);
    assert_eq!(entry.read_sparse_data(0, &mut buf).expect("read"), 0);

    // Partial blocks never become available.
    entry.write_sparse_data(500, &[1u8; 100]).expect("write");
    assert_eq!(entry.get_available_range(0, 1024).expect("range"), (0, 0));

    // Runs continue across children.
    entry
        .write_sparse_data(CHILD - 1024, &[9u8; 2048])
        .expect("write");
    assert_eq!(
        entry.get_available_range(CHILD - 4096, 8192).expect("range"),
        (CHILD - 1024, 2048)
    );
    let mut buf = vec![0u8; 2048];
    assert_eq!(entry.read_sparse_data(CHILD - 1024, &mut buf).expect("read"), 2048);
    assert_eq!(buf, vec![9u8; 2048]);

    // Children are entries of their own, and go with their parent.
    assert_eq!(backend.entry_count(), 3);
    entry.doom().expect("doom should succeed");
    assert_eq!(backend.entry_count(), 0);
}

#[test]
fn test_memory_pressure_trims_memory_cache() {
    let temp = TestDir::temp();
    let backend = builder(BackendKind::Memory, &temp)
        .max_size(16 * 1024)
        .build()
        .expect("backend should build");

    for i in 0..58 {
        fill(&backend, format!("{}", i).as_bytes(), 256);
    }
    assert_eq!(backend.stats().total_size, 58 * 256 + 106);
    assert_eq!(backend.stats().evictions, 0);

    backend.on_memory_pressure(MemoryPressure::Moderate);
    let moderate = backend.stats();
    assert!(moderate.total_size <= 8 * 1024);
    assert!(moderate.evictions > 0);
    // Oldest entries go first.
    assert!(!exists(&backend, b"0"));
    assert!(exists(&backend, b"57"));

    backend.on_memory_pressure(MemoryPressure::Critical);
    let critical = backend.stats();
    assert!(critical.total_size <= 16 * 1024 / 10);
    assert!(critical.evictions > moderate.evictions);
    assert_eq!(critical.max_size, 16 * 1024);

    // Disk caches keep everything.
    let temp = TestDir::temp();
    let disk = open(BackendKind::Simple, &temp);
    fill(&disk, b"key", 1000);
    let before = disk.stats().total_size;
    disk.on_memory_pressure(MemoryPressure::Critical);
    assert_eq!(disk.stats().total_size, before);
    assert!(exists(&disk, b"key"));
}

#[test]
fn test_sparse_child_keys_are_reserved() {
    for kind in KINDS.iter() {
        let temp = TestDir::temp();
        let backend = open(*kind, &temp);

        let reserved: &[u8] = b"Range_parent:0";
        assert!(matches!(
            backend.create_entry(reserved).wait(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            backend.open_entry(reserved).wait(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            backend.open_or_create_entry(reserved).wait(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            backend.doom_entry(reserved).wait(),
            Err(Error::InvalidArgument(_))
        ));

        // Look-alikes that no child could have are ordinary keys.
        fill(&backend, b"Range_parent", 100);
        fill(&backend, b"Range_parent:xyz", 100);

        let parent = create(&backend, b"parent");
        parent
            .write_sparse_data(0, &[1u8; 2048])
            .expect("write should succeed");
        drop(parent);
        backend
            .doom_entry(b"parent")
            .wait()
            .expect("doom should succeed");

        assert!(exists(&backend, b"Range_parent"), "{:?}", kind);
        assert!(exists(&backend, b"Range_parent:xyz"), "{:?}", kind);
        assert_eq!(backend.entry_count(), 2);
    }
}

#[test]
fn test_foreign_external_files_survive() {
    let temp = TestDir::temp();
    let dir = temp.path("cache");
    std::fs::create_dir_all(&dir).expect("mkdir should succeed");
    let foreign = dir.join("f_000001");
    std::fs::write(&foreign, [0xa5u8; 50]).expect("write should succeed");

    let check = || {
        assert_eq!(
            std::fs::read(&foreign).expect("foreign file should remain"),
            vec![0xa5u8; 50]
        );
    };

    {
        let backend = open(BackendKind::Blockfile, &temp);
        let entry = create(&backend, b"key");
        // 20000 bytes is too big for any block file.
        assert_eq!(entry.write_data(0, 20000, b"", false).expect("write"), 0);
        assert_eq!(entry.data_size(0), 20000);
        entry.write_data(1, 0, &[3u8; 20000], false).expect("write");
        drop(entry);
        check();
    }

    {
        let backend = open(BackendKind::Blockfile, &temp);
        let entry = backend
            .open_entry(b"key")
            .wait()
            .expect("open should succeed");
        assert_eq!(read_all(&entry, 1), vec![3u8; 20000]);
        drop(entry);

        backend
            .doom_all_entries()
            .wait()
            .expect("doom should succeed");
        assert_eq!(backend.entry_count(), 0);
        check();

        fill(&backend, b"again", 30000);
    }
    check();

    std::fs::write(dir.join("index"), b"not an index").expect("overwrite should succeed");
    let backend = builder(BackendKind::Blockfile, &temp)
        .reset_handling(ResetHandling::ResetOnError)
        .build()
        .expect("backend should build");
    assert_eq!(backend.entry_count(), 0);
    drop(backend);
    check();
}

#[test]
fn test_block_files_chain_when_full() {
    const ENTRIES: usize = 65537;

    let temp = TestDir::temp();
    let chained = || {
        builder(BackendKind::Blockfile, &temp)
            .max_size(1 << 30)
            .index_writeback_period(u64::MAX)
    };

    {
        let backend = chained().build().expect("backend should build");
        for i in 0..ENTRIES {
            create(&backend, format!("{:x}", i).as_bytes());
        }

        let stats = backend.stats();
        assert_eq!(stats.entry_count, ENTRIES);
        assert_eq!(stats.evictions, 0);
        assert!(exists(&backend, b"0"));
    }

    assert!(temp.path("cache").join("data_0_1").exists());

    let backend = chained().build().expect("backend should build");
    assert_eq!(backend.entry_count(), ENTRIES);
    assert!(exists(&backend, b"0"));
    assert!(exists(&backend, format!("{:x}", ENTRIES - 1).as_bytes()));
}
