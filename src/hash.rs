//! Keys are arbitrary byte strings; the index, the simple backend's
//! file names and the worker routing all work on a 64-bit digest of
//! the key instead.
//!
//! [`key_hash`] truncates a SHA-256 digest, so it is stable across
//! processes and versions (the simple backend's file names depend on
//! it).  [`RouteHash`] is a cheap keyed
//! [Dietzfelbinger multiplicative hash](https://link.springer.com/chapter/10.1007/978-3-319-98355-4_15)
//! that spreads key hashes over a small number of workers.

/// Returns the 64-bit hash of `key`: the first 8 bytes of its
/// SHA-256, little endian.
pub(crate) fn key_hash(key: &[u8]) -> u64 {
    use extendhash::sha256;

    let digest = sha256::compute_hash(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

/// Maps values in `[0, u64::MAX]` to `[0, domain)` linearly.
///
/// Returns 0 instead of erroring out when `domain == 0`.
#[inline(always)]
const fn reduce(x: u64, domain: usize) -> usize {
    ((domain as u128 * x as u128) >> 64) as usize
}

/// Routes key hashes to one of a fixed number of workers.  The same
/// hash always goes to the same worker, which is what keeps
/// operations on one key in submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RouteHash {
    // Pseudorandom odd multiplier
    multiplier: u64,
    // Pseudorandom value added to the product
    addend: u64,
}

impl RouteHash {
    /// Deterministically derives the parameters from `seed`.
    pub const fn new_keyed(seed: &[u8]) -> RouteHash {
        use extendhash::sha256;

        let hash = sha256::compute_hash(seed);
        let multiplier = [
            hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
        ];
        let addend = [
            hash[8], hash[9], hash[10], hash[11], hash[12], hash[13], hash[14], hash[15],
        ];

        RouteHash {
            multiplier: u64::from_le_bytes(multiplier) | 1,
            addend: u64::from_le_bytes(addend),
        }
    }

    /// Returns the worker in `[0, workers)` for `key_hash`.
    #[inline(always)]
    pub const fn route(&self, key_hash: u64, workers: usize) -> usize {
        reduce(
            key_hash
                .wrapping_mul(self.multiplier)
                .wrapping_add(self.addend),
            workers,
        )
    }
}

#[test]
fn test_key_hash_distinguishes_embedded_nul() {
    assert_eq!(key_hash(b"a\0b"), key_hash(b"a\0b"));
    assert_ne!(key_hash(b"a\0b"), key_hash(b"a\0"));
    assert_ne!(key_hash(b""), key_hash(b"\0"));
}

// The file names of existing simple caches depend on this value.
#[test]
fn test_key_hash_is_stable() {
    // SHA-256("") starts with e3 b0 c4 42 98 fc 1c 14.
    assert_eq!(key_hash(b""), 0x141c_fc98_42c4_b0e3);
}

#[test]
fn test_route_in_range() {
    const ROUTE: RouteHash = RouteHash::new_keyed(b"test route");

    assert_eq!(ROUTE.route(12345, 0), 0);
    for workers in 1..8 {
        for i in 0..1000u64 {
            let hash = key_hash(&i.to_le_bytes());
            let worker = ROUTE.route(hash, workers);
            assert!(worker < workers);
            // Routing is a pure function of the hash.
            assert_eq!(worker, ROUTE.route(hash, workers));
        }
    }
}

#[test]
fn test_route_spreads() {
    const ROUTE: RouteHash = RouteHash::new_keyed(b"test route");

    let mut counts = [0usize; 4];
    for i in 0..4000u64 {
        counts[ROUTE.route(key_hash(&i.to_le_bytes()), 4)] += 1;
    }

    // Each worker should see roughly a quarter of the keys.
    for count in counts.iter() {
        assert!(*count > 700, "{:?}", counts);
    }
}
