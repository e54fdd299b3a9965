//! Minimal perfect hashing by hash-and-displace.
//!
//! Keys are split into `ceil(n / lambda)` buckets by one part of their hash.
//! Buckets are placed largest first: each searches for a displacement pair
//! `(d1, d2)` such that `(f2 + f1 * d1 + d2) mod n` sends all of its keys to
//! distinct free slots. The pair is stored per bucket, so a lookup costs one
//! hash, one displacement read and one modulo, with no probing.

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;
use xxhash_rust::xxh3::{xxh3_64_with_seed, xxh3_128_with_seed};

use crate::config::BuildConfig;
use crate::format::Displacement;

const FINGERPRINT_SEED: u64 = 0x4650_5249_4E54_2121;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhfError {
    #[error("key {key} was written twice (objects #{first} and #{second})")]
    DuplicateKey {
        key: String,
        first: usize,
        second: usize,
    },

    #[error("no perfect hash found for {keys} keys after {attempts} seeds")]
    Unresolvable { keys: usize, attempts: u32 },
}

/// Seed-independent 64-bit digest stored next to each slot, so absent keys
/// can be told apart from a corrupted key table.
pub fn fingerprint(key: &[u8]) -> u64 {
    xxh3_64_with_seed(key, FINGERPRINT_SEED)
}

pub fn bucket_count(object_count: usize, lambda: usize) -> usize {
    object_count.div_ceil(lambda.max(1))
}

#[derive(Debug, Clone, Copy)]
struct KeyHashes {
    g: u64,
    f1: u64,
    f2: u64,
}

impl KeyHashes {
    fn new(key: &[u8], seed: u64) -> Self {
        let h = xxh3_128_with_seed(key, seed);
        let lo = h as u64;
        Self {
            g: (h >> 64) as u64,
            f1: lo & 0xFFFF_FFFF,
            f2: lo >> 32,
        }
    }

    fn bucket(&self, bucket_count: usize) -> usize {
        (self.g % bucket_count as u64) as usize
    }

    fn reduced(&self, n: u64) -> (u64, u64) {
        (self.f1 % n, self.f2 % n)
    }
}

// f1, f2, d1, d2 are all below n <= u32::MAX, so this cannot overflow u64
#[inline]
fn displace((f1, f2): (u64, u64), d: Displacement, n: u64) -> usize {
    ((f2 + f1 * d.d1 as u64 + d.d2 as u64) % n) as usize
}

/// Slot of `key` in a table of `n` slots, or `None` for an empty table.
pub fn slot_of(key: &[u8], seed: u64, displacements: &[Displacement], n: usize) -> Option<usize> {
    if n == 0 || displacements.is_empty() {
        return None;
    }
    let hashes = KeyHashes::new(key, seed);
    let d = displacements[hashes.bucket(displacements.len())];
    Some(displace(hashes.reduced(n as u64), d, n as u64))
}

/// A constructed table: `slots[i]` is the index of the key placed in slot `i`.
#[derive(Debug, Clone)]
pub struct PerfectHash {
    pub seed: u64,
    pub displacements: Vec<Displacement>,
    pub slots: Vec<u32>,
    pub attempts: u32,
}

pub fn build<const K: usize>(
    keys: &[[u8; K]],
    config: &BuildConfig,
) -> Result<PerfectHash, PhfError> {
    check_duplicates(keys)?;

    let buckets = bucket_count(keys.len(), config.lambda());
    let attempts = config.max_seed_attempts.max(1);
    for attempt in 0..attempts {
        let seed = config.seed_for_attempt(attempt);
        if let Some((displacements, slots)) = try_build(keys, seed, buckets) {
            return Ok(PerfectHash {
                seed,
                displacements,
                slots,
                attempts: attempt + 1,
            });
        }
        trace!(attempt, seed, keys = keys.len(), "perfect hash attempt failed");
    }

    Err(PhfError::Unresolvable {
        keys: keys.len(),
        attempts,
    })
}

fn check_duplicates<const K: usize>(keys: &[[u8; K]]) -> Result<(), PhfError> {
    let mut seen: FxHashMap<&[u8; K], usize> =
        FxHashMap::with_capacity_and_hasher(keys.len(), Default::default());
    for (i, key) in keys.iter().enumerate() {
        if let Some(first) = seen.insert(key, i) {
            return Err(PhfError::DuplicateKey {
                key: to_hex(key),
                first,
                second: i,
            });
        }
    }
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct Bucket {
    idx: usize,
    keys: Vec<usize>,
}

fn try_build<const K: usize>(
    keys: &[[u8; K]],
    seed: u64,
    bucket_count: usize,
) -> Option<(Vec<Displacement>, Vec<u32>)> {
    let n = keys.len();
    if n == 0 {
        return Some((Vec::new(), Vec::new()));
    }
    let n64 = n as u64;

    let mut buckets: Vec<Bucket> = (0..bucket_count)
        .map(|idx| Bucket {
            idx,
            keys: Vec::new(),
        })
        .collect();
    let mut reduced = Vec::with_capacity(n);
    for (i, key) in keys.iter().enumerate() {
        let hashes = KeyHashes::new(key, seed);
        buckets[hashes.bucket(bucket_count)].keys.push(i);
        reduced.push(hashes.reduced(n64));
    }
    // stable, so equal-sized buckets keep a deterministic order
    buckets.sort_by(|a, b| b.keys.len().cmp(&a.keys.len()));

    let mut map: Vec<Option<u32>> = vec![None; n];
    let mut displacements = vec![Displacement::default(); bucket_count];
    // generation markers avoid clearing a scratch table for every candidate pair
    let mut try_map = vec![0u64; n];
    let mut generation = 0u64;
    let mut values_to_add = Vec::new();

    'buckets: for bucket in &buckets {
        if bucket.keys.is_empty() {
            break;
        }
        if has_inseparable_pair(&bucket.keys, &reduced) {
            return None;
        }

        for d1 in 0..n64 {
            'disps: for d2 in 0..n64 {
                values_to_add.clear();
                generation += 1;
                let d = Displacement {
                    d1: d1 as u32,
                    d2: d2 as u32,
                };

                for &key in &bucket.keys {
                    let idx = displace(reduced[key], d, n64);
                    if map[idx].is_some() || try_map[idx] == generation {
                        continue 'disps;
                    }
                    try_map[idx] = generation;
                    values_to_add.push((idx, key));
                }

                displacements[bucket.idx] = d;
                for &(idx, key) in &values_to_add {
                    map[idx] = Some(key as u32);
                }
                continue 'buckets;
            }
        }

        return None;
    }

    let slots = map.into_iter().collect::<Option<Vec<u32>>>()?;
    Some((displacements, slots))
}

// Two keys with equal reduced hashes land on the same slot for every (d1, d2).
fn has_inseparable_pair(bucket: &[usize], reduced: &[(u64, u64)]) -> bool {
    bucket.iter().enumerate().any(|(i, &a)| {
        bucket[i + 1..]
            .iter()
            .any(|&b| reduced[a] == reduced[b])
    })
}
