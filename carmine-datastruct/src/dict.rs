//! Striped concurrent map with ordered multi-key locking.
//!
//! The dict is a fixed array of buckets, each owning a plain hash map
//! behind its own reader/writer lock. A key's bucket is
//! `fnv32(key) & (N - 1)` where `N` is the smallest power of two at or
//! above the configured hint (floor 16).
//!
//! Point operations come in two flavours: the self-locking methods on
//! [`ConcurrentDict`], and the externally-locked methods on [`LockSet`]
//! for callers that already acquired a multi-key footprint through
//! [`ConcurrentDict::rw_locks`]. Lock sets acquire bucket locks in
//! ascending bucket order and release them in descending order, which
//! gives every concurrent caller the same global order and rules out
//! lock-cycle deadlocks. A bucket named by both a write key and a read
//! key is locked exactly once, for writing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use hashbrown::{HashMap, HashSet};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use rand::Rng;

use carmine_common::hash::fnv32;

type Bucket<V> = Arc<RwLock<HashMap<String, V>>>;

/// Concurrency-safe striped map over string keys.
#[derive(Debug)]
pub struct ConcurrentDict<V> {
    buckets: Arc<Vec<Bucket<V>>>,
    count: Arc<AtomicI64>,
    mask: u32,
}

impl<V> Clone for ConcurrentDict<V> {
    fn clone(&self) -> Self {
        Self {
            buckets: Arc::clone(&self.buckets),
            count: Arc::clone(&self.count),
            mask: self.mask,
        }
    }
}

/// Rounds the stripe hint up to a power of two, floor 16.
fn compute_capacity(hint: usize) -> usize {
    if hint <= 16 {
        return 16;
    }
    hint.next_power_of_two()
}

impl<V> Default for ConcurrentDict<V> {
    fn default() -> Self {
        Self::new(16)
    }
}

impl<V> ConcurrentDict<V> {
    /// Creates a dict with at least `bucket_hint` stripes.
    #[must_use]
    pub fn new(bucket_hint: usize) -> Self {
        let capacity = compute_capacity(bucket_hint);
        let buckets = (0..capacity)
            .map(|_| Arc::new(RwLock::new(HashMap::new())))
            .collect::<Vec<_>>();
        Self {
            buckets: Arc::new(buckets),
            count: Arc::new(AtomicI64::new(0)),
            mask: u32::try_from(capacity - 1).unwrap_or(u32::MAX),
        }
    }

    /// Returns the stripe count.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the bucket index owning `key`.
    #[must_use]
    pub fn bucket_index(&self, key: &str) -> u32 {
        fnv32(key.as_bytes()) & self.mask
    }

    fn bucket(&self, key: &str) -> &Bucket<V> {
        &self.buckets[self.bucket_index(key) as usize]
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::try_from(self.count.load(Ordering::Acquire).max(0)).unwrap_or(0)
    }

    /// Returns whether the dict is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Self-locking point read.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.bucket(key).read().get(key).cloned()
    }

    /// Self-locking membership test.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.bucket(key).read().contains_key(key)
    }

    /// Self-locking upsert. Returns 1 when the key was newly inserted.
    pub fn put(&self, key: &str, value: V) -> usize {
        let mut bucket = self.bucket(key).write();
        if bucket.insert(key.to_owned(), value).is_none() {
            let _ = self.count.fetch_add(1, Ordering::AcqRel);
            1
        } else {
            0
        }
    }

    /// Self-locking insert-if-missing. Returns 1 when the value was stored.
    pub fn put_if_absent(&self, key: &str, value: V) -> usize {
        let mut bucket = self.bucket(key).write();
        if bucket.contains_key(key) {
            return 0;
        }
        let _ = bucket.insert(key.to_owned(), value);
        let _ = self.count.fetch_add(1, Ordering::AcqRel);
        1
    }

    /// Self-locking overwrite-if-present. Returns 1 when the value was stored.
    pub fn put_if_exists(&self, key: &str, value: V) -> usize {
        let mut bucket = self.bucket(key).write();
        match bucket.get_mut(key) {
            Some(slot) => {
                *slot = value;
                1
            }
            None => 0,
        }
    }

    /// Self-locking removal.
    pub fn remove(&self, key: &str) -> Option<V> {
        let removed = self.bucket(key).write().remove(key);
        if removed.is_some() {
            let _ = self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Visits every entry until the visitor returns `false`.
    ///
    /// Buckets are visited one at a time under their read lock; entries
    /// inserted or removed concurrently in unvisited buckets may or may
    /// not be observed.
    pub fn for_each(&self, mut visitor: impl FnMut(&str, &V) -> bool) {
        for bucket in self.buckets.iter() {
            let guard = bucket.read();
            for (key, value) in guard.iter() {
                if !visitor(key, value) {
                    return;
                }
            }
        }
    }

    /// Returns every key.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.to_owned());
            true
        });
        keys
    }

    /// Samples `n` keys with replacement.
    #[must_use]
    pub fn random_keys(&self, n: usize) -> Vec<String> {
        if n >= self.len() {
            return self.keys();
        }
        let mut rng = rand::thread_rng();
        let mut keys = Vec::with_capacity(n);
        while keys.len() < n {
            let bucket = &self.buckets[rng.gen_range(0..self.buckets.len())];
            if let Some(key) = random_bucket_key(bucket, &mut rng) {
                keys.push(key);
            }
        }
        keys
    }

    /// Samples `n` distinct keys.
    #[must_use]
    pub fn random_distinct_keys(&self, n: usize) -> Vec<String> {
        if n >= self.len() {
            return self.keys();
        }
        let mut rng = rand::thread_rng();
        let mut seen = HashSet::with_capacity(n);
        while seen.len() < n {
            let bucket = &self.buckets[rng.gen_range(0..self.buckets.len())];
            if let Some(key) = random_bucket_key(bucket, &mut rng) {
                let _ = seen.insert(key);
            }
        }
        seen.into_iter().collect()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            let mut guard = bucket.write();
            let removed = i64::try_from(guard.len()).unwrap_or(i64::MAX);
            guard.clear();
            let _ = self.count.fetch_sub(removed, Ordering::AcqRel);
        }
    }

    /// Acquires the lock footprint for a command's write and read keys.
    ///
    /// Both slices may contain duplicates and may overlap; every touched
    /// bucket is locked exactly once, in ascending bucket order, for
    /// writing when any write key maps to it and for reading otherwise.
    /// Dropping the returned [`LockSet`] releases the buckets in
    /// descending order.
    #[must_use]
    pub fn rw_locks(&self, write_keys: &[String], read_keys: &[String]) -> LockSet<V> {
        let mut indices = BTreeSet::new();
        let mut write_indices = HashSet::new();
        for key in write_keys {
            let index = self.bucket_index(key);
            let _ = indices.insert(index);
            let _ = write_indices.insert(index);
        }
        for key in read_keys {
            let _ = indices.insert(self.bucket_index(key));
        }

        let mut guards = Vec::with_capacity(indices.len());
        for index in indices {
            let bucket = &self.buckets[index as usize];
            let guard = if write_indices.contains(&index) {
                BucketGuard::Write(RwLock::write_arc(bucket))
            } else {
                BucketGuard::Read(RwLock::read_arc(bucket))
            };
            guards.push((index, guard));
        }
        LockSet {
            mask: self.mask,
            count: Arc::clone(&self.count),
            guards,
        }
    }
}

fn random_bucket_key<V>(bucket: &Bucket<V>, rng: &mut impl Rng) -> Option<String> {
    let guard = bucket.read();
    if guard.is_empty() {
        return None;
    }
    let skip = rng.gen_range(0..guard.len());
    guard.keys().nth(skip).cloned()
}

enum BucketGuard<V> {
    Read(ArcRwLockReadGuard<RawRwLock, HashMap<String, V>>),
    Write(ArcRwLockWriteGuard<RawRwLock, HashMap<String, V>>),
}

impl<V> BucketGuard<V> {
    fn map(&self) -> &HashMap<String, V> {
        match self {
            Self::Read(guard) => guard,
            Self::Write(guard) => guard,
        }
    }
}

/// A held multi-key lock footprint over one dict.
///
/// Grants the "caller already holds the bucket lock" flavour of the point
/// operations. Accessing a key whose bucket is not part of the footprint
/// is a command-table bug; it panics and the dispatcher's panic boundary
/// turns it into an error reply without leaking locks.
pub struct LockSet<V> {
    mask: u32,
    count: Arc<AtomicI64>,
    /// Held guards, ascending by bucket index.
    guards: Vec<(u32, BucketGuard<V>)>,
}

impl<V> LockSet<V> {
    fn slot(&self, key: &str) -> usize {
        let index = fnv32(key.as_bytes()) & self.mask;
        self.guards
            .binary_search_by_key(&index, |(bucket_index, _)| *bucket_index)
            .unwrap_or_else(|_| {
                panic!("key '{key}' accessed outside its declared lock footprint")
            })
    }

    /// Point read under the held locks.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        self.guards[self.slot(key)].1.map().get(key)
    }

    /// Membership test under the held locks.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.guards[self.slot(key)].1.map().contains_key(key)
    }

    /// Mutable point access; the key's bucket must be write-locked.
    #[must_use]
    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        let slot = self.slot(key);
        match &mut self.guards[slot].1 {
            BucketGuard::Write(guard) => guard.get_mut(key),
            BucketGuard::Read(_) => {
                panic!("key '{key}' mutated through a read-locked bucket")
            }
        }
    }

    fn write_map(&mut self, key: &str) -> &mut HashMap<String, V> {
        let slot = self.slot(key);
        match &mut self.guards[slot].1 {
            BucketGuard::Write(guard) => guard,
            BucketGuard::Read(_) => {
                panic!("key '{key}' mutated through a read-locked bucket")
            }
        }
    }

    /// Upsert under the held locks. Returns 1 when the key was new.
    pub fn put(&mut self, key: &str, value: V) -> usize {
        let inserted = self.write_map(key).insert(key.to_owned(), value).is_none();
        if inserted {
            let _ = self.count.fetch_add(1, Ordering::AcqRel);
            1
        } else {
            0
        }
    }

    /// Insert-if-missing under the held locks.
    pub fn put_if_absent(&mut self, key: &str, value: V) -> usize {
        let map = self.write_map(key);
        if map.contains_key(key) {
            return 0;
        }
        let _ = map.insert(key.to_owned(), value);
        let _ = self.count.fetch_add(1, Ordering::AcqRel);
        1
    }

    /// Overwrite-if-present under the held locks.
    pub fn put_if_exists(&mut self, key: &str, value: V) -> usize {
        match self.write_map(key).get_mut(key) {
            Some(slot) => {
                *slot = value;
                1
            }
            None => 0,
        }
    }

    /// Removal under the held locks.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.write_map(key).remove(key);
        if removed.is_some() {
            let _ = self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }
}

impl<V> Drop for LockSet<V> {
    fn drop(&mut self) {
        // Release in descending bucket order, the mirror of acquisition.
        while let Some((_, guard)) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConcurrentDict, compute_capacity};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[rstest]
    #[case(0, 16)]
    #[case(16, 16)]
    #[case(17, 32)]
    #[case(65_536, 65_536)]
    #[case(65_537, 131_072)]
    fn capacity_rounds_to_power_of_two(#[case] hint: usize, #[case] expected: usize) {
        assert_that!(compute_capacity(hint), eq(expected));
    }

    #[rstest]
    fn point_ops_maintain_len() {
        let dict = ConcurrentDict::<i64>::new(16);
        assert_that!(dict.put("a", 1), eq(1_usize));
        assert_that!(dict.put("a", 2), eq(0_usize));
        assert_that!(dict.put_if_absent("a", 3), eq(0_usize));
        assert_that!(dict.put_if_exists("a", 4), eq(1_usize));
        assert_that!(dict.put_if_exists("b", 1), eq(0_usize));
        assert_that!(dict.len(), eq(1_usize));
        assert_that!(dict.get("a"), some(eq(4_i64)));
        assert_that!(dict.remove("a"), some(eq(4_i64)));
        assert_that!(dict.remove("a"), none());
        assert_that!(dict.len(), eq(0_usize));
    }

    #[rstest]
    fn concurrent_inserts_count_exactly() {
        let dict = Arc::new(ConcurrentDict::<usize>::new(64));
        let mut handles = Vec::new();
        for worker in 0..8_usize {
            let dict = Arc::clone(&dict);
            handles.push(thread::spawn(move || {
                for i in 0..500_usize {
                    let _ = dict.put(&format!("k-{worker}-{i}"), i);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("insert worker must not panic");
        }
        assert_that!(dict.len(), eq(4_000_usize));
    }

    #[rstest]
    fn lock_set_grants_point_access() {
        let dict = ConcurrentDict::<i64>::new(16);
        let _ = dict.put("seed", 10);

        let write_keys = vec!["seed".to_owned(), "fresh".to_owned()];
        let read_keys = vec!["watched".to_owned()];
        let mut locks = dict.rw_locks(&write_keys, &read_keys);

        assert_that!(locks.get("seed"), some(eq(&10_i64)));
        assert_that!(locks.get("watched"), none());
        assert_that!(locks.put("fresh", 7), eq(1_usize));
        *locks.get_mut("seed").expect("seed exists") = 11;
        drop(locks);

        assert_that!(dict.get("seed"), some(eq(11_i64)));
        assert_that!(dict.get("fresh"), some(eq(7_i64)));
        assert_that!(dict.len(), eq(2_usize));
    }

    #[rstest]
    fn overlapping_write_and_read_key_locks_once() {
        let dict = ConcurrentDict::<i64>::new(16);
        let keys = vec!["same".to_owned()];
        // A bucket named by both sets must not self-deadlock; write wins.
        let mut locks = dict.rw_locks(&keys, &keys);
        assert_that!(locks.put("same", 1), eq(1_usize));
    }

    #[rstest]
    fn duplicate_keys_in_footprint_lock_once() {
        let dict = ConcurrentDict::<i64>::new(16);
        let write_keys = vec!["dup".to_owned(), "dup".to_owned(), "dup".to_owned()];
        let mut locks = dict.rw_locks(&write_keys, &[]);
        assert_that!(locks.put("dup", 1), eq(1_usize));
    }

    /// Randomised interleaving: opposing key orders must not deadlock
    /// because lock sets sort by bucket index.
    #[rstest]
    fn opposing_multi_key_lock_orders_do_not_deadlock() {
        let dict = Arc::new(ConcurrentDict::<i64>::new(16));
        let forward: Vec<String> = (0..32).map(|i| format!("key-{i}")).collect();
        let mut backward = forward.clone();
        backward.reverse();
        let rounds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for keys in [forward, backward] {
            let dict = Arc::clone(&dict);
            let rounds = Arc::clone(&rounds);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let mut locks = dict.rw_locks(&keys, &[]);
                    for key in &keys {
                        let _ = locks.put(key, 1);
                    }
                    let _ = rounds.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("lock worker must not panic");
        }
        assert_that!(rounds.load(Ordering::Relaxed), eq(400_usize));
    }

    #[rstest]
    fn dropping_lock_set_releases_every_bucket() {
        let dict = ConcurrentDict::<i64>::new(16);
        let keys: Vec<String> = (0..64).map(|i| format!("key-{i}")).collect();
        drop(dict.rw_locks(&keys, &[]));
        // Every bucket must be free again for a full write pass.
        let mut locks = dict.rw_locks(&keys, &[]);
        for key in &keys {
            let _ = locks.put(key, 1);
        }
    }

    #[rstest]
    #[should_panic(expected = "outside its declared lock footprint")]
    fn undeclared_key_access_panics() {
        let dict = ConcurrentDict::<i64>::new(1 << 10);
        let declared = "declared".to_owned();
        let undeclared = (0..)
            .map(|i| format!("other-{i}"))
            .find(|key| dict.bucket_index(key) != dict.bucket_index(&declared))
            .expect("a key in another bucket must exist");
        let locks = dict.rw_locks(std::slice::from_ref(&declared), &[]);
        let _ = locks.get(&undeclared);
    }

    #[rstest]
    fn random_distinct_keys_returns_unique_sample() {
        let dict = ConcurrentDict::<usize>::new(16);
        for i in 0..100_usize {
            let _ = dict.put(&format!("k{i}"), i);
        }
        let sample = dict.random_distinct_keys(10);
        assert_that!(sample.len(), eq(10_usize));
        let unique: std::collections::HashSet<_> = sample.iter().collect();
        assert_that!(unique.len(), eq(10_usize));
    }
}
