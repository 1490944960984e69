//! `HashIndexTable` — a lock-free open-addressed index from items to spatial
//! buckets, rebuilt from scratch every simulation tick.
//!
//! Design goals:
//! - Fixed backing storage: buckets and next-links are allocated once at the
//!   maximum capacity; per-tick resizes only move the logical extent.
//! - Concurrent `put` with no per-item locking: a CAS claims an empty bucket,
//!   an atomic exchange pushes onto an existing chain.
//! - Two-level placement: the bucket array is divided into splits, each probed
//!   within a small scan budget under an independently rehashed seed, bounding
//!   worst-case probe length before the full-table fallback.
//! - Relaxed atomics throughout. The phase barrier in the worker pool is the
//!   sole cross-stage synchronization point; no chain is ever read while a
//!   build stage is still in flight.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

/// Reserved bucket-head value meaning "no chain here".
pub const EMPTY: i32 = -1;

/// Capacity inflation over the next power of two of the item count.
const INFLATION_LOG2: u32 = 1;

/// Number of splits for two-level placement.
const SPLIT_COUNT_LOG2: u32 = 2;
const SPLIT_COUNT: usize = 1 << SPLIT_COUNT_LOG2;

/// Probe budget inside a single split before moving to the next one.
const SPLIT_SCAN_LIMIT: usize = 16;

/// Below this logical capacity the split machinery is pure overhead; tiny
/// tables go straight to the full-table probe.
const MIN_SPLIT_CAPACITY: usize = 256;

/// Per-split seed rehash: `h = h * C1 + (h >> 17)`.
const REHASH_MUL: u32 = 0x9E37_79B9;

/// Hash/equality oracle over opaque item indices.
///
/// Implementations must be pure functions of item state that is immutable for
/// the duration of a build stage, and must be callable from any worker thread
/// without further synchronization.
pub trait ItemClass: Sync {
    fn hash(&self, item: u32) -> u32;
    fn equals(&self, a: u32, b: u32) -> bool;
}

/// One open-addressed slot: atomic chain head plus chain length.
///
/// `head == EMPTY` means unused. `count` only ever increments between resets.
pub struct Bucket {
    head: AtomicI32,
    count: AtomicI32,
}

impl Bucket {
    fn new() -> Self {
        Self {
            head: AtomicI32::new(EMPTY),
            count: AtomicI32::new(0),
        }
    }

    /// Chain head item index, or `EMPTY`.
    #[inline(always)]
    pub fn head(&self) -> i32 {
        self.head.load(Ordering::Relaxed)
    }

    /// Number of items reachable from `head`.
    #[inline(always)]
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn clear(&self) {
        self.head.store(EMPTY, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

/// Outcome of a single `put`.
///
/// `bucket` is `Some` only when the item claimed a previously empty bucket —
/// callers use that to record the bucket as touched. Joining an existing
/// chain yields `None`. `scans == -1` reports probe exhaustion (spec'd
/// precondition violation, surfaced rather than silently dropped).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutResult {
    pub bucket: Option<u32>,
    pub scans: i32,
}

impl PutResult {
    const FAILED: Self = Self {
        bucket: None,
        scans: -1,
    };

    /// True when the probe sequence was exhausted and the item was dropped.
    #[inline(always)]
    pub fn overflowed(&self) -> bool {
        self.scans < 0
    }
}

enum SlotProbe {
    Claimed,
    Joined,
    Miss,
}

pub struct HashIndexTable<C: ItemClass> {
    class: C,
    /// Sized to `max_capacity` once; the logical view below masks into it.
    buckets: Box<[Bucket]>,
    /// One link per item slot. Chain end is the self-loop `next[i] == i`.
    next_link: Box<[AtomicI32]>,
    max_item_count: usize,
    max_capacity: usize,
    /// Logical view for the current tick. Written only by `reset_size`
    /// between stages; relaxed is sound because the barrier publishes.
    capacity: AtomicUsize,
    mask: AtomicU32,
    shift: AtomicU32,
    object_count: AtomicUsize,
}

impl<C: ItemClass> HashIndexTable<C> {
    pub fn new(max_item_count: usize, class: C) -> Self {
        assert!(max_item_count > 0, "HashIndexTable needs room for items");
        assert!(
            max_item_count <= i32::MAX as usize,
            "item indices must fit in i32 (EMPTY is -1)"
        );
        let max_capacity = max_item_count.next_power_of_two() << INFLATION_LOG2;
        let buckets = (0..max_capacity)
            .map(|_| Bucket::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let next_link = (0..max_item_count)
            .map(|_| AtomicI32::new(EMPTY))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let table = Self {
            class,
            buckets,
            next_link,
            max_item_count,
            max_capacity,
            capacity: AtomicUsize::new(0),
            mask: AtomicU32::new(0),
            shift: AtomicU32::new(0),
            object_count: AtomicUsize::new(0),
        };
        table.reset_size(max_item_count);
        table
    }

    /// Adjust the logical extent for `new_object_count` items.
    ///
    /// Must only run while no `put`/`get` stage is in flight; the phase
    /// barrier, not this table, enforces that.
    pub fn reset_size(&self, new_object_count: usize) {
        let n = new_object_count.min(self.max_item_count);
        let capacity = self
            .max_capacity
            .min(n.max(1).next_power_of_two() << INFLATION_LOG2);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.mask.store(capacity as u32 - 1, Ordering::Relaxed);
        self.shift
            .store(capacity.trailing_zeros(), Ordering::Relaxed);
        self.object_count.store(n, Ordering::Relaxed);
    }

    /// Number of logical buckets in the current view.
    #[inline(always)]
    pub fn bucket_count(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed) as u32
    }

    #[inline(always)]
    pub fn object_count(&self) -> u32 {
        self.object_count.load(Ordering::Relaxed) as u32
    }

    #[inline(always)]
    pub fn max_item_count(&self) -> usize {
        self.max_item_count
    }

    #[inline(always)]
    pub fn bucket_at(&self, index: u32) -> &Bucket {
        &self.buckets[index as usize]
    }

    #[inline(always)]
    pub fn class(&self) -> &C {
        &self.class
    }

    /// Clear bucket headers in `[start, end)`. Ranges are partitioned across
    /// workers by the caller; no two workers touch the same index in a stage.
    pub fn reset_range(&self, start: usize, end: usize) {
        debug_assert!(end <= self.capacity.load(Ordering::Relaxed));
        for bucket in &self.buckets[start..end] {
            bucket.clear();
        }
    }

    /// Fold high hash bits into the bucket index before masking.
    #[inline(always)]
    fn hash_to_index(&self, hash: u32, shift: u32, mask: u32) -> u32 {
        (hash >> shift).wrapping_add(hash) & mask
    }

    #[inline(always)]
    fn rehash(hash: u32) -> u32 {
        hash.wrapping_mul(REHASH_MUL).wrapping_add(hash >> 17)
    }

    /// Probe one slot.
    ///
    /// The head observed on a failed CAS (or an occupied slot) may belong to a
    /// still-in-flight insert by another thread. That read is intentionally
    /// optimistic: the value is only ever fed to `equals` as an identity, never
    /// dereferenced as a pointer or walked as a chain. Do not "fix" this with
    /// extra synchronization.
    #[inline(always)]
    fn try_slot(&self, index: u32, item: u32) -> SlotProbe {
        let bucket = &self.buckets[index as usize];
        let mut head = bucket.head.load(Ordering::Relaxed);
        if head == EMPTY {
            match bucket.head.compare_exchange(
                EMPTY,
                item as i32,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Single-element chain: the self-loop is the terminator.
                    self.next_link[item as usize].store(item as i32, Ordering::Relaxed);
                    bucket.count.fetch_add(1, Ordering::Relaxed);
                    return SlotProbe::Claimed;
                }
                Err(current) => head = current,
            }
        }
        if self.class.equals(head as u32, item) {
            // Lock-free stack push onto the existing chain.
            let old = bucket.head.swap(item as i32, Ordering::Relaxed);
            self.next_link[item as usize].store(old, Ordering::Relaxed);
            bucket.count.fetch_add(1, Ordering::Relaxed);
            return SlotProbe::Joined;
        }
        SlotProbe::Miss
    }

    /// Insert `item` into the bucket of its equality class.
    ///
    /// Concurrency contract: many threads may `put` concurrently, but never
    /// two threads for the same item index, and never concurrently with
    /// `reset_size`/`reset_range` — the phase barrier excludes both.
    pub fn put(&self, item: u32) -> PutResult {
        debug_assert!((item as usize) < self.max_item_count);
        let seed = self.class.hash(item);
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mask = self.mask.load(Ordering::Relaxed);
        let shift = self.shift.load(Ordering::Relaxed);
        let mut scans = 0i32;

        if capacity >= MIN_SPLIT_CAPACITY {
            let split_len = (capacity >> SPLIT_COUNT_LOG2) as u32;
            let split_mask = split_len - 1;
            let split_shift = shift - SPLIT_COUNT_LOG2;
            let mut hash = seed;
            for split in 0..SPLIT_COUNT as u32 {
                hash = Self::rehash(hash);
                let base = split * split_len;
                let start = self.hash_to_index(hash, split_shift, split_mask);
                let budget = SPLIT_SCAN_LIMIT.min(split_len as usize);
                for step in 0..budget as u32 {
                    let index = base + ((start + step) & split_mask);
                    scans += 1;
                    match self.try_slot(index, item) {
                        SlotProbe::Claimed => {
                            return PutResult {
                                bucket: Some(index),
                                scans,
                            };
                        }
                        SlotProbe::Joined => {
                            return PutResult {
                                bucket: None,
                                scans,
                            };
                        }
                        SlotProbe::Miss => {}
                    }
                }
            }
        }

        // Unrestricted fallback probe over the whole logical table, seeded by
        // the original hash so `get` can retrace the same sequence.
        let start = self.hash_to_index(seed, shift, mask);
        for step in 0..capacity as u32 {
            let index = (start + step) & mask;
            scans += 1;
            match self.try_slot(index, item) {
                SlotProbe::Claimed => {
                    return PutResult {
                        bucket: Some(index),
                        scans,
                    };
                }
                SlotProbe::Joined => {
                    return PutResult {
                        bucket: None,
                        scans,
                    };
                }
                SlotProbe::Miss => {}
            }
        }
        // Probe sequence exhausted: capacity was sized wrong for the
        // configured inflation. Surfaced, never silently dropped.
        PutResult::FAILED
    }

    /// Find the bucket holding `item`'s equality class, read-only.
    ///
    /// An empty slot anywhere along the probe sequence proves absence, because
    /// insertion always fills a contiguous prefix of the same sequence.
    pub fn get(&self, item: u32) -> Option<u32> {
        let seed = self.class.hash(item);
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mask = self.mask.load(Ordering::Relaxed);
        let shift = self.shift.load(Ordering::Relaxed);

        if capacity >= MIN_SPLIT_CAPACITY {
            let split_len = (capacity >> SPLIT_COUNT_LOG2) as u32;
            let split_mask = split_len - 1;
            let split_shift = shift - SPLIT_COUNT_LOG2;
            let mut hash = seed;
            for split in 0..SPLIT_COUNT as u32 {
                hash = Self::rehash(hash);
                let base = split * split_len;
                let start = self.hash_to_index(hash, split_shift, split_mask);
                let budget = SPLIT_SCAN_LIMIT.min(split_len as usize);
                for step in 0..budget as u32 {
                    let index = base + ((start + step) & split_mask);
                    let head = self.buckets[index as usize].head();
                    if head == EMPTY {
                        return None;
                    }
                    if self.class.equals(head as u32, item) {
                        return Some(index);
                    }
                }
            }
        }

        let start = self.hash_to_index(seed, shift, mask);
        for step in 0..capacity as u32 {
            let index = (start + step) & mask;
            let head = self.buckets[index as usize].head();
            if head == EMPTY {
                return None;
            }
            if self.class.equals(head as u32, item) {
                return Some(index);
            }
        }
        None
    }

    /// Iterate the item indices chained under `bucket`, head first.
    ///
    /// Only valid after the build stage's barrier and before the next reset.
    #[inline]
    pub fn chain(&self, bucket: u32) -> ChainIter<'_, C> {
        ChainIter {
            table: self,
            cur: self.buckets[bucket as usize].head(),
        }
    }
}

pub struct ChainIter<'a, C: ItemClass> {
    table: &'a HashIndexTable<C>,
    cur: i32,
}

impl<C: ItemClass> Iterator for ChainIter<'_, C> {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        if self.cur == EMPTY {
            return None;
        }
        let item = self.cur as u32;
        let next = self.table.next_link[item as usize].load(Ordering::Relaxed);
        self.cur = if next == self.cur { EMPTY } else { next };
        Some(item)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Identity classes: each item is its own equality class.
    struct Identity;

    impl ItemClass for Identity {
        fn hash(&self, item: u32) -> u32 {
            item
        }
        fn equals(&self, a: u32, b: u32) -> bool {
            a == b
        }
    }

    /// Groups items into classes of `group` consecutive indices.
    struct Grouped {
        group: u32,
    }

    impl ItemClass for Grouped {
        fn hash(&self, item: u32) -> u32 {
            item / self.group
        }
        fn equals(&self, a: u32, b: u32) -> bool {
            a / self.group == b / self.group
        }
    }

    /// Everything collides on the initial probe index, nothing is equal.
    struct AllCollide;

    impl ItemClass for AllCollide {
        fn hash(&self, _item: u32) -> u32 {
            0
        }
        fn equals(&self, a: u32, b: u32) -> bool {
            a == b
        }
    }

    fn reset_all(table: &HashIndexTable<impl ItemClass>, n: usize) {
        table.reset_size(n);
        table.reset_range(0, table.bucket_count() as usize);
    }

    #[test]
    fn reset_size_follows_pow2_inflation() {
        let table = HashIndexTable::new(64, Identity);
        table.reset_size(17);
        // next_pow2(17) = 32, inflation 2 -> 64 buckets, mask 63, log2 6.
        assert_eq!(table.bucket_count(), 64);
        assert_eq!(table.mask.load(Ordering::Relaxed), 63);
        assert_eq!(table.shift.load(Ordering::Relaxed), 6);
        assert_eq!(table.object_count(), 17);
    }

    #[test]
    fn reset_size_clamps_to_max() {
        let table = HashIndexTable::new(16, Identity);
        assert_eq!(table.max_capacity, 32);
        table.reset_size(10_000);
        assert_eq!(table.bucket_count(), 32);
        assert_eq!(table.object_count(), 16);
    }

    #[test]
    fn distinct_hashes_claim_distinct_buckets_first_scan() {
        let table = HashIndexTable::new(4, Identity);
        reset_all(&table, 3);
        assert_eq!(table.bucket_count(), 8);

        let mut claimed = Vec::new();
        for item in 0..3 {
            let result = table.put(item);
            assert_eq!(result.scans, 1, "no collision expected for item {item}");
            let bucket = result.bucket.expect("fresh bucket must be claimed");
            claimed.push(bucket);
        }
        claimed.sort_unstable();
        claimed.dedup();
        assert_eq!(claimed.len(), 3, "claimed buckets must be distinct");
    }

    #[test]
    fn true_collision_takes_extra_scans() {
        let table = HashIndexTable::new(8, AllCollide);
        reset_all(&table, 2);

        let first = table.put(0);
        assert_eq!(first.scans, 1);
        assert!(first.bucket.is_some());

        // Same initial probe index, not equal: must keep scanning.
        let second = table.put(1);
        assert!(second.scans >= 2, "collision must probe past the first slot");
        assert!(second.bucket.is_some());
        assert_ne!(first.bucket, second.bucket);
    }

    #[test]
    fn equal_items_share_one_chain() {
        let table = HashIndexTable::new(32, Grouped { group: 4 });
        reset_all(&table, 8);

        let first = table.put(0);
        assert!(first.bucket.is_some());
        for item in 1..4 {
            let joined = table.put(item);
            assert_eq!(joined.bucket, None, "item {item} must join, not claim");
        }

        let bucket = first.bucket.unwrap();
        assert_eq!(table.bucket_at(bucket).count(), 4);
        let mut members: Vec<u32> = table.chain(bucket).collect();
        members.sort_unstable();
        assert_eq!(members, vec![0, 1, 2, 3]);
    }

    #[test]
    fn get_finds_inserted_and_rejects_absent() {
        let table = HashIndexTable::new(64, Grouped { group: 8 });
        reset_all(&table, 40);
        for item in 0..24 {
            assert!(!table.put(item).overflowed());
        }
        for item in 0..24 {
            let bucket = table.get(item).expect("inserted item must be found");
            assert!(table.chain(bucket).any(|member| member == item));
        }
        // Classes 3 and 4 were never inserted.
        assert_eq!(table.get(30), None);
        assert_eq!(table.get(39), None);
    }

    #[test]
    fn single_element_chain_self_loops() {
        let table = HashIndexTable::new(8, Identity);
        reset_all(&table, 1);
        let result = table.put(0);
        let bucket = result.bucket.unwrap();
        assert_eq!(table.next_link[0].load(Ordering::Relaxed), 0);
        let members: Vec<u32> = table.chain(bucket).collect();
        assert_eq!(members, vec![0]);
    }

    #[test]
    fn probe_exhaustion_reports_overflow_sentinel() {
        // 2 items -> 4 logical buckets, but insert colliding non-equal items
        // far past the sizing contract by resetting the extent down.
        let table = HashIndexTable::new(8, AllCollide);
        table.reset_size(2);
        table.reset_range(0, table.bucket_count() as usize);
        assert_eq!(table.bucket_count(), 4);

        for item in 0..4 {
            assert!(!table.put(item).overflowed());
        }
        let overflow = table.put(4);
        assert!(overflow.overflowed());
        assert_eq!(overflow, PutResult::FAILED);
    }

    #[test]
    fn split_placement_keeps_grouping_at_large_capacity() {
        // Large enough to engage the split path.
        let table = HashIndexTable::new(4096, Grouped { group: 16 });
        reset_all(&table, 4096);
        assert!(table.bucket_count() as usize >= MIN_SPLIT_CAPACITY);

        for item in 0..4096 {
            assert!(!table.put(item).overflowed(), "item {item} overflowed");
        }
        let mut total = 0i64;
        for index in 0..table.bucket_count() {
            let count = table.bucket_at(index).count();
            if count > 0 {
                // Every chain member must share the head's class.
                let head = table.bucket_at(index).head() as u32;
                for member in table.chain(index) {
                    assert!(table.class().equals(head, member));
                }
            }
            total += i64::from(count);
        }
        assert_eq!(total, 4096);
    }

    #[test]
    fn concurrent_puts_cover_every_item_exactly_once() {
        let table = HashIndexTable::new(8192, Grouped { group: 32 });
        reset_all(&table, 8192);

        let workers = 8;
        std::thread::scope(|scope| {
            for id in 0..workers {
                let table = &table;
                scope.spawn(move || {
                    let start = 8192 * id / workers;
                    let end = 8192 * (id + 1) / workers;
                    for item in start..end {
                        assert!(!table.put(item as u32).overflowed());
                    }
                });
            }
        });

        let mut seen = vec![false; 8192];
        let mut total = 0usize;
        for index in 0..table.bucket_count() {
            let mut chain_len = 0;
            for member in table.chain(index) {
                assert!(!seen[member as usize], "item {member} in two chains");
                seen[member as usize] = true;
                chain_len += 1;
            }
            assert_eq!(
                chain_len,
                table.bucket_at(index).count(),
                "bucket {index} count out of sync with its chain"
            );
            total += chain_len as usize;
        }
        assert_eq!(total, 8192);
        assert!(seen.iter().all(|&s| s));
    }
}
