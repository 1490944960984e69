//! Plain linear-probe variant of the hash-index table.
//!
//! Same external contract as `swarmgrid::HashIndexTable` — one probe sequence
//! over the whole logical table, no split placement. Kept as the simple
//! reference implementation for differential testing; the split table is the
//! production strategy.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::swarmgrid::table::{ItemClass, PutResult, EMPTY};

const INFLATION_LOG2: u32 = 1;

struct PlainBucket {
    head: AtomicI32,
    count: AtomicI32,
}

pub struct PlainIndexTable<C: ItemClass> {
    class: C,
    buckets: Box<[PlainBucket]>,
    next_link: Box<[AtomicI32]>,
    max_item_count: usize,
    max_capacity: usize,
    capacity: AtomicUsize,
    mask: AtomicU32,
    shift: AtomicU32,
    object_count: AtomicUsize,
}

impl<C: ItemClass> PlainIndexTable<C> {
    pub fn new(max_item_count: usize, class: C) -> Self {
        assert!(max_item_count > 0);
        assert!(max_item_count <= i32::MAX as usize);
        let max_capacity = max_item_count.next_power_of_two() << INFLATION_LOG2;
        let buckets = (0..max_capacity)
            .map(|_| PlainBucket {
                head: AtomicI32::new(EMPTY),
                count: AtomicI32::new(0),
            })
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

    #[inline(always)]
    pub fn bucket_count(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed) as u32
    }

    #[inline(always)]
    pub fn object_count(&self) -> u32 {
        self.object_count.load(Ordering::Relaxed) as u32
    }

    #[inline(always)]
    pub fn class(&self) -> &C {
        &self.class
    }

    #[inline(always)]
    pub fn bucket_head(&self, index: u32) -> i32 {
        self.buckets[index as usize].head.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn bucket_len(&self, index: u32) -> i32 {
        self.buckets[index as usize].count.load(Ordering::Relaxed)
    }

    pub fn reset_range(&self, start: usize, end: usize) {
        for bucket in &self.buckets[start..end] {
            bucket.head.store(EMPTY, Ordering::Relaxed);
            bucket.count.store(0, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    fn hash_to_index(&self, hash: u32) -> u32 {
        let shift = self.shift.load(Ordering::Relaxed);
        let mask = self.mask.load(Ordering::Relaxed);
        (hash >> shift).wrapping_add(hash) & mask
    }

    pub fn put(&self, item: u32) -> PutResult {
        debug_assert!((item as usize) < self.max_item_count);
        let capacity = self.capacity.load(Ordering::Relaxed) as u32;
        let mask = self.mask.load(Ordering::Relaxed);
        let start = self.hash_to_index(self.class.hash(item));
        let mut scans = 0i32;

        for step in 0..capacity {
            let index = (start + step) & mask;
            scans += 1;
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
                        self.next_link[item as usize].store(item as i32, Ordering::Relaxed);
                        bucket.count.fetch_add(1, Ordering::Relaxed);
                        return PutResult {
                            bucket: Some(index),
                            scans,
                        };
                    }
                    Err(current) => head = current,
                }
            }
            // Optimistic head read: identity oracle only, never dereferenced.
            if self.class.equals(head as u32, item) {
                let old = bucket.head.swap(item as i32, Ordering::Relaxed);
                self.next_link[item as usize].store(old, Ordering::Relaxed);
                bucket.count.fetch_add(1, Ordering::Relaxed);
                return PutResult {
                    bucket: None,
                    scans,
                };
            }
        }
        PutResult {
            bucket: None,
            scans: -1,
        }
    }

    pub fn get(&self, item: u32) -> Option<u32> {
        let capacity = self.capacity.load(Ordering::Relaxed) as u32;
        let mask = self.mask.load(Ordering::Relaxed);
        let start = self.hash_to_index(self.class.hash(item));
        for step in 0..capacity {
            let index = (start + step) & mask;
            let head = self.buckets[index as usize].head.load(Ordering::Relaxed);
            if head == EMPTY {
                return None;
            }
            if self.class.equals(head as u32, item) {
                return Some(index);
            }
        }
        None
    }

    /// Collect the chain under `bucket`, head first.
    pub fn chain(&self, bucket: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = self.buckets[bucket as usize].head.load(Ordering::Relaxed);
        while cur != EMPTY {
            out.push(cur as u32);
            let next = self.next_link[cur as usize].load(Ordering::Relaxed);
            cur = if next == cur { EMPTY } else { next };
        }
        out
    }
}
