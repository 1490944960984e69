//! `AtomicBumpStack` — fixed-capacity buffer with a single atomic cursor.
//!
//! Concurrent callers reserve disjoint index ranges with one `fetch_add`; the
//! returned region is exclusively owned by the caller, so filling it needs no
//! further synchronization. Used to record which buckets a build stage
//! touched, without per-item locking.

use std::cell::UnsafeCell;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct AtomicBumpStack<T> {
    buf: Box<[UnsafeCell<T>]>,
    cursor: AtomicUsize,
}

// SAFETY: concurrent access is confined to disjoint reserved ranges (push
// hands each caller a unique `[start, start+count)`), and `as_slice`/`reset`
// run only between stages, after the phase barrier.
unsafe impl<T: Send> Sync for AtomicBumpStack<T> {}

impl<T: Copy + Default> AtomicBumpStack<T> {
    pub fn new(max_size: usize) -> Self {
        let buf = (0..max_size)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Rewind the cursor. Never call concurrently with `push`; the phase
    /// barrier sequences resets against build stages.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn max_size(&self) -> usize {
        self.buf.len()
    }

    /// Reserve `count` slots and return the exclusively-owned region.
    ///
    /// Reserving past `max_size` is a sizing bug on the caller's side (the
    /// stack must be sized to the known upper bound) and aborts loudly.
    #[inline]
    pub fn push(&self, count: usize) -> &mut [T] {
        let start = self.cursor.fetch_add(count, Ordering::Relaxed);
        assert!(
            start + count <= self.buf.len(),
            "AtomicBumpStack overflow: reserving {count} at {start} with capacity {}",
            self.buf.len()
        );
        // SAFETY: `[start, start + count)` was exclusively reserved above;
        // UnsafeCell<T> is layout-compatible with T.
        unsafe {
            let first = self.buf.as_ptr().add(start) as *mut T;
            slice::from_raw_parts_mut(first, count)
        }
    }

    /// All filled entries, `[0, size())`. Only valid between stages, once
    /// every outstanding reserved region has been filled.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        let len = self.size();
        // SAFETY: no push is in flight between stages; entries below the
        // cursor were fully written by their reserving threads.
        unsafe { slice::from_raw_parts(self.buf.as_ptr() as *const T, len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reserves_sequential_regions() {
        let stack = AtomicBumpStack::<u32>::new(16);
        let a = stack.push(3);
        a.copy_from_slice(&[1, 2, 3]);
        let b = stack.push(2);
        b.copy_from_slice(&[4, 5]);
        assert_eq!(stack.size(), 5);
        assert_eq!(stack.as_slice(), &[1, 2, 3, 4, 5]);

        stack.reset();
        assert_eq!(stack.size(), 0);
        assert_eq!(stack.as_slice(), &[]);
    }

    #[test]
    fn zero_length_push_is_a_noop() {
        let stack = AtomicBumpStack::<u32>::new(4);
        let region = stack.push(0);
        assert!(region.is_empty());
        assert_eq!(stack.size(), 0);
    }

    #[test]
    #[should_panic(expected = "AtomicBumpStack overflow")]
    fn overflow_aborts() {
        let stack = AtomicBumpStack::<u32>::new(4);
        stack.push(3);
        stack.push(2);
    }

    #[test]
    fn concurrent_mixed_size_reservations_tile_the_buffer() {
        // 6 workers, region sizes 1..=6, 120 regions each: Σ sizes fits exactly.
        let per_worker = 120usize;
        let total: usize = (1..=6usize).map(|size| size * per_worker).sum();
        let stack = AtomicBumpStack::<u32>::new(total);
        std::thread::scope(|scope| {
            for worker in 1..=6u32 {
                let stack = &stack;
                scope.spawn(move || {
                    for _ in 0..per_worker {
                        let region = stack.push(worker as usize);
                        region.fill(worker);
                    }
                });
            }
        });
        assert_eq!(stack.size(), total);

        // Each worker's value appears exactly size * per_worker times.
        let mut counts = [0usize; 7];
        for &value in stack.as_slice() {
            counts[value as usize] += 1;
        }
        for worker in 1..=6usize {
            assert_eq!(counts[worker], worker * per_worker);
        }
    }

    #[test]
    fn concurrent_pushes_tile_the_buffer() {
        let stack = AtomicBumpStack::<u32>::new(8 * 500);
        std::thread::scope(|scope| {
            for worker in 0..8u32 {
                let stack = &stack;
                scope.spawn(move || {
                    for i in 0..500u32 {
                        let region = stack.push(1);
                        region[0] = worker * 500 + i;
                    }
                });
            }
        });
        assert_eq!(stack.size(), 8 * 500);

        // The union of reserved regions must tile [0, S) with no overlap:
        // every written value appears exactly once.
        let mut seen = vec![false; 8 * 500];
        for &value in stack.as_slice() {
            assert!(!seen[value as usize], "value {value} written twice");
            seen[value as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
