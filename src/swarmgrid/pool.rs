//! Fixed worker pool and the master/worker phase protocol.
//!
//! A fixed set of OS threads drains one shared blocking job queue. To run a
//! parallel stage the master enqueues one job per worker (each bound to a
//! disjoint index range) and then blocks on every job's completion event in
//! turn. Because `wait` blocks until `set_ready` fires for that specific job,
//! this is a reusable full barrier: stage N finishes on every worker before
//! stage N+1 starts, without recreating threads.
//!
//! The barrier is also the memory-synchronization point for the whole
//! subsystem: bucket/chain/bump mutation inside a stage uses relaxed atomics,
//! and the mutex/condvar handoff in `wait`/`set_ready` (and the queue mutex on
//! the way in) provides the happens-before edge that publishes stage N's
//! effects to every thread of stage N+1.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

/// Completion event for one job instance: mutex + condvar, master-side
/// `wait` against worker-side `set_ready`.
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn reset(&self) {
        *self.done.lock() = false;
    }

    /// Mark the job finished and wake the master.
    pub fn set_ready(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    /// Block until `set_ready` fires for this instance.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of stage work. Implementations keep their completion event inline
/// so the pool can signal the exact instance the master is waiting on.
///
/// Caller contract (unchecked, hot path): never re-push a job whose previous
/// run has not been waited on, and never drop the pool with jobs outstanding.
pub trait Job: Send + Sync {
    fn execute(&self);
    fn completion(&self) -> &Completion;
}

/// Harmless job used to unblock parked workers during shutdown.
struct NoopJob {
    completion: Completion,
}

impl Job for NoopJob {
    fn execute(&self) {}
    fn completion(&self) -> &Completion {
        &self.completion
    }
}

struct JobQueue {
    jobs: Mutex<VecDeque<Arc<dyn Job>>>,
    available: Condvar,
    terminating: AtomicBool,
}

impl JobQueue {
    fn push(&self, job: Arc<dyn Job>) {
        self.jobs.lock().push_back(job);
        self.available.notify_one();
    }

    /// Blocking pop; parks on the condvar while the queue is empty.
    fn pop(&self) -> Arc<dyn Job> {
        let mut jobs = self.jobs.lock();
        loop {
            if let Some(job) = jobs.pop_front() {
                return job;
            }
            self.available.wait(&mut jobs);
        }
    }
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let queue = Arc::new(JobQueue {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            terminating: AtomicBool::new(false),
        });
        let workers = (0..thread_count)
            .map(|id| {
                let queue = Arc::clone(&queue);
                std::thread::Builder::new()
                    .name(format!("swarm-worker-{id}"))
                    .spawn(move || worker_loop(&queue))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { queue, workers }
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue one job. Its completion event is re-armed here, so a fresh
    /// `wait` after this call observes only this execution.
    pub fn push_job(&self, job: Arc<dyn Job>) {
        job.completion().reset();
        self.queue.push(job);
    }

    /// Flag-based clean shutdown: raise the terminating flag, then push one
    /// no-op job per worker to unblock any thread parked on the empty queue.
    /// Blocks until every worker has exited.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.queue.terminating.store(true, Ordering::SeqCst);
        for _ in 0..self.workers.len() {
            self.queue.push(Arc::new(NoopJob {
                completion: Completion::new(),
            }));
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: &JobQueue) {
    loop {
        let job = queue.pop();
        if queue.terminating.load(Ordering::SeqCst) {
            break;
        }
        job.execute();
        job.completion().set_ready();
    }
}

/// Deterministic equal partition of `[0, total)` into `workers` contiguous
/// disjoint ranges. Remainders spread one extra element over the low ids.
#[inline]
pub fn partition(total: usize, workers: usize, id: usize) -> Range<usize> {
    let workers = workers.max(1);
    debug_assert!(id < workers);
    (total * id / workers)..(total * (id + 1) / workers)
}

/// Mutable range slot on a persistent job, rewritten by the master before
/// each stage. Relaxed is enough: the queue mutex publishes it to the worker.
pub struct RangeCell {
    start: AtomicUsize,
    end: AtomicUsize,
}

impl RangeCell {
    pub fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn set(&self, range: Range<usize>) {
        self.start.store(range.start, Ordering::Relaxed);
        self.end.store(range.end, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> Range<usize> {
        self.start.load(Ordering::Relaxed)..self.end.load(Ordering::Relaxed)
    }
}

impl Default for RangeCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountJob {
        counter: Arc<AtomicUsize>,
        amount: usize,
        completion: Completion,
    }

    impl Job for CountJob {
        fn execute(&self) {
            self.counter.fetch_add(self.amount, Ordering::Relaxed);
        }
        fn completion(&self) -> &Completion {
            &self.completion
        }
    }

    #[test]
    fn partition_tiles_the_range() {
        for total in [0usize, 1, 7, 64, 1000, 12345] {
            for workers in [1usize, 2, 3, 8, 17] {
                let mut covered = 0usize;
                let mut prev_end = 0usize;
                for id in 0..workers {
                    let range = partition(total, workers, id);
                    assert_eq!(range.start, prev_end, "ranges must be contiguous");
                    prev_end = range.end;
                    covered += range.len();
                }
                assert_eq!(prev_end, total);
                assert_eq!(covered, total);
            }
        }
    }

    #[test]
    fn partition_is_balanced() {
        let workers = 7;
        let total = 1000;
        for id in 0..workers {
            let len = partition(total, workers, id).len();
            assert!((142..=143).contains(&len), "unbalanced range: {len}");
        }
    }

    #[test]
    fn jobs_run_and_waits_observe_completion() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<Arc<CountJob>> = (0..4)
            .map(|i| {
                Arc::new(CountJob {
                    counter: Arc::clone(&counter),
                    amount: i + 1,
                    completion: Completion::new(),
                })
            })
            .collect();

        // Two full stages through the same persistent job objects.
        for _ in 0..2 {
            for job in &jobs {
                pool.push_job(job.clone());
            }
            for job in &jobs {
                job.completion().wait();
            }
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2 * (1 + 2 + 3 + 4));
    }

    #[test]
    fn shutdown_with_no_jobs_joins_all_workers() {
        let pool = WorkerPool::new(8);
        assert_eq!(pool.thread_count(), 8);
        drop(pool);
    }

    #[test]
    fn shutdown_after_jobs_is_clean() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(3);
            let job = Arc::new(CountJob {
                counter: Arc::clone(&counter),
                amount: 5,
                completion: Completion::new(),
            });
            pool.push_job(job.clone());
            job.completion().wait();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn zero_thread_request_still_gets_one_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.thread_count(), 1);
    }
}
