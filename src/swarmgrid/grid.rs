//! Capacity/grid integration layer: per-tick concurrent mapping from spatial
//! cell to the list of particles inside it.
//!
//! Each tick the master resizes the table for the current particle count,
//! runs a parallel reset stage over the bucket headers, a parallel build
//! stage inserting every particle (new-bucket claims land in the bump stack),
//! and then hands the touched buckets to consumers until the next reset.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use thiserror::Error;

use super::bump::AtomicBumpStack;
use super::pool::{partition, Completion, Job, RangeCell, WorkerPool};
use super::table::{ChainIter, HashIndexTable, ItemClass};

/// Two distinct odd constants mixing the cell axes independently, so
/// axis-aligned particle layouts don't collapse onto a few buckets.
const MX: u32 = 0x85EB_CA6B;
const MY: u32 = 0xC2B2_AE35;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    #[inline(always)]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[inline(always)]
fn cell_hash(cx: i32, cy: i32) -> u32 {
    (cx as u32).wrapping_mul(MX) ^ (cy as u32).wrapping_mul(MY).rotate_right(15)
}

/// Position-derived hash/equality over particle indices.
///
/// The position array is externally owned; `bind` publishes a raw view of it
/// for the duration of one rebuild. Workers read it only inside the build
/// stage, which the barrier confines to the borrow in `ParticleGrid::rebuild`.
pub struct CellSpace {
    inv_cell_size: f32,
    positions: AtomicPtr<Vec2>,
    len: AtomicUsize,
}

impl CellSpace {
    fn new(cell_size: f32) -> Self {
        assert!(cell_size > 0.0, "cell size must be positive");
        Self {
            inv_cell_size: 1.0 / cell_size,
            positions: AtomicPtr::new(std::ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    fn bind(&self, positions: &[Vec2]) {
        // Relaxed: the job-queue mutex publishes these before any worker runs.
        self.positions
            .store(positions.as_ptr() as *mut Vec2, Ordering::Relaxed);
        self.len.store(positions.len(), Ordering::Relaxed);
    }

    fn unbind(&self) {
        self.positions
            .store(std::ptr::null_mut(), Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);
    }

    /// Grid cell of a particle.
    #[inline(always)]
    pub fn cell_of(&self, item: u32) -> (i32, i32) {
        let index = item as usize;
        debug_assert!(index < self.len.load(Ordering::Relaxed));
        // SAFETY: `bind` installed a pointer to a slice that outlives the
        // build stage, and `item` is below the bound length.
        let p = unsafe { &*self.positions.load(Ordering::Relaxed).add(index) };
        (
            (p.x * self.inv_cell_size).floor() as i32,
            (p.y * self.inv_cell_size).floor() as i32,
        )
    }
}

impl ItemClass for CellSpace {
    #[inline(always)]
    fn hash(&self, item: u32) -> u32 {
        let (cx, cy) = self.cell_of(item);
        cell_hash(cx, cy)
    }

    #[inline(always)]
    fn equals(&self, a: u32, b: u32) -> bool {
        self.cell_of(a) == self.cell_of(b)
    }
}

// ── Configuration ───────────────────────────────────────────────────────

fn physical_core_count() -> usize {
    static PHYSICAL_CORES: OnceLock<usize> = OnceLock::new();
    *PHYSICAL_CORES.get_or_init(|| num_cpus::get_physical().max(1))
}

#[inline]
fn auto_thread_count_for_physical(physical: usize) -> usize {
    let physical = physical.max(1);
    if physical <= 8 {
        physical
    } else {
        physical.div_ceil(2).max(6)
    }
}

/// Configuration for a `ParticleGrid`.
///
/// Use `GridConfig::new(max_particles, cell_size)` and override knobs via the
/// builder methods.
#[derive(Clone, Debug)]
pub struct GridConfig {
    /// Upper bound on particles for the session; storage is sized once.
    pub max_particles: usize,
    /// Spatial cell edge length, in world units.
    pub cell_size: f32,
    /// Worker threads. `None` means auto-detect from physical cores.
    pub thread_count: Option<usize>,
    /// Hard cap on threads regardless of auto-detection.
    pub max_threads: Option<usize>,
}

impl GridConfig {
    pub fn new(max_particles: usize, cell_size: f32) -> Self {
        Self {
            max_particles,
            cell_size,
            thread_count: None,
            max_threads: None,
        }
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = Some(n.max(1));
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n.max(1));
        self
    }

    fn resolve_thread_count(&self) -> usize {
        let mut threads = self
            .thread_count
            .unwrap_or_else(|| auto_thread_count_for_physical(physical_core_count()));
        if let Some(cap) = self.max_threads {
            threads = threads.min(cap);
        }
        threads.max(1)
    }
}

// ── Errors and stats ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GridError {
    #[error("particle count {count} exceeds configured maximum {max}")]
    TooManyParticles { count: usize, max: usize },
    /// Probe exhaustion during the build stage. Unreachable when the table is
    /// sized to the inflation contract; surfaced instead of dropping items.
    #[error("hash table capacity exhausted: {failed} of {total} inserts failed")]
    CapacityExhausted { failed: usize, total: usize },
}

/// Per-rebuild accounting, fed to the log layer and the bench binaries.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildStats {
    pub particles: usize,
    pub touched_buckets: usize,
    pub total_scans: u64,
    pub max_scans: u32,
}

// ── Stage jobs ──────────────────────────────────────────────────────────

struct ResetJob {
    table: Arc<HashIndexTable<CellSpace>>,
    range: RangeCell,
    completion: Completion,
}

impl Job for ResetJob {
    fn execute(&self) {
        let range = self.range.get();
        self.table.reset_range(range.start, range.end);
    }
    fn completion(&self) -> &Completion {
        &self.completion
    }
}

struct BuildJob {
    table: Arc<HashIndexTable<CellSpace>>,
    touched: Arc<AtomicBumpStack<u32>>,
    range: RangeCell,
    /// Stage counters, master-read after the barrier.
    failed: AtomicUsize,
    scans: AtomicUsize,
    max_scans: AtomicUsize,
    completion: Completion,
}

impl Job for BuildJob {
    fn execute(&self) {
        let range = self.range.get();
        let mut failed = 0usize;
        let mut scans = 0usize;
        let mut max_scans = 0usize;
        for item in range {
            let result = self.table.put(item as u32);
            if result.overflowed() {
                failed += 1;
                continue;
            }
            scans += result.scans as usize;
            max_scans = max_scans.max(result.scans as usize);
            if let Some(bucket) = result.bucket {
                self.touched.push(1)[0] = bucket;
            }
        }
        self.failed.store(failed, Ordering::Relaxed);
        self.scans.store(scans, Ordering::Relaxed);
        self.max_scans.store(max_scans, Ordering::Relaxed);
    }
    fn completion(&self) -> &Completion {
        &self.completion
    }
}

// ── ParticleGrid ────────────────────────────────────────────────────────

pub struct ParticleGrid {
    table: Arc<HashIndexTable<CellSpace>>,
    touched: Arc<AtomicBumpStack<u32>>,
    pool: WorkerPool,
    reset_jobs: Vec<Arc<ResetJob>>,
    build_jobs: Vec<Arc<BuildJob>>,
    max_particles: usize,
}

impl ParticleGrid {
    pub fn new(config: GridConfig) -> Self {
        let threads = config.resolve_thread_count();
        let table = Arc::new(HashIndexTable::new(
            config.max_particles,
            CellSpace::new(config.cell_size),
        ));
        // At most one new-bucket claim per particle.
        let touched = Arc::new(AtomicBumpStack::new(config.max_particles));
        let pool = WorkerPool::new(threads);

        let reset_jobs = (0..threads)
            .map(|_| {
                Arc::new(ResetJob {
                    table: Arc::clone(&table),
                    range: RangeCell::new(),
                    completion: Completion::new(),
                })
            })
            .collect();
        let build_jobs = (0..threads)
            .map(|_| {
                Arc::new(BuildJob {
                    table: Arc::clone(&table),
                    touched: Arc::clone(&touched),
                    range: RangeCell::new(),
                    failed: AtomicUsize::new(0),
                    scans: AtomicUsize::new(0),
                    max_scans: AtomicUsize::new(0),
                    completion: Completion::new(),
                })
            })
            .collect();

        Self {
            table,
            touched,
            pool,
            reset_jobs,
            build_jobs,
            max_particles: config.max_particles,
        }
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.pool.thread_count()
    }

    #[inline]
    pub fn table(&self) -> &HashIndexTable<CellSpace> {
        &self.table
    }

    /// Rebuild the cell→particles mapping for this tick.
    ///
    /// Runs the full phase pipeline: logical resize, parallel bucket-header
    /// reset, parallel insert. On return the buckets are read-only until the
    /// next call.
    pub fn rebuild(&mut self, positions: &[Vec2]) -> Result<BuildStats, GridError> {
        let count = positions.len();
        if count > self.max_particles {
            return Err(GridError::TooManyParticles {
                count,
                max: self.max_particles,
            });
        }

        self.table.reset_size(count);
        self.table.class().bind(positions);
        self.touched.reset();
        let workers = self.pool.thread_count();

        // Reset stage: clear bucket headers in disjoint slices.
        let buckets = self.table.bucket_count() as usize;
        for (id, job) in self.reset_jobs.iter().enumerate() {
            job.range.set(partition(buckets, workers, id));
            self.pool.push_job(job.clone());
        }
        for job in &self.reset_jobs {
            job.completion().wait();
        }

        // Build stage: insert disjoint particle ranges.
        for (id, job) in self.build_jobs.iter().enumerate() {
            job.range.set(partition(count, workers, id));
            self.pool.push_job(job.clone());
        }
        for job in &self.build_jobs {
            job.completion().wait();
        }

        self.table.class().unbind();

        let mut stats = BuildStats {
            particles: count,
            touched_buckets: self.touched.size(),
            total_scans: 0,
            max_scans: 0,
        };
        let mut failed = 0usize;
        for job in &self.build_jobs {
            failed += job.failed.load(Ordering::Relaxed);
            stats.total_scans += job.scans.load(Ordering::Relaxed) as u64;
            stats.max_scans = stats.max_scans.max(job.max_scans.load(Ordering::Relaxed) as u32);
        }
        if failed > 0 {
            return Err(GridError::CapacityExhausted {
                failed,
                total: count,
            });
        }

        log::debug!(
            "rebuild: {} particles into {} buckets ({} touched, {} scans, max {})",
            count,
            buckets,
            stats.touched_buckets,
            stats.total_scans,
            stats.max_scans
        );
        Ok(stats)
    }

    /// Bucket indices the last build stage touched, unordered.
    #[inline]
    pub fn touched_buckets(&self) -> &[u32] {
        self.touched.as_slice()
    }

    /// Particle indices chained under one touched bucket.
    #[inline]
    pub fn bucket_items(&self, bucket: u32) -> ChainIter<'_, CellSpace> {
        self.table.chain(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_hash_spreads_axis_aligned_cells() {
        let mut buckets = std::collections::BTreeSet::new();
        let bucket_mask = (1u32 << 12) - 1;
        for i in 0..4096 {
            buckets.insert(cell_hash(i, 0) & bucket_mask);
            buckets.insert(cell_hash(0, i) & bucket_mask);
        }
        assert!(
            buckets.len() >= 3000,
            "axis-aligned cell spread regressed: {}",
            buckets.len()
        );
    }

    #[test]
    fn cell_of_floors_negative_coordinates() {
        let space = CellSpace::new(2.0);
        let positions = [Vec2::new(-0.5, 3.9), Vec2::new(0.0, -4.0)];
        space.bind(&positions);
        assert_eq!(space.cell_of(0), (-1, 1));
        assert_eq!(space.cell_of(1), (0, -2));
        space.unbind();
    }

    #[test]
    fn auto_thread_count_policy() {
        assert_eq!(auto_thread_count_for_physical(0), 1);
        assert_eq!(auto_thread_count_for_physical(1), 1);
        assert_eq!(auto_thread_count_for_physical(8), 8);
        assert_eq!(auto_thread_count_for_physical(16), 8);
        assert_eq!(auto_thread_count_for_physical(10), 6);
    }

    #[test]
    fn rebuild_groups_particles_by_cell() {
        let mut grid = ParticleGrid::new(GridConfig::new(256, 1.0).thread_count(4));
        // Four particles in one cell, two in another, one alone.
        let positions = [
            Vec2::new(0.1, 0.1),
            Vec2::new(0.2, 0.9),
            Vec2::new(0.9, 0.2),
            Vec2::new(0.5, 0.5),
            Vec2::new(5.1, 5.1),
            Vec2::new(5.9, 5.9),
            Vec2::new(-3.5, 2.5),
        ];
        let stats = grid.rebuild(&positions).expect("rebuild must succeed");
        assert_eq!(stats.particles, 7);
        assert_eq!(stats.touched_buckets, 3);

        let mut sizes: Vec<usize> = grid
            .touched_buckets()
            .iter()
            .map(|&bucket| grid.bucket_items(bucket).count())
            .collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 4]);
    }

    #[test]
    fn rebuild_rejects_overflowing_particle_count() {
        let mut grid = ParticleGrid::new(GridConfig::new(4, 1.0).thread_count(1));
        let positions = vec![Vec2::default(); 5];
        match grid.rebuild(&positions) {
            Err(GridError::TooManyParticles { count: 5, max: 4 }) => {}
            other => panic!("expected TooManyParticles, got {other:?}"),
        }
    }

    #[test]
    fn repeated_rebuilds_reuse_storage() {
        let mut grid = ParticleGrid::new(GridConfig::new(1024, 1.0).thread_count(3));
        for tick in 0..10 {
            let n = 100 + tick * 50;
            let positions: Vec<Vec2> = (0..n)
                .map(|i| Vec2::new((i % 23) as f32 * 0.7, (i / 23) as f32 * 0.7))
                .collect();
            let stats = grid.rebuild(&positions).expect("rebuild must succeed");
            assert_eq!(stats.particles, n);

            let total: usize = grid
                .touched_buckets()
                .iter()
                .map(|&bucket| grid.bucket_items(bucket).count())
                .sum();
            assert_eq!(total, n, "every particle must land in exactly one chain");
        }
    }
}
