//! Production spatial-bucketing subsystem: split hash-index table, bump
//! stack, worker pool, and the per-tick grid pipeline that drives them.

pub mod bump;
pub mod grid;
pub mod pool;
pub mod table;

pub use bump::AtomicBumpStack;
pub use grid::{BuildStats, CellSpace, GridConfig, GridError, ParticleGrid, Vec2};
pub use pool::{partition, Completion, Job, RangeCell, WorkerPool};
pub use table::{Bucket, ChainIter, HashIndexTable, ItemClass, PutResult, EMPTY};
