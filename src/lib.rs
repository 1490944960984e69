//! Concurrent spatial bucketing for particle simulations.
//!
//! `swarmgrid` is the production subsystem: a lock-free open-addressed
//! hash-index table with split placement, an atomic bump stack recording
//! touched buckets, and a fixed worker pool whose phase barrier sequences the
//! reset → build → consume stages of every tick. `quickgrid` is the plain
//! linear-probe variant, kept as a simple oracle for differential tests.

pub mod quickgrid;
pub mod swarmgrid;

pub use quickgrid::PlainIndexTable;
pub use swarmgrid::{GridConfig, HashIndexTable, ItemClass, ParticleGrid, Vec2, WorkerPool};
