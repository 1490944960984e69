//! Micro-benchmark for HashIndexTable inserts: split placement versus the
//! plain linear-probe oracle, across thread counts.
//! Run with: cargo run --release --bin bench_table

use std::time::Instant;

use cell_swarm::quickgrid::PlainIndexTable;
use cell_swarm::swarmgrid::{partition, HashIndexTable, ItemClass};
use rand::Rng;
use rand::SeedableRng;

const ITEMS: usize = 1 << 20;
const CLASSES: u32 = 1 << 16;
const RUNS: usize = 3;

/// Precomputed class id per item; hash/equals are pure lookups.
struct FixedClasses {
    class_of: Vec<u32>,
}

impl ItemClass for FixedClasses {
    fn hash(&self, item: u32) -> u32 {
        self.class_of[item as usize]
    }
    fn equals(&self, a: u32, b: u32) -> bool {
        self.class_of[a as usize] == self.class_of[b as usize]
    }
}

fn random_classes(seed: u64) -> FixedClasses {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    FixedClasses {
        class_of: (0..ITEMS).map(|_| rng.random_range(0..CLASSES)).collect(),
    }
}

fn insert_all_split(table: &HashIndexTable<FixedClasses>, threads: usize) {
    table.reset_size(ITEMS);
    table.reset_range(0, table.bucket_count() as usize);
    std::thread::scope(|scope| {
        for id in 0..threads {
            scope.spawn(move || {
                for item in partition(ITEMS, threads, id) {
                    let result = table.put(item as u32);
                    assert!(!result.overflowed());
                }
            });
        }
    });
}

fn bench_split(threads: usize) {
    let table = HashIndexTable::new(ITEMS, random_classes(0xBEEF));
    let mut best = f64::MAX;
    for _ in 0..RUNS {
        let start = Instant::now();
        insert_all_split(&table, threads);
        best = best.min(start.elapsed().as_secs_f64() * 1000.0);
    }
    println!(
        "split    {threads:>2} threads  best={best:8.3} ms  ({:.1} M items/s)",
        ITEMS as f64 / best / 1000.0
    );
}

fn bench_plain() {
    let table = PlainIndexTable::new(ITEMS, random_classes(0xBEEF));
    let mut best = f64::MAX;
    for _ in 0..RUNS {
        table.reset_size(ITEMS);
        table.reset_range(0, table.bucket_count() as usize);
        let start = Instant::now();
        for item in 0..ITEMS {
            let result = table.put(item as u32);
            assert!(!result.overflowed());
        }
        best = best.min(start.elapsed().as_secs_f64() * 1000.0);
    }
    println!(
        "plain     1 thread   best={best:8.3} ms  ({:.1} M items/s)",
        ITEMS as f64 / best / 1000.0
    );
}

fn main() {
    println!("{ITEMS} items, {CLASSES} classes");
    bench_plain();
    for threads in [1, 2, 4, 8] {
        bench_split(threads);
    }
}
