#[cfg(feature = "mimalloc-global")]
#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::time::Instant;

use cell_swarm::swarmgrid::{GridConfig, ParticleGrid, Vec2};
use rand::Rng;
use rand::SeedableRng;

const WORLD_SIDE: f32 = 512.0;
const DEFAULT_PARTICLES: usize = 200_000;
const DEFAULT_TICKS: u64 = 200;
const DEFAULT_CELL_SIZE: f32 = 4.0;
const CHECK_INTERVAL: u64 = 50;

struct MainArgs {
    particles: usize,
    ticks: u64,
    cell_size: f32,
    threads: Option<usize>,
    max_threads: Option<usize>,
}

fn parse_args() -> MainArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut out = MainArgs {
        particles: DEFAULT_PARTICLES,
        ticks: DEFAULT_TICKS,
        cell_size: DEFAULT_CELL_SIZE,
        threads: None,
        max_threads: None,
    };
    let next_arg = |i: usize, flag: &str| -> &str {
        args.get(i)
            .map(String::as_str)
            .unwrap_or_else(|| panic!("{flag} requires a value"))
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--particles" => {
                i += 1;
                out.particles = next_arg(i, "--particles")
                    .parse()
                    .expect("--particles requires a positive integer");
            }
            "--ticks" => {
                i += 1;
                out.ticks = next_arg(i, "--ticks")
                    .parse()
                    .expect("--ticks requires a positive integer");
            }
            "--cell-size" => {
                i += 1;
                out.cell_size = next_arg(i, "--cell-size")
                    .parse()
                    .expect("--cell-size requires a positive number");
            }
            "--threads" => {
                i += 1;
                let n: usize = next_arg(i, "--threads")
                    .parse()
                    .expect("--threads requires a positive integer");
                out.threads = Some(n);
            }
            "--max-threads" => {
                i += 1;
                let n: usize = next_arg(i, "--max-threads")
                    .parse()
                    .expect("--max-threads requires a positive integer");
                out.max_threads = Some(n);
            }
            other => panic!(
                "unknown argument: {other}\nusage: cell-swarm [--particles N] [--ticks N] [--cell-size F] [--threads N] [--max-threads N]"
            ),
        }
        i += 1;
    }
    out
}

/// Verify the core invariant: every particle lands in exactly one chain.
fn verify_coverage(grid: &ParticleGrid, expected: usize) {
    let mut seen = vec![false; expected];
    for &bucket in grid.touched_buckets() {
        for item in grid.bucket_items(bucket) {
            assert!(
                !seen[item as usize],
                "particle {item} reachable from two chains"
            );
            seen[item as usize] = true;
        }
    }
    let covered = seen.iter().filter(|&&s| s).count();
    assert_eq!(covered, expected, "coverage mismatch");
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let mut config = GridConfig::new(args.particles, args.cell_size);
    if let Some(n) = args.threads {
        config = config.thread_count(n);
    }
    if let Some(n) = args.max_threads {
        config = config.max_threads(n);
    }
    let mut grid = ParticleGrid::new(config);

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED_CE11_ABCD_EF01);
    let mut positions: Vec<Vec2> = (0..args.particles)
        .map(|_| {
            Vec2::new(
                rng.random_range(0.0..WORLD_SIDE),
                rng.random_range(0.0..WORLD_SIDE),
            )
        })
        .collect();
    let velocities: Vec<Vec2> = (0..args.particles)
        .map(|_| {
            Vec2::new(
                rng.random_range(-0.5..0.5),
                rng.random_range(-0.5..0.5),
            )
        })
        .collect();

    log::info!(
        "cell-swarm: {} particles, {} ticks, cell size {}, {} threads",
        args.particles,
        args.ticks,
        args.cell_size,
        grid.thread_count()
    );

    let start = Instant::now();
    let mut total_touched = 0u64;
    for tick in 1..=args.ticks {
        for (p, v) in positions.iter_mut().zip(&velocities) {
            p.x = (p.x + v.x).rem_euclid(WORLD_SIDE);
            p.y = (p.y + v.y).rem_euclid(WORLD_SIDE);
        }
        let stats = grid
            .rebuild(&positions)
            .unwrap_or_else(|err| panic!("rebuild failed at tick {tick}: {err}"));
        total_touched += stats.touched_buckets as u64;

        if tick % CHECK_INTERVAL == 0 {
            verify_coverage(&grid, args.particles);
            log::info!(
                "tick {tick}: {} touched buckets, max probe {}",
                stats.touched_buckets,
                stats.max_scans
            );
        }
    }
    let elapsed = start.elapsed();

    println!(
        "{} ticks in {:.3} s ({:.3} ms/tick), avg touched buckets {}",
        args.ticks,
        elapsed.as_secs_f64(),
        elapsed.as_secs_f64() * 1000.0 / args.ticks as f64,
        total_touched / args.ticks.max(1)
    );
}
