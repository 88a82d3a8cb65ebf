/* The same insert/read workloads as `layermap.rs`, run against `dashmap`
 * for comparison. The workloads are kept byte-for-byte identical so the
 * two bench files differ only in the map under test.
 */

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dashmap::DashMap;
use std::hint::black_box;
use std::sync::Arc;

const ITER: u64 = 32 * 1024;

fn scattered(i: u64) -> u64 {
    i.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

fn task_insert(threads: u64) -> Arc<DashMap<u64, u64>> {
    let map = Arc::new(DashMap::with_capacity(ITER as usize));
    let inc = ITER / threads;

    std::thread::scope(|s| {
        for t in 0..threads {
            let map = Arc::clone(&map);
            s.spawn(move || {
                let start = t * inc;
                for i in start..start + inc {
                    map.insert(scattered(i), i + 7);
                }
            });
        }
    });
    map
}

fn insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_dashmap_u64_u64");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get() as u64;

    for threads in 1..=max {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| task_insert(threads));
            },
        );
    }

    group.finish();
}

fn task_read(threads: u64, map: &Arc<DashMap<u64, u64>>) {
    let inc = ITER / threads;

    std::thread::scope(|s| {
        for t in 0..threads {
            let map = Arc::clone(map);
            s.spawn(move || {
                let start = t * inc;
                for i in start..start + inc {
                    let v = *map.get(&scattered(i)).unwrap();
                    black_box(v);
                }
            });
        }
    });
}

fn read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_dashmap_u64_u64");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get() as u64;

    for threads in 1..=max {
        let map = task_insert(threads);
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| task_read(threads, &map));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, insert, read);
criterion_main!(benches);
