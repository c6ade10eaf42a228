//! Iteration and bulk-creation throughput.
//!
//! Run with: `cargo bench --bench iteration`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tessera::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Bodies {
    world: World,
    position: Arc<TypedComponent>,
    velocity: Arc<TypedComponent>,
}

/// `count` entities with Position and Velocity, created in one bulk build.
fn setup_bodies(count: usize) -> Bodies {
    let mut world = World::new();
    let position = world.component::<f32>("Position", &[3]).unwrap();
    let velocity = world.component::<f32>("Velocity", &[3]).unwrap();

    let positions: Vec<f32> = (0..count * 3).map(|i| i as f32).collect();
    let velocities = vec![0.5f32; count * 3];
    let mut builder = world.bulk_entity_builder();
    builder.add(&position, &positions).unwrap();
    builder.add(&velocity, &velocities).unwrap();
    builder.build().unwrap();

    Bodies {
        world,
        position,
        velocity,
    }
}

// ---------------------------------------------------------------------------
// Benchmark 1: integrate positions through a cached query
// ---------------------------------------------------------------------------

fn bench_query_integrate(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_integrate");
    for count in [1_000usize, 10_000, 100_000] {
        let mut bodies = setup_bodies(count);
        let mut query = bodies
            .world
            .query_builder()
            .term(&bodies.position)
            .with(Term::new(&bodies.velocity).access(Access::In))
            .build()
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let mut it = query.iter(&mut bodies.world);
                while it.advance() {
                    let mut p = it.column_mut::<f32>("Position").unwrap();
                    let v = it.column::<f32>("Velocity").unwrap();
                    for (p, v) in p.iter_mut().zip(v.iter()) {
                        *p += v;
                    }
                }
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark 2: uncached filter (match cost included)
// ---------------------------------------------------------------------------

fn bench_filter_rematch(c: &mut Criterion) {
    let mut bodies = setup_bodies(10_000);
    let mut filter = bodies
        .world
        .filter_builder()
        .term(&bodies.position)
        .term(&bodies.velocity)
        .build()
        .unwrap();

    c.bench_function("filter_count_10k", |b| {
        b.iter(|| black_box(filter.count(&mut bodies.world)));
    });
}

// ---------------------------------------------------------------------------
// Benchmark 3: bulk creation
// ---------------------------------------------------------------------------

fn bench_bulk_build(c: &mut Criterion) {
    let positions = vec![1.0f32; 10_000 * 3];
    c.bench_function("bulk_build_10k", |b| {
        b.iter(|| {
            let mut world = World::new();
            let position = world.component::<f32>("Position", &[3]).unwrap();
            let mut builder = world.bulk_entity_builder();
            builder.add(&position, &positions).unwrap();
            black_box(builder.build().unwrap());
        });
    });
}

criterion_group!(benches, bench_query_integrate, bench_filter_rematch, bench_bulk_build);
criterion_main!(benches);
