// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use glam::Vec3;
use understory_pruner::{
    Aabb3, BoundingVolumeTree, BuildSettings, IncrementalPruner, Payload, PrunerConfig,
    QueryShape, SpatialQuery, SplitRule, TreeBuilder,
};

#[derive(Clone)]
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
    fn next_f32(&mut self) -> f32 {
        let v = self.next_u64() >> 40;
        (v as f32) / ((1u64 << 24) as f32)
    }
    fn next_vec3(&mut self) -> Vec3 {
        Vec3::new(self.next_f32(), self.next_f32(), self.next_f32())
    }
}

fn gen_random_boxes(count: usize, extent: f32, max_size: f32, seed: u64) -> Vec<Aabb3> {
    let mut rng = Rng::new(seed);
    (0..count)
        .map(|_| {
            let min = rng.next_vec3() * (extent - max_size);
            Aabb3::new(min, min + rng.next_vec3() * max_size)
        })
        .collect()
}

fn gen_clustered_boxes(n_clusters: usize, per_cluster: usize, spread: f32) -> Vec<Aabb3> {
    let mut rng = Rng::new(0xC1A5_7E55_9999_ABCD);
    let centers: Vec<Vec3> = (0..n_clusters).map(|_| rng.next_vec3() * 2000.0).collect();
    let mut out = Vec::with_capacity(n_clusters * per_cluster);
    for c in centers {
        for _ in 0..per_cluster {
            let min = c + (rng.next_vec3() - 0.5) * spread;
            out.push(Aabb3::new(min, min + Vec3::splat(12.0)));
        }
    }
    out
}

fn payloads(n: usize) -> Vec<Payload> {
    (0..n).map(Payload::from).collect()
}

fn committed(boxes: &[Aabb3], config: PrunerConfig) -> IncrementalPruner {
    let mut pruner = IncrementalPruner::new(config);
    let _ = pruner.add_objects(boxes, &payloads(boxes.len()));
    pruner.commit();
    pruner
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for &n in &[1_000usize, 10_000, 50_000] {
        let boxes = gen_random_boxes(n, 1000.0, 8.0, 0xCAFE_F00D_DEAD_BEEF);
        group.throughput(Throughput::Elements(n as u64));
        for rule in [
            SplitRule::LargestAxis,
            SplitRule::SplatterPoints,
            SplitRule::Balanced,
            SplitRule::BestAxis,
        ] {
            group.bench_function(format!("{rule:?}_n{n}"), |b| {
                let settings = BuildSettings {
                    rule,
                    ..BuildSettings::default()
                };
                b.iter(|| {
                    let mut builder = TreeBuilder::from_bounds(settings, &boxes);
                    let mut tree = BoundingVolumeTree::new();
                    tree.build(&mut builder);
                    black_box(tree.node_count());
                });
            });
        }
    }
    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");
    for &n in &[1_000usize, 10_000, 50_000] {
        let boxes = gen_random_boxes(n, 1000.0, 8.0, 0xFACE_FEED_CAFE_BABE);
        let pruner = committed(&boxes, PrunerConfig::default());
        let mut rng = Rng::new(0x1234_5678_9ABC_DEF0);
        let origins: Vec<Vec3> = (0..256)
            .map(|_| rng.next_vec3() * Vec3::new(0.0, 1000.0, 1000.0) - Vec3::new(10.0, 0.0, 0.0))
            .collect();

        group.bench_function(format!("raycast_nearest_n{n}"), |b| {
            b.iter(|| {
                let mut found = 0;
                for &origin in &origins {
                    pruner.raycast(origin, Vec3::X, 2000.0, &mut |dist, _| {
                        // Stand-in for an exact test that found something halfway.
                        *dist *= 0.5;
                        found += 1;
                        true
                    });
                }
                black_box(found);
            });
        });

        group.bench_function(format!("overlap_sphere_n{n}"), |b| {
            b.iter(|| {
                let mut found = 0;
                for &origin in &origins {
                    let shape = QueryShape::Sphere {
                        center: origin + Vec3::new(500.0, 0.0, 0.0),
                        radius: 25.0,
                    };
                    pruner.overlap(&shape, &mut |_, hits| {
                        found += hits.len();
                        true
                    });
                }
                black_box(found);
            });
        });
    }

    let boxes = gen_clustered_boxes(64, 256, 200.0);
    let pruner = committed(&boxes, PrunerConfig::default());
    group.bench_function("sweep_box_clustered", |b| {
        let shape = QueryShape::Aabb(Aabb3::new(Vec3::splat(-5.0), Vec3::splat(5.0)));
        b.iter(|| {
            let mut found = 0;
            pruner.sweep(&shape, Vec3::ONE.normalize(), 4000.0, &mut |_, hits| {
                found += hits.len();
                true
            });
            black_box(found);
        });
    });
    group.finish();
}

fn bench_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental");
    let n = 20_000;
    let boxes = gen_random_boxes(n, 1000.0, 8.0, 0xBADC_F00D_1234_5678);
    let moved = gen_random_boxes(n / 10, 1000.0, 8.0, 0x0DDB_A11C_AFE5_0000);
    group.throughput(Throughput::Elements((n / 10) as u64));

    // One frame: move 10% of the objects, commit, advance the rebuild.
    group.bench_function("update_commit_step_n20000", |b| {
        b.iter_batched(
            || {
                let pruner = committed(&boxes, PrunerConfig::default().with_rebuild_rate_hint(30));
                let handles: Vec<_> = (0..moved.len())
                    .filter_map(|i| pruner.pool().handle_at(i * 10))
                    .collect();
                (pruner, handles)
            },
            |(mut pruner, handles)| {
                pruner.update_objects(&handles, &moved[..handles.len()]);
                pruner.commit();
                black_box(pruner.build_step());
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("full_background_rebuild_n20000", |b| {
        b.iter_batched(
            || {
                let mut pruner = committed(&boxes, PrunerConfig::default().with_rebuild_rate_hint(30));
                let extra = gen_random_boxes(256, 1000.0, 8.0, 7);
                let ids: Vec<Payload> = (n..n + extra.len()).map(Payload::from).collect();
                let _ = pruner.add_objects(&extra, &ids);
                pruner.commit();
                pruner
            },
            |mut pruner| {
                while !pruner.build_step() {}
                pruner.commit();
                black_box(pruner.tree().node_count());
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_build, bench_queries, bench_incremental);
criterion_main!(benches);
