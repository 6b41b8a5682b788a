// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![cfg(feature = "compare_rstar")]

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use glam::Vec3;
use understory_pruner::{Aabb3, IncrementalPruner, Payload, PrunerConfig, QueryShape, SpatialQuery};

use rstar::primitives::Rectangle;
use rstar::{AABB, RTree};

fn gen_grid_boxes(n: usize, cell: f32) -> Vec<Aabb3> {
    let mut out = Vec::with_capacity(n * n * n);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let min = Vec3::new(x as f32, y as f32, z as f32) * cell;
                out.push(Aabb3::new(min, min + Vec3::splat(cell * 0.8)));
            }
        }
    }
    out
}

fn to_rstar_boxes(v: &[Aabb3]) -> Vec<Rectangle<[f32; 3]>> {
    v.iter()
        .map(|b| Rectangle::from_corners(b.min.to_array(), b.max.to_array()))
        .collect()
}

fn bench_rtree_external_compare_f32(c: &mut Criterion) {
    let mut group = c.benchmark_group("rtree_external_compare_f32");
    for &n in &[16usize, 32] {
        let boxes = gen_grid_boxes(n, 10.0);
        let query = Aabb3::new(Vec3::splat(40.0), Vec3::splat(120.0));
        group.throughput(Throughput::Elements((n * n * n) as u64));

        group.bench_function(format!("understory_build_query_n{}", n), |b| {
            b.iter_batched(
                || (0..boxes.len()).map(Payload::from).collect::<Vec<_>>(),
                |payloads| {
                    let mut pruner = IncrementalPruner::new(PrunerConfig::default());
                    let _ = pruner.add_objects(&boxes, &payloads);
                    pruner.commit();
                    let mut hits = 0_usize;
                    pruner.overlap(&QueryShape::Aabb(query), &mut |_, found| {
                        hits += found.len();
                        true
                    });
                    black_box(hits);
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(format!("rstar_build_query_bulk_n{}", n), |b| {
            b.iter_batched(
                || to_rstar_boxes(&boxes),
                |rectangles| {
                    let tree = RTree::bulk_load(rectangles);
                    let aabb = AABB::from_corners(query.min.to_array(), query.max.to_array());
                    let hits: usize = tree.locate_in_envelope_intersecting(&aabb).count();
                    black_box(hits);
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rtree_external_compare_f32);
criterion_main!(benches);
