// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pruner basics.
//!
//! Insert a few boxes, commit, and run a nearest-hit raycast, an overlap, and a sweep.
//!
//! Run:
//! - `RUST_LOG=debug cargo run -p understory_demos --example pruner_basics`

use glam::{Quat, Vec3};
use understory_pruner::{Aabb3, IncrementalPruner, Payload, PrunerConfig, QueryShape, SpatialQuery};

fn main() {
    env_logger::init();

    let boxes = [
        Aabb3::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 1.0, 1.0)),
        Aabb3::new(Vec3::new(0.0, 0.0, 4.0), Vec3::new(1.0, 1.0, 5.0)),
        Aabb3::new(Vec3::new(3.0, 0.0, 0.0), Vec3::new(4.0, 1.0, 1.0)),
        Aabb3::from_center_extents(Vec3::new(-3.0, 2.0, 0.0), Vec3::splat(0.5)),
    ];
    let payloads: Vec<Payload> = (0..boxes.len()).map(Payload::from).collect();

    let mut pruner = IncrementalPruner::new(PrunerConfig::default());
    let handles = pruner
        .add_objects(&boxes, &payloads)
        .expect("pool has room for four boxes");
    pruner.commit();
    log::info!("{pruner:?}");

    // Nearest hit: lower the distance on every exact hit so farther candidates are skipped.
    let origin = Vec3::new(0.5, 0.5, -5.0);
    let mut nearest = None;
    let mut max_dist = 100.0;
    pruner.raycast_with_distance(origin, Vec3::Z, &mut max_dist, &mut |dist, hits| {
        let id = hits[0].data[0];
        if let Some(t) = boxes[id].ray_distance(origin, Vec3::Z, *dist) {
            *dist = t;
            nearest = Some(id);
        }
        true
    });
    println!("nearest hit: {nearest:?} at distance {max_dist}");
    assert_eq!(nearest, Some(0), "the box at the origin is closest");

    // Overlap with a rotated box.
    let probe = QueryShape::Box {
        center: Vec3::new(2.0, 0.5, 0.5),
        half_extents: Vec3::new(1.5, 0.2, 0.2),
        rotation: Quat::from_rotation_y(0.3),
    };
    let mut touching = Vec::new();
    pruner.overlap(&probe, &mut |_, hits| {
        touching.extend(hits.iter().map(|p| p.data[0]));
        true
    });
    touching.sort_unstable();
    println!("rotated box touches: {touching:?}");

    // Sweep a sphere and stop at the first candidate.
    let sphere = QueryShape::Sphere {
        center: Vec3::new(-6.0, 2.0, 0.0),
        radius: 0.25,
    };
    let mut first = None;
    let finished = pruner.sweep(&sphere, Vec3::X, 20.0, &mut |_, hits| {
        first = Some(hits[0]);
        false
    });
    println!("sweep stopped early: {}, first candidate: {first:?}", !finished);

    // Move a box; the change is visible after the next commit.
    pruner.update_objects(&[handles[3]], &[Aabb3::new(Vec3::splat(10.0), Vec3::splat(11.0))]);
    pruner.commit();
    println!("moved box bounds: {:?}", pruner.get_bounds(handles[3]));
}
