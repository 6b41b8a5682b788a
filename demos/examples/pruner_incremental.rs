// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Incremental rebuilds.
//!
//! Simulate frames where objects move and new ones spawn. Each frame commits, runs a
//! query, and spends one `build_step` on the background tree.
//!
//! Run:
//! - `RUST_LOG=debug cargo run -p understory_demos --example pruner_incremental`

use glam::Vec3;
use understory_pruner::{
    Aabb3, BuildState, IncrementalPruner, Payload, PrunerConfig, QueryShape, SpatialQuery,
};

struct Rng(u64);

impl Rng {
    fn next_f32(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x >> 40) as f32 / (1_u64 << 24) as f32
    }

    fn next_box(&mut self) -> Aabb3 {
        let min = Vec3::new(self.next_f32(), self.next_f32(), self.next_f32()) * 500.0;
        Aabb3::new(min, min + Vec3::splat(2.0 + self.next_f32() * 4.0))
    }
}

fn main() {
    env_logger::init();

    let mut rng = Rng(0x5EED_1234_ABCD_0001);
    let config = PrunerConfig::default().with_rebuild_rate_hint(20);
    let mut pruner = IncrementalPruner::new(config);

    let initial: Vec<Aabb3> = (0..5_000).map(|_| rng.next_box()).collect();
    let payloads: Vec<Payload> = (0..initial.len()).map(Payload::from).collect();
    let handles = pruner
        .add_objects(&initial, &payloads)
        .expect("default pruner has no object limit");
    pruner.commit();

    let mut next_id = initial.len();
    let movers = &handles[..200];
    let probe = QueryShape::Sphere {
        center: Vec3::splat(250.0),
        radius: 40.0,
    };

    for frame in 0..60 {
        let moved: Vec<Aabb3> = movers.iter().map(|_| rng.next_box()).collect();
        pruner.update_objects(movers, &moved);
        if frame % 5 == 0 {
            let spawned: Vec<Aabb3> = (0..50).map(|_| rng.next_box()).collect();
            let ids: Vec<Payload> = (next_id..next_id + spawned.len()).map(Payload::from).collect();
            next_id += spawned.len();
            if let Err(err) = pruner.add_objects(&spawned, &ids) {
                log::warn!("frame {frame}: {err}");
            }
        }
        pruner.commit();

        let mut nearby = 0;
        pruner.overlap(&probe, &mut |_, hits| {
            nearby += hits.len();
            true
        });

        let finished = pruner.build_step();
        println!(
            "frame {frame:2}: {} objects, {} pending, {nearby} near the probe, {:?}{}",
            pruner.len(),
            pruner.bucket().len(),
            pruner.build_state(),
            if finished { " (swap on next commit)" } else { "" }
        );
    }

    // Let the last rebuild finish.
    while pruner.build_state() != BuildState::NotStarted {
        if pruner.build_step() {
            pruner.commit();
        }
    }
    println!(
        "final tree: {} nodes, depth {}",
        pruner.tree().node_count(),
        pruner.tree().compute_depth()
    );
}
