// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

// After you edit the crate's doc comment, run this command, then check README.md for any missing links
// cargo rdme --workspace-project=understory_pruner --heading-base-level=0

//! Understory Pruner: an incremental broad-phase index for dynamic 3D boxes.
//!
//! Understory Pruner filters a dynamic set of axis-aligned boxes down to the few a
//! ray, volume, or sweep can touch, so exact narrow-phase tests only run on those.
//!
//! - Store boxes with opaque payloads and get stable [`Handle`]s back.
//! - Query by ray, overlap with a [`QueryShape`], or sweep a shape along a direction.
//! - Callbacks may shrink the query distance for nearest-hit searches or stop early.
//!
//! The pruner keeps three structures consistent:
//!
//! - A [`BoundingVolumeTree`] with compressed, always-conservative node boxes.
//! - A second tree rebuilt in the background, a bounded slice per
//!   [`IncrementalPruner::build_step`] call, so no single frame pays for a full rebuild.
//! - A [`BucketIndex`] holding objects neither tree covers yet.
//!
//! Moves are absorbed by refitting only the affected tree paths on
//! [`IncrementalPruner::commit`].
//!
//! # Example
//!
//! ```rust
//! use glam::Vec3;
//! use understory_pruner::{Aabb3, IncrementalPruner, Payload, PrunerConfig, SpatialQuery};
//!
//! let mut pruner = IncrementalPruner::new(PrunerConfig::default());
//! let handles = pruner
//!     .add_objects(
//!         &[
//!             Aabb3::new(Vec3::ZERO, Vec3::ONE),
//!             Aabb3::new(Vec3::splat(4.0), Vec3::splat(5.0)),
//!         ],
//!         &[Payload::from(1), Payload::from(2)],
//!     )
//!     .unwrap();
//! pruner.commit();
//!
//! // Nearest hit along +z: shrink the distance to the exact hit to prune farther boxes.
//! let origin = Vec3::new(0.5, 0.5, -5.0);
//! let mut nearest = None;
//! pruner.raycast(origin, Vec3::Z, 100.0, &mut |dist, hits| {
//!     let bounds = Aabb3::new(Vec3::ZERO, Vec3::ONE);
//!     if let Some(t) = bounds.ray_distance(origin, Vec3::Z, *dist) {
//!         *dist = t;
//!         nearest = Some(hits[0]);
//!     }
//!     true
//! });
//! assert_eq!(nearest, Some(Payload::from(1)));
//!
//! // Move the second box; the change is visible after the next commit.
//! pruner.update_objects(&[handles[1]], &[Aabb3::new(Vec3::splat(10.0), Vec3::splat(11.0))]);
//! pruner.commit();
//!
//! // Spread a rebuild over frames.
//! while !pruner.build_step() {}
//! pruner.commit();
//! ```
//!
//! ## Threading
//!
//! The pruner does no locking. Mutations, [`IncrementalPruner::build_step`] and
//! [`IncrementalPruner::commit`] need `&mut`; queries take `&self` and can run from
//! several threads between a commit and the next mutation.
//!
//! ### Float semantics
//!
//! Coordinates are assumed finite and below `1e33` in magnitude. Node compression
//! only guarantees conservative boxes within that range.

#![no_std]

extern crate alloc;

pub mod bucket;
pub mod builder;
pub mod config;
pub mod error;
pub mod map;
pub mod node;
pub mod pool;
pub mod pruner;
pub mod query;
pub mod shape;
pub mod tree;
pub mod types;

pub use bucket::BucketIndex;
pub use builder::{BuildSettings, SplitRule, TreeBuilder};
pub use config::PrunerConfig;
pub use error::{PartialAdd, PoolError};
pub use map::IndexMap;
pub use node::{NodeFlags, TreeNode};
pub use pool::ObjectPool;
pub use pruner::{BuildState, IncrementalPruner};
pub use query::{HitCallback, SpatialQuery};
pub use shape::QueryShape;
pub use tree::{BoundingVolumeTree, TraversalStats};
pub use types::{Aabb3, Handle, Payload};
