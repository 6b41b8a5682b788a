// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Query entry points shared by the pruner and the bucket index.

use glam::Vec3;

use crate::shape::QueryShape;
use crate::types::Payload;

/// Receives candidate payloads.
///
/// The `f32` holds the current maximum distance. Ray and sweep queries use the
/// lowered value, if any, to prune everything farther away. Overlap queries pass
/// `f32::MAX` and ignore changes. Returning `false` stops the query.
pub type HitCallback<'a> = dyn FnMut(&mut f32, &[Payload]) -> bool + 'a;

/// Broad-phase queries over a set of boxes.
///
/// Results are candidates: every box the query touches is reported, and a few
/// that it misses may be reported too. Each method returns `false` when the
/// callback stopped the query.
pub trait SpatialQuery {
    /// Cast a ray from `origin` along `dir` up to `max_dist`.
    fn raycast(
        &self,
        origin: Vec3,
        dir: Vec3,
        max_dist: f32,
        callback: &mut HitCallback<'_>,
    ) -> bool;

    /// Report boxes overlapping `shape`.
    fn overlap(&self, shape: &QueryShape, callback: &mut HitCallback<'_>) -> bool;

    /// Move the bounds of `shape` along `dir` up to `max_dist` and report boxes it touches.
    fn sweep(
        &self,
        shape: &QueryShape,
        dir: Vec3,
        max_dist: f32,
        callback: &mut HitCallback<'_>,
    ) -> bool;
}
