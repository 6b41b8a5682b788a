// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Incremental pruner: a live tree, a tree rebuilt in the background, and a bucket
//! index for objects neither tree covers yet.
//!
//! ## Build cycle
//!
//! [`IncrementalPruner::build_step`] walks through [`BuildState`]:
//!
//! - `NotStarted`: waits until a mutation asks for a new tree.
//! - `Init`: snapshots the pool bounds into the builder.
//! - `InProgress`: expands a bounded slice of the background tree per call.
//! - `Finished`: waits for [`IncrementalPruner::commit`] to swap trees.
//!
//! Objects added after the live tree was built sit in the bucket index. When the
//! background tree is swapped in, entries it covers leave the bucket.
//!
//! Removals move the pool's last object into the hole. Removals that happen after
//! the snapshot are recorded and replayed against the new tree when it is swapped in.
//!
//! ## Queries
//!
//! Queries visit the live tree first, then the bucket index. They must run after
//! [`IncrementalPruner::commit`] and before the next mutation.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt::Debug;

use glam::Vec3;

use crate::builder::TreeBuilder;
use crate::bucket::BucketIndex;
use crate::config::PrunerConfig;
use crate::error::{PartialAdd, PoolError};
use crate::map::IndexMap;
use crate::pool::ObjectPool;
use crate::query::{HitCallback, SpatialQuery};
use crate::shape::QueryShape;
use crate::tree::BoundingVolumeTree;
use crate::types::{Aabb3, Handle, Payload};

/// Calls `build_step` spends outside the progressive expansion (start and snapshot),
/// plus one call of margin.
const FIXED_STEPS: u32 = 3;

/// Progress of the background rebuild.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BuildState {
    /// No rebuild is running.
    #[default]
    NotStarted,
    /// A rebuild was requested; the next step takes the snapshot.
    Init,
    /// The background tree is being expanded.
    InProgress,
    /// The background tree is complete and waits for a commit.
    Finished,
}

impl BuildState {
    /// Whether the background build has taken its snapshot of the pool.
    fn has_snapshot(self) -> bool {
        matches!(self, Self::InProgress | Self::Finished)
    }
}

/// Removal recorded while a background build is running.
#[derive(Copy, Clone, Debug)]
struct Fixup {
    removed: usize,
    relocated: usize,
}

/// Dynamic set of boxes with amortized tree rebuilds.
///
/// Mutations apply to the pool right away. Call [`Self::commit`] before querying,
/// and [`Self::build_step`] once per frame to progress background rebuilds.
#[derive(Clone)]
pub struct IncrementalPruner {
    config: PrunerConfig,
    pool: ObjectPool,
    tree: BoundingVolumeTree,
    map: IndexMap,
    bucket: BucketIndex,
    /// Handles of objects stored in the bucket.
    in_bucket: BTreeSet<Handle>,
    background: BoundingVolumeTree,
    builder: TreeBuilder,
    /// Bucket objects covered by the background snapshot.
    absorbed: BTreeSet<Handle>,
    fixups: Vec<Fixup>,
    state: BuildState,
    needs_new_tree: bool,
    mutated_during_build: bool,
    uncommitted: bool,
    rebuild_rate_hint: u32,
    step_calls: u32,
    estimated_work: usize,
    base_estimate: usize,
    correction: f32,
}

impl Debug for IncrementalPruner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IncrementalPruner")
            .field("objects", &self.pool.len())
            .field("tree_nodes", &self.tree.node_count())
            .field("bucket", &self.bucket.len())
            .field("state", &self.state)
            .field("needs_new_tree", &self.needs_new_tree)
            .field("uncommitted", &self.uncommitted)
            .finish_non_exhaustive()
    }
}

impl Default for IncrementalPruner {
    fn default() -> Self {
        Self::new(PrunerConfig::default())
    }
}

impl IncrementalPruner {
    /// Create an empty pruner.
    pub fn new(config: PrunerConfig) -> Self {
        let pool = match config.max_objects {
            Some(max) => ObjectPool::with_max_objects(max),
            None => ObjectPool::new(),
        };
        let rebuild_rate_hint = clamp_hint(config.rebuild_rate_hint);
        Self {
            pool,
            tree: BoundingVolumeTree::new(),
            map: IndexMap::new(),
            bucket: BucketIndex::new(config.bucket_free_capacity),
            in_bucket: BTreeSet::new(),
            background: BoundingVolumeTree::new(),
            builder: TreeBuilder::new(config.build),
            absorbed: BTreeSet::new(),
            fixups: Vec::new(),
            state: BuildState::NotStarted,
            needs_new_tree: false,
            mutated_during_build: false,
            uncommitted: false,
            rebuild_rate_hint,
            step_calls: 0,
            estimated_work: 0,
            base_estimate: 0,
            correction: 1.0,
            config,
        }
    }

    /// The configuration the pruner was created with.
    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Whether no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Progress of the background rebuild.
    pub fn build_state(&self) -> BuildState {
        self.state
    }

    /// Whether mutations happened since the last [`Self::commit`].
    pub fn has_uncommitted_changes(&self) -> bool {
        self.uncommitted
    }

    /// The object storage.
    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    /// The tree queries run against.
    pub fn tree(&self) -> &BoundingVolumeTree {
        &self.tree
    }

    /// Mapping from pool indices to leaves of [`Self::tree`].
    pub fn index_map(&self) -> &IndexMap {
        &self.map
    }

    /// Index of objects the live tree does not cover.
    pub fn bucket(&self) -> &BucketIndex {
        &self.bucket
    }

    /// Payload of a live handle.
    pub fn get_payload(&self, handle: Handle) -> Option<Payload> {
        self.pool.payload(handle)
    }

    /// Current bounds of a live handle.
    pub fn get_bounds(&self, handle: Handle) -> Option<Aabb3> {
        self.pool.get(handle).map(|(bounds, _)| bounds)
    }

    /// Number of [`Self::build_step`] calls a rebuild should take.
    pub fn rebuild_rate_hint(&self) -> u32 {
        self.rebuild_rate_hint
    }

    /// Set the number of [`Self::build_step`] calls a rebuild should take.
    ///
    /// Values of 3 or less are raised to 4.
    pub fn set_rebuild_rate_hint(&mut self, hint: u32) {
        debug_assert!(hint > FIXED_STEPS, "rebuild rate hint must be greater than 3");
        self.rebuild_rate_hint = clamp_hint(hint);
    }

    /// Store a batch of objects and return their handles in batch order.
    ///
    /// Payloads must be distinct among objects that are not in the live tree yet.
    /// If storage runs out, the objects stored so far are kept and reported in the
    /// error.
    pub fn add_objects(
        &mut self,
        bounds: &[Aabb3],
        payloads: &[Payload],
    ) -> Result<Vec<Handle>, PartialAdd> {
        debug_assert_eq!(
            bounds.len(),
            payloads.len(),
            "every box needs a payload"
        );
        let count = bounds.len().min(payloads.len());
        let mut added = Vec::new();
        if added.try_reserve(count).is_err() {
            return Err(PartialAdd {
                added,
                error: PoolError::AllocationFailed { requested: count },
            });
        }
        if count > 0 {
            self.uncommitted = true;
        }
        for (b, p) in bounds.iter().zip(payloads) {
            match self.pool.add(*b, *p) {
                Ok(handle) => {
                    added.push(handle);
                    self.track_added(handle, *b, *p);
                }
                Err(error) => {
                    log::warn!("stored {} of {count} objects: {error}", added.len());
                    return Err(PartialAdd { added, error });
                }
            }
        }
        Ok(added)
    }

    fn track_added(&mut self, handle: Handle, bounds: Aabb3, payload: Payload) {
        self.request_rebuild();
        if !self.config.incremental || self.tree.is_empty() {
            // The next commit builds a tree that covers this object.
            return;
        }
        if self.bucket.add(payload, bounds) {
            self.in_bucket.insert(handle);
        } else {
            debug_assert!(false, "payload {payload:?} is already pending");
            log::warn!("payload {payload:?} is already pending; object stays hidden until the next rebuild");
        }
    }

    /// Remove a batch of objects. Stale handles are ignored.
    pub fn remove_objects(&mut self, handles: &[Handle]) {
        if handles.is_empty() {
            return;
        }
        self.uncommitted = true;
        for &handle in handles {
            self.remove_object(handle);
        }
        if self.pool.is_empty() {
            log::debug!("pool is empty, releasing all structures");
            self.release_structures();
        }
    }

    fn remove_object(&mut self, handle: Handle) {
        let Some(index) = self.pool.index_of(handle) else {
            debug_assert!(false, "removing stale handle {handle:?}");
            return;
        };
        if self.in_bucket.remove(&handle) {
            let payload = self.pool.payloads()[index];
            self.bucket.remove(&payload);
        }
        let leaf = self.map.get(index);
        let Some(relocated) = self.pool.remove(handle) else {
            return;
        };
        self.map.invalidate(index, relocated, &mut self.tree);
        if let Some(leaf) = leaf {
            self.tree.mark_for_refit(leaf);
        }
        if self.state.has_snapshot() {
            self.fixups.push(Fixup {
                removed: index,
                relocated,
            });
        }
        self.request_rebuild();
    }

    /// Replace the bounds of a batch of objects. Stale handles are ignored.
    pub fn update_objects(&mut self, handles: &[Handle], bounds: &[Aabb3]) {
        debug_assert_eq!(handles.len(), bounds.len(), "every handle needs a box");
        if handles.is_empty() {
            return;
        }
        self.uncommitted = true;
        for (&handle, b) in handles.iter().zip(bounds) {
            self.update_object(handle, *b);
        }
    }

    fn update_object(&mut self, handle: Handle, bounds: Aabb3) {
        let Some(index) = self.pool.index_of(handle) else {
            debug_assert!(false, "updating stale handle {handle:?}");
            return;
        };
        self.pool.update(handle, bounds);
        if self.in_bucket.contains(&handle) {
            self.bucket.update(self.pool.payloads()[index], bounds);
        } else if let Some(leaf) = self.map.get(index) {
            self.tree.mark_for_refit(leaf);
        }
        if self.config.incremental {
            self.request_rebuild();
        }
    }

    fn request_rebuild(&mut self) {
        self.needs_new_tree = true;
        if self.state.has_snapshot() {
            self.mutated_during_build = true;
        }
    }

    /// Make all mutations visible to queries.
    ///
    /// Swaps in the background tree if it is finished, otherwise refits the live
    /// tree where objects moved.
    pub fn commit(&mut self) {
        self.uncommitted = false;
        if self.pool.is_empty() {
            return;
        }
        if !self.config.incremental {
            if self.needs_new_tree || self.tree.is_empty() {
                self.full_rebuild();
            } else {
                self.tree.refit_marked(self.pool.bounds());
            }
            return;
        }
        if self.tree.is_empty() {
            self.full_rebuild();
            return;
        }
        if self.state == BuildState::Finished {
            self.swap_trees();
        } else {
            self.tree.refit_marked(self.pool.bounds());
        }
        self.bucket.build();
    }

    /// Advance the background rebuild by one bounded slice of work.
    ///
    /// Returns true when the background tree is complete and waits for
    /// [`Self::commit`]. A rebuild started from [`BuildState::NotStarted`] finishes
    /// within [`Self::rebuild_rate_hint`] calls. Pruners in static mode rebuild on
    /// commit and always return true.
    pub fn build_step(&mut self) -> bool {
        if !self.config.incremental {
            return true;
        }
        match self.state {
            BuildState::NotStarted => {
                if self.needs_new_tree && !self.pool.is_empty() {
                    log::debug!("starting background rebuild of {} objects", self.pool.len());
                    self.state = BuildState::Init;
                }
                false
            }
            BuildState::Init => {
                self.take_snapshot();
                self.state = BuildState::InProgress;
                false
            }
            BuildState::InProgress => {
                let limit = self.step_limit();
                if self.background.progressive_build(&mut self.builder, limit) {
                    log::debug!(
                        "background tree finished after {} steps: {} nodes, {} work units",
                        self.step_calls,
                        self.background.node_count(),
                        self.builder.total_prims()
                    );
                    self.state = BuildState::Finished;
                    true
                } else {
                    false
                }
            }
            BuildState::Finished => true,
        }
    }

    fn take_snapshot(&mut self) {
        let n = self.pool.len();
        self.builder.reset(self.pool.bounds());
        self.background.start_progressive_build(&mut self.builder);
        self.absorbed.clone_from(&self.in_bucket);
        self.fixups.clear();
        self.needs_new_tree = false;
        self.mutated_during_build = false;
        self.step_calls = 0;
        self.base_estimate = self.work_estimate(n);
        self.estimated_work = scale_work(self.base_estimate, self.correction);
        log::trace!(
            "snapshot of {n} objects, estimated {} work units",
            self.estimated_work
        );
    }

    /// Structural work estimate for building `n` primitives, taken from the live tree
    /// when its size is comparable.
    fn work_estimate(&self, n: usize) -> usize {
        let structural = n * (n.max(1).ilog2() as usize + 1);
        let previous = self.tree.total_prims();
        if previous > 0 && previous / 2 <= structural && structural <= previous * 2 {
            previous
        } else {
            structural.max(1)
        }
    }

    fn step_limit(&mut self) -> usize {
        self.step_calls += 1;
        let budget = (self.rebuild_rate_hint - FIXED_STEPS) as usize;
        let calls = self.step_calls as usize;
        if calls >= budget {
            return usize::MAX;
        }
        let left_work = self.estimated_work.saturating_sub(self.builder.total_prims());
        let left_calls = budget - calls + 1;
        1 + (self.estimated_work / budget).max(left_work / left_calls)
    }

    fn swap_trees(&mut self) {
        core::mem::swap(&mut self.tree, &mut self.background);
        self.background.release();
        let covered = self.pool.len().max(self.builder.len());
        self.map.init(covered, &self.tree);
        for fixup in self.fixups.drain(..) {
            self.map.invalidate(fixup.removed, fixup.relocated, &mut self.tree);
        }
        self.tree.refit_all(self.pool.bounds());

        for handle in core::mem::take(&mut self.absorbed) {
            if !self.in_bucket.remove(&handle) {
                continue;
            }
            if let Some(payload) = self.pool.payload(handle) {
                self.bucket.remove(&payload);
            }
        }

        let actual = self.builder.total_prims();
        if self.base_estimate > 0 {
            let ratio = actual as f32 / self.base_estimate as f32;
            self.correction = (0.75 * self.correction + 0.25 * ratio).clamp(0.25, 4.0);
        }
        self.builder.release();
        self.state = BuildState::NotStarted;
        self.needs_new_tree = !self.in_bucket.is_empty() || self.mutated_during_build;
        self.mutated_during_build = false;
        log::debug!(
            "swapped in new tree: {} nodes, {} objects still pending, rebuild again: {}",
            self.tree.node_count(),
            self.in_bucket.len(),
            self.needs_new_tree
        );
    }

    fn full_rebuild(&mut self) {
        log::debug!("full rebuild of {} objects", self.pool.len());
        self.builder.reset(self.pool.bounds());
        self.tree.build(&mut self.builder);
        self.builder.release();
        self.map.init(self.pool.len(), &self.tree);
        self.bucket.release();
        self.in_bucket.clear();
        self.absorbed.clear();
        self.background.release();
        self.fixups.clear();
        self.state = BuildState::NotStarted;
        self.needs_new_tree = false;
        self.mutated_during_build = false;
    }

    fn release_structures(&mut self) {
        self.tree.release();
        self.background.release();
        self.builder.release();
        self.map.release();
        self.bucket.release();
        self.in_bucket.clear();
        self.absorbed.clear();
        self.fixups.clear();
        self.state = BuildState::NotStarted;
        self.needs_new_tree = false;
        self.mutated_during_build = false;
    }

    /// Remove every object and release all memory. Outstanding handles become stale.
    pub fn purge(&mut self) {
        self.pool.release();
        self.release_structures();
        self.uncommitted = false;
    }

    /// Translate every object by `-shift`.
    pub fn shift_origin(&mut self, shift: Vec3) {
        self.pool.shift_origin(shift);
        self.tree.refit_all(self.pool.bounds());
        if self.state.has_snapshot() {
            self.builder.shift_origin(shift);
        }
        self.bucket.shift_origin(shift);
        self.bucket.build();
    }

    /// Like [`SpatialQuery::raycast`], but reports the final maximum distance through
    /// `max_dist`.
    pub fn raycast_with_distance(
        &self,
        origin: Vec3,
        dir: Vec3,
        max_dist: &mut f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        debug_assert!(!self.uncommitted, "query before commit");
        if !self
            .tree
            .raycast(self.pool.payloads(), origin, dir, max_dist, callback)
        {
            return false;
        }
        self.bucket.is_empty()
            || self
                .bucket
                .raycast_with_distance(origin, dir, max_dist, callback)
    }

    /// Like [`SpatialQuery::sweep`], but reports the final maximum distance through
    /// `max_dist`.
    pub fn sweep_with_distance(
        &self,
        shape: &QueryShape,
        dir: Vec3,
        max_dist: &mut f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        debug_assert!(!self.uncommitted, "query before commit");
        if !self
            .tree
            .sweep(self.pool.payloads(), shape, dir, max_dist, callback)
        {
            return false;
        }
        self.bucket.is_empty()
            || self
                .bucket
                .sweep_with_distance(shape, dir, max_dist, callback)
    }
}

impl SpatialQuery for IncrementalPruner {
    fn raycast(
        &self,
        origin: Vec3,
        dir: Vec3,
        mut max_dist: f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        self.raycast_with_distance(origin, dir, &mut max_dist, callback)
    }

    fn overlap(&self, shape: &QueryShape, callback: &mut HitCallback<'_>) -> bool {
        debug_assert!(!self.uncommitted, "query before commit");
        if !self.tree.overlap(self.pool.payloads(), shape, callback) {
            return false;
        }
        self.bucket.is_empty() || self.bucket.overlap(shape, callback)
    }

    fn sweep(
        &self,
        shape: &QueryShape,
        dir: Vec3,
        mut max_dist: f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        self.sweep_with_distance(shape, dir, &mut max_dist, callback)
    }
}

fn clamp_hint(hint: u32) -> u32 {
    hint.max(FIXED_STEPS + 1)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    reason = "Work estimates are heuristics; precision loss is harmless."
)]
fn scale_work(base: usize, correction: f32) -> usize {
    ((base as f32 * correction) as usize).max(1)
}
