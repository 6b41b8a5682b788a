// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Top-down tree construction, either in one pass or in bounded steps.
//!
//! Every node's primitives are split in two by comparing each primitive's center
//! with the center of the node's box along one axis. Primitives on the positive
//! side go to the first child. A split that leaves one side empty is replaced by
//! an even split, so building always terminates, even for coincident boxes.
//!
//! Children are allocated as adjacent pairs after their parent, so a child's
//! index is always greater than its parent's.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt::Debug;

use glam::Vec3;

use crate::node::{NO_NODE, TreeNode};
use crate::tree::BoundingVolumeTree;
use crate::types::Aabb3;

/// How a node's primitives are split.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SplitRule {
    /// Split along the axis where the node box is longest.
    LargestAxis,
    /// Split along the axis where primitive centers have the greatest variance.
    #[default]
    SplatterPoints,
    /// Try all three axes and keep the one closest to an even split.
    Balanced,
    /// Try axes from longest to shortest and keep the first non-empty split.
    BestAxis,
    /// Always split the primitive list in half, ignoring geometry.
    Fifty,
}

/// Settings shared by one-shot and progressive builds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BuildSettings {
    /// Split heuristic.
    pub rule: SplitRule,
    /// Nodes with this many primitives or fewer become leaves.
    pub leaf_limit: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            rule: SplitRule::default(),
            leaf_limit: 1,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Pending {
    node: u32,
    parent: u32,
    start: u32,
    count: u32,
}

/// Builds a [`BoundingVolumeTree`] from a snapshot of bounds.
///
/// The builder owns a copy of the bounds, so the source may change while a
/// progressive build is in flight.
#[derive(Clone, Default)]
pub struct TreeBuilder {
    settings: BuildSettings,
    bounds: Vec<Aabb3>,
    centers: Vec<Vec3>,
    queue: VecDeque<Pending>,
    node_count: usize,
    total_prims: usize,
    invalid_splits: usize,
}

impl Debug for TreeBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TreeBuilder")
            .field("settings", &self.settings)
            .field("primitives", &self.bounds.len())
            .field("pending", &self.queue.len())
            .field("node_count", &self.node_count)
            .field("total_prims", &self.total_prims)
            .finish_non_exhaustive()
    }
}

impl TreeBuilder {
    /// Create a builder with no primitives.
    pub fn new(settings: BuildSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Create a builder over a copy of `bounds`.
    pub fn from_bounds(settings: BuildSettings, bounds: &[Aabb3]) -> Self {
        let mut builder = Self::new(settings);
        builder.reset(bounds);
        builder
    }

    /// Build settings.
    pub fn settings(&self) -> BuildSettings {
        self.settings
    }

    /// Replace the snapshot with a copy of `bounds` and clear all progress.
    pub fn reset(&mut self, bounds: &[Aabb3]) {
        self.bounds.clear();
        self.bounds.extend_from_slice(bounds);
        self.centers.clear();
        self.centers.extend(bounds.iter().map(Aabb3::center));
        self.queue.clear();
        self.node_count = 0;
        self.total_prims = 0;
        self.invalid_splits = 0;
    }

    /// Drop the snapshot. Counters of the last build stay readable.
    pub fn release(&mut self) {
        self.bounds = Vec::new();
        self.centers = Vec::new();
        self.queue = VecDeque::new();
    }

    /// Number of primitives in the snapshot.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// The snapshot.
    pub fn bounds(&self) -> &[Aabb3] {
        &self.bounds
    }

    /// Nodes allocated so far.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Work done so far: the sum of primitive counts over all expanded nodes.
    pub fn total_prims(&self) -> usize {
        self.total_prims
    }

    /// Splits that had to fall back to an even split.
    pub fn invalid_splits(&self) -> usize {
        self.invalid_splits
    }

    /// Whether no expansions are pending.
    pub fn is_finished(&self) -> bool {
        self.queue.is_empty()
    }

    /// Translate the snapshot by `-shift`.
    pub fn shift_origin(&mut self, shift: Vec3) {
        for b in &mut self.bounds {
            *b = b.translated(-shift);
        }
        for c in &mut self.centers {
            *c -= shift;
        }
    }

    /// Reset `tree` and queue the root for expansion.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Primitive counts are 32-bit; trees never hold more than u32::MAX primitives."
    )]
    pub(crate) fn begin(&mut self, tree: &mut BoundingVolumeTree) {
        let n = self.bounds.len();
        tree.reset_for_build(n);
        self.queue.clear();
        self.node_count = 0;
        self.total_prims = 0;
        self.invalid_splits = 0;
        if n == 0 {
            return;
        }
        tree.nodes.push(TreeNode::default());
        self.node_count = 1;
        self.queue.push_back(Pending {
            node: 0,
            parent: NO_NODE,
            start: 0,
            count: n as u32,
        });
    }

    /// Expand queued nodes breadth-first until `work_limit` primitives were
    /// processed. Returns true when the tree is complete.
    pub(crate) fn step(&mut self, tree: &mut BoundingVolumeTree, work_limit: usize) -> bool {
        let mut work = 0;
        while let Some(pending) = self.queue.pop_front() {
            work += self.expand(tree, pending);
            if work >= work_limit {
                break;
            }
        }
        let done = self.queue.is_empty();
        if done {
            self.finish(tree);
        }
        done
    }

    /// Build the whole tree depth-first.
    pub(crate) fn run(&mut self, tree: &mut BoundingVolumeTree) {
        self.begin(tree);
        while let Some(pending) = self.queue.pop_back() {
            self.expand(tree, pending);
        }
        self.finish(tree);
    }

    /// Nodes are compressed from the exact union of their primitives, so a rounded
    /// child can stick out of its rounded parent. Refit bottom-up so every parent
    /// covers its children's stored boxes.
    fn finish(&self, tree: &mut BoundingVolumeTree) {
        tree.refit_all(&self.bounds);
        tree.total_prims = self.total_prims;
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "Node and primitive indices are 32-bit."
    )]
    fn expand(&mut self, tree: &mut BoundingVolumeTree, pending: Pending) -> usize {
        let start = pending.start as usize;
        let count = pending.count as usize;
        let slots = &mut tree.indices[start..start + count];
        let node_bounds = slots
            .iter()
            .fold(Aabb3::EMPTY, |acc, &i| acc.union(&self.bounds[i as usize]));
        self.total_prims += count;

        let split =
            (count > self.settings.leaf_limit.max(1)).then(|| self.subdivide(slots, &node_bounds));

        let node = &mut tree.nodes[pending.node as usize];
        node.parent = pending.parent;
        node.set_bounds(&node_bounds);
        match split {
            None => node.make_leaf(pending.start, pending.count),
            Some(nb_pos) => {
                let first = self.node_count as u32;
                node.make_internal(first);
                self.node_count += 2;
                tree.nodes.resize(self.node_count, TreeNode::default());
                let nb_pos = nb_pos as u32;
                self.queue.push_back(Pending {
                    node: first,
                    parent: pending.node,
                    start: pending.start,
                    count: nb_pos,
                });
                self.queue.push_back(Pending {
                    node: first + 1,
                    parent: pending.node,
                    start: pending.start + nb_pos,
                    count: pending.count - nb_pos,
                });
            }
        }
        count
    }

    /// Reorder `slots` and return the size of the positive half, in `1..slots.len()`.
    fn subdivide(&mut self, slots: &mut [u32], node_bounds: &Aabb3) -> usize {
        let count = slots.len();
        let center = node_bounds.center();
        let centers = &self.centers;
        let nb_pos = match self.settings.rule {
            SplitRule::LargestAxis => {
                let axis = largest_axis(node_bounds.extents());
                partition(slots, centers, axis, center[axis])
            }
            SplitRule::SplatterPoints => {
                let axis = largest_axis(variance(slots, centers));
                partition(slots, centers, axis, center[axis])
            }
            SplitRule::Balanced => {
                let mut best_axis = 0;
                let mut best_score = f32::MAX;
                for axis in 0..3 {
                    let nb = partition(slots, centers, axis, center[axis]);
                    let off = nb as f32 / count as f32 - 0.5;
                    let score = off * off;
                    if score < best_score {
                        best_score = score;
                        best_axis = axis;
                    }
                }
                partition(slots, centers, best_axis, center[best_axis])
            }
            SplitRule::BestAxis => {
                let e = node_bounds.extents();
                let mut axes = [0, 1, 2];
                axes.sort_unstable_by(|&a, &b| e[b].total_cmp(&e[a]));
                let mut nb = 0;
                for axis in axes {
                    nb = partition(slots, centers, axis, center[axis]);
                    if nb != 0 && nb != count {
                        break;
                    }
                }
                nb
            }
            SplitRule::Fifty => count / 2,
        };
        if nb_pos == 0 || nb_pos == count {
            self.invalid_splits += 1;
            count / 2
        } else {
            nb_pos
        }
    }
}

fn largest_axis(v: Vec3) -> usize {
    if v.x >= v.y && v.x >= v.z {
        0
    } else if v.y >= v.z {
        1
    } else {
        2
    }
}

fn variance(slots: &[u32], centers: &[Vec3]) -> Vec3 {
    let n = slots.len() as f32;
    let mean = slots
        .iter()
        .fold(Vec3::ZERO, |acc, &i| acc + centers[i as usize])
        / n;
    slots.iter().fold(Vec3::ZERO, |acc, &i| {
        let d = centers[i as usize] - mean;
        acc + d * d
    }) / n
}

/// Move slots whose center lies above `value` on `axis` to the front.
fn partition(slots: &mut [u32], centers: &[Vec3], axis: usize, value: f32) -> usize {
    let mut nb_pos = 0;
    for i in 0..slots.len() {
        if centers[slots[i] as usize][axis] > value {
            slots.swap(i, nb_pos);
            nb_pos += 1;
        }
    }
    nb_pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn row(n: usize) -> Vec<Aabb3> {
        (0..n)
            .map(|i| {
                let x = i as f32 * 2.0;
                Aabb3::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 1.0, 1.0))
            })
            .collect()
    }

    fn build(settings: BuildSettings, bounds: &[Aabb3]) -> (BoundingVolumeTree, TreeBuilder) {
        let mut builder = TreeBuilder::from_bounds(settings, bounds);
        let mut tree = BoundingVolumeTree::new();
        tree.build(&mut builder);
        (tree, builder)
    }

    #[test]
    fn complete_binary_tree_for_leaf_limit_one() {
        for rule in [
            SplitRule::LargestAxis,
            SplitRule::SplatterPoints,
            SplitRule::Balanced,
            SplitRule::BestAxis,
            SplitRule::Fifty,
        ] {
            let bounds = row(37);
            let settings = BuildSettings {
                rule,
                leaf_limit: 1,
            };
            let (tree, _) = build(settings, &bounds);
            assert_eq!(tree.node_count(), 2 * 37 - 1, "rule {rule:?}");
            assert!(tree.validate(&bounds), "rule {rule:?}");
            let mut seen: Vec<u32> = tree.indices().to_vec();
            seen.sort_unstable();
            assert_eq!(seen, (0..37).collect::<Vec<u32>>(), "indices must be a permutation");
        }
    }

    #[test]
    fn coincident_boxes_fall_back_to_even_splits() {
        let bounds = vec![Aabb3::new(Vec3::ZERO, Vec3::ONE); 16];
        let (tree, builder) = build(BuildSettings::default(), &bounds);
        assert_eq!(tree.node_count(), 31);
        assert_eq!(tree.compute_depth(), 5, "even splits give a balanced tree");
        assert_eq!(builder.invalid_splits(), 15);
    }

    #[test]
    fn leaf_limit_groups_primitives() {
        let bounds = row(16);
        let settings = BuildSettings {
            rule: SplitRule::LargestAxis,
            leaf_limit: 4,
        };
        let (tree, _) = build(settings, &bounds);
        assert_eq!(tree.node_count(), 7);
        for node in tree.nodes() {
            if let Some(slots) = node.primitive_slots() {
                assert_eq!(slots.len(), 4);
            }
        }
        assert!(tree.validate(&bounds));
    }

    #[test]
    fn empty_and_single_inputs() {
        let (tree, _) = build(BuildSettings::default(), &[]);
        assert!(tree.is_empty());
        assert_eq!(tree.node_count(), 0);

        let one = row(1);
        let (tree, builder) = build(BuildSettings::default(), &one);
        assert_eq!(tree.node_count(), 1);
        assert!(tree.nodes()[0].is_leaf());
        assert_eq!(builder.total_prims(), 1);
    }

    #[test]
    fn progressive_matches_one_shot() {
        let bounds = row(100);
        let (one_shot, full) = build(BuildSettings::default(), &bounds);

        let mut builder = TreeBuilder::from_bounds(BuildSettings::default(), &bounds);
        let mut tree = BoundingVolumeTree::new();
        tree.start_progressive_build(&mut builder);
        let mut steps = 0;
        while !tree.progressive_build(&mut builder, 50) {
            steps += 1;
            assert!(steps < 1000, "progressive build must terminate");
        }
        assert!(steps > 1, "work limit should spread the build over several calls");
        assert_eq!(tree.node_count(), one_shot.node_count());
        assert_eq!(builder.total_prims(), full.total_prims());
        assert_eq!(tree.total_prims(), full.total_prims());
        assert!(tree.validate(&bounds));
    }

    #[test]
    fn parents_contain_rounded_children() {
        let bounds = row(16);
        let check = |tree: &BoundingVolumeTree| {
            for (index, node) in tree.nodes().iter().enumerate() {
                if let Some((a, b)) = node.children() {
                    for child in [a, b] {
                        let inner = tree.nodes()[child].bounds();
                        assert!(
                            node.bounds().contains(&inner),
                            "node {index} {:?} does not contain child {child} {inner:?}",
                            node.bounds()
                        );
                    }
                }
            }
            assert!(tree.validate(&bounds));
        };

        let (tree, _) = build(BuildSettings::default(), &bounds);
        check(&tree);

        let mut builder = TreeBuilder::from_bounds(BuildSettings::default(), &bounds);
        let mut tree = BoundingVolumeTree::new();
        tree.start_progressive_build(&mut builder);
        while !tree.progressive_build(&mut builder, 4) {}
        check(&tree);
    }

    #[test]
    fn row_builds_logarithmic_depth() {
        let bounds = row(1024);
        let (tree, _) = build(BuildSettings::default(), &bounds);
        assert!(tree.compute_depth() <= 12, "depth {}", tree.compute_depth());
    }
}
