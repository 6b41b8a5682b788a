// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Array-backed bounding-volume tree with compressed nodes.
//!
//! The root is node 0. An internal node stores the index of its first child; the
//! second child is stored right after it. Leaves reference a range of the tree's
//! index array, which maps primitive slots to pool indices.
//!
//! Bounds are kept current in two ways:
//! - [`BoundingVolumeTree::refit_all`] recomputes every node bottom-up.
//! - [`BoundingVolumeTree::mark_for_refit`] flags a leaf and its ancestors, and
//!   [`BoundingVolumeTree::refit_marked`] recomputes only the flagged nodes.

use alloc::vec::Vec;
use core::fmt::Debug;

use glam::Vec3;

use crate::builder::TreeBuilder;
use crate::node::{NodeFlags, TreeNode};
use crate::query::HitCallback;
use crate::shape::{OverlapTest, QueryShape, RayTest};
use crate::types::{Aabb3, Payload};

/// Counters collected during a traversal.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TraversalStats {
    /// Nodes whose box was tested against the query.
    pub nodes_visited: usize,
}

/// Bounding-volume tree over pool indices.
#[derive(Clone, Default)]
pub struct BoundingVolumeTree {
    pub(crate) nodes: Vec<TreeNode>,
    pub(crate) indices: Vec<u32>,
    pub(crate) total_prims: usize,
    marked: Vec<u32>,
}

impl Debug for BoundingVolumeTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoundingVolumeTree")
            .field("nodes", &self.nodes.len())
            .field("primitives", &self.indices.len())
            .field("marked", &self.marked.len())
            .finish_non_exhaustive()
    }
}

impl BoundingVolumeTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the whole tree from the builder's snapshot.
    pub fn build(&mut self, builder: &mut TreeBuilder) {
        builder.run(self);
    }

    /// Reset the tree and prepare a build driven by [`Self::progressive_build`].
    pub fn start_progressive_build(&mut self, builder: &mut TreeBuilder) {
        builder.begin(self);
    }

    /// Expand nodes until about `work_limit` primitives were processed.
    /// Returns true once the tree is complete.
    pub fn progressive_build(&mut self, builder: &mut TreeBuilder, work_limit: usize) -> bool {
        builder.step(self, work_limit)
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "Primitive indices are 32-bit."
    )]
    pub(crate) fn reset_for_build(&mut self, nb_prims: usize) {
        self.nodes.clear();
        self.nodes.reserve((2 * nb_prims).saturating_sub(1));
        self.indices.clear();
        self.indices.extend((0..nb_prims).map(|i| i as u32));
        self.total_prims = 0;
        self.marked.clear();
    }

    /// Drop all nodes and release memory.
    pub fn release(&mut self) {
        *self = Self::default();
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes in array order.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Primitive slot to pool index mapping.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Work units spent building this tree (sum of primitive counts over all nodes).
    pub fn total_prims(&self) -> usize {
        self.total_prims
    }

    /// Bounds of the root, or [`Aabb3::EMPTY`] for an empty tree.
    pub fn root_bounds(&self) -> Aabb3 {
        self.nodes.first().map_or(Aabb3::EMPTY, TreeNode::bounds)
    }

    /// Pool indices referenced by a leaf.
    pub fn leaf_primitives(&self, node: usize) -> &[u32] {
        match self.nodes.get(node).and_then(TreeNode::primitive_slots) {
            Some(range) => &self.indices[range],
            None => &[],
        }
    }

    fn refit_node(&mut self, index: usize, boxes: &[Aabb3]) {
        let node = self.nodes[index];
        let b = match node.children() {
            Some((a, c)) => self.nodes[a].bounds().union(&self.nodes[c].bounds()),
            None => self
                .leaf_primitives(index)
                .iter()
                .fold(Aabb3::EMPTY, |acc, &p| {
                    acc.union(boxes.get(p as usize).unwrap_or(&Aabb3::EMPTY))
                }),
        };
        let node = &mut self.nodes[index];
        node.set_bounds(&b);
        node.flags.remove(NodeFlags::MARKED);
    }

    /// Recompute every node's box from `boxes` (indexed by pool index), bottom-up.
    pub fn refit_all(&mut self, boxes: &[Aabb3]) {
        // Children always follow their parent, so reverse order is bottom-up.
        for i in (0..self.nodes.len()).rev() {
            self.refit_node(i, boxes);
        }
        self.marked.clear();
    }

    /// Flag `node` and its ancestors for the next [`Self::refit_marked`].
    ///
    /// The walk stops at the first ancestor that is already flagged.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Node indices are 32-bit."
    )]
    pub fn mark_for_refit(&mut self, node: usize) {
        let mut index = node;
        while let Some(n) = self.nodes.get_mut(index) {
            if n.flags.contains(NodeFlags::MARKED) {
                break;
            }
            n.flags.insert(NodeFlags::MARKED);
            self.marked.push(index as u32);
            match n.parent() {
                Some(parent) => index = parent,
                None => break,
            }
        }
    }

    /// Number of nodes waiting for [`Self::refit_marked`].
    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    /// Recompute the boxes of flagged nodes only, children before parents.
    pub fn refit_marked(&mut self, boxes: &[Aabb3]) {
        if self.marked.is_empty() {
            return;
        }
        let mut marked = core::mem::take(&mut self.marked);
        marked.sort_unstable_by(|a, b| b.cmp(a));
        for &i in &marked {
            self.refit_node(i as usize, boxes);
        }
        marked.clear();
        self.marked = marked;
    }

    /// Drop `pool_index` from a leaf. Other primitives of the leaf are kept.
    pub(crate) fn remove_leaf_primitive(&mut self, node: usize, pool_index: u32) {
        let Some(n) = self.nodes.get_mut(node) else {
            return;
        };
        let Some(range) = n.primitive_slots() else {
            return;
        };
        let Some(pos) = self.indices[range.clone()]
            .iter()
            .position(|&p| p == pool_index)
        else {
            return;
        };
        self.indices.swap(range.start + pos, range.end - 1);
        n.nb_prims -= 1;
    }

    /// Make a leaf reference `to` where it referenced `from`.
    pub(crate) fn relocate_leaf_primitive(&mut self, node: usize, from: u32, to: u32) {
        let Some(range) = self.nodes.get(node).and_then(TreeNode::primitive_slots) else {
            return;
        };
        if let Some(slot) = self.indices[range].iter_mut().find(|p| **p == from) {
            *slot = to;
        }
    }

    /// Cast a ray and report candidate primitives front to back.
    ///
    /// `max_dist` is updated when the callback lowers its distance.
    pub fn raycast(
        &self,
        payloads: &[Payload],
        origin: Vec3,
        dir: Vec3,
        max_dist: &mut f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        let mut test = RayTest::new(origin, dir, *max_dist, Vec3::ZERO);
        self.ray_traverse(payloads, &mut test, max_dist, &mut TraversalStats::default(), callback)
    }

    /// Like [`Self::raycast`], also counting visited nodes into `stats`.
    pub fn raycast_with_stats(
        &self,
        payloads: &[Payload],
        origin: Vec3,
        dir: Vec3,
        max_dist: &mut f32,
        stats: &mut TraversalStats,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        let mut test = RayTest::new(origin, dir, *max_dist, Vec3::ZERO);
        self.ray_traverse(payloads, &mut test, max_dist, stats, callback)
    }

    /// Sweep the bounds of `shape` along `dir`.
    pub fn sweep(
        &self,
        payloads: &[Payload],
        shape: &QueryShape,
        dir: Vec3,
        max_dist: &mut f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        let mut test = RayTest::sweep(shape, dir, *max_dist);
        self.ray_traverse(payloads, &mut test, max_dist, &mut TraversalStats::default(), callback)
    }

    /// Report every primitive whose node boxes overlap `shape`.
    pub fn overlap(
        &self,
        payloads: &[Payload],
        shape: &QueryShape,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        self.overlap_with_stats(payloads, shape, &mut TraversalStats::default(), callback)
    }

    /// Like [`Self::overlap`], also counting visited nodes into `stats`.
    pub fn overlap_with_stats(
        &self,
        payloads: &[Payload],
        shape: &QueryShape,
        stats: &mut TraversalStats,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        if self.nodes.is_empty() {
            return true;
        }
        let test = OverlapTest::new(shape);
        let mut stack = Vec::with_capacity(32);
        stack.push(0_usize);
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            stats.nodes_visited += 1;
            if !test.overlaps(&node.bounds()) {
                continue;
            }
            match node.children() {
                Some((a, b)) => {
                    stack.push(b);
                    stack.push(a);
                }
                None => {
                    for &p in self.leaf_primitives(index) {
                        let Some(payload) = payloads.get(p as usize) else {
                            debug_assert!(false, "leaf references missing pool index {p}");
                            continue;
                        };
                        let mut dist = f32::MAX;
                        if !callback(&mut dist, core::slice::from_ref(payload)) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    fn ray_traverse(
        &self,
        payloads: &[Payload],
        test: &mut RayTest,
        max_dist: &mut f32,
        stats: &mut TraversalStats,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        if self.nodes.is_empty() {
            return true;
        }
        let mut stack = Vec::with_capacity(32);
        stack.push(0_usize);
        while let Some(mut index) = stack.pop() {
            loop {
                let node = &self.nodes[index];
                stats.nodes_visited += 1;
                if !test.hits(&node.bounds()) {
                    break;
                }
                let Some((a, b)) = node.children() else {
                    for &p in self.leaf_primitives(index) {
                        let Some(payload) = payloads.get(p as usize) else {
                            debug_assert!(false, "leaf references missing pool index {p}");
                            continue;
                        };
                        let mut dist = *max_dist;
                        if !callback(&mut dist, core::slice::from_ref(payload)) {
                            return false;
                        }
                        if dist < *max_dist {
                            *max_dist = dist;
                            test.set_max_dist(dist);
                        }
                    }
                    break;
                };
                // Descend into the child nearer along the ray; revisit the other later.
                let toward_b = (self.nodes[b].center() - self.nodes[a].center()).dot(test.dir);
                let (near, far) = if toward_b >= 0.0 { (a, b) } else { (b, a) };
                stack.push(far);
                index = near;
            }
        }
        true
    }

    /// Number of levels, 0 for an empty tree.
    pub fn compute_depth(&self) -> usize {
        let mut depth = 0;
        self.walk_with_depth(|_, _, d| {
            depth = depth.max(d);
            true
        });
        depth
    }

    /// Visit nodes in pre-order. The visitor gets the node index and returns whether
    /// to descend into its children.
    pub fn walk(&self, mut visitor: impl FnMut(usize, &TreeNode) -> bool) {
        self.walk_with_depth(|i, n, _| visitor(i, n));
    }

    fn walk_with_depth(&self, mut visitor: impl FnMut(usize, &TreeNode, usize) -> bool) {
        if self.nodes.is_empty() {
            return;
        }
        let mut stack = Vec::with_capacity(32);
        stack.push((0_usize, 1_usize));
        while let Some((index, depth)) = stack.pop() {
            let node = &self.nodes[index];
            if !visitor(index, node, depth) {
                continue;
            }
            if let Some((a, b)) = node.children() {
                stack.push((b, depth + 1));
                stack.push((a, depth + 1));
            }
        }
    }

    /// Check structural invariants and that every box contains its children and
    /// primitives (taken from `boxes`, indexed by pool index).
    pub fn validate(&self, boxes: &[Aabb3]) -> bool {
        let mut ok = true;
        let mut reached = 0_usize;
        self.walk(|index, node| {
            reached += 1;
            let b = node.bounds();
            match node.children() {
                Some((a, c)) => {
                    if c >= self.nodes.len() || a <= index {
                        ok = false;
                        return false;
                    }
                    for child in [a, c] {
                        let n = &self.nodes[child];
                        ok &= n.parent() == Some(index);
                        ok &= b.contains(&n.bounds());
                    }
                }
                None => {
                    for &p in self.leaf_primitives(index) {
                        match boxes.get(p as usize) {
                            Some(pb) => ok &= b.contains(pb),
                            None => ok = false,
                        }
                    }
                }
            }
            ok
        });
        ok && reached == self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildSettings;

    fn grid(n: usize) -> Vec<Aabb3> {
        let mut out = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    let min = Vec3::new(x as f32, y as f32, z as f32) * 3.0;
                    out.push(Aabb3::new(min, min + Vec3::ONE));
                }
            }
        }
        out
    }

    fn payloads(n: usize) -> Vec<Payload> {
        (0..n).map(Payload::from).collect()
    }

    fn build(boxes: &[Aabb3]) -> BoundingVolumeTree {
        let mut builder = TreeBuilder::from_bounds(BuildSettings::default(), boxes);
        let mut tree = BoundingVolumeTree::new();
        tree.build(&mut builder);
        tree
    }

    fn collect_overlap(tree: &BoundingVolumeTree, p: &[Payload], shape: &QueryShape) -> Vec<usize> {
        let mut hits = Vec::new();
        tree.overlap(p, shape, &mut |_, found| {
            hits.push(found[0].data[0]);
            true
        });
        hits.sort_unstable();
        hits
    }

    #[test]
    fn overlap_finds_exact_set() {
        let boxes = grid(4);
        let p = payloads(boxes.len());
        let tree = build(&boxes);
        let q = Aabb3::new(Vec3::splat(2.5), Vec3::splat(6.5));
        let hits = collect_overlap(&tree, &p, &QueryShape::Aabb(q));
        let expected: Vec<usize> = (0..boxes.len()).filter(|&i| boxes[i].intersects(&q)).collect();
        assert!(!expected.is_empty());
        for e in &expected {
            assert!(hits.contains(e), "missing {e}");
        }
    }

    #[test]
    fn raycast_nearest_shrinks_distance() {
        let boxes = grid(3);
        let p = payloads(boxes.len());
        let tree = build(&boxes);
        // Row at y = z = 0, boxes at x = 0, 3, 6.
        let origin = Vec3::new(-10.0, 0.5, 0.5);
        let mut max_dist = 100.0;
        let mut best = None;
        let mut calls = 0;
        tree.raycast(&p, origin, Vec3::X, &mut max_dist, &mut |dist, found| {
            calls += 1;
            let i = found[0].data[0];
            if let Some(t) = boxes[i].ray_distance(origin, Vec3::X, *dist) {
                *dist = t;
                best = Some(i);
            }
            true
        });
        assert_eq!(best, Some(0));
        assert!((max_dist - 10.0).abs() < 1e-5);
        assert_eq!(calls, 1, "front-to-back order with shrinking distance prunes the rest");
    }

    #[test]
    fn early_abort_stops_traversal() {
        let boxes = grid(3);
        let p = payloads(boxes.len());
        let tree = build(&boxes);
        let mut calls = 0;
        let finished = tree.overlap(
            &p,
            &QueryShape::Aabb(Aabb3::new(Vec3::splat(-1.0), Vec3::splat(100.0))),
            &mut |_, _| {
                calls += 1;
                false
            },
        );
        assert!(!finished);
        assert_eq!(calls, 1);
    }

    #[test]
    fn refit_marked_tracks_moves_and_is_idempotent() {
        let mut boxes = grid(3);
        let p = payloads(boxes.len());
        let mut tree = build(&boxes);
        boxes[5] = Aabb3::new(Vec3::splat(50.0), Vec3::splat(51.0));
        let leaf = (0..tree.node_count())
            .find(|&n| tree.leaf_primitives(n) == [5])
            .unwrap();
        tree.mark_for_refit(leaf);
        let depth = tree.compute_depth();
        assert!(tree.marked_count() <= depth);
        tree.refit_marked(&boxes);
        assert_eq!(tree.marked_count(), 0);
        assert!(tree.validate(&boxes));
        let once: Vec<Aabb3> = tree.nodes().iter().map(TreeNode::bounds).collect();
        tree.refit_marked(&boxes);
        let twice: Vec<Aabb3> = tree.nodes().iter().map(TreeNode::bounds).collect();
        assert_eq!(once, twice);

        let hits = collect_overlap(
            &tree,
            &p,
            &QueryShape::Sphere {
                center: Vec3::splat(50.5),
                radius: 0.1,
            },
        );
        assert_eq!(hits, [5]);
    }

    #[test]
    fn marking_stops_at_marked_ancestor() {
        let boxes = grid(2);
        let mut tree = build(&boxes);
        let leaves: Vec<usize> = (0..tree.node_count())
            .filter(|&n| tree.nodes()[n].is_leaf())
            .collect();
        tree.mark_for_refit(leaves[0]);
        let first = tree.marked_count();
        tree.mark_for_refit(leaves[0]);
        assert_eq!(tree.marked_count(), first, "re-marking is a no-op");
        tree.mark_for_refit(leaves[1]);
        assert!(tree.marked_count() < 2 * first);
    }

    #[test]
    fn removed_primitive_is_not_reported() {
        let boxes = grid(2);
        let p = payloads(boxes.len());
        let mut tree = build(&boxes);
        let leaf = (0..tree.node_count())
            .find(|&n| tree.leaf_primitives(n) == [3])
            .unwrap();
        tree.remove_leaf_primitive(leaf, 3);
        tree.mark_for_refit(leaf);
        tree.refit_marked(&boxes);
        assert!(tree.nodes()[leaf].is_empty());
        let everything = QueryShape::Aabb(Aabb3::new(Vec3::splat(-1.0), Vec3::splat(100.0)));
        let hits = collect_overlap(&tree, &p, &everything);
        assert_eq!(hits.len(), boxes.len() - 1);
        assert!(!hits.contains(&3));
    }

    #[test]
    fn empty_tree_queries_are_no_ops() {
        let tree = BoundingVolumeTree::new();
        let mut d = 10.0;
        assert!(tree.raycast(&[], Vec3::ZERO, Vec3::X, &mut d, &mut |_, _| true));
        assert_eq!(tree.compute_depth(), 0);
        assert!(tree.validate(&[]));
        assert!(tree.root_bounds().is_empty());
    }
}
