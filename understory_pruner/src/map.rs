// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pool index to tree leaf mapping.

use alloc::vec;
use alloc::vec::Vec;

use crate::tree::BoundingVolumeTree;

const INVALID: u32 = u32::MAX;

/// Maps pool indices to the tree leaves that reference them.
///
/// If `get(p) == Some(n)`, node `n` is a leaf whose primitives include pool index `p`.
/// Pool indices of objects that are not in the tree map to `None`.
#[derive(Clone, Debug, Default)]
pub struct IndexMap {
    mapping: Vec<u32>,
}

impl IndexMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the map from the leaves of `tree`, sized for `nb_objects` pool indices.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Node indices are 32-bit."
    )]
    pub fn init(&mut self, nb_objects: usize, tree: &BoundingVolumeTree) {
        self.mapping.clear();
        self.mapping.resize(nb_objects, INVALID);
        for (n, node) in tree.nodes().iter().enumerate() {
            if !node.is_leaf() {
                continue;
            }
            for &p in tree.leaf_primitives(n) {
                self.set(p as usize, n as u32);
            }
        }
    }

    /// Leaf referencing `pool_index`, if any.
    pub fn get(&self, pool_index: usize) -> Option<usize> {
        match self.mapping.get(pool_index) {
            Some(&n) if n != INVALID => Some(n as usize),
            _ => None,
        }
    }

    /// Number of pool indices the map currently covers.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Whether the map covers no indices.
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    fn set(&mut self, pool_index: usize, node: u32) {
        if pool_index >= self.mapping.len() {
            self.mapping.resize(pool_index + 1, INVALID);
        }
        self.mapping[pool_index] = node;
    }

    /// Follow a pool removal.
    ///
    /// `removed` is the index of the removed object and `relocated` the index the
    /// pool's last object moved from (see [`ObjectPool::remove`](crate::ObjectPool::remove)).
    /// The removed object's primitive is dropped from its leaf, and the relocated
    /// object's leaf is patched to reference `removed`.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Pool and node indices are 32-bit."
    )]
    pub fn invalidate(&mut self, removed: usize, relocated: usize, tree: &mut BoundingVolumeTree) {
        if let Some(node) = self.get(removed) {
            tree.remove_leaf_primitive(node, removed as u32);
            self.mapping[removed] = INVALID;
        }
        if relocated != removed {
            if let Some(node) = self.get(relocated) {
                tree.relocate_leaf_primitive(node, relocated as u32, removed as u32);
                self.set(removed, node as u32);
                self.mapping[relocated] = INVALID;
            }
        }
    }

    /// Check that every mapped index is referenced by its leaf, and that every
    /// primitive below `nb_objects` referenced by a leaf maps back to that leaf.
    pub fn is_consistent_with(&self, tree: &BoundingVolumeTree, nb_objects: usize) -> bool {
        let forward = (0..nb_objects).all(|p| match self.get(p) {
            Some(n) => tree.leaf_primitives(n).iter().any(|&q| q as usize == p),
            None => true,
        });
        let backward = (0..tree.node_count()).all(|n| {
            tree.leaf_primitives(n)
                .iter()
                .all(|&p| p as usize >= nb_objects || self.get(p as usize) == Some(n))
        });
        forward && backward && self.mapping[nb_objects.min(self.mapping.len())..]
            .iter()
            .all(|&n| n == INVALID)
    }

    /// Drop the mapping and release memory.
    pub fn release(&mut self) {
        self.mapping = vec![];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildSettings, TreeBuilder};
    use crate::pool::ObjectPool;
    use crate::types::{Aabb3, Payload};
    use glam::Vec3;

    fn setup(n: usize) -> (ObjectPool, Vec<crate::Handle>, BoundingVolumeTree, IndexMap) {
        let mut pool = ObjectPool::new();
        let handles = (0..n)
            .map(|i| {
                let min = Vec3::new(i as f32 * 2.0, 0.0, 0.0);
                pool.add(Aabb3::new(min, min + Vec3::ONE), Payload::from(i))
                    .unwrap()
            })
            .collect();
        let mut builder = TreeBuilder::from_bounds(BuildSettings::default(), pool.bounds());
        let mut tree = BoundingVolumeTree::new();
        tree.build(&mut builder);
        let mut map = IndexMap::new();
        map.init(pool.len(), &tree);
        (pool, handles, tree, map)
    }

    #[test]
    fn init_maps_every_leaf() {
        let (pool, _, tree, map) = setup(10);
        for p in 0..pool.len() {
            let n = map.get(p).unwrap();
            assert_eq!(tree.leaf_primitives(n), [p as u32]);
        }
        assert!(map.is_consistent_with(&tree, pool.len()));
    }

    #[test]
    fn invalidate_follows_swap_remove() {
        let (mut pool, handles, mut tree, mut map) = setup(10);
        let removed = pool.index_of(handles[4]).unwrap();
        let last_leaf = map.get(9).unwrap();
        let relocated = pool.remove(handles[4]).unwrap();
        map.invalidate(removed, relocated, &mut tree);

        assert_eq!(map.get(4), Some(last_leaf), "moved object keeps its leaf");
        assert_eq!(map.get(9), None);
        assert!(map.is_consistent_with(&tree, pool.len()));
        // The leaf now refers to the object that moved into index 4.
        assert_eq!(pool.payloads()[4], Payload::from(9));
        assert_eq!(tree.leaf_primitives(last_leaf), [4]);
    }

    #[test]
    fn invalidate_last_object() {
        let (mut pool, handles, mut tree, mut map) = setup(3);
        let removed = pool.index_of(handles[2]).unwrap();
        let leaf = map.get(2).unwrap();
        let relocated = pool.remove(handles[2]).unwrap();
        assert_eq!(removed, relocated);
        map.invalidate(removed, relocated, &mut tree);
        assert_eq!(map.get(2), None);
        assert!(tree.leaf_primitives(leaf).is_empty());
        assert!(map.is_consistent_with(&tree, pool.len()));
    }

    #[test]
    fn indices_outside_the_tree_are_ignored() {
        let (_, _, mut tree, mut map) = setup(4);
        let before = tree.indices().to_vec();
        map.invalidate(7, 9, &mut tree);
        assert_eq!(tree.indices(), before.as_slice());
    }
}
