// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tree nodes and their compressed bounds.
//!
//! A node stores its box as a full-precision center plus three 8-bit extents that
//! share one scale factor. The scale keeps only the top 24 bits of an `f32`.
//! Quantization always rounds outward: [`TreeNode::bounds`] returns a box that
//! contains the box passed to [`TreeNode::set_bounds`], as long as every coordinate
//! lies within [`MAX_COORDINATE`].

use bitflags::bitflags;
use glam::Vec3;

use crate::types::Aabb3;

/// Largest coordinate magnitude for which compression stays conservative.
pub const MAX_COORDINATE: f32 = 1.0e33;

/// Marker for "no node", used for the root's parent link.
pub(crate) const NO_NODE: u32 = u32::MAX;

const QUANT_MAX: u32 = 255;
const SCALE_SHIFT: u32 = 8;

bitflags! {
    /// Per-node state bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u8 {
        /// The node references primitives instead of children.
        const LEAF   = 0b0000_0001;
        /// The node's box is empty; queries skip it.
        const EMPTY  = 0b0000_0010;
        /// The node is queued for the next marked refit.
        const MARKED = 0b0000_0100;
    }
}

/// One node of a [`BoundingVolumeTree`](crate::BoundingVolumeTree).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TreeNode {
    center: Vec3,
    extents: [u8; 3],
    pub(crate) flags: NodeFlags,
    scale: u32,
    /// Leaf: first primitive slot. Internal: index of the first child; the second
    /// child follows it.
    pub(crate) data: u32,
    /// Leaf: number of live primitives.
    pub(crate) nb_prims: u32,
    pub(crate) parent: u32,
}

impl Default for TreeNode {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            extents: [0; 3],
            flags: NodeFlags::EMPTY,
            scale: 0,
            data: 0,
            nb_prims: 0,
            parent: NO_NODE,
        }
    }
}

impl TreeNode {
    /// Whether this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(NodeFlags::LEAF)
    }

    /// Whether this node's box is empty.
    pub fn is_empty(&self) -> bool {
        self.flags.contains(NodeFlags::EMPTY)
    }

    /// State bits.
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Parent index, `None` for the root.
    pub fn parent(&self) -> Option<usize> {
        (self.parent != NO_NODE).then_some(self.parent as usize)
    }

    /// Indices of the two children of an internal node.
    pub fn children(&self) -> Option<(usize, usize)> {
        if self.is_leaf() {
            None
        } else {
            let first = self.data as usize;
            Some((first, first + 1))
        }
    }

    /// Live primitive slots of a leaf, as a range into the tree's index array.
    pub fn primitive_slots(&self) -> Option<core::ops::Range<usize>> {
        self.is_leaf().then(|| {
            let start = self.data as usize;
            start..start + self.nb_prims as usize
        })
    }

    /// Stored center. Meaningless for empty nodes.
    pub fn center(&self) -> Vec3 {
        self.center
    }

    /// Decompressed bounds. Always contains the box last passed to [`Self::set_bounds`].
    pub fn bounds(&self) -> Aabb3 {
        if self.is_empty() {
            return Aabb3::EMPTY;
        }
        let e = self.decoded_extents();
        Aabb3::new(self.center - e, self.center + e)
    }

    fn decoded_extents(&self) -> Vec3 {
        let scale = decode_scale(self.scale);
        Vec3::new(
            f32::from(self.extents[0]) * scale,
            f32::from(self.extents[1]) * scale,
            f32::from(self.extents[2]) * scale,
        )
    }

    /// Store `b` in compressed form, rounding outward.
    pub fn set_bounds(&mut self, b: &Aabb3) {
        if b.is_empty() {
            self.flags.insert(NodeFlags::EMPTY);
            self.center = Vec3::ZERO;
            self.extents = [0; 3];
            self.scale = 0;
            return;
        }
        debug_assert!(
            b.min.cmpge(Vec3::splat(-MAX_COORDINATE)).all()
                && b.max.cmple(Vec3::splat(MAX_COORDINATE)).all(),
            "bounds exceed the compressible range: {b:?}"
        );
        self.flags.remove(NodeFlags::EMPTY);
        let min = b.min.max(Vec3::splat(-MAX_COORDINATE));
        let max = b.max.min(Vec3::splat(MAX_COORDINATE));
        let center = (min + max) * 0.5;
        let needed = (center - min).max(max - center);

        let mut scale = encode_scale_up(needed.max_element() / QUANT_MAX as f32);
        loop {
            if let Some(extents) = quantize(center, min, max, needed, decode_scale(scale)) {
                self.center = center;
                self.extents = extents;
                self.scale = scale;
                return;
            }
            // Rounding near the center's precision left a gap at full quantization.
            scale = encode_scale_up(decode_scale(scale) * 2.0).max(scale + 1);
        }
    }

    pub(crate) fn make_leaf(&mut self, first_slot: u32, nb_prims: u32) {
        self.flags.insert(NodeFlags::LEAF);
        self.data = first_slot;
        self.nb_prims = nb_prims;
    }

    pub(crate) fn make_internal(&mut self, first_child: u32) {
        self.flags.remove(NodeFlags::LEAF);
        self.data = first_child;
        self.nb_prims = 0;
    }
}

fn decode_scale(bits: u32) -> f32 {
    f32::from_bits(bits << SCALE_SHIFT)
}

/// Smallest stored scale that is at least `v`. `v` must be finite and non-negative.
fn encode_scale_up(v: f32) -> u32 {
    let bits = v.to_bits();
    let truncated = bits >> SCALE_SHIFT;
    if bits & ((1 << SCALE_SHIFT) - 1) != 0 {
        truncated + 1
    } else {
        truncated
    }
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "The quotient is clamped to QUANT_MAX before narrowing."
)]
fn quantize(center: Vec3, min: Vec3, max: Vec3, needed: Vec3, scale: f32) -> Option<[u8; 3]> {
    let mut out = [0_u8; 3];
    for axis in 0..3 {
        let mut q = if scale > 0.0 {
            ((needed[axis] / scale) as u32).min(QUANT_MAX)
        } else {
            0
        };
        // Check with the exact arithmetic `bounds()` uses.
        loop {
            let e = q as f32 * scale;
            if center[axis] - e <= min[axis] && center[axis] + e >= max[axis] {
                break;
            }
            if q == QUANT_MAX {
                return None;
            }
            q += 1;
        }
        out[axis] = q as u8;
    }
    Some(out)
}
