// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Flat coarse index for objects that the tree does not cover yet.
//!
//! New entries first go to a small unsorted free list. Once that list is full,
//! entries are appended to the core arrays and the index becomes dirty.
//! [`BucketIndex::build`] then classifies everything into a fixed grid of buckets:
//!
//! - Entries are sorted by their minimum along the sort axis, the longest axis of
//!   the global box.
//! - One level splits the entries into five buckets around a center point on the
//!   two other axes: four quadrants plus one bucket for entries that straddle a
//!   center line.
//! - Each bucket is split again around its own center, twice, giving 1 + 5 + 25
//!   classification nodes and 125 leaf buckets.
//!
//! Classification is stable, so every leaf bucket stays sorted along the sort axis
//! and ray queries can stop scanning a bucket early.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt::Debug;
use core::ops::Range;

use glam::Vec3;

use crate::query::{HitCallback, SpatialQuery};
use crate::shape::{OverlapTest, QueryShape, RayTest};
use crate::types::{Aabb3, Payload};

const NB_BUCKETS: usize = 5;
const CROSS_BUCKET: usize = 4;

#[derive(Copy, Clone, Debug)]
enum Location {
    Free(usize),
    Core(usize),
}

#[derive(Copy, Clone, Debug)]
struct SortedEntry {
    bounds: Aabb3,
    sort_min: f32,
    sort_max: f32,
    core: u32,
    payload: Payload,
}

#[derive(Copy, Clone, Debug, Default)]
struct BucketNode {
    bounds: [Aabb3; NB_BUCKETS],
    counts: [u32; NB_BUCKETS],
    offsets: [u32; NB_BUCKETS],
    /// Bucket visiting order for each ray direction octant, nearest first.
    order: [[u8; NB_BUCKETS]; 8],
}

impl BucketNode {
    fn range(&self, bucket: usize) -> Range<usize> {
        let start = self.offsets[bucket] as usize;
        start..start + self.counts[bucket] as usize
    }
}

/// Coarse spatial index keyed by payload.
#[derive(Clone)]
pub struct BucketIndex {
    free_capacity: usize,
    free: Vec<(Aabb3, Payload)>,
    core_bounds: Vec<Aabb3>,
    core_payloads: Vec<Payload>,
    core_to_sorted: Vec<u32>,
    locations: BTreeMap<Payload, Location>,
    sorted: Vec<SortedEntry>,
    global: Aabb3,
    sort_axis: usize,
    level1: BucketNode,
    level2: [BucketNode; NB_BUCKETS],
    level3: [[BucketNode; NB_BUCKETS]; NB_BUCKETS],
    dirty: bool,
}

impl Default for BucketIndex {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BUCKET_FREE_CAPACITY)
    }
}

impl Debug for BucketIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BucketIndex")
            .field("free", &self.free.len())
            .field("core", &self.core_bounds.len())
            .field("sort_axis", &self.sort_axis)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl BucketIndex {
    /// Create an empty index whose free list holds up to `free_capacity` entries.
    pub fn new(free_capacity: usize) -> Self {
        Self {
            free_capacity,
            free: Vec::new(),
            core_bounds: Vec::new(),
            core_payloads: Vec::new(),
            core_to_sorted: Vec::new(),
            locations: BTreeMap::new(),
            sorted: Vec::new(),
            global: Aabb3::EMPTY,
            sort_axis: 0,
            level1: BucketNode::default(),
            level2: [BucketNode::default(); NB_BUCKETS],
            level3: [[BucketNode::default(); NB_BUCKETS]; NB_BUCKETS],
            dirty: false,
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.free.len() + self.core_bounds.len()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry with this payload is stored.
    pub fn contains(&self, payload: &Payload) -> bool {
        self.locations.contains_key(payload)
    }

    /// Whether entries were added since the last classification.
    pub fn is_dirty(&self) -> bool {
        self.dirty || !self.free.is_empty()
    }

    /// Axis the classified entries are sorted along.
    pub fn sort_axis(&self) -> usize {
        self.sort_axis
    }

    /// Union of the classified entries as of the last [`Self::build`].
    pub fn global_bounds(&self) -> Aabb3 {
        self.global
    }

    /// Add an entry. Returns false if the payload is already stored.
    pub fn add(&mut self, payload: Payload, bounds: Aabb3) -> bool {
        if self.locations.contains_key(&payload) {
            return false;
        }
        if !self.dirty && self.free.len() < self.free_capacity {
            self.locations
                .insert(payload, Location::Free(self.free.len()));
            self.free.push((bounds, payload));
        } else {
            self.push_core(payload, bounds);
            self.dirty = true;
        }
        true
    }

    fn push_core(&mut self, payload: Payload, bounds: Aabb3) {
        self.locations
            .insert(payload, Location::Core(self.core_bounds.len()));
        self.core_bounds.push(bounds);
        self.core_payloads.push(payload);
        self.core_to_sorted.push(u32::MAX);
    }

    /// Remove an entry. Returns false if the payload is not stored.
    ///
    /// Removing a classified entry leaves a tombstone until the next
    /// classification instead of forcing one.
    pub fn remove(&mut self, payload: &Payload) -> bool {
        let Some(location) = self.locations.remove(payload) else {
            return false;
        };
        match location {
            Location::Free(i) => {
                self.free.swap_remove(i);
                if let Some(&(_, moved)) = self.free.get(i) {
                    self.locations.insert(moved, Location::Free(i));
                }
            }
            Location::Core(i) => {
                if !self.dirty {
                    let s = self.core_to_sorted[i] as usize;
                    self.sorted[s].bounds = Aabb3::EMPTY;
                }
                self.core_bounds.swap_remove(i);
                self.core_payloads.swap_remove(i);
                self.core_to_sorted.swap_remove(i);
                if let Some(&moved) = self.core_payloads.get(i) {
                    self.locations.insert(moved, Location::Core(i));
                    if !self.dirty {
                        let s = self.core_to_sorted[i] as usize;
                        self.sorted[s].core = core_index(i);
                    }
                }
            }
        }
        true
    }

    /// Replace the bounds of an entry. Returns false if the payload is not stored.
    pub fn update(&mut self, payload: Payload, bounds: Aabb3) -> bool {
        match self.locations.get(&payload).copied() {
            None => false,
            Some(Location::Free(i)) => {
                self.free[i].0 = bounds;
                true
            }
            Some(Location::Core(i)) if self.dirty => {
                self.core_bounds[i] = bounds;
                true
            }
            Some(Location::Core(_)) => self.remove(&payload) && self.add(payload, bounds),
        }
    }

    /// Translate every entry by `-shift`. Takes effect for queries after the next
    /// [`Self::build`].
    pub fn shift_origin(&mut self, shift: Vec3) {
        for b in &mut self.core_bounds {
            *b = b.translated(-shift);
        }
        for (b, _) in &mut self.free {
            *b = b.translated(-shift);
        }
        self.dirty = true;
    }

    /// Drop all entries and release memory.
    pub fn release(&mut self) {
        *self = Self::new(self.free_capacity);
    }

    /// Classify all entries if anything was added since the last classification.
    pub fn build(&mut self) {
        if !self.is_dirty() {
            return;
        }
        let free = core::mem::take(&mut self.free);
        for &(bounds, payload) in &free {
            self.push_core(payload, bounds);
        }
        self.free = free;
        self.free.clear();
        self.dirty = false;
        self.classify();
    }

    fn classify(&mut self) {
        self.sorted.clear();
        self.global = self
            .core_bounds
            .iter()
            .fold(Aabb3::EMPTY, |acc, b| acc.union(b));
        self.level1 = BucketNode::default();
        self.level2 = [BucketNode::default(); NB_BUCKETS];
        self.level3 = [[BucketNode::default(); NB_BUCKETS]; NB_BUCKETS];
        if self.core_bounds.is_empty() {
            return;
        }

        let axis = largest_axis(self.global.extents());
        let (a, b) = ((axis + 1) % 3, (axis + 2) % 3);
        self.sort_axis = axis;
        log::trace!(
            "classifying {} bucket entries along axis {axis}",
            self.core_bounds.len()
        );

        self.sorted.extend(
            self.core_bounds
                .iter()
                .zip(&self.core_payloads)
                .enumerate()
                .map(|(i, (bounds, payload))| SortedEntry {
                    bounds: *bounds,
                    sort_min: bounds.min[axis],
                    sort_max: bounds.max[axis],
                    core: core_index(i),
                    payload: *payload,
                }),
        );
        self.sorted
            .sort_by(|x, y| x.sort_min.total_cmp(&y.sort_min));

        let mut scratch = Vec::with_capacity(self.sorted.len());
        let all = 0..self.sorted.len();
        self.level1 = classify_range(&mut self.sorted, all, &mut scratch, self.global.center(), false, (a, b));
        for i in 0..NB_BUCKETS {
            let l1 = self.level1;
            let limits = l1.bounds[i].center();
            let level2 = classify_range(&mut self.sorted, l1.range(i), &mut scratch, limits, i == CROSS_BUCKET, (a, b));
            self.level2[i] = level2;
            for j in 0..NB_BUCKETS {
                let limits = level2.bounds[j].center();
                self.level3[i][j] = classify_range(
                    &mut self.sorted,
                    level2.range(j),
                    &mut scratch,
                    limits,
                    j == CROSS_BUCKET,
                    (a, b),
                );
            }
        }

        for (s, e) in self.sorted.iter().enumerate() {
            self.core_to_sorted[e.core as usize] = core_index(s);
        }
    }

    /// Cast a ray, updating `max_dist` when the callback lowers its distance.
    pub fn raycast_with_distance(
        &self,
        origin: Vec3,
        dir: Vec3,
        max_dist: &mut f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        let mut test = RayTest::new(origin, dir, *max_dist, Vec3::ZERO);
        self.ray_query(&mut test, max_dist, callback)
    }

    /// Sweep the bounds of `shape`, updating `max_dist` when the callback lowers its distance.
    pub fn sweep_with_distance(
        &self,
        shape: &QueryShape,
        dir: Vec3,
        max_dist: &mut f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        let mut test = RayTest::sweep(shape, dir, *max_dist);
        self.ray_query(&mut test, max_dist, callback)
    }

    fn ray_query(
        &self,
        test: &mut RayTest,
        max_dist: &mut f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        for (b, payload) in &self.free {
            if test.hits(b) && !report_ray(test, max_dist, payload, callback) {
                return false;
            }
        }
        if self.sorted.is_empty() {
            return true;
        }
        let Some((_, exit)) = test.clip(&self.global) else {
            return true;
        };
        let octant = octant(test.dir);
        let l1 = &self.level1;
        for &i in &l1.order[octant] {
            let i = usize::from(i);
            if l1.counts[i] == 0 || !test.hits(&l1.bounds[i]) {
                continue;
            }
            let l2 = &self.level2[i];
            for &j in &l2.order[octant] {
                let j = usize::from(j);
                if l2.counts[j] == 0 || !test.hits(&l2.bounds[j]) {
                    continue;
                }
                let l3 = &self.level3[i][j];
                for &k in &l3.order[octant] {
                    let k = usize::from(k);
                    if l3.counts[k] == 0 || !test.hits(&l3.bounds[k]) {
                        continue;
                    }
                    if !self.ray_bucket(l3.range(k), test, max_dist, exit, callback) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn ray_bucket(
        &self,
        range: Range<usize>,
        test: &mut RayTest,
        max_dist: &mut f32,
        global_exit: f32,
        callback: &mut HitCallback<'_>,
    ) -> bool {
        let (mut lo, mut hi) = self.sort_interval(test, global_exit);
        for e in &self.sorted[range] {
            if e.sort_min > hi {
                break;
            }
            if e.sort_max < lo || !test.hits(&e.bounds) {
                continue;
            }
            let before = test.max_dist;
            if !report_ray(test, max_dist, &e.payload, callback) {
                return false;
            }
            if test.max_dist < before {
                (lo, hi) = self.sort_interval(test, global_exit);
            }
        }
        true
    }

    /// Interval the ray covers along the sort axis, widened by a little slack so
    /// rounding can't skip an entry the box test would accept.
    fn sort_interval(&self, test: &RayTest, global_exit: f32) -> (f32, f32) {
        let axis = self.sort_axis;
        let o = test.origin[axis];
        let travel = if test.dir[axis] == 0.0 {
            0.0
        } else {
            test.dir[axis] * global_exit.min(test.max_dist)
        };
        let end = o + travel;
        let inflation = test.inflation[axis];
        let slack = Vec3::new(o, end, inflation).abs().element_sum() * 1.0e-5 + 1.0e-6;
        (o.min(end) - inflation - slack, o.max(end) + inflation + slack)
    }
}

impl SpatialQuery for BucketIndex {
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
        let test = OverlapTest::new(shape);
        let report = |payload: &Payload, callback: &mut HitCallback<'_>| {
            let mut dist = f32::MAX;
            callback(&mut dist, core::slice::from_ref(payload))
        };
        for (b, payload) in &self.free {
            if test.overlaps(b) && !report(payload, callback) {
                return false;
            }
        }
        if self.sorted.is_empty() || !test.overlaps(&self.global) {
            return true;
        }
        let query = shape.bounds();
        let (lo, hi) = (query.min[self.sort_axis], query.max[self.sort_axis]);
        let l1 = &self.level1;
        for i in 0..NB_BUCKETS {
            if l1.counts[i] == 0 || !test.overlaps(&l1.bounds[i]) {
                continue;
            }
            let l2 = &self.level2[i];
            for j in 0..NB_BUCKETS {
                if l2.counts[j] == 0 || !test.overlaps(&l2.bounds[j]) {
                    continue;
                }
                let l3 = &self.level3[i][j];
                for k in 0..NB_BUCKETS {
                    if l3.counts[k] == 0 || !test.overlaps(&l3.bounds[k]) {
                        continue;
                    }
                    for e in &self.sorted[l3.range(k)] {
                        if e.sort_min > hi {
                            break;
                        }
                        if e.sort_max < lo || !test.overlaps(&e.bounds) {
                            continue;
                        }
                        if !report(&e.payload, callback) {
                            return false;
                        }
                    }
                }
            }
        }
        true
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

fn report_ray(
    test: &mut RayTest,
    max_dist: &mut f32,
    payload: &Payload,
    callback: &mut HitCallback<'_>,
) -> bool {
    let mut dist = *max_dist;
    if !callback(&mut dist, core::slice::from_ref(payload)) {
        return false;
    }
    if dist < *max_dist {
        *max_dist = dist;
        test.set_max_dist(dist);
    }
    true
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "Bucket entries are 32-bit indexed."
)]
fn core_index(i: usize) -> u32 {
    i as u32
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

fn octant(dir: Vec3) -> usize {
    usize::from(dir.x < 0.0) | usize::from(dir.y < 0.0) << 1 | usize::from(dir.z < 0.0) << 2
}

/// Bucket of an entry relative to center `limits` on axes `a` and `b`.
///
/// Outside the straddling bucket, only entries clear of both center lines get a
/// quadrant. Inside it, being clear of one line is enough.
fn bucket_of(bounds: &Aabb3, limits: Vec3, (a, b): (usize, usize), cross: bool) -> usize {
    let right = bounds.min[a] > limits[a];
    let left = bounds.max[a] < limits[a];
    let upper = bounds.min[b] > limits[b];
    let lower = bounds.max[b] < limits[b];
    if cross {
        match (right, left, lower, upper) {
            (true, ..) => 1,
            (_, true, ..) => 0,
            (_, _, true, _) => 2,
            (_, _, _, true) => 3,
            _ => CROSS_BUCKET,
        }
    } else {
        match (right, left, lower, upper) {
            (_, true, _, true) => 0,
            (true, _, _, true) => 1,
            (_, true, true, _) => 2,
            (true, _, true, _) => 3,
            _ => CROSS_BUCKET,
        }
    }
}

/// Stable-partition `entries[range]` into five buckets and describe the result.
#[allow(
    clippy::cast_possible_truncation,
    reason = "Bucket indices are below NB_BUCKETS and entry counts are 32-bit."
)]
fn classify_range(
    entries: &mut [SortedEntry],
    range: Range<usize>,
    scratch: &mut Vec<SortedEntry>,
    limits: Vec3,
    cross: bool,
    axes: (usize, usize),
) -> BucketNode {
    let mut node = BucketNode::default();
    let slice = &mut entries[range.clone()];
    for e in slice.iter() {
        let k = bucket_of(&e.bounds, limits, axes, cross);
        node.counts[k] += 1;
        node.bounds[k] = node.bounds[k].union(&e.bounds);
    }
    let mut offset = range.start as u32;
    for k in 0..NB_BUCKETS {
        node.offsets[k] = offset;
        offset += node.counts[k];
    }

    scratch.clear();
    scratch.extend_from_slice(slice);
    let mut cursor = node.offsets.map(|o| o as usize - range.start);
    for e in scratch.iter() {
        let k = bucket_of(&e.bounds, limits, axes, cross);
        slice[cursor[k]] = *e;
        cursor[k] += 1;
    }

    for (octant, order) in node.order.iter_mut().enumerate() {
        let dir = Vec3::new(
            if octant & 1 != 0 { -1.0 } else { 1.0 },
            if octant & 2 != 0 { -1.0 } else { 1.0 },
            if octant & 4 != 0 { -1.0 } else { 1.0 },
        );
        let mut keys = [0.0_f32; NB_BUCKETS];
        for (k, key) in keys.iter_mut().enumerate() {
            *key = if node.counts[k] == 0 {
                f32::MAX
            } else {
                node.bounds[k].center().dot(dir)
            };
        }
        let mut ids = [0_u8, 1, 2, 3, 4];
        ids.sort_unstable_by(|&x, &y| keys[usize::from(x)].total_cmp(&keys[usize::from(y)]));
        *order = ids;
    }
    node
}
