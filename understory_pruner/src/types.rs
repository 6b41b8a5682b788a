// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Primitive geometry types and handles.

use glam::Vec3;

/// Axis-aligned bounding box in 3D.
///
/// A box is either well-formed (`min <= max` on every axis) or equal to
/// [`Aabb3::EMPTY`]. Inverted boxes never overlap anything.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb3 {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Default for Aabb3 {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb3 {
    /// The empty box. It is the identity of [`Aabb3::union`].
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(-f32::MAX),
    };

    /// Create a new AABB from min/max corners.
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB from a center point and half-extents.
    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        Self {
            min: center - extents,
            max: center + extents,
        }
    }

    /// Smallest box containing all `points`, or [`Aabb3::EMPTY`] when there are none.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |acc, p| Self {
            min: acc.min.min(p),
            max: acc.max.max(p),
        })
    }

    /// Return true if the box is empty or inverted on any axis. Assumes no NaN.
    pub fn is_empty(&self) -> bool {
        self.max.x < self.min.x || self.max.y < self.min.y || self.max.z < self.min.z
    }

    /// Center point. Meaningless for empty boxes.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half-extents. Meaningless for empty boxes.
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Whether the two boxes share at least one point. Touching faces count.
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    /// Whether `other` lies entirely inside `self`. The empty box is inside everything.
    pub fn contains(&self, other: &Self) -> bool {
        other.is_empty() || (self.min.cmple(other.min).all() && other.max.cmple(self.max).all())
    }

    /// Whether the point lies inside or on the boundary.
    pub fn contains_point(&self, p: Vec3) -> bool {
        self.min.cmple(p).all() && p.cmple(self.max).all()
    }

    /// Grow the box by `amount` on every side.
    pub fn inflated(&self, amount: Vec3) -> Self {
        Self {
            min: self.min - amount,
            max: self.max + amount,
        }
    }

    /// Move the box by `offset`. Empty boxes stay empty.
    pub fn translated(&self, offset: Vec3) -> Self {
        if self.is_empty() {
            return *self;
        }
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Distance along `dir` at which a ray starting at `origin` enters the box,
    /// limited to `[0, max_dist]`.
    ///
    /// Returns `Some(0.0)` when the origin is inside. `dir` does not need to be normalized;
    /// the result is then expressed in multiples of `dir`.
    pub fn ray_distance(&self, origin: Vec3, dir: Vec3, max_dist: f32) -> Option<f32> {
        crate::shape::RayTest::new(origin, dir, max_dist, Vec3::ZERO).entry(self)
    }
}

/// Opaque two-word identifier attached to every stored box.
///
/// The pruner never interprets the payload. The bucket index looks entries up by
/// payload, so payloads should be unique among live objects.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload {
    /// Caller-defined words.
    pub data: [usize; 2],
}

impl Payload {
    /// Create a payload from two words.
    pub const fn new(a: usize, b: usize) -> Self {
        Self { data: [a, b] }
    }
}

impl From<usize> for Payload {
    fn from(value: usize) -> Self {
        Self::new(value, 0)
    }
}

/// Generational handle for objects stored in an [`ObjectPool`](crate::ObjectPool).
///
/// Handles stay valid until the object is removed. Slots are recycled, and the
/// generation tells a recycled slot apart from the stale handle that used it before.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32, u32);

impl Handle {
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Handle slots are 32-bit; pools never grow beyond u32::MAX objects."
    )]
    pub(crate) const fn new(slot: usize, generation: u32) -> Self {
        Self(slot as u32, generation)
    }

    pub(crate) const fn slot(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn generation(self) -> u32 {
        self.1
    }
}
