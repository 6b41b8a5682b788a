// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Query shapes and the shape-vs-box primitives shared by the tree and the bucket index.
//!
//! All tests are conservative: they may report a box that the exact shape misses, but
//! never the other way around.

use glam::{Mat3, Quat, Vec3};

use crate::types::Aabb3;

/// Volume used by overlap and sweep queries.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum QueryShape {
    /// Ball around `center`.
    Sphere {
        /// Center point.
        center: Vec3,
        /// Radius, non-negative.
        radius: f32,
    },
    /// Axis-aligned box.
    Aabb(Aabb3),
    /// Oriented box.
    Box {
        /// Center point.
        center: Vec3,
        /// Half-extents along the box's local axes.
        half_extents: Vec3,
        /// Rotation from local to world space.
        rotation: Quat,
    },
    /// Segment `p0..p1` swept by a ball of `radius`.
    Capsule {
        /// First segment end.
        p0: Vec3,
        /// Second segment end.
        p1: Vec3,
        /// Radius, non-negative.
        radius: f32,
    },
}

impl QueryShape {
    /// World-space bounds enclosing the shape.
    pub fn bounds(&self) -> Aabb3 {
        match *self {
            Self::Sphere { center, radius } => {
                Aabb3::from_center_extents(center, Vec3::splat(radius))
            }
            Self::Aabb(b) => b,
            Self::Box {
                center,
                half_extents,
                rotation,
            } => {
                let m = Mat3::from_quat(rotation);
                Aabb3::from_center_extents(center, abs_mat(&m) * half_extents)
            }
            Self::Capsule { p0, p1, radius } => Aabb3::new(p0.min(p1), p0.max(p1))
                .inflated(Vec3::splat(radius)),
        }
    }
}

fn abs_mat(m: &Mat3) -> Mat3 {
    Mat3::from_cols(m.x_axis.abs(), m.y_axis.abs(), m.z_axis.abs())
}

/// Prepared overlap test for one [`QueryShape`].
#[derive(Copy, Clone, Debug)]
pub(crate) enum OverlapTest {
    Aabb(Aabb3),
    Sphere {
        center: Vec3,
        radius_sq: f32,
    },
    Obb {
        center: Vec3,
        half_extents: Vec3,
        axes: Mat3,
        world_extents: Vec3,
    },
    Capsule {
        bounds: Aabb3,
        segment: RayTest,
    },
}

impl OverlapTest {
    pub(crate) fn new(shape: &QueryShape) -> Self {
        match *shape {
            QueryShape::Aabb(b) => Self::Aabb(b),
            QueryShape::Sphere { center, radius } => Self::Sphere {
                center,
                radius_sq: radius * radius,
            },
            QueryShape::Box {
                center,
                half_extents,
                rotation,
            } => {
                let axes = Mat3::from_quat(rotation);
                Self::Obb {
                    center,
                    half_extents,
                    axes,
                    world_extents: abs_mat(&axes) * half_extents,
                }
            }
            QueryShape::Capsule { p0, p1, radius } => Self::Capsule {
                bounds: shape.bounds(),
                segment: RayTest::new(p0, p1 - p0, 1.0, Vec3::splat(radius)),
            },
        }
    }

    pub(crate) fn overlaps(&self, b: &Aabb3) -> bool {
        if b.is_empty() {
            return false;
        }
        match self {
            Self::Aabb(q) => q.intersects(b),
            Self::Sphere { center, radius_sq } => {
                let closest = center.max(b.min).min(b.max);
                closest.distance_squared(*center) <= *radius_sq
            }
            Self::Obb {
                center,
                half_extents,
                axes,
                world_extents,
            } => {
                let box_center = b.center();
                let box_extents = b.extents();
                let t = box_center - *center;
                // World axes.
                if t.abs().cmpgt(*world_extents + box_extents).any() {
                    return false;
                }
                // Box axes. Edge-edge axes are skipped, which only adds false positives.
                for (i, axis) in [axes.x_axis, axes.y_axis, axes.z_axis].iter().enumerate() {
                    let reach = half_extents[i] + axis.abs().dot(box_extents);
                    let d = t.dot(*axis);
                    if d > reach || -d > reach {
                        return false;
                    }
                }
                true
            }
            // Segment against the box grown by the radius on every side.
            Self::Capsule { bounds, segment } => bounds.intersects(b) && segment.hits(b),
        }
    }
}

/// Ray (optionally inflated into a swept box) clipped to `[0, max_dist]`.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RayTest {
    pub(crate) origin: Vec3,
    pub(crate) dir: Vec3,
    inv_dir: Vec3,
    pub(crate) max_dist: f32,
    pub(crate) inflation: Vec3,
}

impl RayTest {
    pub(crate) fn new(origin: Vec3, dir: Vec3, max_dist: f32, inflation: Vec3) -> Self {
        Self {
            origin,
            dir,
            inv_dir: dir.recip(),
            max_dist,
            inflation,
        }
    }

    /// Ray used by sweeps: the shape's bounds travel along `dir`.
    pub(crate) fn sweep(shape: &QueryShape, dir: Vec3, max_dist: f32) -> Self {
        let b = shape.bounds();
        Self::new(b.center(), dir, max_dist, b.extents())
    }

    pub(crate) fn set_max_dist(&mut self, max_dist: f32) {
        self.max_dist = max_dist;
    }

    /// Parametric interval over which the ray is inside the inflated box.
    pub(crate) fn clip(&self, b: &Aabb3) -> Option<(f32, f32)> {
        if b.is_empty() {
            return None;
        }
        let min = b.min - self.inflation;
        let max = b.max + self.inflation;
        let mut t0 = 0.0_f32;
        let mut t1 = self.max_dist;
        for axis in 0..3 {
            let o = self.origin[axis];
            let inv = self.inv_dir[axis];
            if self.dir[axis] == 0.0 || !inv.is_finite() {
                if o < min[axis] || o > max[axis] {
                    return None;
                }
                continue;
            }
            let mut near = (min[axis] - o) * inv;
            let mut far = (max[axis] - o) * inv;
            if near > far {
                core::mem::swap(&mut near, &mut far);
            }
            t0 = t0.max(near);
            t1 = t1.min(far);
            if t0 > t1 {
                return None;
            }
        }
        Some((t0, t1))
    }

    pub(crate) fn entry(&self, b: &Aabb3) -> Option<f32> {
        self.clip(b).map(|(t0, _)| t0)
    }

    pub(crate) fn hits(&self, b: &Aabb3) -> bool {
        self.clip(b).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> Aabb3 {
        Aabb3::new(Vec3::ZERO, Vec3::ONE)
    }

    #[test]
    fn sphere_uses_closest_point() {
        let near_corner = OverlapTest::new(&QueryShape::Sphere {
            center: Vec3::splat(1.5),
            radius: 0.9,
        });
        let far_corner = OverlapTest::new(&QueryShape::Sphere {
            center: Vec3::splat(1.5),
            radius: 0.8,
        });
        // Distance from (1.5,1.5,1.5) to the corner is ~0.866.
        assert!(near_corner.overlaps(&unit_box()));
        assert!(!far_corner.overlaps(&unit_box()));
    }

    #[test]
    fn rotated_box_separates_on_its_own_axis() {
        // Thin along the (1, 1, 0) diagonal, long along (-1, 1, 0).
        let rotation = Quat::from_rotation_z(core::f32::consts::FRAC_PI_4);
        let shape = QueryShape::Box {
            center: Vec3::new(1.3, 1.3, 0.5),
            half_extents: Vec3::new(0.1, 2.0, 0.5),
            rotation,
        };
        // The world-space bounds overlap the unit box, the rotated slab does not.
        assert!(shape.bounds().intersects(&unit_box()));
        assert!(!OverlapTest::new(&shape).overlaps(&unit_box()));

        let through_corner = QueryShape::Box {
            center: Vec3::new(1.0, 1.0, 0.5),
            half_extents: Vec3::new(0.1, 2.0, 0.5),
            rotation,
        };
        assert!(OverlapTest::new(&through_corner).overlaps(&unit_box()));
    }

    #[test]
    fn capsule_segment_passes_beside_box() {
        let hit = QueryShape::Capsule {
            p0: Vec3::new(-2.0, 1.2, 0.5),
            p1: Vec3::new(3.0, 1.2, 0.5),
            radius: 0.25,
        };
        let miss = QueryShape::Capsule {
            p0: Vec3::new(-2.0, 1.5, 0.5),
            p1: Vec3::new(3.0, 1.5, 0.5),
            radius: 0.25,
        };
        assert!(OverlapTest::new(&hit).overlaps(&unit_box()));
        assert!(!OverlapTest::new(&miss).overlaps(&unit_box()));
    }

    #[test]
    fn degenerate_capsule_is_a_sphere_bound() {
        let point = QueryShape::Capsule {
            p0: Vec3::new(0.5, 0.5, 1.1),
            p1: Vec3::new(0.5, 0.5, 1.1),
            radius: 0.2,
        };
        assert!(OverlapTest::new(&point).overlaps(&unit_box()));
    }

    #[test]
    fn ray_parallel_to_face() {
        let inside = RayTest::new(Vec3::new(0.5, 0.5, -1.0), Vec3::Z, 10.0, Vec3::ZERO);
        let outside = RayTest::new(Vec3::new(1.5, 0.5, -1.0), Vec3::Z, 10.0, Vec3::ZERO);
        assert!(inside.hits(&unit_box()));
        assert!(!outside.hits(&unit_box()));
    }

    #[test]
    fn sweep_inflates_by_shape_extents() {
        let sphere = QueryShape::Sphere {
            center: Vec3::new(1.4, 0.5, -3.0),
            radius: 0.5,
        };
        let test = RayTest::sweep(&sphere, Vec3::Z, 10.0);
        let t = test.entry(&unit_box()).unwrap();
        assert!((t - 2.5).abs() < 1e-5, "unexpected entry {t}");
    }

    #[test]
    fn infinite_distance_is_fine() {
        let test = RayTest::new(Vec3::new(0.5, 0.5, -1.0e6), Vec3::Z, f32::INFINITY, Vec3::ZERO);
        assert!(test.hits(&unit_box()));
    }
}
