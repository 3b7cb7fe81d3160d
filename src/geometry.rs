//! Axis-aligned bounding boxes.

use crate::common::{Float, FLOAT_INF};
use glam::{Mat4, Vec3};

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Vec3,

    /// Maximum corner.
    pub max: Vec3,
}

impl Aabb {
    /// Create a degenerate box that any union or grow operation resets.
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(FLOAT_INF),
            max: Vec3::splat(-FLOAT_INF),
        }
    }

    /// Create a box from explicit corners.
    ///
    /// * `min` - Minimum corner.
    /// * `max` - Maximum corner.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Returns true if the box contains at least one point.
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Extend the box to cover a point.
    ///
    /// * `p` - The point.
    pub fn grow(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Returns the union with another box.
    ///
    /// * `other` - The other box.
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Returns the center point.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Returns the extent along each axis.
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    /// Returns the axis with the largest extent.
    pub fn longest_axis(&self) -> usize {
        let e = self.extent();
        if e.x >= e.y && e.x >= e.z {
            0
        } else if e.y >= e.z {
            1
        } else {
            2
        }
    }

    /// Returns the box covering this box under an affine transform, computed
    /// from the eight transformed corners.
    ///
    /// * `m` - The transform.
    pub fn transformed(&self, m: &Mat4) -> Aabb {
        let mut out = Aabb::empty();
        for i in 0..8 {
            let c = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.grow(m.transform_point3(c));
        }
        out
    }

    /// Slab test. Returns the entry distance if the ray segment
    /// `[tnear, tfar]` overlaps the box; a ray starting inside reports its
    /// `tnear` as the entry distance.
    ///
    /// * `org`     - Ray origin.
    /// * `inv_dir` - Reciprocal ray direction.
    /// * `tnear`   - Start of the ray segment.
    /// * `tfar`    - End of the ray segment.
    pub fn intersect(&self, org: Vec3, inv_dir: Vec3, tnear: Float, tfar: Float) -> Option<Float> {
        let t0 = (self.min - org) * inv_dir;
        let t1 = (self.max - org) * inv_dir;
        let tmin = t0.min(t1);
        let tmax = t0.max(t1);
        let enter = tmin.max_element().max(tnear);
        let exit = tmax.min_element().min(tfar);
        if enter <= exit {
            Some(enter)
        } else {
            None
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RAY_EPSILON;
    use proptest::prelude::*;

    #[test]
    fn empty_is_invalid() {
        assert!(!Aabb::empty().is_valid());
        let mut b = Aabb::empty();
        b.grow(Vec3::ZERO);
        assert!(b.is_valid());
    }

    #[test]
    fn ray_hits_box_ahead() {
        let b = Aabb::new(Vec3::new(-1.0, -1.0, -3.0), Vec3::new(1.0, 1.0, -2.0));
        let t = b
            .intersect(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0).recip(), RAY_EPSILON, FLOAT_INF)
            .unwrap();
        assert!((t - 2.0).abs() < 1e-6);
    }

    #[test]
    fn ray_misses_box_behind() {
        let b = Aabb::new(Vec3::new(-1.0, -1.0, 2.0), Vec3::new(1.0, 1.0, 3.0));
        let hit = b.intersect(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0).recip(), RAY_EPSILON, FLOAT_INF);
        assert!(hit.is_none());
    }

    #[test]
    fn origin_inside_reports_entry_at_tnear() {
        let b = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let t = b
            .intersect(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0).recip(), RAY_EPSILON, FLOAT_INF)
            .unwrap();
        assert_eq!(t, RAY_EPSILON);
    }

    proptest! {
        #[test]
        fn union_contains_both(ax in -10.0f32..10.0, ay in -10.0f32..10.0,
                               bx in -10.0f32..10.0, by in -10.0f32..10.0) {
            let mut a = Aabb::empty();
            a.grow(Vec3::new(ax, ay, 0.0));
            let mut b = Aabb::empty();
            b.grow(Vec3::new(bx, by, 1.0));
            let u = a.union(&b);
            prop_assert!(u.min.x <= ax.min(bx) && u.max.x >= ax.max(bx));
            prop_assert!(u.min.z <= 0.0 && u.max.z >= 1.0);
        }

        #[test]
        fn center_inside(px in -5.0f32..5.0, py in -5.0f32..5.0, pz in -5.0f32..5.0) {
            let mut b = Aabb::empty();
            b.grow(Vec3::new(px, py, pz));
            b.grow(Vec3::new(px + 1.0, py + 1.0, pz + 1.0));
            let c = b.center();
            prop_assert!(c.x >= b.min.x && c.x <= b.max.x);
            prop_assert!(c.y >= b.min.y && c.y <= b.max.y);
            prop_assert!(c.z >= b.min.z && c.z <= b.max.z);
        }
    }
}
