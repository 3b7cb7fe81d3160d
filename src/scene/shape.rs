//! Analytic shapes.

use crate::common::Float;
use crate::geometry::Aabb;
use crate::scene::material::Material;
use glam::Vec3;

/// An analytic sphere carried by a domain alongside its meshes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sphere {
    /// Center in world space.
    pub center: Vec3,

    /// Radius.
    pub radius: Float,

    /// Surface material.
    pub material: Material,
}

impl Sphere {
    /// World bounds.
    pub fn bounds(&self) -> Aabb {
        let r = Vec3::splat(self.radius);
        Aabb::new(self.center - r, self.center + r)
    }

    /// Closest intersection within `[tnear, tfar]`, with the outward normal
    /// at the hit point.
    ///
    /// * `org`   - Ray origin.
    /// * `dir`   - Ray direction.
    /// * `tnear` - Start of the ray segment.
    /// * `tfar`  - End of the ray segment.
    pub fn intersect(&self, org: Vec3, dir: Vec3, tnear: Float, tfar: Float) -> Option<(Float, Vec3)> {
        let oc = org - self.center;
        let a = dir.length_squared();
        let half_b = oc.dot(dir);
        let c = oc.length_squared() - self.radius * self.radius;
        let disc = half_b * half_b - a * c;
        if disc < 0.0 {
            return None;
        }
        let sqrt_d = disc.sqrt();
        let mut t = (-half_b - sqrt_d) / a;
        if t < tnear || t > tfar {
            t = (-half_b + sqrt_d) / a;
            if t < tnear || t > tfar {
                return None;
            }
        }
        let n = (org + dir * t - self.center) / self.radius;
        Some((t, n))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FLOAT_INF, RAY_EPSILON};

    fn unit_sphere() -> Sphere {
        Sphere {
            center: Vec3::ZERO,
            radius: 1.0,
            material: Material::default(),
        }
    }

    #[test]
    fn hits_front_surface() {
        let s = unit_sphere();
        let (t, n) = s
            .intersect(Vec3::new(0.0, 0.0, 3.0), Vec3::NEG_Z, RAY_EPSILON, FLOAT_INF)
            .unwrap();
        assert!((t - 2.0).abs() < 1e-5);
        assert!((n - Vec3::Z).length() < 1e-5);
    }

    #[test]
    fn origin_inside_hits_back_surface() {
        let s = unit_sphere();
        let (t, _) = s
            .intersect(Vec3::ZERO, Vec3::Z, RAY_EPSILON, FLOAT_INF)
            .unwrap();
        assert!((t - 1.0).abs() < 1e-5);
    }

    #[test]
    fn respects_tfar() {
        let s = unit_sphere();
        assert!(s
            .intersect(Vec3::new(0.0, 0.0, 3.0), Vec3::NEG_Z, RAY_EPSILON, 1.5)
            .is_none());
    }

    #[test]
    fn misses_off_axis() {
        let s = unit_sphere();
        assert!(s
            .intersect(Vec3::new(2.0, 0.0, 3.0), Vec3::NEG_Z, RAY_EPSILON, FLOAT_INF)
            .is_none());
    }
}
