//! Light sources.

use crate::common::Float;
use crate::rng::Rng;
use crate::scene::material::cosine_sample_hemisphere;
use glam::Vec3;

/// A light source of the scene. Point lights are sampled deterministically;
/// the diffuse hemisphere light is an area source sampled stochastically over
/// the hemisphere above the shading point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Light {
    Point { position: Vec3, radiance: Vec3 },
    DiffuseHemisphere { radiance: Vec3 },
}

impl Light {
    /// Returns true for lights that need stochastic area sampling.
    pub fn is_area_light(&self) -> bool {
        matches!(self, Light::DiffuseHemisphere { .. })
    }

    /// Sample the light from a shading position. Returns the incident
    /// radiance, the direction toward the sample and its pdf.
    ///
    /// * `pos` - Shading position.
    pub fn sample(&self, pos: Vec3) -> (Vec3, Vec3, Float) {
        match self {
            Light::Point { position, radiance } => {
                let d = *position - pos;
                let dist2 = d.length_squared().max(1e-6);
                (*radiance / dist2, d / dist2.sqrt(), 1.0)
            }
            Light::DiffuseHemisphere { radiance } => (*radiance, Vec3::Y, 1.0),
        }
    }

    /// Sample the area light over the hemisphere above `n`.
    ///
    /// * `rng` - Sample source.
    /// * `n`   - Forward-facing surface normal.
    pub fn sample_area(&self, rng: &mut Rng, n: Vec3) -> (Vec3, Vec3, Float) {
        match self {
            Light::DiffuseHemisphere { radiance } => {
                let (wi, pdf) = cosine_sample_hemisphere(n, rng.uniform_float(), rng.uniform_float());
                (*radiance, wi, pdf)
            }
            Light::Point { .. } => {
                let (r, wi, pdf) = self.sample(Vec3::ZERO);
                (r, wi, pdf)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_light_direction_and_falloff() {
        let l = Light::Point {
            position: Vec3::new(0.0, 2.0, 0.0),
            radiance: Vec3::splat(4.0),
        };
        let (rad, wi, pdf) = l.sample(Vec3::ZERO);
        assert!((wi - Vec3::Y).length() < 1e-6);
        assert_eq!(pdf, 1.0);
        assert!((rad - Vec3::splat(1.0)).length() < 1e-5);
    }

    #[test]
    fn hemisphere_light_samples_above_surface() {
        let l = Light::DiffuseHemisphere {
            radiance: Vec3::ONE,
        };
        assert!(l.is_area_light());
        let mut rng = Rng::new(3);
        for _ in 0..32 {
            let (_, wi, pdf) = l.sample_area(&mut rng, Vec3::Y);
            assert!(wi.y >= -1e-5);
            assert!(pdf > 0.0);
        }
    }
}
