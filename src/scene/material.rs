//! Materials and the per-domain BSDF.

use crate::common::{Float, ONE_OVER_PI};
use crate::rng::Rng;
use glam::Vec3;

/// Surface material of a model or analytic shape.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Material {
    /// Diffuse surface.
    Matte { albedo: Vec3 },

    /// Fuzzed mirror.
    Metal { albedo: Vec3, fuzz: Float },

    /// Clear refractive surface.
    Dielectric { index: Float },
}

impl Material {
    /// Surface albedo used when no interpolated color is available.
    pub fn albedo(&self) -> Vec3 {
        match self {
            Material::Matte { albedo } => *albedo,
            Material::Metal { albedo, .. } => *albedo,
            Material::Dielectric { .. } => Vec3::ONE,
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Material::Matte {
            albedo: Vec3::splat(0.5),
        }
    }
}

/// Scattering model of a whole domain, derived from its materials. Delta
/// distributions scatter into a single direction per interaction and skip
/// direct light sampling.
#[derive(Clone, Copy, Debug)]
pub enum Bsdf {
    Diffuse,
    Mirror { fuzz: Float },
    Glass { eta: Float },
}

/// One delta-distribution scattering decision.
#[derive(Clone, Copy, Debug)]
pub struct DeltaSample {
    /// A reflected continuation exists.
    pub reflect: bool,

    /// A transmitted continuation exists. Never set together with `reflect`.
    pub transmit: bool,

    /// Reflection probability; the transmitted weight is `1 - fr`.
    pub fr: Float,

    /// Reflected direction.
    pub wr: Vec3,

    /// Transmitted direction, when `transmit` is set.
    pub wt: Vec3,
}

impl Bsdf {
    /// Derive a domain BSDF from the materials it contains: the first delta
    /// material wins, otherwise the domain scatters diffusely.
    ///
    /// * `materials` - Materials of the domain's models and shapes.
    pub fn from_materials<'a, I: IntoIterator<Item = &'a Material>>(materials: I) -> Bsdf {
        for m in materials {
            match m {
                Material::Metal { fuzz, .. } => return Bsdf::Mirror { fuzz: *fuzz },
                Material::Dielectric { index } => return Bsdf::Glass { eta: *index },
                Material::Matte { .. } => {}
            }
        }
        Bsdf::Diffuse
    }

    /// Returns true for single-direction distributions.
    pub fn is_delta(&self) -> bool {
        !matches!(self, Bsdf::Diffuse)
    }

    /// Sample a scattered direction over the hemisphere around `n`,
    /// cosine-weighted. Returns the direction and its pdf.
    ///
    /// * `n`   - Forward-facing surface normal.
    /// * `rng` - Sample source.
    pub fn sample_random(&self, n: Vec3, rng: &mut Rng) -> (Vec3, Float) {
        cosine_sample_hemisphere(n, rng.uniform_float(), rng.uniform_float())
    }

    /// Sample the delta distribution.
    ///
    /// * `entering`    - True if the ray enters the surface.
    /// * `cos_theta_i` - |cos| of the incident angle.
    /// * `wo`          - Outgoing (toward viewer) direction, normalized.
    /// * `n`           - Forward-facing surface normal.
    /// * `rng`         - Sample source for fuzz perturbation.
    pub fn sample_delta(
        &self,
        entering: bool,
        cos_theta_i: Float,
        wo: Vec3,
        n: Vec3,
        rng: &mut Rng,
    ) -> DeltaSample {
        match self {
            Bsdf::Diffuse => DeltaSample {
                reflect: false,
                transmit: false,
                fr: 0.0,
                wr: Vec3::ZERO,
                wt: Vec3::ZERO,
            },
            Bsdf::Mirror { fuzz } => {
                let mut wr = reflect(wo, n);
                if *fuzz > 0.0 {
                    wr = (wr + random_in_unit_sphere(rng) * *fuzz).normalize();
                }
                DeltaSample {
                    reflect: true,
                    transmit: false,
                    fr: 1.0,
                    wr,
                    wt: Vec3::ZERO,
                }
            }
            Bsdf::Glass { eta } => {
                let eta_ratio = if entering { 1.0 / *eta } else { *eta };
                match refract(wo, n, eta_ratio) {
                    Some(wt) => DeltaSample {
                        reflect: false,
                        transmit: true,
                        fr: schlick(cos_theta_i, eta_ratio),
                        wr: Vec3::ZERO,
                        wt,
                    },
                    // total internal reflection
                    None => DeltaSample {
                        reflect: true,
                        transmit: false,
                        fr: 1.0,
                        wr: reflect(wo, n),
                        wt: Vec3::ZERO,
                    },
                }
            }
        }
    }
}

/// Mirror `wo` about `n`. Both point away from the surface.
pub fn reflect(wo: Vec3, n: Vec3) -> Vec3 {
    n * (2.0 * wo.dot(n)) - wo
}

/// Refract the path continuing opposite `wo` through the interface with
/// relative index `eta_ratio`. None on total internal reflection.
pub fn refract(wo: Vec3, n: Vec3, eta_ratio: Float) -> Option<Vec3> {
    let cos_i = wo.dot(n).clamp(-1.0, 1.0);
    let sin2_t = eta_ratio * eta_ratio * (1.0 - cos_i * cos_i);
    if sin2_t > 1.0 {
        return None;
    }
    let cos_t = (1.0 - sin2_t).sqrt();
    Some((-wo * eta_ratio + n * (eta_ratio * cos_i - cos_t)).normalize())
}

/// Schlick approximation of the fresnel reflectance.
pub fn schlick(cos_theta: Float, eta_ratio: Float) -> Float {
    let r0 = (1.0 - eta_ratio) / (1.0 + eta_ratio);
    let r0 = r0 * r0;
    r0 + (1.0 - r0) * (1.0 - cos_theta).powi(5)
}

/// Blinn-Phong shading of one light sample.
///
/// * `cos_theta` - Clamped cosine between normal and light direction.
/// * `kd`        - Diffuse reflectance.
/// * `ks`        - Specular reflectance.
/// * `shininess` - Specular exponent.
/// * `light`     - Incident light radiance.
/// * `wi`        - Direction toward the light sample.
/// * `n`         - Surface normal.
/// * `wo`        - Direction toward the viewer.
#[allow(clippy::too_many_arguments)]
pub fn blinn_phong(
    cos_theta: Float,
    kd: Vec3,
    ks: Vec3,
    shininess: Float,
    light: Vec3,
    wi: Vec3,
    n: Vec3,
    wo: Vec3,
) -> Vec3 {
    let diffuse = kd * (ONE_OVER_PI * cos_theta);
    let h = (wi + wo).normalize_or_zero();
    let spec = ks * n.dot(h).max(0.0).powf(shininess) * cos_theta;
    light * (diffuse + spec)
}

/// Cosine-weighted hemisphere sample about `n`. Returns direction and pdf.
///
/// * `n`  - Hemisphere axis, normalized.
/// * `u1` - First uniform sample.
/// * `u2` - Second uniform sample.
pub fn cosine_sample_hemisphere(n: Vec3, u1: Float, u2: Float) -> (Vec3, Float) {
    let r = u1.sqrt();
    let phi = 2.0 * std::f32::consts::PI * u2;
    let x = r * phi.cos();
    let y = r * phi.sin();
    let z = (1.0 - u1).max(0.0).sqrt();

    let (t, b) = orthonormal_basis(n);
    let wi = (t * x + b * y + n * z).normalize();
    (wi, (z * ONE_OVER_PI).max(1e-6))
}

/// Build tangent and bitangent around a normalized axis.
fn orthonormal_basis(n: Vec3) -> (Vec3, Vec3) {
    let a = if n.x.abs() > 0.9 { Vec3::Y } else { Vec3::X };
    let t = n.cross(a).normalize();
    (t, n.cross(t))
}

fn random_in_unit_sphere(rng: &mut Rng) -> Vec3 {
    loop {
        let p = Vec3::new(
            rng.uniform_float() * 2.0 - 1.0,
            rng.uniform_float() * 2.0 - 1.0,
            rng.uniform_float() * 2.0 - 1.0,
        );
        if p.length_squared() < 1.0 {
            return p;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bsdf_derivation() {
        let matte = Material::default();
        let metal = Material::Metal {
            albedo: Vec3::ONE,
            fuzz: 0.0,
        };
        assert!(!Bsdf::from_materials([&matte]).is_delta());
        assert!(Bsdf::from_materials([&matte, &metal]).is_delta());
    }

    #[test]
    fn mirror_reflects_about_normal() {
        let n = Vec3::Y;
        let wo = Vec3::new(1.0, 1.0, 0.0).normalize();
        let wr = reflect(wo, n);
        assert!((wr - Vec3::new(-wo.x, wo.y, 0.0)).length() < 1e-6);
    }

    #[test]
    fn glass_reports_total_internal_reflection() {
        let bsdf = Bsdf::Glass { eta: 1.5 };
        // grazing exit from the dense medium
        let wo = Vec3::new(0.99, 0.14, 0.0).normalize();
        let s = bsdf.sample_delta(false, wo.dot(Vec3::Y), wo, Vec3::Y, &mut crate::rng::Rng::new(1));
        assert!(s.reflect && !s.transmit);
        assert_eq!(s.fr, 1.0);
    }

    #[test]
    fn glass_refracts_at_normal_incidence() {
        let bsdf = Bsdf::Glass { eta: 1.5 };
        let s = bsdf.sample_delta(true, 1.0, Vec3::Y, Vec3::Y, &mut crate::rng::Rng::new(1));
        assert!(s.transmit && !s.reflect);
        assert!((s.wt - Vec3::NEG_Y).length() < 1e-5);
        assert!(s.fr > 0.0 && s.fr < 0.1);
    }

    proptest! {
        #[test]
        fn cosine_samples_stay_in_hemisphere(u1 in 0.0f32..1.0, u2 in 0.0f32..1.0) {
            let n = Vec3::new(0.3, 0.8, -0.2).normalize();
            let (wi, pdf) = cosine_sample_hemisphere(n, u1, u2);
            prop_assert!(wi.dot(n) >= -1e-5);
            prop_assert!(pdf > 0.0);
            prop_assert!((wi.length() - 1.0).abs() < 1e-4);
        }

        #[test]
        fn schlick_in_unit_range(c in 0.0f32..1.0, eta in 0.3f32..3.0) {
            let f = schlick(c, eta);
            prop_assert!((0.0..=1.0).contains(&f));
        }
    }
}
