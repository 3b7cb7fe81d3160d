//! Shader bridge: turns a confirmed closest hit into shadow and indirect
//! rays.

use crate::common::{has_positive, unpack_color, Float, HISTORY_SIZE, ONE_OVER_PI};
use crate::rays::{Intersection, Ray};
use crate::rng::Rng;
use crate::scene::light::Light;
use crate::scene::material::{blinn_phong, Bsdf};
use crate::scene::Scene;
use glam::Vec3;
use std::collections::VecDeque;

/// Converts one authoritative hit into a bag of shadow rays (into `sq2`) and
/// at most a couple of indirect rays (into `rq2`).
///
/// Implementations are pure given their inputs: all randomness is derived
/// from `(samid, depth)`, so results are invariant under ray reordering
/// across threads and ranks. In out-of-core runs a continuation whose virtual
/// depth saturates the history window is parked in `pending_q` instead of
/// the radiance queue and released on the next depth wave.
pub trait Shader: Send + Sync {
    /// Returns true for the ambient-occlusion estimator.
    fn is_ao(&self) -> bool;

    /// Number of distinct occlusion slots per sample.
    fn num_light_samples(&self) -> usize;

    /// Shade one hit.
    ///
    /// * `domain_id` - Domain the hit belongs to.
    /// * `ray`       - The incoming ray.
    /// * `isect`     - The hit record.
    /// * `sq2`       - Output shadow rays.
    /// * `rq2`       - Output indirect rays.
    /// * `pending_q` - Saturated continuations (out-of-core only).
    /// * `ray_depth` - Bounce depth of the incoming ray.
    #[allow(clippy::too_many_arguments)]
    fn shade(
        &self,
        domain_id: usize,
        ray: &Ray,
        isect: &Intersection,
        sq2: &mut VecDeque<Ray>,
        rq2: &mut VecDeque<Ray>,
        pending_q: &mut VecDeque<Ray>,
        ray_depth: i32,
    );
}

/// Emit the indirect continuation, honoring the virtual-depth window in
/// out-of-core mode.
#[allow(clippy::too_many_arguments)]
fn gen_r2(
    virtual_depth: bool,
    rayin: &Ray,
    org: Vec3,
    dir: Vec3,
    w: Vec3,
    t: Float,
    rq2: &mut VecDeque<Ray>,
    pending_q: &mut VecDeque<Ray>,
) {
    if virtual_depth {
        let next_virtual_depth = rayin.depth + 1;
        if next_virtual_depth == HISTORY_SIZE {
            pending_q.push_back(Ray::secondary(rayin, org, dir, w, t, 0));
        } else {
            rq2.push_back(Ray::secondary(rayin, org, dir, w, t, next_virtual_depth));
        }
    } else {
        rq2.push_back(Ray::secondary(rayin, org, dir, w, t, 0));
    }
}

/// Direct lighting plus path continuation.
pub struct ShaderPt {
    lights: Vec<Light>,
    bsdfs: Vec<Bsdf>,
    bounces: i32,
    /// Samples per area light.
    samples: i32,
    ks: Vec3,
    shininess: Float,
    /// Flattened light-sample slot base per light.
    light_base: Vec<i32>,
    num_light_samples: usize,
    /// Track bounce depth through the history window (out-of-core).
    virtual_depth: bool,
}

impl ShaderPt {
    /// Create the shader for a scene.
    ///
    /// * `scene`         - The scene.
    /// * `bounces`       - Bounce budget.
    /// * `samples`       - Samples per area light.
    /// * `ks`            - Specular reflectance.
    /// * `shininess`     - Specular exponent.
    /// * `virtual_depth` - True in out-of-core mode.
    pub fn new(
        scene: &Scene,
        bounces: i32,
        samples: i32,
        ks: Vec3,
        shininess: Float,
        virtual_depth: bool,
    ) -> Self {
        let lights = scene.lights().to_vec();
        let bsdfs = (0..scene.num_domains()).map(|id| scene.bsdf(id)).collect();
        let mut light_base = Vec::with_capacity(lights.len());
        let mut slots = 0i32;
        for light in &lights {
            light_base.push(slots);
            slots += if light.is_area_light() { samples } else { 1 };
        }
        Self {
            lights,
            bsdfs,
            bounces,
            samples,
            ks,
            shininess,
            light_base,
            num_light_samples: slots.max(1) as usize,
            virtual_depth,
        }
    }
}

impl Shader for ShaderPt {
    fn is_ao(&self) -> bool {
        false
    }

    fn num_light_samples(&self) -> usize {
        self.num_light_samples
    }

    fn shade(
        &self,
        domain_id: usize,
        ray: &Ray,
        isect: &Intersection,
        sq2: &mut VecDeque<Ray>,
        rq2: &mut VecDeque<Ray>,
        pending_q: &mut VecDeque<Ray>,
        ray_depth: i32,
    ) {
        let pos = ray.hit_position(isect.t);
        let surf_radiance = unpack_color(isect.color);

        let normal = isect.ns;
        let wo = -ray.direction();
        let lin = ray.weight();

        let cos_theta_i = wo.dot(normal);
        let entering = cos_theta_i > 0.0;
        let normal_ff = (if entering { normal } else { -normal }).normalize_or_zero();

        let bsdf = self.bsdfs[domain_id];
        let delta_dist = bsdf.is_delta();

        let next_virtual_depth = ray.depth + 1;
        let next_depth = if self.virtual_depth {
            ray_depth + next_virtual_depth
        } else {
            ray_depth + 1
        };
        debug_assert!(next_virtual_depth <= HISTORY_SIZE);

        let mut sampler = Rng::for_sample(ray.samid, next_depth);

        if !delta_dist {
            for (l, light) in self.lights.iter().enumerate() {
                if light.is_area_light() {
                    for s in 0..self.samples {
                        let (light_radiance, wi, pdf) = light.sample_area(&mut sampler, normal_ff);
                        if pdf > 0.0 {
                            let costheta = normal_ff.dot(wi).clamp(0.0, 1.0);
                            let lr = lin
                                * blinn_phong(
                                    costheta,
                                    surf_radiance,
                                    self.ks,
                                    self.shininess,
                                    light_radiance,
                                    wi,
                                    normal_ff,
                                    wo,
                                )
                                * (1.0 / (pdf * self.samples as Float));
                            if has_positive(lr) {
                                let slot = self.light_base[l] + s;
                                sq2.push_back(Ray::shadow(ray, slot, pos, wi, lr, isect.t));
                            }
                        }
                    }
                } else {
                    let (light_radiance, wi, pdf) = light.sample(pos);
                    if pdf > 0.0 {
                        let costheta = normal_ff.dot(wi).clamp(0.0, 1.0);
                        let lr = lin
                            * blinn_phong(
                                costheta,
                                surf_radiance,
                                self.ks,
                                self.shininess,
                                light_radiance,
                                wi,
                                normal_ff,
                                wo,
                            )
                            * (1.0 / pdf);
                        if has_positive(lr) {
                            let slot = self.light_base[l];
                            sq2.push_back(Ray::shadow(ray, slot, pos, wi, lr, isect.t));
                        }
                    }
                }
            }
        }

        if next_depth < self.bounces {
            let wo = wo.normalize();
            if delta_dist {
                if cos_theta_i != 0.0 {
                    let abs_cos_theta_i = cos_theta_i.clamp(-1.0, 1.0).abs();
                    let sample =
                        bsdf.sample_delta(entering, abs_cos_theta_i, wo, normal_ff, &mut sampler);
                    if sample.reflect {
                        let lr = lin * (sample.fr / abs_cos_theta_i);
                        if has_positive(lr) {
                            gen_r2(
                                self.virtual_depth,
                                ray,
                                pos,
                                sample.wr.normalize(),
                                lr,
                                isect.t,
                                rq2,
                                pending_q,
                            );
                        }
                    }
                    if sample.transmit {
                        let lr = lin * ((1.0 - sample.fr) / abs_cos_theta_i);
                        if has_positive(lr) {
                            gen_r2(
                                self.virtual_depth,
                                ray,
                                pos,
                                sample.wt.normalize(),
                                lr,
                                isect.t,
                                rq2,
                                pending_q,
                            );
                        }
                    }
                }
            } else {
                let (wi, pdf) = bsdf.sample_random(normal_ff, &mut sampler);
                let costheta = normal_ff.dot(wi).clamp(0.0, 1.0);
                let lr = lin * surf_radiance * (ONE_OVER_PI * costheta / pdf);
                if has_positive(lr) {
                    gen_r2(
                        self.virtual_depth,
                        ray,
                        pos,
                        wi,
                        lr,
                        isect.t,
                        rq2,
                        pending_q,
                    );
                }
            }
        }
    }
}

/// Ambient-occlusion estimator: cosine-distributed occlusion probes stand in
/// for light samples.
pub struct ShaderAo {
    bsdfs: Vec<Bsdf>,
    bounces: i32,
    samples: i32,
    virtual_depth: bool,
}

impl ShaderAo {
    /// Create the shader for a scene.
    ///
    /// * `scene`         - The scene.
    /// * `bounces`       - Bounce budget.
    /// * `samples`       - Occlusion probes per hit.
    /// * `virtual_depth` - True in out-of-core mode.
    pub fn new(scene: &Scene, bounces: i32, samples: i32, virtual_depth: bool) -> Self {
        Self {
            bsdfs: (0..scene.num_domains()).map(|id| scene.bsdf(id)).collect(),
            bounces,
            samples,
            virtual_depth,
        }
    }
}

impl Shader for ShaderAo {
    fn is_ao(&self) -> bool {
        true
    }

    fn num_light_samples(&self) -> usize {
        self.samples.max(1) as usize
    }

    fn shade(
        &self,
        domain_id: usize,
        ray: &Ray,
        isect: &Intersection,
        sq2: &mut VecDeque<Ray>,
        rq2: &mut VecDeque<Ray>,
        pending_q: &mut VecDeque<Ray>,
        ray_depth: i32,
    ) {
        let pos = ray.hit_position(isect.t);
        let surf_radiance = unpack_color(isect.color);

        let normal = isect.ns;
        let wo = -ray.direction();
        let lin = ray.weight();

        let cos_theta_i = wo.dot(normal);
        let entering = cos_theta_i > 0.0;
        let normal_ff = (if entering { normal } else { -normal }).normalize_or_zero();

        let bsdf = self.bsdfs[domain_id];
        let ao_weight = 1.0 / self.samples as Float;

        for l in 0..self.samples {
            let mut light_sampler = Rng::new((ray.pixid as u64).wrapping_mul(l as u64 + 1));
            let (wi, pdf) = bsdf.sample_random(normal_ff, &mut light_sampler);
            let costheta = normal_ff.dot(wi).clamp(0.0, 1.0);
            let lr = lin * surf_radiance * (ONE_OVER_PI * costheta * ao_weight / pdf);
            if has_positive(lr) {
                sq2.push_back(Ray::shadow(ray, l, pos, wi, lr, isect.t));
            }
        }

        let next_virtual_depth = ray.depth + 1;
        let next_depth = if self.virtual_depth {
            ray_depth + next_virtual_depth
        } else {
            ray_depth + 1
        };
        debug_assert!(ray_depth < self.bounces);

        if next_depth < self.bounces {
            let wo = wo.normalize();
            let mut sampler = Rng::for_sample(ray.samid, next_depth);
            if bsdf.is_delta() {
                if cos_theta_i != 0.0 {
                    let abs_cos_theta_i = cos_theta_i.clamp(-1.0, 1.0).abs();
                    let sample =
                        bsdf.sample_delta(entering, abs_cos_theta_i, wo, normal_ff, &mut sampler);
                    if sample.reflect {
                        let lr = lin * (sample.fr / abs_cos_theta_i);
                        if has_positive(lr) {
                            gen_r2(
                                self.virtual_depth,
                                ray,
                                pos,
                                sample.wr.normalize(),
                                lr,
                                isect.t,
                                rq2,
                                pending_q,
                            );
                        }
                    }
                    if sample.transmit {
                        let lr = lin * ((1.0 - sample.fr) / abs_cos_theta_i);
                        if has_positive(lr) {
                            gen_r2(
                                self.virtual_depth,
                                ray,
                                pos,
                                sample.wt.normalize(),
                                lr,
                                isect.t,
                                rq2,
                                pending_q,
                            );
                        }
                    }
                }
            } else {
                let (wi, pdf) = bsdf.sample_random(normal_ff, &mut sampler);
                let costheta = normal_ff.dot(wi).clamp(0.0, 1.0);
                let lr = lin * surf_radiance * (ONE_OVER_PI * costheta / pdf);
                if has_positive(lr) {
                    gen_r2(
                        self.virtual_depth,
                        ray,
                        pos,
                        wi,
                        lr,
                        isect.t,
                        rq2,
                        pending_q,
                    );
                }
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
    use crate::scene::descriptor::parse_descriptor;
    use std::path::Path;

    fn lit_scene() -> Scene {
        let text = "domain\nsphere 0 0 -3 0.5 matte 0.8 0.4 0.2\nlight point 0 5 0 50 50 50\n";
        let desc = parse_descriptor(text, Path::new("")).unwrap();
        Scene::from_desc(desc, -1, 1).unwrap()
    }

    fn hit_at(t: Float) -> Intersection {
        Intersection {
            t,
            ng: Vec3::Z,
            ns: Vec3::Z,
            u: 0.0,
            v: 0.0,
            geom_id: 1,
            prim_id: 0,
            color: crate::common::pack_color(Vec3::splat(0.8)),
        }
    }

    #[test]
    fn pt_emits_shadow_and_indirect_rays() {
        let scene = lit_scene();
        let shader = ShaderPt::new(&scene, 3, 2, Vec3::ZERO, 40.0, false);
        let ray = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 0, 0);
        let (mut sq2, mut rq2, mut pending) = (VecDeque::new(), VecDeque::new(), VecDeque::new());
        shader.shade(0, &ray, &hit_at(2.5), &mut sq2, &mut rq2, &mut pending, 0);
        assert_eq!(sq2.len(), 1);
        assert_eq!(rq2.len(), 1);
        assert!(pending.is_empty());
        let shadow = sq2.front().unwrap();
        assert_eq!(shadow.light, 0);
        assert_eq!(shadow.t, 2.5);
        // shadow ray heads up toward the light
        assert!(shadow.direction().y > 0.8);
    }

    #[test]
    fn pt_stops_spawning_at_bounce_budget() {
        let scene = lit_scene();
        let shader = ShaderPt::new(&scene, 1, 1, Vec3::ZERO, 40.0, false);
        let ray = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 0, 0);
        let (mut sq2, mut rq2, mut pending) = (VecDeque::new(), VecDeque::new(), VecDeque::new());
        shader.shade(0, &ray, &hit_at(2.5), &mut sq2, &mut rq2, &mut pending, 0);
        assert!(rq2.is_empty());
        assert!(!sq2.is_empty());
    }

    #[test]
    fn shading_is_deterministic_per_sample_and_depth() {
        let scene = lit_scene();
        let shader = ShaderPt::new(&scene, 4, 2, Vec3::ZERO, 40.0, false);
        let ray = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 7, 42);
        let run = || {
            let (mut s, mut r, mut p) = (VecDeque::new(), VecDeque::new(), VecDeque::new());
            shader.shade(0, &ray, &hit_at(2.5), &mut s, &mut r, &mut p, 1);
            (Vec::from(s), Vec::from(r))
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn virtual_depth_saturation_parks_continuations() {
        let scene = lit_scene();
        let shader = ShaderPt::new(&scene, 100, 1, Vec3::ZERO, 40.0, true);
        let mut ray = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 0, 0);
        ray.depth = HISTORY_SIZE - 1;
        let (mut sq2, mut rq2, mut pending) = (VecDeque::new(), VecDeque::new(), VecDeque::new());
        shader.shade(0, &ray, &hit_at(2.5), &mut sq2, &mut rq2, &mut pending, 0);
        assert!(rq2.is_empty());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.front().unwrap().depth, 0);
    }

    #[test]
    fn ao_emits_probe_rays() {
        let scene = lit_scene();
        let shader = ShaderAo::new(&scene, 1, 4, false);
        assert!(shader.is_ao());
        assert_eq!(shader.num_light_samples(), 4);
        let ray = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 0, 0);
        let (mut sq2, mut rq2, mut pending) = (VecDeque::new(), VecDeque::new(), VecDeque::new());
        shader.shade(0, &ray, &hit_at(2.5), &mut sq2, &mut rq2, &mut pending, 0);
        assert_eq!(sq2.len(), 4);
        assert!(rq2.is_empty());
        for (l, s) in sq2.iter().enumerate() {
            assert_eq!(s.light, l as i32);
            assert!(s.direction().dot(Vec3::Z) > 0.0);
        }
    }
}
