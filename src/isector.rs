//! Ray-to-domain queue placement.

use crate::common::Float;
use crate::qvector::QVector;
use crate::rays::Ray;
use crate::scene::Scene;
use std::collections::VecDeque;

/// Places rays into per-domain queues from the sorted result of the domain
/// bounds test. The exclusion variants serve secondary rays, which must not
/// be re-queued for the domain that spawned them; the bounded variant prunes
/// domains that start beyond an already known hit.
#[derive(Default)]
pub struct Isector;

impl Isector {
    /// Queue a ray for every domain it overlaps.
    ///
    /// * `scene` - The scene.
    /// * `ray`   - The ray.
    /// * `qs`    - Destination queues.
    pub fn intersect(&self, scene: &Scene, ray: &Ray, qs: &mut QVector<Ray>) {
        let domains = scene.intersect_domains(ray.origin(), ray.direction());
        for (id, _) in domains.iter() {
            qs.push(id, *ray);
        }
    }

    /// Queue a ray for every domain it overlaps; rays overlapping none go to
    /// the background queue and contribute sky color on the image plane.
    ///
    /// * `scene`        - The scene.
    /// * `ray`          - The ray.
    /// * `qs`           - Destination queues.
    /// * `background_q` - Queue of rays that missed every domain.
    pub fn intersect_with_background(
        &self,
        scene: &Scene,
        ray: &Ray,
        qs: &mut QVector<Ray>,
        background_q: &mut VecDeque<Ray>,
    ) {
        let domains = scene.intersect_domains(ray.origin(), ray.direction());
        if domains.count == 0 {
            background_q.push_back(*ray);
            return;
        }
        for (id, _) in domains.iter() {
            qs.push(id, *ray);
        }
    }

    /// Queue a ray for every overlapped domain except the one it came from.
    ///
    /// * `exclude_id` - Domain where the ray originated.
    /// * `scene`      - The scene.
    /// * `ray`        - The ray.
    /// * `qs`         - Destination queues.
    pub fn intersect_excluding(
        &self,
        exclude_id: usize,
        scene: &Scene,
        ray: &Ray,
        qs: &mut QVector<Ray>,
    ) {
        let domains = scene.intersect_domains(ray.origin(), ray.direction());
        for (id, _) in domains.iter() {
            if id != exclude_id {
                qs.push(id, *ray);
            }
        }
    }

    /// Queue a ray for overlapped domains whose entry lies nearer than a
    /// known hit, excluding the origin domain.
    ///
    /// * `exclude_id` - Domain where the ray originated.
    /// * `t`          - Distance of the known hit.
    /// * `scene`      - The scene.
    /// * `ray`        - The ray.
    /// * `qs`         - Destination queues.
    pub fn intersect_below(
        &self,
        exclude_id: usize,
        t: Float,
        scene: &Scene,
        ray: &Ray,
        qs: &mut QVector<Ray>,
    ) {
        let domains = scene.intersect_domains(ray.origin(), ray.direction());
        for (id, entry_t) in domains.iter() {
            if id != exclude_id && entry_t < t {
                qs.push(id, *ray);
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
    use glam::Vec3;

    fn stacked_scene() -> Scene {
        crate::scene::tests::sphere_scene(
            &[
                Vec3::new(0.0, 0.0, -2.0),
                Vec3::new(0.0, 0.0, -5.0),
                Vec3::new(0.0, 0.0, -8.0),
            ],
            -1,
            1,
        )
    }

    #[test]
    fn queues_every_overlapped_domain() {
        let scene = stacked_scene();
        let isector = Isector;
        let mut qs = QVector::new(3);
        let ray = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 0, 0);
        isector.intersect(&scene, &ray, &mut qs);
        assert_eq!(qs.size(0), 1);
        assert_eq!(qs.size(1), 1);
        assert_eq!(qs.size(2), 1);
    }

    #[test]
    fn background_ray_bypasses_queues() {
        let scene = stacked_scene();
        let isector = Isector;
        let mut qs = QVector::new(3);
        let mut bg = VecDeque::new();
        let ray = Ray::eye(Vec3::ZERO, Vec3::Y, 0, 0);
        isector.intersect_with_background(&scene, &ray, &mut qs, &mut bg);
        assert_eq!(bg.len(), 1);
        assert!(qs.is_empty(0) && qs.is_empty(1) && qs.is_empty(2));
    }

    #[test]
    fn exclusion_skips_origin_domain() {
        let scene = stacked_scene();
        let isector = Isector;
        let mut qs = QVector::new(3);
        let ray = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 0, 0);
        isector.intersect_excluding(1, &scene, &ray, &mut qs);
        assert_eq!(qs.size(0), 1);
        assert_eq!(qs.size(1), 0);
        assert_eq!(qs.size(2), 1);
    }

    #[test]
    fn bound_prunes_farther_domains() {
        let scene = stacked_scene();
        let isector = Isector;
        let mut qs = QVector::new(3);
        let ray = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 0, 0);
        // a hit at t=3 rules out the domains entered beyond it
        isector.intersect_below(0, 3.0, &scene, &ray, &mut qs);
        assert_eq!(qs.size(0), 0);
        assert_eq!(qs.size(1), 0);
        assert_eq!(qs.size(2), 0);

        isector.intersect_below(0, 6.0, &scene, &ray, &mut qs);
        assert_eq!(qs.size(1), 1);
        assert_eq!(qs.size(2), 0);
    }
}
