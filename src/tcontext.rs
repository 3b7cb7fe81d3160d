//! Per-thread scheduling context.

use crate::arena::DepthArena;
use crate::common::Float;
use crate::error::Result;
use crate::image::HdrImage;
use crate::isector::Isector;
use crate::qvector::QVector;
use crate::rays::{Intersection, Ray};
use crate::scene::Scene;
use crate::shader::Shader;
use crate::vbuf::VBuf;
use crate::work_stats::WorkStats;
use glam::Vec3;
use std::collections::VecDeque;

/// A hit awaiting visibility-buffer reconciliation.
struct IsectInfo {
    domain_id: usize,
    ray: Ray,
    isect: u32,
}

/// A confirmed shadow occlusion awaiting its obuf write.
struct OcclInfo {
    samid: i32,
    light: i32,
}

/// A filtered shadow ray awaiting correctness resolution.
struct ShadowItem {
    domain_id: usize,
    ray: Ray,
}

/// A filtered radiance ray with its speculative local hit.
struct CachedItem {
    domain_id: usize,
    ray: Ray,
    isect: u32,
}

/// All queues one worker thread drives through the depth loop. Every queue
/// has exactly one writer (its thread); the visibility buffer and the image
/// are the only shared sinks, both atomic.
pub struct TContext {
    /// Thread id within the team.
    pub tid: usize,

    rank: i32,
    num_domains: usize,

    /// Per-domain radiance queues (this thread's shard).
    pub rqs: QVector<Ray>,

    /// Per-domain shadow queues (this thread's shard).
    pub sqs: QVector<Ray>,

    isects: VecDeque<IsectInfo>,
    occls: VecDeque<OcclInfo>,
    reduced_isects: VecDeque<IsectInfo>,
    sq2: VecDeque<Ray>,
    rq2: VecDeque<Ray>,
    fsq2: VecDeque<ShadowItem>,
    frq2: VecDeque<CachedItem>,
    cached_rq: VecDeque<CachedItem>,
    reduced_cached_rq: VecDeque<CachedItem>,

    /// Shadow rays that survived all intervening domains and may deposit.
    pub retire_q: VecDeque<Ray>,

    /// Eye rays that missed every domain.
    pub background_q: VecDeque<Ray>,

    /// Saturated out-of-core continuations, released next depth wave.
    pub pending_q: VecDeque<Ray>,

    arena: DepthArena<Intersection>,

    /// This thread's share of the block counters.
    pub work_stats: WorkStats,

    /// Domain bounds tester.
    pub isector: Isector,
}

impl TContext {
    /// Create a context.
    ///
    /// * `tid`         - Thread id within the team.
    /// * `rank`        - This process' rank.
    /// * `num_domains` - Number of scene domains.
    /// * `num_ranks`   - Number of ranks.
    pub fn new(tid: usize, rank: i32, num_domains: usize, num_ranks: usize) -> Self {
        Self {
            tid,
            rank,
            num_domains,
            rqs: QVector::new(num_domains),
            sqs: QVector::new(num_domains),
            isects: VecDeque::new(),
            occls: VecDeque::new(),
            reduced_isects: VecDeque::new(),
            sq2: VecDeque::new(),
            rq2: VecDeque::new(),
            fsq2: VecDeque::new(),
            frq2: VecDeque::new(),
            cached_rq: VecDeque::new(),
            reduced_cached_rq: VecDeque::new(),
            retire_q: VecDeque::new(),
            background_q: VecDeque::new(),
            pending_q: VecDeque::new(),
            arena: DepthArena::with_capacity(1024),
            work_stats: WorkStats::new(num_domains, num_ranks),
            isector: Isector,
        }
    }

    /// Reset all queues and both arena generations at the start of a frame.
    pub fn reset(&mut self) {
        self.rqs.reset();
        self.sqs.reset();
        self.isects.clear();
        self.occls.clear();
        self.reduced_isects.clear();
        self.sq2.clear();
        self.rq2.clear();
        self.fsq2.clear();
        self.frq2.clear();
        self.cached_rq.clear();
        self.reduced_cached_rq.clear();
        self.retire_q.clear();
        self.background_q.clear();
        self.pending_q.clear();
        self.arena.reset();
        self.work_stats.reset();
    }

    /// Returns true if neither queue holds rays for a domain.
    ///
    /// * `id` - Domain id.
    pub fn is_local_qs_empty(&self, id: usize) -> bool {
        self.rqs.is_empty(id) && self.sqs.is_empty(id)
    }

    /// Drain the radiance and shadow queues of one domain against its loaded
    /// geometry: hits move to the reconciliation queue, confirmed shadow
    /// occlusions to the obuf queue.
    ///
    /// * `id`    - Domain id.
    /// * `block` - Resident cache block of the domain.
    /// * `scene` - The scene.
    /// * `vbuf`  - The visibility buffer.
    pub fn process_rays(&mut self, id: usize, block: usize, scene: &Scene, vbuf: &VBuf) {
        while let Some(ray) = self.rqs.q(id).pop_front() {
            if let Some(isect) = scene.intersect(block, ray.origin(), ray.direction()) {
                let idx = self.arena.alloc_out(isect);
                self.isects.push_back(IsectInfo {
                    domain_id: id,
                    ray,
                    isect: idx,
                });
            }
        }

        while let Some(ray) = self.sqs.q(id).pop_front() {
            if !vbuf.occluded(ray.samid, ray.light)
                && scene.occluded(block, ray.origin(), ray.direction())
            {
                self.occls.push_back(OcclInfo {
                    samid: ray.samid,
                    light: ray.light,
                });
            }
        }
    }

    /// Intersect one received radiance ray against a resident domain.
    ///
    /// * `id`    - Domain id.
    /// * `block` - Resident cache block of the domain.
    /// * `scene` - The scene.
    /// * `ray`   - The received ray.
    pub fn isect_recv_rad(&mut self, id: usize, block: usize, scene: &Scene, ray: Ray) {
        if let Some(isect) = scene.intersect(block, ray.origin(), ray.direction()) {
            let idx = self.arena.alloc_out(isect);
            self.isects.push_back(IsectInfo {
                domain_id: id,
                ray,
                isect: idx,
            });
        }
    }

    /// Occlusion-test one received shadow ray against a resident domain.
    ///
    /// * `id`    - Domain id.
    /// * `block` - Resident cache block of the domain.
    /// * `scene` - The scene.
    /// * `vbuf`  - The visibility buffer.
    /// * `ray`   - The received ray.
    pub fn occl_recv_shad(&mut self, _id: usize, block: usize, scene: &Scene, vbuf: &VBuf, ray: Ray) {
        if !vbuf.occluded(ray.samid, ray.light)
            && scene.occluded(block, ray.origin(), ray.direction())
        {
            self.occls.push_back(OcclInfo {
                samid: ray.samid,
                light: ray.light,
            });
        }
    }

    /// Reconcile pending hits and occlusions into the visibility buffer.
    ///
    /// * `vbuf` - The visibility buffer.
    pub fn update_vbuf(&mut self, vbuf: &VBuf) {
        self.update_tbuf(vbuf);
        self.update_obuf(vbuf);
    }

    /// Fold pending hits into the output t-buffer; winners become shading
    /// candidates.
    ///
    /// * `vbuf` - The visibility buffer.
    pub fn update_tbuf(&mut self, vbuf: &VBuf) {
        while let Some(info) = self.isects.pop_front() {
            let t = self.arena.out(info.isect).t;
            if vbuf.update_tbuf_out(info.ray.samid, t, self.rank, info.domain_id) {
                self.reduced_isects.push_back(info);
            }
        }
    }

    /// Write pending occlusions into the obuf.
    ///
    /// * `vbuf` - The visibility buffer.
    pub fn update_obuf(&mut self, vbuf: &VBuf) {
        while let Some(o) = self.occls.pop_front() {
            vbuf.set_obuf(o.samid, o.light);
        }
    }

    /// Shade the candidates that still own their sample's closest hit, then
    /// filter the emitted rays against the current domain.
    ///
    /// * `shader`    - The shader bridge.
    /// * `scene`     - The scene.
    /// * `block`     - Resident cache block of the current domain.
    /// * `ray_depth` - Current bounce depth.
    /// * `vbuf`      - The visibility buffer.
    pub fn gen_rays(
        &mut self,
        shader: &dyn Shader,
        scene: &Scene,
        block: usize,
        ray_depth: i32,
        vbuf: &VBuf,
    ) {
        while let Some(info) = self.reduced_isects.pop_front() {
            let isect = *self.arena.out(info.isect);
            if vbuf.equal_to_tbuf_out(info.ray.samid, isect.t, self.rank, info.domain_id) {
                shader.shade(
                    info.domain_id,
                    &info.ray,
                    &isect,
                    &mut self.sq2,
                    &mut self.rq2,
                    &mut self.pending_q,
                    ray_depth,
                );
                self.filter_sq2(info.domain_id, block, scene);
                self.filter_rq2(info.domain_id, block, scene);
            }
        }
    }

    /// Occlusion-test freshly emitted shadow rays against their origin
    /// domain, the most likely occluder.
    ///
    /// * `id`    - Origin domain.
    /// * `block` - Resident cache block of the domain.
    /// * `scene` - The scene.
    pub fn filter_sq2(&mut self, id: usize, block: usize, scene: &Scene) {
        while let Some(mut ray) = self.sq2.pop_front() {
            if scene.occluded(block, ray.origin(), ray.direction()) {
                ray.occluded = 1;
            }
            self.fsq2.push_back(ShadowItem {
                domain_id: id,
                ray,
            });
        }
    }

    /// Speculatively intersect freshly emitted radiance rays against their
    /// origin domain.
    ///
    /// * `id`    - Origin domain.
    /// * `block` - Resident cache block of the domain.
    /// * `scene` - The scene.
    pub fn filter_rq2(&mut self, id: usize, block: usize, scene: &Scene) {
        while let Some(ray) = self.rq2.pop_front() {
            let isect = scene
                .intersect(block, ray.origin(), ray.direction())
                .unwrap_or_else(Intersection::miss);
            let idx = self.arena.alloc_out(isect);
            self.frq2.push_back(CachedItem {
                domain_id: id,
                ray,
                isect: idx,
            });
        }
    }

    /// Resolve filtered shadow rays against the reconciled previous depth:
    /// locally occluded rays mark the obuf, survivors are parked for
    /// retirement and re-queued for every other domain they overlap.
    ///
    /// * `scene` - The scene.
    /// * `vbuf`  - The visibility buffer.
    pub fn proc_fsq2(&mut self, scene: &Scene, vbuf: &VBuf) {
        while let Some(item) = self.fsq2.pop_front() {
            let ray = item.ray;
            if vbuf.correct(ray.samid, ray.t) {
                if ray.occluded != 0 {
                    vbuf.set_obuf(ray.samid, ray.light);
                } else {
                    self.retire_q.push_back(ray);
                    self.isector
                        .intersect_excluding(item.domain_id, scene, &ray, &mut self.sqs);
                }
            }
        }
    }

    /// Resolve filtered radiance rays: a speculative local hit is cached for
    /// replay and only nearer domains are re-queued; a local miss re-queues
    /// every other overlapped domain.
    ///
    /// * `scene` - The scene.
    /// * `vbuf`  - The visibility buffer.
    pub fn proc_frq2(&mut self, scene: &Scene, vbuf: &VBuf) {
        while let Some(item) = self.frq2.pop_front() {
            if vbuf.correct(item.ray.samid, item.ray.t) {
                let t = self.arena.out(item.isect).t;
                if t.is_finite() {
                    self.isector
                        .intersect_below(item.domain_id, t, scene, &item.ray, &mut self.rqs);
                    self.cached_rq.push_back(item);
                } else {
                    self.isector
                        .intersect_excluding(item.domain_id, scene, &item.ray, &mut self.rqs);
                }
            }
        }
    }

    /// Fold last depth's speculative hits into the fresh output t-buffer.
    ///
    /// * `vbuf` - The visibility buffer.
    pub fn update_tbuf_with_cached(&mut self, vbuf: &VBuf) {
        while let Some(item) = self.cached_rq.pop_front() {
            let t = self.arena.input(item.isect).t;
            if vbuf.update_tbuf_out(item.ray.samid, t, self.rank, item.domain_id) {
                self.reduced_cached_rq.push_back(item);
            }
        }
    }

    /// Shade the replayed speculative hits that are still authoritative.
    ///
    /// * `shader`    - The shader bridge.
    /// * `scene`     - The scene.
    /// * `ray_depth` - Current bounce depth.
    /// * `vbuf`      - The visibility buffer.
    pub fn process_cached(
        &mut self,
        shader: &dyn Shader,
        scene: &Scene,
        ray_depth: i32,
        vbuf: &VBuf,
    ) -> Result<()> {
        while let Some(item) = self.reduced_cached_rq.pop_front() {
            let isect = *self.arena.input(item.isect);
            if vbuf.equal_to_tbuf_out(item.ray.samid, isect.t, self.rank, item.domain_id) {
                let block = scene.load_pinned(item.domain_id)?;
                shader.shade(
                    item.domain_id,
                    &item.ray,
                    &isect,
                    &mut self.sq2,
                    &mut self.rq2,
                    &mut self.pending_q,
                    ray_depth,
                );
                self.filter_sq2(item.domain_id, block, scene);
                self.filter_rq2(item.domain_id, block, scene);
                scene.unpin(block);
            }
        }
        Ok(())
    }

    /// Deposit retired shadow rays that stayed unoccluded.
    ///
    /// * `image`             - The accumulation image.
    /// * `num_pixel_samples` - Samples per pixel.
    /// * `vbuf`              - The visibility buffer.
    pub fn proc_retire_q(&mut self, image: &HdrImage, num_pixel_samples: usize, vbuf: &VBuf) {
        let scale = 1.0 / num_pixel_samples as Float;
        while let Some(ray) = self.retire_q.pop_front() {
            if !vbuf.occluded(ray.samid, ray.light) {
                image.add(ray.pixid as usize, ray.weight(), scale);
            }
        }
    }

    /// Deposit the background color for eye rays that missed every domain.
    ///
    /// * `image`             - The accumulation image.
    /// * `num_pixel_samples` - Samples per pixel.
    /// * `color`             - Background color.
    pub fn drain_background(&mut self, image: &HdrImage, num_pixel_samples: usize, color: Vec3) {
        let scale = 1.0 / num_pixel_samples as Float;
        while let Some(ray) = self.background_q.pop_front() {
            image.add(ray.pixid as usize, ray.weight() * color, scale);
        }
    }

    /// Flag one block per nonempty radiance queue.
    pub fn populate_rad_work_stats(&mut self) {
        self.work_stats.reset();
        for id in 0..self.num_domains {
            if !self.rqs.is_empty(id) {
                self.work_stats.set_rad_block(id);
            }
        }
    }

    /// Flag all outstanding blocks for the next depth.
    pub fn populate_work_stats(&mut self) {
        self.work_stats.reset();
        if !self.cached_rq.is_empty() {
            self.work_stats.set_cached_block();
        }
        for id in 0..self.num_domains {
            if !self.rqs.is_empty(id) {
                self.work_stats.set_rad_block(id);
            }
            if !self.sqs.is_empty(id) {
                self.work_stats.set_shad_block(id);
            }
        }
    }

    /// Move one domain queue into a slice of an outgoing message.
    ///
    /// * `shadow` - True for the shadow queue.
    /// * `id`     - Domain id.
    /// * `out`    - Destination slots, sized by the team scan.
    pub fn send_rays(&mut self, shadow: bool, id: usize, out: &mut [Ray]) {
        let q = if shadow {
            self.sqs.q(id)
        } else {
            self.rqs.q(id)
        };
        let mut target = 0;
        while let Some(ray) = q.pop_front() {
            out[target] = ray;
            target += 1;
        }
        debug_assert_eq!(target, out.len());
    }

    /// Swap arena generations at the end of a depth.
    pub fn swap_arenas(&mut self) {
        self.arena.reset_and_swap();
    }

    /// Domains with speculative hits awaiting replay, one entry per item.
    pub fn cached_domains(&self) -> impl Iterator<Item = usize> + '_ {
        self.cached_rq.iter().map(|item| item.domain_id)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::descriptor::parse_descriptor;
    use crate::shader::{Shader, ShaderPt};
    use std::path::Path;

    fn lit_two_domain_scene() -> Scene {
        // domain 0: target sphere; domain 1: a sphere far off the light path
        let text = "\
domain
sphere 0 0 -3 0.5 matte 0.8 0.8 0.8
domain
sphere 5 0 -3 0.5 matte 0.8 0.8 0.8
light point 0 10 10 400 400 400
";
        let desc = parse_descriptor(text, Path::new("")).unwrap();
        Scene::from_desc(desc, -1, 1).unwrap()
    }

    fn pipeline_one_depth(
        tc: &mut TContext,
        scene: &Scene,
        shader: &dyn Shader,
        vbuf: &VBuf,
        id: usize,
    ) {
        let block = scene.load(id).unwrap();
        tc.process_rays(id, block, scene, vbuf);
        tc.update_vbuf(vbuf);
        tc.gen_rays(shader, scene, block, 0, vbuf);
        vbuf.reset_tbuf_in();
        vbuf.swap_tbufs();
        tc.proc_fsq2(scene, vbuf);
        tc.proc_frq2(scene, vbuf);
    }

    #[test]
    fn eye_ray_shades_and_emits_shadow_work() {
        let scene = lit_two_domain_scene();
        let shader = ShaderPt::new(&scene, 2, 1, Vec3::ZERO, 40.0, false);
        let vbuf = VBuf::new(4, shader.num_light_samples());
        let mut tc = TContext::new(0, 0, scene.num_domains(), 1);

        let eye = Ray::eye(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 0, 0);
        tc.rqs.push(0, eye);
        pipeline_one_depth(&mut tc, &scene, &shader, &vbuf, 0);

        // the shadow ray toward the light survived its own domain and was
        // parked for retirement; the occluder domain is not on its path
        assert_eq!(tc.retire_q.len(), 1);
        // next depth: nothing re-queued for domain 1 (light path misses it)
        assert!(tc.sqs.is_empty(1));
    }

    #[test]
    fn cross_domain_shadow_requeues_to_occluder() {
        // an occluder sitting on the light path of the target hit
        let text = "\
domain
sphere 0 0 -3 0.5 matte 0.8 0.8 0.8
domain
sphere 0 1.9 -0.1 1.0 matte 0.8 0.8 0.8
light point 0 10 10 400 400 400
";
        let desc = parse_descriptor(text, Path::new("")).unwrap();
        let scene = Scene::from_desc(desc, -1, 1).unwrap();
        let shader = ShaderPt::new(&scene, 2, 1, Vec3::ZERO, 40.0, false);
        let vbuf = VBuf::new(4, shader.num_light_samples());
        let mut tc = TContext::new(0, 0, scene.num_domains(), 1);

        tc.rqs.push(0, Ray::eye(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 0, 0));
        pipeline_one_depth(&mut tc, &scene, &shader, &vbuf, 0);

        // the shadow ray must now be queued for the occluder's domain
        assert_eq!(tc.sqs.size(1), 1);
        assert_eq!(tc.retire_q.len(), 1);

        // process the occluder domain at the next depth
        let block = scene.load(1).unwrap();
        tc.process_rays(1, block, &scene, &vbuf);
        tc.update_vbuf(&vbuf);

        // the obuf now blocks the retirement deposit
        let image = HdrImage::new(1, 1);
        tc.proc_retire_q(&image, 1, &vbuf);
        assert_eq!(image.pixel(0), Vec3::ZERO);
    }

    #[test]
    fn beaten_candidate_is_suppressed() {
        let scene = lit_two_domain_scene();
        let shader = ShaderPt::new(&scene, 2, 1, Vec3::ZERO, 40.0, false);
        let vbuf = VBuf::new(4, shader.num_light_samples());
        let mut tc = TContext::new(0, 0, scene.num_domains(), 1);

        // a nearer hit from elsewhere already owns the sample
        vbuf.update_tbuf_out(0, 0.25, 0, 1);

        tc.rqs.push(0, Ray::eye(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 0, 0));
        let block = scene.load(0).unwrap();
        tc.process_rays(0, block, &scene, &vbuf);
        tc.update_vbuf(&vbuf);
        tc.gen_rays(&shader, &scene, block, 0, &vbuf);

        // losing the atomic minimum suppressed the shader call
        assert!(tc.fsq2.is_empty());
        assert!(tc.frq2.is_empty());
    }

    #[test]
    fn stale_speculative_work_is_discarded() {
        let scene = lit_two_domain_scene();
        let shader = ShaderPt::new(&scene, 3, 1, Vec3::ZERO, 40.0, false);
        let vbuf = VBuf::new(4, shader.num_light_samples());
        let mut tc = TContext::new(0, 0, scene.num_domains(), 1);

        tc.rqs.push(0, Ray::eye(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 0, 0));
        let block = scene.load(0).unwrap();
        tc.process_rays(0, block, &scene, &vbuf);
        tc.update_vbuf(&vbuf);
        tc.gen_rays(&shader, &scene, block, 0, &vbuf);

        // another rank reports a closer surface before resolution
        vbuf.update_tbuf_out(0, 0.25, 1, 0);
        vbuf.reset_tbuf_in();
        vbuf.swap_tbufs();
        tc.proc_fsq2(&scene, &vbuf);
        tc.proc_frq2(&scene, &vbuf);
        assert!(tc.retire_q.is_empty());
        assert!(tc.cached_rq.is_empty());
    }
}
