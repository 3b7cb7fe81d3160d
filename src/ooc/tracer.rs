//! Out-of-core frame orchestrator.

use crate::app::Options;
use crate::camera::Camera;
use crate::cluster::{Cluster, Funneled};
use crate::common::Float;
use crate::error::{fatal, Error, Result};
use crate::image::HdrImage;
use crate::ooc::domain_stats::DomainStats;
use crate::rays::Ray;
use crate::rng::Rng;
use crate::scene::Scene;
use crate::shader::Shader;
use crate::tcontext::TContext;
use crate::tile::{assign_tiles, Tile};
use crate::vbuf::VBuf;
use glam::Vec3;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};

/// Color deposited by rays that miss every domain.
const BACKGROUND: Vec3 = Vec3::ZERO;

/// State owned by the master thread between barriers.
struct SharedState {
    stats: DomainStats,
    schedule: Vec<usize>,
    cur_block: usize,
}

/// Everything the worker team shares for one frame.
struct Team<'a> {
    barrier: Barrier,
    shared: Mutex<SharedState>,
    done: AtomicBool,
    any_active: AtomicUsize,
    funneled: Funneled<'a>,
}

/// Drives one frame in out-of-core mode: every rank owns an image stripe and
/// may process any domain by paging its geometry through the bounded cache.
/// Rays never cross ranks; the collectives are the per-depth domain-stats
/// sum, the shared visibility-buffer composites, and the quiescence test on
/// the global ray count.
pub struct OocTracer<'a, S: Shader> {
    scene: &'a Scene,
    camera: &'a Camera,
    image: &'a HdrImage,
    shader: S,
    vbuf: VBuf,
    rank: i32,
    num_ranks: i32,
    num_threads: usize,
    num_pixel_samples: usize,
    num_bounces: i32,
    image_w: usize,
    mytiles: Vec<Tile>,
}

impl<'a, S: Shader> OocTracer<'a, S> {
    /// Set up the tracer for a frame sequence.
    ///
    /// * `cfg`     - Application options.
    /// * `cluster` - The process context.
    /// * `scene`   - The scene.
    /// * `camera`  - The camera.
    /// * `image`   - The accumulation image.
    /// * `shader`  - The shader bridge.
    pub fn new(
        cfg: &Options,
        cluster: &Cluster,
        scene: &'a Scene,
        camera: &'a Camera,
        image: &'a HdrImage,
        shader: S,
    ) -> Result<Self> {
        let image_w = cfg.width as usize;
        let image_h = cfg.height as usize;
        let spp = cfg.pixel_samples as usize;

        let mytiles = assign_tiles(cfg, cluster.size(), cluster.rank());

        let rank_samples: i64 = mytiles.iter().map(|t| t.area() * spp as i64).sum();
        if rank_samples > cfg.max_samples_per_rank {
            return Err(Error::Config(format!(
                "rank {} owns {rank_samples} samples, above the {} budget",
                cluster.rank(),
                cfg.max_samples_per_rank
            )));
        }

        let num_samples = image_w * image_h * spp;
        let vbuf = VBuf::new(num_samples, shader.num_light_samples());

        Ok(Self {
            scene,
            camera,
            image,
            shader,
            vbuf,
            rank: cluster.rank(),
            num_ranks: cluster.size(),
            num_threads: cfg.threads(),
            num_pixel_samples: spp,
            num_bounces: cfg.bounces as i32,
            image_w,
            mytiles,
        })
    }

    /// Trace one frame to global convergence.
    ///
    /// * `cluster` - The process context; its communicator is only touched
    ///               from the master thread.
    pub fn trace(&self, cluster: &Cluster) -> Result<()> {
        self.vbuf.reset_tbuf_in();
        self.vbuf.reset_tbuf_out();
        self.vbuf.reset_obuf();

        let nthreads = self.num_threads.max(1);
        let team = Team {
            barrier: Barrier::new(nthreads),
            shared: Mutex::new(SharedState {
                stats: DomainStats::new(self.scene.num_domains()),
                schedule: Vec::new(),
                cur_block: 0,
            }),
            done: AtomicBool::new(false),
            any_active: AtomicUsize::new(0),
            funneled: Funneled::new(cluster),
        };

        let tracer = &*self;
        let team_ref = &team;
        crossbeam::scope(|scope| {
            for tid in 1..nthreads {
                scope.spawn(move |_| tracer.worker(tid, team_ref));
            }
            tracer.worker(0, team_ref);
        })
        .map_err(|_| Error::Assertion("worker thread panicked".to_string()))?;

        Ok(())
    }

    /// One worker's frame. Thread 0 is the team master: it runs the
    /// collectives and the cache scheduler between barriers.
    fn worker(&self, tid: usize, team: &Team) {
        let scene = self.scene;
        let spp = self.num_pixel_samples;
        let nranks = self.num_ranks;

        let mut tc = TContext::new(tid, self.rank, scene.num_domains(), nranks as usize);

        self.gen_eye_rays(tid, &mut tc);
        tc.drain_background(self.image, spp, BACKGROUND);

        let mut ray_depth: i32 = 0;
        loop {
            // release continuations whose history window expired
            while let Some(ray) = tc.pending_q.pop_front() {
                tc.isector.intersect(scene, &ray, &mut tc.rqs);
            }

            self.merge_domain_stats(tid, team, &tc);

            if tid == 0 {
                let mut g = team.shared.lock().expect("shared state poisoned");
                g.stats.reduce(team.funneled.master());
                if g.stats.total() == 0 {
                    team.done.store(true, Ordering::SeqCst);
                } else {
                    g.schedule = g.stats.schedule().to_vec();
                }
            }
            team.barrier.wait();
            if team.done.load(Ordering::SeqCst) {
                break;
            }

            // replay speculative hits that survived reconciliation
            tc.update_tbuf_with_cached(&self.vbuf);
            team.barrier.wait();
            if let Err(e) = tc.process_cached(&self.shader, scene, ray_depth, &self.vbuf) {
                fatal(&e);
            }
            team.barrier.wait();

            self.proc_scheduled_domains(tid, team, &mut tc, ray_depth);

            // reconcile the shared visibility buffer across ranks: hits must
            // survive this before their speculative work may stand
            if tid == 0 {
                let cluster = team.funneled.master();
                if ray_depth < self.num_bounces && nranks > 1 {
                    self.vbuf.composite_tbuf(cluster);
                }
                if ray_depth > 0 && nranks > 1 {
                    self.vbuf.composite_obuf(cluster);
                }
            }
            team.barrier.wait();

            if ray_depth > 0 {
                tc.proc_retire_q(self.image, spp, &self.vbuf);
            }
            team.barrier.wait();

            if tid == 0 {
                self.vbuf.reset_obuf();
                self.vbuf.reset_tbuf_in();
                self.vbuf.swap_tbufs();
            }
            team.barrier.wait();

            tc.proc_fsq2(scene, &self.vbuf);
            tc.proc_frq2(scene, &self.vbuf);
            team.barrier.wait();

            tc.swap_arenas();
            ray_depth += 1;
        }

        tc.proc_retire_q(self.image, spp, &self.vbuf);
    }

    /// Generate this thread's share of the rank's eye rays.
    fn gen_eye_rays(&self, tid: usize, tc: &mut TContext) {
        let spp = self.num_pixel_samples;
        let campos = self.camera.position();
        let nthreads = self.num_threads.max(1);

        for tile in &self.mytiles {
            let total = tile.area() as usize * spp;
            let mut idx = tid;
            while idx < total {
                let pix = idx / spp;
                let s = idx % spp;
                let x = tile.x + (pix % tile.w as usize) as i32;
                let y = tile.y + (pix / tile.w as usize) as i32;
                let pixid = y as usize * self.image_w + x as usize;
                let samid = (pixid * spp + s) as i32;

                let (fx, fy) = if spp > 1 {
                    let mut sampler = Rng::new(samid as u64);
                    (
                        x as Float + sampler.uniform_float(),
                        y as Float + sampler.uniform_float(),
                    )
                } else {
                    (x as Float + 0.5, y as Float + 0.5)
                };

                let dir = self.camera.generate_ray(fx, fy);
                let ray = Ray::eye(campos, dir, pixid as i32, samid);
                tc.isector.intersect_with_background(
                    self.scene,
                    &ray,
                    &mut tc.rqs,
                    &mut tc.background_q,
                );

                idx += nthreads;
            }
        }
    }

    /// Publish this thread's queued ray counts and merge across the team.
    fn merge_domain_stats(&self, tid: usize, team: &Team, tc: &TContext) {
        let mut local = DomainStats::new(self.scene.num_domains());
        for id in 0..self.scene.num_domains() {
            for ray in tc.rqs.iter(id) {
                local.add(id, ray.depth, 1);
            }
            for ray in tc.sqs.iter(id) {
                local.add(id, ray.depth, 1);
            }
        }
        // speculative replays keep their domain hot and the frame alive
        for id in tc.cached_domains() {
            local.add(id, 0, 1);
        }

        team.barrier.wait();
        if tid == 0 {
            team.shared.lock().expect("shared state poisoned").stats.reset();
        }
        team.barrier.wait();
        team.shared
            .lock()
            .expect("shared state poisoned")
            .stats
            .merge(&local);
        team.barrier.wait();
    }

    /// Walk the global schedule, paging each domain with queued rays into a
    /// pinned cache block and processing it like the in-situ local phase.
    fn proc_scheduled_domains(&self, tid: usize, team: &Team, tc: &mut TContext, ray_depth: i32) {
        let schedule = team
            .shared
            .lock()
            .expect("shared state poisoned")
            .schedule
            .clone();

        for id in schedule {
            if tid == 0 {
                team.any_active.store(0, Ordering::SeqCst);
            }
            team.barrier.wait();
            if !tc.is_local_qs_empty(id) {
                team.any_active.fetch_add(1, Ordering::SeqCst);
            }
            team.barrier.wait();

            if team.any_active.load(Ordering::SeqCst) > 0 {
                if tid == 0 {
                    let block = self.scene.load_pinned(id).unwrap_or_else(|e| fatal(&e));
                    team.shared.lock().expect("shared state poisoned").cur_block = block;
                }
                team.barrier.wait();
                let block = team.shared.lock().expect("shared state poisoned").cur_block;

                tc.process_rays(id, block, self.scene, &self.vbuf);
                team.barrier.wait();
                tc.update_vbuf(&self.vbuf);
                team.barrier.wait();
                tc.gen_rays(&self.shader, self.scene, block, ray_depth, &self.vbuf);
                team.barrier.wait();
                if tid == 0 {
                    self.scene.unpin(block);
                }
            }
            team.barrier.wait();
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
    use crate::shader::ShaderPt;
    use clap::Parser;
    use std::path::Path;

    fn options(args: &[&str]) -> Options {
        let mut full = vec!["distray", "scene.txt", "--partition", "image"];
        full.extend_from_slice(args);
        Options::parse_from(full)
    }

    fn render_once(cfg: &Options, scene: &Scene, camera: &Camera) -> Vec<Vec3> {
        let cluster = Cluster::single();
        let image = HdrImage::new(cfg.width as usize, cfg.height as usize);
        let shader = ShaderPt::new(
            scene,
            cfg.bounces as i32,
            cfg.ao_samples as i32,
            Vec3::ZERO,
            cfg.shininess,
            true,
        );
        let tracer = OocTracer::new(cfg, &cluster, scene, camera, &image, shader).unwrap();
        tracer.trace(&cluster).unwrap();
        (0..(cfg.width * cfg.height) as usize)
            .map(|p| image.pixel(p))
            .collect()
    }

    fn stacked_scene(cache_size: i64) -> Scene {
        // three opaque spheres stacked along the view axis; only the nearest
        // may shade
        let text = "\
domain
sphere 0 0 -3 0.5 matte 0.9 0.1 0.1
domain
sphere 0 0 -6 0.5 matte 0.1 0.9 0.1
domain
sphere 0 0 -9 0.5 matte 0.1 0.1 0.9
light point 0 4 4 200 200 200
";
        let desc = parse_descriptor(text, Path::new("")).unwrap();
        Scene::from_desc(desc, cache_size, 1).unwrap()
    }

    #[test]
    fn cache_of_one_still_shades_only_the_nearest_surface() {
        let cfg = options(&["--width", "1", "--height", "1", "--bounces", "1", "--cache-size", "1"]);
        let camera = Camera::new(Vec3::ZERO, Vec3::new(0.0, 0.0, -3.0), Vec3::Y, 45.0, 1, 1);
        let px = render_once(&cfg, &stacked_scene(1), &camera)[0];
        // red-dominant: the nearest sphere won the visibility buffer
        assert!(px.x > 0.0, "nearest surface did not shade: {px:?}");
        assert!(px.x > px.y * 3.0 && px.x > px.z * 3.0, "farther surfaces leaked: {px:?}");
    }

    #[test]
    fn infinite_cache_matches_bounded_cache() {
        let cfg_inf = options(&["--width", "2", "--height", "2", "--bounces", "2"]);
        let cfg_one = options(&["--width", "2", "--height", "2", "--bounces", "2", "--cache-size", "1"]);
        let camera = Camera::new(Vec3::ZERO, Vec3::new(0.0, 0.0, -3.0), Vec3::Y, 30.0, 2, 2);
        let a = render_once(&cfg_inf, &stacked_scene(-1), &camera);
        let b = render_once(&cfg_one, &stacked_scene(1), &camera);
        for (pa, pb) in a.iter().zip(&b) {
            assert!((*pa - *pb).abs().max_element() < 1e-5, "{pa:?} vs {pb:?}");
        }
    }

    #[test]
    fn empty_ooc_frame_terminates_immediately() {
        let cfg = options(&["--width", "2", "--height", "1", "--bounces", "1"]);
        let camera = Camera::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 3.0), Vec3::Y, 45.0, 2, 1);
        let px = render_once(&cfg, &stacked_scene(-1), &camera);
        assert!(px.iter().all(|p| *p == Vec3::ZERO));
    }
}
