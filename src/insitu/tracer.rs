//! In-situ frame orchestrator.

use crate::app::Options;
use crate::camera::Camera;
use crate::cluster::{Cluster, Funneled};
use crate::common::{Float, MsgWord};
use crate::error::{fatal, Error, Result};
use crate::image::HdrImage;
use crate::insitu::comm::{Comm, SendItem, SEND_RADIANCE_RAYS, SEND_SHADOW_RAYS};
use crate::rays::{decode_rays, encode_rays, Ray};
use crate::rng::Rng;
use crate::scan::InclusiveScan;
use crate::scene::Scene;
use crate::shader::Shader;
use crate::tcontext::TContext;
use crate::tile::{assign_tiles, Tile};
use crate::vbuf::VBuf;
use crate::work_stats::WorkStats;
use glam::Vec3;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};

/// Color deposited by rays that miss every domain.
const BACKGROUND: Vec3 = Vec3::ZERO;

/// State owned by the master thread between barriers.
struct SharedState {
    comm: Comm,
    recv_rq: VecDeque<Vec<MsgWord>>,
    recv_sq: VecDeque<Vec<MsgWord>>,
    work_stats: WorkStats,
    scan: InclusiveScan,
    send_buf: Vec<Ray>,
    cur_block: usize,
}

/// Received rays assigned to one worker, grouped by domain.
#[derive(Default)]
struct RecvBin {
    rad: BTreeMap<usize, Vec<Ray>>,
    shad: BTreeMap<usize, Vec<Ray>>,
}

/// Everything the worker team shares for one frame.
struct Team<'a> {
    barrier: Barrier,
    shared: Mutex<SharedState>,
    done: AtomicBool,
    any_active: AtomicUsize,
    recv_bins: Vec<Mutex<RecvBin>>,
    funneled: Funneled<'a>,
}

/// Drives one frame of the in-situ pipeline: eye generation, the per-depth
/// send / local / receive / composite / resolve phases, and distributed
/// termination. The single-thread variant is the same machine with a team of
/// one, where every barrier degenerates.
pub struct MultiThreadTracer<'a, S: Shader> {
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

impl<'a, S: Shader> MultiThreadTracer<'a, S> {
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
        let scene_domains = self.scene.num_domains();
        let team = Team {
            barrier: Barrier::new(nthreads),
            shared: Mutex::new(SharedState {
                comm: Comm::new(),
                recv_rq: VecDeque::new(),
                recv_sq: VecDeque::new(),
                work_stats: WorkStats::new(scene_domains, self.num_ranks as usize),
                scan: InclusiveScan::new(nthreads),
                send_buf: Vec::new(),
                cur_block: 0,
            }),
            done: AtomicBool::new(false),
            any_active: AtomicUsize::new(0),
            recv_bins: (0..nthreads).map(|_| Mutex::new(RecvBin::default())).collect(),
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

    /// One worker's frame. Thread 0 is the team master and performs all MPI
    /// calls inside its critical sections.
    fn worker(&self, tid: usize, team: &Team) {
        let scene = self.scene;
        let partition = scene.partition();
        let nranks = self.num_ranks;
        let spp = self.num_pixel_samples;

        let mut tc = TContext::new(
            tid,
            self.rank,
            scene.num_domains(),
            nranks as usize,
        );

        self.gen_eye_rays(tid, &mut tc);
        tc.drain_background(self.image, spp, BACKGROUND);

        tc.populate_rad_work_stats();
        self.merge_work_stats(tid, team, &tc);

        let mut ray_depth: i32 = 0;
        loop {
            team.barrier.wait();
            if tid == 0 {
                let mut g = team.shared.lock().expect("shared state poisoned");
                g.work_stats.update_reduce_buffer(partition, self.rank);
                g.work_stats.reduce(team.funneled.master());
                if g.work_stats.all_done() {
                    g.comm.wait_for_send();
                    team.done.store(true, Ordering::SeqCst);
                }
            }
            team.barrier.wait();
            if team.done.load(Ordering::SeqCst) {
                break;
            }

            debug_assert!(ray_depth < self.num_bounces + 1, "ray depth {ray_depth} ran past the bounce budget");

            // forward foreign queues, then drain the wire
            if nranks > 1 {
                self.send_phase(tid, team, &mut tc);
                if tid == 0 {
                    let mut g = team.shared.lock().expect("shared state poisoned");
                    let SharedState {
                        comm,
                        recv_rq,
                        recv_sq,
                        work_stats,
                        ..
                    } = &mut *g;
                    comm.wait_for_send();
                    if let Err(e) = comm.run(team.funneled.master(), work_stats, recv_rq, recv_sq) {
                        fatal(&e);
                    }
                    self.assign_recv_rays_to_threads(team, recv_rq, recv_sq);
                }
                team.barrier.wait();
            }

            // replay speculative hits that survived reconciliation
            tc.update_tbuf_with_cached(&self.vbuf);
            team.barrier.wait();
            if let Err(e) = tc.process_cached(&self.shader, scene, ray_depth, &self.vbuf) {
                fatal(&e);
            }
            team.barrier.wait();

            self.proc_local_qs(tid, team, &mut tc, ray_depth);

            if nranks > 1 {
                self.proc_recv_qs(tid, team, &mut tc, ray_depth);
            }

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

            // resolve speculative shadow and radiance work against the
            // reconciled values; survivors re-enter the queues
            tc.proc_fsq2(scene, &self.vbuf);
            tc.proc_frq2(scene, &self.vbuf);
            team.barrier.wait();

            tc.populate_work_stats();
            self.merge_work_stats(tid, team, &tc);

            tc.swap_arenas();
            ray_depth += 1;
        }

        // retire whatever the final depth parked: the queued cross-domain
        // tests were empty, so the local occlusion verdict is final
        tc.proc_retire_q(self.image, spp, &self.vbuf);
    }

    /// Generate this thread's share of the rank's eye rays and queue them by
    /// overlapped domain.
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

    /// Merge per-thread work stats into the shared counters.
    fn merge_work_stats(&self, tid: usize, team: &Team, tc: &TContext) {
        team.barrier.wait();
        if tid == 0 {
            team.shared
                .lock()
                .expect("shared state poisoned")
                .work_stats
                .reset();
        }
        team.barrier.wait();
        team.shared
            .lock()
            .expect("shared state poisoned")
            .work_stats
            .merge(&tc.work_stats);
        team.barrier.wait();
    }

    /// Assemble one contiguous message per (domain, kind) bound for a
    /// foreign rank: threads publish counts, the master scans, each thread
    /// copies its shard at its scanned offset.
    fn send_phase(&self, tid: usize, team: &Team, tc: &mut TContext) {
        let partition = self.scene.partition();
        for id in 0..self.scene.num_domains() {
            let dest = partition.rank(id);
            if dest == self.rank {
                continue;
            }
            for shadow in [false, true] {
                let n = if shadow { tc.sqs.size(id) } else { tc.rqs.size(id) };
                team.shared.lock().expect("shared state poisoned").scan.set(tid, n);
                team.barrier.wait();

                if tid == 0 {
                    let mut g = team.shared.lock().expect("shared state poisoned");
                    g.scan.scan();
                    let sum = g.scan.sum();
                    g.send_buf.clear();
                    g.send_buf.resize(sum, Ray::default());
                }
                team.barrier.wait();

                let (sum, ofs) = {
                    let g = team.shared.lock().expect("shared state poisoned");
                    (g.scan.sum(), g.scan.get(tid))
                };
                if sum > 0 && n > 0 {
                    let mut g = team.shared.lock().expect("shared state poisoned");
                    let start = ofs - n;
                    tc.send_rays(shadow, id, &mut g.send_buf[start..ofs]);
                }
                team.barrier.wait();

                if tid == 0 && sum > 0 {
                    let mut g = team.shared.lock().expect("shared state poisoned");
                    let words = encode_rays(id as i32, &g.send_buf);
                    let tag = if shadow { SEND_SHADOW_RAYS } else { SEND_RADIANCE_RAYS };
                    g.comm.push_send_q(SendItem { tag, dest, words });
                }
                team.barrier.wait();
            }
        }
    }

    /// Decode received messages and deal their rays round-robin onto the
    /// per-thread bins, grouped by destination domain.
    fn assign_recv_rays_to_threads(
        &self,
        team: &Team,
        recv_rq: &mut VecDeque<Vec<MsgWord>>,
        recv_sq: &mut VecDeque<Vec<MsgWord>>,
    ) {
        let nthreads = team.recv_bins.len();
        let mut dealt = 0usize;
        while let Some(words) = recv_rq.pop_front() {
            let (header, rays) = decode_rays(&words);
            for ray in rays {
                team.recv_bins[dealt % nthreads]
                    .lock()
                    .expect("receive bin poisoned")
                    .rad
                    .entry(header.domain_id as usize)
                    .or_default()
                    .push(ray);
                dealt += 1;
            }
        }
        dealt = 0;
        while let Some(words) = recv_sq.pop_front() {
            let (header, rays) = decode_rays(&words);
            for ray in rays {
                team.recv_bins[dealt % nthreads]
                    .lock()
                    .expect("receive bin poisoned")
                    .shad
                    .entry(header.domain_id as usize)
                    .or_default()
                    .push(ray);
                dealt += 1;
            }
        }
    }

    /// Process this rank's own domains: load (resident in-situ), intersect
    /// queued rays, reconcile, shade.
    fn proc_local_qs(&self, tid: usize, team: &Team, tc: &mut TContext, ray_depth: i32) {
        let partition = self.scene.partition();
        for &id in partition.domains(self.rank) {
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
                    let block = self.scene.load(id).unwrap_or_else(|e| fatal(&e));
                    team.shared.lock().expect("shared state poisoned").cur_block = block;
                }
                team.barrier.wait();
                let block = team.shared.lock().expect("shared state poisoned").cur_block;

                tc.process_rays(id, block, self.scene, &self.vbuf);
                team.barrier.wait();
                tc.update_vbuf(&self.vbuf);
                team.barrier.wait();
                tc.gen_rays(&self.shader, self.scene, block, ray_depth, &self.vbuf);
            }
            team.barrier.wait();
        }
    }

    /// Process rays received from other ranks, grouped by domain.
    fn proc_recv_qs(&self, tid: usize, team: &Team, tc: &mut TContext, ray_depth: i32) {
        let bin = std::mem::take(
            &mut *team.recv_bins[tid].lock().expect("receive bin poisoned"),
        );

        for (id, rays) in bin.rad {
            let block = self.scene.load(id).unwrap_or_else(|e| fatal(&e));
            for ray in rays {
                tc.isect_recv_rad(id, block, self.scene, ray);
            }
            tc.update_tbuf(&self.vbuf);
            tc.gen_rays(&self.shader, self.scene, block, ray_depth, &self.vbuf);
        }
        team.barrier.wait();

        for (id, rays) in bin.shad {
            let block = self.scene.load(id).unwrap_or_else(|e| fatal(&e));
            for ray in rays {
                tc.occl_recv_shad(id, block, self.scene, &self.vbuf, ray);
            }
            tc.update_obuf(&self.vbuf);
        }
        team.barrier.wait();
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
        let mut full = vec!["distray", "scene.txt"];
        full.extend_from_slice(args);
        Options::parse_from(full)
    }

    fn scene_from(text: &str) -> Scene {
        let desc = parse_descriptor(text, Path::new("")).unwrap();
        Scene::from_desc(desc, -1, 1).unwrap()
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
            false,
        );
        let tracer =
            MultiThreadTracer::new(cfg, &cluster, scene, camera, &image, shader).unwrap();
        tracer.trace(&cluster).unwrap();
        (0..(cfg.width * cfg.height) as usize)
            .map(|p| image.pixel(p))
            .collect()
    }

    #[test]
    fn lit_sphere_fills_its_pixel() {
        let cfg = options(&["--width", "1", "--height", "1", "--bounces", "1"]);
        let scene = scene_from(
            "domain\nsphere 0 0 -3 1 matte 0.8 0.8 0.8\nlight point 0 5 5 100 100 100\n",
        );
        let camera = Camera::new(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, -3.0), Vec3::Y, 60.0, 1, 1);
        let pixels = render_once(&cfg, &scene, &camera);
        assert!(pixels[0].max_element() > 0.0, "pixel stayed black: {:?}", pixels[0]);
    }

    #[test]
    fn empty_frame_terminates_black() {
        let cfg = options(&["--width", "2", "--height", "2", "--bounces", "1"]);
        let scene = scene_from("domain\nsphere 50 50 50 1 matte 0.8 0.8 0.8\nlight point 0 5 5 100 100 100\n");
        // camera looks away from the only domain
        let camera = Camera::new(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, 3.0), Vec3::Y, 60.0, 2, 2);
        let pixels = render_once(&cfg, &scene, &camera);
        assert!(pixels.iter().all(|p| *p == Vec3::ZERO));
    }

    #[test]
    fn cross_domain_shadowing_darkens_the_pixel() {
        // the occluder domain sits on the shadow path but off the eye path,
        // so the shadow ray must be re-queued for it and retired occluded
        let lit = scene_from(
            "domain\nsphere 0 0 -3 1 matte 0.8 0.8 0.8\nlight point 4 0 -1 200 200 200\n",
        );
        let blocked = scene_from(
            "domain\nsphere 0 0 -3 1 matte 0.8 0.8 0.8\n\
             domain\nsphere 2 0 -1.5 0.8 matte 0.8 0.8 0.8\n\
             light point 4 0 -1 200 200 200\n",
        );
        let cfg = options(&["--width", "1", "--height", "1", "--bounces", "1"]);
        let camera = Camera::new(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, -3.0), Vec3::Y, 60.0, 1, 1);
        let lit_px = render_once(&cfg, &lit, &camera)[0];
        let blocked_px = render_once(&cfg, &blocked, &camera)[0];
        assert!(lit_px.max_element() > 0.0);
        assert!(blocked_px.max_element() < lit_px.max_element() * 0.1,
                "occluded pixel {blocked_px:?} vs lit {lit_px:?}");
    }

    #[test]
    fn thread_count_does_not_change_the_image() {
        let text = "\
domain
sphere -0.7 0 -3 0.6 matte 0.9 0.5 0.3
domain
sphere 0.7 0 -3 0.6 matte 0.3 0.5 0.9
light point 0 4 2 60 60 60
";
        let camera = Camera::new(Vec3::new(0.0, 0.0, 1.0), Vec3::new(0.0, 0.0, -3.0), Vec3::Y, 70.0, 8, 8);
        let one = {
            let cfg = options(&["--width", "8", "--height", "8", "--bounces", "2", "--nthreads", "1"]);
            render_once(&cfg, &scene_from(text), &camera)
        };
        let four = {
            let cfg = options(&["--width", "8", "--height", "8", "--bounces", "2", "--nthreads", "4"]);
            render_once(&cfg, &scene_from(text), &camera)
        };
        for (a, b) in one.iter().zip(&four) {
            assert!((*a - *b).abs().max_element() < 1e-4, "{a:?} vs {b:?}");
        }
    }
}
