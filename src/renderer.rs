//! Frame loop and output.

use crate::app::{Options, PartitionMode, ShaderMode};
use crate::camera::Camera;
use crate::cluster::Cluster;
use crate::error::Result;
use crate::image::HdrImage;
use crate::insitu::MultiThreadTracer;
use crate::ooc::OocTracer;
use crate::scene::Scene;
use crate::shader::{Shader, ShaderAo, ShaderPt};
use glam::Vec3;
use std::path::Path;

/// Anything that can trace one frame to convergence.
trait FrameTracer {
    fn trace_frame(&self, cluster: &Cluster) -> Result<()>;
}

impl<S: Shader> FrameTracer for MultiThreadTracer<'_, S> {
    fn trace_frame(&self, cluster: &Cluster) -> Result<()> {
        self.trace(cluster)
    }
}

impl<S: Shader> FrameTracer for OocTracer<'_, S> {
    fn trace_frame(&self, cluster: &Cluster) -> Result<()> {
        self.trace(cluster)
    }
}

/// Owns the scene, camera and image for a run and drives the configured
/// tracer over the frame loop. The template product of the original entry
/// points (partition × shader × cache) is selected here from runtime tags;
/// the tracers stay generic over the shader so the hot loops are still
/// monomorphic.
pub struct Renderer {
    cfg: Options,
    scene: Scene,
    camera: Camera,
    image: HdrImage,
}

impl Renderer {
    /// Load the scene and set up the frame state.
    ///
    /// * `cfg`     - Application options.
    /// * `cluster` - The process context.
    pub fn init(cfg: Options, cluster: &Cluster) -> Result<Renderer> {
        cfg.validate()?;

        let scene = Scene::init(
            Path::new(&cfg.model),
            Path::new(&cfg.ply_path),
            cfg.cache_size,
            cluster.size() as usize,
        )?;
        info!("scene init done: {} domains", scene.num_domains());

        let camera = match cfg.camera_config() {
            Some((pos, lookat, up)) => Camera::new(pos, lookat, up, cfg.fov, cfg.width, cfg.height),
            None => Camera::auto_frame(scene.bound(), cfg.fov, cfg.width, cfg.height),
        };

        let image = HdrImage::new(cfg.width as usize, cfg.height as usize);

        Ok(Renderer {
            cfg,
            scene,
            camera,
            image,
        })
    }

    /// Render the configured number of frames and write the image from
    /// rank 0.
    ///
    /// * `cluster` - The process context.
    pub fn run(&self, cluster: &Cluster) -> Result<()> {
        let cfg = &self.cfg;
        let bounces = cfg.bounces as i32;
        let ao_samples = cfg.ao_samples as i32;

        let tracer: Box<dyn FrameTracer + '_> = match (cfg.partition, cfg.shader) {
            (PartitionMode::Insitu, ShaderMode::Pt) => Box::new(MultiThreadTracer::new(
                cfg,
                cluster,
                &self.scene,
                &self.camera,
                &self.image,
                ShaderPt::new(&self.scene, bounces, ao_samples, cfg.ks_vec(), cfg.shininess, false),
            )?),
            (PartitionMode::Insitu, ShaderMode::Ao) => Box::new(MultiThreadTracer::new(
                cfg,
                cluster,
                &self.scene,
                &self.camera,
                &self.image,
                ShaderAo::new(&self.scene, bounces, ao_samples, false),
            )?),
            (PartitionMode::Image, ShaderMode::Pt) => Box::new(OocTracer::new(
                cfg,
                cluster,
                &self.scene,
                &self.camera,
                &self.image,
                ShaderPt::new(&self.scene, bounces, ao_samples, cfg.ks_vec(), cfg.shininess, true),
            )?),
            (PartitionMode::Image, ShaderMode::Ao) => Box::new(OocTracer::new(
                cfg,
                cluster,
                &self.scene,
                &self.camera,
                &self.image,
                ShaderAo::new(&self.scene, bounces, ao_samples, true),
            )?),
        };

        for frame in 0..self.cfg.nframes {
            debug!("frame {frame}");
            self.image.clear();
            tracer.trace_frame(cluster)?;
            self.image.composite(cluster);
        }

        if cluster.is_root() {
            self.image.write_ppm(&self.cfg.output)?;
            info!("wrote {}", self.cfg.output);
        }
        Ok(())
    }

    /// Read back one pixel of the last frame.
    ///
    /// * `pixid` - Pixel index.
    pub fn pixel(&self, pixid: usize) -> Vec3 {
        self.image.pixel(pixid)
    }
}
