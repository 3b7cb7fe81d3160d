//! Application options.

use crate::common::Float;
use crate::error::{Error, Result};
use clap::{Parser, ValueEnum};
use glam::Vec3;

/// What the run produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ViewMode {
    /// Render frames and write the final image.
    Film,
    /// Interactive preview window.
    Glfw,
    /// Draw domain bounds.
    Domain,
    /// Draw partition bounds.
    Partition,
}

/// How domains are assigned to ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PartitionMode {
    /// Fixed domain-to-rank ownership; foreign rays are forwarded.
    Insitu,
    /// Image partition: every rank may process any domain (out-of-core).
    Image,
}

/// Shading estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ShaderMode {
    /// Direct lighting with path continuation.
    Pt,
    /// Ambient occlusion.
    Ao,
}

/// Command line options.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "distributed ray scheduling renderer", long_about = None)]
pub struct Options {
    /// Scene descriptor file.
    #[arg(value_name = "FILE")]
    pub model: String,

    /// Image width in pixels.
    #[arg(long, default_value_t = 512)]
    pub width: u32,

    /// Image height in pixels.
    #[arg(long, default_value_t = 512)]
    pub height: u32,

    /// Samples per pixel.
    #[arg(long = "pixel-samples", default_value_t = 1)]
    pub pixel_samples: u32,

    /// Samples per area light (and ambient-occlusion probes per hit).
    #[arg(long = "ao-samples", default_value_t = 8)]
    pub ao_samples: u32,

    /// Bounce budget per path.
    #[arg(long, default_value_t = 2)]
    pub bounces: u32,

    /// Number of frames to render.
    #[arg(long, default_value_t = 1)]
    pub nframes: u32,

    /// Camera position (x y z); omit for auto framing.
    #[arg(long, value_name = "FLOAT", num_args = 3, allow_negative_numbers = true)]
    pub camera: Vec<Float>,

    /// Camera look-at point (x y z).
    #[arg(long, value_name = "FLOAT", num_args = 3, allow_negative_numbers = true)]
    pub lookat: Vec<Float>,

    /// Camera up vector (x y z).
    #[arg(long, value_name = "FLOAT", num_args = 3, allow_negative_numbers = true)]
    pub up: Vec<Float>,

    /// Vertical field of view in degrees.
    #[arg(long, default_value_t = 60.0)]
    pub fov: Float,

    /// Output image path.
    #[arg(long, short = 'o', default_value = "distray.ppm")]
    pub output: String,

    /// View mode.
    #[arg(long = "view-mode", value_enum, default_value_t = ViewMode::Film)]
    pub view_mode: ViewMode,

    /// Partition mode.
    #[arg(long, value_enum, default_value_t = PartitionMode::Insitu)]
    pub partition: PartitionMode,

    /// Shading estimator.
    #[arg(long, value_enum, default_value_t = ShaderMode::Pt)]
    pub shader: ShaderMode,

    /// Geometry cache capacity in blocks; negative means infinite.
    /// Only valid with the image partition.
    #[arg(long = "cache-size", default_value_t = -1, allow_negative_numbers = true)]
    pub cache_size: i64,

    /// Search path for PLY files referenced by the descriptor.
    #[arg(long = "ply-path", default_value = "")]
    pub ply_path: String,

    /// Number of worker threads.
    #[arg(long, short = 't', default_value_t = 1)]
    pub nthreads: usize,

    /// Requested minimum number of image tiles.
    #[arg(long = "num-tiles", default_value_t = 1)]
    pub num_tiles: i32,

    /// Lower bound on the tile edge in pixels.
    #[arg(long = "min-tile-size", default_value_t = 8)]
    pub min_tile_size: i32,

    /// Upper bound on screen-space samples a rank may own per frame.
    #[arg(long = "max-samples-per-rank", default_value_t = i64::MAX)]
    pub max_samples_per_rank: i64,

    /// Specular reflectance (r g b) for direct lighting.
    #[arg(long, value_name = "FLOAT", num_args = 3, default_values_t = [0.0, 0.0, 0.0])]
    pub ks: Vec<Float>,

    /// Specular exponent for direct lighting.
    #[arg(long, default_value_t = 40.0)]
    pub shininess: Float,
}

impl Options {
    /// Validate cross-flag constraints.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config("image dimensions must be positive".into()));
        }
        if self.pixel_samples == 0 {
            return Err(Error::Config("pixel samples must be positive".into()));
        }
        if self.bounces == 0 {
            return Err(Error::Config("bounce budget must be positive".into()));
        }
        if self.partition == PartitionMode::Insitu && self.cache_size >= 0 {
            return Err(Error::Config(
                "not allowed to set cache size in in-situ mode".into(),
            ));
        }
        if self.view_mode != ViewMode::Film {
            return Err(Error::Config(format!(
                "view mode {:?} requires the preview build",
                self.view_mode
            )));
        }
        Ok(())
    }

    /// Number of worker threads, clamped to the machine.
    pub fn threads(&self) -> usize {
        let max_threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        match self.nthreads {
            0 => {
                warn!("invalid nthreads");
                1
            }
            n if n > max_threads => {
                warn!("num threads > max logical CPUs {max_threads}");
                max_threads
            }
            n => n,
        }
    }

    /// Camera flags, when all three were given.
    pub fn camera_config(&self) -> Option<(Vec3, Vec3, Vec3)> {
        if self.camera.len() == 3 && self.lookat.len() == 3 && self.up.len() == 3 {
            Some((
                Vec3::from_slice(&self.camera),
                Vec3::from_slice(&self.lookat),
                Vec3::from_slice(&self.up),
            ))
        } else {
            None
        }
    }

    /// Specular reflectance as a vector.
    pub fn ks_vec(&self) -> Vec3 {
        if self.ks.len() == 3 {
            Vec3::from_slice(&self.ks)
        } else {
            Vec3::ZERO
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        let mut full = vec!["distray", "scene.txt"];
        full.extend_from_slice(args);
        Options::parse_from(full)
    }

    #[test]
    fn defaults_are_valid() {
        let opts = parse(&[]);
        assert!(opts.validate().is_ok());
        assert_eq!(opts.partition, PartitionMode::Insitu);
        assert_eq!(opts.cache_size, -1);
    }

    #[test]
    fn insitu_rejects_bounded_cache() {
        let opts = parse(&["--cache-size", "4"]);
        assert!(opts.validate().is_err());
        let opts = parse(&["--partition", "image", "--cache-size", "4"]);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn preview_modes_rejected_in_this_build() {
        let opts = parse(&["--view-mode", "glfw"]);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn camera_needs_all_three_flags() {
        let opts = parse(&["--camera", "0", "0", "5"]);
        assert!(opts.camera_config().is_none());
        let opts = parse(&[
            "--camera", "0", "0", "5", "--lookat", "0", "0", "0", "--up", "0", "1", "0",
        ]);
        let (pos, lookat, up) = opts.camera_config().unwrap();
        assert_eq!(pos, Vec3::new(0.0, 0.0, 5.0));
        assert_eq!(lookat, Vec3::ZERO);
        assert_eq!(up, Vec3::Y);
    }
}
