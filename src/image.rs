//! Frame accumulation buffer and PPM output.

use crate::atomic::AtomicFloat;
use crate::cluster::Cluster;
use crate::common::Float;
use crate::error::Result;
use glam::Vec3;
use mpi::collective::SystemOperation;
use mpi::traits::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// High dynamic range accumulation image.
///
/// Retiring shadow rays on different threads deposit into the same pixel, so
/// each channel is an atomic float; contention is limited to rays sharing a
/// pixel.
pub struct HdrImage {
    /// Width in pixels.
    pub w: usize,

    /// Height in pixels.
    pub h: usize,

    buf: Vec<AtomicFloat>,
}

impl HdrImage {
    /// Create a cleared image.
    ///
    /// * `w` - Width in pixels.
    /// * `h` - Height in pixels.
    pub fn new(w: usize, h: usize) -> Self {
        Self {
            w,
            h,
            buf: (0..w * h * 3).map(|_| AtomicFloat::default()).collect(),
        }
    }

    /// Reset all pixels to black.
    pub fn clear(&self) {
        for c in &self.buf {
            c.set(0.0);
        }
    }

    /// Accumulate a weighted contribution into a pixel.
    ///
    /// * `pixid` - Pixel index.
    /// * `w`     - RGB contribution.
    /// * `scale` - Scale factor (one over the pixel sample count).
    pub fn add(&self, pixid: usize, w: Vec3, scale: Float) {
        let base = pixid * 3;
        self.buf[base].add(w.x * scale);
        self.buf[base + 1].add(w.y * scale);
        self.buf[base + 2].add(w.z * scale);
    }

    /// Sum partial images across ranks into rank 0.
    ///
    /// * `cluster` - The process context.
    pub fn composite(&self, cluster: &Cluster) {
        if !cluster.is_multi() {
            return;
        }
        let local: Vec<Float> = self.buf.iter().map(|c| c.get()).collect();
        let root = cluster.world().process_at_rank(0);
        if cluster.is_root() {
            let mut summed = vec![0.0 as Float; local.len()];
            root.reduce_into_root(&local[..], &mut summed[..], SystemOperation::sum());
            for (c, v) in self.buf.iter().zip(summed) {
                c.set(v);
            }
        } else {
            root.reduce_into(&local[..], SystemOperation::sum());
        }
    }

    /// Write the image as a plain-text PPM file, clamped to [0, 1].
    ///
    /// * `path` - Output file path.
    pub fn write_ppm<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "P3")?;
        writeln!(out, "{} {}", self.w, self.h)?;
        writeln!(out, "255")?;
        // top row first
        for y in (0..self.h).rev() {
            for x in 0..self.w {
                let base = (y * self.w + x) * 3;
                let r = (self.buf[base].get().clamp(0.0, 1.0) * 255.0).round() as u8;
                let g = (self.buf[base + 1].get().clamp(0.0, 1.0) * 255.0).round() as u8;
                let b = (self.buf[base + 2].get().clamp(0.0, 1.0) * 255.0).round() as u8;
                writeln!(out, "{r} {g} {b}")?;
            }
        }
        Ok(())
    }

    /// Read back one pixel.
    ///
    /// * `pixid` - Pixel index.
    pub fn pixel(&self, pixid: usize) -> Vec3 {
        let base = pixid * 3;
        Vec3::new(
            self.buf[base].get(),
            self.buf[base + 1].get(),
            self.buf[base + 2].get(),
        )
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_scales_by_sample_count() {
        let img = HdrImage::new(2, 2);
        img.add(3, Vec3::new(1.0, 2.0, 4.0), 0.25);
        assert_eq!(img.pixel(3), Vec3::new(0.25, 0.5, 1.0));
        img.add(3, Vec3::new(1.0, 2.0, 4.0), 0.25);
        assert_eq!(img.pixel(3), Vec3::new(0.5, 1.0, 2.0));
    }

    #[test]
    fn clear_resets() {
        let img = HdrImage::new(1, 1);
        img.add(0, Vec3::ONE, 1.0);
        img.clear();
        assert_eq!(img.pixel(0), Vec3::ZERO);
    }

    #[test]
    fn ppm_output_shape() {
        let dir = std::env::temp_dir().join("distray_ppm_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.ppm");
        let img = HdrImage::new(2, 1);
        img.add(0, Vec3::new(1.0, 0.0, 0.0), 1.0);
        img.write_ppm(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("P3"));
        assert_eq!(lines.next(), Some("2 1"));
        assert_eq!(lines.next(), Some("255"));
        assert_eq!(lines.next(), Some("255 0 0"));
        assert_eq!(lines.next(), Some("0 0 0"));
    }
}
