//! Pinhole camera.

use crate::common::Float;
use crate::geometry::Aabb;
use glam::Vec3;

/// A pinhole camera over the image plane.
pub struct Camera {
    pos: Vec3,
    lower_left: Vec3,
    horizontal: Vec3,
    vertical: Vec3,
    image_w: Float,
    image_h: Float,
}

impl Camera {
    /// Create a camera.
    ///
    /// * `pos`     - Camera position.
    /// * `lookat`  - Point the camera looks at.
    /// * `up`      - Up vector.
    /// * `vfov`    - Vertical field of view in degrees.
    /// * `image_w` - Image width in pixels.
    /// * `image_h` - Image height in pixels.
    pub fn new(pos: Vec3, lookat: Vec3, up: Vec3, vfov: Float, image_w: u32, image_h: u32) -> Self {
        let aspect = image_w as Float / image_h as Float;
        let half_h = (vfov.to_radians() * 0.5).tan();
        let half_w = aspect * half_h;

        let w = (pos - lookat).normalize();
        let u = up.cross(w).normalize();
        let v = w.cross(u);

        Self {
            pos,
            lower_left: pos - u * half_w - v * half_h - w,
            horizontal: u * (2.0 * half_w),
            vertical: v * (2.0 * half_h),
            image_w: image_w as Float,
            image_h: image_h as Float,
        }
    }

    /// Create a camera framing the whole scene: centered on the bound, backed
    /// off along +z by half the bound's diagonal.
    ///
    /// * `bound`   - World bounds of the scene.
    /// * `vfov`    - Vertical field of view in degrees.
    /// * `image_w` - Image width in pixels.
    /// * `image_h` - Image height in pixels.
    pub fn auto_frame(bound: &Aabb, vfov: Float, image_w: u32, image_h: u32) -> Self {
        let lookat = bound.center();
        let pos = lookat + Vec3::new(0.0, 0.0, bound.extent().length() * 0.5);
        Self::new(pos, lookat, Vec3::Y, vfov, image_w, image_h)
    }

    /// Generate the direction of the ray through image position `(x, y)`.
    ///
    /// * `x` - Horizontal image coordinate in pixels.
    /// * `y` - Vertical image coordinate in pixels.
    pub fn generate_ray(&self, x: Float, y: Float) -> Vec3 {
        let s = x / self.image_w;
        let t = y / self.image_h;
        (self.lower_left + self.horizontal * s + self.vertical * t - self.pos).normalize()
    }

    /// Camera position.
    pub fn position(&self) -> Vec3 {
        self.pos
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_ray_points_at_target() {
        let cam = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y, 60.0, 100, 100);
        let dir = cam.generate_ray(50.0, 50.0);
        assert!((dir - Vec3::NEG_Z).length() < 1e-5);
    }

    #[test]
    fn corner_rays_diverge_symmetrically() {
        let cam = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y, 60.0, 100, 100);
        let left = cam.generate_ray(0.0, 50.0);
        let right = cam.generate_ray(100.0, 50.0);
        assert!((left.x + right.x).abs() < 1e-5);
        assert!(left.x < 0.0 && right.x > 0.0);
    }

    #[test]
    fn auto_frame_sees_the_bound() {
        let mut b = Aabb::empty();
        b.grow(Vec3::splat(-1.0));
        b.grow(Vec3::splat(1.0));
        let cam = Camera::auto_frame(&b, 60.0, 64, 64);
        let dir = cam.generate_ray(32.0, 32.0);
        // center ray heads toward the bound center
        assert!(dir.z < 0.0);
        assert!(cam.position().z > b.max.z);
    }
}
