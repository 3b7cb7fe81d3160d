//! Common types and constants.

use glam::Vec3;

/// Use 32-bit precision for floating point numbers.
pub type Float = f32;

/// Word unit used for ray messages on the wire.
pub type MsgWord = u64;

/// Infinity (∞)
pub const FLOAT_INF: Float = Float::INFINITY;

/// 1/PI (1/π)
pub const ONE_OVER_PI: Float = std::f32::consts::FRAC_1_PI;

/// Offset applied to ray origins to avoid self-intersection.
pub const RAY_EPSILON: Float = 1e-4;

/// Maximum number of domains a single ray may overlap.
pub const RAY_DOMAIN_LIST_SIZE: usize = 16;

/// Bounce window tracked by the out-of-core virtual depth counter.
pub const HISTORY_SIZE: i32 = 8;

/// Sentinel for a missing interpolated color; the material albedo applies.
pub const INVALID_COLOR: u32 = 0xffff_ffff;

/// Pack an RGB color into 8 bits per channel. The alpha byte is kept clear so
/// a packed color can never collide with [`INVALID_COLOR`].
pub fn pack_color(c: Vec3) -> u32 {
    let r = (c.x.clamp(0.0, 1.0) * 255.0) as u32;
    let g = (c.y.clamp(0.0, 1.0) * 255.0) as u32;
    let b = (c.z.clamp(0.0, 1.0) * 255.0) as u32;
    (r << 16) | (g << 8) | b
}

/// Unpack an 8-bit-per-channel color into RGB in [0, 1].
pub fn unpack_color(c: u32) -> Vec3 {
    if c == INVALID_COLOR {
        return Vec3::ONE;
    }
    Vec3::new(
        ((c >> 16) & 0xff) as Float / 255.0,
        ((c >> 8) & 0xff) as Float / 255.0,
        (c & 0xff) as Float / 255.0,
    )
}

/// Returns true if any component carries energy.
pub fn has_positive(v: Vec3) -> bool {
    v.x > 0.0 || v.y > 0.0 || v.z > 0.0
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_round_trip() {
        let c = Vec3::new(0.25, 0.5, 1.0);
        let u = unpack_color(pack_color(c));
        assert!((u - c).abs().max_element() < 1.0 / 255.0 + 1e-6);
    }

    #[test]
    fn packed_color_never_invalid() {
        assert_ne!(pack_color(Vec3::ONE), INVALID_COLOR);
        assert_eq!(unpack_color(INVALID_COLOR), Vec3::ONE);
    }

    #[test]
    fn positive_energy() {
        assert!(has_positive(Vec3::new(0.0, 1e-6, 0.0)));
        assert!(!has_positive(Vec3::ZERO));
        assert!(!has_positive(Vec3::new(-1.0, -2.0, 0.0)));
    }
}
