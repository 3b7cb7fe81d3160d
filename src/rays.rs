//! Ray and intersection records.

use crate::common::{Float, MsgWord, FLOAT_INF, INVALID_COLOR};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// The unit of work of the scheduler.
///
/// Rays are plain 64-byte records: they are value-copied into per-domain
/// queues within a rank and value-copied onto the wire when they cross rank
/// boundaries. A shadow ray records the light sample it was emitted for in
/// `light`; radiance rays carry `-1` there. `t` stashes the distance of the
/// hit that spawned the ray so speculative work can later be checked against
/// the reconciled visibility buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Ray {
    /// Origin.
    pub org: [Float; 3],

    /// Image pixel index.
    pub pixid: i32,

    /// Direction (normalized).
    pub dir: [Float; 3],

    /// Global sample index.
    pub samid: i32,

    /// Carried radiance weight.
    pub w: [Float; 3],

    /// Light sample index of a shadow ray; -1 otherwise.
    pub light: i32,

    /// Distance of the originating hit; the best bound known to the ray.
    pub t: Float,

    /// Virtual bounce depth within the current history window.
    pub depth: i32,

    /// Set once an occlusion test along this ray succeeded.
    pub occluded: u32,

    _pad: u32,
}

impl Ray {
    /// Create an eye ray.
    ///
    /// * `org`   - Camera position.
    /// * `dir`   - Ray direction.
    /// * `pixid` - Image pixel index.
    /// * `samid` - Global sample index.
    pub fn eye(org: Vec3, dir: Vec3, pixid: i32, samid: i32) -> Self {
        Self {
            org: org.to_array(),
            pixid,
            dir: dir.to_array(),
            samid,
            w: [1.0; 3],
            light: -1,
            t: FLOAT_INF,
            depth: 0,
            occluded: 0,
            _pad: 0,
        }
    }

    /// Create a shadow ray toward a light sample.
    ///
    /// * `parent` - The ray whose hit spawned this one.
    /// * `light`  - Light sample index.
    /// * `org`    - Hit position.
    /// * `dir`    - Direction toward the light sample.
    /// * `w`      - Weighted contribution if the path is unoccluded.
    /// * `t`      - Distance of the originating hit.
    pub fn shadow(parent: &Ray, light: i32, org: Vec3, dir: Vec3, w: Vec3, t: Float) -> Self {
        Self {
            org: org.to_array(),
            pixid: parent.pixid,
            dir: dir.to_array(),
            samid: parent.samid,
            w: w.to_array(),
            light,
            t,
            depth: parent.depth,
            occluded: 0,
            _pad: 0,
        }
    }

    /// Create a secondary (indirect) radiance ray.
    ///
    /// * `parent` - The ray whose hit spawned this one.
    /// * `org`    - Hit position.
    /// * `dir`    - Scattered direction.
    /// * `w`      - Carried weight after the bounce.
    /// * `t`      - Distance of the originating hit.
    /// * `depth`  - Virtual depth of the new ray.
    pub fn secondary(parent: &Ray, org: Vec3, dir: Vec3, w: Vec3, t: Float, depth: i32) -> Self {
        Self {
            org: org.to_array(),
            pixid: parent.pixid,
            dir: dir.to_array(),
            samid: parent.samid,
            w: w.to_array(),
            light: -1,
            t,
            depth,
            occluded: 0,
            _pad: 0,
        }
    }

    /// Origin as a vector.
    pub fn origin(&self) -> Vec3 {
        Vec3::from_array(self.org)
    }

    /// Direction as a vector.
    pub fn direction(&self) -> Vec3 {
        Vec3::from_array(self.dir)
    }

    /// Carried weight as a vector.
    pub fn weight(&self) -> Vec3 {
        Vec3::from_array(self.w)
    }

    /// Position along the ray.
    ///
    /// * `t` - Distance.
    pub fn hit_position(&self, t: Float) -> Vec3 {
        self.origin() + self.direction() * t
    }
}

/// Result of intersecting a ray against loaded domain geometry.
#[derive(Clone, Copy, Debug)]
pub struct Intersection {
    /// Hit distance.
    pub t: Float,

    /// Geometric normal (unnormalized).
    pub ng: Vec3,

    /// Shading normal.
    pub ns: Vec3,

    /// Barycentric u coordinate of the hit.
    pub u: Float,

    /// Barycentric v coordinate of the hit.
    pub v: Float,

    /// Geometry id within the domain.
    pub geom_id: u32,

    /// Primitive id within the geometry.
    pub prim_id: u32,

    /// Interpolated surface color, or [`INVALID_COLOR`].
    pub color: u32,
}

impl Intersection {
    /// A record representing "no hit yet" with an unbounded distance.
    pub fn miss() -> Self {
        Self {
            t: FLOAT_INF,
            ng: Vec3::ZERO,
            ns: Vec3::ZERO,
            u: 0.0,
            v: 0.0,
            geom_id: u32::MAX,
            prim_id: u32::MAX,
            color: INVALID_COLOR,
        }
    }

    /// Returns true if this record holds an actual hit.
    pub fn is_hit(&self) -> bool {
        self.t.is_finite()
    }
}

/// Header preceding the packed ray records of one wire message.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MsgHeader {
    /// Destination domain of the payload rays.
    pub domain_id: i32,

    _pad: i32,

    /// Number of ray records that follow.
    pub payload_count: i64,
}

/// Size of a wire message header in words.
pub const MSG_HEADER_WORDS: usize = std::mem::size_of::<MsgHeader>() / std::mem::size_of::<MsgWord>();

/// Size of one packed ray record in words.
pub const RAY_WORDS: usize = std::mem::size_of::<Ray>() / std::mem::size_of::<MsgWord>();

/// Serialize a batch of rays for one destination domain into wire words.
///
/// * `domain_id` - Destination domain.
/// * `rays`      - The payload.
pub fn encode_rays(domain_id: i32, rays: &[Ray]) -> Vec<MsgWord> {
    let header = MsgHeader {
        domain_id,
        _pad: 0,
        payload_count: rays.len() as i64,
    };
    let mut words = vec![0 as MsgWord; MSG_HEADER_WORDS + rays.len() * RAY_WORDS];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
    let hsize = std::mem::size_of::<MsgHeader>();
    bytes[..hsize].copy_from_slice(bytemuck::bytes_of(&header));
    let rsize = std::mem::size_of::<Ray>();
    for (i, ray) in rays.iter().enumerate() {
        let at = hsize + i * rsize;
        bytes[at..at + rsize].copy_from_slice(bytemuck::bytes_of(ray));
    }
    words
}

/// Deserialize a wire message back into its header and ray records.
///
/// * `words` - Message words as received.
pub fn decode_rays(words: &[MsgWord]) -> (MsgHeader, Vec<Ray>) {
    let bytes: &[u8] = bytemuck::cast_slice(words);
    let hsize = std::mem::size_of::<MsgHeader>();
    let header: MsgHeader = bytemuck::pod_read_unaligned(&bytes[..hsize]);
    let rsize = std::mem::size_of::<Ray>();
    let count = header.payload_count as usize;
    let mut rays = Vec::with_capacity(count);
    for i in 0..count {
        let at = hsize + i * rsize;
        rays.push(bytemuck::pod_read_unaligned::<Ray>(&bytes[at..at + rsize]));
    }
    (header, rays)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_sizes_are_word_multiples() {
        assert_eq!(std::mem::size_of::<Ray>() % 8, 0);
        assert_eq!(std::mem::size_of::<MsgHeader>() % 8, 0);
        assert_eq!(RAY_WORDS, 8);
        assert_eq!(MSG_HEADER_WORDS, 2);
    }

    #[test]
    fn eye_ray_defaults() {
        let r = Ray::eye(Vec3::ZERO, Vec3::NEG_Z, 3, 12);
        assert_eq!(r.light, -1);
        assert_eq!(r.t, FLOAT_INF);
        assert_eq!(r.depth, 0);
        assert_eq!(r.occluded, 0);
        assert_eq!(r.weight(), Vec3::ONE);
    }

    #[test]
    fn empty_message_round_trip() {
        let words = encode_rays(5, &[]);
        assert_eq!(words.len(), MSG_HEADER_WORDS);
        let (header, rays) = decode_rays(&words);
        assert_eq!(header.domain_id, 5);
        assert_eq!(header.payload_count, 0);
        assert!(rays.is_empty());
    }

    proptest! {
        #[test]
        fn wire_round_trip(ox in -10.0f32..10.0, dz in 0.1f32..1.0,
                           pixid in 0i32..10000, samid in 0i32..100000,
                           light in -1i32..8, t in 0.0f32..100.0,
                           n in 0usize..12) {
            let mut ray = Ray::eye(Vec3::new(ox, 0.0, 0.0), Vec3::new(0.0, 0.0, dz), pixid, samid);
            ray.light = light;
            ray.t = t;
            ray.occluded = 1;
            let rays = vec![ray; n];
            let words = encode_rays(7, &rays);
            let (header, out) = decode_rays(&words);
            prop_assert_eq!(header.domain_id, 7);
            prop_assert_eq!(header.payload_count, n as i64);
            prop_assert_eq!(out, rays);
        }
    }
}
