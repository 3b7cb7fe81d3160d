//! Scene model: domains, paged geometry, and domain bounds tests.

pub mod bvh;
pub mod descriptor;
pub mod light;
pub mod material;
pub mod ply;
pub mod shape;

use crate::cache::CachePolicy;
use crate::common::{pack_color, unpack_color, Float, FLOAT_INF, INVALID_COLOR, RAY_DOMAIN_LIST_SIZE, RAY_EPSILON};
use crate::error::{Error, Result};
use crate::geometry::Aabb;
use crate::partition::InsituPartition;
use crate::rays::Intersection;
use bvh::{intersect_triangle, triangle_bounds, Bvh};
use descriptor::{DomainDesc, Model, SceneDesc};
use glam::Vec3;
use light::Light;
use material::{Bsdf, Material};
use ply::load_ply;
use shape::Sphere;
use std::path::Path;
use std::sync::{Mutex, RwLock};

/// Geometry id of mesh triangles within a domain.
pub const TRIANGLE_GEOM_ID: u32 = 0;

/// Geometry id of analytic shapes within a domain.
pub const SHAPE_GEOM_ID: u32 = 1;

/// A spatial partition of the scene: the unit of distribution and of cache
/// residency. Immutable after scene load.
pub struct Domain {
    /// Domain id.
    pub id: usize,

    /// Mesh models, with materials and object-to-world transforms.
    pub models: Vec<Model>,

    /// Analytic spheres.
    pub spheres: Vec<Sphere>,

    /// World-space bounds of all geometry.
    pub world_aabb: Aabb,

    /// Scattering model of the domain.
    pub bsdf: Bsdf,

    /// Vertices across all models, known after the bounds scan.
    pub num_vertices: usize,

    /// Faces across all models, known after the bounds scan.
    pub num_faces: usize,
}

/// Sorted list of domains overlapped by one ray, nearest first.
#[derive(Clone, Copy, Debug)]
pub struct DomainList {
    /// Number of valid entries.
    pub count: usize,

    /// Hit domain ids.
    pub ids: [i32; RAY_DOMAIN_LIST_SIZE],

    /// Entry distance per hit domain.
    pub ts: [Float; RAY_DOMAIN_LIST_SIZE],
}

impl Default for DomainList {
    fn default() -> Self {
        Self {
            count: 0,
            ids: [-1; RAY_DOMAIN_LIST_SIZE],
            ts: [FLOAT_INF; RAY_DOMAIN_LIST_SIZE],
        }
    }
}

impl DomainList {
    fn push(&mut self, id: i32, t: Float) {
        if self.count < RAY_DOMAIN_LIST_SIZE {
            self.ids[self.count] = id;
            self.ts[self.count] = t;
            self.count += 1;
            return;
        }
        // full: replace the farthest entry if this one is nearer
        let mut far = 0;
        for i in 1..self.count {
            if self.ts[i] > self.ts[far] {
                far = i;
            }
        }
        if t < self.ts[far] {
            self.ids[far] = id;
            self.ts[far] = t;
        }
    }

    fn sort(&mut self) {
        let mut pairs: Vec<(Float, i32)> = (0..self.count).map(|i| (self.ts[i], self.ids[i])).collect();
        pairs.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        for (i, (t, id)) in pairs.into_iter().enumerate() {
            self.ts[i] = t;
            self.ids[i] = id;
        }
    }

    /// Iterate `(id, entry_t)` pairs, nearest first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Float)> + '_ {
        (0..self.count).map(|i| (self.ids[i] as usize, self.ts[i]))
    }
}

/// Geometry of one domain resident in a cache block.
pub struct LoadedDomain {
    /// Domain id the block holds.
    pub id: usize,

    vertices: Vec<Vec3>,
    normals: Vec<Vec3>,
    faces: Vec<[u32; 3]>,
    face_model: Vec<u16>,
    colors: Vec<u32>,
    materials: Vec<Material>,
    spheres: Vec<Sphere>,
    bvh: Bvh,
}

impl LoadedDomain {
    /// Load and index all geometry of a domain.
    ///
    /// * `domain` - The domain to load.
    pub fn build(domain: &Domain) -> Result<Self> {
        let mut vertices: Vec<Vec3> = Vec::new();
        let mut faces: Vec<[u32; 3]> = Vec::new();
        let mut face_model: Vec<u16> = Vec::new();
        let mut colors: Vec<u32> = Vec::new();
        let mut materials: Vec<Material> = Vec::new();

        for (mi, model) in domain.models.iter().enumerate() {
            let mesh = load_ply(&model.file)?;
            let base = vertices.len() as u32;
            for (vi, v) in mesh.vertices.iter().enumerate() {
                vertices.push(model.transform.transform_point3(*v));
                colors.push(match &mesh.colors {
                    Some(c) => c[vi],
                    None => INVALID_COLOR,
                });
            }
            for f in &mesh.faces {
                faces.push([base + f[0], base + f[1], base + f[2]]);
                face_model.push(mi as u16);
            }
            materials.push(model.material);
        }

        let normals = smooth_normals(&vertices, &faces);

        let mut prim_bounds: Vec<Aabb> = Vec::with_capacity(faces.len() + domain.spheres.len());
        for f in &faces {
            prim_bounds.push(triangle_bounds(
                vertices[f[0] as usize],
                vertices[f[1] as usize],
                vertices[f[2] as usize],
            ));
        }
        for s in &domain.spheres {
            prim_bounds.push(s.bounds());
        }

        Ok(Self {
            id: domain.id,
            vertices,
            normals,
            faces,
            face_model,
            colors,
            materials,
            spheres: domain.spheres.clone(),
            bvh: Bvh::build(&prim_bounds),
        })
    }

    /// Closest hit of a ray against this domain's geometry.
    ///
    /// * `org` - Ray origin.
    /// * `dir` - Ray direction.
    pub fn intersect(&self, org: Vec3, dir: Vec3) -> Option<Intersection> {
        let nfaces = self.faces.len() as u32;
        let hit = self.bvh.intersect(org, dir, RAY_EPSILON, FLOAT_INF, |prim, tmax| {
            if prim < nfaces {
                let f = self.faces[prim as usize];
                intersect_triangle(
                    org,
                    dir,
                    RAY_EPSILON,
                    tmax,
                    self.vertices[f[0] as usize],
                    self.vertices[f[1] as usize],
                    self.vertices[f[2] as usize],
                )
                .map(|(t, _, _)| t)
            } else {
                self.spheres[(prim - nfaces) as usize]
                    .intersect(org, dir, RAY_EPSILON, tmax)
                    .map(|(t, _)| t)
            }
        });
        hit.map(|(prim, t)| self.make_intersection(org, dir, prim, t))
    }

    /// Returns true if anything blocks the ray.
    ///
    /// * `org` - Ray origin.
    /// * `dir` - Ray direction.
    pub fn occluded(&self, org: Vec3, dir: Vec3) -> bool {
        let nfaces = self.faces.len() as u32;
        self.bvh.occluded(org, dir, RAY_EPSILON, FLOAT_INF, |prim, tmax| {
            if prim < nfaces {
                let f = self.faces[prim as usize];
                intersect_triangle(
                    org,
                    dir,
                    RAY_EPSILON,
                    tmax,
                    self.vertices[f[0] as usize],
                    self.vertices[f[1] as usize],
                    self.vertices[f[2] as usize],
                )
                .is_some()
            } else {
                self.spheres[(prim - nfaces) as usize]
                    .intersect(org, dir, RAY_EPSILON, tmax)
                    .is_some()
            }
        })
    }

    fn make_intersection(&self, org: Vec3, dir: Vec3, prim: u32, t: Float) -> Intersection {
        let nfaces = self.faces.len() as u32;
        if prim < nfaces {
            let f = self.faces[prim as usize];
            let (v0, v1, v2) = (
                self.vertices[f[0] as usize],
                self.vertices[f[1] as usize],
                self.vertices[f[2] as usize],
            );
            let (_, u, v) = intersect_triangle(org, dir, RAY_EPSILON, t + 1e-3, v0, v1, v2)
                .unwrap_or((t, 0.0, 0.0));
            let ng = (v1 - v0).cross(v2 - v0);
            let w = 1.0 - u - v;
            let ns = (self.normals[f[0] as usize] * w
                + self.normals[f[1] as usize] * u
                + self.normals[f[2] as usize] * v)
                .normalize_or_zero();
            let (c0, c1, c2) = (
                self.colors[f[0] as usize],
                self.colors[f[1] as usize],
                self.colors[f[2] as usize],
            );
            let color = if c0 == INVALID_COLOR || c1 == INVALID_COLOR || c2 == INVALID_COLOR {
                let m = self.materials[self.face_model[prim as usize] as usize];
                pack_color(m.albedo())
            } else {
                pack_color(
                    unpack_color(c0) * w + unpack_color(c1) * u + unpack_color(c2) * v,
                )
            };
            Intersection {
                t,
                ng,
                ns: if ns == Vec3::ZERO { ng.normalize_or_zero() } else { ns },
                u,
                v,
                geom_id: TRIANGLE_GEOM_ID,
                prim_id: prim,
                color,
            }
        } else {
            let sphere = &self.spheres[(prim - nfaces) as usize];
            let n = (org + dir * t - sphere.center) / sphere.radius;
            Intersection {
                t,
                ng: n,
                ns: n,
                u: 0.0,
                v: 0.0,
                geom_id: SHAPE_GEOM_ID,
                prim_id: prim - nfaces,
                color: pack_color(sphere.material.albedo()),
            }
        }
    }
}

fn smooth_normals(vertices: &[Vec3], faces: &[[u32; 3]]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; vertices.len()];
    for f in faces {
        let n = (vertices[f[1] as usize] - vertices[f[0] as usize])
            .cross(vertices[f[2] as usize] - vertices[f[0] as usize]);
        for &i in f {
            normals[i as usize] += n;
        }
    }
    for n in &mut normals {
        *n = n.normalize_or_zero();
    }
    normals
}

/// The scene: immutable domain table plus the mutable geometry residency
/// state. The cache policy is serialized behind a mutex and each block sits
/// behind its own lock, so the master thread can page domains while workers
/// are parked at phase barriers, and lazy first-touch loads from any thread
/// are safe.
pub struct Scene {
    domains: Vec<Domain>,
    lights: Vec<Light>,
    bound: Aabb,
    partition: InsituPartition,
    policy: Mutex<CachePolicy>,
    blocks: Vec<RwLock<Option<LoadedDomain>>>,
}

impl Scene {
    /// Load a scene from a descriptor file.
    ///
    /// * `descriptor` - Descriptor path.
    /// * `ply_path`   - Search path for model files.
    /// * `cache_size` - Geometry cache capacity; negative selects the
    ///                  infinite cache.
    /// * `nranks`     - Number of ranks for the partition.
    pub fn init(descriptor: &Path, ply_path: &Path, cache_size: i64, nranks: usize) -> Result<Scene> {
        let desc = descriptor::load_descriptor(descriptor, ply_path)?;
        Self::from_desc(desc, cache_size, nranks)
    }

    /// Build a scene from an already parsed descriptor.
    ///
    /// * `desc`       - Parsed descriptor.
    /// * `cache_size` - Geometry cache capacity; negative selects the
    ///                  infinite cache.
    /// * `nranks`     - Number of ranks for the partition.
    pub fn from_desc(desc: SceneDesc, cache_size: i64, nranks: usize) -> Result<Scene> {
        let mut domains = Vec::with_capacity(desc.domains.len());
        let mut bound = Aabb::empty();
        for d in &desc.domains {
            let domain = build_domain(d)?;
            if domain.world_aabb.is_valid() {
                bound = bound.union(&domain.world_aabb);
            }
            domains.push(domain);
        }

        let ndomains = domains.len();
        let policy = CachePolicy::new(ndomains, cache_size);
        let blocks = (0..policy.capacity()).map(|_| RwLock::new(None)).collect();

        Ok(Scene {
            domains,
            lights: desc.lights,
            bound,
            partition: InsituPartition::new(ndomains, nranks),
            policy: Mutex::new(policy),
            blocks,
        })
    }

    /// Number of domains.
    pub fn num_domains(&self) -> usize {
        self.domains.len()
    }

    /// The domain table.
    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    /// One domain.
    ///
    /// * `id` - Domain id.
    pub fn domain(&self, id: usize) -> &Domain {
        &self.domains[id]
    }

    /// The lights of the scene.
    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    /// World bounds of all domains.
    pub fn bound(&self) -> &Aabb {
        &self.bound
    }

    /// The domain-to-rank partition.
    pub fn partition(&self) -> &InsituPartition {
        &self.partition
    }

    /// The scattering model of a domain.
    ///
    /// * `id` - Domain id.
    pub fn bsdf(&self, id: usize) -> Bsdf {
        self.domains[id].bsdf
    }

    /// Ensure a domain's geometry is resident and return its cache block.
    ///
    /// * `id` - Domain id.
    pub fn load(&self, id: usize) -> Result<usize> {
        self.load_impl(id, false)
    }

    /// Like [`load`](Self::load), but the returned block comes back pinned.
    /// The pin is taken under the policy lock, so no concurrent load can
    /// choose the block as an eviction victim before the caller uses it.
    ///
    /// * `id` - Domain id.
    pub fn load_pinned(&self, id: usize) -> Result<usize> {
        self.load_impl(id, true)
    }

    fn load_impl(&self, id: usize, pin: bool) -> Result<usize> {
        let slot = {
            let mut policy = self.policy.lock().expect("cache policy poisoned");
            let slot = policy.acquire(id)?;
            if pin {
                policy.pin(slot.block);
            }
            slot
        };
        let mut guard = self.blocks[slot.block].write().expect("cache block poisoned");
        let resident = matches!(&*guard, Some(d) if d.id == id);
        if !resident {
            if let Some(old) = guard.take() {
                debug!("evicting domain {} from block {}", old.id, slot.block);
            }
            debug!("loading domain {id} into block {}", slot.block);
            *guard = Some(LoadedDomain::build(&self.domains[id])?);
        }
        Ok(slot.block)
    }

    /// Pin a cache block while intersection against it is in progress.
    ///
    /// * `block` - Block index.
    pub fn pin(&self, block: usize) {
        self.policy.lock().expect("cache policy poisoned").pin(block);
    }

    /// Release a pinned block.
    ///
    /// * `block` - Block index.
    pub fn unpin(&self, block: usize) {
        self.policy.lock().expect("cache policy poisoned").unpin(block);
    }

    /// Run a closure against resident geometry.
    ///
    /// * `block` - Block returned by [`load`](Self::load).
    /// * `f`     - The closure.
    pub fn with_loaded<R>(&self, block: usize, f: impl FnOnce(&LoadedDomain) -> R) -> R {
        let guard = self.blocks[block].read().expect("cache block poisoned");
        f(guard.as_ref().expect("cache block not resident"))
    }

    /// Closest hit against a resident domain.
    ///
    /// * `block` - Cache block.
    /// * `org`   - Ray origin.
    /// * `dir`   - Ray direction.
    pub fn intersect(&self, block: usize, org: Vec3, dir: Vec3) -> Option<Intersection> {
        self.with_loaded(block, |d| d.intersect(org, dir))
    }

    /// Occlusion query against a resident domain.
    ///
    /// * `block` - Cache block.
    /// * `org`   - Ray origin.
    /// * `dir`   - Ray direction.
    pub fn occluded(&self, block: usize, org: Vec3, dir: Vec3) -> bool {
        self.with_loaded(block, |d| d.occluded(org, dir))
    }

    /// Test a ray against every domain's world bounds, producing the sorted
    /// front-to-back candidate list.
    ///
    /// * `org` - Ray origin.
    /// * `dir` - Ray direction.
    pub fn intersect_domains(&self, org: Vec3, dir: Vec3) -> DomainList {
        let inv_dir = dir.recip();
        let mut list = DomainList::default();
        for d in &self.domains {
            if !d.world_aabb.is_valid() {
                continue;
            }
            if let Some(t) = d.world_aabb.intersect(org, inv_dir, RAY_EPSILON, FLOAT_INF) {
                list.push(d.id as i32, t);
            }
        }
        list.sort();
        list
    }
}

fn build_domain(desc: &DomainDesc) -> Result<Domain> {
    let mut world_aabb = Aabb::empty();
    let mut num_vertices = 0;
    let mut num_faces = 0;
    for model in &desc.models {
        let mesh = load_ply(&model.file)?;
        num_vertices += mesh.vertices.len();
        num_faces += mesh.faces.len();
        for v in &mesh.vertices {
            world_aabb.grow(model.transform.transform_point3(*v));
        }
    }
    for s in &desc.spheres {
        world_aabb = world_aabb.union(&s.bounds());
    }

    let materials: Vec<&Material> = desc
        .models
        .iter()
        .map(|m| &m.material)
        .chain(desc.spheres.iter().map(|s| &s.material))
        .collect();

    Ok(Domain {
        id: desc.id,
        models: desc.models.clone(),
        spheres: desc.spheres.clone(),
        world_aabb,
        bsdf: Bsdf::from_materials(materials),
        num_vertices,
        num_faces,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use descriptor::parse_descriptor;

    pub(crate) fn sphere_scene(centers: &[Vec3], cache_size: i64, nranks: usize) -> Scene {
        let mut text = String::new();
        for c in centers {
            text.push_str(&format!(
                "domain\nsphere {} {} {} 0.5 matte 0.8 0.4 0.2\n",
                c.x, c.y, c.z
            ));
        }
        let desc = parse_descriptor(&text, Path::new("")).unwrap();
        Scene::from_desc(desc, cache_size, nranks).unwrap()
    }

    #[test]
    fn domain_list_sorted_front_to_back() {
        let scene = sphere_scene(
            &[
                Vec3::new(0.0, 0.0, -5.0),
                Vec3::new(0.0, 0.0, -2.0),
                Vec3::new(0.0, 0.0, -8.0),
            ],
            -1,
            1,
        );
        let list = scene.intersect_domains(Vec3::ZERO, Vec3::NEG_Z);
        assert_eq!(list.count, 3);
        let ids: Vec<usize> = list.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 0, 2]);
        let ts: Vec<Float> = list.iter().map(|(_, t)| t).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn miss_produces_empty_list() {
        let scene = sphere_scene(&[Vec3::new(0.0, 0.0, -5.0)], -1, 1);
        let list = scene.intersect_domains(Vec3::ZERO, Vec3::Y);
        assert_eq!(list.count, 0);
    }

    #[test]
    fn load_and_intersect_sphere_domain() {
        let scene = sphere_scene(&[Vec3::new(0.0, 0.0, -3.0)], -1, 1);
        let block = scene.load(0).unwrap();
        let isect = scene.intersect(block, Vec3::ZERO, Vec3::NEG_Z).unwrap();
        assert!((isect.t - 2.5).abs() < 1e-4);
        assert_eq!(isect.geom_id, SHAPE_GEOM_ID);
        assert!(scene.occluded(block, Vec3::ZERO, Vec3::NEG_Z));
        assert!(!scene.occluded(block, Vec3::ZERO, Vec3::Z));
    }

    #[test]
    fn lru_cache_reloads_after_eviction() {
        let scene = sphere_scene(
            &[Vec3::new(0.0, 0.0, -3.0), Vec3::new(0.0, 0.0, -6.0)],
            1,
            1,
        );
        let b0 = scene.load(0).unwrap();
        assert!(scene.intersect(b0, Vec3::ZERO, Vec3::NEG_Z).is_some());
        let b1 = scene.load(1).unwrap();
        assert_eq!(b0, b1);
        let isect = scene.intersect(b1, Vec3::ZERO, Vec3::NEG_Z).unwrap();
        assert!((isect.t - 5.5).abs() < 1e-4);
        // reload the first
        let b0 = scene.load(0).unwrap();
        let isect = scene.intersect(b0, Vec3::ZERO, Vec3::NEG_Z).unwrap();
        assert!((isect.t - 2.5).abs() < 1e-4);
    }

    #[test]
    fn tie_on_entry_breaks_by_id() {
        // two domains with identical bounds
        let scene = sphere_scene(
            &[Vec3::new(0.0, 0.0, -5.0), Vec3::new(0.0, 0.0, -5.0)],
            -1,
            1,
        );
        let list = scene.intersect_domains(Vec3::ZERO, Vec3::NEG_Z);
        let ids: Vec<usize> = list.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 1]);
    }
}
