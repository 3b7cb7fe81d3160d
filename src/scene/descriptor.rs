//! Scene descriptor parsing.
//!
//! The descriptor is a newline-delimited token format: `domain` opens a new
//! domain, `ModelBegin`/`ModelEnd` bracket a mesh model with its material and
//! composed transform, `sphere` adds an analytic shape, `light` a light
//! source; `#` starts a comment.

use crate::common::Float;
use crate::error::{Error, Result};
use crate::scene::light::Light;
use crate::scene::material::Material;
use crate::scene::shape::Sphere;
use glam::{Mat4, Vec3};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// One mesh model of a domain.
#[derive(Clone, Debug)]
pub struct Model {
    /// Mesh file path, already joined with the configured search path.
    pub file: PathBuf,

    /// Surface material.
    pub material: Material,

    /// Object-to-world transform.
    pub transform: Mat4,
}

/// One parsed domain.
#[derive(Clone, Debug, Default)]
pub struct DomainDesc {
    /// Domain id in declaration order.
    pub id: usize,

    /// Mesh models.
    pub models: Vec<Model>,

    /// Analytic spheres.
    pub spheres: Vec<Sphere>,
}

/// The parsed descriptor.
#[derive(Clone, Debug, Default)]
pub struct SceneDesc {
    pub domains: Vec<DomainDesc>,
    pub lights: Vec<Light>,
}

/// Read and parse a descriptor file.
///
/// * `path`     - Descriptor path.
/// * `ply_path` - Search path prefixed to model file names.
pub fn load_descriptor(path: &Path, ply_path: &Path) -> Result<SceneDesc> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
    parse_descriptor(&text, ply_path)
}

struct ParseState {
    desc: SceneDesc,
    model: Option<Model>,
    ply_path: PathBuf,
}

/// Parse descriptor text.
///
/// * `text`     - Descriptor contents.
/// * `ply_path` - Search path prefixed to model file names.
pub fn parse_descriptor(text: &str, ply_path: &Path) -> Result<SceneDesc> {
    // count domains and lights up front
    let mut ndomains = 0usize;
    let mut nlights = 0usize;
    for line in text.lines() {
        match line.split_whitespace().next() {
            Some("domain") => ndomains += 1,
            Some("light") => nlights += 1,
            _ => {}
        }
    }
    if ndomains == 0 {
        return Err(Error::Config("descriptor declares no domains".to_string()));
    }
    if nlights == 0 {
        warn!("no lights detected");
    }
    info!("number of domains: {ndomains}");
    info!("number of lights: {nlights}");

    let mut state = ParseState {
        desc: SceneDesc {
            domains: Vec::with_capacity(ndomains),
            lights: Vec::with_capacity(nlights),
        },
        model: None,
        ply_path: ply_path.to_path_buf(),
    };

    for (lineno, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        parse_line(&mut state, &tokens)
            .map_err(|e| Error::Config(format!("line {}: {e}", lineno + 1)))?;
    }

    if state.model.is_some() {
        return Err(Error::Config("unterminated ModelBegin".to_string()));
    }
    Ok(state.desc)
}

fn parse_line(state: &mut ParseState, tokens: &[&str]) -> std::result::Result<(), String> {
    match tokens[0] {
        t if t.starts_with('#') => Ok(()),
        "domain" => {
            let id = state.desc.domains.len();
            state.desc.domains.push(DomainDesc {
                id,
                ..Default::default()
            });
            Ok(())
        }
        "ModelBegin" => {
            if state.model.is_some() {
                return Err("nested ModelBegin".to_string());
            }
            state.model = Some(Model {
                file: PathBuf::new(),
                material: Material::default(),
                transform: Mat4::IDENTITY,
            });
            Ok(())
        }
        "ModelEnd" => {
            let model = state.model.take().ok_or("ModelEnd without ModelBegin")?;
            if model.file.as_os_str().is_empty() {
                return Err("model has no file".to_string());
            }
            current_domain(state)?.models.push(model);
            Ok(())
        }
        "file" => {
            expect_len(tokens, 2)?;
            let model = state.model.as_mut().ok_or("file outside model block")?;
            model.file = if state.ply_path.as_os_str().is_empty() {
                PathBuf::from(tokens[1])
            } else {
                state.ply_path.join(tokens[1])
            };
            Ok(())
        }
        "material" => {
            let model = state.model.as_mut().ok_or("material outside model block")?;
            model.material = parse_material(&tokens[1..])?;
            Ok(())
        }
        "scale" => {
            expect_len(tokens, 4)?;
            let v = parse_vec3(&tokens[1..4])?;
            let model = state.model.as_mut().ok_or("scale outside model block")?;
            model.transform *= Mat4::from_scale(v);
            Ok(())
        }
        "rotate" => {
            expect_len(tokens, 3)?;
            let axis = match tokens[1] {
                "x" => Vec3::X,
                "y" => Vec3::Y,
                "z" => Vec3::Z,
                a => return Err(format!("invalid axis name {a}")),
            };
            let deg: Float = parse_num(tokens[2])?;
            let model = state.model.as_mut().ok_or("rotate outside model block")?;
            model.transform *= Mat4::from_axis_angle(axis, deg.to_radians());
            Ok(())
        }
        "translate" => {
            expect_len(tokens, 4)?;
            let v = parse_vec3(&tokens[1..4])?;
            let model = state.model.as_mut().ok_or("translate outside model block")?;
            model.transform *= Mat4::from_translation(v);
            Ok(())
        }
        "light" => {
            let light = match tokens.get(1).copied() {
                Some("point") => {
                    expect_len(tokens, 8)?;
                    Light::Point {
                        position: parse_vec3(&tokens[2..5])?,
                        radiance: parse_vec3(&tokens[5..8])?,
                    }
                }
                Some("diffuse") => {
                    expect_len(tokens, 5)?;
                    Light::DiffuseHemisphere {
                        radiance: parse_vec3(&tokens[2..5])?,
                    }
                }
                other => return Err(format!("unknown light source {other:?}")),
            };
            state.desc.lights.push(light);
            Ok(())
        }
        "sphere" => {
            if tokens.len() < 7 {
                return Err("sphere needs center, radius and material".to_string());
            }
            let center = parse_vec3(&tokens[1..4])?;
            let radius: Float = parse_num(tokens[4])?;
            let material = parse_material(&tokens[5..])?;
            current_domain(state)?.spheres.push(Sphere {
                center,
                radius,
                material,
            });
            Ok(())
        }
        tag => Err(format!("unknown tag name {tag}")),
    }
}

fn current_domain<'a>(state: &'a mut ParseState) -> std::result::Result<&'a mut DomainDesc, String> {
    state
        .desc
        .domains
        .last_mut()
        .ok_or_else(|| "record before first domain".to_string())
}

fn parse_material(tokens: &[&str]) -> std::result::Result<Material, String> {
    match tokens.first().copied() {
        Some("matte") => {
            if tokens.len() == 1 {
                Ok(Material::default())
            } else {
                expect_len(tokens, 4)?;
                Ok(Material::Matte {
                    albedo: parse_vec3(&tokens[1..4])?,
                })
            }
        }
        Some("metal") => {
            if tokens.len() == 1 {
                Ok(Material::Metal {
                    albedo: Vec3::splat(0.8),
                    fuzz: 0.0,
                })
            } else {
                expect_len(tokens, 5)?;
                Ok(Material::Metal {
                    albedo: parse_vec3(&tokens[1..4])?,
                    fuzz: parse_num(tokens[4])?,
                })
            }
        }
        Some("dielectric") => {
            if tokens.len() == 1 {
                Ok(Material::Dielectric { index: 1.5 })
            } else {
                expect_len(tokens, 2)?;
                Ok(Material::Dielectric {
                    index: parse_num(tokens[1])?,
                })
            }
        }
        other => Err(format!("unsupported material: {other:?}")),
    }
}

fn parse_vec3(tokens: &[&str]) -> std::result::Result<Vec3, String> {
    Ok(Vec3::new(
        parse_num(tokens[0])?,
        parse_num(tokens[1])?,
        parse_num(tokens[2])?,
    ))
}

fn parse_num(token: &str) -> std::result::Result<Float, String> {
    token
        .parse::<Float>()
        .map_err(|_| format!("expected number, found '{token}'"))
}

fn expect_len(tokens: &[&str], n: usize) -> std::result::Result<(), String> {
    if tokens.len() == n {
        Ok(())
    } else {
        Err(format!("expected {n} tokens, found {}", tokens.len()))
    }
}

/// Re-emit a descriptor for the tokens that round-trip. Transform tokens are
/// already composed into matrices and are not re-emitted; model file names
/// are emitted as stored (search path included).
pub fn emit_descriptor(desc: &SceneDesc) -> String {
    let mut out = String::new();
    for light in &desc.lights {
        match light {
            Light::Point { position, radiance } => {
                let _ = writeln!(
                    out,
                    "light point {} {} {} {} {} {}",
                    position.x, position.y, position.z, radiance.x, radiance.y, radiance.z
                );
            }
            Light::DiffuseHemisphere { radiance } => {
                let _ = writeln!(
                    out,
                    "light diffuse {} {} {}",
                    radiance.x, radiance.y, radiance.z
                );
            }
        }
    }
    for domain in &desc.domains {
        let _ = writeln!(out, "domain");
        for model in &domain.models {
            let _ = writeln!(out, "ModelBegin");
            let _ = writeln!(out, "file {}", model.file.display());
            emit_material(&mut out, "material", &model.material, "\n");
            let _ = writeln!(out, "ModelEnd");
        }
        for sphere in &domain.spheres {
            let _ = write!(
                out,
                "sphere {} {} {} {} ",
                sphere.center.x, sphere.center.y, sphere.center.z, sphere.radius
            );
            emit_material(&mut out, "", &sphere.material, "\n");
        }
    }
    out
}

fn emit_material(out: &mut String, prefix: &str, material: &Material, suffix: &str) {
    if !prefix.is_empty() {
        let _ = write!(out, "{prefix} ");
    }
    match material {
        Material::Matte { albedo } => {
            let _ = write!(out, "matte {} {} {}", albedo.x, albedo.y, albedo.z);
        }
        Material::Metal { albedo, fuzz } => {
            let _ = write!(out, "metal {} {} {} {}", albedo.x, albedo.y, albedo.z, fuzz);
        }
        Material::Dielectric { index } => {
            let _ = write!(out, "dielectric {index}");
        }
    }
    let _ = write!(out, "{suffix}");
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DESC: &str = "\
# two domains and a light
domain
ModelBegin
file bunny.ply
material matte 0.5 0.25 0.125
scale 2 2 2
translate 1 0 0
ModelEnd
domain
sphere 0 1 -2 0.5 metal 0.9 0.9 0.9 0.1
sphere 0 0 0 1 dielectric 1.5
light point 0 5 0 10 10 10
light diffuse 0.2 0.3 0.4
";

    #[test]
    fn parses_domains_models_and_lights() {
        let desc = parse_descriptor(DESC, Path::new("assets")).unwrap();
        assert_eq!(desc.domains.len(), 2);
        assert_eq!(desc.lights.len(), 2);

        let d0 = &desc.domains[0];
        assert_eq!(d0.models.len(), 1);
        assert_eq!(d0.models[0].file, PathBuf::from("assets/bunny.ply"));
        assert_eq!(
            d0.models[0].material,
            Material::Matte {
                albedo: Vec3::new(0.5, 0.25, 0.125)
            }
        );
        // scale then translate composed onto the model transform
        let p = d0.models[0].transform.transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!((p - Vec3::new(4.0, 0.0, 0.0)).length() < 1e-5);

        let d1 = &desc.domains[1];
        assert_eq!(d1.spheres.len(), 2);
        assert_eq!(
            d1.spheres[1].material,
            Material::Dielectric { index: 1.5 }
        );
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let desc = parse_descriptor("# hi\n\ndomain\nsphere 0 0 0 1 matte 1 1 1\n", Path::new(""))
            .unwrap();
        assert_eq!(desc.domains.len(), 1);
    }

    #[test]
    fn unknown_tag_is_config_error() {
        let err = parse_descriptor("domain\nbogus 1 2 3\n", Path::new("")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn no_domains_is_config_error() {
        assert!(parse_descriptor("light point 0 0 0 1 1 1\n", Path::new("")).is_err());
    }

    #[test]
    fn emit_round_trips() {
        let first = parse_descriptor(DESC, Path::new("assets")).unwrap();
        let second = parse_descriptor(&emit_descriptor(&first), Path::new("")).unwrap();
        assert_eq!(first.domains.len(), second.domains.len());
        assert_eq!(first.lights, second.lights);
        for (a, b) in first.domains.iter().zip(&second.domains) {
            assert_eq!(a.models.len(), b.models.len());
            for (ma, mb) in a.models.iter().zip(&b.models) {
                assert_eq!(ma.file, mb.file);
                assert_eq!(ma.material, mb.material);
            }
            assert_eq!(a.spheres, b.spheres);
        }
    }
}
