//! PLY mesh loading.

use crate::common::{pack_color, Float};
use crate::error::{Error, Result};
use glam::Vec3;
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Property};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// A triangle mesh as read from disk, in object space.
#[derive(Debug)]
pub struct PlyMesh {
    /// Vertex positions.
    pub vertices: Vec<Vec3>,

    /// Triangle vertex indices.
    pub faces: Vec<[u32; 3]>,

    /// Packed per-vertex colors when the file carries them.
    pub colors: Option<Vec<u32>>,
}

/// Parse a PLY file. Faces with more than three vertices are fanned into
/// triangles; per-vertex `red`/`green`/`blue` properties are kept when every
/// vertex has them.
///
/// * `path` - File path.
pub fn load_ply(path: &Path) -> Result<PlyMesh> {
    let file = File::open(path)
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
    let mut reader = BufReader::new(file);

    let parser = Parser::<DefaultElement>::new();
    let ply = parser.read_ply(&mut reader).map_err(|e| {
        Error::Config(format!("unable to parse PLY file '{}': {e}", path.display()))
    })?;

    let mut vertices: Vec<Vec3> = Vec::new();
    let mut colors: Vec<u32> = Vec::new();
    let mut has_colors = true;
    let mut faces: Vec<[u32; 3]> = Vec::new();

    for (name, list) in ply.payload.iter() {
        match name.as_ref() {
            "vertex" => {
                for elem in list.iter() {
                    let x = float_prop(elem, "x");
                    let y = float_prop(elem, "y");
                    let z = float_prop(elem, "z");
                    match (x, y, z) {
                        (Some(x), Some(y), Some(z)) => vertices.push(Vec3::new(x, y, z)),
                        _ => {
                            return Err(Error::Config(format!(
                                "vertex without x/y/z in '{}'",
                                path.display()
                            )))
                        }
                    }
                    let rgb = (
                        byte_prop(elem, "red"),
                        byte_prop(elem, "green"),
                        byte_prop(elem, "blue"),
                    );
                    if let (Some(r), Some(g), Some(b)) = rgb {
                        if has_colors {
                            colors.push(pack_color(Vec3::new(
                                r as Float / 255.0,
                                g as Float / 255.0,
                                b as Float / 255.0,
                            )));
                        }
                    } else {
                        has_colors = false;
                    }
                }
            }
            "face" => {
                for elem in list.iter() {
                    let idx = index_list(elem).ok_or_else(|| {
                        Error::Config(format!("face without vertex indices in '{}'", path.display()))
                    })?;
                    for i in 2..idx.len() {
                        faces.push([idx[0], idx[i - 1], idx[i]]);
                    }
                }
            }
            s => warn!("ignoring unexpected element '{}' in '{}'", s, path.display()),
        }
    }

    if vertices.is_empty() || faces.is_empty() {
        return Err(Error::Config(format!(
            "PLY file '{}' has no vertices or faces",
            path.display()
        )));
    }

    let colors = (has_colors && colors.len() == vertices.len()).then_some(colors);
    Ok(PlyMesh {
        vertices,
        faces,
        colors,
    })
}

fn float_prop(elem: &DefaultElement, key: &str) -> Option<Float> {
    match elem.get(key)? {
        Property::Float(v) => Some(*v),
        Property::Double(v) => Some(*v as Float),
        _ => None,
    }
}

fn byte_prop(elem: &DefaultElement, key: &str) -> Option<u8> {
    match elem.get(key)? {
        Property::UChar(v) => Some(*v),
        Property::Char(v) => Some(*v as u8),
        _ => None,
    }
}

fn index_list(elem: &DefaultElement) -> Option<Vec<u32>> {
    let prop = elem.get("vertex_indices").or_else(|| elem.get("vertex_index"))?;
    match prop {
        Property::ListInt(v) => Some(v.iter().map(|&i| i as u32).collect()),
        Property::ListUInt(v) => Some(v.clone()),
        Property::ListShort(v) => Some(v.iter().map(|&i| i as u32).collect()),
        Property::ListUShort(v) => Some(v.iter().map(|&i| i as u32).collect()),
        Property::ListUChar(v) => Some(v.iter().map(|&i| i as u32).collect()),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, body: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("distray_ply_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_ascii_triangle() {
        let path = write_temp(
            "tri.ply",
            "ply\nformat ascii 1.0\nelement vertex 3\n\
             property float x\nproperty float y\nproperty float z\n\
             element face 1\nproperty list uchar int vertex_indices\n\
             end_header\n\
             0 0 0\n1 0 0\n0 1 0\n\
             3 0 1 2\n",
        );
        let mesh = load_ply(&path).unwrap();
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.faces, vec![[0, 1, 2]]);
        assert!(mesh.colors.is_none());
    }

    #[test]
    fn fans_quads_and_keeps_colors() {
        let path = write_temp(
            "quad.ply",
            "ply\nformat ascii 1.0\nelement vertex 4\n\
             property float x\nproperty float y\nproperty float z\n\
             property uchar red\nproperty uchar green\nproperty uchar blue\n\
             element face 1\nproperty list uchar int vertex_indices\n\
             end_header\n\
             0 0 0 255 0 0\n1 0 0 255 0 0\n1 1 0 255 0 0\n0 1 0 255 0 0\n\
             4 0 1 2 3\n",
        );
        let mesh = load_ply(&path).unwrap();
        assert_eq!(mesh.faces.len(), 2);
        let colors = mesh.colors.unwrap();
        assert_eq!(colors.len(), 4);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_ply(Path::new("/nonexistent/distray.ply")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
