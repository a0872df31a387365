//! OBJ / PLY mesh I/O.
//!
//! Inputs may be plain `.obj`, gzip-compressed `.obj.gz`, or a `.zip` holding an `.obj`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use glam::DVec3;
use log::debug;

use crate::error::{Error, IoContext, Result};
use crate::mesh::TriMesh;

/// On-disk mesh encodings the tools can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    Obj,
    Ply,
}

impl MeshFormat {
    pub fn extension(self) -> &'static str {
        match self {
            MeshFormat::Obj => "obj",
            MeshFormat::Ply => "ply",
        }
    }
}

fn parse_index(token: &str, vertex_count: usize, line: usize) -> Result<u32> {
    let raw = token.split('/').next().unwrap_or("");
    let idx: i64 = raw.parse().map_err(|_| Error::Obj {
        line,
        msg: format!("bad face index '{}'", token),
    })?;

    // OBJ indices are 1-based; negative values count back from the last vertex.
    let resolved = if idx > 0 {
        idx - 1
    } else if idx < 0 {
        vertex_count as i64 + idx
    } else {
        -1
    };

    if resolved < 0 || resolved >= vertex_count as i64 {
        return Err(Error::Obj {
            line,
            msg: format!("face index {} out of range ({} vertices)", idx, vertex_count),
        });
    }

    Ok(resolved as u32)
}

/// Read vertices and faces from an OBJ stream. Polygons are fan-triangulated.
pub fn parse_obj<R: Read>(reader: R) -> Result<TriMesh> {
    let mut mesh = TriMesh::default();
    let mut face: Vec<u32> = Vec::with_capacity(8);

    for (line_no, line_result) in BufReader::new(reader).lines().enumerate() {
        let line = line_result?;
        let trimmed = line.trim();
        let line_no = line_no + 1;

        let mut parts = trimmed.split_whitespace();
        match parts.next() {
            Some("v") => {
                let mut xyz = [0.0f64; 3];
                for c in xyz.iter_mut() {
                    *c = parts
                        .next()
                        .and_then(|s| s.parse().ok())
                        .filter(|v: &f64| v.is_finite())
                        .ok_or_else(|| Error::Obj {
                            line: line_no,
                            msg: "vertex needs three finite coordinates".into(),
                        })?;
                }
                mesh.vertices.push(DVec3::from_array(xyz));
            }
            Some("f") => {
                face.clear();
                for token in parts {
                    face.push(parse_index(token, mesh.vertices.len(), line_no)?);
                }
                if face.len() < 3 {
                    return Err(Error::Obj {
                        line: line_no,
                        msg: "face with fewer than three vertices".into(),
                    });
                }
                for k in 1..face.len() - 1 {
                    mesh.triangles.push([face[0], face[k], face[k + 1]]);
                }
            }
            // Normals, texture coordinates, groups, materials: not needed.
            _ => {}
        }
    }

    Ok(mesh)
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_ascii_lowercase().ends_with(suffix))
        .unwrap_or(false)
}

/// Load a triangle mesh from `.obj`, `.obj.gz` or a `.zip` containing an `.obj`.
pub fn load_mesh(path: &Path) -> Result<TriMesh> {
    let file = File::open(path).at(path)?;

    if has_suffix(path, ".gz") {
        debug!("Opening gzip OBJ {}", path.display());
        parse_obj(GzDecoder::new(file))
    } else if has_suffix(path, ".zip") {
        debug!("Opening ZIP archive {}", path.display());
        let mut archive = zip::ZipArchive::new(file)?;

        let obj_name = archive
            .file_names()
            .find(|n| n.to_ascii_lowercase().ends_with(".obj"))
            .ok_or_else(|| Error::NoObjInArchive(path.to_path_buf()))?
            .to_owned();

        debug!("Found OBJ file in ZIP: {}", obj_name);
        let obj_file = archive.by_name(&obj_name)?;
        parse_obj(obj_file)
    } else {
        parse_obj(file)
    }
}

pub fn write_obj<W: Write>(w: &mut W, mesh: &TriMesh) -> std::io::Result<()> {
    for v in &mesh.vertices {
        writeln!(w, "v {} {} {}", v.x, v.y, v.z)?;
    }
    for t in &mesh.triangles {
        writeln!(w, "f {} {} {}", t[0] + 1, t[1] + 1, t[2] + 1)?;
    }
    w.flush()
}

/// ASCII PLY with double-precision vertices.
pub fn write_ply<W: Write>(w: &mut W, mesh: &TriMesh) -> std::io::Result<()> {
    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "element vertex {}", mesh.vertices.len())?;
    writeln!(w, "property double x")?;
    writeln!(w, "property double y")?;
    writeln!(w, "property double z")?;
    writeln!(w, "element face {}", mesh.triangles.len())?;
    writeln!(w, "property list uchar int vertex_indices")?;
    writeln!(w, "end_header")?;

    for v in &mesh.vertices {
        writeln!(w, "{} {} {}", v.x, v.y, v.z)?;
    }
    for t in &mesh.triangles {
        writeln!(w, "3 {} {} {}", t[0], t[1], t[2])?;
    }
    w.flush()
}

pub fn save_mesh(path: &Path, mesh: &TriMesh, format: MeshFormat) -> Result<()> {
    let mut out = BufWriter::new(File::create(path).at(path)?);
    let written = match format {
        MeshFormat::Obj => write_obj(&mut out, mesh),
        MeshFormat::Ply => write_ply(&mut out, mesh),
    };
    written.at(path)
}

/// Write a gzip-compressed OBJ.
pub fn save_obj_gz(path: &Path, mesh: &TriMesh) -> Result<()> {
    let file = File::create(path).at(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    write_obj(&mut encoder, mesh).at(path)?;
    encoder.finish().at(path)?.flush().at(path)
}
