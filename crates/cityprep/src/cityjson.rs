//! Minimal CityJSON model: enough to pull building shells out as triangle meshes.
//!
//! Supports CityJSON 1.0 to 2.0: integer vertices with a `transform`, or plain float
//! vertices; `lod` as number (1.0) or string (1.1+). Boundaries are nested index
//! arrays whose depth depends on the geometry type:
//!
//!   MultiSurface / CompositeSurface : [surface][ring][vertex]
//!   Solid                           : [shell][surface][ring][vertex]
//!   MultiSolid / CompositeSolid     : [solid][shell][surface][ring][vertex]
//!
//! Only the outer ring (index 0) of each surface is meshed.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use glam::DVec3;
use hashbrown::HashMap;
use serde::Deserialize;

use crate::error::{Error, IoContext, Result};
use crate::mesh::TriMesh;
use crate::triangulate::triangulate_ring;

type Surface = Vec<Vec<usize>>;

#[derive(Debug, Clone, Deserialize)]
pub struct Transform {
    pub scale: [f64; 3],
    pub translate: [f64; 3],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Lod {
    Number(f64),
    Text(String),
}

impl Lod {
    /// Numeric level (`"2.2"` → 2.2); `None` for unparsable strings.
    pub fn value(&self) -> Option<f64> {
        match self {
            Lod::Number(v) => Some(*v),
            Lod::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub lod: Option<Lod>,
    #[serde(default)]
    pub boundaries: serde_json::Value,
}

impl Geometry {
    /// Whether this geometry type carries surfaces.
    pub fn has_surfaces(&self) -> bool {
        matches!(
            self.kind.as_str(),
            "MultiSurface" | "CompositeSurface" | "Solid" | "MultiSolid" | "CompositeSolid"
        )
    }

    /// All surfaces of the geometry, flattened across shells and solids.
    pub fn surfaces(&self) -> Result<Vec<Surface>> {
        let b = &self.boundaries;
        let bad = |e: serde_json::Error| {
            Error::CityJson(format!("{} boundaries: {}", self.kind, e))
        };

        Ok(match self.kind.as_str() {
            "MultiSurface" | "CompositeSurface" => Vec::<Surface>::deserialize(b).map_err(bad)?,
            "Solid" => Vec::<Vec<Surface>>::deserialize(b)
                .map_err(bad)?
                .into_iter()
                .flatten()
                .collect(),
            "MultiSolid" | "CompositeSolid" => Vec::<Vec<Vec<Surface>>>::deserialize(b)
                .map_err(bad)?
                .into_iter()
                .flatten()
                .flatten()
                .collect(),
            _ => Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CityObject {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub geometry: Vec<Geometry>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl CityObject {
    /// The geometry to mesh: exact `lod` match when given, otherwise the highest LoD.
    pub fn select_geometry(&self, lod: Option<f64>) -> Option<&Geometry> {
        let candidates = self.geometry.iter().filter(|g| g.has_surfaces());
        match lod {
            Some(want) => {
                let mut candidates = candidates;
                candidates.find(|g| g.lod.as_ref().and_then(Lod::value) == Some(want))
            }
            None => candidates.max_by(|a, b| {
                let la = a.lod.as_ref().and_then(Lod::value).unwrap_or(f64::NEG_INFINITY);
                let lb = b.lod.as_ref().and_then(Lod::value).unwrap_or(f64::NEG_INFINITY);
                la.total_cmp(&lb)
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CityJson {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(rename = "CityObjects")]
    pub city_objects: BTreeMap<String, CityObject>,
    pub vertices: Vec<[f64; 3]>,
}

impl CityJson {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let doc: CityJson = serde_json::from_reader(reader)?;
        if doc.kind != "CityJSON" {
            return Err(Error::CityJson(format!("unexpected type '{}'", doc.kind)));
        }
        Ok(doc)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).at(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Real-world vertex coordinates (transform applied when present).
    pub fn decoded_vertices(&self) -> Vec<DVec3> {
        match &self.transform {
            Some(t) => {
                let scale = DVec3::from_array(t.scale);
                let translate = DVec3::from_array(t.translate);
                self.vertices
                    .iter()
                    .map(|&v| DVec3::from_array(v) * scale + translate)
                    .collect()
            }
            None => self.vertices.iter().map(|&v| DVec3::from_array(v)).collect(),
        }
    }

    /// Ids of objects whose type is listed in `types`.
    pub fn objects_of_type<'a>(
        &'a self,
        types: &'a [String],
    ) -> impl Iterator<Item = (&'a String, &'a CityObject)> + 'a {
        self.city_objects
            .iter()
            .filter(move |(_, o)| types.iter().any(|t| t == &o.kind))
    }
}

/// Triangulate the surfaces of one geometry into a compact mesh.
pub fn geometry_mesh(vertices: &[DVec3], geometry: &Geometry) -> Result<TriMesh> {
    let mut mesh = TriMesh::default();
    // Document vertex index -> mesh vertex index.
    let mut local: HashMap<usize, u32> = HashMap::new();
    let mut ring_pts: Vec<DVec3> = Vec::new();

    for surface in geometry.surfaces()? {
        let Some(outer) = surface.first() else {
            continue;
        };

        ring_pts.clear();
        for &i in outer {
            let v = vertices.get(i).ok_or_else(|| {
                Error::CityJson(format!(
                    "vertex index {} out of range ({} vertices)",
                    i,
                    vertices.len()
                ))
            })?;
            ring_pts.push(*v);
        }

        for tri in triangulate_ring(&ring_pts) {
            let mut out = [0u32; 3];
            for (slot, k) in out.iter_mut().zip(tri) {
                let global = outer[k];
                *slot = *local.entry(global).or_insert_with(|| {
                    mesh.vertices.push(vertices[global]);
                    (mesh.vertices.len() - 1) as u32
                });
            }
            mesh.triangles.push(out);
        }
    }

    Ok(mesh)
}

/// Append `other` to `mesh` without welding vertices.
pub fn append_mesh(mesh: &mut TriMesh, other: &TriMesh) {
    let base = mesh.vertices.len() as u32;
    mesh.vertices.extend_from_slice(&other.vertices);
    mesh.triangles.extend(
        other
            .triangles
            .iter()
            .map(|t| [t[0] + base, t[1] + base, t[2] + base]),
    );
}
