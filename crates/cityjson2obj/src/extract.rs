use cityprep::cityjson::{append_mesh, geometry_mesh, CityJson, CityObject};
use cityprep::TriMesh;
use glam::DVec3;
use hashbrown::HashSet;

pub const BUILDING_PART: &str = "BuildingPart";

/// File-system safe stem for a CityObject id (`DEBE:123/a` -> `DEBE_123_a`).
pub fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

/// A BuildingPart whose parent is itself selected; its geometry goes into the parent's mesh.
fn merged_into_parent(doc: &CityJson, obj: &CityObject, types: &[String]) -> bool {
    obj.kind == BUILDING_PART
        && obj.parents.iter().any(|p| {
            doc.city_objects
                .get(p)
                .map_or(false, |parent| types.contains(&parent.kind))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection<'a> {
    pub id: &'a str,
    pub file_stem: String,
}

/// Objects to write, each with a file stem not yet in `used`.
///
/// `used` is shared by all documents of a run, so ids from different tiles that
/// sanitize to the same stem still get distinct files.
pub fn select_objects<'a>(
    doc: &'a CityJson,
    types: &'a [String],
    merge_parts: bool,
    used: &mut HashSet<String>,
) -> Vec<Selection<'a>> {
    let mut selected = Vec::new();

    for (id, obj) in doc.objects_of_type(types) {
        if merge_parts && merged_into_parent(doc, obj, types) {
            continue;
        }
        let base = sanitize_id(id);
        let mut stem = base.clone();
        let mut n = 1;
        while !used.insert(stem.clone()) {
            stem = format!("{}_{}", base, n);
            n += 1;
        }
        selected.push(Selection { id, file_stem: stem });
    }

    selected
}

/// Mesh of one object; with `merge_parts`, its BuildingPart children are appended.
/// Empty when nothing has surface geometry at the requested LoD.
pub fn object_mesh(
    doc: &CityJson,
    vertices: &[DVec3],
    id: &str,
    lod: Option<f64>,
    merge_parts: bool,
) -> cityprep::Result<TriMesh> {
    let Some(obj) = doc.city_objects.get(id) else {
        return Ok(TriMesh::default());
    };

    let mut mesh = match obj.select_geometry(lod) {
        Some(geometry) => geometry_mesh(vertices, geometry)?,
        None => TriMesh::default(),
    };

    if merge_parts {
        for child_id in &obj.children {
            let Some(child) = doc.city_objects.get(child_id) else {
                continue;
            };
            if child.kind != BUILDING_PART {
                continue;
            }
            if let Some(geometry) = child.select_geometry(lod) {
                append_mesh(&mut mesh, &geometry_mesh(vertices, geometry)?);
            }
        }
    }

    Ok(mesh)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const DOC: &str = r#"{
      "type": "CityJSON",
      "version": "2.0",
      "transform": { "scale": [0.01, 0.01, 0.01], "translate": [0.0, 0.0, 0.0] },
      "CityObjects": {
        "DEBE:0001": {
          "type": "Building",
          "children": ["DEBE:0001/part"],
          "geometry": [{ "type": "Solid", "lod": "2", "boundaries": [[
            [[0, 3, 2, 1]], [[4, 5, 6, 7]],
            [[0, 1, 5, 4]], [[1, 2, 6, 5]],
            [[2, 3, 7, 6]], [[3, 0, 4, 7]]
          ]] }]
        },
        "DEBE:0001/part": {
          "type": "BuildingPart",
          "parents": ["DEBE:0001"],
          "geometry": [{ "type": "MultiSurface", "lod": "2", "boundaries": [[[4, 5, 8]]] }]
        },
        "DEBE_0001_part": { "type": "Building", "geometry": [] },
        "bridge": {
          "type": "Bridge",
          "geometry": [{ "type": "MultiSurface", "lod": "2", "boundaries": [[[0, 1, 2]]] }]
        }
      },
      "vertices": [
        [0, 0, 0], [1000, 0, 0], [1000, 1000, 0], [0, 1000, 0],
        [0, 0, 500], [1000, 0, 500], [1000, 1000, 500], [0, 1000, 500],
        [500, 500, 800]
      ]
    }"#;

    fn types() -> Vec<String> {
        vec!["Building".into(), BUILDING_PART.into()]
    }

    #[test]
    fn sanitizes_ids() {
        assert_eq!(sanitize_id("DEBE:0001/part"), "DEBE_0001_part");
        assert_eq!(sanitize_id("../etc"), "_etc");
        assert_eq!(sanitize_id(""), "_");
        assert_eq!(sanitize_id("a b.c"), "a_b.c");
    }

    #[test]
    fn selection_dedupes_stems() {
        let doc = CityJson::from_reader(DOC.as_bytes()).unwrap();
        let types = types();
        let sel = select_objects(&doc, &types, false, &mut HashSet::new());
        let stems: Vec<&str> = sel.iter().map(|s| s.file_stem.as_str()).collect();
        assert_eq!(stems, ["DEBE_0001", "DEBE_0001_part", "DEBE_0001_part_1"]);
        assert_eq!(sel[1].id, "DEBE:0001/part");
    }

    #[test]
    fn stems_stay_unique_across_documents() {
        let doc = CityJson::from_reader(DOC.as_bytes()).unwrap();
        let types = types();
        let mut used = HashSet::new();
        let first = select_objects(&doc, &types, false, &mut used);
        let second = select_objects(&doc, &types, false, &mut used);
        assert_eq!(first[0].file_stem, "DEBE_0001");
        assert_eq!(second[0].file_stem, "DEBE_0001_1");
        assert_eq!(used.len(), 6);
    }

    #[test]
    fn merge_parts_folds_children_into_parent() {
        let doc = CityJson::from_reader(DOC.as_bytes()).unwrap();
        let types = types();
        let sel = select_objects(&doc, &types, true, &mut HashSet::new());
        let ids: Vec<&str> = sel.iter().map(|s| s.id).collect();
        assert_eq!(ids, ["DEBE:0001", "DEBE_0001_part"]);

        let vertices = doc.decoded_vertices();
        let alone = object_mesh(&doc, &vertices, "DEBE:0001", None, false).unwrap();
        let merged = object_mesh(&doc, &vertices, "DEBE:0001", None, true).unwrap();
        assert_eq!(alone.triangles.len(), 12);
        assert_eq!(merged.triangles.len(), 13);
        assert!((merged.aabb().unwrap().max.z - 8.0).abs() < 1e-9);
    }

    #[test]
    fn missing_geometry_is_empty() {
        let doc = CityJson::from_reader(DOC.as_bytes()).unwrap();
        let vertices = doc.decoded_vertices();
        assert!(object_mesh(&doc, &vertices, "DEBE_0001_part", None, false)
            .unwrap()
            .is_empty());
        assert!(object_mesh(&doc, &vertices, "DEBE:0001", Some(1.0), false)
            .unwrap()
            .is_empty());
    }
}
