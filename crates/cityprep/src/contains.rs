//! Point-in-mesh tests by ray-crossing parity.

use glam::DVec3;
use rayon::prelude::*;

use crate::mesh::TriMesh;

const EPS: f64 = 1e-12;

/// Skewed ray direction; axis-aligned rays graze shared edges of axis-aligned walls.
fn ray_direction() -> DVec3 {
    DVec3::new(0.5377, 0.7131, 0.4501).normalize()
}

/// Möller-Trumbore; returns `true` for a hit in front of the origin.
#[inline]
fn ray_hits(origin: DVec3, dir: DVec3, [a, b, c]: [DVec3; 3]) -> bool {
    let e1 = b - a;
    let e2 = c - a;
    let p = dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPS {
        return false;
    }
    let inv = 1.0 / det;
    let s = origin - a;
    let u = s.dot(p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return false;
    }
    let q = s.cross(e1);
    let v = dir.dot(q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return false;
    }
    e2.dot(q) * inv > EPS
}

/// Whether `p` lies inside the closed surface `mesh`.
pub fn contains_point(mesh: &TriMesh, p: DVec3) -> bool {
    let dir = ray_direction();
    let crossings = (0..mesh.triangles.len())
        .filter(|&i| ray_hits(p, dir, mesh.triangle(i)))
        .count();
    crossings % 2 == 1
}

/// Containment for many points, in parallel. Points outside the bounding box are outside.
pub fn contains_points(mesh: &TriMesh, points: &[DVec3]) -> Vec<bool> {
    let Some(bbox) = mesh.aabb() else {
        return vec![false; points.len()];
    };

    points
        .par_iter()
        .map(|&p| bbox.contains(p) && contains_point(mesh, p))
        .collect()
}
