//! Mesh normalization applied after manifold repair.
//!
//! 1. Vertex-clustering simplification on a grid of `n_simplification_voxels` cells
//!    along the largest extent.
//! 2. Keep the largest connected component.
//! 3. Detect and cut off a ground plate by sliding the bounding box upwards.
//! 4. If a plate was cut, keep the largest component again.

use glam::DVec3;
use log::debug;

use crate::mesh::{Axis, TriMesh};

/// Clusters with this many triangles (or vertices) or fewer cannot bound a volume.
const MIN_CLUSTER_ELEMENTS: usize = 6;
/// A crop needs this many vertices to span a 3D box.
const MIN_CROP_VERTICES: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct NormalizeParams {
    /// Grid resolution used when simplifying.
    pub n_simplification_voxels: u32,
    /// Number of upward slices tried when searching for a ground plane.
    pub n_ground_plane_scan_steps: u32,
    /// Fraction of the mesh height that may be scanned.
    pub max_scan_height_fraction: f64,
    /// Volume ratio below which a crop counts as having removed a ground plane.
    pub volume_reduction_threshold: f64,
    /// Vertical axis of the mesh.
    pub up_axis: Axis,
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            n_simplification_voxels: 128,
            n_ground_plane_scan_steps: 10,
            max_scan_height_fraction: 0.15,
            volume_reduction_threshold: 0.8,
            up_axis: Axis::Y,
        }
    }
}

pub fn simplify_mesh(mesh: &TriMesh, n_simplification_voxels: u32) -> TriMesh {
    let Some(bbox) = mesh.aabb() else {
        return mesh.clone();
    };
    let voxel_size = bbox.max_extent() / n_simplification_voxels.max(1) as f64;
    mesh.simplify_vertex_clustering(voxel_size)
}

/// The connected component with the largest oriented bounding volume.
///
/// Returns the input unchanged when no component is big enough to bound a volume.
pub fn select_largest_component(mesh: &TriMesh) -> TriMesh {
    let components = mesh.connected_components();

    let mut best: Option<(f64, TriMesh)> = None;
    for (label, &n_triangles) in components.sizes.iter().enumerate() {
        if n_triangles <= MIN_CLUSTER_ELEMENTS {
            continue;
        }
        let single = mesh.component(&components, label);
        if single.vertices.len() <= MIN_CLUSTER_ELEMENTS {
            continue;
        }

        let volume = single.oriented_bounding_volume();
        // First cluster wins ties.
        if best.as_ref().map_or(true, |(v, _)| volume > *v) {
            best = Some((volume, single));
        }
    }

    match best {
        Some((_, m)) => m,
        None => mesh.clone(),
    }
}

/// Slide the bounding box up in steps and crop; a sharp drop in cropped volume means
/// a flat ground plate was cut away. Returns the cropped mesh and whether that happened.
pub fn remove_ground_plane(
    mesh: &TriMesh,
    n_scan_steps: u32,
    max_scan_height_fraction: f64,
    volume_reduction_threshold: f64,
    up: Axis,
) -> (TriMesh, bool) {
    let Some(bbox) = mesh.aabb() else {
        return (mesh.clone(), false);
    };
    if n_scan_steps == 0 {
        return (mesh.clone(), false);
    }

    let max_dy = up.component(bbox.extent()) * max_scan_height_fraction;
    let step: DVec3 = up.unit() * (max_dy / n_scan_steps as f64);
    let mut prev_volume = bbox.volume();

    for i in 1..=n_scan_steps {
        if !(prev_volume > 0.0) {
            break;
        }

        let shifted = bbox.translated(step * i as f64);
        let cropped = mesh.crop(&shifted);
        if cropped.vertices.len() < MIN_CROP_VERTICES {
            break;
        }

        let new_volume = cropped.aabb().map_or(0.0, |b| b.volume());
        if new_volume / prev_volume < volume_reduction_threshold {
            debug!(
                "Ground plane cut at step {} ({:.3} -> {:.3})",
                i, prev_volume, new_volume
            );
            return (cropped, true);
        }

        prev_volume = new_volume;
    }

    (mesh.clone(), false)
}

pub fn normalize_mesh(mesh: &TriMesh, params: &NormalizeParams) -> TriMesh {
    let simplified = simplify_mesh(mesh, params.n_simplification_voxels);
    let largest = select_largest_component(&simplified);

    let (cut, found_ground_plane) = remove_ground_plane(
        &largest,
        params.n_ground_plane_scan_steps,
        params.max_scan_height_fraction,
        params.volume_reduction_threshold,
        params.up_axis,
    );

    if found_ground_plane {
        // The cut may have detached spurious pieces.
        select_largest_component(&cut)
    } else {
        cut
    }
}
