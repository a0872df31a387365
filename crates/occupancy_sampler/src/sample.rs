//! Uniform point sampling around a shape and inside/outside labelling.

use cityprep::contains::contains_points;
use cityprep::TriMesh;
use glam::DVec3;
use rand::Rng;
use voxgrid::{f16, VoxelGrid};

/// Axis-aligned cube the points are drawn from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleCube {
    pub center: DVec3,
    pub side: f64,
}

impl SampleCube {
    /// Cube centred on the box `[min, max]`, side `max_extent * (1 + padding)`.
    pub fn around(min: DVec3, max: DVec3, padding: f64) -> Self {
        Self {
            center: (min + max) * 0.5,
            side: (max - min).max_element() * (1.0 + padding),
        }
    }

    pub fn of_grid(grid: &VoxelGrid, padding: f64) -> Self {
        let (min, max) = grid.bounds();
        Self::around(DVec3::from_array(min), DVec3::from_array(max), padding)
    }

    /// World position of a point stored relative to the centre.
    #[inline]
    pub fn world(&self, p: &[f16; 3]) -> DVec3 {
        self.center + DVec3::new(p[0].to_f64(), p[1].to_f64(), p[2].to_f64())
    }
}

/// `n` uniform points in the cube, relative to its centre and rounded to float16.
///
/// Labels are computed from the rounded values, so they match what is stored.
pub fn sample_points<R: Rng>(rng: &mut R, cube: &SampleCube, n: usize) -> Vec<[f16; 3]> {
    (0..n)
        .map(|_| {
            let u = DVec3::new(rng.gen(), rng.gen(), rng.gen());
            let p = (u - 0.5) * cube.side;
            [f16::from_f64(p.x), f16::from_f64(p.y), f16::from_f64(p.z)]
        })
        .collect()
}

/// Occupancy by voxel lookup; points outside the grid are empty.
pub fn voxel_occupancy(grid: &VoxelGrid, cube: &SampleCube, points: &[[f16; 3]]) -> Vec<bool> {
    points
        .iter()
        .map(|p| grid.is_occupied_at(cube.world(p).to_array()))
        .collect()
}

/// Occupancy by ray-parity containment against the mesh.
pub fn mesh_occupancy(mesh: &TriMesh, cube: &SampleCube, points: &[[f16; 3]]) -> Vec<bool> {
    let world: Vec<DVec3> = points.iter().map(|p| cube.world(p)).collect();
    contains_points(mesh, &world)
}

/// FNV-1a, used to give each file its own stream from one `--seed`.
pub fn name_hash(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
