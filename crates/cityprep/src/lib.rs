//! Shared plumbing for the city-model preparation tools.
//!
//! The pipeline runs per stage, each stage being one binary crate:
//!   download → unzip → CityGML→CityJSON → CityJSON→mesh → close/normalize → voxelize → occupancy
//!
//! This crate holds what those binaries have in common: the triangle mesh and its
//! clean-up operations, OBJ/PLY/CityJSON I/O, launching external tools (Docker,
//! ManifoldPlus, binvox) and running a directory of files as a parallel batch.

pub mod batch;
pub mod cityjson;
pub mod contains;
pub mod error;
pub mod mesh;
pub mod normalize;
pub mod obj;
pub mod scratch;
pub mod tool;
pub mod triangulate;

pub use error::{Error, Result};
pub use mesh::{Aabb, Axis, TriMesh};
