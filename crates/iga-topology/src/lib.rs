//! Coarse patch-level topology for multi-patch NURBS meshes.
//!
//! A [`PatchTopology`] is the connectivity graph of the patch mesh: vertices,
//! edges, faces and patch elements with boundary attributes. It answers the
//! adjacency and orientation queries the DOF-numbering layer needs and maps
//! every edge into its unique-knot-vector class. Geometry never lives here;
//! this crate is a pure index oracle.

pub mod ordering;
pub mod topology;

pub use ordering::quad_orientation;
pub use topology::{Element, PatchTopology};
