//! B-spline and NURBS primitives for isogeometric analysis.
//!
//! The building blocks are [`KnotVector`] (univariate basis: evaluation,
//! refinement, elevation) and [`Patch`] (tensor-product control grid in
//! homogeneous coordinates, dimensions 1 to 3). Optional [`SpacingRule`]s
//! attach to knot vectors and steer non-uniform refinement.

pub mod knot;
pub mod patch;
pub mod spacing;

pub use knot::KnotVector;
pub use patch::{interpolate, revolve_3d, Patch};
pub use spacing::{SpacingHandle, SpacingRule};
