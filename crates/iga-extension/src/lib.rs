//! Spline spaces over multi-patch topologies.
//!
//! An [`Extension`] pairs a patch topology with knot vectors and numbers the
//! mesh vertices and DOFs of the resulting tensor-product lattices. It
//! produces element and boundary DOF tables, Bezier-mesh connectivity,
//! periodic DOF identification and the refinement drivers that operate on
//! the patch form of the control net. [`ParExtension`] restricts a space to
//! one rank's elements and derives its communication groups.

pub mod extension;
pub mod merge;
pub mod mode;
pub(crate) mod patch_map;
pub mod par;
pub mod table;

pub use extension::Extension;
pub use merge::DofMerger;
pub use mode::{BdrDofPolicy, SpaceMode};
pub use par::{GroupTopology, ParExtension};
pub use table::Table;
