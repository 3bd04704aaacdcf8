use serde::{Deserialize, Serialize};

/// Which finite-element space the DOF tables are laid out for.
///
/// `HDiv` and `HCurl` extensions hold one vector component each; their
/// boundary tables drop or sign-flip DOFs depending on the component's
/// order pattern and the boundary face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpaceMode {
    #[default]
    Scalar,
    HDiv,
    HCurl,
}

/// Whether boundary DOFs exist for a boundary patch and the sign they carry.
#[derive(Debug, Clone, Copy)]
pub struct BdrDofPolicy {
    pub add_dofs: bool,
    pub sign: isize,
}

/// Reference faces whose outward normal opposes the parametric axes. Normal
/// components on them pick up a sign flip.
const FLIP_EDGES_2D: [usize; 2] = [0, 2];
const FLIP_FACES_3D: [usize; 3] = [0, 1, 4];

impl SpaceMode {
    /// Policy for a 2D boundary segment. `local_face` is the boundary edge's
    /// index within its patch, `ord0` the order along the segment and
    /// `max_order` the largest order over all knot vectors.
    pub fn bdr_policy_2d(self, local_face: usize, ord0: usize, max_order: usize) -> BdrDofPolicy {
        let mut p = BdrDofPolicy {
            add_dofs: true,
            sign: 1,
        };
        match self {
            SpaceMode::Scalar => {}
            SpaceMode::HDiv => {
                if ord0 == max_order {
                    p.add_dofs = false;
                }
                if FLIP_EDGES_2D.contains(&local_face) {
                    p.sign = -1;
                }
            }
            SpaceMode::HCurl => {
                if ord0 == max_order {
                    p.add_dofs = false;
                }
            }
        }
        p
    }

    /// Policy for a 3D boundary quad. `ord0`/`ord1` are the orders along the
    /// two boundary directions.
    pub fn bdr_policy_3d(self, local_face: usize, ord0: usize, ord1: usize) -> BdrDofPolicy {
        let mut p = BdrDofPolicy {
            add_dofs: true,
            sign: 1,
        };
        match self {
            SpaceMode::Scalar => {}
            SpaceMode::HDiv => {
                if ord0 != ord1 {
                    p.add_dofs = false;
                }
                if FLIP_FACES_3D.contains(&local_face) {
                    p.sign = -1;
                }
            }
            SpaceMode::HCurl => {
                if ord0 == ord1 {
                    p.add_dofs = false;
                }
            }
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_mode_always_adds_unsigned_dofs() {
        let p = SpaceMode::Scalar.bdr_policy_2d(0, 3, 3);
        assert!(p.add_dofs);
        assert_eq!(p.sign, 1);
    }

    #[test]
    fn hdiv_drops_tangential_components_in_2d() {
        // Normal component has the raised order.
        assert!(SpaceMode::HDiv.bdr_policy_2d(1, 2, 3).add_dofs);
        assert!(!SpaceMode::HDiv.bdr_policy_2d(1, 3, 3).add_dofs);
        assert_eq!(SpaceMode::HDiv.bdr_policy_2d(0, 2, 3).sign, -1);
        assert_eq!(SpaceMode::HDiv.bdr_policy_2d(1, 2, 3).sign, 1);
    }

    #[test]
    fn hdiv_and_hcurl_split_on_order_pattern_in_3d() {
        assert!(SpaceMode::HDiv.bdr_policy_3d(2, 2, 2).add_dofs);
        assert!(!SpaceMode::HDiv.bdr_policy_3d(2, 2, 3).add_dofs);
        assert!(SpaceMode::HCurl.bdr_policy_3d(2, 2, 3).add_dofs);
        assert!(!SpaceMode::HCurl.bdr_policy_3d(2, 2, 2).add_dofs);
        assert_eq!(SpaceMode::HDiv.bdr_policy_3d(4, 2, 2).sign, -1);
        assert_eq!(SpaceMode::HDiv.bdr_policy_3d(5, 2, 2).sign, 1);
    }
}
