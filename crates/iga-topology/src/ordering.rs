//! Local vertex/edge/face orderings for the supported patch shapes.
//!
//! Patches are segments (1D), quadrilaterals (2D) or hexahedra (3D). The
//! reference quad has vertices (0,0), (1,0), (1,1), (0,1); the reference hex
//! adds the same square at the top. Edge lists are chosen so that every edge
//! of a hex runs in the +x/+y/+z direction of its class, while the quad's top
//! and left edges run backwards; the knot-class consistency checks depend on
//! exactly these traversal directions.

/// Geometry tags used by the text format.
pub const GEOM_POINT: usize = 0;
pub const GEOM_SEGMENT: usize = 1;
pub const GEOM_QUAD: usize = 3;
pub const GEOM_HEX: usize = 5;

/// Local edges of the reference quad, as (from, to) vertex pairs.
pub const QUAD_EDGES: [[usize; 2]; 4] = [[0, 1], [1, 2], [2, 3], [3, 0]];

/// Local edges of the reference hex.
pub const HEX_EDGES: [[usize; 2]; 12] = [
    [0, 1],
    [1, 2],
    [3, 2],
    [0, 3],
    [4, 5],
    [5, 6],
    [7, 6],
    [4, 7],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
];

/// Local faces of the reference hex: bottom, front, right, back, left, top.
pub const HEX_FACES: [[usize; 4]; 6] = [
    [3, 2, 1, 0],
    [0, 1, 5, 4],
    [1, 2, 6, 5],
    [2, 3, 7, 6],
    [3, 0, 4, 7],
    [4, 5, 6, 7],
];

/// Edge groups per parametric direction: the quad/hex edges carrying the same
/// knot vector, paired with the sign of their traversal along that direction.
pub const QUAD_EDGE_GROUPS: [[(usize, i32); 2]; 2] = [[(0, 1), (2, -1)], [(1, 1), (3, -1)]];
pub const HEX_EDGE_GROUPS: [[(usize, i32); 4]; 3] = [
    [(0, 1), (2, 1), (4, 1), (6, 1)],
    [(1, 1), (3, 1), (5, 1), (7, 1)],
    [(8, 1), (9, 1), (10, 1), (11, 1)],
];

/// Orientation code (0..8) of `test` relative to `base`, two listings of the
/// same quadrilateral. Even codes are rotations, odd codes reflections; code
/// 0 is the identity. `None` when the vertex sets do not match.
pub fn quad_orientation(base: &[usize; 4], test: &[usize; 4]) -> Option<usize> {
    let i = test.iter().position(|&v| v == base[0])?;
    let or = if test[(i + 1) % 4] == base[1] {
        2 * i
    } else if test[(i + 3) % 4] == base[1] {
        2 * i + 1
    } else {
        return None;
    };
    for k in 0..4 {
        let t = if or % 2 == 0 {
            test[(i + k) % 4]
        } else {
            test[(i + 4 - k) % 4]
        };
        if t != base[k] {
            return None;
        }
    }
    Some(or)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_orientation() {
        assert_eq!(quad_orientation(&[4, 5, 6, 7], &[4, 5, 6, 7]), Some(0));
    }

    #[test]
    fn rotations_and_reflections() {
        let base = [0, 1, 2, 3];
        assert_eq!(quad_orientation(&base, &[0, 3, 2, 1]), Some(1));
        assert_eq!(quad_orientation(&base, &[3, 0, 1, 2]), Some(2));
        assert_eq!(quad_orientation(&base, &[1, 0, 3, 2]), Some(3));
        assert_eq!(quad_orientation(&base, &[2, 3, 0, 1]), Some(4));
        assert_eq!(quad_orientation(&base, &[2, 1, 0, 3]), Some(5));
        assert_eq!(quad_orientation(&base, &[1, 2, 3, 0]), Some(6));
        assert_eq!(quad_orientation(&base, &[3, 2, 1, 0]), Some(7));
    }

    #[test]
    fn mismatched_quads_have_no_orientation() {
        assert_eq!(quad_orientation(&[0, 1, 2, 3], &[0, 1, 2, 4]), None);
        assert_eq!(quad_orientation(&[0, 1, 2, 3], &[0, 2, 1, 3]), None);
    }
}
