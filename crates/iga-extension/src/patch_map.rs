use iga_geometry::KnotVector;

use crate::extension::Extension;

/// Maps the tensor-product lattice of one patch onto global entity numbering.
///
/// A patch of sizes `(nx+1, ny+1, nz+1)` lattice points distributes them over
/// the topology: corners to vertex offsets, edge interiors to edge offsets in
/// the stored edge direction, face interiors to face offsets under the face's
/// orientation code, and the rest to the patch's own block. The same mapping
/// serves mesh vertices (offsets stepped by knot spans) and DOFs (stepped by
/// control points); the constructor picks the offset family.
///
/// All offsets are resolved up front, so a map holds no borrow and index
/// queries are plain arithmetic.
#[derive(Debug, Clone)]
pub(crate) struct PatchMap {
    i: isize,
    j: isize,
    k: isize,
    verts: Vec<isize>,
    edges: Vec<isize>,
    faces: Vec<isize>,
    oedge: Vec<i32>,
    oface: Vec<usize>,
    p_offset: isize,
    opatch: i32,
}

fn fcase(n: isize, size: isize) -> usize {
    if n < 0 {
        0
    } else if n >= size {
        2
    } else {
        1
    }
}

fn or1d(n: isize, size: isize, ori: i32) -> isize {
    if ori > 0 {
        n
    } else {
        size - 1 - n
    }
}

/// Position of interior lattice point `(n1, n2)` within a face stored under
/// orientation code `ori` relative to this patch's view of it.
fn or2d(n1: isize, n2: isize, size1: isize, size2: isize, ori: usize) -> isize {
    match ori {
        0 => n1 + n2 * size1,
        1 => n2 + n1 * size2,
        2 => n2 + (size1 - 1 - n1) * size2,
        3 => (size1 - 1 - n1) + n2 * size1,
        4 => (size1 - 1 - n1) + (size2 - 1 - n2) * size1,
        5 => (size2 - 1 - n2) + (size1 - 1 - n1) * size2,
        6 => (size2 - 1 - n2) + n1 * size2,
        7 => n1 + (size2 - 1 - n2) * size1,
        _ => unreachable!("orientation codes are 0..8"),
    }
}

/// Offset family the map resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offsets {
    Mesh,
    Space,
}

impl PatchMap {
    fn interior_sizes(kv: &[&KnotVector], which: Offsets, d: usize) -> isize {
        match which {
            Offsets::Mesh => kv[d].ne() as isize - 1,
            Offsets::Space => kv[d].ncp() as isize - 2,
        }
    }

    /// Map for a patch element. Also returns the comprehensive knot vectors
    /// of the patch, one per parametric direction.
    pub(crate) fn patch<'e>(
        ext: &'e Extension,
        p: usize,
        which: Offsets,
    ) -> (PatchMap, Vec<&'e KnotVector>) {
        let dim = ext.dim();
        let topo = ext.topology();
        let kv: Vec<&KnotVector> = (0..dim).map(|d| ext.compr_kv(p, d)).collect();

        let (voff, eoff, foff, poff) = ext.offset_arrays(which);
        let verts = topo
            .element_vertices(p)
            .iter()
            .map(|&v| voff[v] as isize)
            .collect();
        let (mut edges, mut oedge) = (Vec::new(), Vec::new());
        let (mut faces, mut oface) = (Vec::new(), Vec::new());
        if dim >= 2 {
            let (eids, eori) = topo.element_edges(p);
            edges = eids.iter().map(|&e| eoff[e] as isize).collect();
            oedge = eori.to_vec();
        }
        if dim == 3 {
            let (fids, fori) = topo.element_faces(p);
            faces = fids.iter().map(|&f| foff[f] as isize).collect();
            oface = fori.to_vec();
        }

        let map = PatchMap {
            i: Self::interior_sizes(&kv, which, 0),
            j: if dim >= 2 {
                Self::interior_sizes(&kv, which, 1)
            } else {
                0
            },
            k: if dim == 3 {
                Self::interior_sizes(&kv, which, 2)
            } else {
                0
            },
            verts,
            edges,
            faces,
            oedge,
            oface,
            p_offset: poff[p] as isize,
            opatch: 0,
        };
        (map, kv)
    }

    /// Map for a boundary patch. Returns the unique knot vectors along the
    /// boundary directions and their signed directions `okv` relative to the
    /// boundary element's own traversal.
    pub(crate) fn bdr_patch<'e>(
        ext: &'e Extension,
        b: usize,
        which: Offsets,
    ) -> (PatchMap, Vec<&'e KnotVector>, Vec<i32>) {
        let dim = ext.dim();
        let topo = ext.topology();
        let (voff, eoff, foff, _) = ext.offset_arrays(which);

        let verts: Vec<isize> = topo
            .bdr_element_vertices(b)
            .iter()
            .map(|&v| voff[v] as isize)
            .collect();

        let mut kv = Vec::new();
        let mut okv = Vec::new();
        let mut edges = Vec::new();
        let mut oedge = Vec::new();
        let mut p_offset = 0isize;
        let mut opatch = 0i32;
        let (mut i, mut j) = (0isize, 0isize);

        match dim {
            1 => {}
            2 => {
                let (eids, eori) = topo.bdr_element_edges(b);
                let (kv0, s) = ext.edge_kv(eids[0], eori[0]);
                kv.push(kv0);
                okv.push(s);
                opatch = eori[0];
                i = Self::interior_sizes(&kv, which, 0);
                p_offset = eoff[eids[0]] as isize;
            }
            _ => {
                let (eids, eori) = topo.bdr_element_edges(b);
                for d in 0..2 {
                    let (kvd, s) = ext.edge_kv(eids[d], eori[d]);
                    kv.push(kvd);
                    okv.push(s);
                }
                edges = eids.iter().map(|&e| eoff[e] as isize).collect();
                oedge = eori.to_vec();
                i = Self::interior_sizes(&kv, which, 0);
                j = Self::interior_sizes(&kv, which, 1);
                // Boundary quads are stored in face order, so the face block
                // is traversed without reorientation.
                p_offset = foff[topo.bdr_element_face(b)] as isize;
            }
        }

        let map = PatchMap {
            i,
            j,
            k: 0,
            verts,
            edges,
            faces: Vec::new(),
            oedge,
            oface: Vec::new(),
            p_offset,
            opatch,
        };
        (map, kv, okv)
    }

    pub(crate) fn nx(&self) -> usize {
        (self.i + 1) as usize
    }

    pub(crate) fn ny(&self) -> usize {
        (self.j + 1) as usize
    }

    pub(crate) fn nz(&self) -> usize {
        (self.k + 1) as usize
    }

    /// 1D lattice index for a patch map.
    pub(crate) fn index1(&self, i: isize) -> usize {
        let i1 = i - 1;
        (match fcase(i1, self.i) {
            0 => self.verts[0],
            1 => self.p_offset + i1,
            _ => self.verts[1],
        }) as usize
    }

    /// 1D lattice index for a boundary map; the interior runs against the
    /// stored edge when the boundary element traverses it backwards.
    pub(crate) fn bdr_index1(&self, i: isize) -> usize {
        let i1 = i - 1;
        (match fcase(i1, self.i) {
            0 => self.verts[0],
            1 => {
                if self.opatch < 0 {
                    self.p_offset + self.i - 1 - i1
                } else {
                    self.p_offset + i1
                }
            }
            _ => self.verts[1],
        }) as usize
    }

    /// 2D lattice index, for quad patches and 3D boundary faces alike. The
    /// top and left local edges run against their parametric axes, hence the
    /// negated orientations.
    pub(crate) fn index2(&self, i: isize, j: isize) -> usize {
        let i1 = i - 1;
        let j1 = j - 1;
        (match 3 * fcase(j1, self.j) + fcase(i1, self.i) {
            0 => self.verts[0],
            1 => self.edges[0] + or1d(i1, self.i, self.oedge[0]),
            2 => self.verts[1],
            3 => self.edges[3] + or1d(j1, self.j, -self.oedge[3]),
            4 => self.p_offset + self.i * j1 + i1,
            5 => self.edges[1] + or1d(j1, self.j, self.oedge[1]),
            6 => self.verts[3],
            7 => self.edges[2] + or1d(i1, self.i, -self.oedge[2]),
            _ => self.verts[2],
        }) as usize
    }

    /// 3D lattice index. Every hex edge is listed along its parametric axis,
    /// so edge orientations apply unnegated; face interiors go through the
    /// stored face under its orientation code.
    pub(crate) fn index3(&self, i: isize, j: isize, k: isize) -> usize {
        let i1 = i - 1;
        let j1 = j - 1;
        let k1 = k - 1;
        let (ii, jj, kk) = (self.i, self.j, self.k);
        (match 3 * (3 * fcase(k1, kk) + fcase(j1, jj)) + fcase(i1, ii) {
            0 => self.verts[0],
            1 => self.edges[0] + or1d(i1, ii, self.oedge[0]),
            2 => self.verts[1],
            3 => self.edges[3] + or1d(j1, jj, self.oedge[3]),
            4 => self.faces[0] + or2d(i1, jj - 1 - j1, ii, jj, self.oface[0]),
            5 => self.edges[1] + or1d(j1, jj, self.oedge[1]),
            6 => self.verts[3],
            7 => self.edges[2] + or1d(i1, ii, self.oedge[2]),
            8 => self.verts[2],
            9 => self.edges[8] + or1d(k1, kk, self.oedge[8]),
            10 => self.faces[1] + or2d(i1, k1, ii, kk, self.oface[1]),
            11 => self.edges[9] + or1d(k1, kk, self.oedge[9]),
            12 => self.faces[4] + or2d(jj - 1 - j1, k1, jj, kk, self.oface[4]),
            13 => self.p_offset + ii * (jj * k1 + j1) + i1,
            14 => self.faces[2] + or2d(j1, k1, jj, kk, self.oface[2]),
            15 => self.edges[11] + or1d(k1, kk, self.oedge[11]),
            16 => self.faces[3] + or2d(ii - 1 - i1, k1, ii, kk, self.oface[3]),
            17 => self.edges[10] + or1d(k1, kk, self.oedge[10]),
            18 => self.verts[4],
            19 => self.edges[4] + or1d(i1, ii, self.oedge[4]),
            20 => self.verts[5],
            21 => self.edges[7] + or1d(j1, jj, self.oedge[7]),
            22 => self.faces[5] + or2d(i1, j1, ii, jj, self.oface[5]),
            23 => self.edges[5] + or1d(j1, jj, self.oedge[5]),
            24 => self.verts[7],
            25 => self.edges[6] + or1d(i1, ii, self.oedge[6]),
            _ => self.verts[6],
        }) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn or2d_covers_all_codes() {
        // 2x3 interior block, probe point (1, 2).
        let probes: Vec<isize> = (0..8).map(|o| or2d(1, 2, 2, 3, o)).collect();
        assert_eq!(probes, vec![5, 5, 2, 4, 0, 0, 3, 1]);
        // Identity code is plain row-major.
        assert_eq!(or2d(0, 0, 2, 3, 0), 0);
        assert_eq!(or2d(1, 0, 2, 3, 0), 1);
    }

    #[test]
    fn or1d_flips_against_orientation() {
        assert_eq!(or1d(0, 4, 1), 0);
        assert_eq!(or1d(0, 4, -1), 3);
        assert_eq!(or1d(3, 4, -1), 0);
    }
}
