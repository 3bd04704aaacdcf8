use std::io::Cursor;

use approx::assert_abs_diff_eq;
use iga_core::TextReader;
use iga_extension::{Extension, ParExtension, SpaceMode};
use iga_geometry::{KnotVector, Patch};
use iga_topology::PatchTopology;

fn kv(order: usize, knots: &[f64]) -> KnotVector {
    KnotVector::from_knots(order, knots.to_vec())
}

/// Planar patch with control points on a regular grid over
/// `[x0, x1] x [0, 1]`, unit weights.
fn grid_patch(kvu: KnotVector, kvv: KnotVector, x0: f64, x1: f64) -> Patch {
    let (nu, nv) = (kvu.ncp(), kvv.ncp());
    let mut p = Patch::new(vec![kvu, kvv], 3);
    for j in 0..nv {
        for i in 0..nu {
            *p.at2_mut(i, j, 0) = x0 + (x1 - x0) * i as f64 / (nu - 1) as f64;
            *p.at2_mut(i, j, 1) = j as f64 / (nv - 1) as f64;
            *p.at2_mut(i, j, 2) = 1.0;
        }
    }
    p
}

/// One quad with boundary attributes 1..4 on bottom, right, top, left.
fn unit_square_topology() -> PatchTopology {
    let mut topo = PatchTopology::new(2, 4);
    topo.add_patch(&[0, 1, 2, 3], 1).unwrap();
    topo.add_boundary(&[0, 1], 1).unwrap();
    topo.add_boundary(&[1, 2], 2).unwrap();
    topo.add_boundary(&[2, 3], 3).unwrap();
    topo.add_boundary(&[3, 0], 4).unwrap();
    topo
}

/// Two unit quads glued along the edge (1, 2); attribute 1 on the far left
/// edge, 2 on the far right edge.
fn two_patch_strip() -> (PatchTopology, Vec<Patch>) {
    let mut topo = PatchTopology::new(2, 6);
    topo.add_patch(&[0, 1, 2, 3], 1).unwrap();
    topo.add_patch(&[1, 4, 5, 2], 2).unwrap();
    topo.add_boundary(&[3, 0], 1).unwrap();
    topo.add_boundary(&[4, 5], 2).unwrap();
    let line = kv(1, &[0.0, 0.0, 1.0, 1.0]);
    let patches = vec![
        grid_patch(line.clone(), line.clone(), 0.0, 1.0),
        grid_patch(line.clone(), line, 1.0, 2.0),
    ];
    (topo, patches)
}

fn square_2x2() -> Extension {
    let line = kv(1, &[0.0, 0.0, 0.5, 1.0, 1.0]);
    let patch = grid_patch(line.clone(), line, 0.0, 1.0);
    Extension::from_patches(unit_square_topology(), vec![patch]).unwrap()
}

#[test]
fn bilinear_square_has_expected_counts() {
    let ext = square_2x2();
    assert_eq!(ext.dim(), 2);
    assert_eq!(ext.total_elements(), 4);
    assert_eq!(ext.num_elements(), 4);
    assert_eq!(ext.total_dofs(), 9);
    assert_eq!(ext.num_dofs(), 9);
    assert_eq!(ext.total_bdr_elements(), 8);
    assert_eq!(ext.num_bdr_elements(), 8);
    assert_eq!(ext.num_vertices(), 9);

    // Bilinear elements carry four DOFs each, covering all nine exactly.
    let mut seen = vec![false; 9];
    for el in 0..4 {
        let dofs = ext.element_dofs(el);
        assert_eq!(dofs.len(), 4);
        for &d in dofs {
            seen[d as usize] = true;
        }
    }
    assert!(seen.iter().all(|&s| s));
}

#[test]
fn shared_edge_couples_two_patches() {
    let (topo, patches) = two_patch_strip();
    let ext = Extension::from_patches(topo, patches).unwrap();
    assert_eq!(ext.total_elements(), 2);
    assert_eq!(ext.total_dofs(), 6);
    assert!(ext.consistent_kv_sets());

    let d0 = ext.patch_dofs(0);
    let d1 = ext.patch_dofs(1);
    let shared: Vec<usize> = d0.iter().filter(|d| d1.contains(d)).copied().collect();
    assert_eq!(shared.len(), 2);
}

#[test]
fn knot_insert_then_remove_restores_the_net() {
    let (topo, patches) = two_patch_strip();
    let mut ext = Extension::from_patches(topo, patches).unwrap();
    let before: Vec<Vec<f64>> = (0..2).map(|p| ext.patch(p).data().to_vec()).collect();

    ext.knot_insert_vecs(&[vec![0.5], vec![], vec![]]).unwrap();
    assert_eq!(ext.patch(0).kv(0).ncp(), 3);
    assert_eq!(ext.patch(1).kv(0).ncp(), 2);

    ext.knot_remove_vecs(&[vec![0.5], vec![], vec![]], 1e-12).unwrap();
    assert_eq!(ext.patch(0).kv(0).ncp(), 2);
    for p in 0..2 {
        let after = ext.patch(p).data();
        assert_eq!(after.len(), before[p].len());
        for (a, b) in after.iter().zip(&before[p]) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }
}

#[test]
fn refined_patches_rebuild_the_space() {
    let (topo, patches) = two_patch_strip();
    let mut ext = Extension::from_patches(topo, patches).unwrap();
    ext.uniform_refinement_all(2);
    ext.set_knots_from_patches().unwrap();
    let coords = ext.set_coords_from_patches().unwrap();

    // Each patch now holds 2x2 elements; the shared column of 3 DOFs is
    // counted once.
    assert_eq!(ext.total_elements(), 8);
    assert_eq!(ext.total_dofs(), 15);
    assert_eq!(coords.len(), 2 * 15);
    assert_eq!(ext.weights().len(), 15);
}

#[test]
fn periodic_pair_identifies_opposite_columns() {
    let mut ext = square_2x2();
    ext.connect_boundaries(&[2], &[4]).unwrap();
    assert_eq!(ext.total_dofs(), 6);
    assert_eq!(ext.num_dofs(), 6);
    for el in 0..4 {
        assert!(ext.element_dofs(el).iter().all(|&d| (0..6).contains(&d)));
    }
}

#[test]
fn chained_periodic_pairs_collapse_corners() {
    let mut ext = square_2x2();
    ext.connect_boundaries(&[2, 3], &[4, 1]).unwrap();
    // Both column pairs and row pairs are identified; the four corners meet
    // in a single class through the chain.
    assert_eq!(ext.total_dofs(), 4);
}

#[test]
fn connecting_an_unknown_attribute_fails() {
    let mut ext = square_2x2();
    assert!(ext.connect_boundaries(&[2], &[9]).is_err());
}

#[test]
fn raised_order_shares_topology_and_grows_dofs() {
    let (topo, patches) = two_patch_strip();
    let ext = Extension::from_patches(topo, patches).unwrap();
    let raised = ext.raised_order(2).unwrap();
    assert_eq!(raised.orders(), &[2, 2, 2]);
    assert_eq!(raised.total_elements(), 2);
    // Two 3x3 nets sharing a column of three control points.
    assert_eq!(raised.total_dofs(), 15);
    assert!(raised.weights().iter().all(|&w| w == 1.0));
}

#[test]
fn div_extension_raises_one_component() {
    let ext = square_2x2();
    let div = ext.div_extension(0).unwrap();
    assert_eq!(div.mode(), SpaceMode::HDiv);
    assert_eq!(div.orders(), &[2, 1]);
    // 5x3 control net for the raised direction.
    assert_eq!(div.total_dofs(), 15);

    // Boundary segments along the raised direction carry no boundary DOFs.
    assert!(div.bdr_element_dofs(0).is_empty());
    assert!(!div.bdr_element_dofs(2).is_empty());
}

#[test]
fn div_extension_signs_normal_components() {
    let ext = square_2x2();
    let div = ext.div_extension(1).unwrap();
    assert_eq!(div.orders(), &[1, 2]);
    // The bottom boundary's outward normal opposes the raised axis, so its
    // DOFs come out sign-encoded.
    assert!(!div.bdr_element_dofs(0).is_empty());
    assert!(div.bdr_element_dofs(0).iter().all(|&d| d < 0));
}

#[test]
fn vector_extensions_need_a_single_patch() {
    let (topo, patches) = two_patch_strip();
    let ext = Extension::from_patches(topo, patches).unwrap();
    assert!(ext.div_extension(0).is_err());
    assert!(ext.curl_extension(0).is_err());
}

#[test]
fn partitioned_space_builds_shared_groups() {
    let mut ext = square_2x2();
    ext.set_coords_from_patches().unwrap();

    // Bottom row of elements to rank 0, top row to rank 1.
    let part = vec![0, 0, 1, 1];
    let active_bdr = vec![true, true, false, false, false, false, false, false];
    let par = ParExtension::from_partition(0, &ext, &part, &active_bdr).unwrap();

    assert_eq!(par.space().num_elements(), 2);
    assert_eq!(par.space().num_dofs(), 6);
    assert_eq!(par.group_topology().num_groups(), 2);
    assert_eq!(par.group_topology().group(1), &[0, 1]);
    // The middle DOF row is shared with rank 1.
    let shared = par.ldof_group().iter().filter(|&&g| g != 0).count();
    assert_eq!(shared, 3);
}

#[test]
fn mesh_file_roundtrip_preserves_the_space() {
    let mut ext = square_2x2();
    ext.set_coords_from_patches().unwrap();

    let mut buf = Vec::new();
    ext.write(&mut buf).unwrap();
    let mut reader = TextReader::new(Cursor::new(buf));
    let back = Extension::from_reader(&mut reader).unwrap();

    assert_eq!(back.dim(), ext.dim());
    assert_eq!(back.orders(), ext.orders());
    assert_eq!(back.total_elements(), ext.total_elements());
    assert_eq!(back.total_dofs(), ext.total_dofs());
    assert_eq!(back.total_bdr_elements(), ext.total_bdr_elements());
    assert_eq!(back.weights(), ext.weights());
}

#[test]
fn bdr_patch_check_flags_reversed_boundaries() {
    let line = kv(1, &[0.0, 0.0, 0.5, 1.0, 1.0]);

    // Boundaries traversed along the knot directions pass.
    let mut topo = PatchTopology::new(2, 4);
    topo.add_patch(&[0, 1, 2, 3], 1).unwrap();
    topo.add_boundary(&[0, 1], 1).unwrap();
    topo.add_boundary(&[1, 2], 2).unwrap();
    topo.add_boundary(&[3, 2], 3).unwrap();
    topo.add_boundary(&[0, 3], 4).unwrap();
    let patch = grid_patch(line.clone(), line, 0.0, 1.0);
    let ext = Extension::from_patches(topo, vec![patch]).unwrap();
    assert!(ext.check_bdr_patches().is_ok());

    // The counterclockwise top and left edges run against their knot
    // vectors.
    assert!(square_2x2().check_bdr_patches().is_err());
}

#[test]
fn bezier_mesh_matches_element_counts() {
    let ext = square_2x2();
    let elems = ext.mesh_elements();
    let bdr = ext.mesh_bdr_elements();
    assert_eq!(elems.len(), 4);
    assert_eq!(bdr.len(), 8);
    for (verts, attr) in &elems {
        assert_eq!(verts.len(), 4);
        assert_eq!(*attr, 1);
        assert!(verts.iter().all(|&v| v < ext.num_vertices()));
    }
    for (verts, _) in &bdr {
        assert_eq!(verts.len(), 2);
    }
}
