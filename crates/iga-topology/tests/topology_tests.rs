use iga_core::TextReader;
use iga_topology::PatchTopology;

/// Two unit quads side by side, sharing the edge between vertices 1 and 4.
///
/// ```text
/// 3 -- 2 -- 5
/// |    |    |
/// 0 -- 1 -- 4
/// ```
fn two_quads() -> PatchTopology {
    let mut topo = PatchTopology::new(2, 6);
    topo.add_patch(&[0, 1, 2, 3], 1).unwrap();
    topo.add_patch(&[1, 4, 5, 2], 1).unwrap();
    topo.add_boundary(&[0, 1], 1).unwrap();
    topo.add_boundary(&[1, 4], 1).unwrap();
    topo.add_boundary(&[4, 5], 2).unwrap();
    topo.add_boundary(&[5, 2], 3).unwrap();
    topo.add_boundary(&[2, 3], 3).unwrap();
    topo.add_boundary(&[3, 0], 4).unwrap();
    topo.derive_knot_classes().unwrap();
    topo
}

#[test]
fn two_quads_share_one_edge() {
    let topo = two_quads();
    assert_eq!(topo.num_patches(), 2);
    assert_eq!(topo.num_edges(), 7);
    assert_eq!(topo.num_bdr(), 6);

    let (e0, _) = topo.element_edges(0);
    let (e1, _) = topo.element_edges(1);
    // Right edge of patch 0 is the left edge of patch 1.
    assert_eq!(e0[1], e1[3]);
}

#[test]
fn two_quads_have_three_knot_classes() {
    let topo = two_quads();
    // Horizontal classes of each quad stay distinct; the shared vertical
    // edge glues the two vertical classes into one.
    assert_eq!(topo.num_unique_kvs(), 3);

    let (e0, _) = topo.element_edges(0);
    let (e1, _) = topo.element_edges(1);
    assert_eq!(topo.knot_ind(e0[1]), topo.knot_ind(e1[1]));
    assert_ne!(topo.knot_ind(e0[0]), topo.knot_ind(e1[0]));
}

#[test]
fn quad_kv_direction_is_positive_for_reference_numbering() {
    let topo = two_quads();
    assert_eq!(topo.kv_direction(0).unwrap(), vec![1, 1]);
    assert_eq!(topo.kv_direction(1).unwrap(), vec![1, 1]);
}

#[test]
fn flipped_neighbor_gets_negative_kv_direction() {
    // Second quad lists its vertices walking the other way around, so its
    // first parametric direction runs against the shared class.
    let mut topo = PatchTopology::new(2, 6);
    topo.add_patch(&[0, 1, 2, 3], 1).unwrap();
    topo.add_patch(&[4, 1, 2, 5], 1).unwrap();
    let kvdir = topo.kv_direction(1).unwrap();
    assert_eq!(kvdir[1], 1);
    assert_eq!(kvdir[0], -1);
}

#[test]
fn single_hex_entity_counts() {
    let mut topo = PatchTopology::new(3, 8);
    topo.add_patch(&[0, 1, 2, 3, 4, 5, 6, 7], 1).unwrap();
    topo.add_boundary(&[0, 3, 2, 1], 1).unwrap();
    topo.add_boundary(&[4, 5, 6, 7], 2).unwrap();
    topo.derive_knot_classes().unwrap();

    assert_eq!(topo.num_edges(), 12);
    assert_eq!(topo.num_faces(), 6);
    assert_eq!(topo.num_unique_kvs(), 3);
    assert_eq!(topo.kv_direction(0).unwrap(), vec![1, 1, 1]);

    // Bottom boundary is renumbered to the stored face order.
    assert_eq!(topo.bdr_element_vertices(0), &[3, 2, 1, 0]);
    assert_eq!(topo.bdr_element_face(0), 0);
    assert_eq!(topo.bdr_element_face(1), 5);
}

#[test]
fn stacked_hexes_share_a_face() {
    let mut topo = PatchTopology::new(3, 12);
    topo.add_patch(&[0, 1, 2, 3, 4, 5, 6, 7], 1).unwrap();
    topo.add_patch(&[4, 5, 6, 7, 8, 9, 10, 11], 1).unwrap();
    topo.derive_knot_classes().unwrap();

    assert_eq!(topo.num_faces(), 11);
    let (f0, o0) = topo.element_faces(0);
    let (f1, o1) = topo.element_faces(1);
    // Top of the lower hex is the bottom of the upper one, seen with
    // opposite orientation.
    assert_eq!(f0[5], f1[0]);
    assert_eq!(o0[5], 0);
    assert_ne!(o1[0] % 2, 0);

    // x/y classes merge across the stack; the two z classes stay apart.
    assert_eq!(topo.num_unique_kvs(), 4);
}

#[test]
fn boundary_must_lie_on_a_patch() {
    let mut topo = PatchTopology::new(2, 6);
    topo.add_patch(&[0, 1, 2, 3], 1).unwrap();
    assert!(topo.add_boundary(&[1, 4], 1).is_err());
}

#[test]
fn roundtrips_through_text_format() {
    let topo = two_quads();
    let mut buf = Vec::new();
    topo.write(&mut buf).unwrap();

    let mut r = TextReader::new(buf.as_slice());
    let back = PatchTopology::from_reader(&mut r).unwrap();

    assert_eq!(back.dim(), 2);
    assert_eq!(back.num_vertices(), 6);
    assert_eq!(back.num_patches(), 2);
    assert_eq!(back.num_bdr(), 6);
    assert_eq!(back.num_unique_kvs(), 3);
    for e in 0..topo.num_edges() {
        assert_eq!(back.edge_ukv(e), topo.edge_ukv(e));
    }
    for b in 0..topo.num_bdr() {
        assert_eq!(back.bdr_attribute(b), topo.bdr_attribute(b));
    }
}

#[test]
fn explicit_edge_list_assigns_classes() {
    let mut topo = PatchTopology::new(2, 4);
    topo.add_patch(&[0, 1, 2, 3], 1).unwrap();
    // Vertical class written against the stored direction on edge (3, 0).
    topo.assign_knot_classes(&[(0, 0, 1), (1, 1, 2), (0, 3, 2), (1, 0, 3)])
        .unwrap();
    assert_eq!(topo.num_unique_kvs(), 2);

    let (eids, _) = topo.element_edges(0);
    assert_eq!(topo.edge_ukv(eids[0]), 0);
    assert_eq!(topo.edge_ukv(eids[1]), 1);
    // Top edge is stored ascending (2, 3) but its class runs 3 to 2.
    assert_eq!(topo.edge_ukv(eids[2]), -1);
    assert_eq!(topo.knot_ind(eids[2]), 0);
    assert_eq!(topo.edge_ukv(eids[3]), 1);
}
