use std::io::{BufRead, Write};
use std::rc::Rc;

use iga_core::{IgaError, Result, TextReader, Tolerance};
use iga_geometry::{KnotVector, Patch, SpacingRule};
use iga_topology::PatchTopology;

use crate::merge::DofMerger;
use crate::mode::SpaceMode;
use crate::patch_map::{Offsets, PatchMap};
use crate::table::Table;

/// Spline space over a patch topology.
///
/// Couples a [`PatchTopology`] with one knot vector per unique-knot-vector
/// class and numbers two tensor-product lattices over it: mesh vertices
/// (one per knot span boundary) and DOFs (one per control point). From those
/// it derives element and boundary-element DOF tables, Bezier-mesh
/// connectivity, and the periodic DOF identification.
///
/// The space can hold its control points in two interchangeable forms:
/// a flat weight/coordinate vector over DOFs, or one [`Patch`] per
/// topological patch. Refinement, coarsening, knot insertion and degree
/// elevation operate on the patch form; [`Extension::set_knots_from_patches`]
/// and [`Extension::set_coords_from_patches`] bring the results back.
///
/// DOF indices come in three numberings. Raw indices count every control
/// point of the lattice; identified indices fold periodically-connected DOFs
/// together ([`Extension::total_dofs`] of them); active indices compact the
/// identified DOFs reachable from active elements ([`Extension::num_dofs`]).
/// Without periodicity and with every element active all three coincide.
#[derive(Debug, Clone)]
pub struct Extension {
    pub(crate) topo: Rc<PatchTopology>,
    mode: SpaceMode,
    pub(crate) knot_vectors: Vec<KnotVector>,
    pub(crate) knot_vectors_compr: Vec<KnotVector>,
    patches: Vec<Patch>,
    orders: Vec<usize>,
    weights: Vec<f64>,
    master: Vec<i32>,
    slave: Vec<i32>,

    /// Raw-to-identified DOF map; empty means identity.
    d_to_d: Vec<usize>,
    num_space_dofs: usize,
    num_dofs: usize,
    num_mesh_vertices: usize,
    num_elements: usize,
    num_bdr_elements: usize,

    pub(crate) v_mesh: Vec<usize>,
    pub(crate) e_mesh: Vec<usize>,
    pub(crate) f_mesh: Vec<usize>,
    pub(crate) p_mesh: Vec<usize>,
    pub(crate) v_space: Vec<usize>,
    pub(crate) e_space: Vec<usize>,
    pub(crate) f_space: Vec<usize>,
    pub(crate) p_space: Vec<usize>,

    active_elem: Vec<bool>,
    active_bdr_elem: Vec<bool>,
    num_active_elems: usize,
    num_active_bdr_elems: usize,
    active_vert: Vec<isize>,
    num_active_verts: usize,
    active_dof: Vec<isize>,
    num_active_dofs: usize,

    el_dof: Option<Table>,
    bel_dof: Option<Table>,
    el_to_patch: Vec<usize>,
    bel_to_patch: Vec<usize>,
    el_to_ijk: Vec<[isize; 3]>,
    bel_to_ijk: Vec<[isize; 2]>,
    patch_to_el: Vec<Vec<usize>>,
    patch_to_bel: Vec<Vec<usize>>,
}

impl Extension {
    fn empty(topo: Rc<PatchTopology>, mode: SpaceMode) -> Extension {
        Extension {
            topo,
            mode,
            knot_vectors: Vec::new(),
            knot_vectors_compr: Vec::new(),
            patches: Vec::new(),
            orders: Vec::new(),
            weights: Vec::new(),
            master: Vec::new(),
            slave: Vec::new(),
            d_to_d: Vec::new(),
            num_space_dofs: 0,
            num_dofs: 0,
            num_mesh_vertices: 0,
            num_elements: 0,
            num_bdr_elements: 0,
            v_mesh: Vec::new(),
            e_mesh: Vec::new(),
            f_mesh: Vec::new(),
            p_mesh: Vec::new(),
            v_space: Vec::new(),
            e_space: Vec::new(),
            f_space: Vec::new(),
            p_space: Vec::new(),
            active_elem: Vec::new(),
            active_bdr_elem: Vec::new(),
            num_active_elems: 0,
            num_active_bdr_elems: 0,
            active_vert: Vec::new(),
            num_active_verts: 0,
            active_dof: Vec::new(),
            num_active_dofs: 0,
            el_dof: None,
            bel_dof: None,
            el_to_patch: Vec::new(),
            bel_to_patch: Vec::new(),
            el_to_ijk: Vec::new(),
            bel_to_ijk: Vec::new(),
            patch_to_el: Vec::new(),
            patch_to_bel: Vec::new(),
        }
    }

    /// Read a full mesh file: header, topology block, knot vectors or
    /// patches, and the optional `mesh_elements`, `periodic` and weight
    /// sections.
    pub fn from_reader<R: BufRead>(r: &mut TextReader<R>) -> Result<Extension> {
        r.expect("patch-topology")?;
        let version = r.token()?;
        if version != "v1.0" && version != "v1.1" {
            return Err(IgaError::Parse(format!("unknown format version '{version}'")));
        }

        let topo = Rc::new(PatchTopology::from_reader(r)?);
        let mut ext = Extension::empty(topo, SpaceMode::Scalar);

        let section = r.token()?;
        match section.as_str() {
            "knotvectors" => {
                let nkv = r.usize()?;
                if nkv != ext.topo.num_unique_kvs() {
                    return Err(IgaError::Inconsistent(format!(
                        "{} knot vectors for {} classes",
                        nkv,
                        ext.topo.num_unique_kvs()
                    )));
                }
                for _ in 0..nkv {
                    ext.knot_vectors.push(KnotVector::from_reader(r)?);
                }
                if version == "v1.1" && r.peek()? == Some("spacing") {
                    r.expect("spacing")?;
                    let ns = r.usize()?;
                    for _ in 0..ns {
                        let ukv = r.usize()?;
                        let rule = read_spacing(r)?;
                        if ukv >= ext.knot_vectors.len() {
                            return Err(IgaError::Parse(format!(
                                "spacing for unknown knot vector {ukv}"
                            )));
                        }
                        ext.knot_vectors[ukv].spacing =
                            Some(Rc::new(std::cell::RefCell::new(rule)));
                    }
                }
                ext.check_patches()?;
                ext.create_comprehensive_kvs()?;
                if !ext.consistent_kv_sets() {
                    return Err(IgaError::Inconsistent(
                        "knot vectors of a shared class disagree between patches".into(),
                    ));
                }
            }
            "patches" => {
                for _ in 0..ext.topo.num_patches() {
                    ext.patches.push(Patch::from_reader(r)?);
                }
                ext.adopt_patch_knot_vectors()?;
            }
            other => {
                return Err(IgaError::Parse(format!(
                    "expected 'knotvectors' or 'patches', found '{other}'"
                )));
            }
        }

        ext.set_orders_from_knot_vectors();
        ext.generate_offsets();
        ext.count_elements();
        ext.count_bdr_elements();

        if r.peek()? == Some("mesh_elements") {
            r.expect("mesh_elements")?;
            let n = r.usize()?;
            let mut active = vec![false; ext.num_elements];
            for _ in 0..n {
                let e = r.usize()?;
                if e >= ext.num_elements {
                    return Err(IgaError::Parse(format!("mesh element {e} out of range")));
                }
                active[e] = true;
            }
            ext.set_active(active);
        } else {
            ext.set_all_active();
        }

        ext.generate_active_vertices();
        ext.num_dofs = ext.num_space_dofs;
        ext.generate_element_dof_table();
        ext.generate_active_bdr_elems();
        ext.generate_bdr_element_dof_table();

        if r.peek()? == Some("periodic") {
            r.expect("periodic")?;
            let nm = r.usize()?;
            for _ in 0..nm {
                ext.master.push(r.isize()? as i32);
            }
            let ns = r.usize()?;
            for _ in 0..ns {
                ext.slave.push(r.isize()? as i32);
            }
        }

        if ext.patches.is_empty() {
            match r.token()?.as_str() {
                "weights" => {
                    let mut w = Vec::with_capacity(ext.num_active_dofs);
                    for _ in 0..ext.num_active_dofs {
                        w.push(r.f64()?);
                    }
                    ext.weights = w;
                }
                "unitweights" => {
                    ext.weights = vec![1.0; ext.num_active_dofs];
                }
                other => {
                    return Err(IgaError::Parse(format!(
                        "expected 'weights' or 'unitweights', found '{other}'"
                    )));
                }
            }
        }

        ext.apply_periodic()?;
        Ok(ext)
    }

    /// Build from a topology and one geometry patch per topological patch.
    /// Knot-vector classes are derived from the patch graph; control points
    /// stay in patch form until [`Extension::set_coords_from_patches`].
    pub fn from_patches(mut topo: PatchTopology, patches: Vec<Patch>) -> Result<Extension> {
        if patches.len() != topo.num_patches() {
            return Err(IgaError::Inconsistent(format!(
                "{} patches for {} topological patches",
                patches.len(),
                topo.num_patches()
            )));
        }
        let reps = topo.derive_knot_classes()?;
        let mut ext = Extension::empty(Rc::new(topo), SpaceMode::Scalar);
        ext.patches = patches;
        for (p, d) in reps {
            ext.knot_vectors.push(ext.patches[p].kv(d).clone());
        }
        ext.check_patches()?;
        ext.create_comprehensive_kvs()?;
        ext.set_orders_from_knot_vectors();
        ext.generate_offsets();
        ext.count_elements();
        ext.count_bdr_elements();
        ext.set_all_active();
        ext.generate_active_vertices();
        ext.num_dofs = ext.num_space_dofs;
        ext.generate_element_dof_table();
        ext.generate_active_bdr_elems();
        ext.generate_bdr_element_dof_table();
        Ok(ext)
    }

    /// Derived space with every unique knot vector elevated to `new_order`
    /// where it is lower. Shares the topology and active sets.
    pub fn raised_order(&self, new_order: usize) -> Result<Extension> {
        let orders = vec![new_order; self.knot_vectors.len()];
        self.raised_orders(&orders, SpaceMode::Scalar)
    }

    /// Derived space with per-class target orders and an explicit mode.
    pub fn raised_orders(&self, new_orders: &[usize], mode: SpaceMode) -> Result<Extension> {
        if new_orders.len() != self.knot_vectors.len() {
            return Err(IgaError::Inconsistent(format!(
                "{} target orders for {} knot vectors",
                new_orders.len(),
                self.knot_vectors.len()
            )));
        }
        let mut ext = Extension::empty(Rc::clone(&self.topo), mode);
        for (kv, &newd) in self.knot_vectors.iter().zip(new_orders) {
            ext.knot_vectors.push(if newd > kv.order() {
                kv.degree_elevate(newd - kv.order())
            } else {
                kv.clone()
            });
        }
        ext.master = self.master.clone();
        ext.slave = self.slave.clone();
        ext.create_comprehensive_kvs()?;
        ext.set_orders_from_knot_vectors();
        ext.generate_offsets();
        ext.count_elements();
        ext.count_bdr_elements();
        ext.set_active(self.active_elem.clone());
        ext.active_bdr_elem = self.active_bdr_elem.clone();
        ext.num_active_bdr_elems = self.num_active_bdr_elems;
        ext.generate_active_vertices();
        ext.num_dofs = ext.num_space_dofs;
        ext.generate_element_dof_table();
        ext.generate_bdr_element_dof_table();
        ext.weights = vec![1.0; ext.num_active_dofs];
        ext.apply_periodic()?;
        Ok(ext)
    }

    /// The normal-component space for vector direction `component`.
    /// Single-patch only: with several patches the component direction is
    /// not globally defined.
    pub fn div_extension(&self, component: usize) -> Result<Extension> {
        if self.num_patches() > 1 {
            return Err(IgaError::InvalidOperation(
                "H(div) spaces require a single patch".into(),
            ));
        }
        let mut orders = self.orders.clone();
        orders[component] += 1;
        self.raised_orders(&orders, SpaceMode::HDiv)
    }

    /// The tangential-component space for vector direction `component`.
    pub fn curl_extension(&self, component: usize) -> Result<Extension> {
        if self.num_patches() > 1 {
            return Err(IgaError::InvalidOperation(
                "H(curl) spaces require a single patch".into(),
            ));
        }
        let mut orders: Vec<usize> = self.orders.iter().map(|o| o + 1).collect();
        orders[component] -= 1;
        self.raised_orders(&orders, SpaceMode::HCurl)
    }

    /// Merge pieces that partition one global space (each piece has the same
    /// topology and knot vectors but its own active subset and weights).
    pub fn merge_pieces(pieces: &[Extension]) -> Result<Extension> {
        let first = pieces
            .first()
            .ok_or_else(|| IgaError::InvalidOperation("no pieces to merge".into()))?;
        let mut ext = Extension::empty(Rc::clone(&first.topo), SpaceMode::Scalar);
        ext.knot_vectors = first.knot_vectors.clone();
        ext.check_patches()?;
        ext.create_comprehensive_kvs()?;
        ext.set_orders_from_knot_vectors();
        ext.generate_offsets();
        ext.count_elements();
        ext.count_bdr_elements();
        ext.set_all_active();
        ext.generate_active_vertices();
        ext.num_dofs = ext.num_space_dofs;
        ext.generate_element_dof_table();
        ext.generate_active_bdr_elems();
        ext.generate_bdr_element_dof_table();
        ext.weights = vec![1.0; ext.num_active_dofs];
        ext.merge_weights(pieces)?;
        Ok(ext)
    }

    /// Pull each piece's weights into this global space through the element
    /// DOF tables.
    pub fn merge_weights(&mut self, pieces: &[Extension]) -> Result<()> {
        for piece in pieces {
            if piece.num_elements != self.num_elements {
                return Err(IgaError::Inconsistent(
                    "piece does not match the global element count".into(),
                ));
            }
            let l2g = piece.element_local_to_global();
            for (lel, &gel) in l2g.iter().enumerate() {
                let gdofs = self.element_dofs(gel).to_vec();
                let ldofs = piece.element_dofs(lel);
                for (g, l) in gdofs.iter().zip(ldofs) {
                    self.weights[*g as usize] = piece.weights[*l as usize];
                }
            }
        }
        Ok(())
    }

    /// Merge per-piece solution vectors (vdim-interleaved over active DOFs)
    /// into a global one.
    pub fn merge_solutions(
        &self,
        pieces: &[Extension],
        solutions: &[Vec<f64>],
        vdim: usize,
    ) -> Result<Vec<f64>> {
        let mut merged = vec![0.0; vdim * self.num_active_dofs];
        for (piece, sol) in pieces.iter().zip(solutions) {
            let l2g = piece.element_local_to_global();
            for (lel, &gel) in l2g.iter().enumerate() {
                let gdofs = self.element_dofs(gel);
                let ldofs = piece.element_dofs(lel);
                for (g, l) in gdofs.iter().zip(ldofs) {
                    for d in 0..vdim {
                        merged[*g as usize * vdim + d] = sol[*l as usize * vdim + d];
                    }
                }
            }
        }
        Ok(merged)
    }

    // Accessors.

    pub fn dim(&self) -> usize {
        self.topo.dim()
    }

    pub fn topology(&self) -> &PatchTopology {
        &self.topo
    }

    pub fn share_topology(&self) -> Rc<PatchTopology> {
        Rc::clone(&self.topo)
    }

    pub fn mode(&self) -> SpaceMode {
        self.mode
    }

    pub fn num_patches(&self) -> usize {
        self.topo.num_patches()
    }

    pub fn num_bdr_patches(&self) -> usize {
        self.topo.num_bdr()
    }

    pub fn unique_kv(&self, i: usize) -> &KnotVector {
        &self.knot_vectors[i]
    }

    pub fn num_unique_kvs(&self) -> usize {
        self.knot_vectors.len()
    }

    pub fn orders(&self) -> &[usize] {
        &self.orders
    }

    pub fn max_order(&self) -> usize {
        self.orders.iter().copied().max().unwrap_or(0)
    }

    pub fn min_order(&self) -> usize {
        self.orders.iter().copied().min().unwrap_or(0)
    }

    /// All elements, active or not.
    pub fn total_elements(&self) -> usize {
        self.num_elements
    }

    pub fn num_elements(&self) -> usize {
        self.num_active_elems
    }

    pub fn total_bdr_elements(&self) -> usize {
        self.num_bdr_elements
    }

    pub fn num_bdr_elements(&self) -> usize {
        self.num_active_bdr_elems
    }

    /// Identified DOFs, before restriction to active elements.
    pub fn total_dofs(&self) -> usize {
        self.num_dofs
    }

    /// Active DOFs: those supported on an active element.
    pub fn num_dofs(&self) -> usize {
        self.num_active_dofs
    }

    pub fn total_vertices(&self) -> usize {
        self.num_mesh_vertices
    }

    pub fn num_vertices(&self) -> usize {
        self.num_active_verts
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f64] {
        &mut self.weights
    }

    pub fn set_weights(&mut self, w: Vec<f64>) {
        assert_eq!(w.len(), self.num_active_dofs, "weight vector size mismatch");
        self.weights = w;
    }

    pub fn has_patches(&self) -> bool {
        !self.patches.is_empty()
    }

    pub fn patch(&self, p: usize) -> &Patch {
        &self.patches[p]
    }

    pub fn element_active(&self, e: usize) -> bool {
        self.active_elem[e]
    }

    /// Active-DOF row of an active element. Entries are active DOF indices;
    /// a sign-flipped DOF `d` is stored as `-1 - d`.
    pub fn element_dofs(&self, el: usize) -> &[isize] {
        self.el_dof.as_ref().expect("DOF tables not generated").row(el)
    }

    pub fn bdr_element_dofs(&self, bel: usize) -> &[isize] {
        self.bel_dof
            .as_ref()
            .expect("DOF tables not generated")
            .row(bel)
    }

    pub fn element_patch(&self, el: usize) -> usize {
        self.el_to_patch[el]
    }

    pub fn bdr_element_patch(&self, bel: usize) -> usize {
        self.bel_to_patch[bel]
    }

    /// Knot-span indices of an active element within its patch.
    pub fn element_ijk(&self, el: usize) -> [isize; 3] {
        self.el_to_ijk[el]
    }

    /// Span index of a boundary element; `-1 - i` marks a span walked
    /// against the boundary knot vector.
    pub fn bdr_element_ijk(&self, bel: usize) -> [isize; 2] {
        self.bel_to_ijk[bel]
    }

    pub fn patch_elements(&self, p: usize) -> &[usize] {
        &self.patch_to_el[p]
    }

    pub fn patch_bdr_elements(&self, p: usize) -> &[usize] {
        &self.patch_to_bel[p]
    }

    /// Active index (1-based, 0 when inactive) of an identified DOF.
    pub(crate) fn active_dof_index(&self, id: usize) -> isize {
        self.active_dof[id]
    }

    pub(crate) fn bdr_activity(&self) -> Vec<bool> {
        self.active_bdr_elem.clone()
    }

    fn dof_map(&self, d: usize) -> usize {
        if self.d_to_d.is_empty() {
            d
        } else {
            self.d_to_d[d]
        }
    }

    pub(crate) fn compr_kv(&self, p: usize, d: usize) -> &KnotVector {
        &self.knot_vectors_compr[self.dim() * p + d]
    }

    /// Unique knot vector of an edge and its direction relative to a
    /// traversal of orientation `ori`.
    pub(crate) fn edge_kv(&self, e: usize, ori: i32) -> (&KnotVector, i32) {
        let signed = self.topo.edge_ukv(e);
        if signed >= 0 {
            (&self.knot_vectors[signed as usize], ori)
        } else {
            (&self.knot_vectors[(-1 - signed) as usize], -ori)
        }
    }

    pub(crate) fn offset_arrays(
        &self,
        which: Offsets,
    ) -> (&[usize], &[usize], &[usize], &[usize]) {
        match which {
            Offsets::Mesh => (&self.v_mesh, &self.e_mesh, &self.f_mesh, &self.p_mesh),
            Offsets::Space => (&self.v_space, &self.e_space, &self.f_space, &self.p_space),
        }
    }

    /// Local edge indices carrying the parametric directions of a patch.
    fn dir_edges(&self) -> &'static [usize] {
        match self.dim() {
            1 => &[0],
            2 => &[0, 1],
            _ => &[0, 3, 8],
        }
    }

    // Knot-vector bookkeeping.

    /// Verify that opposite patch edges carry the same knot-vector class in
    /// opposite stored directions.
    fn check_patches(&self) -> Result<()> {
        if self.dim() == 1 {
            return Ok(());
        }
        for p in 0..self.num_patches() {
            let (eids, eori) = self.topo.element_edges(p);
            let signed: Vec<isize> = eids
                .iter()
                .zip(eori)
                .map(|(&e, &o)| {
                    let x = self.topo.edge_ukv(e);
                    if o < 0 {
                        -1 - x
                    } else {
                        x
                    }
                })
                .collect();
            let ok = if self.dim() == 2 {
                signed[0] == -1 - signed[2] && signed[1] == -1 - signed[3]
            } else {
                [0, 2, 4, 6].windows(2).all(|w| signed[w[0]] == signed[w[1]])
                    && [1, 3, 5, 7].windows(2).all(|w| signed[w[0]] == signed[w[1]])
                    && [8, 9, 10, 11]
                        .windows(2)
                        .all(|w| signed[w[0]] == signed[w[1]])
            };
            if !ok {
                return Err(IgaError::Inconsistent(format!(
                    "patch {p} maps opposite edges to different knot vectors"
                )));
            }
        }
        Ok(())
    }

    /// Verify that every boundary patch runs along its knot-vector classes
    /// in their stored direction.
    pub fn check_bdr_patches(&self) -> Result<()> {
        if self.dim() == 1 {
            return Ok(());
        }
        let checked = if self.dim() == 2 { 1 } else { 2 };
        for b in 0..self.num_bdr_patches() {
            let (eids, eori) = self.topo.bdr_element_edges(b);
            for (&e, &o) in eids.iter().zip(eori).take(checked) {
                let x = self.topo.edge_ukv(e);
                let signed = if o < 0 { -1 - x } else { x };
                if signed < 0 {
                    return Err(IgaError::Inconsistent(format!(
                        "boundary patch {b} runs against its knot vector"
                    )));
                }
            }
        }
        Ok(())
    }

    /// One knot vector per patch direction, flipped into the patch's own
    /// orientation.
    fn create_comprehensive_kvs(&mut self) -> Result<()> {
        let dim = self.dim();
        let mut compr = Vec::with_capacity(dim * self.num_patches());
        for p in 0..self.num_patches() {
            let (eids, _) = self.topo.element_edges(p);
            let kvdir = self.topo.kv_direction(p)?;
            for (d, &le) in self.dir_edges().iter().enumerate() {
                let mut kv = self.knot_vectors[self.topo.knot_ind(eids[le])].clone();
                if kvdir[d] == -1 {
                    kv.flip();
                }
                compr.push(kv);
            }
        }
        self.knot_vectors_compr = compr;
        Ok(())
    }

    /// Write patch-oriented knot vectors back into the unique set, flipping
    /// where the patch runs against its class.
    fn update_unique_kvs(&mut self) -> Result<()> {
        let dim = self.dim();
        for p in 0..self.num_patches() {
            let (eids, _) = self.topo.element_edges(p);
            let kvdir = self.topo.kv_direction(p)?;
            for (d, &le) in self.dir_edges().iter().enumerate() {
                let ukv = self.topo.knot_ind(eids[le]);
                let mut cand = self.knot_vectors_compr[dim * p + d].clone();
                if kvdir[d] == -1 {
                    cand.flip();
                }
                let cur = &self.knot_vectors[ukv];
                if cand.order() != cur.order() || cand.knots() != cur.knots() {
                    self.knot_vectors[ukv] = cand;
                }
            }
        }
        Ok(())
    }

    /// True when every patch's knot vectors agree with the unique set up to
    /// the recorded flips.
    pub fn consistent_kv_sets(&self) -> bool {
        let dim = self.dim();
        for p in 0..self.num_patches() {
            let (eids, _) = self.topo.element_edges(p);
            let Ok(kvdir) = self.topo.kv_direction(p) else {
                return false;
            };
            for (d, &le) in self.dir_edges().iter().enumerate() {
                let ukv = self.topo.knot_ind(eids[le]);
                let mut cand = self.knot_vectors_compr[dim * p + d].clone();
                if kvdir[d] == -1 {
                    cand.flip();
                }
                let cur = &self.knot_vectors[ukv];
                if cand.order() != cur.order() || !cand.difference(cur).is_empty() {
                    return false;
                }
            }
        }
        true
    }

    /// Take knot vectors straight from the stored patches: the unique set
    /// from class representatives, the per-patch set verbatim.
    fn adopt_patch_knot_vectors(&mut self) -> Result<()> {
        let dim = self.dim();
        let mut reps: Vec<Option<(usize, usize)>> = vec![None; self.topo.num_unique_kvs()];
        for p in 0..self.num_patches() {
            let (eids, _) = self.topo.element_edges(p);
            let kvdir = self.topo.kv_direction(p)?;
            for (d, &le) in self.dir_edges().iter().enumerate() {
                let ukv = self.topo.knot_ind(eids[le]);
                if reps[ukv].is_none() && kvdir[d] == 1 {
                    reps[ukv] = Some((p, d));
                }
            }
        }
        self.knot_vectors.clear();
        for (ukv, rep) in reps.iter().enumerate() {
            let (p, d) = rep.ok_or_else(|| {
                IgaError::Inconsistent(format!("knot vector {ukv} has no forward patch"))
            })?;
            self.knot_vectors.push(self.patches[p].kv(d).clone());
        }
        let patches = &self.patches;
        self.knot_vectors_compr = (0..patches.len())
            .flat_map(|p| (0..dim).map(move |d| patches[p].kv(d).clone()))
            .collect();
        if !self.consistent_kv_sets() {
            return Err(IgaError::Inconsistent(
                "patch knot vectors disagree within a shared class".into(),
            ));
        }
        Ok(())
    }

    fn set_orders_from_knot_vectors(&mut self) {
        self.orders = self.knot_vectors.iter().map(|kv| kv.order()).collect();
    }

    /// Lay out both entity lattices: vertices, then edge interiors, then
    /// face interiors, then patch interiors. Mesh offsets step by knot
    /// spans, space offsets by control points.
    fn generate_offsets(&mut self) {
        let topo = &self.topo;
        let dim = topo.dim();
        let mut mo = 0usize;
        let mut so = 0usize;

        self.v_mesh = (0..topo.num_vertices()).collect();
        self.v_space = self.v_mesh.clone();
        mo += topo.num_vertices();
        so += topo.num_vertices();

        self.e_mesh.clear();
        self.e_space.clear();
        if dim >= 2 {
            for e in 0..topo.num_edges() {
                let kv = &self.knot_vectors[topo.knot_ind(e)];
                self.e_mesh.push(mo);
                self.e_space.push(so);
                mo += kv.ne() - 1;
                so += kv.ncp() - 2;
            }
        }

        self.f_mesh.clear();
        self.f_space.clear();
        if dim == 3 {
            for f in 0..topo.num_faces() {
                let (feids, _) = topo.face_edges(f);
                let kv0 = &self.knot_vectors[topo.knot_ind(feids[0])];
                let kv1 = &self.knot_vectors[topo.knot_ind(feids[1])];
                self.f_mesh.push(mo);
                self.f_space.push(so);
                mo += (kv0.ne() - 1) * (kv1.ne() - 1);
                so += (kv0.ncp() - 2) * (kv1.ncp() - 2);
            }
        }

        self.p_mesh.clear();
        self.p_space.clear();
        for p in 0..topo.num_patches() {
            let (eids, _) = topo.element_edges(p);
            self.p_mesh.push(mo);
            self.p_space.push(so);
            let mut m = 1usize;
            let mut s = 1usize;
            for &le in self.dir_edges() {
                let kv = &self.knot_vectors[topo.knot_ind(eids[le])];
                m *= kv.ne() - 1;
                s *= kv.ncp() - 2;
            }
            mo += m;
            so += s;
        }

        self.num_mesh_vertices = mo;
        self.num_space_dofs = so;
        self.num_dofs = so;
    }

    fn count_elements(&mut self) {
        let dim = self.dim();
        self.num_elements = (0..self.num_patches())
            .map(|p| {
                (0..dim)
                    .map(|d| self.knot_vectors_compr[dim * p + d].ne())
                    .product::<usize>()
            })
            .sum();
    }

    fn count_bdr_elements(&mut self) {
        let topo = &self.topo;
        self.num_bdr_elements = (0..topo.num_bdr())
            .map(|b| match self.dim() {
                1 => 1,
                2 => {
                    let (eids, _) = topo.bdr_element_edges(b);
                    self.knot_vectors[topo.knot_ind(eids[0])].ne()
                }
                _ => {
                    let (eids, _) = topo.bdr_element_edges(b);
                    self.knot_vectors[topo.knot_ind(eids[0])].ne()
                        * self.knot_vectors[topo.knot_ind(eids[1])].ne()
                }
            })
            .sum();
    }

    fn set_all_active(&mut self) {
        self.active_elem = vec![true; self.num_elements];
        self.num_active_elems = self.num_elements;
        self.active_bdr_elem = vec![true; self.num_bdr_elements];
        self.num_active_bdr_elems = self.num_bdr_elements;
    }

    pub(crate) fn set_active(&mut self, active: Vec<bool>) {
        assert_eq!(active.len(), self.num_elements, "active mask size mismatch");
        self.num_active_elems = active.iter().filter(|&&a| a).count();
        self.active_elem = active;
    }

    pub(crate) fn set_active_bdr(&mut self, active: Vec<bool>) {
        assert_eq!(
            active.len(),
            self.num_bdr_elements,
            "active boundary mask size mismatch"
        );
        self.num_active_bdr_elems = active.iter().filter(|&&a| a).count();
        self.active_bdr_elem = active;
    }

    /// Mark the corner vertices of active elements and number them densely.
    pub(crate) fn generate_active_vertices(&mut self) {
        let dim = self.dim();
        let mut active = vec![-1isize; self.num_mesh_vertices];
        let mut g_el = 0usize;

        for p in 0..self.num_patches() {
            let (map, _) = PatchMap::patch(self, p, Offsets::Mesh);
            let nx = map.nx();
            let ny = if dim >= 2 { map.ny() } else { 1 };
            let nz = if dim == 3 { map.nz() } else { 1 };
            for k in 0..nz as isize {
                for j in 0..ny as isize {
                    for i in 0..nx as isize {
                        if self.active_elem[g_el] {
                            let corners: Vec<usize> = match dim {
                                1 => vec![map.index1(i), map.index1(i + 1)],
                                2 => vec![
                                    map.index2(i, j),
                                    map.index2(i + 1, j),
                                    map.index2(i + 1, j + 1),
                                    map.index2(i, j + 1),
                                ],
                                _ => vec![
                                    map.index3(i, j, k),
                                    map.index3(i + 1, j, k),
                                    map.index3(i + 1, j + 1, k),
                                    map.index3(i, j + 1, k),
                                    map.index3(i, j, k + 1),
                                    map.index3(i + 1, j, k + 1),
                                    map.index3(i + 1, j + 1, k + 1),
                                    map.index3(i, j + 1, k + 1),
                                ],
                            };
                            for v in corners {
                                active[v] = 1;
                            }
                        }
                        g_el += 1;
                    }
                }
            }
        }

        let mut count = 0isize;
        for a in &mut active {
            if *a == 1 {
                *a = count;
                count += 1;
            }
        }
        self.active_vert = active;
        self.num_active_verts = count as usize;
    }

    /// Every boundary element is active when the whole mesh is; partition
    /// boundaries of a restricted mesh are not reconstructed.
    pub(crate) fn generate_active_bdr_elems(&mut self) {
        if self.num_active_elems == self.num_elements {
            self.active_bdr_elem = vec![true; self.num_bdr_elements];
            self.num_active_bdr_elems = self.num_bdr_elements;
        } else {
            self.active_bdr_elem = vec![false; self.num_bdr_elements];
            self.num_active_bdr_elems = 0;
        }
    }

    /// Bezier elements of the active mesh: corner vertex lists (in active
    /// vertex numbering) with the patch attribute.
    pub fn mesh_elements(&self) -> Vec<(Vec<usize>, i32)> {
        let dim = self.dim();
        let mut out = Vec::with_capacity(self.num_active_elems);
        let mut g_el = 0usize;
        for p in 0..self.num_patches() {
            let (map, _) = PatchMap::patch(self, p, Offsets::Mesh);
            let attr = self.topo.attribute(p);
            let nx = map.nx();
            let ny = if dim >= 2 { map.ny() } else { 1 };
            let nz = if dim == 3 { map.nz() } else { 1 };
            for k in 0..nz as isize {
                for j in 0..ny as isize {
                    for i in 0..nx as isize {
                        if self.active_elem[g_el] {
                            let ids = match dim {
                                1 => vec![map.index1(i), map.index1(i + 1)],
                                2 => vec![
                                    map.index2(i, j),
                                    map.index2(i + 1, j),
                                    map.index2(i + 1, j + 1),
                                    map.index2(i, j + 1),
                                ],
                                _ => vec![
                                    map.index3(i, j, k),
                                    map.index3(i + 1, j, k),
                                    map.index3(i + 1, j + 1, k),
                                    map.index3(i, j + 1, k),
                                    map.index3(i, j, k + 1),
                                    map.index3(i + 1, j, k + 1),
                                    map.index3(i + 1, j + 1, k + 1),
                                    map.index3(i, j + 1, k + 1),
                                ],
                            };
                            out.push((
                                ids.into_iter()
                                    .map(|v| self.active_vert[v] as usize)
                                    .collect(),
                                attr,
                            ));
                        }
                        g_el += 1;
                    }
                }
            }
        }
        out
    }

    /// Bezier boundary elements, walked along the boundary knot vectors.
    pub fn mesh_bdr_elements(&self) -> Vec<(Vec<usize>, i32)> {
        let dim = self.dim();
        let mut out = Vec::with_capacity(self.num_active_bdr_elems);
        let mut g_be = 0usize;
        for b in 0..self.num_bdr_patches() {
            let (map, _, okv) = PatchMap::bdr_patch(self, b, Offsets::Mesh);
            let attr = self.topo.bdr_attribute(b);
            match dim {
                1 => {
                    if self.active_bdr_elem[g_be] {
                        out.push((vec![self.active_vert[map.bdr_index1(0)] as usize], attr));
                    }
                    g_be += 1;
                }
                2 => {
                    let nx = map.nx() as isize;
                    for i in 0..nx {
                        if self.active_bdr_elem[g_be] {
                            let i_ = if okv[0] >= 0 { i } else { nx - 1 - i };
                            out.push((
                                vec![
                                    self.active_vert[map.bdr_index1(i_)] as usize,
                                    self.active_vert[map.bdr_index1(i_ + 1)] as usize,
                                ],
                                attr,
                            ));
                        }
                        g_be += 1;
                    }
                }
                _ => {
                    let nx = map.nx() as isize;
                    let ny = map.ny() as isize;
                    for j in 0..ny {
                        let j_ = if okv[1] >= 0 { j } else { ny - 1 - j };
                        for i in 0..nx {
                            if self.active_bdr_elem[g_be] {
                                let i_ = if okv[0] >= 0 { i } else { nx - 1 - i };
                                out.push((
                                    vec![
                                        self.active_vert[map.index2(i_, j_)] as usize,
                                        self.active_vert[map.index2(i_ + 1, j_)] as usize,
                                        self.active_vert[map.index2(i_ + 1, j_ + 1)] as usize,
                                        self.active_vert[map.index2(i_, j_ + 1)] as usize,
                                    ],
                                    attr,
                                ));
                            }
                            g_be += 1;
                        }
                    }
                }
            }
        }
        out
    }

    /// Global lattice vertex of each active vertex.
    pub fn vertex_local_to_global(&self) -> Vec<usize> {
        let mut out = vec![0usize; self.num_active_verts];
        for (gv, &av) in self.active_vert.iter().enumerate() {
            if av >= 0 {
                out[av as usize] = gv;
            }
        }
        out
    }

    /// Global element index of each active element.
    pub fn element_local_to_global(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.num_active_elems);
        for (g, &a) in self.active_elem.iter().enumerate() {
            if a {
                out.push(g);
            }
        }
        out
    }

    // Element DOF tables.

    pub(crate) fn generate_element_dof_table(&mut self) {
        let mut active = vec![0isize; self.num_dofs];
        let (conns, el_to_patch, el_to_ijk) = match self.dim() {
            1 => self.element_dof_conns_1d(&mut active),
            2 => self.element_dof_conns_2d(&mut active),
            _ => self.element_dof_conns_3d(&mut active),
        };
        self.el_to_patch = el_to_patch;
        self.el_to_ijk = el_to_ijk;

        self.num_active_dofs = 0;
        for a in &mut active {
            if *a != 0 {
                self.num_active_dofs += 1;
                *a = self.num_active_dofs as isize;
            }
        }
        self.active_dof = active;

        let mut table = Table::from_connections(self.num_active_elems, &conns);
        let active_dof = &self.active_dof;
        table.map_values(|d| active_dof[d as usize] - 1);
        self.el_dof = Some(table);

        self.patch_to_el = vec![Vec::new(); self.num_patches()];
        for (el, &p) in self.el_to_patch.iter().enumerate() {
            self.patch_to_el[p].push(el);
        }
    }

    fn element_dof_conns_1d(
        &self,
        active: &mut [isize],
    ) -> (Vec<(usize, isize)>, Vec<usize>, Vec<[isize; 3]>) {
        let mut conns = Vec::new();
        let mut el_to_patch = Vec::with_capacity(self.num_active_elems);
        let mut el_to_ijk = Vec::with_capacity(self.num_active_elems);
        let mut el = 0usize;
        let mut eg = 0usize;
        for p in 0..self.num_patches() {
            let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
            let ord0 = kv[0].order();
            for i in 0..kv[0].nks() {
                if kv[0].is_element(i as isize) {
                    if self.active_elem[eg] {
                        for ii in 0..=ord0 {
                            let dof = self.dof_map(map.index1((i + ii) as isize));
                            active[dof] = 1;
                            conns.push((el, dof as isize));
                        }
                        el_to_patch.push(p);
                        el_to_ijk.push([i as isize, 0, 0]);
                        el += 1;
                    }
                    eg += 1;
                }
            }
        }
        (conns, el_to_patch, el_to_ijk)
    }

    fn element_dof_conns_2d(
        &self,
        active: &mut [isize],
    ) -> (Vec<(usize, isize)>, Vec<usize>, Vec<[isize; 3]>) {
        let mut conns = Vec::new();
        let mut el_to_patch = Vec::with_capacity(self.num_active_elems);
        let mut el_to_ijk = Vec::with_capacity(self.num_active_elems);
        let mut el = 0usize;
        let mut eg = 0usize;
        for p in 0..self.num_patches() {
            let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
            let (ord0, ord1) = (kv[0].order(), kv[1].order());
            for j in 0..kv[1].nks() {
                if !kv[1].is_element(j as isize) {
                    continue;
                }
                for i in 0..kv[0].nks() {
                    if !kv[0].is_element(i as isize) {
                        continue;
                    }
                    if self.active_elem[eg] {
                        for jj in 0..=ord1 {
                            for ii in 0..=ord0 {
                                let dof = self
                                    .dof_map(map.index2((i + ii) as isize, (j + jj) as isize));
                                active[dof] = 1;
                                conns.push((el, dof as isize));
                            }
                        }
                        el_to_patch.push(p);
                        el_to_ijk.push([i as isize, j as isize, 0]);
                        el += 1;
                    }
                    eg += 1;
                }
            }
        }
        (conns, el_to_patch, el_to_ijk)
    }

    fn element_dof_conns_3d(
        &self,
        active: &mut [isize],
    ) -> (Vec<(usize, isize)>, Vec<usize>, Vec<[isize; 3]>) {
        let mut conns = Vec::new();
        let mut el_to_patch = Vec::with_capacity(self.num_active_elems);
        let mut el_to_ijk = Vec::with_capacity(self.num_active_elems);
        let mut el = 0usize;
        let mut eg = 0usize;
        for p in 0..self.num_patches() {
            let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
            let (ord0, ord1, ord2) = (kv[0].order(), kv[1].order(), kv[2].order());
            for k in 0..kv[2].nks() {
                if !kv[2].is_element(k as isize) {
                    continue;
                }
                for j in 0..kv[1].nks() {
                    if !kv[1].is_element(j as isize) {
                        continue;
                    }
                    for i in 0..kv[0].nks() {
                        if !kv[0].is_element(i as isize) {
                            continue;
                        }
                        if self.active_elem[eg] {
                            for kk in 0..=ord2 {
                                for jj in 0..=ord1 {
                                    for ii in 0..=ord0 {
                                        let dof = self.dof_map(map.index3(
                                            (i + ii) as isize,
                                            (j + jj) as isize,
                                            (k + kk) as isize,
                                        ));
                                        active[dof] = 1;
                                        conns.push((el, dof as isize));
                                    }
                                }
                            }
                            el_to_patch.push(p);
                            el_to_ijk.push([i as isize, j as isize, k as isize]);
                            el += 1;
                        }
                        eg += 1;
                    }
                }
            }
        }
        (conns, el_to_patch, el_to_ijk)
    }

    pub(crate) fn generate_bdr_element_dof_table(&mut self) {
        let (conns, bel_to_patch, bel_to_ijk) = match self.dim() {
            1 => self.bdr_dof_conns_1d(),
            2 => self.bdr_dof_conns_2d(),
            _ => self.bdr_dof_conns_3d(),
        };
        self.bel_to_patch = bel_to_patch;
        self.bel_to_ijk = bel_to_ijk;

        let mut table = Table::from_connections(self.num_active_bdr_elems, &conns);
        let active_dof = &self.active_dof;
        table.map_values(|idx| {
            if idx < 0 {
                -active_dof[(-1 - idx) as usize]
            } else {
                active_dof[idx as usize] - 1
            }
        });
        self.bel_dof = Some(table);

        self.patch_to_bel = vec![Vec::new(); self.num_bdr_patches()];
        for (bel, &b) in self.bel_to_patch.iter().enumerate() {
            self.patch_to_bel[b].push(bel);
        }
    }

    fn bdr_dof_conns_1d(&self) -> (Vec<(usize, isize)>, Vec<usize>, Vec<[isize; 2]>) {
        let mut conns = Vec::new();
        let mut bel_to_patch = Vec::new();
        let mut bel_to_ijk = Vec::new();
        let mut lbe = 0usize;
        for b in 0..self.num_bdr_patches() {
            if self.active_bdr_elem[b] {
                let (map, _, _) = PatchMap::bdr_patch(self, b, Offsets::Space);
                let dof = self.dof_map(map.bdr_index1(0));
                conns.push((lbe, dof as isize));
                bel_to_patch.push(b);
                bel_to_ijk.push([0, 0]);
                lbe += 1;
            }
        }
        (conns, bel_to_patch, bel_to_ijk)
    }

    fn bdr_dof_conns_2d(&self) -> (Vec<(usize, isize)>, Vec<usize>, Vec<[isize; 2]>) {
        let mut conns = Vec::new();
        let mut bel_to_patch = Vec::new();
        let mut bel_to_ijk = Vec::new();
        let mut gbe = 0usize;
        let mut lbe = 0usize;
        let max_order = self.max_order();
        for b in 0..self.num_bdr_patches() {
            let (map, kv, okv) = PatchMap::bdr_patch(self, b, Offsets::Space);
            let nx = map.nx() as isize;
            let ord0 = kv[0].order();
            let policy =
                self.mode
                    .bdr_policy_2d(self.topo.bdr_element_face(b), ord0, max_order);
            for i in 0..kv[0].nks() {
                if !kv[0].is_element(i as isize) {
                    continue;
                }
                if self.active_bdr_elem[gbe] {
                    if policy.add_dofs {
                        for ii in 0..=ord0 {
                            let idx = if okv[0] >= 0 {
                                (i + ii) as isize
                            } else {
                                nx - i as isize - ii as isize
                            };
                            let mut dof = self.dof_map(map.bdr_index1(idx)) as isize;
                            if policy.sign == -1 {
                                dof = -1 - dof;
                            }
                            conns.push((lbe, dof));
                        }
                    }
                    bel_to_patch.push(b);
                    bel_to_ijk.push([
                        if okv[0] >= 0 {
                            i as isize
                        } else {
                            -1 - i as isize
                        },
                        0,
                    ]);
                    lbe += 1;
                }
                gbe += 1;
            }
        }
        (conns, bel_to_patch, bel_to_ijk)
    }

    fn bdr_dof_conns_3d(&self) -> (Vec<(usize, isize)>, Vec<usize>, Vec<[isize; 2]>) {
        let mut conns = Vec::new();
        let mut bel_to_patch = Vec::new();
        let mut bel_to_ijk = Vec::new();
        let mut gbe = 0usize;
        let mut lbe = 0usize;
        for b in 0..self.num_bdr_patches() {
            let (map, kv, okv) = PatchMap::bdr_patch(self, b, Offsets::Space);
            let nx = map.nx() as isize;
            let ny = map.ny() as isize;
            let (ord0, ord1) = (kv[0].order(), kv[1].order());
            let policy = self
                .mode
                .bdr_policy_3d(self.topo.bdr_element_face(b), ord0, ord1);
            for j in 0..kv[1].nks() {
                if !kv[1].is_element(j as isize) {
                    continue;
                }
                for i in 0..kv[0].nks() {
                    if !kv[0].is_element(i as isize) {
                        continue;
                    }
                    if self.active_bdr_elem[gbe] {
                        if policy.add_dofs {
                            for jj in 0..=ord1 {
                                let jj_ = if okv[1] >= 0 {
                                    (j + jj) as isize
                                } else {
                                    ny - j as isize - jj as isize
                                };
                                for ii in 0..=ord0 {
                                    let ii_ = if okv[0] >= 0 {
                                        (i + ii) as isize
                                    } else {
                                        nx - i as isize - ii as isize
                                    };
                                    let mut dof = self.dof_map(map.index2(ii_, jj_)) as isize;
                                    if policy.sign == -1 {
                                        dof = -1 - dof;
                                    }
                                    conns.push((lbe, dof));
                                }
                            }
                        }
                        bel_to_patch.push(b);
                        bel_to_ijk.push([
                            if okv[0] >= 0 {
                                i as isize
                            } else {
                                -1 - i as isize
                            },
                            if okv[1] >= 0 {
                                j as isize
                            } else {
                                -1 - j as isize
                            },
                        ]);
                        lbe += 1;
                    }
                    gbe += 1;
                }
            }
        }
        (conns, bel_to_patch, bel_to_ijk)
    }

    /// Identified DOFs of a full patch, row-major over control points.
    pub fn patch_dofs(&self, p: usize) -> Vec<usize> {
        let dim = self.dim();
        let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
        match dim {
            1 => (0..kv[0].ncp())
                .map(|i| self.dof_map(map.index1(i as isize)))
                .collect(),
            2 => {
                let (nx, ny) = (kv[0].ncp(), kv[1].ncp());
                let mut dofs = Vec::with_capacity(nx * ny);
                for j in 0..ny {
                    for i in 0..nx {
                        dofs.push(self.dof_map(map.index2(i as isize, j as isize)));
                    }
                }
                dofs
            }
            _ => {
                let (nx, ny, nz) = (kv[0].ncp(), kv[1].ncp(), kv[2].ncp());
                let mut dofs = Vec::with_capacity(nx * ny * nz);
                for k in 0..nz {
                    for j in 0..ny {
                        for i in 0..nx {
                            dofs.push(self.dof_map(map.index3(
                                i as isize,
                                j as isize,
                                k as isize,
                            )));
                        }
                    }
                }
                dofs
            }
        }
    }

    /// Element DOF table over all elements, active or not, in identified
    /// numbering.
    pub(crate) fn global_element_dof_table(&self) -> Table {
        let dim = self.dim();
        let mut conns = Vec::new();
        let mut el = 0usize;
        for p in 0..self.num_patches() {
            let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
            match dim {
                1 => {
                    for i in 0..kv[0].nks() {
                        if kv[0].is_element(i as isize) {
                            for ii in 0..=kv[0].order() {
                                conns.push((
                                    el,
                                    self.dof_map(map.index1((i + ii) as isize)) as isize,
                                ));
                            }
                            el += 1;
                        }
                    }
                }
                2 => {
                    for j in 0..kv[1].nks() {
                        if !kv[1].is_element(j as isize) {
                            continue;
                        }
                        for i in 0..kv[0].nks() {
                            if !kv[0].is_element(i as isize) {
                                continue;
                            }
                            for jj in 0..=kv[1].order() {
                                for ii in 0..=kv[0].order() {
                                    conns.push((
                                        el,
                                        self.dof_map(
                                            map.index2((i + ii) as isize, (j + jj) as isize),
                                        ) as isize,
                                    ));
                                }
                            }
                            el += 1;
                        }
                    }
                }
                _ => {
                    for k in 0..kv[2].nks() {
                        if !kv[2].is_element(k as isize) {
                            continue;
                        }
                        for j in 0..kv[1].nks() {
                            if !kv[1].is_element(j as isize) {
                                continue;
                            }
                            for i in 0..kv[0].nks() {
                                if !kv[0].is_element(i as isize) {
                                    continue;
                                }
                                for kk in 0..=kv[2].order() {
                                    for jj in 0..=kv[1].order() {
                                        for ii in 0..=kv[0].order() {
                                            conns.push((
                                                el,
                                                self.dof_map(map.index3(
                                                    (i + ii) as isize,
                                                    (j + jj) as isize,
                                                    (k + kk) as isize,
                                                ))
                                                    as isize,
                                            ));
                                        }
                                    }
                                }
                                el += 1;
                            }
                        }
                    }
                }
            }
        }
        Table::from_connections(self.num_elements, &conns)
    }

    // Periodic identification.

    /// Identify DOFs across master/slave boundary-attribute pairs, compact
    /// the identified numbering and regenerate the DOF tables.
    pub fn connect_boundaries(&mut self, master: &[i32], slave: &[i32]) -> Result<()> {
        if master.len() != slave.len() {
            return Err(IgaError::Inconsistent(
                "master and slave boundary lists differ in length".into(),
            ));
        }
        self.master = master.to_vec();
        self.slave = slave.to_vec();
        self.apply_periodic()
    }

    fn find_bdr_patch(&self, attribute: i32) -> Result<usize> {
        (0..self.num_bdr_patches())
            .find(|&b| self.topo.bdr_attribute(b) == attribute)
            .ok_or_else(|| {
                IgaError::Inconsistent(format!("no boundary patch with attribute {attribute}"))
            })
    }

    pub(crate) fn apply_periodic(&mut self) -> Result<()> {
        if self.master.is_empty() {
            return Ok(());
        }

        // Identification always starts from the raw lattice, so repeated
        // calls never read an already-compacted numbering.
        let old_active_dof = std::mem::take(&mut self.active_dof);
        let old_d_to_d = std::mem::take(&mut self.d_to_d);
        let old_weights = std::mem::take(&mut self.weights);

        let mut merger = DofMerger::new(self.num_space_dofs);
        for i in 0..self.master.len() {
            let bnd0 = self.find_bdr_patch(self.master[i])?;
            let bnd1 = self.find_bdr_patch(self.slave[i])?;
            match self.dim() {
                1 => self.connect_1d(bnd0, bnd1, &mut merger),
                2 => self.connect_2d(bnd0, bnd1, &mut merger)?,
                _ => self.connect_3d(bnd0, bnd1, &mut merger)?,
            }
        }
        let (map, count) = merger.compact();
        self.d_to_d = map;
        self.num_dofs = count;

        self.generate_element_dof_table();
        self.generate_bdr_element_dof_table();

        // Carry weights over to the new active numbering.
        if !old_weights.is_empty() {
            let mut w = vec![1.0; self.num_active_dofs];
            for raw in 0..self.num_space_dofs {
                let old_id = if old_d_to_d.is_empty() {
                    raw
                } else {
                    old_d_to_d[raw]
                };
                let old_act = if old_active_dof.is_empty() {
                    old_id as isize + 1
                } else {
                    old_active_dof[old_id]
                };
                let new_act = self.active_dof[self.d_to_d[raw]];
                if old_act > 0 && new_act > 0 {
                    w[(new_act - 1) as usize] = old_weights[(old_act - 1) as usize];
                }
            }
            self.weights = w;
        }
        Ok(())
    }

    fn connect_1d(&self, bnd0: usize, bnd1: usize, merger: &mut DofMerger) {
        let (m0, _, _) = PatchMap::bdr_patch(self, bnd0, Offsets::Space);
        let (m1, _, _) = PatchMap::bdr_patch(self, bnd1, Offsets::Space);
        merger.union(m0.bdr_index1(0), m1.bdr_index1(0));
    }

    fn connect_2d(&self, bnd0: usize, bnd1: usize, merger: &mut DofMerger) -> Result<()> {
        let (m0, kv0, okv0) = PatchMap::bdr_patch(self, bnd0, Offsets::Space);
        let (m1, kv1, okv1) = PatchMap::bdr_patch(self, bnd1, Offsets::Space);
        if m0.nx() != m1.nx()
            || kv0[0].nks() != kv1[0].nks()
            || kv0[0].order() != kv1[0].order()
        {
            return Err(IgaError::Inconsistent(
                "periodic boundaries are not compatible".into(),
            ));
        }
        let nx = m0.nx() as isize;
        for i in 0..kv0[0].nks() {
            if !kv0[0].is_element(i as isize) {
                continue;
            }
            if !kv1[0].is_element(i as isize) {
                return Err(IgaError::Inconsistent(
                    "periodic boundaries break into different knot spans".into(),
                ));
            }
            for ii in 0..=kv0[0].order() {
                let i0 = if okv0[0] >= 0 {
                    (i + ii) as isize
                } else {
                    nx - i as isize - ii as isize
                };
                let i1 = if okv1[0] >= 0 {
                    (i + ii) as isize
                } else {
                    nx - i as isize - ii as isize
                };
                merger.union(m0.bdr_index1(i0), m1.bdr_index1(i1));
            }
        }
        Ok(())
    }

    fn connect_3d(&self, bnd0: usize, bnd1: usize, merger: &mut DofMerger) -> Result<()> {
        let (m0, kv0, okv0) = PatchMap::bdr_patch(self, bnd0, Offsets::Space);
        let (m1, kv1, okv1) = PatchMap::bdr_patch(self, bnd1, Offsets::Space);
        let compatible = m0.nx() == m1.nx()
            && m0.ny() == m1.ny()
            && kv0[0].nks() == kv1[0].nks()
            && kv0[1].nks() == kv1[1].nks()
            && kv0[0].order() == kv1[0].order()
            && kv0[1].order() == kv1[1].order();
        if !compatible {
            return Err(IgaError::Inconsistent(
                "periodic boundaries are not compatible".into(),
            ));
        }
        let nx = m0.nx() as isize;
        let ny = m0.ny() as isize;
        for j in 0..kv0[1].nks() {
            if !kv0[1].is_element(j as isize) {
                continue;
            }
            for i in 0..kv0[0].nks() {
                if !kv0[0].is_element(i as isize) {
                    continue;
                }
                for jj in 0..=kv0[1].order() {
                    let j0 = if okv0[1] >= 0 {
                        (j + jj) as isize
                    } else {
                        ny - j as isize - jj as isize
                    };
                    let j1 = if okv1[1] >= 0 {
                        (j + jj) as isize
                    } else {
                        ny - j as isize - jj as isize
                    };
                    for ii in 0..=kv0[0].order() {
                        let i0 = if okv0[0] >= 0 {
                            (i + ii) as isize
                        } else {
                            nx - i as isize - ii as isize
                        };
                        let i1 = if okv1[0] >= 0 {
                            (i + ii) as isize
                        } else {
                            nx - i as isize - ii as isize
                        };
                        merger.union(m0.index2(i0, j0), m1.index2(i1, j1));
                    }
                }
            }
        }
        Ok(())
    }

    // Patch form of the control net.

    /// Rebuild the patch form from flat coordinates (vdim-interleaved over
    /// active DOFs) and the stored weights. Drops the DOF tables; call
    /// [`Extension::set_knots_from_patches`] to rebuild after editing knots.
    pub fn convert_to_patches(&mut self, coords: &[f64]) {
        assert!(
            self.num_active_dofs > 0 && coords.len() % self.num_active_dofs == 0,
            "coordinate vector does not divide into DOFs"
        );
        let vdim = coords.len() / self.num_active_dofs;
        let dim = self.dim();
        self.el_dof = None;
        self.bel_dof = None;

        let mut patches = Vec::with_capacity(self.num_patches());
        for p in 0..self.num_patches() {
            let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
            let kvs: Vec<KnotVector> = (0..dim).map(|d| self.compr_kv(p, d).clone()).collect();
            let mut patch = Patch::new(kvs, vdim + 1);
            match dim {
                1 => {
                    for i in 0..kv[0].ncp() {
                        let l = self.dof_map(map.index1(i as isize));
                        for d in 0..vdim {
                            *patch.at1_mut(i, d) = coords[l * vdim + d] * self.weights[l];
                        }
                        *patch.at1_mut(i, vdim) = self.weights[l];
                    }
                }
                2 => {
                    for j in 0..kv[1].ncp() {
                        for i in 0..kv[0].ncp() {
                            let l = self.dof_map(map.index2(i as isize, j as isize));
                            for d in 0..vdim {
                                *patch.at2_mut(i, j, d) = coords[l * vdim + d] * self.weights[l];
                            }
                            *patch.at2_mut(i, j, vdim) = self.weights[l];
                        }
                    }
                }
                _ => {
                    for k in 0..kv[2].ncp() {
                        for j in 0..kv[1].ncp() {
                            for i in 0..kv[0].ncp() {
                                let l =
                                    self.dof_map(map.index3(i as isize, j as isize, k as isize));
                                for d in 0..vdim {
                                    *patch.at3_mut(i, j, k, d) =
                                        coords[l * vdim + d] * self.weights[l];
                                }
                                *patch.at3_mut(i, j, k, vdim) = self.weights[l];
                            }
                        }
                    }
                }
            }
            patches.push(patch);
        }
        self.patches = patches;
    }

    /// Extract flat coordinates and weights from the patch form, then drop
    /// the patches.
    pub fn set_coords_from_patches(&mut self) -> Result<Vec<f64>> {
        if self.patches.is_empty() {
            return Err(IgaError::InvalidOperation(
                "no patches to take coordinates from".into(),
            ));
        }
        let dim = self.dim();
        let vdim = self.patches[0].dim() - 1;
        let mut coords = vec![0.0; vdim * self.num_active_dofs];
        let mut weights = vec![1.0; self.num_active_dofs];

        for p in 0..self.num_patches() {
            let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
            let patch = &self.patches[p];
            let mut store = |l: usize, vals: &[f64]| {
                let w = vals[vdim];
                weights[l] = w;
                for d in 0..vdim {
                    coords[l * vdim + d] = vals[d] / w;
                }
            };
            match dim {
                1 => {
                    for i in 0..kv[0].ncp() {
                        let l = self.dof_map(map.index1(i as isize));
                        let vals: Vec<f64> = (0..=vdim).map(|d| patch.at1(i, d)).collect();
                        store(l, &vals);
                    }
                }
                2 => {
                    for j in 0..kv[1].ncp() {
                        for i in 0..kv[0].ncp() {
                            let l = self.dof_map(map.index2(i as isize, j as isize));
                            let vals: Vec<f64> = (0..=vdim).map(|d| patch.at2(i, j, d)).collect();
                            store(l, &vals);
                        }
                    }
                }
                _ => {
                    for k in 0..kv[2].ncp() {
                        for j in 0..kv[1].ncp() {
                            for i in 0..kv[0].ncp() {
                                let l =
                                    self.dof_map(map.index3(i as isize, j as isize, k as isize));
                                let vals: Vec<f64> =
                                    (0..=vdim).map(|d| patch.at3(i, j, k, d)).collect();
                                store(l, &vals);
                            }
                        }
                    }
                }
            }
        }
        self.weights = weights;
        self.patches.clear();
        Ok(coords)
    }

    /// Adopt the (possibly refined) knot vectors of the patch form and
    /// rebuild every derived structure.
    pub fn set_knots_from_patches(&mut self) -> Result<()> {
        if self.patches.is_empty() {
            return Err(IgaError::InvalidOperation(
                "no patches to take knot vectors from".into(),
            ));
        }
        let dim = self.dim();
        for p in 0..self.num_patches() {
            for d in 0..dim {
                self.knot_vectors_compr[dim * p + d] = self.patches[p].kv(d).clone();
            }
        }
        self.update_unique_kvs()?;
        if !self.consistent_kv_sets() {
            return Err(IgaError::Inconsistent(
                "patch knot vectors disagree within a shared class".into(),
            ));
        }
        self.set_orders_from_knot_vectors();
        self.generate_offsets();
        self.count_elements();
        self.count_bdr_elements();
        self.set_all_active();
        self.generate_active_vertices();
        self.num_dofs = self.num_space_dofs;
        self.d_to_d.clear();
        self.weights.clear();
        self.generate_element_dof_table();
        self.generate_active_bdr_elems();
        self.generate_bdr_element_dof_table();
        self.apply_periodic()
    }

    /// Read a per-patch solution block, vdim values per control point.
    pub fn load_solution<R: BufRead>(&self, r: &mut TextReader<R>, vdim: usize) -> Result<Vec<f64>> {
        let dim = self.dim();
        let mut sol = vec![0.0; vdim * self.num_active_dofs];
        for p in 0..self.num_patches() {
            let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
            let ncp: Vec<usize> = (0..dim).map(|d| kv[d].ncp()).collect();
            let nz = if dim == 3 { ncp[2] } else { 1 };
            let ny = if dim >= 2 { ncp[1] } else { 1 };
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..ncp[0] {
                        let l = match dim {
                            1 => map.index1(i as isize),
                            2 => map.index2(i as isize, j as isize),
                            _ => map.index3(i as isize, j as isize, k as isize),
                        };
                        let l = self.dof_map(l);
                        for d in 0..vdim {
                            sol[l * vdim + d] = r.f64()?;
                        }
                    }
                }
            }
        }
        Ok(sol)
    }

    /// Write a solution in the block layout [`Extension::load_solution`]
    /// reads.
    pub fn print_solution(&self, sol: &[f64], vdim: usize, w: &mut dyn Write) -> Result<()> {
        let dim = self.dim();
        for p in 0..self.num_patches() {
            writeln!(w, "\n# patch {p}\n")?;
            let (map, kv) = PatchMap::patch(self, p, Offsets::Space);
            let ncp: Vec<usize> = (0..dim).map(|d| kv[d].ncp()).collect();
            let nz = if dim == 3 { ncp[2] } else { 1 };
            let ny = if dim >= 2 { ncp[1] } else { 1 };
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..ncp[0] {
                        let l = match dim {
                            1 => map.index1(i as isize),
                            2 => map.index2(i as isize, j as isize),
                            _ => map.index3(i as isize, j as isize, k as isize),
                        };
                        let l = self.dof_map(l);
                        for d in 0..vdim {
                            if d > 0 {
                                write!(w, " ")?;
                            }
                            write!(w, "{}", sol[l * vdim + d])?;
                        }
                        writeln!(w)?;
                    }
                }
            }
        }
        Ok(())
    }

    // Refinement family. All of these require the patch form.

    /// Raise each patch direction by `rel_degree`, capped at `max_degree`.
    pub fn degree_elevate(&mut self, rel_degree: usize, max_degree: usize) {
        assert!(!self.patches.is_empty(), "degree elevation needs the patch form");
        for patch in &mut self.patches {
            for d in 0..patch.num_dirs() {
                let old = patch.kv(d).order();
                let newd = (old + rel_degree).min(max_degree);
                if newd > old {
                    patch.degree_elevate(d, newd - old);
                }
            }
        }
    }

    pub fn uniform_refinement(&mut self, rf: &[usize]) {
        assert!(!self.patches.is_empty(), "refinement needs the patch form");
        for patch in &mut self.patches {
            patch.uniform_refinement(rf);
        }
    }

    pub fn uniform_refinement_all(&mut self, rf: usize) {
        assert!(!self.patches.is_empty(), "refinement needs the patch form");
        for patch in &mut self.patches {
            patch.uniform_refinement_all(rf);
        }
    }

    /// Coarsen every patch by `cf`, removing knots that reproduce the
    /// geometry within `tol`. Knot vectors are unmarked first so a full
    /// coarsening pass runs once over each.
    pub fn coarsen(&mut self, cf: usize, tol: f64) {
        assert!(!self.patches.is_empty(), "coarsening needs the patch form");
        for patch in &mut self.patches {
            patch.set_knot_vectors_coarse(false);
        }
        for patch in &mut self.patches {
            patch.coarsen_all(cf, tol);
        }
    }

    /// Per-direction coarsening factors merged over patches. Factors must
    /// agree where two patches see the same direction; 1 is neutral.
    pub fn coarsening_factors(&self) -> Result<Vec<usize>> {
        assert!(!self.patches.is_empty(), "coarsening needs the patch form");
        let mut merged = vec![1usize; self.dim()];
        for patch in &self.patches {
            for (d, f) in patch.coarsening_factors().into_iter().enumerate() {
                if merged[d] == 1 {
                    merged[d] = f;
                } else if f != 1 && f != merged[d] {
                    return Err(IgaError::Inconsistent(format!(
                        "patches disagree on the coarsening factor in direction {d}"
                    )));
                }
            }
        }
        Ok(merged)
    }

    /// Insert whole knot vectors, one per unique class, into every patch,
    /// flipped into each patch's direction.
    pub fn knot_insert_kvs(&mut self, kvs: &[KnotVector]) -> Result<()> {
        assert!(!self.patches.is_empty(), "knot insertion needs the patch form");
        let dir_edges = self.dir_edges();
        for p in 0..self.num_patches() {
            let (eids, _) = self.topo.element_edges(p);
            let kvdir = self.topo.kv_direction(p)?;
            let mut pkv = Vec::with_capacity(dir_edges.len());
            for (d, &le) in dir_edges.iter().enumerate() {
                let mut kv = kvs[self.topo.knot_ind(eids[le])].clone();
                if kvdir[d] == -1 {
                    kv.flip();
                }
                pkv.push(kv);
            }
            self.patches[p].knot_insert_kvs(&pkv);
        }
        Ok(())
    }

    /// Insert lists of knot values, one list per unique class.
    pub fn knot_insert_vecs(&mut self, knots: &[Vec<f64>]) -> Result<()> {
        assert!(!self.patches.is_empty(), "knot insertion needs the patch form");
        let dir_edges = self.dir_edges();
        for p in 0..self.num_patches() {
            let (eids, _) = self.topo.element_edges(p);
            let kvdir = self.topo.kv_direction(p)?;
            for (d, &le) in dir_edges.iter().enumerate() {
                let list = &knots[self.topo.knot_ind(eids[le])];
                if list.is_empty() {
                    continue;
                }
                let list = self.oriented_knots(p, d, kvdir[d], list);
                self.patches[p].knot_insert(d, &list);
            }
        }
        Ok(())
    }

    /// Remove lists of knot values, one list per unique class. Removals
    /// that would move the geometry beyond `tol` are skipped.
    pub fn knot_remove_vecs(&mut self, knots: &[Vec<f64>], tol: f64) -> Result<()> {
        assert!(!self.patches.is_empty(), "knot removal needs the patch form");
        let dir_edges = self.dir_edges();
        for p in 0..self.num_patches() {
            let (eids, _) = self.topo.element_edges(p);
            let kvdir = self.topo.kv_direction(p)?;
            for (d, &le) in dir_edges.iter().enumerate() {
                let list = &knots[self.topo.knot_ind(eids[le])];
                if list.is_empty() {
                    continue;
                }
                let list = self.oriented_knots(p, d, kvdir[d], list);
                self.patches[p].knot_remove_vec(d, &list, tol);
            }
        }
        Ok(())
    }

    /// Knot values mirrored into the patch's parameter direction: a patch
    /// running against its class sees knot `u` at `a + b - u`.
    fn oriented_knots(&self, p: usize, d: usize, kvdir: i32, list: &[f64]) -> Vec<f64> {
        if kvdir != -1 {
            return list.to_vec();
        }
        let kvc = self.compr_kv(p, d);
        let knots = kvc.knots();
        let apb = knots[0] + knots[knots.len() - 1];
        list.iter().rev().map(|u| apb - u).collect()
    }

    // Output.

    /// Write the full mesh file in the format [`Extension::from_reader`]
    /// accepts.
    pub fn write(&self, w: &mut dyn Write) -> Result<()> {
        let spaced = self
            .knot_vectors
            .iter()
            .any(|kv| kv.spacing.is_some());
        let version = if spaced && self.patches.is_empty() {
            "v1.1"
        } else {
            "v1.0"
        };
        writeln!(w, "patch-topology {version}")?;
        self.topo.write(w)?;

        if self.patches.is_empty() {
            writeln!(w, "\nknotvectors\n{}", self.knot_vectors.len())?;
            for kv in &self.knot_vectors {
                kv.write(w)?;
            }
            if spaced {
                let n = self
                    .knot_vectors
                    .iter()
                    .filter(|kv| kv.spacing.is_some())
                    .count();
                writeln!(w, "\nspacing\n{n}")?;
                for (i, kv) in self.knot_vectors.iter().enumerate() {
                    if let Some(rule) = &kv.spacing {
                        write!(w, "{i} ")?;
                        rule.borrow().write(w)?;
                    }
                }
            }
            if self.num_active_elems != self.num_elements {
                writeln!(w, "\nmesh_elements\n{}", self.num_active_elems)?;
                for (e, &a) in self.active_elem.iter().enumerate() {
                    if a {
                        writeln!(w, "{e}")?;
                    }
                }
            }
            if !self.master.is_empty() {
                writeln!(w, "\nperiodic\n{}", self.master.len())?;
                for m in &self.master {
                    writeln!(w, "{m}")?;
                }
                writeln!(w, "{}", self.slave.len())?;
                for s in &self.slave {
                    writeln!(w, "{s}")?;
                }
            }
            if self.weights.iter().all(|&x| x == 1.0) {
                writeln!(w, "\nunitweights")?;
            } else {
                writeln!(w, "\nweights")?;
                for x in &self.weights {
                    writeln!(w, "{x}")?;
                }
            }
        } else {
            writeln!(w, "\npatches")?;
            for (p, patch) in self.patches.iter().enumerate() {
                writeln!(w, "\n# patch {p}\n")?;
                patch.write(w)?;
            }
        }
        Ok(())
    }

    /// Human-readable summary of the space.
    pub fn print_characteristics(&self, w: &mut dyn Write) -> Result<()> {
        writeln!(w, "NURBS space characteristics:")?;
        writeln!(w, "  dimension          = {}", self.dim())?;
        writeln!(w, "  unique knotvectors = {}", self.knot_vectors.len())?;
        for (i, kv) in self.knot_vectors.iter().enumerate() {
            writeln!(
                w,
                "  kv {i}: order {}, {} control points, {} elements",
                kv.order(),
                kv.ncp(),
                kv.ne()
            )?;
        }
        writeln!(w, "  patches            = {}", self.num_patches())?;
        writeln!(w, "  boundary patches   = {}", self.num_bdr_patches())?;
        writeln!(
            w,
            "  elements           = {} active of {}",
            self.num_active_elems, self.num_elements
        )?;
        writeln!(
            w,
            "  boundary elements  = {} active of {}",
            self.num_active_bdr_elems, self.num_bdr_elements
        )?;
        writeln!(
            w,
            "  dofs               = {} active of {}",
            self.num_active_dofs, self.num_dofs
        )?;
        writeln!(w, "  vertices           = {}", self.num_active_verts)?;
        Ok(())
    }

    /// Sample every unique knot vector's basis functions into
    /// `<basename>_<i>.dat`.
    pub fn print_functions(&self, basename: &str, samples: usize) -> Result<()> {
        for (i, kv) in self.knot_vectors.iter().enumerate() {
            let mut f = std::fs::File::create(format!("{basename}_{i}.dat"))?;
            kv.print_functions(&mut f, samples)?;
        }
        Ok(())
    }
}

/// Default tolerance used when callers do not pass one to knot removal.
pub fn default_removal_tolerance() -> f64 {
    Tolerance::DEFAULT_REMOVAL
}

fn read_spacing<R: BufRead>(r: &mut TextReader<R>) -> Result<SpacingRule> {
    let type_id = r.usize()?;
    let nint = r.usize()?;
    let nreal = r.usize()?;
    let mut ipar = Vec::with_capacity(nint);
    for _ in 0..nint {
        ipar.push(r.isize()?);
    }
    let mut dpar = Vec::with_capacity(nreal);
    for _ in 0..nreal {
        dpar.push(r.f64()?);
    }
    SpacingRule::from_params(type_id, &ipar, &dpar)
}
