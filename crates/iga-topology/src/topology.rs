use std::collections::HashMap;
use std::io::{BufRead, Write};

use iga_core::{IgaError, Result, TextReader};
use serde::{Deserialize, Serialize};

use crate::ordering::*;

/// One patch or boundary element: its global vertices plus an attribute tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub verts: Vec<usize>,
    pub attribute: i32,
}

/// Coarse patch-level mesh of dimension 1, 2 or 3.
///
/// Patches are segments, quads or hexes over a shared vertex set. Edges and
/// faces are registered in discovery order while patches are added; an edge is
/// stored with its vertices in ascending order, a face with the vertex order
/// of the first patch that registered it. Boundary quads are renumbered to
/// the stored order of their face on insertion, so a boundary element always
/// parametrizes its face the way the face interior is stored.
///
/// Every edge belongs to a unique-knot-vector class, encoded in `edge_to_ukv`
/// as the class index when the knot vector runs with the stored edge
/// direction and as `-1 - class` when it runs against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchTopology {
    dim: usize,
    num_vertices: usize,
    elements: Vec<Element>,
    boundary: Vec<Element>,
    edges: Vec<[usize; 2]>,
    faces: Vec<[usize; 4]>,
    edge_to_ukv: Vec<isize>,
    num_unique_kvs: usize,
    el_edges: Vec<Vec<usize>>,
    el_edge_ori: Vec<Vec<i32>>,
    el_faces: Vec<Vec<usize>>,
    el_face_ori: Vec<Vec<usize>>,
    face_edges: Vec<Vec<usize>>,
    face_edge_ori: Vec<Vec<i32>>,
    bdr_edges: Vec<Vec<usize>>,
    bdr_edge_ori: Vec<Vec<i32>>,
    bdr_face: Vec<usize>,
    edge_index: HashMap<[usize; 2], usize>,
    face_index: HashMap<[usize; 4], usize>,
}

impl PatchTopology {
    pub fn new(dim: usize, num_vertices: usize) -> Self {
        assert!((1..=3).contains(&dim), "unsupported mesh dimension {dim}");
        PatchTopology {
            dim,
            num_vertices,
            elements: Vec::new(),
            boundary: Vec::new(),
            edges: Vec::new(),
            faces: Vec::new(),
            edge_to_ukv: Vec::new(),
            num_unique_kvs: 0,
            el_edges: Vec::new(),
            el_edge_ori: Vec::new(),
            el_faces: Vec::new(),
            el_face_ori: Vec::new(),
            face_edges: Vec::new(),
            face_edge_ori: Vec::new(),
            bdr_edges: Vec::new(),
            bdr_edge_ori: Vec::new(),
            bdr_face: Vec::new(),
            edge_index: HashMap::new(),
            face_index: HashMap::new(),
        }
    }

    fn check_verts(&self, verts: &[usize], want: usize) -> Result<()> {
        if verts.len() != want {
            return Err(IgaError::Topology(format!(
                "expected {want} vertices, got {}",
                verts.len()
            )));
        }
        for &v in verts {
            if v >= self.num_vertices {
                return Err(IgaError::Topology(format!("vertex {v} out of range")));
            }
        }
        Ok(())
    }

    fn edge_id(&self, a: usize, b: usize) -> Option<(usize, i32)> {
        let key = [a.min(b), a.max(b)];
        let id = *self.edge_index.get(&key)?;
        Some((id, if a < b { 1 } else { -1 }))
    }

    fn register_edge(&mut self, a: usize, b: usize) -> (usize, i32) {
        let key = [a.min(b), a.max(b)];
        let id = *self.edge_index.entry(key).or_insert_with(|| {
            self.edges.push(key);
            self.edges.len() - 1
        });
        (id, if a < b { 1 } else { -1 })
    }

    /// Add a patch element. Registers any new edges and faces it touches and
    /// records their orientation as seen from this patch.
    pub fn add_patch(&mut self, verts: &[usize], attribute: i32) -> Result<usize> {
        let nvert = match self.dim {
            1 => 2,
            2 => 4,
            _ => 8,
        };
        self.check_verts(verts, nvert)?;

        let mut eids = Vec::new();
        let mut eori = Vec::new();
        match self.dim {
            1 => {
                // Every segment carries its own edge; the edge id equals the
                // patch id and keeps the segment's direction.
                self.edges.push([verts[0], verts[1]]);
                eids.push(self.edges.len() - 1);
                eori.push(1);
            }
            2 => {
                for pair in QUAD_EDGES {
                    let (id, ori) = self.register_edge(verts[pair[0]], verts[pair[1]]);
                    eids.push(id);
                    eori.push(ori);
                }
            }
            _ => {
                for pair in HEX_EDGES {
                    let (id, ori) = self.register_edge(verts[pair[0]], verts[pair[1]]);
                    eids.push(id);
                    eori.push(ori);
                }
            }
        }

        let mut fids = Vec::new();
        let mut fori = Vec::new();
        if self.dim == 3 {
            for local in HEX_FACES {
                let fverts = [
                    verts[local[0]],
                    verts[local[1]],
                    verts[local[2]],
                    verts[local[3]],
                ];
                let mut key = fverts;
                key.sort_unstable();
                if let Some(&id) = self.face_index.get(&key) {
                    let ori = quad_orientation(&self.faces[id], &fverts).ok_or_else(|| {
                        IgaError::Topology(format!("face {id} shared with incompatible vertex order"))
                    })?;
                    fids.push(id);
                    fori.push(ori);
                } else {
                    let id = self.faces.len();
                    self.faces.push(fverts);
                    self.face_index.insert(key, id);
                    let mut fe = Vec::with_capacity(4);
                    let mut feo = Vec::with_capacity(4);
                    for k in 0..4 {
                        let (eid, ori) = self
                            .edge_id(fverts[k], fverts[(k + 1) % 4])
                            .expect("face edge registered with its hex");
                        fe.push(eid);
                        feo.push(ori);
                    }
                    self.face_edges.push(fe);
                    self.face_edge_ori.push(feo);
                    fids.push(id);
                    fori.push(0);
                }
            }
        }

        self.elements.push(Element {
            verts: verts.to_vec(),
            attribute,
        });
        self.el_edges.push(eids);
        self.el_edge_ori.push(eori);
        self.el_faces.push(fids);
        self.el_face_ori.push(fori);
        Ok(self.elements.len() - 1)
    }

    /// Add a boundary element (point, segment or quad, one dimension below
    /// the mesh). Its entities must already exist on some patch.
    pub fn add_boundary(&mut self, verts: &[usize], attribute: i32) -> Result<usize> {
        let nvert = match self.dim {
            1 => 1,
            2 => 2,
            _ => 4,
        };
        self.check_verts(verts, nvert)?;

        let mut bverts = verts.to_vec();
        match self.dim {
            1 => {
                self.bdr_edges.push(Vec::new());
                self.bdr_edge_ori.push(Vec::new());
                self.bdr_face.push(verts[0]);
            }
            2 => {
                let (id, ori) = self.edge_id(verts[0], verts[1]).ok_or_else(|| {
                    IgaError::Topology(format!(
                        "boundary segment ({}, {}) is not a patch edge",
                        verts[0], verts[1]
                    ))
                })?;
                self.bdr_edges.push(vec![id]);
                self.bdr_edge_ori.push(vec![ori]);
                self.bdr_face.push(id);
            }
            _ => {
                let mut key = [verts[0], verts[1], verts[2], verts[3]];
                key.sort_unstable();
                let id = *self.face_index.get(&key).ok_or_else(|| {
                    IgaError::Topology(format!("boundary quad {verts:?} is not a patch face"))
                })?;
                // Renumber to the stored face order so the boundary element's
                // parametrization matches the face-interior storage.
                bverts = self.faces[id].to_vec();
                let mut be = Vec::with_capacity(4);
                let mut beo = Vec::with_capacity(4);
                for k in 0..4 {
                    let (eid, ori) = self
                        .edge_id(bverts[k], bverts[(k + 1) % 4])
                        .expect("face edges exist");
                    be.push(eid);
                    beo.push(ori);
                }
                self.bdr_edges.push(be);
                self.bdr_edge_ori.push(beo);
                self.bdr_face.push(id);
            }
        }

        self.boundary.push(Element {
            verts: bverts,
            attribute,
        });
        Ok(self.boundary.len() - 1)
    }

    /// Assign unique-knot-vector classes from an explicit edge list, as read
    /// from the `edges` file section. Each entry is `(class, v0, v1)` with the
    /// knot vector running v0 to v1.
    pub fn assign_knot_classes(&mut self, entries: &[(usize, usize, usize)]) -> Result<()> {
        self.edge_to_ukv = vec![isize::MIN; self.edges.len()];
        let mut max_kv = 0;
        for &(ukv, v0, v1) in entries {
            let id = if self.dim == 1 {
                self.edges
                    .iter()
                    .position(|e| e == &[v0, v1] || e == &[v1, v0])
                    .ok_or_else(|| {
                        IgaError::Topology(format!("edge ({v0}, {v1}) not found"))
                    })?
            } else {
                self.edge_id(v0, v1)
                    .ok_or_else(|| IgaError::Topology(format!("edge ({v0}, {v1}) not found")))?
                    .0
            };
            self.edge_to_ukv[id] = if v0 < v1 || self.dim == 1 {
                ukv as isize
            } else {
                -1 - ukv as isize
            };
            max_kv = max_kv.max(ukv + 1);
        }
        if self.edge_to_ukv.contains(&isize::MIN) {
            return Err(IgaError::Inconsistent(
                "edge list does not cover all patch edges".into(),
            ));
        }
        self.num_unique_kvs = max_kv;
        Ok(())
    }

    /// Derive unique-knot-vector classes by unioning parallel edges within
    /// every patch, with directions taken from the patch axes. Returns the
    /// representative `(patch, direction)` of each class.
    pub fn derive_knot_classes(&mut self) -> Result<Vec<(usize, usize)>> {
        let ne = self.edges.len();
        if self.dim == 1 {
            self.edge_to_ukv = (0..ne as isize).collect();
            self.num_unique_kvs = ne;
            return Ok((0..self.elements.len()).map(|p| (p, 0)).collect());
        }

        let mut parent: Vec<usize> = (0..ne).collect();
        fn find(parent: &mut [usize], mut e: usize) -> usize {
            while parent[e] != e {
                parent[e] = parent[parent[e]];
                e = parent[e];
            }
            e
        }
        for p in 0..self.elements.len() {
            for d in 0..self.dim {
                let group = self.direction_edges(d);
                let first = self.el_edges[p][group[0].0];
                for &(le, _) in &group[1..] {
                    let a = find(&mut parent, first);
                    let b = find(&mut parent, self.el_edges[p][le]);
                    parent[a.max(b)] = a.min(b);
                }
            }
        }

        let mut class_of = vec![usize::MAX; ne];
        let mut next = 0;
        for e in 0..ne {
            let r = find(&mut parent, e);
            if class_of[r] == usize::MAX {
                class_of[r] = next;
                next += 1;
            }
            class_of[e] = class_of[r];
        }

        // Orient each edge's class by its patch axis: the knot vector runs
        // along +d of any patch containing the edge.
        let mut sign = vec![0i32; ne];
        let mut rep = vec![None; next];
        for p in 0..self.elements.len() {
            let kvdir = self.kv_direction(p)?;
            for d in 0..self.dim {
                for &(le, t) in self.direction_edges(d).iter() {
                    let e = self.el_edges[p][le];
                    let s = kvdir[d] * t * self.el_edge_ori[p][le];
                    if sign[e] == 0 {
                        sign[e] = s;
                    } else if sign[e] != s {
                        return Err(IgaError::Inconsistent(format!(
                            "edge {e} carries its knot vector in conflicting directions"
                        )));
                    }
                }
                if rep[class_of[self.el_edges[p][self.direction_edges(d)[0].0]]].is_none()
                    && kvdir[d] == 1
                {
                    rep[class_of[self.el_edges[p][self.direction_edges(d)[0].0]]] = Some((p, d));
                }
            }
        }

        self.edge_to_ukv = (0..ne)
            .map(|e| {
                let u = class_of[e] as isize;
                if sign[e] >= 0 {
                    u
                } else {
                    -1 - u
                }
            })
            .collect();
        self.num_unique_kvs = next;
        rep.into_iter()
            .map(|r| {
                r.ok_or_else(|| {
                    IgaError::Inconsistent("knot-vector class seen only in flipped patches".into())
                })
            })
            .collect()
    }

    fn direction_edges(&self, d: usize) -> &'static [(usize, i32)] {
        if self.dim == 2 {
            &QUAD_EDGE_GROUPS[d]
        } else {
            &HEX_EDGE_GROUPS[d]
        }
    }

    /// Direction (+1/-1) of each patch axis' knot vector relative to the
    /// stored edge carrying it, found by matching edge endpoints against the
    /// patch corner vertices.
    pub fn kv_direction(&self, p: usize) -> Result<Vec<i32>> {
        if self.dim == 1 {
            return Ok(vec![1]);
        }
        let pv = &self.elements[p].verts;
        let mut kvdir = vec![0i32; self.dim];
        let mut probe = |d: usize, a: usize, b: usize, ev: [usize; 2]| {
            if ev[0] == pv[a] && ev[1] == pv[b] {
                kvdir[d] = 1;
            } else if ev[0] == pv[b] && ev[1] == pv[a] {
                kvdir[d] = -1;
            }
        };
        for &e in &self.el_edges[p] {
            let ev = self.edges[e];
            probe(0, 0, 1, ev);
            probe(1, 1, 2, ev);
            if self.dim == 3 {
                probe(2, 0, 4, ev);
            }
        }
        if kvdir.contains(&0) {
            return Err(IgaError::Topology(format!(
                "could not find knot-vector direction of patch {p}"
            )));
        }
        Ok(kvdir)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn num_patches(&self) -> usize {
        self.elements.len()
    }

    pub fn num_bdr(&self) -> usize {
        self.boundary.len()
    }

    pub fn num_unique_kvs(&self) -> usize {
        self.num_unique_kvs
    }

    pub fn attribute(&self, p: usize) -> i32 {
        self.elements[p].attribute
    }

    pub fn bdr_attribute(&self, b: usize) -> i32 {
        self.boundary[b].attribute
    }

    pub fn element_vertices(&self, p: usize) -> &[usize] {
        &self.elements[p].verts
    }

    pub fn element_edges(&self, p: usize) -> (&[usize], &[i32]) {
        (&self.el_edges[p], &self.el_edge_ori[p])
    }

    pub fn element_faces(&self, p: usize) -> (&[usize], &[usize]) {
        (&self.el_faces[p], &self.el_face_ori[p])
    }

    pub fn edge_vertices(&self, e: usize) -> [usize; 2] {
        self.edges[e]
    }

    pub fn face_vertices(&self, f: usize) -> &[usize; 4] {
        &self.faces[f]
    }

    pub fn face_edges(&self, f: usize) -> (&[usize], &[i32]) {
        (&self.face_edges[f], &self.face_edge_ori[f])
    }

    pub fn bdr_element_vertices(&self, b: usize) -> &[usize] {
        &self.boundary[b].verts
    }

    pub fn bdr_element_edges(&self, b: usize) -> (&[usize], &[i32]) {
        (&self.bdr_edges[b], &self.bdr_edge_ori[b])
    }

    /// The mesh entity the boundary element lies on: a face id in 3D, an
    /// edge id in 2D, a vertex id in 1D.
    pub fn bdr_element_face(&self, b: usize) -> usize {
        self.bdr_face[b]
    }

    /// Signed unique-knot-vector class of an edge.
    pub fn edge_ukv(&self, e: usize) -> isize {
        self.edge_to_ukv[e]
    }

    /// Unique-knot-vector class of an edge, direction stripped.
    pub fn knot_ind(&self, e: usize) -> usize {
        let k = self.edge_to_ukv[e];
        if k >= 0 {
            k as usize
        } else {
            (-1 - k) as usize
        }
    }

    /// Read the topology block: dimension, elements, boundary, edges,
    /// vertices.
    pub fn from_reader<R: BufRead>(r: &mut TextReader<R>) -> Result<Self> {
        r.expect("dimension")?;
        let dim = r.usize()?;
        if !(1..=3).contains(&dim) {
            return Err(IgaError::Parse(format!("unsupported dimension {dim}")));
        }

        let read_elems = |r: &mut TextReader<R>, boundary: bool| -> Result<Vec<Element>> {
            let n = r.usize()?;
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                let attribute = r.isize()? as i32;
                let geom = r.usize()?;
                let nv = match (geom, boundary) {
                    (GEOM_POINT, true) => 1,
                    (GEOM_SEGMENT, _) => 2,
                    (GEOM_QUAD, _) => 4,
                    (GEOM_HEX, false) => 8,
                    _ => {
                        return Err(IgaError::Parse(format!("unsupported geometry {geom}")));
                    }
                };
                let mut verts = Vec::with_capacity(nv);
                for _ in 0..nv {
                    verts.push(r.usize()?);
                }
                out.push(Element { verts, attribute });
            }
            Ok(out)
        };

        r.expect("elements")?;
        let elements = read_elems(r, false)?;
        r.expect("boundary")?;
        let boundary = read_elems(r, true)?;

        r.expect("edges")?;
        let nedge = r.usize()?;
        let mut entries = Vec::with_capacity(nedge);
        for _ in 0..nedge {
            entries.push((r.usize()?, r.usize()?, r.usize()?));
        }

        r.expect("vertices")?;
        let nv = r.usize()?;

        let mut topo = PatchTopology::new(dim, nv);
        for el in &elements {
            topo.add_patch(&el.verts, el.attribute)?;
        }
        for be in &boundary {
            topo.add_boundary(&be.verts, be.attribute)?;
        }
        topo.assign_knot_classes(&entries)?;
        Ok(topo)
    }

    /// Write the topology block in the format `from_reader` accepts.
    pub fn write(&self, w: &mut dyn Write) -> Result<()> {
        writeln!(w, "dimension\n{}\n", self.dim)?;

        let geom = |n: usize| match n {
            1 => GEOM_POINT,
            2 => GEOM_SEGMENT,
            4 => GEOM_QUAD,
            _ => GEOM_HEX,
        };
        writeln!(w, "elements\n{}", self.elements.len())?;
        for el in &self.elements {
            write!(w, "{} {}", el.attribute, geom(el.verts.len()))?;
            for v in &el.verts {
                write!(w, " {v}")?;
            }
            writeln!(w)?;
        }
        writeln!(w, "\nboundary\n{}", self.boundary.len())?;
        for be in &self.boundary {
            write!(w, "{} {}", be.attribute, geom(be.verts.len()))?;
            for v in &be.verts {
                write!(w, " {v}")?;
            }
            writeln!(w)?;
        }

        writeln!(w, "\nedges\n{}", self.edges.len())?;
        for (e, ev) in self.edges.iter().enumerate() {
            let k = self.edge_to_ukv[e];
            if k >= 0 {
                writeln!(w, "{} {} {}", k, ev[0], ev[1])?;
            } else {
                writeln!(w, "{} {} {}", -1 - k, ev[1], ev[0])?;
            }
        }

        writeln!(w, "\nvertices\n{}", self.num_vertices)?;
        Ok(())
    }
}
