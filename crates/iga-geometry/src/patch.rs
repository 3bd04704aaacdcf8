use std::io::{BufRead, Write};

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

use iga_core::{IgaError, Result, TextReader};

use crate::knot::KnotVector;

/// Tensor-product NURBS patch in homogeneous coordinates.
///
/// Control points carry `dim` components: the spatial coordinates multiplied
/// by the weight, then the weight itself. One to three parametric directions
/// are supported; direction 0 varies fastest in the flat data buffer.
#[derive(Debug, Clone)]
pub struct Patch {
    kv: Vec<KnotVector>,
    dim: usize,
    data: Vec<f64>,
}

/// Index map for iterating a patch one direction at a time.
///
/// A view fixes a direction `dir` and exposes the grid as `nd` layers of
/// `size` scalars, where `size` covers the component index and every other
/// direction. `at(id, l)` is the position in the flat data buffer. Views of
/// two patches that agree in every direction but `dir` enumerate the
/// transverse index `l` identically.
struct SliceView {
    stride: usize,
    nd: usize,
    offsets: Vec<usize>,
}

impl SliceView {
    fn new(ncp: &[usize], dim: usize, dir: usize) -> Self {
        assert!(dir < ncp.len(), "invalid direction {dir}");
        let mut strides = [0usize; 3];
        let mut s = dim;
        for d in 0..ncp.len() {
            strides[d] = s;
            s *= ncp[d];
        }

        let others: Vec<usize> = (0..ncp.len()).filter(|&d| d != dir).collect();
        let n1 = others.first().map(|&d| ncp[d]).unwrap_or(1);
        let n2 = others.get(1).map(|&d| ncp[d]).unwrap_or(1);
        let s1 = others.first().map(|&d| strides[d]).unwrap_or(0);
        let s2 = others.get(1).map(|&d| strides[d]).unwrap_or(0);

        let mut offsets = Vec::with_capacity(dim * n1 * n2);
        for i2 in 0..n2 {
            for i1 in 0..n1 {
                let base = i1 * s1 + i2 * s2;
                for c in 0..dim {
                    offsets.push(base + c);
                }
            }
        }
        SliceView {
            stride: strides[dir],
            nd: ncp[dir],
            offsets,
        }
    }

    fn size(&self) -> usize {
        self.offsets.len()
    }

    fn at(&self, id: usize, l: usize) -> usize {
        self.offsets[l] + id * self.stride
    }
}

impl Patch {
    /// Patch over the given knot vectors with `dim` homogeneous components
    /// per control point (spatial dimension + 1). Control data starts zeroed.
    pub fn new(kv: Vec<KnotVector>, dim: usize) -> Patch {
        assert!(dim > 1, "homogeneous dimension must be at least 2");
        assert!(
            (1..=3).contains(&kv.len()),
            "a patch has 1 to 3 parametric directions"
        );
        let size: usize = kv.iter().map(|k| k.ncp()).product();
        assert!(size > 0, "invalid knot vector dimensions");
        Patch {
            data: vec![0.0; size * dim],
            kv,
            dim,
        }
    }

    /// Same shape as `self` with direction `dir` replaced by a fresh knot
    /// vector of the given order and control point count.
    fn derived(&self, dir: usize, order: usize, ncp: usize) -> Patch {
        let mut kv: Vec<KnotVector> = self.kv.clone();
        kv[dir] = KnotVector::new(order, ncp);
        Patch::new(kv, self.dim)
    }

    /// Read a patch block: `knotvectors`, `dimension`, then a control point
    /// section tagged `controlpoints` / `controlpoints_homogeneous` (already
    /// weighted) or `controlpoints_cartesian` (weight applied on load).
    pub fn from_reader<R: BufRead>(r: &mut TextReader<R>) -> Result<Patch> {
        r.expect("knotvectors")?;
        let pdim = r.usize()?;
        if !(1..=3).contains(&pdim) {
            return Err(IgaError::Parse(format!(
                "patch has {pdim} knot vectors, expected 1 to 3"
            )));
        }
        let mut kv = Vec::with_capacity(pdim);
        let mut size = 1;
        for _ in 0..pdim {
            let k = KnotVector::from_reader(r)?;
            size *= k.ncp();
            kv.push(k);
        }

        r.expect("dimension")?;
        let sdim = r.usize()?;
        let dim = sdim + 1;
        let mut patch = Patch::new(kv, dim);

        let ident = r.token()?;
        match ident.as_str() {
            "controlpoints" | "controlpoints_homogeneous" => {
                for v in patch.data.iter_mut() {
                    *v = r.f64()?;
                }
            }
            "controlpoints_cartesian" => {
                for i in 0..size {
                    let j = i * dim;
                    for d in 0..dim {
                        patch.data[j + d] = r.f64()?;
                    }
                    for d in 0..sdim {
                        patch.data[j + d] *= patch.data[j + sdim];
                    }
                }
            }
            other => {
                return Err(IgaError::Parse(format!(
                    "expected a control point section, found '{other}'"
                )))
            }
        }
        Ok(patch)
    }

    /// Write the patch block in homogeneous coordinates.
    pub fn write(&self, w: &mut dyn Write) -> Result<()> {
        writeln!(w, "knotvectors\n{}", self.kv.len())?;
        for kv in &self.kv {
            kv.write(w)?;
        }
        writeln!(w, "\ndimension\n{}\n\ncontrolpoints", self.dim - 1)?;
        for pt in self.data.chunks(self.dim) {
            let mut sep = "";
            for v in pt {
                write!(w, "{sep}{v}")?;
                sep = " ";
            }
            writeln!(w)?;
        }
        Ok(())
    }

    /// Number of parametric directions.
    pub fn num_dirs(&self) -> usize {
        self.kv.len()
    }

    /// Homogeneous components per control point.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn kv(&self, dir: usize) -> &KnotVector {
        &self.kv[dir]
    }

    pub fn kv_mut(&mut self, dir: usize) -> &mut KnotVector {
        &mut self.kv[dir]
    }

    pub fn knot_vectors(&self) -> &[KnotVector] {
        &self.kv
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    fn ncps(&self) -> Vec<usize> {
        self.kv.iter().map(|k| k.ncp()).collect()
    }

    fn view(&self, dir: usize) -> SliceView {
        SliceView::new(&self.ncps(), self.dim, dir)
    }

    pub fn at1(&self, i: usize, d: usize) -> f64 {
        debug_assert_eq!(self.kv.len(), 1);
        self.data[i * self.dim + d]
    }

    pub fn at1_mut(&mut self, i: usize, d: usize) -> &mut f64 {
        debug_assert_eq!(self.kv.len(), 1);
        &mut self.data[i * self.dim + d]
    }

    pub fn at2(&self, i: usize, j: usize, d: usize) -> f64 {
        debug_assert_eq!(self.kv.len(), 2);
        let ni = self.kv[0].ncp();
        self.data[(j * ni + i) * self.dim + d]
    }

    pub fn at2_mut(&mut self, i: usize, j: usize, d: usize) -> &mut f64 {
        debug_assert_eq!(self.kv.len(), 2);
        let ni = self.kv[0].ncp();
        &mut self.data[(j * ni + i) * self.dim + d]
    }

    pub fn at3(&self, i: usize, j: usize, k: usize, d: usize) -> f64 {
        debug_assert_eq!(self.kv.len(), 3);
        let ni = self.kv[0].ncp();
        let nj = self.kv[1].ncp();
        self.data[((k * nj + j) * ni + i) * self.dim + d]
    }

    pub fn at3_mut(&mut self, i: usize, j: usize, k: usize, d: usize) -> &mut f64 {
        debug_assert_eq!(self.kv.len(), 3);
        let ni = self.kv[0].ncp();
        let nj = self.kv[1].ncp();
        &mut self.data[((k * nj + j) * ni + i) * self.dim + d]
    }

    /// Refine by inserting knots; `rf[dir]` pieces per element in each
    /// direction. Attached spacing rules steer the new knot placement.
    pub fn uniform_refinement(&mut self, rf: &[usize]) {
        assert_eq!(rf.len(), self.kv.len());
        for dir in 0..self.kv.len() {
            if rf[dir] != 1 {
                let newknots = self.kv[dir].refinement(rf[dir]);
                self.knot_insert(dir, &newknots);
            }
        }
    }

    pub fn uniform_refinement_all(&mut self, rf: usize) {
        let rfs = vec![rf; self.kv.len()];
        self.uniform_refinement(&rfs);
    }

    /// Remove the interior knots a previous refinement by `cf[dir]` added.
    /// Knot vectors already marked coarse are skipped.
    pub fn coarsen(&mut self, cf: &[usize], tol: f64) {
        assert_eq!(cf.len(), self.kv.len());
        for dir in 0..self.kv.len() {
            if self.kv[dir].coarse {
                continue;
            }
            let ne_fine = self.kv[dir].ne();
            let fine = self.kv[dir].fine_knots(cf[dir]);
            self.knot_remove_vec(dir, &fine, tol);
            self.kv[dir].coarse = true;
            self.kv[dir].count_elements();

            let ne_coarse = self.kv[dir].ne();
            assert_eq!(ne_fine, cf[dir] * ne_coarse, "coarsening element count");
            if let Some(spacing) = &self.kv[dir].spacing {
                let mut rule = spacing.borrow_mut();
                rule.set_size(ne_coarse);
                rule.scale_parameters(cf[dir] as f64);
            }
        }
    }

    pub fn coarsen_all(&mut self, cf: usize, tol: f64) {
        let cfs = vec![cf; self.kv.len()];
        self.coarsen(&cfs, tol);
    }

    pub fn coarsening_factors(&self) -> Vec<usize> {
        self.kv.iter().map(|k| k.coarsening_factor()).collect()
    }

    pub fn set_knot_vectors_coarse(&mut self, c: bool) {
        for kv in &mut self.kv {
            kv.coarse = c;
        }
    }

    /// Bring direction `dir` to the order and knots of `newkv` by degree
    /// elevation followed by knot insertion. `newkv` must be a refinement of
    /// the elevated knot vector.
    pub fn knot_insert_kv(&mut self, dir: usize, newkv: &KnotVector) {
        assert!(dir < self.kv.len(), "invalid direction {dir}");
        assert!(
            newkv.order() >= self.kv[dir].order(),
            "target order below patch order"
        );
        let t = newkv.order() - self.kv[dir].order();
        if t > 0 {
            self.degree_elevate(dir, t);
        }
        let diff = self.kv[dir].difference(newkv);
        if !diff.is_empty() {
            self.knot_insert(dir, &diff);
        }
    }

    pub fn knot_insert_kvs(&mut self, newkv: &[KnotVector]) {
        assert_eq!(newkv.len(), self.kv.len(), "invalid knot insertion input");
        for (dir, kv) in newkv.iter().enumerate() {
            self.knot_insert_kv(dir, kv);
        }
    }

    pub fn knot_insert_vecs(&mut self, knots: &[Vec<f64>]) {
        assert_eq!(knots.len(), self.kv.len(), "invalid knot insertion input");
        for (dir, k) in knots.iter().enumerate() {
            self.knot_insert(dir, k);
        }
    }

    /// Insert the given knots (ascending, with multiplicity) in direction
    /// `dir`, leaving the mapped geometry unchanged.
    ///
    /// The NURBS Book, 2nd ed, algorithm A5.5.
    pub fn knot_insert(&mut self, dir: usize, knots: &[f64]) {
        if knots.is_empty() {
            return;
        }
        assert!(dir < self.kv.len(), "invalid direction {dir}");

        let mut newp = self.derived(
            dir,
            self.kv[dir].order(),
            self.kv[dir].ncp() + knots.len(),
        );
        newp.kv[dir].spacing = self.kv[dir].spacing.clone();

        let oldv = self.view(dir);
        let newv = newp.view(dir);
        let size = oldv.size();
        assert_eq!(size, newv.size(), "slice size mismatch");

        let rr = knots.len() as isize - 1;
        let a = self.kv[dir].find_knot_span(knots[0]) as isize - 1;
        let b = self.kv[dir].find_knot_span(knots[rr as usize]) as isize - 1;
        let pl = self.kv[dir].order() as isize;
        let ml = self.kv[dir].ncp() as isize;

        for j in 0..=a {
            newp.kv[dir][j as usize] = self.kv[dir][j as usize];
        }
        for j in (b + pl)..=(ml + pl) {
            newp.kv[dir][(j + rr + 1) as usize] = self.kv[dir][j as usize];
        }
        for k in 0..=(a - pl) {
            for l in 0..size {
                newp.data[newv.at(k as usize, l)] = self.data[oldv.at(k as usize, l)];
            }
        }
        for k in (b - 1)..ml {
            for l in 0..size {
                newp.data[newv.at((k + rr + 1) as usize, l)] = self.data[oldv.at(k as usize, l)];
            }
        }

        let mut i = b + pl - 1;
        let mut k = b + pl + rr;

        for j in (0..=rr).rev() {
            while knots[j as usize] <= self.kv[dir][i as usize] && i > a {
                newp.kv[dir][k as usize] = self.kv[dir][i as usize];
                for l in 0..size {
                    newp.data[newv.at((k - pl - 1) as usize, l)] =
                        self.data[oldv.at((i - pl - 1) as usize, l)];
                }
                k -= 1;
                i -= 1;
            }

            for l in 0..size {
                newp.data[newv.at((k - pl - 1) as usize, l)] =
                    newp.data[newv.at((k - pl) as usize, l)];
            }

            for q in 1..=pl {
                let ind = k - pl + q;
                let mut alfa = newp.kv[dir][(k + q) as usize] - knots[j as usize];
                if alfa == 0.0 {
                    for l in 0..size {
                        newp.data[newv.at((ind - 1) as usize, l)] =
                            newp.data[newv.at(ind as usize, l)];
                    }
                } else {
                    alfa /= newp.kv[dir][(k + q) as usize] - self.kv[dir][(i - pl + q) as usize];
                    for l in 0..size {
                        let blended = alfa * newp.data[newv.at((ind - 1) as usize, l)]
                            + (1.0 - alfa) * newp.data[newv.at(ind as usize, l)];
                        newp.data[newv.at((ind - 1) as usize, l)] = blended;
                    }
                }
            }

            newp.kv[dir][k as usize] = knots[j as usize];
            k -= 1;
        }

        newp.kv[dir].count_elements();
        *self = newp;
    }

    /// Remove each listed knot once. Removals that would change the mapped
    /// geometry by more than `tol` are skipped.
    pub fn knot_remove_vec(&mut self, dir: usize, knots: &[f64], tol: f64) {
        for &k in knots {
            self.knot_remove(dir, k, 1, tol);
        }
    }

    /// Try to remove an interior knot `ntimes`. Returns the number of
    /// successful removals; removal stops when reinserting the knot would no
    /// longer reproduce the control points within `tol`.
    ///
    /// The NURBS Book, 2nd ed, algorithm A5.8. The updated weights are not
    /// guaranteed to stay positive.
    pub fn knot_remove(&mut self, dir: usize, knot: f64, ntimes: usize, tol: f64) -> usize {
        assert!(dir < self.kv.len(), "invalid direction {dir}");

        let oldkv = self.kv[dir].clone();

        let mut id: isize = -1;
        let mut multiplicity = 0usize;
        for i in 0..oldkv.len() {
            if oldkv[i] == knot {
                id = i as isize;
                multiplicity += 1;
            }
        }
        assert!(
            id > 0 && (id as usize) < oldkv.len() - 1 && ntimes <= multiplicity,
            "only interior knots of sufficient multiplicity may be removed"
        );
        let id = id as usize;

        let p = oldkv.order();
        let pi = p as isize;

        let mut tmpp = self.derived(dir, p, oldkv.ncp());

        let oldv = self.view(dir);
        let tmpv = tmpp.view(dir);
        let size = oldv.size();
        assert_eq!(size, tmpv.size(), "slice size mismatch");

        for k in 0..oldv.nd {
            for l in 0..size {
                tmpp.data[tmpv.at(k, l)] = self.data[oldv.at(k, l)];
            }
        }

        let r = id as isize;
        let s = multiplicity as isize;

        let mut last = r - s;
        let mut first = r - pi;

        let rows = (last + ntimes as isize + 1).max(pi - s + 2 * ntimes as isize + 2) as usize;
        let mut temp = vec![0.0; rows.max(1) * size];
        let tix = |row: isize, l: usize| -> usize { row as usize * size + l };

        for t in 0..ntimes as isize {
            let off = first - 1;

            for l in 0..size {
                temp[tix(0, l)] = self.data[oldv.at(off as usize, l)];
                temp[tix(last + 1 - off, l)] = self.data[oldv.at((last + 1) as usize, l)];
            }

            let mut i = first;
            let mut j = last;
            let mut ii: isize = 1;
            let mut jj = last - off;

            while j - i > t {
                let a_i = (knot - oldkv[i as usize])
                    / (oldkv[(i + pi + 1) as usize] - oldkv[i as usize]);
                let a_j = (knot - oldkv[j as usize])
                    / (oldkv[(j + pi + 1) as usize] - oldkv[j as usize]);

                for l in 0..size {
                    temp[tix(ii, l)] = (1.0 / a_i) * self.data[oldv.at(i as usize, l)]
                        - ((1.0 / a_i) - 1.0) * temp[tix(ii - 1, l)];
                    temp[tix(jj, l)] = (1.0 / (1.0 - a_j))
                        * (self.data[oldv.at(j as usize, l)] - a_j * temp[tix(jj + 1, l)]);
                }

                i += 1;
                ii += 1;
                j -= 1;
                jj -= 1;
            }

            // Removability check: the two sweeps must meet within tolerance.
            let mut dist2 = 0.0;
            if j - i < t {
                for l in 0..size {
                    let d = temp[tix(ii - 1, l)] - temp[tix(jj + 1, l)];
                    dist2 += d * d;
                }
            } else {
                let a_i = (knot - oldkv[i as usize])
                    / (oldkv[(i + pi + 1) as usize] - oldkv[i as usize]);
                for l in 0..size {
                    let d = self.data[oldv.at(i as usize, l)]
                        - a_i * temp[tix(ii + 1, l)]
                        - (1.0 - a_i) * temp[tix(ii - 1, l)];
                    dist2 += d * d;
                }
            }
            if dist2.sqrt() >= tol {
                // Not removable within tolerance. The patch is left
                // unchanged; report how many removals would have succeeded.
                return t as usize;
            }

            let mut i = first;
            let mut j = last;
            while j - i > t {
                for l in 0..size {
                    tmpp.data[tmpv.at(i as usize, l)] = temp[tix(i - off, l)];
                    tmpp.data[tmpv.at(j as usize, l)] = temp[tix(j - off, l)];
                }
                i += 1;
                j -= 1;
            }

            first -= 1;
            last += 1;
        }

        let fout = (2 * r - s - pi) / 2;
        let mut j = fout;
        let mut i = j;
        for k in 1..ntimes as isize {
            if k % 2 == 1 {
                i += 1;
            } else {
                j -= 1;
            }
        }

        let mut newp = self.derived(dir, p, oldkv.ncp() - ntimes);
        let newv = newp.view(dir);
        assert_eq!(size, newv.size(), "slice size mismatch");

        for k in 0..fout as usize {
            for l in 0..size {
                newp.data[newv.at(k, l)] = self.data[oldv.at(k, l)];
            }
        }
        for k in (i + 1) as usize..oldv.nd {
            for l in 0..size {
                newp.data[newv.at(j as usize, l)] = tmpp.data[tmpv.at(k, l)];
            }
            j += 1;
        }

        {
            let newkv = &mut newp.kv[dir];
            assert_eq!(newkv.len(), oldkv.len() - ntimes);
            newkv.spacing = oldkv.spacing.clone();
            newkv.coarse = oldkv.coarse;

            for k in 0..(id - ntimes + 1) {
                newkv[k] = oldkv[k];
            }
            for k in (id + 1)..oldkv.len() {
                newkv[k - ntimes] = oldkv[k];
            }
            newkv.count_elements();
        }

        *self = newp;
        ntimes
    }

    pub fn degree_elevate_all(&mut self, t: usize) {
        for dir in 0..self.kv.len() {
            self.degree_elevate(dir, t);
        }
    }

    /// Raise the order in direction `dir` by `t` without changing the mapped
    /// geometry.
    ///
    /// The NURBS Book, 2nd ed, algorithm A5.9, Bezier segment extraction
    /// with knot removal emulation.
    pub fn degree_elevate(&mut self, dir: usize, t: usize) {
        assert!(dir < self.kv.len(), "invalid direction {dir}");
        if t == 0 {
            return;
        }

        let oldkv = self.kv[dir].clone();
        let p = oldkv.order();
        let pi = p as isize;
        let ti = t as isize;

        let mut newp = self.derived(dir, p + t, oldkv.ncp() + oldkv.ne() * t);
        newp.kv[dir].spacing = oldkv.spacing.clone();

        let oldv = self.view(dir);
        let newv = newp.view(dir);
        let size = oldv.size();
        assert_eq!(size, newv.size(), "slice size mismatch");

        let n = oldkv.ncp() as isize - 1;
        let m = n + pi + 1;
        let ph = pi + ti;
        let ph2 = ph / 2;

        // Bezier degree elevation coefficients
        let mut bezalfs = vec![vec![0.0; p + 1]; (ph + 1) as usize];
        {
            let mut binom = vec![vec![0.0; (ph + 1) as usize]; (ph + 1) as usize];
            for i in 0..=(ph as usize) {
                binom[i][0] = 1.0;
                binom[i][i] = 1.0;
                for j in 1..i {
                    binom[i][j] = binom[i - 1][j] + binom[i - 1][j - 1];
                }
            }

            bezalfs[0][0] = 1.0;
            bezalfs[ph as usize][p] = 1.0;

            for i in 1..=ph2 {
                let inv = 1.0 / binom[ph as usize][i as usize];
                let mpi = pi.min(i);
                for j in 0.max(i - ti)..=mpi {
                    bezalfs[i as usize][j as usize] =
                        inv * binom[p][j as usize] * binom[t][(i - j) as usize];
                }
            }
            for i in (ph2 + 1)..ph {
                let mpi = pi.min(i);
                for j in 0.max(i - ti)..=mpi {
                    bezalfs[i as usize][j as usize] =
                        bezalfs[(ph - i) as usize][(pi - j) as usize];
                }
            }
        }

        let mut bpts = vec![vec![0.0; size]; p + 1];
        let mut ebpts = vec![vec![0.0; size]; (ph + 1) as usize];
        let mut nextbpts = vec![vec![0.0; size]; p.saturating_sub(1)];
        let mut alphas = vec![0.0; p.saturating_sub(1)];

        let mut kind = ph + 1;
        let mut r: isize = -1;
        let mut a = pi;
        let mut b = pi + 1;
        let mut cind: isize = 1;
        let mut ua = oldkv[0];

        for l in 0..size {
            newp.data[newv.at(0, l)] = self.data[oldv.at(0, l)];
        }
        for i in 0..=(ph as usize) {
            newp.kv[dir][i] = ua;
        }
        for i in 0..=p {
            for l in 0..size {
                bpts[i][l] = self.data[oldv.at(i, l)];
            }
        }

        while b < m {
            let i0 = b;
            while b < m && oldkv[b as usize] == oldkv[(b + 1) as usize] {
                b += 1;
            }
            let mul = b - i0 + 1;

            let ub = oldkv[b as usize];
            let oldr = r;
            r = pi - mul;
            let lbz: isize = if oldr > 0 { (oldr + 2) / 2 } else { 1 };
            let rbz: isize = if r > 0 { ph - (r + 1) / 2 } else { ph };

            if r > 0 {
                // Insert knot ub r times to extract the Bezier segment
                let numer = ub - ua;
                for k in ((mul + 1)..=pi).rev() {
                    alphas[(k - mul - 1) as usize] = numer / (oldkv[(a + k) as usize] - ua);
                }
                for j in 1..=r {
                    let save = (r - j) as usize;
                    let s = mul + j;
                    for k in (s..=pi).rev() {
                        let alpha = alphas[(k - s) as usize];
                        for l in 0..size {
                            bpts[k as usize][l] = alpha * bpts[k as usize][l]
                                + (1.0 - alpha) * bpts[(k - 1) as usize][l];
                        }
                    }
                    for l in 0..size {
                        nextbpts[save][l] = bpts[p][l];
                    }
                }
            }

            // Degree-elevate the Bezier segment
            for i in lbz..=ph {
                for l in 0..size {
                    ebpts[i as usize][l] = 0.0;
                }
                let mpi = pi.min(i);
                for j in 0.max(i - ti)..=mpi {
                    let alpha = bezalfs[i as usize][j as usize];
                    for l in 0..size {
                        ebpts[i as usize][l] += alpha * bpts[j as usize][l];
                    }
                }
            }

            if oldr > 1 {
                // Remove knot ua oldr-1 times
                let mut first = kind - 2;
                let mut last = kind;
                let den = ub - ua;
                let bet = (ub - newp.kv[dir][(kind - 1) as usize]) / den;

                for tr in 1..oldr {
                    let mut i = first;
                    let mut j = last;
                    let mut kj = j - kind + 1;
                    while j - i > tr {
                        if i < cind {
                            let alf = (ub - newp.kv[dir][i as usize])
                                / (ua - newp.kv[dir][i as usize]);
                            for l in 0..size {
                                let v = alf * newp.data[newv.at(i as usize, l)]
                                    - (1.0 - alf) * newp.data[newv.at((i - 1) as usize, l)];
                                newp.data[newv.at(i as usize, l)] = v;
                            }
                        }
                        if j >= lbz {
                            if (j - tr) <= (kind - ph + oldr) {
                                let gam = (ub - newp.kv[dir][(j - tr) as usize]) / den;
                                for l in 0..size {
                                    ebpts[kj as usize][l] = gam * ebpts[kj as usize][l]
                                        + (1.0 - gam) * ebpts[(kj + 1) as usize][l];
                                }
                            } else {
                                for l in 0..size {
                                    ebpts[kj as usize][l] = bet * ebpts[kj as usize][l]
                                        + (1.0 - bet) * ebpts[(kj + 1) as usize][l];
                                }
                            }
                        }
                        i += 1;
                        j -= 1;
                        kj -= 1;
                    }
                    first -= 1;
                    last += 1;
                }
            }

            if a != pi {
                for _ in 0..(ph - oldr) {
                    newp.kv[dir][kind as usize] = ua;
                    kind += 1;
                }
            }
            for j in lbz..=rbz {
                for l in 0..size {
                    newp.data[newv.at(cind as usize, l)] = ebpts[j as usize][l];
                }
                cind += 1;
            }

            if b < m {
                for j in 0..r {
                    for l in 0..size {
                        bpts[j as usize][l] = nextbpts[j as usize][l];
                    }
                }
                for j in r.max(0)..=pi {
                    for l in 0..size {
                        bpts[j as usize][l] = self.data[oldv.at((b - pi + j) as usize, l)];
                    }
                }
                a = b;
                b += 1;
                ua = ub;
            } else {
                for i in 0..=ph {
                    newp.kv[dir][(kind + i) as usize] = ub;
                }
            }
        }

        newp.kv[dir].count_elements();
        *self = newp;
    }

    /// Elevate every direction to the same order. With `degree` unset, the
    /// maximum current order is used. Returns the resulting order.
    pub fn make_uniform_degree(&mut self, degree: Option<usize>) -> usize {
        let maxd = degree
            .unwrap_or_else(|| self.kv.iter().map(|k| k.order()).max().unwrap());
        for dir in 0..self.kv.len() {
            if maxd > self.kv[dir].order() {
                self.degree_elevate(dir, maxd - self.kv[dir].order());
            }
        }
        maxd
    }

    /// Reverse the parameter direction `dir`, control points included.
    pub fn flip_direction(&mut self, dir: usize) {
        let view = self.view(dir);
        let nd = view.nd;
        for id in 0..nd / 2 {
            for l in 0..view.size() {
                self.data.swap(view.at(id, l), view.at(nd - 1 - id, l));
            }
        }
        self.kv[dir].flip();
    }

    /// Exchange two parametric directions. Directions 0 and 2 cannot be
    /// swapped directly; route through direction 1.
    pub fn swap_directions(&mut self, dir1: usize, dir2: usize) {
        assert!(
            dir1.abs_diff(dir2) != 2,
            "directions 0 and 2 are not supported"
        );
        let mut kv = self.kv.clone();
        kv.swap(dir1, dir2);
        let mut newp = Patch::new(kv, self.dim);

        let oldv = self.view(dir1);
        let newv = newp.view(dir2);
        for id in 0..oldv.nd {
            for l in 0..oldv.size() {
                newp.data[newv.at(id, l)] = self.data[oldv.at(id, l)];
            }
        }
        *self = newp;
    }

    /// Rotate the control grid: in the parameter plane for surfaces in 2D,
    /// about `axis` for solids in 3D.
    pub fn rotate(&mut self, angle: f64, axis: Option<[f64; 3]>) {
        if self.dim == 3 {
            self.rotate_2d(angle);
        } else {
            let axis = axis.expect("a 3D rotation needs an axis");
            self.rotate_3d(axis, angle);
        }
    }

    pub fn rotation_matrix_2d(angle: f64) -> Matrix2<f64> {
        let (s, c) = angle.sin_cos();
        Matrix2::new(c, -s, s, c)
    }

    pub fn rotate_2d(&mut self, angle: f64) {
        assert_eq!(self.dim, 3, "not a patch in 2D");
        let t = Self::rotation_matrix_2d(angle);
        for pt in self.data.chunks_mut(self.dim) {
            let v = t * Vector2::new(pt[0], pt[1]);
            pt[0] = v[0];
            pt[1] = v[1];
        }
    }

    /// Rotation by `angle` about `axis`, scaled by `r`. The quarter and half
    /// turn cases are handled exactly.
    pub fn rotation_matrix_3d(axis: [f64; 3], angle: f64, r: f64) -> Matrix3<f64> {
        let n = axis;
        let l2 = n[0] * n[0] + n[1] * n[1] + n[2] * n[2];
        assert!(l2 > 0.0, "3D rotation axis is undefined");
        let l = l2.sqrt();

        let (s, c, c1) = if angle.abs() == std::f64::consts::FRAC_PI_2 {
            (r * angle.signum(), 0.0, -1.0)
        } else if angle.abs() == std::f64::consts::PI {
            (0.0, -r, -r - 1.0)
        } else {
            let c = r * angle.cos();
            (r * angle.sin(), c, c - 1.0)
        };

        Matrix3::new(
            (n[0] * n[0] + (n[1] * n[1] + n[2] * n[2]) * c) / l2,
            -(n[0] * n[1] * c1) / l2 - (n[2] * s) / l,
            -(n[0] * n[2] * c1) / l2 + (n[1] * s) / l,
            -(n[0] * n[1] * c1) / l2 + (n[2] * s) / l,
            (n[1] * n[1] + (n[0] * n[0] + n[2] * n[2]) * c) / l2,
            -(n[1] * n[2] * c1) / l2 - (n[0] * s) / l,
            -(n[0] * n[2] * c1) / l2 - (n[1] * s) / l,
            -(n[1] * n[2] * c1) / l2 + (n[0] * s) / l,
            (n[2] * n[2] + (n[0] * n[0] + n[1] * n[1]) * c) / l2,
        )
    }

    pub fn rotate_3d(&mut self, axis: [f64; 3], angle: f64) {
        assert_eq!(self.dim, 4, "not a patch in 3D");
        let t = Self::rotation_matrix_3d(axis, angle, 1.0);
        for pt in self.data.chunks_mut(self.dim) {
            let v = t * Vector3::new(pt[0], pt[1], pt[2]);
            pt[0] = v[0];
            pt[1] = v[1];
            pt[2] = v[2];
        }
    }
}

/// Loft a linear interpolation between two patches of equal parametric
/// dimension and spatial dimension. Both inputs are refined to a common
/// knot structure in place; the result gains one linear direction.
pub fn interpolate(p1: &mut Patch, p2: &mut Patch) -> Patch {
    assert_eq!(p1.num_dirs(), p2.num_dirs(), "parametric dimension mismatch");
    assert_eq!(p1.dim, p2.dim, "spatial dimension mismatch");

    for i in 0..p1.num_dirs() {
        if p1.kv[i].order() < p2.kv[i].order() {
            let kv2 = p2.kv[i].clone();
            p1.knot_insert_kv(i, &kv2);
            let kv1 = p1.kv[i].clone();
            p2.knot_insert_kv(i, &kv1);
        } else {
            let kv1 = p1.kv[i].clone();
            p2.knot_insert_kv(i, &kv1);
            let kv2 = p2.kv[i].clone();
            p1.knot_insert_kv(i, &kv2);
        }
    }

    let mut kv: Vec<KnotVector> = p1.kv.clone();
    kv.push(KnotVector::from_knots(1, vec![0.0, 0.0, 1.0, 1.0]));

    let dim = p1.dim;
    let size: usize = p1.ncps().iter().product();

    let mut patch = Patch::new(kv, dim);
    patch.data[..size * dim].copy_from_slice(&p1.data);
    patch.data[size * dim..].copy_from_slice(&p2.data);
    patch
}

/// Revolve a 3D patch about `axis` by `ang` per step, `times` steps,
/// producing one additional quadratic direction. `ang` must not exceed a
/// half turn per step; weights at the inserted midpoints are scaled by
/// cos(ang / 2).
pub fn revolve_3d(patch: &Patch, axis: [f64; 3], ang: f64, times: usize) -> Patch {
    assert_eq!(patch.dim, 4, "revolve_3d needs a patch in 3D");

    let ns = 2 * times + 1;
    let mut lknots = vec![0.0; ns + 3];
    for i in 1..times {
        lknots[2 * i + 1] = i as f64;
        lknots[2 * i + 2] = i as f64;
    }
    lknots[ns] = times as f64;
    lknots[ns + 1] = times as f64;
    lknots[ns + 2] = times as f64;

    let mut kv: Vec<KnotVector> = patch.kv.clone();
    kv.push(KnotVector::from_knots(2, lknots));

    let size: usize = patch.ncps().iter().product();
    let mut newpatch = Patch::new(kv, 4);

    let t = Patch::rotation_matrix_3d(axis, ang, 1.0);
    let c = (ang / 2.0).cos();
    let t2 = Patch::rotation_matrix_3d(axis, ang / 2.0, 1.0 / c) * c;

    for i in 0..size {
        let src = i * 4;
        let base = i * 4;
        newpatch.data[base..base + 4].copy_from_slice(&patch.data[src..src + 4]);
        let mut prev = base;
        for _ in 0..times {
            let u = [
                newpatch.data[prev],
                newpatch.data[prev + 1],
                newpatch.data[prev + 2],
                newpatch.data[prev + 3],
            ];
            let half = prev + 4 * size;
            let full = half + 4 * size;

            let v = t2 * Vector3::new(u[0], u[1], u[2]);
            newpatch.data[half] = v[0];
            newpatch.data[half + 1] = v[1];
            newpatch.data[half + 2] = v[2];
            newpatch.data[half + 3] = c * u[3];

            let w = t * Vector3::new(u[0], u[1], u[2]);
            newpatch.data[full] = w[0];
            newpatch.data[full + 1] = w[1];
            newpatch.data[full + 2] = w[2];
            newpatch.data[full + 3] = u[3];

            prev = full;
        }
    }

    newpatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Evaluate a 2D patch at knot-space coordinates (u, v), returning the
    /// Cartesian point after the rational division.
    fn eval2(patch: &Patch, u: f64, v: f64) -> Vec<f64> {
        let dim = patch.dim();
        let mut num = vec![0.0; dim];
        let (k0, k1) = (patch.kv(0), patch.kv(1));
        let (p0, p1) = (k0.order(), k1.order());

        let span0 = k0.find_knot_span(u) - 1;
        let span1 = k1.find_knot_span(v) - 1;
        let e0 = span0 - p0;
        let e1 = span1 - p1;
        let xi0 = (u - k0[span0]) / (k0[span0 + 1] - k0[span0]);
        let xi1 = (v - k1[span1]) / (k1[span1 + 1] - k1[span1]);

        let mut s0 = vec![0.0; p0 + 1];
        let mut s1 = vec![0.0; p1 + 1];
        k0.calc_shape(&mut s0, e0 as isize, xi0);
        k1.calc_shape(&mut s1, e1 as isize, xi1);

        for j in 0..=p1 {
            for i in 0..=p0 {
                let w = s0[i] * s1[j];
                for d in 0..dim {
                    num[d] += w * patch.at2(e0 + i, e1 + j, d);
                }
            }
        }
        let wgt = num[dim - 1];
        num.iter().map(|x| x / wgt).collect()
    }

    /// Bilinear unit square with all weights one, quadratic in both
    /// directions after elevation from order one.
    fn unit_square() -> Patch {
        let kv0 = KnotVector::from_knots(1, vec![0.0, 0.0, 1.0, 1.0]);
        let kv1 = KnotVector::from_knots(1, vec![0.0, 0.0, 1.0, 1.0]);
        let mut p = Patch::new(vec![kv0, kv1], 3);
        for j in 0..2 {
            for i in 0..2 {
                *p.at2_mut(i, j, 0) = i as f64;
                *p.at2_mut(i, j, 1) = j as f64;
                *p.at2_mut(i, j, 2) = 1.0;
            }
        }
        p
    }

    #[test]
    fn knot_insert_preserves_geometry() {
        let mut p = unit_square();
        p.degree_elevate_all(1);
        let before: Vec<Vec<f64>> = [(0.3, 0.4), (0.7, 0.2), (0.5, 0.5)]
            .iter()
            .map(|&(u, v)| eval2(&p, u, v))
            .collect();

        p.knot_insert(0, &[0.25, 0.5]);
        p.knot_insert(1, &[0.6]);
        assert_eq!(p.kv(0).ncp(), 5);
        assert_eq!(p.kv(1).ncp(), 4);

        for (pt, &(u, v)) in before.iter().zip(&[(0.3, 0.4), (0.7, 0.2), (0.5, 0.5)]) {
            let after = eval2(&p, u, v);
            for d in 0..2 {
                assert_relative_eq!(pt[d], after[d], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn degree_elevation_preserves_geometry() {
        let mut p = unit_square();
        let before = eval2(&p, 0.3, 0.8);
        p.degree_elevate(0, 2);
        p.degree_elevate(1, 1);
        assert_eq!(p.kv(0).order(), 3);
        assert_eq!(p.kv(1).order(), 2);
        let after = eval2(&p, 0.3, 0.8);
        for d in 0..2 {
            assert_relative_eq!(before[d], after[d], epsilon = 1e-12);
        }
    }

    #[test]
    fn insert_then_remove_round_trips() {
        let mut p = unit_square();
        p.degree_elevate_all(2);
        let ncp0 = p.kv(0).ncp();

        p.knot_insert(0, &[0.5]);
        assert_eq!(p.kv(0).ncp(), ncp0 + 1);

        let n = p.knot_remove(0, 0.5, 1, 1e-12);
        assert_eq!(n, 1);
        assert_eq!(p.kv(0).ncp(), ncp0);

        let pt = eval2(&p, 0.25, 0.75);
        assert_relative_eq!(pt[0], 0.25, epsilon = 1e-12);
        assert_relative_eq!(pt[1], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn knot_remove_reports_partial_success() {
        let mut p = unit_square();
        p.degree_elevate_all(1);
        p.knot_insert(0, &[0.5]);
        // Perturb a control point so the knot is no longer removable.
        *p.at2_mut(1, 0, 1) += 0.3;
        let n = p.knot_remove(0, 0.5, 1, 1e-12);
        assert_eq!(n, 0);
    }

    #[test]
    fn uniform_refinement_multiplies_elements() {
        let mut p = unit_square();
        p.degree_elevate_all(1);
        p.uniform_refinement(&[2, 3]);
        assert_eq!(p.kv(0).ne(), 2);
        assert_eq!(p.kv(1).ne(), 3);
        let pt = eval2(&p, 0.3, 0.9);
        assert_relative_eq!(pt[0], 0.3, epsilon = 1e-12);
        assert_relative_eq!(pt[1], 0.9, epsilon = 1e-12);
    }

    #[test]
    fn coarsen_undoes_uniform_refinement() {
        let mut p = unit_square();
        p.degree_elevate_all(2);
        p.uniform_refinement_all(2);
        assert_eq!(p.kv(0).ne(), 2);

        p.coarsen_all(2, 1e-10);
        assert_eq!(p.kv(0).ne(), 1);
        assert_eq!(p.kv(1).ne(), 1);
        assert!(p.kv(0).coarse);

        let pt = eval2(&p, 0.7, 0.1);
        assert_relative_eq!(pt[0], 0.7, epsilon = 1e-10);
        assert_relative_eq!(pt[1], 0.1, epsilon = 1e-10);
    }

    #[test]
    fn flip_reverses_parametrization() {
        let mut p = unit_square();
        p.flip_direction(0);
        let pt = eval2(&p, 0.2, 0.6);
        assert_relative_eq!(pt[0], 0.8, epsilon = 1e-13);
        assert_relative_eq!(pt[1], 0.6, epsilon = 1e-13);
    }

    #[test]
    fn swap_exchanges_parameters() {
        let mut p = unit_square();
        p.degree_elevate(0, 1);
        p.swap_directions(0, 1);
        assert_eq!(p.kv(1).order(), 2);
        let pt = eval2(&p, 0.3, 0.9);
        assert_relative_eq!(pt[0], 0.9, epsilon = 1e-13);
        assert_relative_eq!(pt[1], 0.3, epsilon = 1e-13);
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn swap_of_outer_directions_is_rejected() {
        let kv = || KnotVector::from_knots(1, vec![0.0, 0.0, 1.0, 1.0]);
        let mut p = Patch::new(vec![kv(), kv(), kv()], 4);
        p.swap_directions(0, 2);
    }

    #[test]
    fn rotate_2d_turns_the_grid() {
        let mut p = unit_square();
        p.rotate(std::f64::consts::FRAC_PI_2, None);
        // Corner (1, 0) maps to (0, 1)
        assert_relative_eq!(p.at2(1, 0, 0), 0.0, epsilon = 1e-15);
        assert_relative_eq!(p.at2(1, 0, 1), 1.0, epsilon = 1e-15);
    }

    #[test]
    fn interpolate_lofts_two_patches() {
        let mut bottom = unit_square();
        let mut top = unit_square();
        for j in 0..2 {
            for i in 0..2 {
                *top.at2_mut(i, j, 1) += 2.0;
            }
        }
        bottom.degree_elevate(0, 1);

        let loft = interpolate(&mut bottom, &mut top);
        assert_eq!(loft.num_dirs(), 3);
        assert_eq!(loft.kv(2).order(), 1);
        assert_eq!(loft.kv(2).ncp(), 2);
        // Orders were made compatible by mutual insertion
        assert_eq!(loft.kv(0).order(), 2);
        assert_eq!(bottom.kv(0).order(), top.kv(0).order());
    }

    #[test]
    fn revolve_3d_builds_quadratic_arc_layers() {
        // A single point in 3D, revolved a quarter turn twice
        let kv = KnotVector::from_knots(1, vec![0.0, 0.0, 1.0, 1.0]);
        let mut p = Patch::new(vec![kv], 4);
        *p.at1_mut(0, 0) = 1.0;
        *p.at1_mut(0, 3) = 1.0;
        *p.at1_mut(1, 0) = 2.0;
        *p.at1_mut(1, 3) = 1.0;

        let ang = std::f64::consts::FRAC_PI_2;
        let rev = revolve_3d(&p, [0.0, 0.0, 1.0], ang, 2);
        assert_eq!(rev.num_dirs(), 2);
        assert_eq!(rev.kv(1).order(), 2);
        assert_eq!(rev.kv(1).ncp(), 5);

        // Midpoint weights are scaled by cos(ang / 2)
        let c = (ang / 2.0).cos();
        assert_relative_eq!(rev.at2(0, 1, 3), c, epsilon = 1e-14);
        // Full-step layer is an exact quarter turn of the start
        assert_relative_eq!(rev.at2(0, 2, 0), 0.0, epsilon = 1e-14);
        assert_relative_eq!(rev.at2(0, 2, 1), 1.0, epsilon = 1e-14);
        assert_relative_eq!(rev.at2(0, 2, 3), 1.0, epsilon = 1e-14);
        // Second full step: half turn
        assert_relative_eq!(rev.at2(1, 4, 0), -2.0, epsilon = 1e-13);
    }

    #[test]
    fn text_round_trip() {
        let mut p = unit_square();
        p.degree_elevate_all(1);
        p.knot_insert(0, &[0.5]);

        let mut buf = Vec::new();
        p.write(&mut buf).unwrap();
        let mut r = TextReader::new(buf.as_slice());
        let back = Patch::from_reader(&mut r).unwrap();

        assert_eq!(back.num_dirs(), 2);
        assert_eq!(back.kv(0).ncp(), p.kv(0).ncp());
        assert_eq!(back.data(), p.data());
    }

    #[test]
    fn cartesian_control_points_are_weighted_on_load() {
        let text = "knotvectors 1\n1 2 0 0 1 1\ndimension 1\ncontrolpoints_cartesian\n3.0 2.0\n5.0 0.5\n";
        let mut r = TextReader::new(text.as_bytes());
        let p = Patch::from_reader(&mut r).unwrap();
        assert_relative_eq!(p.at1(0, 0), 6.0);
        assert_relative_eq!(p.at1(0, 1), 2.0);
        assert_relative_eq!(p.at1(1, 0), 2.5);
    }
}
