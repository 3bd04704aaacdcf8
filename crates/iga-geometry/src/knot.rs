use std::io::{BufRead, Write};
use std::ops::{Index, IndexMut};
use std::rc::Rc;

use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

use iga_core::{IgaError, Result, TextReader, Tolerance};

use crate::spacing::SpacingHandle;

/// Largest supported polynomial order. Evaluation scratch buffers are
/// stack-allocated at this size.
pub const MAX_ORDER: usize = 10;

/// Open knot vector of a univariate B-spline basis.
///
/// Stores `ncp + order + 1` knots. Element (knot span) counting, basis
/// evaluation, refinement, degree elevation and the collocation solve for
/// interpolation all live here. Evaluation is span-relative: shape routines
/// take an element index and a local coordinate in [0, 1].
///
/// A negative element index `i` requests evaluation on element `-1 - i`
/// with the local coordinate mirrored (`1 - xi`), which is how callers
/// handle edges traversed against the knot vector's own direction.
#[derive(Debug)]
pub struct KnotVector {
    order: usize,
    ncp: usize,
    ne: usize,
    knots: Vec<f64>,
    /// Marks a knot vector produced by coarsening, so repeated coarsening
    /// passes skip it.
    pub coarse: bool,
    pub spacing: Option<SpacingHandle>,
    coll_lu: Option<LU<f64, Dyn, Dyn>>,
}

/// Location of the maximum of each basis function, from [`KnotVector::find_maxima`].
#[derive(Debug, Clone)]
pub struct Maxima {
    /// Element index holding the maximum of basis function `j`
    pub spans: Vec<usize>,
    /// Local coordinate of the maximum within that element
    pub xi: Vec<f64>,
    /// Knot-space coordinate of the maximum
    pub u: Vec<f64>,
}

impl Clone for KnotVector {
    fn clone(&self) -> Self {
        KnotVector {
            order: self.order,
            ncp: self.ncp,
            ne: self.ne,
            knots: self.knots.clone(),
            coarse: self.coarse,
            // Deep copy: a clone gets its own rule, not the shared handle.
            spacing: self
                .spacing
                .as_ref()
                .map(|s| Rc::new(std::cell::RefCell::new(s.borrow().clone()))),
            coll_lu: None,
        }
    }
}

impl KnotVector {
    /// Allocate a knot vector with all knots set to the invalid marker -1.
    pub fn new(order: usize, ncp: usize) -> Self {
        KnotVector {
            order,
            ncp,
            ne: 0,
            knots: vec![-1.0; ncp + order + 1],
            coarse: false,
            spacing: None,
            coll_lu: None,
        }
    }

    /// Build from explicit knots. The element count is derived.
    pub fn from_knots(order: usize, knots: Vec<f64>) -> Self {
        assert!(
            knots.len() > 2 * order + 1,
            "too few knots for order {order}"
        );
        let ncp = knots.len() - order - 1;
        let mut kv = KnotVector {
            order,
            ncp,
            ne: 0,
            knots,
            coarse: false,
            spacing: None,
            coll_lu: None,
        };
        kv.count_elements();
        kv
    }

    /// Build from interval lengths and the continuity required at each break
    /// point. `continuity.len()` must be `intervals.len() + 1`; continuity
    /// `order` at an end gives an unclamped end, `-1` a repeated full
    /// multiplicity.
    pub fn from_intervals(order: usize, intervals: &[f64], continuity: &[isize]) -> Self {
        assert_eq!(
            continuity.len(),
            intervals.len() + 1,
            "incompatible sizes of continuity and intervals"
        );
        let csum: isize = continuity.iter().sum();
        let num_knots = order as isize * continuity.len() as isize - csum;
        assert!(num_knots >= 0, "invalid continuity vector for order");
        let num_knots = num_knots as usize;
        let ncp = num_knots - order - 1;

        let mut knots = Vec::with_capacity(num_knots);
        let mut accum = 0.0;
        for (i, &c) in continuity.iter().enumerate() {
            let multiplicity = order as isize - c;
            assert!(
                multiplicity >= 1 && multiplicity <= order as isize + 1,
                "invalid knot multiplicity for order"
            );
            for _ in 0..multiplicity {
                knots.push(accum);
            }
            if i < intervals.len() {
                accum += intervals[i];
            }
        }
        assert!(
            knots.len() >= 2 * (order + 1),
            "insufficient number of knots for a complete basis"
        );

        let mut kv = KnotVector {
            order,
            ncp,
            ne: 0,
            knots,
            coarse: false,
            spacing: None,
            coll_lu: None,
        };
        kv.count_elements();
        kv
    }

    /// Read `order ncp knot...` from a token stream.
    pub fn from_reader<R: BufRead>(r: &mut TextReader<R>) -> Result<Self> {
        let order = r.usize()?;
        let ncp = r.usize()?;
        let mut knots = Vec::with_capacity(ncp + order + 1);
        for _ in 0..(ncp + order + 1) {
            knots.push(r.f64()?);
        }
        let mut kv = KnotVector {
            order,
            ncp,
            ne: 0,
            knots,
            coarse: false,
            spacing: None,
            coll_lu: None,
        };
        kv.count_elements();
        Ok(kv)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of control points (basis functions).
    pub fn ncp(&self) -> usize {
        self.ncp
    }

    /// Number of elements (nonempty knot spans).
    pub fn ne(&self) -> usize {
        self.ne
    }

    /// Number of knot spans, empty ones included.
    pub fn nks(&self) -> usize {
        self.ncp - self.order
    }

    pub fn len(&self) -> usize {
        self.knots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.knots.is_empty()
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    /// Whether knot span `i` is an element (has nonzero length). Negative
    /// and out-of-element-range indices land in the clamped end regions and
    /// report false.
    pub fn is_element(&self, i: isize) -> bool {
        if i < 0 {
            return false;
        }
        let k = self.order + i as usize;
        k + 1 < self.knots.len() && self.knots[k] != self.knots[k + 1]
    }

    /// Knot-space location of local coordinate `xi` in the span starting at
    /// knot index `ni`.
    pub fn knot_location(&self, xi: f64, ni: usize) -> f64 {
        (1.0 - xi) * self.knots[ni] + xi * self.knots[ni + 1]
    }

    /// Recount elements after direct knot edits.
    pub fn count_elements(&mut self) {
        self.ne = 0;
        for i in self.order..self.ncp {
            if self.knots[i] != self.knots[i + 1] {
                self.ne += 1;
            }
        }
    }

    /// New knot vector of order `order + t` on the same break points, with
    /// every knot multiplicity raised by `t`.
    pub fn degree_elevate(&self, t: usize) -> KnotVector {
        let new_order = self.order + t;
        let mut newkv = KnotVector::new(new_order, self.ncp + t);

        for i in 0..=new_order {
            newkv.knots[i] = self.knots[0];
        }
        for i in (new_order + 1)..newkv.ncp {
            newkv.knots[i] = self.knots[i - t];
        }
        let last = *self.knots.last().unwrap();
        for i in 0..=new_order {
            newkv.knots[newkv.ncp + i] = last;
        }

        newkv.count_elements();
        newkv
    }

    /// Knots that split every element into `rf` equal pieces.
    pub fn uniform_refinement(&self, rf: usize) -> Vec<f64> {
        assert!(rf > 1, "refinement factor must be at least 2");
        let h = 1.0 / rf as f64;
        let mut newknots = Vec::with_capacity(self.ne * (rf - 1));
        for i in 0..self.knots.len() - 1 {
            if self.knots[i] != self.knots[i + 1] {
                for m in 1..rf {
                    let s = m as f64 * h;
                    newknots.push((1.0 - s) * self.knots[i] + s * self.knots[i + 1]);
                }
            }
        }
        newknots
    }

    /// Knots that split every element into `rf` pieces, following the
    /// attached spacing rule when present (the rule is rescaled in place).
    /// Existing knots are kept; with a non-nested rule the desired mesh is
    /// only reached when refining a single-element knot vector.
    pub fn refinement(&self, rf: usize) -> Vec<f64> {
        assert!(rf > 1, "refinement factor must be at least 2");

        let Some(spacing) = &self.spacing else {
            return self.uniform_refinement(rf);
        };

        let s = {
            let mut rule = spacing.borrow_mut();
            rule.scale_parameters(1.0 / rf as f64);
            rule.set_size(rf * self.ne);
            rule.eval_all()
        };

        let mut newknots = vec![0.0; (rf - 1) * self.ne];

        let k0 = self.knots[0];
        let k1 = *self.knots.last().unwrap();

        let mut s0 = 0.0;
        for i in 0..self.ne {
            s0 += s[rf * i];
            for j in 0..rf - 1 {
                newknots[(rf - 1) * i + j] = (1.0 - s0) * k0 + s0 * k1;
                s0 += s[rf * i + j + 1];
            }
        }
        newknots
    }

    /// Factor by which this knot vector may be coarsened. Only meaningful
    /// for non-nested spacing rules; otherwise 1.
    pub fn coarsening_factor(&self) -> usize {
        match &self.spacing {
            Some(s) => {
                let s = s.borrow();
                if s.nested() {
                    1
                } else {
                    s.size()
                }
            }
            None => 1,
        }
    }

    /// The knots to remove when coarsening by `cf`: all interior break
    /// points except every `cf`-th one. The element count must be an exact
    /// multiple of `cf`.
    pub fn fine_knots(&self, cf: usize) -> Vec<f64> {
        if cf < 2 {
            return vec![];
        }
        let cne = self.ne / cf;
        assert!(
            cne > 0 && cne * cf == self.ne,
            "invalid coarsening factor {cf} for {} elements",
            self.ne
        );

        let mut fine = Vec::with_capacity(cne * (cf - 1));
        let mut i = self.order;
        let mut kprev = self.knots[self.order];
        for _ in 0..cne {
            let mut cnt = 0;
            while cnt < cf {
                i += 1;
                if self.knots[i] != kprev {
                    kprev = self.knots[i];
                    cnt += 1;
                    if cnt < cf {
                        fine.push(self.knots[i]);
                    }
                }
            }
        }
        fine
    }

    /// Reverse the parameter direction in place.
    pub fn flip(&mut self) {
        let apb = self.knots[0] + self.knots[self.knots.len() - 1];
        let ns = (self.ncp - self.order) / 2;
        for i in 1..=ns {
            let tmp = apb - self.knots[self.order + i];
            self.knots[self.order + i] = apb - self.knots[self.ncp - i];
            self.knots[self.ncp - i] = tmp;
        }
    }

    /// Write as `order ncp knot...` on one line.
    pub fn write(&self, w: &mut dyn Write) -> Result<()> {
        write!(w, "{} {}", self.order, self.ncp)?;
        for k in &self.knots {
            write!(w, " {k}")?;
        }
        writeln!(w)?;
        Ok(())
    }

    /// Tabulate all basis functions with first and second derivatives at
    /// `samples` points per element, one row per sample point.
    pub fn print_functions(&self, w: &mut dyn Write, samples: usize) -> Result<()> {
        if self.ne == 0 {
            return Err(IgaError::InvalidOperation(
                "elements not counted; call count_elements first".into(),
            ));
        }
        let mut shape = vec![0.0; self.order + 1];
        let dx = 1.0 / (samples - 1) as f64;

        let mut e = 0;
        for cnt in 0..self.nks() {
            if !self.is_element(cnt as isize) {
                continue;
            }
            for j in 0..samples {
                let x = j as f64 * dx;
                write!(w, "{}", x + e as f64)?;

                self.calc_shape(&mut shape, cnt as isize, x);
                for d in 0..=self.order {
                    write!(w, "\t{}", shape[d])?;
                }
                self.calc_dshape(&mut shape, cnt as isize, x);
                for d in 0..=self.order {
                    write!(w, "\t{}", shape[d])?;
                }
                self.calc_d2_shape(&mut shape, cnt as isize, x);
                for d in 0..=self.order {
                    write!(w, "\t{}", shape[d])?;
                }
                writeln!(w)?;
            }
            e += 1;
        }
        Ok(())
    }

    fn span_start(&self, i: isize) -> usize {
        let p = self.order as isize;
        let ip = if i >= 0 { i + p } else { -1 - i + p };
        ip as usize
    }

    /// Values of the `order + 1` basis functions supported on element `i`,
    /// at local coordinate `xi` in [0, 1].
    ///
    /// The NURBS Book, 2nd ed, algorithm A2.2.
    pub fn calc_shape(&self, shape: &mut [f64], i: isize, xi: f64) {
        assert!(self.order <= MAX_ORDER, "order exceeds MAX_ORDER");

        let p = self.order;
        let ip = self.span_start(i);
        let u = self.knot_location(if i >= 0 { xi } else { 1.0 - xi }, ip);
        let mut left = [0.0; MAX_ORDER + 1];
        let mut right = [0.0; MAX_ORDER + 1];

        shape[0] = 1.0;
        for j in 1..=p {
            left[j] = u - self.knots[ip + 1 - j];
            right[j] = self.knots[ip + j] - u;
            let mut saved = 0.0;
            for r in 0..j {
                let tmp = shape[r] / (right[r + 1] + left[j - r]);
                shape[r] = saved + right[r + 1] * tmp;
                saved = left[j - r] * tmp;
            }
            shape[j] = saved;
        }
    }

    /// First derivatives of the basis functions on element `i`, with respect
    /// to the local coordinate.
    ///
    /// The NURBS Book, 2nd ed, algorithm A2.3.
    pub fn calc_dshape(&self, grad: &mut [f64], i: isize, xi: f64) {
        assert!(self.order <= MAX_ORDER, "order exceeds MAX_ORDER");

        let p = self.order;
        let ip = self.span_start(i);
        let u = self.knot_location(if i >= 0 { xi } else { 1.0 - xi }, ip);
        let mut ndu = [[0.0; MAX_ORDER + 1]; MAX_ORDER + 1];
        let mut left = [0.0; MAX_ORDER + 1];
        let mut right = [0.0; MAX_ORDER + 1];

        ndu[0][0] = 1.0;
        for j in 1..=p {
            left[j] = u - self.knots[ip + 1 - j];
            right[j] = self.knots[ip + j] - u;
            let mut saved = 0.0;
            for r in 0..j {
                ndu[j][r] = right[r + 1] + left[j - r];
                let temp = ndu[r][j - 1] / ndu[j][r];
                ndu[r][j] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            ndu[j][j] = saved;
        }

        for r in 0..=p {
            let mut d = 0.0;
            if r >= 1 {
                d = ndu[r - 1][p - 1] / ndu[p][r - 1];
            }
            if r + 1 <= p {
                d -= ndu[r][p - 1] / ndu[p][r];
            }
            grad[r] = d;
        }

        let scale = if i >= 0 {
            p as f64 * (self.knots[ip + 1] - self.knots[ip])
        } else {
            p as f64 * (self.knots[ip] - self.knots[ip + 1])
        };
        for g in grad.iter_mut().take(p + 1) {
            *g *= scale;
        }
    }

    /// `n`-th derivatives of the basis functions on element `i`, with
    /// respect to the local coordinate.
    pub fn calc_dn_shape(&self, gradn: &mut [f64], n: usize, i: isize, xi: f64) {
        assert!(self.order <= MAX_ORDER, "order exceeds MAX_ORDER");
        assert!(n >= 1);

        let p = self.order;
        let ip = self.span_start(i);
        let u = self.knot_location(if i >= 0 { xi } else { 1.0 - xi }, ip);
        let mut a = [[0.0; MAX_ORDER + 1]; 2];
        let mut ndu = [[0.0; MAX_ORDER + 1]; MAX_ORDER + 1];
        let mut left = [0.0; MAX_ORDER + 1];
        let mut right = [0.0; MAX_ORDER + 1];

        ndu[0][0] = 1.0;
        for j in 1..=p {
            left[j] = u - self.knots[ip + 1 - j];
            right[j] = self.knots[ip + j] - u;
            let mut saved = 0.0;
            for r in 0..j {
                ndu[j][r] = right[r + 1] + left[j - r];
                let temp = ndu[r][j - 1] / ndu[j][r];
                ndu[r][j] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            ndu[j][j] = saved;
        }

        for r in 0..=p {
            let ri = r as isize;
            let mut s1 = 0;
            let mut s2 = 1;
            a[0][0] = 1.0;
            for k in 1..=n {
                let mut d = 0.0;
                let rk = ri - k as isize;
                let pk = p as isize - k as isize;
                if ri >= k as isize {
                    a[s2][0] = a[s1][0] / ndu[(pk + 1) as usize][rk as usize];
                    d = a[s2][0] * ndu[rk as usize][pk as usize];
                }
                let j1 = if rk >= -1 { 1 } else { (-rk) as usize };
                let j2 = if ri - 1 <= pk {
                    k - 1
                } else {
                    p - r
                };
                for j in j1..=j2 {
                    a[s2][j] = (a[s1][j] - a[s1][j - 1])
                        / ndu[(pk + 1) as usize][(rk + j as isize) as usize];
                    d += a[s2][j] * ndu[(rk + j as isize) as usize][pk as usize];
                }
                if ri <= pk {
                    a[s2][k] = -a[s1][k - 1] / ndu[(pk + 1) as usize][r];
                    d += a[s2][k] * ndu[r][pk as usize];
                }
                gradn[r] = d;
                std::mem::swap(&mut s1, &mut s2);
            }
        }

        let du = if i >= 0 {
            self.knots[ip + 1] - self.knots[ip]
        } else {
            self.knots[ip] - self.knots[ip + 1]
        };
        let mut temp = p as f64 * du;
        for k in 1..n {
            temp *= (p - k) as f64 * du;
        }
        for g in gradn.iter_mut().take(p + 1) {
            *g *= temp;
        }
    }

    /// Second derivatives of the basis functions on element `i`.
    pub fn calc_d2_shape(&self, grad2: &mut [f64], i: isize, xi: f64) {
        self.calc_dn_shape(grad2, 2, i, xi)
    }

    /// Locate the maximum of every basis function by bisection, for use as
    /// interpolation (collocation) points.
    pub fn find_maxima(&self) -> Maxima {
        let p = self.order;
        let mut shape = vec![0.0; p + 1];
        let mut out = Maxima {
            spans: vec![0; self.ncp],
            xi: vec![0.0; self.ncp],
            u: vec![0.0; self.ncp],
        };

        for j in 0..self.ncp {
            let mut best = 0.0;
            for d in 0..=p {
                let i = j as isize - d as isize;
                if !self.is_element(i) {
                    continue;
                }
                let i = i as usize;

                let mut arg1 = Tolerance::MAXIMA_EPS;
                self.calc_shape(&mut shape, i as isize, arg1);
                let mut max1 = shape[d];

                let mut arg2 = 1.0 - arg1;
                self.calc_shape(&mut shape, i as isize, arg2);
                let mut max2 = shape[d];

                let mut arg = 0.5 * (arg1 + arg2);
                self.calc_shape(&mut shape, i as isize, arg);
                let mut max = shape[d];

                while max > max1 || max > max2 {
                    if max1 < max2 {
                        max1 = max;
                        arg1 = arg;
                    } else {
                        max2 = max;
                        arg2 = arg;
                    }
                    arg = 0.5 * (arg1 + arg2);
                    self.calc_shape(&mut shape, i as isize, arg);
                    max = shape[d];
                }

                if max > best {
                    best = max;
                    out.spans[j] = i;
                    out.xi[j] = arg;
                    out.u[j] = self.knot_location(arg, i + p);
                }
            }
        }
        out
    }

    /// Replace each right-hand side in `x` (values at the basis maxima) by
    /// the control values whose spline interpolates them.
    ///
    /// The collocation matrix factorization is cached; pass
    /// `reuse_factorization` when the knot vector has not changed since the
    /// previous call.
    ///
    /// The NURBS Book, 2nd ed, algorithm A9.1, with collocation at basis
    /// maxima instead of Greville abscissae.
    pub fn find_interpolant(&mut self, x: &mut [Vec<f64>], reuse_factorization: bool) -> Result<()> {
        let ncp = self.ncp;
        if !reuse_factorization || self.coll_lu.is_none() {
            let maxima = self.find_maxima();
            let mut coll = DMatrix::zeros(ncp, ncp);
            let mut shape = vec![0.0; self.order + 1];
            for i in 0..ncp {
                self.calc_shape(&mut shape, maxima.spans[i] as isize, maxima.xi[i]);
                for (p, &s) in shape.iter().enumerate() {
                    coll[(i, maxima.spans[i] + p)] = s;
                }
            }
            self.coll_lu = Some(coll.lu());
        }

        let lu = self.coll_lu.as_ref().unwrap();
        for rhs in x.iter_mut() {
            assert_eq!(rhs.len(), ncp, "right-hand side size mismatch");
            let b = DVector::from_column_slice(rhs);
            let sol = lu
                .solve(&b)
                .ok_or_else(|| IgaError::Geometry("singular collocation matrix".into()))?;
            rhs.copy_from_slice(sol.as_slice());
        }
        Ok(())
    }

    /// Index of the knot span containing `u`, by binary search over the
    /// element range. At the right end of the parameter interval the last
    /// span is returned.
    pub fn find_knot_span(&self, u: f64) -> usize {
        if u == self.knots[self.ncp + self.order] {
            return self.ncp;
        }
        let mut low = self.order;
        let mut high = self.ncp + 1;
        let mut mid = (low + high) / 2;
        while u < self.knots[mid - 1] || u > self.knots[mid] {
            if u < self.knots[mid - 1] {
                high = mid;
            } else {
                low = mid;
            }
            mid = (low + high) / 2;
        }
        mid
    }

    /// Knots present in `other` but not in `self`, within knot tolerance.
    /// Arguments may be given in either order; the finer one is scanned.
    /// Both knot vectors must have the same order.
    pub fn difference(&self, other: &KnotVector) -> Vec<f64> {
        assert_eq!(
            self.order, other.order,
            "cannot compare knot vectors with different orders"
        );

        if other.len() < self.len() {
            return other.difference(self);
        }

        let count = other.len() - self.len();
        let mut diff = Vec::with_capacity(count);
        if count == 0 {
            return diff;
        }

        let mut i = 0;
        for j in 0..other.len() {
            if i < self.len() && (self.knots[i] - other.knots[j]).abs() < Tolerance::KNOT_EQ {
                i += 1;
            } else {
                diff.push(other.knots[j]);
            }
        }
        diff
    }
}

impl Index<usize> for KnotVector {
    type Output = f64;

    fn index(&self, i: usize) -> &f64 {
        &self.knots[i]
    }
}

impl IndexMut<usize> for KnotVector {
    fn index_mut(&mut self, i: usize) -> &mut f64 {
        // Direct knot edits invalidate the cached factorization.
        self.coll_lu = None;
        &mut self.knots[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cubic() -> KnotVector {
        // Order 3, 7 control points, 4 elements on [0, 1]
        KnotVector::from_knots(
            3,
            vec![0.0, 0.0, 0.0, 0.0, 0.25, 0.5, 0.75, 1.0, 1.0, 1.0, 1.0],
        )
    }

    #[test]
    fn element_counting() {
        let kv = cubic();
        assert_eq!(kv.ncp(), 7);
        assert_eq!(kv.ne(), 4);
        assert_eq!(kv.nks(), 4);
        assert!(kv.is_element(0));
        assert!(!kv.is_element(-1));
    }

    #[test]
    fn from_intervals_builds_open_vector() {
        // Quadratic, two unit intervals, C1 interior, clamped ends
        let kv = KnotVector::from_intervals(2, &[1.0, 1.0], &[-1, 1, -1]);
        assert_eq!(kv.order(), 2);
        assert_eq!(kv.ne(), 2);
        assert_eq!(kv.knots(), &[0.0, 0.0, 0.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn shape_is_partition_of_unity() {
        let kv = cubic();
        let mut shape = vec![0.0; 4];
        for e in 0..4 {
            for &xi in &[0.0, 0.3, 0.5, 0.99] {
                kv.calc_shape(&mut shape, e, xi);
                let sum: f64 = shape.iter().sum();
                assert_relative_eq!(sum, 1.0, epsilon = 1e-13);
                assert!(shape.iter().all(|&s| s >= -1e-14));
            }
        }
    }

    #[test]
    fn dshape_sums_to_zero() {
        let kv = cubic();
        let mut grad = vec![0.0; 4];
        for e in 0..4 {
            kv.calc_dshape(&mut grad, e, 0.4);
            let sum: f64 = grad.iter().sum();
            assert_relative_eq!(sum, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn dshape_matches_finite_difference() {
        let kv = cubic();
        let mut grad = vec![0.0; 4];
        let mut sp = vec![0.0; 4];
        let mut sm = vec![0.0; 4];
        let h = 1e-6;
        kv.calc_dshape(&mut grad, 1, 0.5);
        kv.calc_shape(&mut sp, 1, 0.5 + h);
        kv.calc_shape(&mut sm, 1, 0.5 - h);
        for d in 0..4 {
            let fd = (sp[d] - sm[d]) / (2.0 * h);
            assert_relative_eq!(grad[d], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn d2_shape_matches_finite_difference() {
        let kv = cubic();
        let mut g2 = vec![0.0; 4];
        let mut s0 = vec![0.0; 4];
        let mut sp = vec![0.0; 4];
        let mut sm = vec![0.0; 4];
        let h = 1e-5;
        kv.calc_d2_shape(&mut g2, 2, 0.37);
        kv.calc_shape(&mut s0, 2, 0.37);
        kv.calc_shape(&mut sp, 2, 0.37 + h);
        kv.calc_shape(&mut sm, 2, 0.37 - h);
        for d in 0..4 {
            let fd = (sp[d] - 2.0 * s0[d] + sm[d]) / (h * h);
            assert_relative_eq!(g2[d], fd, epsilon = 1e-3);
        }
    }

    #[test]
    fn mirrored_evaluation_flips_coordinate() {
        let kv = cubic();
        let mut fwd = vec![0.0; 4];
        let mut rev = vec![0.0; 4];
        kv.calc_shape(&mut fwd, 1, 0.3);
        // Element index -2 addresses element 1 with xi mirrored.
        kv.calc_shape(&mut rev, -2, 0.7);
        for d in 0..4 {
            assert_relative_eq!(fwd[d], rev[d], epsilon = 1e-14);
        }
    }

    #[test]
    fn knot_span_search() {
        let kv = cubic();
        assert_eq!(kv.find_knot_span(0.1), 4);
        assert_eq!(kv.find_knot_span(0.3), 5);
        assert_eq!(kv.find_knot_span(0.6), 6);
        assert_eq!(kv.find_knot_span(0.9), 7);
        // Right end maps to the last span
        assert_eq!(kv.find_knot_span(1.0), 7);
    }

    #[test]
    fn difference_is_symmetric() {
        let coarse = KnotVector::from_knots(2, vec![0.0, 0.0, 0.0, 0.5, 1.0, 1.0, 1.0]);
        let fine = KnotVector::from_knots(
            2,
            vec![0.0, 0.0, 0.0, 0.25, 0.5, 0.75, 1.0, 1.0, 1.0],
        );
        let d1 = coarse.difference(&fine);
        let d2 = fine.difference(&coarse);
        assert_eq!(d1, vec![0.25, 0.75]);
        assert_eq!(d1, d2);
    }

    #[test]
    fn uniform_refinement_splits_elements() {
        let kv = KnotVector::from_knots(2, vec![0.0, 0.0, 0.0, 0.5, 1.0, 1.0, 1.0]);
        let new = kv.uniform_refinement(2);
        assert_eq!(new, vec![0.25, 0.75]);
    }

    #[test]
    fn refinement_follows_spacing_rule() {
        use crate::spacing::SpacingRule;
        let mut kv = KnotVector::from_knots(1, vec![0.0, 0.0, 1.0, 1.0]);
        kv.spacing = Some(SpacingRule::geometric(1, false, 0.8));
        let new = kv.refinement(4);
        assert_eq!(new.len(), 3);
        assert!(new.windows(2).all(|w| w[0] < w[1]));
        assert!(new.iter().all(|&k| k > 0.0 && k < 1.0));
        // First interval narrower than uniform, widths growing
        assert!(new[0] < 0.25);
        assert!(new[2] - new[1] > new[1] - new[0]);
    }

    #[test]
    fn degree_elevated_vector_has_raised_multiplicity() {
        let kv = KnotVector::from_knots(2, vec![0.0, 0.0, 0.0, 0.5, 1.0, 1.0, 1.0]);
        let up = kv.degree_elevate(1);
        assert_eq!(up.order(), 3);
        assert_eq!(up.ncp(), kv.ncp() + 1);
        assert_eq!(up.ne(), 2);
    }

    #[test]
    fn flip_is_involutive() {
        let mut kv = KnotVector::from_knots(
            2,
            vec![0.0, 0.0, 0.0, 0.2, 0.7, 1.0, 1.0, 1.0],
        );
        let orig = kv.knots().to_vec();
        kv.flip();
        assert_relative_eq!(kv[3], 0.3);
        assert_relative_eq!(kv[4], 0.8);
        kv.flip();
        for (a, b) in kv.knots().iter().zip(&orig) {
            assert_relative_eq!(*a, *b, epsilon = 1e-15);
        }
    }

    #[test]
    fn fine_knots_extracts_interior_break_points() {
        let kv = KnotVector::from_knots(
            1,
            vec![0.0, 0.0, 0.25, 0.5, 0.75, 1.0, 1.0],
        );
        let fine = kv.fine_knots(2);
        assert_eq!(fine, vec![0.25, 0.75]);
    }

    #[test]
    fn maxima_cover_all_basis_functions() {
        let kv = cubic();
        let m = kv.find_maxima();
        assert_eq!(m.u.len(), 7);
        // End functions peak at the interval ends
        assert_relative_eq!(m.u[0], 0.0, epsilon = 1e-10);
        assert_relative_eq!(m.u[6], 1.0, epsilon = 1e-10);
        for j in 1..7 {
            assert!(m.u[j] > m.u[j - 1] - 1e-12);
        }
    }

    #[test]
    fn interpolant_reproduces_linear_function() {
        let mut kv = cubic();
        let m = kv.find_maxima();
        // Sample a linear function at the collocation points
        let mut x = vec![m.u.clone()];
        kv.find_interpolant(&mut x, false).unwrap();

        // A B-spline with these control values must reproduce u exactly.
        let mut shape = vec![0.0; 4];
        for e in 0..4 {
            for &xi in &[0.0, 0.5, 1.0] {
                kv.calc_shape(&mut shape, e, xi);
                let mut val = 0.0;
                for d in 0..4 {
                    val += shape[d] * x[0][e as usize + d];
                }
                let u = kv.knot_location(xi, e as usize + 3);
                assert_relative_eq!(val, u, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn text_round_trip() {
        let kv = cubic();
        let mut buf = Vec::new();
        kv.write(&mut buf).unwrap();
        let mut r = TextReader::new(buf.as_slice());
        let back = KnotVector::from_reader(&mut r).unwrap();
        assert_eq!(back.order(), kv.order());
        assert_eq!(back.ncp(), kv.ncp());
        assert_eq!(back.knots(), kv.knots());
        assert_eq!(back.ne(), kv.ne());
    }
}
