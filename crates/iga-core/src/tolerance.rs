/// Tolerance constants used across the kernel.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Tolerance {
    /// Tolerance for treating two knot values as equal (in parameter units)
    pub knot: f64,
    /// Default tolerance for the knot-removal fidelity check
    pub removal: f64,
}

impl Tolerance {
    /// Two knots closer than this are the same knot.
    pub const KNOT_EQ: f64 = 2.0 * f64::EPSILON;

    /// Half-epsilon margin used when bracketing basis-function maxima.
    pub const MAXIMA_EPS: f64 = f64::EPSILON / 2.0;

    pub const DEFAULT_REMOVAL: f64 = 1e-12;

    pub fn new(knot: f64, removal: f64) -> Self {
        Self { knot, removal }
    }

    /// Check if two knot values coincide within knot tolerance.
    pub fn knot_eq(self, a: f64, b: f64) -> bool {
        (a - b).abs() < self.knot
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            knot: Self::KNOT_EQ,
            removal: Self::DEFAULT_REMOVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knot_equality_is_tight() {
        let tol = Tolerance::default();
        assert!(tol.knot_eq(0.5, 0.5));
        assert!(tol.knot_eq(0.5, 0.5 + f64::EPSILON));
        assert!(!tol.knot_eq(0.5, 0.5 + 1e-12));
    }
}
