use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use iga_core::{IgaError, Result};

/// Shared handle to a spacing rule.
///
/// A rule is shared between a knot vector and the refined or elevated knot
/// vectors derived from it, so parameter rescaling during refinement is seen
/// by every holder.
pub type SpacingHandle = Rc<RefCell<SpacingRule>>;

/// Prescribed distribution of element interval lengths on [0, 1].
///
/// `eval_all` returns `n` relative interval widths summing to one. Rules
/// other than `Uniform` are non-nested: refining by a factor does not keep
/// the coarse break points, so coarsening back is only valid by the full
/// rule size.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SpacingRule {
    Uniform {
        n: usize,
    },
    /// First interval `s`, remaining widths in arithmetic progression.
    Linear {
        n: usize,
        reversed: bool,
        s: f64,
    },
    /// First interval `s`, widths in geometric progression.
    Geometric {
        n: usize,
        reversed: bool,
        s: f64,
    },
}

impl SpacingRule {
    pub fn uniform(n: usize) -> SpacingHandle {
        Rc::new(RefCell::new(SpacingRule::Uniform { n }))
    }

    pub fn linear(n: usize, reversed: bool, s: f64) -> SpacingHandle {
        Rc::new(RefCell::new(SpacingRule::Linear { n, reversed, s }))
    }

    pub fn geometric(n: usize, reversed: bool, s: f64) -> SpacingHandle {
        Rc::new(RefCell::new(SpacingRule::Geometric { n, reversed, s }))
    }

    pub fn size(&self) -> usize {
        match self {
            SpacingRule::Uniform { n }
            | SpacingRule::Linear { n, .. }
            | SpacingRule::Geometric { n, .. } => *n,
        }
    }

    pub fn set_size(&mut self, size: usize) {
        match self {
            SpacingRule::Uniform { n }
            | SpacingRule::Linear { n, .. }
            | SpacingRule::Geometric { n, .. } => *n = size,
        }
    }

    /// Whether break points of a coarse rule survive refinement by any
    /// integer factor. Only uniform spacing is nested.
    pub fn nested(&self) -> bool {
        matches!(self, SpacingRule::Uniform { .. })
    }

    /// Scale the free parameters by `a`. Used when the rule is reused on a
    /// mesh refined (a < 1) or coarsened (a > 1) by an integer factor.
    pub fn scale_parameters(&mut self, a: f64) {
        match self {
            SpacingRule::Uniform { .. } => {}
            SpacingRule::Linear { s, .. } | SpacingRule::Geometric { s, .. } => *s *= a,
        }
    }

    /// All `n` interval widths, summing to one.
    pub fn eval_all(&self) -> Vec<f64> {
        match *self {
            SpacingRule::Uniform { n } => {
                assert!(n > 0, "spacing rule of size zero");
                vec![1.0 / n as f64; n]
            }
            SpacingRule::Linear { n, reversed, s } => {
                assert!(n > 0, "spacing rule of size zero");
                let mut w: Vec<f64> = if n == 1 {
                    vec![1.0]
                } else {
                    let d = 2.0 * (1.0 - n as f64 * s) / (n as f64 * (n as f64 - 1.0));
                    (0..n).map(|i| s + i as f64 * d).collect()
                };
                if reversed {
                    w.reverse();
                }
                w
            }
            SpacingRule::Geometric { n, reversed, s } => {
                assert!(n > 0, "spacing rule of size zero");
                let mut w: Vec<f64> = if n == 1 {
                    vec![1.0]
                } else if (s - 1.0 / n as f64).abs() < 1e-14 {
                    vec![1.0 / n as f64; n]
                } else {
                    let r = geometric_ratio(n, s);
                    let mut w = Vec::with_capacity(n);
                    let mut wi = s;
                    for _ in 0..n {
                        w.push(wi);
                        wi *= r;
                    }
                    w
                };
                if reversed {
                    w.reverse();
                }
                w
            }
        }
    }

    pub fn type_id(&self) -> usize {
        match self {
            SpacingRule::Uniform { .. } => 0,
            SpacingRule::Linear { .. } => 1,
            SpacingRule::Geometric { .. } => 2,
        }
    }

    pub fn int_params(&self) -> Vec<isize> {
        match *self {
            SpacingRule::Uniform { n } => vec![n as isize],
            SpacingRule::Linear { n, reversed, .. }
            | SpacingRule::Geometric { n, reversed, .. } => {
                vec![n as isize, reversed as isize]
            }
        }
    }

    pub fn real_params(&self) -> Vec<f64> {
        match *self {
            SpacingRule::Uniform { .. } => vec![],
            SpacingRule::Linear { s, .. } | SpacingRule::Geometric { s, .. } => vec![s],
        }
    }

    /// Rebuild a rule from its tagged parameter lists, as read from the
    /// `spacing` file section.
    pub fn from_params(type_id: usize, ipar: &[isize], dpar: &[f64]) -> Result<SpacingRule> {
        let n = |i: usize| -> Result<usize> {
            ipar.get(i)
                .copied()
                .filter(|&v| if i == 0 { v > 0 } else { v >= 0 })
                .map(|v| v as usize)
                .ok_or_else(|| IgaError::Parse("bad spacing rule integer parameters".into()))
        };
        match type_id {
            0 => Ok(SpacingRule::Uniform { n: n(0)? }),
            1 | 2 => {
                let size = n(0)?;
                let reversed = n(1)? != 0;
                let s = *dpar
                    .first()
                    .ok_or_else(|| IgaError::Parse("bad spacing rule real parameters".into()))?;
                if type_id == 1 {
                    Ok(SpacingRule::Linear {
                        n: size,
                        reversed,
                        s,
                    })
                } else {
                    Ok(SpacingRule::Geometric {
                        n: size,
                        reversed,
                        s,
                    })
                }
            }
            _ => Err(IgaError::Parse(format!(
                "unknown spacing rule type {type_id}"
            ))),
        }
    }

    /// Write as `type n_int n_real <ints> <reals>` on one line.
    pub fn write(&self, w: &mut dyn Write) -> Result<()> {
        let ip = self.int_params();
        let dp = self.real_params();
        write!(w, "{} {} {}", self.type_id(), ip.len(), dp.len())?;
        for v in &ip {
            write!(w, " {v}")?;
        }
        for v in &dp {
            write!(w, " {v}")?;
        }
        writeln!(w)?;
        Ok(())
    }
}

/// Ratio of the geometric progression with first width `s` and `n` widths
/// summing to one. Newton iteration on s(r^n - 1) - (r - 1).
fn geometric_ratio(n: usize, s: f64) -> f64 {
    assert!(s > 0.0 && s < 1.0, "invalid first interval");
    let nf = n as f64;
    let mut r: f64 = if s < 1.0 / nf { 1.5 } else { 0.5 };
    for _ in 0..100 {
        let f = s * (r.powi(n as i32) - 1.0) - (r - 1.0);
        let df = s * nf * r.powi(n as i32 - 1) - 1.0;
        let step = f / df;
        r -= step;
        if step.abs() < 1e-15 {
            break;
        }
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn uniform_widths_sum_to_one() {
        let w = SpacingRule::Uniform { n: 4 }.eval_all();
        assert_eq!(w, vec![0.25; 4]);
    }

    #[test]
    fn linear_widths_sum_to_one() {
        let rule = SpacingRule::Linear {
            n: 5,
            reversed: false,
            s: 0.1,
        };
        let w = rule.eval_all();
        assert_eq!(w.len(), 5);
        assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-14);
        assert_relative_eq!(w[0], 0.1);
        assert_relative_eq!(w[2] - w[1], w[1] - w[0], epsilon = 1e-14);
    }

    #[test]
    fn geometric_widths_sum_to_one() {
        let rule = SpacingRule::Geometric {
            n: 6,
            reversed: false,
            s: 0.05,
        };
        let w = rule.eval_all();
        assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        let r = w[1] / w[0];
        for i in 1..5 {
            assert_relative_eq!(w[i + 1] / w[i], r, epsilon = 1e-10);
        }
    }

    #[test]
    fn reversed_flips_widths() {
        let fwd = SpacingRule::Linear {
            n: 3,
            reversed: false,
            s: 0.2,
        }
        .eval_all();
        let mut rev = SpacingRule::Linear {
            n: 3,
            reversed: true,
            s: 0.2,
        }
        .eval_all();
        rev.reverse();
        assert_eq!(fwd, rev);
    }

    #[test]
    fn params_round_trip() {
        let rule = SpacingRule::Geometric {
            n: 8,
            reversed: true,
            s: 0.02,
        };
        let back =
            SpacingRule::from_params(rule.type_id(), &rule.int_params(), &rule.real_params())
                .unwrap();
        assert_eq!(rule, back);
    }

    #[test]
    fn only_uniform_is_nested() {
        assert!(SpacingRule::Uniform { n: 2 }.nested());
        assert!(!SpacingRule::Linear {
            n: 2,
            reversed: false,
            s: 0.3
        }
        .nested());
    }
}
